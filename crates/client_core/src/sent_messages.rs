//! Per-send transaction tracking and send-time reporting.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::{error, info};

use crate::local_id::LocalId;

#[derive(Debug, Clone)]
pub struct SendTransaction {
    pub local_id: LocalId,
    pub locally_echoed: bool,
    pub resend: bool,
    pub rendered_content_disparity: bool,
    started_at: Instant,
    server_acked_at: Option<Instant>,
    event_received_at: Option<Instant>,
}

impl SendTransaction {
    fn new(local_id: LocalId, locally_echoed: bool) -> Self {
        Self {
            local_id,
            locally_echoed,
            resend: false,
            rendered_content_disparity: false,
            started_at: Instant::now(),
            server_acked_at: None,
            event_received_at: None,
        }
    }

    pub fn server_acked(&self) -> bool {
        self.server_acked_at.is_some()
    }

    pub fn event_received(&self) -> bool {
        self.event_received_at.is_some()
    }

    /// Complete only once both the HTTP ack and the event have been seen.
    pub fn is_complete(&self) -> bool {
        self.server_acked() && self.event_received()
    }

    fn send_times(&self) -> Option<SendTimes> {
        let acked = self.server_acked_at?;
        let received = self.event_received_at?;
        Some(SendTimes {
            local_id: self.local_id.clone(),
            total: acked.max(received).duration_since(self.started_at),
            until_server_ack: acked.duration_since(self.started_at),
            until_event: received.duration_since(self.started_at),
            locally_echoed: self.locally_echoed,
            rendered_content_disparity: self.rendered_content_disparity,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTimes {
    pub local_id: LocalId,
    pub total: Duration,
    pub until_server_ack: Duration,
    pub until_event: Duration,
    pub locally_echoed: bool,
    pub rendered_content_disparity: bool,
}

/// Open send transactions keyed by local id, plus the counter behind
/// fallback `loc-N` ids.
#[derive(Debug, Default)]
pub struct SentMessages {
    transactions: HashMap<LocalId, SendTransaction>,
    next_fallback_id: u64,
}

impl SentMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_fallback_local_id(&mut self) -> LocalId {
        self.next_fallback_id += 1;
        LocalId::fallback(self.next_fallback_id)
    }

    /// Returns false when a transaction for the id is already open; the
    /// existing transaction is kept.
    pub fn start_tracking(&mut self, local_id: LocalId, locally_echoed: bool) -> bool {
        if self.transactions.contains_key(&local_id) {
            error!(local_id = %local_id, "send transaction started twice for the same local id");
            return false;
        }
        self.transactions
            .insert(local_id.clone(), SendTransaction::new(local_id, locally_echoed));
        true
    }

    /// Resends reuse the open transaction; a fresh one is started if the
    /// previous attempt was already discarded.
    pub fn start_resend(&mut self, local_id: LocalId, locally_echoed: bool) {
        self.transactions
            .entry(local_id.clone())
            .or_insert_with(|| SendTransaction::new(local_id, locally_echoed))
            .resend = true;
    }

    pub fn get(&self, local_id: &LocalId) -> Option<&SendTransaction> {
        self.transactions.get(local_id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn mark_disparity(&mut self, local_id: &LocalId) {
        if let Some(transaction) = self.transactions.get_mut(local_id) {
            transaction.rendered_content_disparity = true;
        }
    }

    pub fn report_server_ack(&mut self, local_id: &LocalId) -> Option<SendTimes> {
        let transaction = self.transactions.get_mut(local_id)?;
        transaction.server_acked_at.get_or_insert_with(Instant::now);
        self.maybe_complete(local_id)
    }

    pub fn report_event_received(&mut self, local_id: &LocalId) -> Option<SendTimes> {
        let transaction = self.transactions.get_mut(local_id)?;
        transaction.event_received_at.get_or_insert_with(Instant::now);
        self.maybe_complete(local_id)
    }

    pub fn forget(&mut self, local_id: &LocalId) -> Option<SendTransaction> {
        self.transactions.remove(local_id)
    }

    /// Drops every open transaction but keeps the fallback counter, so
    /// `loc-N` keys stay unique across session resets.
    pub fn clear(&mut self) {
        self.transactions.clear();
    }

    fn maybe_complete(&mut self, local_id: &LocalId) -> Option<SendTimes> {
        let times = self.transactions.get(local_id)?.send_times()?;
        self.transactions.remove(local_id);
        info!(
            local_id = %times.local_id,
            total_ms = times.total.as_millis() as u64,
            ack_ms = times.until_server_ack.as_millis() as u64,
            event_ms = times.until_event.as_millis() as u64,
            locally_echoed = times.locally_echoed,
            rendered_content_disparity = times.rendered_content_disparity,
            "send: message delivery confirmed"
        );
        Some(times)
    }
}
