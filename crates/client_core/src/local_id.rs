//! Provisional message ids for locally echoed messages.
//!
//! Provisional ids are kept in fixed-point thousandths so the three-digit
//! truncation is exact and no float drift can push an id onto an integer.

use std::{
    cmp::Ordering,
    collections::HashSet,
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use shared::domain::MessageId;
use thiserror::Error;
use tracing::{error, warn};

const SCALE: i64 = 1000;

/// Default spacing between consecutive provisional ids (0.01).
pub const DEFAULT_INCREMENT_THOUSANDTHS: i64 = 10;
/// Default number of provisional ids allowed past the last confirmed id.
pub const DEFAULT_MAX_STEPS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProvisionalId(i64);

impl ProvisionalId {
    pub fn from_thousandths(thousandths: i64) -> Self {
        Self(thousandths)
    }

    pub fn thousandths(self) -> i64 {
        self.0
    }

    pub fn fraction_thousandths(self) -> i64 {
        self.0.rem_euclid(SCALE)
    }
}

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0.div_euclid(SCALE);
        let fraction = self.fraction_thousandths();
        if fraction == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{fraction:03}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid provisional id '{0}'")]
pub struct ParseProvisionalIdError(String);

impl FromStr for ProvisionalId {
    type Err = ParseProvisionalIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseProvisionalIdError(raw.to_string());
        let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
        if fraction.len() > 3 || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        if whole < 0 {
            return Err(invalid());
        }
        let fraction = if fraction.is_empty() {
            0
        } else {
            format!("{fraction:0<3}").parse::<i64>().map_err(|_| invalid())?
        };
        Ok(Self(whole * SCALE + fraction))
    }
}

/// Registry key for a send: the provisional id text for echoed sends, or a
/// `loc-N` key for sends that were not echoed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(String);

impl LocalId {
    pub fn fallback(counter: u64) -> Self {
        Self(format!("loc-{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn provisional(&self) -> Option<ProvisionalId> {
        self.0.parse().ok()
    }
}

impl From<ProvisionalId> for LocalId {
    fn from(value: ProvisionalId) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for LocalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for LocalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a view sees for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayId {
    Provisional(ProvisionalId),
    Server(MessageId),
}

impl DisplayId {
    fn sort_key(self) -> (i64, bool) {
        match self {
            Self::Provisional(id) => (id.thousandths(), true),
            Self::Server(id) => (id.0.saturating_mul(SCALE), false),
        }
    }

    pub fn server_id(self) -> Option<MessageId> {
        match self {
            Self::Server(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }
}

impl Ord for DisplayId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for DisplayId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => id.fmt(f),
            Self::Server(id) => write!(f, "{}", id.0),
        }
    }
}

impl From<MessageId> for DisplayId {
    fn from(value: MessageId) -> Self {
        Self::Server(value)
    }
}

impl From<ProvisionalId> for DisplayId {
    fn from(value: ProvisionalId) -> Self {
        Self::Provisional(value)
    }
}

/// Issues provisional ids just above the highest known message id.
#[derive(Debug, Clone)]
pub struct LocalIdAllocator {
    increment: i64,
    max_steps: i64,
    highest_issued: Option<ProvisionalId>,
    used: HashSet<ProvisionalId>,
}

impl Default for LocalIdAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_INCREMENT_THOUSANDTHS, DEFAULT_MAX_STEPS)
    }
}

impl LocalIdAllocator {
    /// `increment` is in thousandths and must leave room below the next
    /// integer; it is clamped into `1..=99`.
    pub fn new(increment_thousandths: i64, max_steps: i64) -> Self {
        Self {
            increment: increment_thousandths.clamp(1, 99),
            max_steps: max_steps.max(1),
            highest_issued: None,
            used: HashSet::new(),
        }
    }

    /// Allocator for a fresh session in the same process. The baseline
    /// restarts from the store, but ids issued earlier stay unusable.
    pub fn successor(&self) -> Self {
        Self {
            increment: self.increment,
            max_steps: self.max_steps,
            highest_issued: None,
            used: self.used.clone(),
        }
    }

    pub fn highest_issued(&self) -> Option<ProvisionalId> {
        self.highest_issued
    }

    pub fn is_used(&self, id: ProvisionalId) -> bool {
        self.used.contains(&id)
    }

    /// Returns `None` when no id can be issued safely; the caller must fall
    /// back to a non-optimistic send.
    pub fn next_id(&mut self, max_store_id: Option<MessageId>) -> Option<ProvisionalId> {
        let store_latest = max_store_id.map_or(0, |id| id.0.max(0).saturating_mul(SCALE));
        let latest = self
            .highest_issued
            .map_or(store_latest, |issued| issued.thousandths().max(store_latest));
        let candidate = ProvisionalId::from_thousandths(latest + self.increment);

        if self.used.contains(&candidate) {
            error!(local_id = %candidate, "duplicate local id would be issued");
            return None;
        }

        let fraction = candidate.fraction_thousandths();
        if fraction > self.increment * self.max_steps {
            warn!(
                local_id = %candidate,
                "local echo disabled for this message to let the server catch up"
            );
            return None;
        }
        if fraction == 0 {
            error!(local_id = %candidate, "local id cannot be an integer");
            return None;
        }

        self.used.insert(candidate);
        self.highest_issued = Some(candidate);
        Some(candidate)
    }
}
