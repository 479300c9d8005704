//! Local rendering and posting-permission seams used by the echo engine.

use std::collections::HashSet;

use shared::domain::{MessageTarget, StreamId, UserId};

const ME_PREFIX: &str = "/me ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub content: String,
    pub is_me_message: bool,
}

/// Synchronous client-side renderer. Anything it cannot render faithfully
/// must be reported through `contains_backend_only_syntax`.
pub trait MessageRenderer: Send + Sync {
    fn contains_backend_only_syntax(&self, raw: &str) -> bool;
    fn render(&self, raw: &str) -> RenderedContent;
}

/// Content that starts with `/` is a command intercepted before it becomes a
/// message; `/me ` status messages are the exception.
pub fn is_slash_command(raw: &str) -> bool {
    raw.starts_with('/') && !raw.starts_with(ME_PREFIX)
}

/// Escapes text and wraps blank-line separated blocks in paragraphs.
#[derive(Debug, Clone)]
pub struct BasicRenderer {
    backend_only_markers: Vec<String>,
}

impl Default for BasicRenderer {
    fn default() -> Self {
        Self::new(vec!["$$".to_string(), "```math".to_string()])
    }
}

impl BasicRenderer {
    pub fn new(backend_only_markers: Vec<String>) -> Self {
        Self {
            backend_only_markers,
        }
    }
}

impl MessageRenderer for BasicRenderer {
    fn contains_backend_only_syntax(&self, raw: &str) -> bool {
        self.backend_only_markers
            .iter()
            .any(|marker| !marker.is_empty() && raw.contains(marker.as_str()))
    }

    fn render(&self, raw: &str) -> RenderedContent {
        let is_me_message = raw.starts_with(ME_PREFIX) && !raw[ME_PREFIX.len()..].trim().is_empty();
        let content = raw
            .trim()
            .split("\n\n")
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .map(|block| {
                let lines: Vec<String> = block.lines().map(escape_html).collect();
                format!("<p>{}</p>", lines.join("<br>\n"))
            })
            .collect::<Vec<_>>()
            .join("\n");
        RenderedContent {
            content,
            is_me_message,
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Decides whether the sender may originate a message to a target.
pub trait RecipientPolicy: Send + Sync {
    fn can_send_to(&self, sender_id: UserId, target: &MessageTarget) -> bool;
}

pub struct AllowAllRecipients;

impl RecipientPolicy for AllowAllRecipients {
    fn can_send_to(&self, _sender_id: UserId, _target: &MessageTarget) -> bool {
        true
    }
}

/// Realm-style posting rules: streams the user cannot post to, and whether
/// the user may start direct conversations with other people.
#[derive(Debug, Clone, Default)]
pub struct PostingPolicy {
    pub read_only_streams: HashSet<StreamId>,
    pub direct_messages_restricted: bool,
}

impl RecipientPolicy for PostingPolicy {
    fn can_send_to(&self, sender_id: UserId, target: &MessageTarget) -> bool {
        match target {
            MessageTarget::Stream { stream_id, .. } => !self.read_only_streams.contains(stream_id),
            MessageTarget::Direct { recipient_ids } => {
                // Notes to self are always allowed.
                !self.direct_messages_restricted
                    || recipient_ids.iter().all(|id| *id == sender_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_exclude_me_messages() {
        assert!(is_slash_command("/poll lunch?"));
        assert!(is_slash_command("/me"));
        assert!(!is_slash_command("/me waves"));
        assert!(!is_slash_command("hello /world"));
    }

    #[test]
    fn renders_paragraphs_and_escapes_markup() {
        let rendered = BasicRenderer::default().render("a <b>\nline two\n\nnext & last");
        assert_eq!(
            rendered.content,
            "<p>a &lt;b&gt;<br>\nline two</p>\n<p>next &amp; last</p>"
        );
        assert!(!rendered.is_me_message);
    }

    #[test]
    fn flags_me_messages() {
        let rendered = BasicRenderer::default().render("/me waves");
        assert!(rendered.is_me_message);
        assert_eq!(rendered.content, "<p>/me waves</p>");
    }

    #[test]
    fn detects_backend_only_markers() {
        let renderer = BasicRenderer::default();
        assert!(renderer.contains_backend_only_syntax("$$x^2$$"));
        assert!(!renderer.contains_backend_only_syntax("plain"));
    }

    #[test]
    fn posting_policy_blocks_read_only_streams_and_restricted_dms() {
        let policy = PostingPolicy {
            read_only_streams: [StreamId(9)].into_iter().collect(),
            direct_messages_restricted: true,
        };
        let me = UserId(1);
        assert!(!policy.can_send_to(me, &MessageTarget::stream(StreamId(9), "announce")));
        assert!(policy.can_send_to(me, &MessageTarget::stream(StreamId(2), "chat")));
        assert!(!policy.can_send_to(me, &MessageTarget::direct([UserId(2)])));
        assert!(policy.can_send_to(me, &MessageTarget::direct([me])));
    }
}
