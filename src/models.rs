//! Core data models used throughout Chat Harness.
//!
//! These types represent the channels, users, and messages that flow through
//! the ingestion and retrieval pipeline, plus the event and result types
//! shared between the capture paths and the query layer.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A conversation in the workspace: public/private channel, group DM, or 1:1.
///
/// Channels are never deleted locally, only updated in place by upserts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    /// Display name; absent for 1:1 conversations.
    pub name: Option<String>,
    pub is_private: bool,
    pub topic: String,
    pub purpose: String,
    pub is_im: bool,
    pub is_mpim: bool,
    /// Counterpart user for 1:1 conversations.
    pub user_id: Option<String>,
    /// Whether the ingesting credential is a member (affects join-before-read).
    pub is_member: bool,
}

/// A workspace member or bot profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub real_name: String,
    pub is_bot: bool,
    pub title: String,
    pub email: Option<String>,
    pub tz: Option<String>,
    pub status_text: String,
}

/// A single message, identified by `(channel_id, ts)`.
///
/// `ts` is the source-assigned decimal timestamp string. It is unique within
/// a channel, monotonically increasing, and fixed-width enough that
/// lexicographic comparison matches timestamp ordering. It is never
/// regenerated locally. Re-upserting the same key replaces the stored row —
/// edits and reaction updates arrive as whole-message replacements, not as a
/// separate version history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub channel_id: String,
    pub ts: String,
    pub user_id: Option<String>,
    pub text: String,
    /// Timestamp of the thread parent; equal to `ts` on the parent itself.
    pub thread_ts: Option<String>,
    pub reply_count: i64,
    /// Opaque JSON payloads carried through from the source.
    pub reactions_json: Option<String>,
    pub attachments_json: Option<String>,
    pub blocks_json: Option<String>,
    pub permalink: Option<String>,
    pub edited: bool,
}

impl Message {
    /// The key used to group a message with its thread: the thread parent
    /// timestamp if it has one, otherwise its own timestamp.
    pub fn thread_key(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or(&self.ts)
    }

    /// Whether this message is a thread parent with at least one reply.
    pub fn is_thread_parent(&self) -> bool {
        self.reply_count > 0 && self.thread_ts.as_deref().map_or(true, |t| t == self.ts)
    }
}

/// Notification published on the live side channel after a message is stored.
///
/// Fire-and-forget and lossy by design; the store remains the durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub channel_id: String,
    pub ts: String,
    pub user_id: Option<String>,
    pub text: String,
    pub thread_ts: Option<String>,
}

impl From<&Message> for MessageEvent {
    fn from(m: &Message) -> Self {
        Self {
            channel_id: m.channel_id.clone(),
            ts: m.ts.clone(),
            user_id: m.user_id.clone(),
            text: m.text.clone(),
            thread_ts: m.thread_ts.clone(),
        }
    }
}

/// A ranked full-text search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub channel_id: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub text: String,
    pub author_name: String,
    pub channel_name: String,
    pub score: f64,
    pub snippet: String,
}

/// A block of surrounding context returned by `ask`: either a full thread or
/// a symmetric window of messages around the hit.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBlock {
    pub channel_id: String,
    pub anchor_ts: String,
    pub is_thread: bool,
    pub messages: Vec<Message>,
}

/// Current wall-clock time formatted as a source-style timestamp string.
///
/// Used by the poller's cold start so a never-polled channel begins at "now"
/// instead of backfilling through history.
pub fn now_ts() -> String {
    let now = Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_key_falls_back_to_own_ts() {
        let m = Message {
            channel_id: "C1".into(),
            ts: "100.000001".into(),
            ..Default::default()
        };
        assert_eq!(m.thread_key(), "100.000001");

        let reply = Message {
            channel_id: "C1".into(),
            ts: "100.000005".into(),
            thread_ts: Some("100.000001".into()),
            ..Default::default()
        };
        assert_eq!(reply.thread_key(), "100.000001");
    }

    #[test]
    fn test_thread_parent_detection() {
        let parent = Message {
            ts: "100.000001".into(),
            thread_ts: Some("100.000001".into()),
            reply_count: 3,
            ..Default::default()
        };
        assert!(parent.is_thread_parent());

        let reply = Message {
            ts: "100.000005".into(),
            thread_ts: Some("100.000001".into()),
            reply_count: 0,
            ..Default::default()
        };
        assert!(!reply.is_thread_parent());
    }

    #[test]
    fn test_now_ts_is_lexicographically_ordered() {
        let a = now_ts();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_ts();
        assert!(b > a, "{} should sort after {}", b, a);
    }
}
