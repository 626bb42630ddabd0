//! Typed moderation data model.
//!
//! Wire payloads are converted into these types once, at ingestion. The
//! pipeline never sees `$type` strings.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Handle value the service reports when handle resolution is broken.
pub const INVALID_HANDLE: &str = "handle.invalid";

/// Collection whose records carry free text we can evaluate.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

// ── Identity ────────────────────────────────────────────────────────

/// Decentralized identifier naming an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Did {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Did {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Subject ─────────────────────────────────────────────────────────

/// The entity a report or status concerns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    Account { did: Did },
    Record { uri: String, cid: String },
}

impl Subject {
    pub fn account(did: impl Into<Did>) -> Self {
        Self::Account { did: did.into() }
    }

    pub fn record(uri: impl Into<String>, cid: impl Into<String>) -> Self {
        Self::Record {
            uri: uri.into(),
            cid: cid.into(),
        }
    }

    /// Identity owning the subject: the account itself, or the record's
    /// repository. `None` when a record URI has no parsable authority.
    pub fn owner(&self) -> Option<Did> {
        match self {
            Self::Account { did } => Some(did.clone()),
            Self::Record { uri, .. } => AtUri::parse(uri).map(|u| u.authority),
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Account { .. } => "account",
            Self::Record { .. } => "record",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account { did } => write!(f, "{did}"),
            Self::Record { uri, .. } => f.write_str(uri),
        }
    }
}

/// Parsed `at://<authority>/<collection>/<rkey>` record URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub authority: Did,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("at://")?;
        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().filter(|s| !s.is_empty())?;
        let collection = parts.next().filter(|s| !s.is_empty())?;
        // Record keys may themselves contain slashes.
        let rkey = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            authority: Did::from(authority),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }

    pub fn is_post(&self) -> bool {
        self.collection == POST_COLLECTION
    }
}

// ── Ingested items ──────────────────────────────────────────────────

/// One moderation report, as filed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEvent {
    pub id: i64,
    pub subject: Subject,
    /// Handle the service resolved for the subject's account, if any.
    pub subject_handle: Option<String>,
    pub created_by: Did,
    pub comment: Option<String>,
    /// Structured report reason, e.g. `com.atproto.moderation.defs#reasonSpam`.
    pub report_type: Option<String>,
    pub tombstone: bool,
    pub created_at: DateTime<Utc>,
}

impl ReportEvent {
    pub fn has_invalid_handle(&self) -> bool {
        self.subject_handle.as_deref() == Some(INVALID_HANDLE)
    }

    /// Comment text, if present and non-blank.
    pub fn comment_text(&self) -> Option<&str> {
        self.comment.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// Current review rollup for a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStatus {
    pub id: i64,
    pub subject: Subject,
    pub subject_handle: Option<String>,
    pub takendown: bool,
    pub review_state: Option<String>,
    pub last_reported_at: Option<DateTime<Utc>>,
}

impl SubjectStatus {
    pub fn has_invalid_handle(&self) -> bool {
        self.subject_handle.as_deref() == Some(INVALID_HANDLE)
    }
}

/// Profile text fields used by the rule engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub display_name: Option<String>,
    pub description: Option<String>,
}

// ── Outbound ────────────────────────────────────────────────────────

/// Kind of moderation action emitted back to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Acknowledge,
    Label,
    Comment,
    Report,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Label => "label",
            Self::Comment => "comment",
            Self::Report => "report",
        }
    }
}

/// A single outbound moderation instruction, dispatched exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub subject: Subject,
    /// Label values to create. Empty unless `kind` is `Label`.
    pub labels: Vec<String>,
    /// Free-text justification shown to human moderators.
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

impl ActionRequest {
    fn new(kind: ActionKind, subject: Subject, comment: impl Into<String>) -> Self {
        Self {
            kind,
            subject,
            labels: Vec::new(),
            comment: comment.into(),
            created_at: Utc::now(),
        }
    }

    pub fn acknowledge(subject: Subject, reason: impl Into<String>) -> Self {
        Self::new(ActionKind::Acknowledge, subject, reason)
    }

    pub fn label(subject: Subject, label: impl Into<String>, comment: impl Into<String>) -> Self {
        let mut request = Self::new(ActionKind::Label, subject, comment);
        request.labels.push(label.into());
        request
    }

    pub fn comment(subject: Subject, text: impl Into<String>) -> Self {
        Self::new(ActionKind::Comment, subject, text)
    }

    pub fn report(subject: Subject, text: impl Into<String>) -> Self {
        Self::new(ActionKind::Report, subject, text)
    }
}

// ── Queries ─────────────────────────────────────────────────────────

/// One page of a cursor-paginated query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation token; `None` or empty means end of stream.
    pub cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, cursor: Option<String>) -> Self {
        Self { items, cursor }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: None,
        }
    }
}

/// Half-open ingestion window `(after, before]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
}

impl TimeWindow {
    /// The window `[now - length, now]`.
    pub fn ending_now(length: Duration) -> Self {
        let before = Utc::now();
        let span = chrono::Duration::from_std(length).unwrap_or(chrono::Duration::zero());
        Self {
            after: before - span,
            before,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_uri_parses_post() {
        let uri = AtUri::parse("at://did:plc:abc/app.bsky.feed.post/3lhlw4gq4uj2t").unwrap();
        assert_eq!(uri.authority.as_str(), "did:plc:abc");
        assert_eq!(uri.collection, POST_COLLECTION);
        assert_eq!(uri.rkey, "3lhlw4gq4uj2t");
        assert!(uri.is_post());
    }

    #[test]
    fn at_uri_keeps_slashes_in_rkey() {
        let uri = AtUri::parse("at://did:plc:abc/app.example.thing/a/b").unwrap();
        assert_eq!(uri.rkey, "a/b");
        assert!(!uri.is_post());
    }

    #[test]
    fn at_uri_rejects_malformed() {
        assert!(AtUri::parse("https://example.com/x/y").is_none());
        assert!(AtUri::parse("at://did:plc:abc").is_none());
        assert!(AtUri::parse("at://did:plc:abc/app.bsky.feed.post").is_none());
        assert!(AtUri::parse("at:///app.bsky.feed.post/x").is_none());
    }

    #[test]
    fn subject_owner() {
        assert_eq!(
            Subject::account("did:example:alice").owner(),
            Some(Did::from("did:example:alice"))
        );
        assert_eq!(
            Subject::record("at://did:example:bob/app.bsky.feed.post/1", "cid").owner(),
            Some(Did::from("did:example:bob"))
        );
        assert_eq!(Subject::record("garbage", "cid").owner(), None);
    }

    #[test]
    fn label_request_carries_label() {
        let req = ActionRequest::label(Subject::account("did:example:a"), "spam", "why");
        assert_eq!(req.kind, ActionKind::Label);
        assert_eq!(req.labels, vec!["spam".to_string()]);
        assert!(ActionRequest::acknowledge(Subject::account("did:example:a"), "ok")
            .labels
            .is_empty());
    }

    #[test]
    fn time_window_spans_length() {
        let window = TimeWindow::ending_now(Duration::from_secs(600));
        assert_eq!((window.before - window.after).num_seconds(), 600);
    }

    #[test]
    fn blank_comment_is_absent() {
        let event = ReportEvent {
            id: 1,
            subject: Subject::account("did:example:a"),
            subject_handle: Some(INVALID_HANDLE.into()),
            created_by: Did::from("did:example:r"),
            comment: Some("   ".into()),
            report_type: None,
            tombstone: false,
            created_at: Utc::now(),
        };
        assert!(event.comment_text().is_none());
        assert!(event.has_invalid_handle());
    }
}
