//! Moderation service capability and its Ozone implementation.
//!
//! The pipeline depends only on [`ModerationService`]; `OzoneClient` is the
//! production implementation speaking XRPC to an Ozone instance.

pub mod ozone;
pub mod types;
mod wire;

pub use ozone::{OzoneClient, Session};
pub use types::*;

use async_trait::async_trait;

use crate::error::ModerationError;

/// Event type filter selecting filed reports.
pub const REPORT_EVENT_TYPE: &str = "tools.ozone.moderation.defs#modEventReport";

/// Review state filter selecting subjects awaiting review.
pub const REVIEW_OPEN: &str = "tools.ozone.moderation.defs#reviewOpen";

/// Abstract moderation-service operations the triage pipeline needs.
///
/// Implementations own their credentials; every call is authenticated.
#[async_trait]
pub trait ModerationService: Send + Sync {
    /// Fetch one page of moderation events of `event_type` inside `window`.
    async fn query_events(
        &self,
        window: &TimeWindow,
        event_type: &str,
        cursor: Option<&str>,
    ) -> Result<Page<ReportEvent>, ModerationError>;

    /// Fetch one page of subject statuses last reported inside `window`.
    async fn query_statuses(
        &self,
        window: &TimeWindow,
        review_state: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<Page<SubjectStatus>, ModerationError>;

    /// Profile text for an account. `NotFound` when the account is gone.
    async fn get_account_profile(&self, did: &Did) -> Result<AccountProfile, ModerationError>;

    /// Text body of a record. `NotFound` when the record is gone.
    async fn get_record_text(&self, uri: &str) -> Result<Option<String>, ModerationError>;

    /// Label values currently applied to an account.
    async fn get_existing_labels(&self, did: &Did) -> Result<Vec<String>, ModerationError>;

    /// Emit one moderation action.
    async fn emit_action(&self, request: &ActionRequest) -> Result<(), ModerationError>;
}
