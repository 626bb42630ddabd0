//! XRPC wire shapes and their conversion into the typed model.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ValidationError;
use crate::moderation::types::{
    AccountProfile, ActionKind, ActionRequest, Did, ReportEvent, Subject, SubjectStatus,
};

pub(crate) const REPO_REF: &str = "com.atproto.admin.defs#repoRef";
pub(crate) const STRONG_REF: &str = "com.atproto.repo.strongRef";

const EVENT_ACKNOWLEDGE: &str = "tools.ozone.moderation.defs#modEventAcknowledge";
const EVENT_LABEL: &str = "tools.ozone.moderation.defs#modEventLabel";
const EVENT_COMMENT: &str = "tools.ozone.moderation.defs#modEventComment";
const EVENT_REPORT: &str = "tools.ozone.moderation.defs#modEventReport";
const REASON_OTHER: &str = "com.atproto.moderation.defs#reasonOther";

// ── Responses ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryEventsOutput {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryStatusesOutput {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub subject_statuses: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModEventView {
    id: i64,
    event: Value,
    subject: Value,
    created_by: String,
    created_at: String,
    #[serde(default)]
    subject_handle: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectStatusView {
    id: i64,
    subject: Value,
    #[serde(default)]
    subject_repo_handle: Option<String>,
    #[serde(default)]
    takendown: bool,
    #[serde(default)]
    review_state: Option<String>,
    #[serde(default)]
    last_reported_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProfileView {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<ProfileView> for AccountProfile {
    fn from(view: ProfileView) -> Self {
        Self {
            display_name: view.display_name,
            description: view.description,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetRecordOutput {
    #[serde(default)]
    pub value: Value,
}

impl GetRecordOutput {
    pub fn text(&self) -> Option<String> {
        self.value
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepoViewDetail {
    #[serde(default)]
    pub labels: Vec<LabelView>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LabelView {
    pub val: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionOutput {
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct XrpcErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ── Conversions ─────────────────────────────────────────────────────

fn invalid(kind: &'static str, id: i64, reason: impl Into<String>) -> ValidationError {
    ValidationError {
        kind,
        id,
        reason: reason.into(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn parse_subject(value: &Value, kind: &'static str, id: i64) -> Result<Subject, ValidationError> {
    match str_field(value, "$type") {
        Some(REPO_REF) => str_field(value, "did")
            .map(Subject::account)
            .ok_or_else(|| invalid(kind, id, "account subject has no did")),
        Some(STRONG_REF) => {
            let uri = str_field(value, "uri")
                .ok_or_else(|| invalid(kind, id, "record subject has no uri"))?;
            let cid = str_field(value, "cid")
                .ok_or_else(|| invalid(kind, id, "record subject has no cid"))?;
            Ok(Subject::record(uri, cid))
        }
        Some(other) => Err(invalid(kind, id, format!("unsupported subject type {other}"))),
        None => Err(invalid(kind, id, "subject has no $type")),
    }
}

fn parse_timestamp(raw: &str, kind: &'static str, id: i64) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| invalid(kind, id, format!("bad timestamp {raw}: {e}")))
}

fn raw_id(value: &Value) -> i64 {
    value.get("id").and_then(Value::as_i64).unwrap_or_default()
}

/// Convert one raw `modEventView` into a report event.
pub(crate) fn report_event(value: Value) -> Result<ReportEvent, ValidationError> {
    let id = raw_id(&value);
    let view: ModEventView =
        serde_json::from_value(value).map_err(|e| invalid("event", id, e.to_string()))?;

    let subject = parse_subject(&view.subject, "event", view.id)?;
    let created_at = parse_timestamp(&view.created_at, "event", view.id)?;

    Ok(ReportEvent {
        id: view.id,
        subject,
        subject_handle: view.subject_handle,
        created_by: Did::from(view.created_by),
        comment: view
            .event
            .get("comment")
            .and_then(Value::as_str)
            .map(str::to_string),
        report_type: str_field(&view.event, "reportType").map(str::to_string),
        tombstone: view
            .event
            .get("tombstone")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        created_at,
    })
}

/// Convert one raw `subjectStatusView` into a subject status.
pub(crate) fn subject_status(value: Value) -> Result<SubjectStatus, ValidationError> {
    let id = raw_id(&value);
    let view: SubjectStatusView =
        serde_json::from_value(value).map_err(|e| invalid("status", id, e.to_string()))?;

    let subject = parse_subject(&view.subject, "status", view.id)?;
    let last_reported_at = view
        .last_reported_at
        .as_deref()
        .map(|raw| parse_timestamp(raw, "status", view.id))
        .transpose()?;

    Ok(SubjectStatus {
        id: view.id,
        subject,
        subject_handle: view.subject_repo_handle,
        takendown: view.takendown,
        review_state: view.review_state,
        last_reported_at,
    })
}

fn subject_ref(subject: &Subject) -> Value {
    match subject {
        Subject::Account { did } => json!({ "$type": REPO_REF, "did": did }),
        Subject::Record { uri, cid } => json!({ "$type": STRONG_REF, "uri": uri, "cid": cid }),
    }
}

/// Build the `emitEvent` input body for an action.
pub(crate) fn emit_event_body(request: &ActionRequest, created_by: &Did) -> Value {
    let event = match request.kind {
        ActionKind::Acknowledge => json!({
            "$type": EVENT_ACKNOWLEDGE,
            "comment": request.comment,
        }),
        ActionKind::Label => json!({
            "$type": EVENT_LABEL,
            "comment": request.comment,
            "createLabelVals": request.labels,
            "negateLabelVals": [],
        }),
        ActionKind::Comment => json!({
            "$type": EVENT_COMMENT,
            "comment": request.comment,
        }),
        ActionKind::Report => json!({
            "$type": EVENT_REPORT,
            "comment": request.comment,
            "reportType": REASON_OTHER,
        }),
    };

    json!({
        "event": event,
        "subject": subject_ref(&request.subject),
        "createdBy": created_by,
        "createdAt": request.created_at.to_rfc3339(),
    })
}
