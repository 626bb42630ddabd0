//! Ozone moderation service client over XRPC.
//!
//! A session is acquired once at startup with `createSession` and owned by
//! the client. An `ExpiredToken` response triggers a single
//! `refreshSession` and a retry of the failed call.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::OzoneConfig;
use crate::error::ModerationError;
use crate::moderation::types::{
    AccountProfile, ActionRequest, AtUri, Did, Page, ReportEvent, SubjectStatus, TimeWindow,
};
use crate::moderation::wire::{
    self, GetRecordOutput, ProfileView, QueryEventsOutput, QueryStatusesOutput, RepoViewDetail,
    SessionOutput, XrpcErrorBody,
};
use crate::moderation::ModerationService;

/// Items requested per page.
const PAGE_LIMIT: &str = "100";

/// XRPC error names meaning the subject no longer exists.
const NOT_FOUND_ERRORS: &[&str] = &[
    "NotFound",
    "RepoNotFound",
    "RecordNotFound",
    "AccountTakedown",
    "AccountDeactivated",
];

/// XRPC error names meaning the credentials are no good.
const AUTH_ERRORS: &[&str] = &["AuthenticationRequired", "InvalidToken", "AuthMissing"];

// ── Session ─────────────────────────────────────────────────────────

/// Authenticated moderator session.
pub struct Session {
    access_jwt: SecretString,
    refresh_jwt: SecretString,
    did: Did,
    handle: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("did", &self.did)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Log in with the configured handle and password.
    pub async fn create(
        http: &reqwest::Client,
        config: &OzoneConfig,
    ) -> Result<Self, ModerationError> {
        let nsid = "com.atproto.server.createSession";
        let response = http
            .post(xrpc_url(&config.service_url, nsid))
            .json(&json!({
                "identifier": config.handle,
                "password": config.password.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| transport_error(nsid, e))?;

        let session = Self::from_response(nsid, response).await?;
        info!(did = %session.did, handle = ?session.handle, "Moderator session established");
        Ok(session)
    }

    /// Exchange the refresh token for a fresh session.
    async fn refresh(
        &self,
        http: &reqwest::Client,
        service_url: &str,
    ) -> Result<Self, ModerationError> {
        let nsid = "com.atproto.server.refreshSession";
        let response = http
            .post(xrpc_url(service_url, nsid))
            .bearer_auth(self.refresh_jwt.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(nsid, e))?;

        Self::from_response(nsid, response).await
    }

    async fn from_response(
        nsid: &str,
        response: reqwest::Response,
    ) -> Result<Self, ModerationError> {
        let status = response.status();
        if !status.is_success() {
            let body: XrpcErrorBody = response.json().await.unwrap_or_default();
            return Err(match error_for_status(nsid, status, body) {
                transient @ ModerationError::Transient { .. } => transient,
                other => ModerationError::AuthFailed {
                    reason: other.to_string(),
                },
            });
        }

        let out: SessionOutput =
            response
                .json()
                .await
                .map_err(|e| ModerationError::InvalidResponse {
                    method: nsid.to_string(),
                    reason: e.to_string(),
                })?;

        Ok(Self {
            access_jwt: SecretString::from(out.access_jwt),
            refresh_jwt: SecretString::from(out.refresh_jwt),
            did: Did::from(out.did),
            handle: out.handle,
        })
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// `ModerationService` backed by an Ozone instance.
pub struct OzoneClient {
    http: reqwest::Client,
    config: OzoneConfig,
    session: RwLock<Session>,
}

impl OzoneClient {
    /// Build an HTTP client and log in.
    pub async fn login(config: OzoneConfig) -> Result<Self, ModerationError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ModerationError::Transient {
                method: "client".to_string(),
                reason: e.to_string(),
            })?;
        let session = Session::create(&http, &config).await?;
        Ok(Self::new(http, config, session))
    }

    pub fn new(http: reqwest::Client, config: OzoneConfig, session: Session) -> Self {
        Self {
            http,
            config,
            session: RwLock::new(session),
        }
    }

    /// Identity recorded as the author of emitted events.
    pub async fn actor(&self) -> Did {
        self.session.read().await.did.clone()
    }

    /// Refresh unless another call already replaced the `stale` token.
    async fn refresh_session(&self, stale: &SecretString) -> Result<(), ModerationError> {
        let mut session = self.session.write().await;
        if session.access_jwt.expose_secret() != stale.expose_secret() {
            return Ok(());
        }
        let refreshed = session.refresh(&self.http, &self.config.service_url).await?;
        *session = refreshed;
        info!("Moderator session refreshed");
        Ok(())
    }

    /// Perform one XRPC call, refreshing the session once on expiry.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        nsid: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, ModerationError> {
        let mut refreshed = false;
        loop {
            let token = self.session.read().await.access_jwt.clone();
            let mut request = self
                .http
                .request(method.clone(), xrpc_url(&self.config.service_url, nsid))
                .bearer_auth(token.expose_secret())
                .query(query);

            if nsid.starts_with("tools.ozone.") {
                request = request.header("atproto-proxy", self.config.labeler_proxy());
            }
            if let Some(ref labelers) = self.config.accept_labelers {
                request = request.header("atproto-accept-labelers", labelers);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(|e| transport_error(nsid, e))?;
            let status = response.status();

            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| ModerationError::InvalidResponse {
                        method: nsid.to_string(),
                        reason: e.to_string(),
                    });
            }

            let error_body: XrpcErrorBody = response.json().await.unwrap_or_default();
            if !refreshed && error_body.error.as_deref() == Some("ExpiredToken") {
                debug!(method = nsid, "Access token expired, refreshing session");
                self.refresh_session(&token).await?;
                refreshed = true;
                continue;
            }

            return Err(error_for_status(nsid, status, error_body));
        }
    }
}

#[async_trait]
impl ModerationService for OzoneClient {
    async fn query_events(
        &self,
        window: &TimeWindow,
        event_type: &str,
        cursor: Option<&str>,
    ) -> Result<Page<ReportEvent>, ModerationError> {
        let mut query = vec![
            ("limit", PAGE_LIMIT.to_string()),
            ("types", event_type.to_string()),
            ("includeAllUserRecords", "false".to_string()),
            ("createdAfter", window.after.to_rfc3339()),
            ("createdBefore", window.before.to_rfc3339()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let out: QueryEventsOutput = self
            .call(Method::GET, "tools.ozone.moderation.queryEvents", &query, None)
            .await?;

        let items = out
            .events
            .into_iter()
            .filter_map(|raw| match wire::report_event(raw) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed report event");
                    None
                }
            })
            .collect();

        Ok(Page::new(items, out.cursor))
    }

    async fn query_statuses(
        &self,
        window: &TimeWindow,
        review_state: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<Page<SubjectStatus>, ModerationError> {
        let mut query = vec![
            ("limit", PAGE_LIMIT.to_string()),
            ("includeMuted", "true".to_string()),
            ("sortField", "lastReportedAt".to_string()),
            ("sortDirection", "desc".to_string()),
            ("reportedAfter", window.after.to_rfc3339()),
            ("reportedBefore", window.before.to_rfc3339()),
        ];
        if let Some(state) = review_state {
            query.push(("reviewState", state.to_string()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let out: QueryStatusesOutput = self
            .call(Method::GET, "tools.ozone.moderation.queryStatuses", &query, None)
            .await?;

        let items = out
            .subject_statuses
            .into_iter()
            .filter_map(|raw| match wire::subject_status(raw) {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed subject status");
                    None
                }
            })
            .collect();

        Ok(Page::new(items, out.cursor))
    }

    async fn get_account_profile(&self, did: &Did) -> Result<AccountProfile, ModerationError> {
        let view: ProfileView = self
            .call(
                Method::GET,
                "app.bsky.actor.getProfile",
                &[("actor", did.to_string())],
                None,
            )
            .await?;
        Ok(view.into())
    }

    async fn get_record_text(&self, uri: &str) -> Result<Option<String>, ModerationError> {
        let at_uri = AtUri::parse(uri).ok_or_else(|| ModerationError::NotFound {
            what: format!("record {uri} (unparsable uri)"),
        })?;

        let out: GetRecordOutput = self
            .call(
                Method::GET,
                "com.atproto.repo.getRecord",
                &[
                    ("repo", at_uri.authority.to_string()),
                    ("collection", at_uri.collection),
                    ("rkey", at_uri.rkey),
                ],
                None,
            )
            .await?;
        Ok(out.text())
    }

    async fn get_existing_labels(&self, did: &Did) -> Result<Vec<String>, ModerationError> {
        let repo: RepoViewDetail = self
            .call(
                Method::GET,
                "tools.ozone.moderation.getRepo",
                &[("did", did.to_string())],
                None,
            )
            .await?;
        Ok(repo.labels.into_iter().map(|l| l.val).collect())
    }

    async fn emit_action(&self, request: &ActionRequest) -> Result<(), ModerationError> {
        let actor = self.actor().await;
        let body = wire::emit_event_body(request, &actor);
        let _: IgnoredAny = self
            .call(
                Method::POST,
                "tools.ozone.moderation.emitEvent",
                &[],
                Some(&body),
            )
            .await?;
        debug!(
            kind = request.kind.label(),
            subject = %request.subject,
            "Emitted moderation event"
        );
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn xrpc_url(service_url: &str, nsid: &str) -> String {
    format!("{}/xrpc/{nsid}", service_url.trim_end_matches('/'))
}

fn transport_error(nsid: &str, err: reqwest::Error) -> ModerationError {
    ModerationError::Transient {
        method: nsid.to_string(),
        reason: err.to_string(),
    }
}

/// Map a non-success XRPC response onto the error taxonomy.
fn error_for_status(nsid: &str, status: StatusCode, body: XrpcErrorBody) -> ModerationError {
    let name = body.error.unwrap_or_default();
    let message = body.message.unwrap_or_default();
    let reason = if message.is_empty() {
        name.clone()
    } else {
        format!("{name}: {message}")
    };

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || AUTH_ERRORS.contains(&name.as_str())
    {
        return ModerationError::AuthFailed {
            reason: format!("{nsid}: {reason}"),
        };
    }

    if status == StatusCode::NOT_FOUND
        || NOT_FOUND_ERRORS.contains(&name.as_str())
        || message.to_lowercase().contains("not found")
        || message.to_lowercase().contains("suspended")
    {
        return ModerationError::NotFound {
            what: format!("{nsid}: {reason}"),
        };
    }

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ModerationError::Transient {
            method: nsid.to_string(),
            reason: format!("{status}: {reason}"),
        };
    }

    ModerationError::Rejected {
        method: nsid.to_string(),
        status: status.as_u16(),
        reason,
    }
}
