//! Configuration types, read from the environment.
//!
//! Every `from_env()` has a `from_lookup()` twin taking a key lookup
//! function so parsing can be tested without touching process state.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::moderation::Did;

/// Default polling interval (and ingestion window length): 10 minutes.
pub const DEFAULT_INTERVAL_SECS: u64 = 600;

/// Default ceiling on in-flight calls to the moderation service.
pub const DEFAULT_MAX_CONCURRENT_ACTIONS: usize = 5;

/// Default number of items triaged concurrently in one pass.
pub const DEFAULT_MAX_CONCURRENT_ITEMS: usize = 32;

/// Comments matching this are reports the service does not handle here.
pub const DEFAULT_OUT_OF_SCOPE_PATTERN: &str = r"dobolen\.eu\.org|onlyfans\.com|getallmylinks\.com|(spam|spammer) bot|porn|sexual|prostitution|trafficking|csam|onlyfans ⤵️|impersonation";

/// Report reasons that are always out of scope.
pub const DEFAULT_OUT_OF_SCOPE_REASONS: &[&str] = &["com.atproto.moderation.defs#reasonSexual"];

/// Labels that mean a subject has already been actioned.
pub const DEFAULT_ALREADY_ACTIONED_LABELS: &[&str] = &["suspect-inauthentic", "impersonation"];

pub const DEFAULT_IMPORT_LABEL: &str = "suspect-inauthentic";

pub const DEFAULT_IMPORT_FALSE_POSITIVE_MARKER: &str = "post with spam url associated with bot";

// ── Lookup helpers ──────────────────────────────────────────────────

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    optional(lookup, key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn list(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &[&str]) -> Vec<String> {
    match lookup(key) {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn at_least_one(key: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ── Moderation service ──────────────────────────────────────────────

/// Connection settings for the Ozone moderation service.
#[derive(Debug, Clone)]
pub struct OzoneConfig {
    /// Base URL of the PDS fronting the moderation service.
    pub service_url: String,
    pub handle: String,
    pub password: SecretString,
    /// Labeler identity that moderation calls are proxied to.
    pub moderator_did: Did,
    /// Value for the `atproto-accept-labelers` header.
    pub accept_labelers: Option<String>,
    pub request_timeout: Duration,
}

impl OzoneConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let service_url = required(&lookup, "OZONE_SERVICE_URL")?;
        let service_url = if service_url.starts_with("http://") || service_url.starts_with("https://")
        {
            service_url
        } else {
            format!("https://{service_url}")
        };

        Ok(Self {
            service_url: service_url.trim_end_matches('/').to_string(),
            handle: required(&lookup, "OZONE_HANDLE")?,
            password: SecretString::from(required(&lookup, "OZONE_PASSWORD")?),
            moderator_did: Did::from(required(&lookup, "OZONE_MOD_DID")?),
            accept_labelers: optional(&lookup, "OZONE_ACCEPT_LABELERS"),
            request_timeout: Duration::from_secs(parsed(&lookup, "OZONE_REQUEST_TIMEOUT_SECS", 20)?),
        })
    }

    /// `atproto-proxy` header value routing calls to the labeler service.
    pub fn labeler_proxy(&self) -> String {
        format!("{}#atproto_labeler", self.moderator_did)
    }
}

// ── External classifier ─────────────────────────────────────────────

/// Settings for the external text-policy evaluator.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub endpoint: String,
    pub auth_token: SecretString,
    pub policy_id: String,
    pub timeout: Duration,
}

impl ClassifierConfig {
    /// Returns `None` when `CLASSIFIER_ENDPOINT` is unset (escalation disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(endpoint) = optional(&lookup, "CLASSIFIER_ENDPOINT") else {
            return Ok(None);
        };

        Ok(Some(Self {
            endpoint,
            auth_token: SecretString::from(required(&lookup, "CLASSIFIER_AUTH_TOKEN")?),
            policy_id: required(&lookup, "CLASSIFIER_POLICY_ID")?,
            timeout: Duration::from_secs(parsed(&lookup, "CLASSIFIER_TIMEOUT_SECS", 30)?),
        }))
    }
}

// ── Triage ──────────────────────────────────────────────────────────

/// Reports filed by a trusted automated importer of an external blocklist.
#[derive(Debug, Clone)]
pub struct ImportPolicy {
    pub trusted_creator: Did,
    /// Label applied to imported subjects.
    pub label: String,
    /// Provenance included in the label justification.
    pub source: Option<String>,
    /// Comment substring marking an import that must not be labeled.
    pub false_positive_marker: String,
}

/// Decision-procedure and scheduling settings.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Polling interval; also the length of each ingestion window.
    pub interval: Duration,
    /// Dispatcher ceiling on in-flight moderation-service calls.
    pub max_concurrent_actions: usize,
    /// Per-item triage chains run concurrently within a pass.
    pub max_concurrent_items: usize,
    /// Identities exempt from automated action.
    pub allowlisted_dids: HashSet<Did>,
    pub already_actioned_labels: HashSet<String>,
    pub out_of_scope_reasons: HashSet<String>,
    pub out_of_scope_pattern: Regex,
    pub import: Option<ImportPolicy>,
    /// JSON rule table; built-in rules when unset.
    pub rules_path: Option<PathBuf>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            max_concurrent_actions: DEFAULT_MAX_CONCURRENT_ACTIONS,
            max_concurrent_items: DEFAULT_MAX_CONCURRENT_ITEMS,
            allowlisted_dids: HashSet::new(),
            already_actioned_labels: DEFAULT_ALREADY_ACTIONED_LABELS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            out_of_scope_reasons: DEFAULT_OUT_OF_SCOPE_REASONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            out_of_scope_pattern: out_of_scope_regex(DEFAULT_OUT_OF_SCOPE_PATTERN)
                .expect("default out-of-scope pattern compiles"),
            import: None,
            rules_path: None,
        }
    }
}

fn out_of_scope_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl TriageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let pattern = optional(&lookup, "TRIAGE_OUT_OF_SCOPE_PATTERN")
            .unwrap_or_else(|| DEFAULT_OUT_OF_SCOPE_PATTERN.to_string());
        let out_of_scope_pattern =
            out_of_scope_regex(&pattern).map_err(|e| ConfigError::InvalidValue {
                key: "TRIAGE_OUT_OF_SCOPE_PATTERN".to_string(),
                message: e.to_string(),
            })?;

        let import = optional(&lookup, "TRIAGE_IMPORT_CREATOR_DID").map(|creator| ImportPolicy {
            trusted_creator: Did::from(creator),
            label: optional(&lookup, "TRIAGE_IMPORT_LABEL")
                .unwrap_or_else(|| DEFAULT_IMPORT_LABEL.to_string()),
            source: optional(&lookup, "TRIAGE_IMPORT_SOURCE"),
            false_positive_marker: optional(&lookup, "TRIAGE_IMPORT_FALSE_POSITIVE_MARKER")
                .unwrap_or_else(|| DEFAULT_IMPORT_FALSE_POSITIVE_MARKER.to_string()),
        });

        Ok(Self {
            interval: Duration::from_secs(parsed(
                &lookup,
                "TRIAGE_INTERVAL_SECS",
                DEFAULT_INTERVAL_SECS,
            )?),
            max_concurrent_actions: at_least_one(
                "TRIAGE_MAX_CONCURRENT_ACTIONS",
                parsed(
                    &lookup,
                    "TRIAGE_MAX_CONCURRENT_ACTIONS",
                    DEFAULT_MAX_CONCURRENT_ACTIONS,
                )?,
            )?,
            max_concurrent_items: at_least_one(
                "TRIAGE_MAX_CONCURRENT_ITEMS",
                parsed(
                    &lookup,
                    "TRIAGE_MAX_CONCURRENT_ITEMS",
                    DEFAULT_MAX_CONCURRENT_ITEMS,
                )?,
            )?,
            allowlisted_dids: list(&lookup, "TRIAGE_ALLOWLISTED_DIDS", &[])
                .into_iter()
                .map(Did::from)
                .collect(),
            already_actioned_labels: list(
                &lookup,
                "TRIAGE_ALREADY_ACTIONED_LABELS",
                DEFAULT_ALREADY_ACTIONED_LABELS,
            )
            .into_iter()
            .collect(),
            out_of_scope_reasons: list(
                &lookup,
                "TRIAGE_OUT_OF_SCOPE_REASONS",
                DEFAULT_OUT_OF_SCOPE_REASONS,
            )
            .into_iter()
            .collect(),
            out_of_scope_pattern,
            import,
            rules_path: optional(&lookup, "TRIAGE_RULES_PATH").map(PathBuf::from),
        })
    }
}
