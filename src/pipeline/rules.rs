//! Regex classification rules for profile and post text.
//!
//! Rules are data: a label, a required pattern, an optional whitelist
//! pattern that vetoes a match, identities exempt from the rule, the fields
//! the rule applies to, and what to emit when it fires. Evaluation is a
//! pure function of (text, identity, rule table).
//!
//! Every applicable rule is evaluated independently; the caller decides
//! what to do with the matched verdicts.

use std::collections::HashSet;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::moderation::Did;

/// Which piece of subject text a rule is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleField {
    Description,
    DisplayName,
    PostText,
}

impl RuleField {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Description => "description",
            Self::DisplayName => "display_name",
            Self::PostText => "post_text",
        }
    }
}

/// Subject text, by field. Absent fields are never evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectText {
    pub description: Option<String>,
    pub display_name: Option<String>,
    pub post_text: Option<String>,
}

impl SubjectText {
    const FIELDS: [RuleField; 3] = [
        RuleField::Description,
        RuleField::DisplayName,
        RuleField::PostText,
    ];

    /// Text of `field`, if present and non-blank.
    pub fn get(&self, field: RuleField) -> Option<&str> {
        let text = match field {
            RuleField::Description => self.description.as_deref(),
            RuleField::DisplayName => self.display_name.as_deref(),
            RuleField::PostText => self.post_text.as_deref(),
        };
        text.filter(|t| !t.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        Self::FIELDS.iter().all(|f| self.get(*f).is_none())
    }

    /// The single piece of free text submitted for escalation:
    /// post text, else description, else display name.
    pub fn primary(&self) -> Option<&str> {
        self.get(RuleField::PostText)
            .or_else(|| self.get(RuleField::Description))
            .or_else(|| self.get(RuleField::DisplayName))
    }
}

/// What a rule emits when it matches. Any combination may be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RulePolicy {
    pub emit_label: bool,
    pub emit_comment: bool,
    pub emit_report: bool,
}

/// A compiled classification rule.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    /// Moderation label this rule decides.
    pub label: String,
    /// Justification attached to emitted actions.
    pub comment: String,
    pub pattern: Regex,
    /// A match on this vetoes a `pattern` match.
    pub whitelist: Option<Regex>,
    /// Identities the rule never applies to.
    pub allowlist: HashSet<Did>,
    pub fields: HashSet<RuleField>,
    pub policy: RulePolicy,
}

impl ClassificationRule {
    pub fn applies_to(&self, field: RuleField) -> bool {
        self.fields.contains(&field)
    }
}

/// Outcome of one rule against one piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Matched,
    NotMatched,
    SuppressedByWhitelist,
    SuppressedByAllowlist,
}

/// Verdict of one applicable rule.
#[derive(Debug, Clone)]
pub struct RuleVerdict<'a> {
    pub rule: &'a ClassificationRule,
    pub field: RuleField,
    pub outcome: RuleOutcome,
}

impl RuleVerdict<'_> {
    pub fn matched(&self) -> bool {
        self.outcome == RuleOutcome::Matched
    }

    pub fn suppressed_by_whitelist(&self) -> bool {
        self.outcome == RuleOutcome::SuppressedByWhitelist
    }

    pub fn suppressed_by_allowlist(&self) -> bool {
        self.outcome == RuleOutcome::SuppressedByAllowlist
    }
}

// ── Rule table file ─────────────────────────────────────────────────

/// One rule as written in the JSON rule table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub label: String,
    pub comment: String,
    pub pattern: String,
    #[serde(default)]
    pub whitelist: Option<String>,
    #[serde(default)]
    pub ignored_dids: Vec<String>,
    #[serde(default)]
    pub description: bool,
    #[serde(default)]
    pub display_name: bool,
    #[serde(default)]
    pub post_text: bool,
    #[serde(default)]
    pub to_label: bool,
    #[serde(default)]
    pub comment_acct: bool,
    #[serde(default)]
    pub report_acct: bool,
    #[serde(default = "default_case_insensitive")]
    pub case_insensitive: bool,
}

fn default_case_insensitive() -> bool {
    true
}

impl RuleSpec {
    fn compile(&self) -> Result<ClassificationRule, ConfigError> {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(self.case_insensitive)
                .build()
                .map_err(|e| ConfigError::InvalidValue {
                    key: format!("rule {}", self.label),
                    message: e.to_string(),
                })
        };

        let mut fields = HashSet::new();
        if self.description {
            fields.insert(RuleField::Description);
        }
        if self.display_name {
            fields.insert(RuleField::DisplayName);
        }
        if self.post_text {
            fields.insert(RuleField::PostText);
        }

        Ok(ClassificationRule {
            label: self.label.clone(),
            comment: self.comment.clone(),
            pattern: build(&self.pattern)?,
            whitelist: self.whitelist.as_deref().map(build).transpose()?,
            allowlist: self.ignored_dids.iter().map(|d| Did::from(d.as_str())).collect(),
            fields,
            policy: RulePolicy {
                emit_label: self.to_label,
                emit_comment: self.comment_acct,
                emit_report: self.report_acct,
            },
        })
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Ordered table of classification rules.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<ClassificationRule>,
}

impl RuleEngine {
    /// Built-in rule table used when no rule file is configured.
    pub fn default_rules() -> Self {
        let specs = vec![
            RuleSpec {
                label: "suspect-inauthentic".into(),
                comment: "Labeling for suspect inauthentic behavior cited in report.".into(),
                pattern: r"luxuryhousezone\.com|3sblog\.com".into(),
                whitelist: None,
                ignored_dids: Vec::new(),
                description: false,
                display_name: false,
                post_text: true,
                to_label: true,
                comment_acct: false,
                report_acct: false,
                case_insensitive: true,
            },
            RuleSpec {
                label: "follow-farming".into(),
                comment: "Follow-farming service promoted in profile.".into(),
                pattern: r"blueskyfollower\.com|#followback|follow\s*for\s*follow|f4f\b".into(),
                whitelist: Some(r"no\s*(f4f|follow\s*for\s*follow|followback)".into()),
                ignored_dids: Vec::new(),
                description: true,
                display_name: true,
                post_text: false,
                to_label: true,
                comment_acct: false,
                report_acct: false,
                case_insensitive: true,
            },
        ];

        Self::from_specs(&specs).expect("built-in rules compile")
    }

    /// Create an empty rule engine.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self, ConfigError> {
        let rules = specs
            .iter()
            .map(RuleSpec::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Load a JSON rule table.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let specs: Vec<RuleSpec> = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!("rule table {}: {e}", path.display()))
        })?;
        Self::from_specs(&specs)
    }

    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate every rule applicable to `field` against `text`.
    ///
    /// Absent or blank text yields no verdicts at all.
    pub fn evaluate(&self, field: RuleField, text: Option<&str>, identity: &Did) -> Vec<RuleVerdict<'_>> {
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            return Vec::new();
        };

        self.rules
            .iter()
            .filter(|rule| rule.applies_to(field))
            .map(|rule| {
                let outcome = evaluate_rule(rule, text, identity);
                if outcome != RuleOutcome::NotMatched {
                    debug!(
                        label = %rule.label,
                        field = field.label(),
                        identity = %identity,
                        outcome = ?outcome,
                        "Rule evaluated"
                    );
                }
                RuleVerdict {
                    rule,
                    field,
                    outcome,
                }
            })
            .collect()
    }

    /// Evaluate every field of `text`, in field order.
    pub fn evaluate_text(&self, text: &SubjectText, identity: &Did) -> Vec<RuleVerdict<'_>> {
        SubjectText::FIELDS
            .iter()
            .flat_map(|field| self.evaluate(*field, text.get(*field), identity))
            .collect()
    }
}

fn evaluate_rule(rule: &ClassificationRule, text: &str, identity: &Did) -> RuleOutcome {
    if rule.allowlist.contains(identity) {
        return RuleOutcome::SuppressedByAllowlist;
    }
    if !rule.pattern.is_match(text) {
        return RuleOutcome::NotMatched;
    }
    match rule.whitelist {
        Some(ref whitelist) if whitelist.is_match(text) => RuleOutcome::SuppressedByWhitelist,
        _ => RuleOutcome::Matched,
    }
}
