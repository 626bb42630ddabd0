//! Triage decision procedure.
//!
//! Each report is walked through a fixed priority order; the first state
//! that applies is terminal:
//!
//! 1. tombstoned subject → acknowledge
//! 2. invalid handle → acknowledge
//! 3. allowlisted identity → acknowledge
//! 4. out-of-scope report reason → acknowledge
//! 5. out-of-scope comment → acknowledge
//! 6. trusted blocklist import → label, then acknowledge
//! 7. already labeled → acknowledge
//! 8. rule match → label / comment / report per matched rule
//! 9. free text present → external policy escalation
//! 10. nothing to go on → leave open
//!
//! Only authentication failures propagate out of a single item. Everything
//! else is logged against the item and the pass moves on.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::TriageConfig;
use crate::error::{ModerationError, TriageError, ValidationError};
use crate::moderation::{
    ActionRequest, AtUri, Did, ModerationService, ReportEvent, Subject, SubjectStatus,
};
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::escalation::{PolicyClassifier, escalation_comment};
use crate::pipeline::rules::{ClassificationRule, RuleEngine, SubjectText};

/// Terminal state reached for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriageDecision {
    Tombstoned,
    InvalidHandle,
    Allowlisted,
    OutOfScopeReason,
    OutOfScopeComment,
    /// Importer flagged its own report as not actionable.
    ImportFalsePositive,
    ImportedBlocklist,
    AlreadyLabeled,
    RuleMatch,
    /// Escalation found categories and the subject was annotated.
    Escalated,
    /// Escalation ran (or was unavailable) without a result; left open.
    EscalationInconclusive,
    NoAction,
    /// Subject status rollup showing a takedown.
    TakenDown,
    /// Subject status rollup needing nothing from us.
    Untouched,
}

impl TriageDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tombstoned => "tombstoned",
            Self::InvalidHandle => "invalid_handle",
            Self::Allowlisted => "allowlisted",
            Self::OutOfScopeReason => "out_of_scope_reason",
            Self::OutOfScopeComment => "out_of_scope_comment",
            Self::ImportFalsePositive => "import_false_positive",
            Self::ImportedBlocklist => "imported_blocklist",
            Self::AlreadyLabeled => "already_labeled",
            Self::RuleMatch => "rule_match",
            Self::Escalated => "escalated",
            Self::EscalationInconclusive => "escalation_inconclusive",
            Self::NoAction => "no_action",
            Self::TakenDown => "taken_down",
            Self::Untouched => "untouched",
        }
    }

    /// Whether the report stays open for a human moderator.
    pub fn leaves_open(&self) -> bool {
        matches!(
            self,
            Self::Escalated | Self::EscalationInconclusive | Self::NoAction | Self::Untouched
        )
    }
}

/// Result of triaging one item.
#[derive(Debug, Clone)]
pub struct TriageOutcome {
    pub item_id: i64,
    pub subject: Subject,
    pub decision: TriageDecision,
    pub actions_emitted: usize,
    pub actions_failed: usize,
}

impl TriageOutcome {
    fn new(item_id: i64, subject: &Subject, decision: TriageDecision) -> Self {
        Self {
            item_id,
            subject: subject.clone(),
            decision,
            actions_emitted: 0,
            actions_failed: 0,
        }
    }
}

/// Runs reports and subject statuses through the decision procedure.
pub struct TriageProcessor {
    config: TriageConfig,
    rules: RuleEngine,
    service: Arc<dyn ModerationService>,
    dispatcher: Arc<Dispatcher>,
    classifier: Option<Arc<dyn PolicyClassifier>>,
}

impl TriageProcessor {
    pub fn new(
        config: TriageConfig,
        rules: RuleEngine,
        service: Arc<dyn ModerationService>,
        dispatcher: Arc<Dispatcher>,
        classifier: Option<Arc<dyn PolicyClassifier>>,
    ) -> Self {
        Self {
            config,
            rules,
            service,
            dispatcher,
            classifier,
        }
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<dyn ModerationService> {
        &self.service
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Triage one filed report.
    pub async fn triage_report(&self, event: &ReportEvent) -> Result<TriageOutcome, TriageError> {
        let id = event.id;
        let subject = &event.subject;

        if event.tombstone {
            return self
                .acknowledge(event, TriageDecision::Tombstoned, "Subject tombstoned.")
                .await;
        }

        if event.has_invalid_handle() {
            return self
                .acknowledge(event, TriageDecision::InvalidHandle, "Invalid handle.")
                .await;
        }

        let owner = subject.owner().ok_or_else(|| ValidationError {
            kind: "event",
            id,
            reason: format!("cannot determine author of {subject}"),
        })?;

        if self.config.allowlisted_dids.contains(&owner) {
            let reason = format!("Report for {owner} is out of scope (allowlisted).");
            return self
                .acknowledge(event, TriageDecision::Allowlisted, &reason)
                .await;
        }

        if let Some(reason) = event
            .report_type
            .as_deref()
            .filter(|r| self.config.out_of_scope_reasons.contains(*r))
        {
            let reason = format!("Report reason {reason} is out of scope.");
            return self
                .acknowledge(event, TriageDecision::OutOfScopeReason, &reason)
                .await;
        }

        if let Some(comment) = event.comment_text() {
            if self.config.out_of_scope_pattern.is_match(comment) {
                return self
                    .acknowledge(
                        event,
                        TriageDecision::OutOfScopeComment,
                        "Report comment indicates out of scope content.",
                    )
                    .await;
            }
        }

        let existing = match self.existing_labels(id, &owner).await {
            Err(e) if e.is_fatal() => return Err(e),
            other => other,
        };

        // Import labeling does not wait on the lookup: the label event is idempotent.
        let unknown = HashSet::new();
        if let Some(outcome) = self
            .triage_import(event, existing.as_ref().unwrap_or(&unknown))
            .await?
        {
            return Ok(outcome);
        }
        let existing = existing?;

        if existing
            .iter()
            .any(|label| self.config.already_actioned_labels.contains(label))
        {
            return self
                .acknowledge(event, TriageDecision::AlreadyLabeled, "Subject already labeled.")
                .await;
        }

        let text = self.subject_text(id, subject, &owner).await?;

        if let Some(outcome) = self.apply_rules(event, &owner, &text, &existing).await? {
            return Ok(outcome);
        }

        match text.primary() {
            Some(primary) => self.escalate(event, primary).await,
            None => {
                debug!(event_id = id, subject = %subject, "No text and no rule fired, leaving open");
                Ok(TriageOutcome::new(id, subject, TriageDecision::NoAction))
            }
        }
    }

    /// Reconcile one subject status rollup.
    pub async fn triage_status(&self, status: &SubjectStatus) -> Result<TriageOutcome, TriageError> {
        let (decision, reason) = if status.takendown {
            (TriageDecision::TakenDown, "Subject takendown.")
        } else if status.has_invalid_handle() {
            (TriageDecision::InvalidHandle, "Invalid handle.")
        } else {
            return Ok(TriageOutcome::new(
                status.id,
                &status.subject,
                TriageDecision::Untouched,
            ));
        };

        info!(
            status_id = status.id,
            subject = %status.subject,
            decision = decision.label(),
            "Reconciling subject status"
        );
        let mut outcome = TriageOutcome::new(status.id, &status.subject, decision);
        self.emit(
            &mut outcome,
            ActionRequest::acknowledge(status.subject.clone(), reason),
        )
        .await?;
        Ok(outcome)
    }

    // ── States ──────────────────────────────────────────────────────

    async fn acknowledge(
        &self,
        event: &ReportEvent,
        decision: TriageDecision,
        reason: &str,
    ) -> Result<TriageOutcome, TriageError> {
        info!(
            event_id = event.id,
            subject = %event.subject,
            decision = decision.label(),
            "Acknowledging report"
        );
        let mut outcome = TriageOutcome::new(event.id, &event.subject, decision);
        self.emit(
            &mut outcome,
            ActionRequest::acknowledge(event.subject.clone(), reason),
        )
        .await?;
        Ok(outcome)
    }

    async fn triage_import(
        &self,
        event: &ReportEvent,
        existing: &HashSet<String>,
    ) -> Result<Option<TriageOutcome>, TriageError> {
        let Some(ref import) = self.config.import else {
            return Ok(None);
        };
        if event.created_by != import.trusted_creator {
            return Ok(None);
        }

        let comment = event.comment.as_deref().unwrap_or_default();
        if comment.contains(&import.false_positive_marker) {
            return self
                .acknowledge(event, TriageDecision::ImportFalsePositive, "Experimental import.")
                .await
                .map(Some);
        }

        info!(
            event_id = event.id,
            subject = %event.subject,
            label = %import.label,
            "Labeling subject from imported blocklist"
        );
        let mut outcome = TriageOutcome::new(event.id, &event.subject, TriageDecision::ImportedBlocklist);

        if existing.contains(&import.label) {
            debug!(event_id = event.id, label = %import.label, "Label already present, not reapplying");
        } else {
            let justification = match import.source {
                Some(ref source) => format!("Imported from {source}"),
                None => "Imported from trusted blocklist.".to_string(),
            };
            let label = ActionRequest::label(event.subject.clone(), &import.label, justification);
            if !self.emit(&mut outcome, label).await? {
                // Leave the report open so the next pass retries the label.
                return Ok(Some(outcome));
            }
        }

        self.emit(
            &mut outcome,
            ActionRequest::acknowledge(event.subject.clone(), "Report is autolabeled."),
        )
        .await?;
        Ok(Some(outcome))
    }

    async fn apply_rules(
        &self,
        event: &ReportEvent,
        owner: &Did,
        text: &SubjectText,
        existing: &HashSet<String>,
    ) -> Result<Option<TriageOutcome>, TriageError> {
        let verdicts = self.rules.evaluate_text(text, owner);

        // A rule applying to several fields fires once.
        let mut seen: Vec<&ClassificationRule> = Vec::new();
        let matched: Vec<_> = verdicts
            .iter()
            .filter(|v| v.matched())
            .filter(|v| {
                if seen.iter().any(|rule| std::ptr::eq(*rule, v.rule)) {
                    false
                } else {
                    seen.push(v.rule);
                    true
                }
            })
            .collect();

        if matched.is_empty() {
            return Ok(None);
        }

        let mut outcome = TriageOutcome::new(event.id, &event.subject, TriageDecision::RuleMatch);
        let mut labeled = HashSet::new();

        for verdict in matched {
            let rule = verdict.rule;
            info!(
                event_id = event.id,
                subject = %event.subject,
                rule = %rule.label,
                field = verdict.field.label(),
                "Rule matched"
            );

            if rule.policy.emit_label {
                if existing.contains(&rule.label) || !labeled.insert(rule.label.as_str()) {
                    debug!(event_id = event.id, label = %rule.label, "Label already present, not reapplying");
                } else {
                    let request =
                        ActionRequest::label(event.subject.clone(), &rule.label, &rule.comment);
                    self.emit(&mut outcome, request).await?;
                }
            }
            if rule.policy.emit_comment {
                let request = ActionRequest::comment(event.subject.clone(), &rule.comment);
                self.emit(&mut outcome, request).await?;
            }
            if rule.policy.emit_report {
                let request = ActionRequest::report(event.subject.clone(), &rule.comment);
                self.emit(&mut outcome, request).await?;
            }
        }

        Ok(Some(outcome))
    }

    async fn escalate(&self, event: &ReportEvent, text: &str) -> Result<TriageOutcome, TriageError> {
        let id = event.id;
        let Some(ref classifier) = self.classifier else {
            debug!(event_id = id, "Escalation disabled, leaving open");
            return Ok(TriageOutcome::new(
                id,
                &event.subject,
                TriageDecision::EscalationInconclusive,
            ));
        };

        let categories = match classifier.classify(text).await {
            Ok(categories) => categories,
            Err(e) => {
                warn!(event_id = id, error = %e, "Policy escalation failed, leaving open");
                Vec::new()
            }
        };

        if categories.is_empty() {
            debug!(event_id = id, subject = %event.subject, "Escalation found nothing, leaving open");
            return Ok(TriageOutcome::new(
                id,
                &event.subject,
                TriageDecision::EscalationInconclusive,
            ));
        }

        info!(
            event_id = id,
            subject = %event.subject,
            categories = %categories.join(", "),
            "Escalation identified categories"
        );
        let mut outcome = TriageOutcome::new(id, &event.subject, TriageDecision::Escalated);
        self.emit(
            &mut outcome,
            ActionRequest::comment(event.subject.clone(), escalation_comment(&categories)),
        )
        .await?;
        Ok(outcome)
    }

    // ── Service access ──────────────────────────────────────────────

    /// Dispatch one action. Returns whether it succeeded; only fatal
    /// failures are returned as errors.
    async fn emit(
        &self,
        outcome: &mut TriageOutcome,
        request: ActionRequest,
    ) -> Result<bool, TriageError> {
        match self.dispatcher.emit(self.service.as_ref(), &request).await {
            Ok(()) => {
                outcome.actions_emitted += 1;
                info!(
                    item_id = outcome.item_id,
                    kind = request.kind.label(),
                    subject = %request.subject,
                    "Moderation action emitted"
                );
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                outcome.actions_failed += 1;
                error!(
                    item_id = outcome.item_id,
                    kind = request.kind.label(),
                    subject = %request.subject,
                    error = %e,
                    "Failed to emit moderation action"
                );
                Ok(false)
            }
        }
    }

    /// Labels on the owning account. Any failure but `NotFound` skips the
    /// item for this pass.
    async fn existing_labels(&self, id: i64, owner: &Did) -> Result<HashSet<String>, TriageError> {
        match self
            .dispatcher
            .run(|| self.service.get_existing_labels(owner))
            .await
        {
            Ok(labels) => Ok(labels.into_iter().collect()),
            Err(e) if e.is_not_found() => {
                debug!(event_id = id, owner = %owner, "Account not found, assuming no labels");
                Ok(HashSet::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Text to evaluate. Fetch failures mean no text, not a failed item.
    async fn subject_text(
        &self,
        id: i64,
        subject: &Subject,
        owner: &Did,
    ) -> Result<SubjectText, TriageError> {
        match subject {
            Subject::Account { did } => {
                let profile = self
                    .fetch_optional(id, "profile", || self.service.get_account_profile(did))
                    .await?
                    .unwrap_or_default();
                Ok(SubjectText {
                    description: profile.description,
                    display_name: profile.display_name,
                    post_text: None,
                })
            }
            Subject::Record { uri, .. } => {
                if !AtUri::parse(uri).is_some_and(|u| u.is_post()) {
                    debug!(event_id = id, uri = %uri, owner = %owner, "Record has no evaluable text");
                    return Ok(SubjectText::default());
                }
                let post_text = self
                    .fetch_optional(id, "record", || self.service.get_record_text(uri))
                    .await?
                    .flatten();
                Ok(SubjectText {
                    post_text,
                    ..SubjectText::default()
                })
            }
        }
    }

    async fn fetch_optional<T, F, Fut>(
        &self,
        id: i64,
        what: &str,
        fetch: F,
    ) -> Result<Option<T>, TriageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ModerationError>>,
    {
        match self.dispatcher.run(fetch).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) if e.is_not_found() => {
                debug!(event_id = id, what, "Subject content gone, continuing without text");
                Ok(None)
            }
            Err(e) => {
                warn!(event_id = id, what, error = %e, "Failed to fetch subject content, continuing without text");
                Ok(None)
            }
        }
    }
}
