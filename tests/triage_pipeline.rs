//! End-to-end triage passes against an in-memory moderation service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use ozone_triage::config::{ImportPolicy, TriageConfig};
use ozone_triage::error::{ClassifierError, ModerationError};
use ozone_triage::moderation::{
    AccountProfile, ActionKind, ActionRequest, Did, ModerationService, Page, ReportEvent, Subject,
    SubjectStatus, TimeWindow,
};
use ozone_triage::pipeline::{
    Dispatcher, PolicyClassifier, RuleEngine, TriageDecision, TriageProcessor, TriageScheduler,
    spawn_triage_scheduler,
};

const IMPORTER: &str = "did:example:importer";

// ── In-memory service ───────────────────────────────────────────────

struct InMemoryService {
    events: Vec<ReportEvent>,
    statuses: Vec<SubjectStatus>,
    page_size: usize,
    /// Zero-based page index of `queryEvents` that fails.
    fail_events_page: Option<usize>,
    emit_error: Option<fn() -> ModerationError>,
    profiles: HashMap<Did, AccountProfile>,
    labels: HashMap<Did, Vec<String>>,
    emitted: Mutex<Vec<ActionRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    event_queries: AtomicUsize,
}

impl InMemoryService {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            statuses: Vec::new(),
            page_size: 3,
            fail_events_page: None,
            emit_error: None,
            profiles: HashMap::new(),
            labels: HashMap::new(),
            emitted: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            event_queries: AtomicUsize::new(0),
        }
    }

    fn profile(mut self, did: &str, description: &str) -> Self {
        self.profiles.insert(
            Did::from(did),
            AccountProfile {
                display_name: None,
                description: Some(description.to_string()),
            },
        );
        self
    }

    fn emitted(&self) -> Vec<ActionRequest> {
        self.emitted.lock().unwrap().clone()
    }

    fn emitted_for(&self, did: &str) -> Vec<ActionRequest> {
        let subject = Subject::account(did);
        self.emitted()
            .into_iter()
            .filter(|r| r.subject == subject)
            .collect()
    }

    /// Simulate a network call so concurrent callers overlap.
    async fn call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn page<T: Clone>(items: &[T], size: usize, cursor: Option<&str>) -> Page<T> {
    let start: usize = cursor.map_or(0, |c| c.parse().unwrap());
    let end = (start + size).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    Page::new(items[start..end].to_vec(), next)
}

#[async_trait]
impl ModerationService for InMemoryService {
    async fn query_events(
        &self,
        _window: &TimeWindow,
        _event_type: &str,
        cursor: Option<&str>,
    ) -> Result<Page<ReportEvent>, ModerationError> {
        self.call().await;
        let index = self.event_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_events_page == Some(index) {
            return Err(ModerationError::Transient {
                method: "queryEvents".into(),
                reason: "502 Bad Gateway".into(),
            });
        }
        Ok(page(&self.events, self.page_size, cursor))
    }

    async fn query_statuses(
        &self,
        _window: &TimeWindow,
        _review_state: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<Page<SubjectStatus>, ModerationError> {
        self.call().await;
        Ok(page(&self.statuses, self.page_size, cursor))
    }

    async fn get_account_profile(&self, did: &Did) -> Result<AccountProfile, ModerationError> {
        self.call().await;
        self.profiles
            .get(did)
            .cloned()
            .ok_or_else(|| ModerationError::NotFound {
                what: format!("profile {did}"),
            })
    }

    async fn get_record_text(&self, uri: &str) -> Result<Option<String>, ModerationError> {
        self.call().await;
        Err(ModerationError::NotFound {
            what: format!("record {uri}"),
        })
    }

    async fn get_existing_labels(&self, did: &Did) -> Result<Vec<String>, ModerationError> {
        self.call().await;
        Ok(self.labels.get(did).cloned().unwrap_or_default())
    }

    async fn emit_action(&self, request: &ActionRequest) -> Result<(), ModerationError> {
        self.call().await;
        if let Some(error) = self.emit_error {
            return Err(error());
        }
        self.emitted.lock().unwrap().push(request.clone());
        Ok(())
    }
}

struct CountingClassifier {
    categories: Vec<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl PolicyClassifier for CountingClassifier {
    async fn classify(&self, _text: &str) -> Result<Vec<String>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.categories.clone())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn report(id: i64, did: &str) -> ReportEvent {
    ReportEvent {
        id,
        subject: Subject::account(did),
        subject_handle: Some(format!("{}.example.com", id)),
        created_by: Did::from("did:example:reporter"),
        comment: None,
        report_type: Some("com.atproto.moderation.defs#reasonSpam".into()),
        tombstone: false,
        created_at: Utc::now(),
    }
}

fn status(id: i64, did: &str) -> SubjectStatus {
    SubjectStatus {
        id,
        subject: Subject::account(did),
        subject_handle: Some("someone.example.com".into()),
        takendown: false,
        review_state: Some("tools.ozone.moderation.defs#reviewOpen".into()),
        last_reported_at: Some(Utc::now()),
    }
}

fn config() -> TriageConfig {
    let mut config = TriageConfig::default();
    config.max_concurrent_items = 8;
    config.allowlisted_dids.insert(Did::from("did:example:erin"));
    config.import = Some(ImportPolicy {
        trusted_creator: Did::from(IMPORTER),
        label: "suspect-inauthentic".into(),
        source: Some("https://example.com/lists/bots".into()),
        false_positive_marker: "post with spam url associated with bot".into(),
    });
    config
}

/// One report for every terminal state, spread over several pages.
fn populated_service() -> InMemoryService {
    let mut service = InMemoryService::new()
        .profile("did:example:bob", "Join us at blueskyfollower.com #followback")
        .profile("did:example:carol", "some bio")
        .profile("did:example:erin", "blueskyfollower.com")
        .profile("did:example:frank", "blueskyfollower.com")
        .profile("did:example:hank", "just here for cats");
    service
        .labels
        .insert(Did::from("did:example:frank"), vec!["suspect-inauthentic".into()]);

    let mut tombstoned = report(1, "did:example:alice");
    tombstoned.tombstone = true;
    let follow_farming = report(2, "did:example:bob");
    let mut out_of_scope = report(3, "did:example:carol");
    out_of_scope.comment = Some("this is CSAM".into());
    let no_text = report(4, "did:example:dave");
    let allowlisted = report(5, "did:example:erin");
    let already_labeled = report(6, "did:example:frank");
    let mut imported = report(7, "did:example:gina");
    imported.created_by = Did::from(IMPORTER);
    imported.comment = Some("member of imported bot list".into());
    let escalated = report(8, "did:example:hank");

    service.events = vec![
        tombstoned,
        follow_farming,
        out_of_scope,
        no_text,
        allowlisted,
        already_labeled,
        imported,
        escalated,
    ];

    let mut taken_down = status(100, "did:example:ivan");
    taken_down.takendown = true;
    let mut invalid_handle = status(101, "did:example:judy");
    invalid_handle.subject_handle = Some("handle.invalid".into());
    service.statuses = vec![taken_down, invalid_handle, status(102, "did:example:kim")];

    service
}

fn scheduler(
    service: Arc<InMemoryService>,
    config: TriageConfig,
    ceiling: usize,
    classifier: Option<Arc<dyn PolicyClassifier>>,
) -> TriageScheduler {
    let processor = TriageProcessor::new(
        config,
        RuleEngine::default_rules(),
        service,
        Arc::new(Dispatcher::new(ceiling)),
        classifier,
    );
    TriageScheduler::new(Arc::new(processor))
}

fn window() -> TimeWindow {
    TimeWindow::ending_now(Duration::from_secs(600))
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn full_pass_reaches_every_terminal_state() {
    let service = Arc::new(populated_service());
    let classifier = Arc::new(CountingClassifier {
        categories: vec!["Spam".into()],
        calls: AtomicUsize::new(0),
    });
    let scheduler = scheduler(service.clone(), config(), 2, Some(classifier.clone()));

    let summary = scheduler.run_pass(window()).await.unwrap();

    assert_eq!(summary.events_seen, 8);
    assert_eq!(summary.statuses_seen, 3);
    assert_eq!(summary.pagination_errors, 0);
    assert_eq!(summary.items_failed, 0);
    for (decision, count) in [
        (TriageDecision::Tombstoned, 1),
        (TriageDecision::RuleMatch, 1),
        (TriageDecision::OutOfScopeComment, 1),
        (TriageDecision::NoAction, 1),
        (TriageDecision::Allowlisted, 1),
        (TriageDecision::AlreadyLabeled, 1),
        (TriageDecision::ImportedBlocklist, 1),
        (TriageDecision::Escalated, 1),
        (TriageDecision::TakenDown, 1),
        (TriageDecision::InvalidHandle, 1),
        (TriageDecision::Untouched, 1),
    ] {
        assert_eq!(summary.count(decision), count, "{decision:?}");
    }
    assert_eq!(summary.actions_emitted, 10);
    assert_eq!(service.emitted().len(), 10);

    // Tombstone: exactly one acknowledge mentioning the tombstone.
    let alice = service.emitted_for("did:example:alice");
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].kind, ActionKind::Acknowledge);
    assert!(alice[0].comment.contains("tombstoned"));

    // Follow farming: exactly one label.
    let bob = service.emitted_for("did:example:bob");
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].kind, ActionKind::Label);
    assert_eq!(bob[0].labels, vec!["follow-farming".to_string()]);

    // Out-of-scope comment: acknowledged without escalation.
    let carol = service.emitted_for("did:example:carol");
    assert_eq!(carol.len(), 1);
    assert_eq!(carol[0].kind, ActionKind::Acknowledge);

    // No text, no rule: nothing emitted.
    assert!(service.emitted_for("did:example:dave").is_empty());

    // Allowlisted: acknowledged, never labeled.
    let erin = service.emitted_for("did:example:erin");
    assert_eq!(erin.len(), 1);
    assert_eq!(erin[0].kind, ActionKind::Acknowledge);

    // Import: label first, then acknowledge.
    let gina: Vec<_> = service
        .emitted_for("did:example:gina")
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(gina, vec![ActionKind::Label, ActionKind::Acknowledge]);

    // Only the text-bearing, rule-free report was escalated.
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    let hank = service.emitted_for("did:example:hank");
    assert_eq!(hank.len(), 1);
    assert_eq!(hank[0].kind, ActionKind::Comment);
    assert!(hank[0].comment.contains("Spam"));
}

#[tokio::test]
async fn dispatcher_ceiling_holds_across_a_pass() {
    let service = Arc::new(populated_service());
    let scheduler = scheduler(service.clone(), config(), 2, None);

    scheduler.run_pass(window()).await.unwrap();

    let peak = service.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak in-flight calls {peak}");
}

#[tokio::test]
async fn pagination_failure_keeps_earlier_pages() {
    let mut service = populated_service();
    service.fail_events_page = Some(1);
    let service = Arc::new(service);
    let scheduler = scheduler(service.clone(), config(), 3, None);

    let summary = scheduler.run_pass(window()).await.unwrap();

    assert_eq!(summary.pagination_errors, 1);
    assert_eq!(summary.events_seen, 3);
    assert_eq!(summary.statuses_seen, 3);
    assert_eq!(service.emitted_for("did:example:alice").len(), 1);
    assert!(service.emitted_for("did:example:gina").is_empty());
}

#[tokio::test]
async fn emit_failures_do_not_stop_the_pass() {
    let mut service = populated_service();
    service.emit_error = Some(|| ModerationError::Transient {
        method: "emitEvent".into(),
        reason: "503 Service Unavailable".into(),
    });
    let service = Arc::new(service);
    let scheduler = scheduler(service.clone(), config(), 2, None);

    let summary = scheduler.run_pass(window()).await.unwrap();

    assert_eq!(summary.events_seen, 8);
    assert_eq!(summary.actions_emitted, 0);
    assert!(summary.actions_failed > 0);
}

#[tokio::test]
async fn auth_failure_is_fatal() {
    let mut service = populated_service();
    service.emit_error = Some(|| ModerationError::AuthFailed {
        reason: "InvalidToken".into(),
    });
    let service = Arc::new(service);
    let scheduler = scheduler(service, config(), 2, None);

    let err = scheduler.run_pass(window()).await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn scheduler_stops_on_shutdown() {
    let service = Arc::new(populated_service());
    let mut config = config();
    config.interval = Duration::from_secs(3600);
    let (handle, shutdown) = spawn_triage_scheduler(scheduler(service.clone(), config, 2, None));

    while service.event_queries.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.trigger();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stopped")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(service.event_queries.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn scheduler_stops_on_fatal_error() {
    let mut service = populated_service();
    service.emit_error = Some(|| ModerationError::AuthFailed {
        reason: "ExpiredToken".into(),
    });
    let (handle, _shutdown) =
        spawn_triage_scheduler(scheduler(Arc::new(service), config(), 2, None));

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stopped")
        .unwrap();
    assert!(result.unwrap_err().is_fatal());
}
