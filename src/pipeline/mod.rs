//! Report triage pipeline.
//!
//! Every pass flows through:
//! 1. `paginate()`: lazy cursor streams of statuses and report events
//! 2. `TriageProcessor`: the fixed-order decision procedure per item
//! 3. `RuleEngine::evaluate_text()`: regex rules over profile or post text
//! 4. `PolicyClassifier::classify()`: external escalation when no rule fired
//! 5. `Dispatcher`: bounded concurrency for every moderation-service call
//!
//! `TriageScheduler` drives passes on a fixed interval.

pub mod dispatcher;
pub mod escalation;
pub mod paginate;
pub mod rules;
pub mod scheduler;
pub mod triage;

pub use dispatcher::Dispatcher;
pub use escalation::{HttpPolicyClassifier, PolicyClassifier};
pub use rules::{RuleEngine, RuleField, SubjectText};
pub use scheduler::{PassSummary, Shutdown, TriageScheduler, spawn_triage_scheduler};
pub use triage::{TriageDecision, TriageOutcome, TriageProcessor};
