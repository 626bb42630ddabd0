//! Ozone Triage: automated first-pass triage of moderation reports.

pub mod config;
pub mod error;
pub mod moderation;
pub mod pipeline;
