//! Session lifecycle: submission, background processing, pause/resume and
//! cancellation.
//!
//! [`InvestigationService`] is the entry point. It owns one background task
//! per running session and coordinates cancellation tokens, the in-flight
//! alert registry and pause bookkeeping.

mod cancel;
mod dedup;
mod pause;
mod service;

pub use cancel::CancellationManager;
pub use dedup::{alert_fingerprint, AlertDeduplicator};
pub use pause::PauseResumeCoordinator;
pub use service::{CancelOutcome, InvestigationService, SessionDetail, ORPHAN_ERROR_MESSAGE};
