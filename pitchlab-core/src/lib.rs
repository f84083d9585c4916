//! # pitchlab-core
//!
//! Core library for pitchlab: grading and analytics for door-to-door sales
//! practice sessions.
//!
//! The pipeline takes a finished practice call and enriches the stored
//! session in stages:
//!
//! - **metrics**: deterministic linguistic metrics computed locally
//! - **grading**: one LLM call producing rubric scores, a summary, coaching
//!   feedback, and line ratings, parsed leniently with truncation repair
//! - **batch**: incremental per-line rating in fixed batches, backed by a
//!   cross-session phrase cache
//! - **correlate** / **webhook**: pairing provider conversation records with
//!   internal sessions
//! - **orchestrator**: the load/metrics/grade/persist flow with the
//!   reduced-payload downgrade and a wall-clock budget
//!
//! Persistence is SQLite behind the [`store::SessionStore`] seam; sessions
//! themselves are owned by the calling application and only ever partially
//! updated here.

pub mod batch;
pub mod cache;
pub mod config;
pub mod correlate;
pub mod db;
pub mod error;
pub mod grading;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod store;
pub mod types;
pub mod webhook;

pub use batch::{BatchOutcome, LineRatingProcessor, SpeakerNames, LINE_RATING_BATCH_SIZE};
pub use cache::{
    normalize_phrase, AttemptContextCache, DegradingPhraseCache, PhraseCache, SqlitePhraseCache,
};
pub use config::Config;
pub use correlate::{Confidence, ConversationCorrelator, CorrelationOutcome};
pub use db::Database;
pub use error::{Error, ErrorCategory, Result};
pub use grading::{GradeOutcome, RubricGrader};
pub use llm::{LlmClient, RetryPolicy};
pub use orchestrator::{GradingOrchestrator, GradingReport};
pub use store::SessionStore;
pub use types::{
    CategoryScores, ConversationRecord, DeterministicMetrics, Feedback, LineLabel, LineRating,
    RubricPacket, Speaker, StoredSession, Transcript, Turn,
};
pub use webhook::{SignatureStatus, WebhookHandler};
