//! End-to-end session grading.
//!
//! Load, compute metrics, grade, persist. The persist step degrades when the
//! owning application's schema lags: on a schema mismatch the full update is
//! retried as a reduced payload (the complete result packed into the opaque
//! analytics column) and the run is flagged as downgraded. The whole run is
//! bounded by a wall-clock budget checked between stages; an exceeded budget
//! surfaces as a timeout rather than a hung request.

use crate::config::GradingConfig;
use crate::db::{Database, GradingRunRecord, GradingRunStatus};
use crate::error::{Error, Result};
use crate::grading::RubricGrader;
use crate::llm::LlmClient;
use crate::metrics;
use crate::store::SessionStore;
use crate::types::SessionUpdate;
use chrono::Utc;
use serde_json::json;
use std::time::{Duration, Instant};

/// What a completed grading run produced.
#[derive(Debug, Clone)]
pub struct GradingReport {
    pub session_id: String,
    pub scores: crate::types::CategoryScores,
    pub overall: u8,
    pub summary: String,
    /// Packet was assembled from isolated sections after a failed full parse
    pub partial: bool,
    /// Reduced-payload fallback was used to persist the result
    pub downgraded: bool,
    pub line_ratings: usize,
    pub duration_ms: i64,
}

/// Runs the full grading pipeline for one session.
pub struct GradingOrchestrator<'a> {
    db: &'a Database,
    client: &'a dyn LlmClient,
    config: GradingConfig,
}

impl<'a> GradingOrchestrator<'a> {
    pub fn new(db: &'a Database, client: &'a dyn LlmClient, config: GradingConfig) -> Self {
        Self { db, client, config }
    }

    pub fn grade_session(&self, session_id: &str) -> Result<GradingReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let budget = Duration::from_secs(self.config.budget_secs);

        let result = self.run(session_id, clock, budget);

        let (status, error_message, prompt_hash, downgraded) = match &result {
            Ok(report) => (
                GradingRunStatus::Success,
                None,
                Some(report.1.clone()),
                report.0.downgraded,
            ),
            Err(Error::Timeout(msg)) => {
                (GradingRunStatus::Timeout, Some(msg.clone()), None, false)
            }
            Err(e) => (GradingRunStatus::Error, Some(e.to_string()), None, false),
        };

        let run = GradingRunRecord {
            session_id: session_id.to_string(),
            kind: "rubric".to_string(),
            started_at,
            duration_ms: clock.elapsed().as_millis() as i64,
            status,
            error_message,
            prompt_hash,
            downgraded,
        };
        if let Err(e) = self.db.insert_grading_run(&run) {
            tracing::warn!(error = %e, session_id, "Failed to record grading run");
        }

        result.map(|(report, _)| report)
    }

    fn run(
        &self,
        session_id: &str,
        clock: Instant,
        budget: Duration,
    ) -> Result<(GradingReport, String)> {
        let session = self
            .db
            .load_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.transcript.is_empty() {
            return Err(Error::TranscriptEmpty(session_id.to_string()));
        }

        check_budget(clock, budget, "before metrics")?;
        let computed = metrics::extract(&session.transcript, session.duration_secs);

        check_budget(clock, budget, "before grading")?;
        let grader = RubricGrader::new(self.client);
        let outcome = grader.grade(&session.transcript, &computed)?;
        let packet = outcome.packet;
        let scores = packet.scores.clamped();

        check_budget(clock, budget, "before persist")?;

        // The analytics blob carries the entire result so the reduced write
        // loses nothing except queryability.
        let analytics = json!({
            "graded_at": Utc::now().to_rfc3339(),
            "scores": scores,
            "overall": scores.overall(),
            "summary": packet.summary,
            "feedback": packet.feedback,
            "metrics": computed,
            "line_ratings": packet.line_ratings,
            "partial": packet.partial,
        });

        let full = SessionUpdate {
            scores: Some(scores),
            summary: Some(packet.summary.clone()),
            feedback: Some(packet.feedback.clone()),
            metrics: Some(computed.clone()),
            line_ratings: Some(packet.line_ratings.clone()),
            analytics: Some(analytics.clone()),
            ..Default::default()
        };

        let downgraded = match self.db.update_session(session_id, &full) {
            Ok(()) => false,
            Err(Error::SchemaMismatch(detail)) => {
                tracing::warn!(
                    session_id,
                    detail,
                    "Full grading write hit a schema mismatch, retrying reduced payload"
                );
                self.db
                    .update_session(session_id, &SessionUpdate::reduced(analytics))?;
                true
            }
            Err(e) => return Err(e),
        };

        let report = GradingReport {
            session_id: session_id.to_string(),
            scores,
            overall: scores.overall(),
            summary: packet.summary,
            partial: packet.partial,
            downgraded,
            line_ratings: packet.line_ratings.len(),
            duration_ms: clock.elapsed().as_millis() as i64,
        };

        tracing::info!(
            session_id,
            overall = report.overall,
            partial = report.partial,
            downgraded = report.downgraded,
            duration_ms = report.duration_ms,
            "Session graded"
        );

        Ok((report, outcome.prompt_hash))
    }
}

fn check_budget(clock: Instant, budget: Duration, stage: &str) -> Result<()> {
    if clock.elapsed() >= budget {
        return Err(Error::Timeout(format!(
            "grading budget of {}s exhausted {}",
            budget.as_secs(),
            stage
        )));
    }
    Ok(())
}
