//! Core domain types for pitchlab
//!
//! These types model the grading pipeline's view of a practice call.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Turn** | One utterance by one speaker within a Transcript |
//! | **Rep** | The trainee running the pitch |
//! | **Homeowner** | The simulated prospect on the other side of the call |
//! | **Rubric** | Fixed scoring categories applied to every session |
//! | **Line rating** | A judgment about one specific rep turn |
//! | **Conversation record** | Externally sourced call record from the voice provider |
//!
//! Sessions are owned by the calling application; the core only enriches them
//! with metrics, rubric scores, line ratings, and a conversation link.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================
// Transcript
// ============================================

/// Who spoke a turn. Upstream labels are normalized to these two roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Rep,
    Homeowner,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Rep => "rep",
            Speaker::Homeowner => "homeowner",
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Speaker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rep" | "sales" | "salesperson" | "agent" | "user" => Ok(Speaker::Rep),
            "homeowner" | "customer" | "prospect" | "assistant" | "ai" => Ok(Speaker::Homeowner),
            other => Err(format!("unknown speaker label: {}", other)),
        }
    }
}

/// One utterance within a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    /// Utterance text; may be empty.
    #[serde(default)]
    pub text: String,
    /// Absolute instant; may be absent in upstream data.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            timestamp: None,
        }
    }
}

/// Ordered sequence of turns. Order is the canonical conversation order;
/// turns are append-only once a session ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    pub turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Iterate rep turns with their absolute turn index.
    pub fn rep_turns(&self) -> impl Iterator<Item = (usize, &Turn)> {
        self.turns
            .iter()
            .enumerate()
            .filter(|(_, t)| t.speaker == Speaker::Rep)
    }

    /// Returns a copy with missing timestamps synthesized from ordinal
    /// position, spaced evenly from `started_at` over `duration_secs`.
    pub fn with_synthesized_timestamps(
        &self,
        started_at: DateTime<Utc>,
        duration_secs: i64,
    ) -> Transcript {
        let count = self.turns.len().max(1) as i64;
        let step = duration_secs.max(0) / count;
        let turns = self
            .turns
            .iter()
            .enumerate()
            .map(|(i, t)| Turn {
                speaker: t.speaker,
                text: t.text.clone(),
                timestamp: t
                    .timestamp
                    .or_else(|| Some(started_at + Duration::seconds(step * i as i64))),
            })
            .collect();
        Transcript { turns }
    }
}

// ============================================
// Deterministic metrics
// ============================================

/// Stateless projection of a transcript. Recomputed fresh each time; never a
/// source of truth independent of the transcript that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicMetrics {
    /// Whole-word filler matches across rep turns
    pub filler_word_count: u32,
    /// Rep words per minute over total session duration, rounded
    pub words_per_minute: u32,
    /// Rep turns ending in `?` over all rep turns, as integer percent
    pub question_ratio_pct: u32,
    /// Assumptive-close phrasing matches
    pub close_attempt_count: u32,
    /// Homeowner expressed buying interest
    pub buying_signals: bool,
    /// Contact details were exchanged
    pub info_collected: bool,
    /// Spouse-approval signal present
    pub spouse_mentioned: bool,
    /// Number of rep turns
    pub rep_turn_count: u32,
    /// Whitespace-tokenized rep word count
    pub rep_word_count: u32,
}

// ============================================
// Rubric
// ============================================

/// Per-category rubric scores, each 0-100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScores {
    #[serde(default)]
    pub rapport: u8,
    #[serde(default)]
    pub discovery: u8,
    #[serde(default)]
    pub objection_handling: u8,
    #[serde(default)]
    pub closing: u8,
    #[serde(default)]
    pub safety: u8,
}

impl CategoryScores {
    /// Clamp every category into 0-100.
    pub fn clamped(self) -> Self {
        Self {
            rapport: self.rapport.min(100),
            discovery: self.discovery.min(100),
            objection_handling: self.objection_handling.min(100),
            closing: self.closing.min(100),
            safety: self.safety.min(100),
        }
    }

    pub fn overall(&self) -> u8 {
        let sum = self.rapport as u16
            + self.discovery as u16
            + self.objection_handling as u16
            + self.closing as u16
            + self.safety as u16;
        (sum / 5) as u8
    }
}

/// Coaching feedback lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub specific_tips: Vec<String>,
}

/// The LLM's structured judgment of a session. Produced once per grading
/// invocation; supersedes any prior packet for the same session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RubricPacket {
    #[serde(default)]
    pub scores: CategoryScores,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub feedback: Feedback,
    /// Line ratings keyed by absolute turn index
    #[serde(default)]
    pub line_ratings: BTreeMap<usize, LineRating>,
    /// True when only isolated sections survived repair
    #[serde(default)]
    pub partial: bool,
}

// ============================================
// Line ratings
// ============================================

/// Qualitative label for one rep turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineLabel {
    Excellent,
    Good,
    Poor,
    MissedOpportunity,
}

impl LineLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineLabel::Excellent => "excellent",
            LineLabel::Good => "good",
            LineLabel::Poor => "poor",
            LineLabel::MissedOpportunity => "missed_opportunity",
        }
    }
}

impl std::str::FromStr for LineLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "excellent" => Ok(LineLabel::Excellent),
            "good" => Ok(LineLabel::Good),
            "poor" | "bad" => Ok(LineLabel::Poor),
            "missed_opportunity" | "missed opportunity" | "missed" => {
                Ok(LineLabel::MissedOpportunity)
            }
            other => Err(format!("unknown line label: {}", other)),
        }
    }
}

/// A judgment about one specific rep turn.
///
/// The `source` tag is load-bearing: heuristic ratings must never be mistaken
/// for LLM-derived ones, and a per-line LLM failure is recorded as `Failed`
/// rather than aborting the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum LineRating {
    /// Rated by the language model (directly or via cache)
    Llm {
        label: LineLabel,
        #[serde(default)]
        rationale: Option<String>,
        #[serde(default)]
        alternatives: Vec<String>,
    },
    /// Approximate label from the local lexical fallback
    Heuristic {
        label: LineLabel,
        #[serde(default)]
        rationale: Option<String>,
    },
    /// Rating attempt failed; kept as a marker so the batch can continue
    Failed { error: String },
}

impl LineRating {
    pub fn label(&self) -> Option<LineLabel> {
        match self {
            LineRating::Llm { label, .. } | LineRating::Heuristic { label, .. } => Some(*label),
            LineRating::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LineRating::Failed { .. })
    }
}

// ============================================
// Conversation records
// ============================================

/// Externally sourced call record delivered by the voice provider's webhook.
/// May arrive before, during, or after the internal session lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Provider-assigned conversation id
    pub conversation_id: String,
    /// Provider-side agent id
    pub agent_id: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Provider's transcript backup, kept opaque
    #[serde(default)]
    pub transcript: Option<serde_json::Value>,
    /// Provider's analysis blob, kept opaque
    #[serde(default)]
    pub analysis: Option<serde_json::Value>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

// ============================================
// Sessions (enriched, never created, by the core)
// ============================================

/// A practice session as persisted by the owning application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub user_id: String,
    /// Voice-provider agent id used for this session, if any
    pub agent_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Total session duration in seconds
    pub duration_secs: i64,
    pub transcript: Transcript,
    pub scores: Option<CategoryScores>,
    pub summary: Option<String>,
    pub feedback: Option<Feedback>,
    /// Line ratings accumulated across batches, keyed by turn index
    pub line_ratings: BTreeMap<usize, LineRating>,
    /// Distinct completed line-rating batches
    pub rated_batches: i32,
    /// Declared batch total for the current line-rating job
    pub total_batches: Option<i32>,
    /// Foreign reference once correlated
    pub conversation_id: Option<String>,
    /// Opaque analytics blob; the reduced-payload write targets only this
    pub analytics: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

impl StoredSession {
    /// True once the completed batch count reaches the declared total.
    pub fn all_batches_complete(&self) -> bool {
        match self.total_batches {
            Some(total) => total > 0 && self.rated_batches >= total,
            None => false,
        }
    }
}

/// Partial-field update payload for a session.
///
/// Only `Some` fields are written; the persistence layer never overwrites the
/// whole record. `reduced()` is the downgrade payload used when the full
/// write hits a schema mismatch.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub scores: Option<CategoryScores>,
    pub summary: Option<String>,
    pub feedback: Option<Feedback>,
    pub metrics: Option<DeterministicMetrics>,
    pub line_ratings: Option<BTreeMap<usize, LineRating>>,
    pub analytics: Option<serde_json::Value>,
    pub conversation_id: Option<String>,
    pub total_batches: Option<i32>,
}

impl SessionUpdate {
    /// The smallest payload guaranteed to persist: one opaque analytics blob
    /// carrying the entire grading result.
    pub fn reduced(analytics: serde_json::Value) -> Self {
        Self {
            analytics: Some(analytics),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_none()
            && self.summary.is_none()
            && self.feedback.is_none()
            && self.metrics.is_none()
            && self.line_ratings.is_none()
            && self.analytics.is_none()
            && self.conversation_id.is_none()
            && self.total_batches.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn speaker_normalizes_upstream_labels() {
        assert_eq!(Speaker::from_str("Rep").unwrap(), Speaker::Rep);
        assert_eq!(Speaker::from_str("user").unwrap(), Speaker::Rep);
        assert_eq!(Speaker::from_str("customer").unwrap(), Speaker::Homeowner);
        assert_eq!(Speaker::from_str("assistant").unwrap(), Speaker::Homeowner);
        assert!(Speaker::from_str("narrator").is_err());
    }

    #[test]
    fn line_rating_serializes_with_source_tag() {
        let llm = LineRating::Llm {
            label: LineLabel::Excellent,
            rationale: None,
            alternatives: vec!["Try this".to_string()],
        };
        let value = serde_json::to_value(&llm).unwrap();
        assert_eq!(value["source"], "llm");
        assert_eq!(value["label"], "excellent");

        let heuristic = LineRating::Heuristic {
            label: LineLabel::Poor,
            rationale: Some("hedging".to_string()),
        };
        let value = serde_json::to_value(&heuristic).unwrap();
        assert_eq!(value["source"], "heuristic");

        let failed = LineRating::Failed {
            error: "llm timeout".to_string(),
        };
        assert!(failed.is_failed());
        assert_eq!(failed.label(), None);
    }

    #[test]
    fn synthesized_timestamps_fill_gaps_only() {
        let started = Utc::now();
        let explicit = started + Duration::seconds(42);
        let transcript = Transcript::new(vec![
            Turn::new(Speaker::Rep, "Hi"),
            Turn {
                speaker: Speaker::Homeowner,
                text: "Hello".to_string(),
                timestamp: Some(explicit),
            },
            Turn::new(Speaker::Rep, "Great day"),
        ]);

        let filled = transcript.with_synthesized_timestamps(started, 90);
        assert_eq!(filled.turns[0].timestamp, Some(started));
        assert_eq!(filled.turns[1].timestamp, Some(explicit));
        assert_eq!(
            filled.turns[2].timestamp,
            Some(started + Duration::seconds(60))
        );
    }

    #[test]
    fn scores_clamp_and_average() {
        let scores = CategoryScores {
            rapport: 120,
            discovery: 80,
            objection_handling: 60,
            closing: 40,
            safety: 100,
        }
        .clamped();
        assert_eq!(scores.rapport, 100);
        assert_eq!(scores.overall(), 76);
    }

    #[test]
    fn all_batches_complete_requires_declared_total() {
        let mut session = test_session();
        assert!(!session.all_batches_complete());
        session.total_batches = Some(3);
        session.rated_batches = 2;
        assert!(!session.all_batches_complete());
        session.rated_batches = 3;
        assert!(session.all_batches_complete());
    }

    fn test_session() -> StoredSession {
        StoredSession {
            id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            agent_id: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: 0,
            transcript: Transcript::default(),
            scores: None,
            summary: None,
            feedback: None,
            line_ratings: BTreeMap::new(),
            rated_batches: 0,
            total_batches: None,
            conversation_id: None,
            analytics: None,
            metadata: serde_json::json!({}),
        }
    }
}
