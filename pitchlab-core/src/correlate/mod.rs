//! Conversation correlation.
//!
//! Voice-provider conversation records arrive over a webhook with their own
//! ids and timestamps; internal sessions carry ours. Correlation pairs the
//! two by agent id plus time proximity. A record that matches nothing is a
//! valid outcome, not an error, and selection is deterministic under ties.

use crate::error::Result;
use crate::store::SessionStore;
use crate::types::ConversationRecord;
use chrono::{DateTime, Duration, Utc};

/// Padding added to both ends of the session span, inclusive.
pub const CORRELATION_WINDOW_SECS: i64 = 5 * 60;

/// Start distance at or under this upgrades a start match to high confidence.
pub const TIGHT_START_OVERLAP_SECS: i64 = 60;

/// How sure we are that a conversation belongs to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    /// End-time proximity only; reported but not linked
    Low,
    /// Start times within the window
    Medium,
    /// Start times within the tight overlap
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

/// Result of correlating one conversation record.
#[derive(Debug, Clone, Default)]
pub struct CorrelationOutcome {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub confidence: Option<Confidence>,
    /// True when the match was persisted onto the session
    pub linked: bool,
}

impl CorrelationOutcome {
    pub fn matched(&self) -> bool {
        self.session_id.is_some()
    }

    /// Whether the match is strong enough to persist. Low-confidence matches
    /// are informational only.
    pub fn should_link(&self) -> bool {
        matches!(
            self.confidence,
            Some(Confidence::High) | Some(Confidence::Medium)
        )
    }
}

struct Candidate {
    session_id: String,
    user_id: String,
    started_at: DateTime<Utc>,
    confidence: Confidence,
}

/// Pairs webhook conversation records with internal sessions.
pub struct ConversationCorrelator<'a> {
    store: &'a dyn SessionStore,
}

impl<'a> ConversationCorrelator<'a> {
    pub fn new(store: &'a dyn SessionStore) -> Self {
        Self { store }
    }

    /// Find the best session match without persisting anything.
    pub fn correlate(&self, record: &ConversationRecord) -> Result<CorrelationOutcome> {
        if record.started_at.is_none() && record.ended_at.is_none() {
            tracing::debug!(
                conversation_id = %record.conversation_id,
                "Conversation carries no timestamps, skipping correlation"
            );
            return Ok(CorrelationOutcome::default());
        }

        let window = Duration::seconds(CORRELATION_WINDOW_SECS);
        let tight = Duration::seconds(TIGHT_START_OVERLAP_SECS);

        let mut matches: Vec<Candidate> = Vec::new();
        for session in self.store.sessions_for_agent(&record.agent_id)? {
            // Padded span: the whole session plus the window on both sides,
            // boundaries inclusive. A start anywhere inside it matches; an
            // end inside it is at best a loose attribution.
            let session_end = session.ended_at.unwrap_or(session.started_at);
            let lo = session.started_at - window;
            let hi = session_end + window;
            let inside = |t: DateTime<Utc>| t >= lo && t <= hi;

            let confidence = match record.started_at {
                Some(conv_start) if inside(conv_start) => {
                    if abs_gap(conv_start, session.started_at) <= tight {
                        Confidence::High
                    } else {
                        Confidence::Medium
                    }
                }
                _ => match record.ended_at {
                    Some(conv_end) if inside(conv_end) => Confidence::Low,
                    _ => continue,
                },
            };
            matches.push(Candidate {
                session_id: session.session_id,
                user_id: session.user_id,
                started_at: session.started_at,
                confidence,
            });
        }

        // highest confidence, then most recent session, then id
        matches.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then(b.started_at.cmp(&a.started_at))
                .then(a.session_id.cmp(&b.session_id))
        });

        Ok(match matches.into_iter().next() {
            Some(best) => CorrelationOutcome {
                session_id: Some(best.session_id),
                user_id: Some(best.user_id),
                confidence: Some(best.confidence),
                linked: false,
            },
            None => CorrelationOutcome::default(),
        })
    }

    /// Correlate and, for high or medium confidence, persist the link both
    /// ways. Low-confidence matches are reported but never linked.
    pub fn correlate_and_link(&self, record: &ConversationRecord) -> Result<CorrelationOutcome> {
        let mut outcome = self.correlate(record)?;

        if outcome.should_link() {
            if let Some(session_id) = &outcome.session_id {
                self.store
                    .link_conversation(session_id, &record.conversation_id)?;
                outcome.linked = true;
                tracing::info!(
                    conversation_id = %record.conversation_id,
                    session_id = %session_id,
                    confidence = outcome.confidence.map(|c| c.as_str()).unwrap_or("none"),
                    "Linked conversation to session"
                );
            }
        } else if outcome.matched() {
            tracing::info!(
                conversation_id = %record.conversation_id,
                session_id = outcome.session_id.as_deref().unwrap_or(""),
                "Low-confidence match, not linking"
            );
        } else {
            tracing::info!(
                conversation_id = %record.conversation_id,
                "No session matched conversation"
            );
        }

        Ok(outcome)
    }
}

fn abs_gap(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    if a >= b {
        a - b
    } else {
        b - a
    }
}
