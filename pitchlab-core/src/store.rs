//! Persistence seam between the pipeline and the owning application.
//!
//! Sessions are owned by the calling application; the core only enriches
//! them. Every write is a partial-field update so rubric writes and batch
//! writes can interleave without clobbering each other. A backing store that
//! lacks an expected column surfaces `Error::SchemaMismatch`, which the
//! orchestrator handles via the reduced-payload downgrade.

use crate::db::SessionCandidate;
use crate::error::Result;
use crate::types::{ConversationRecord, LineRating, SessionUpdate, StoredSession};
use std::collections::BTreeMap;

pub trait SessionStore: Send + Sync {
    /// Load a session, or `None` when it does not exist.
    fn load_session(&self, id: &str) -> Result<Option<StoredSession>>;

    /// Apply a partial-field update. `Err(Error::SchemaMismatch)` when the
    /// backing schema lacks a column the payload needs.
    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<()>;

    /// Upsert line ratings by turn index: union across indices,
    /// last-write-wins per index. Idempotent under batch retry.
    fn merge_line_ratings(
        &self,
        id: &str,
        ratings: &BTreeMap<usize, LineRating>,
    ) -> Result<()>;

    /// Record completion of one batch. Idempotent per `(session, batch)`;
    /// returns the distinct completed-batch count, which is monotonic.
    fn record_batch_complete(&self, id: &str, batch_index: u32) -> Result<i32>;

    /// Candidate pool for correlation, scoped to one agent, most recent
    /// session first.
    fn sessions_for_agent(&self, agent_id: &str) -> Result<Vec<SessionCandidate>>;

    /// Store or refresh an externally delivered conversation record.
    fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()>;

    /// Back-link a conversation onto its matched session.
    fn link_conversation(&self, session_id: &str, conversation_id: &str) -> Result<()>;
}
