//! Incremental line rating.
//!
//! Rep turns are partitioned into fixed-size batches by turn order. Batches
//! may be requested in any order and retried freely: ratings merge by turn
//! index (union across batches, last-write-wins per index) and completion is
//! tracked per batch, so reprocessing is idempotent. A single line failing
//! never aborts its batch; the failure is recorded as a rating marker and the
//! rest of the batch proceeds. Only failure to read or write the session
//! itself is fatal.

use crate::cache::{normalize_phrase, PhraseCache};
use crate::error::{Error, Result};
use crate::grading::repair;
use crate::llm::LlmClient;
use crate::store::SessionStore;
use crate::types::{LineLabel, LineRating, SessionUpdate, StoredSession, Transcript};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Rep turns per batch.
pub const LINE_RATING_BATCH_SIZE: usize = 10;

const LINE_PROMPT: &str = r#"You are an expert door-to-door sales coach. Rate this single line spoken by a sales rep during a pitch.
{context}
Line: "{line}"

Respond with ONLY a JSON object in exactly this shape:
{"label": "excellent|good|poor|missed_opportunity", "rationale": "one sentence", "alternatives": ["a stronger phrasing", "another stronger phrasing"]}

Give 2-3 alternatives unless the line is excellent.
"#;

/// Optional display names that contextualize line-scoped prompts. Absent
/// names simply drop the context line.
#[derive(Debug, Clone, Default)]
pub struct SpeakerNames {
    pub rep: Option<String>,
    pub customer: Option<String>,
}

impl SpeakerNames {
    fn context_line(&self) -> String {
        match (self.rep.as_deref(), self.customer.as_deref()) {
            (Some(rep), Some(customer)) => {
                format!("The rep is {rep}, pitching homeowner {customer}.")
            }
            (Some(rep), None) => format!("The rep is {rep}."),
            (None, Some(customer)) => format!("The homeowner is {customer}."),
            (None, None) => String::new(),
        }
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Lines rated by the LLM this run
    pub newly_rated: usize,
    /// Lines satisfied from the phrase cache
    pub cache_hits: usize,
    /// Lines whose rating attempt failed (marker persisted)
    pub failed: usize,
    /// Distinct completed batches after this run
    pub completed_batches: i32,
    pub total_batches: i32,
    pub all_complete: bool,
}

/// Processes one line-rating batch at a time against a session.
pub struct LineRatingProcessor<'a> {
    store: &'a dyn SessionStore,
    cache: &'a dyn PhraseCache,
    client: &'a dyn LlmClient,
}

impl<'a> LineRatingProcessor<'a> {
    pub fn new(
        store: &'a dyn SessionStore,
        cache: &'a dyn PhraseCache,
        client: &'a dyn LlmClient,
    ) -> Self {
        Self {
            store,
            cache,
            client,
        }
    }

    /// Number of batches a transcript partitions into.
    pub fn batch_count(transcript: &Transcript) -> i32 {
        let reps = transcript.rep_turns().count();
        reps.div_ceil(LINE_RATING_BATCH_SIZE) as i32
    }

    /// Process one batch for the session. `batch_index` is zero-based.
    pub fn process_batch(
        &self,
        session_id: &str,
        batch_index: u32,
        names: &SpeakerNames,
    ) -> Result<BatchOutcome> {
        let session = self
            .store
            .load_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        if session.transcript.is_empty() {
            return Err(Error::TranscriptEmpty(session_id.to_string()));
        }

        let rep_lines: Vec<(usize, String)> = session
            .transcript
            .rep_turns()
            .map(|(idx, turn)| (idx, turn.text.clone()))
            .collect();
        let total_batches = (rep_lines.len().div_ceil(LINE_RATING_BATCH_SIZE)) as i32;

        if batch_index as i32 >= total_batches {
            return Err(Error::InvalidInput(format!(
                "batch index {} out of range (total {})",
                batch_index, total_batches
            )));
        }

        self.ensure_total_declared(&session, total_batches)?;

        let start = batch_index as usize * LINE_RATING_BATCH_SIZE;
        let end = (start + LINE_RATING_BATCH_SIZE).min(rep_lines.len());

        let mut outcome = BatchOutcome {
            total_batches,
            ..Default::default()
        };
        let mut ratings: BTreeMap<usize, LineRating> = BTreeMap::new();

        for (turn_index, text) in &rep_lines[start..end] {
            let rating = self.rate_one(text, names, &mut outcome);
            ratings.insert(*turn_index, rating);
        }

        self.store.merge_line_ratings(session_id, &ratings)?;
        outcome.completed_batches = self.store.record_batch_complete(session_id, batch_index)?;
        outcome.all_complete = outcome.completed_batches >= total_batches;

        tracing::info!(
            session_id,
            batch_index,
            newly_rated = outcome.newly_rated,
            cache_hits = outcome.cache_hits,
            failed = outcome.failed,
            completed = outcome.completed_batches,
            total = outcome.total_batches,
            "Line-rating batch done"
        );

        Ok(outcome)
    }

    fn ensure_total_declared(&self, session: &StoredSession, total: i32) -> Result<()> {
        if session.total_batches != Some(total) {
            let update = SessionUpdate {
                total_batches: Some(total),
                ..Default::default()
            };
            self.store.update_session(&session.id, &update)?;
        }
        Ok(())
    }

    /// Cache, then LLM. Failures become markers; they are never cached.
    fn rate_one(&self, text: &str, names: &SpeakerNames, outcome: &mut BatchOutcome) -> LineRating {
        let key = normalize_phrase(text);
        if key.is_empty() {
            outcome.failed += 1;
            return LineRating::Failed {
                error: "empty line".to_string(),
            };
        }

        match self.cache.get(&key) {
            Ok(Some(hit)) => {
                outcome.cache_hits += 1;
                return hit;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Phrase cache error, treating as miss");
            }
        }

        match self.rate_via_llm(text, names) {
            Ok(rating) => {
                outcome.newly_rated += 1;
                if let Err(e) = self.cache.put(&key, &rating) {
                    tracing::warn!(error = %e, "Failed to cache line rating");
                }
                rating
            }
            Err(e) => {
                tracing::warn!(error = %e, line = text, "Line rating failed");
                outcome.failed += 1;
                LineRating::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn rate_via_llm(&self, text: &str, names: &SpeakerNames) -> Result<LineRating> {
        let prompt = LINE_PROMPT
            .replace("{context}", &names.context_line())
            .replace("{line}", &text.replace('"', "'"));
        let response = self.client.complete(&prompt)?;
        let value = repair::parse_lenient(&response)
            .ok_or_else(|| Error::LlmShape("unparsable line rating".to_string()))?;

        let label_str = value
            .get("label")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::LlmShape("line rating missing label".to_string()))?;
        let label = LineLabel::from_str(label_str)
            .map_err(|e| Error::LlmShape(format!("bad line label: {e}")))?;

        let rationale = value
            .get("rationale")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let alternatives = value
            .get("alternatives")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(LineRating::Llm {
            label,
            rationale,
            alternatives,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPhraseCache;
    use crate::db::Database;
    use crate::types::{Speaker, Transcript, Turn};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        response: String,
    }

    impl CountingClient {
        fn good() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response:
                    r#"{"label": "good", "rationale": "solid", "alternatives": ["Try asking a question"]}"#
                        .to_string(),
            }
        }

        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LlmClient for CountingClient {
        fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    struct RecordingClient {
        prompts: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self {
                prompts: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl LlmClient for RecordingClient {
        fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(r#"{"label": "good", "rationale": "solid", "alternatives": []}"#.to_string())
        }
    }

    struct FailingClient;

    impl LlmClient for FailingClient {
        fn complete(&self, _prompt: &str) -> Result<String> {
            Err(Error::GradingUnavailable("connection refused".to_string()))
        }
    }

    fn seed_session(db: &Database, id: &str, rep_lines: &[&str]) {
        let turns: Vec<Turn> = rep_lines
            .iter()
            .flat_map(|line| {
                vec![
                    Turn::new(Speaker::Rep, *line),
                    Turn::new(Speaker::Homeowner, "mm-hm"),
                ]
            })
            .collect();
        let session = StoredSession {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            agent_id: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: 300,
            transcript: Transcript::new(turns),
            scores: None,
            summary: None,
            feedback: None,
            line_ratings: BTreeMap::new(),
            rated_batches: 0,
            total_batches: None,
            conversation_id: None,
            analytics: None,
            metadata: serde_json::json!({}),
        };
        db.upsert_session(&session).unwrap();
    }

    fn lines(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("This is distinct pitch line number {} with enough words", i))
            .collect()
    }

    #[test]
    fn batches_partition_by_rep_turn_count() {
        let t = |n: usize| {
            Transcript::new(
                (0..n)
                    .map(|_| Turn::new(Speaker::Rep, "line"))
                    .collect(),
            )
        };
        assert_eq!(LineRatingProcessor::batch_count(&t(0)), 0);
        assert_eq!(LineRatingProcessor::batch_count(&t(1)), 1);
        assert_eq!(LineRatingProcessor::batch_count(&t(10)), 1);
        assert_eq!(LineRatingProcessor::batch_count(&t(11)), 2);
        assert_eq!(LineRatingProcessor::batch_count(&t(60)), 6);
    }

    #[test]
    fn single_batch_rates_and_completes() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let all = lines(3);
        seed_session(&db, "s1", &all.iter().map(String::as_str).collect::<Vec<_>>());

        let cache = MemoryPhraseCache::new();
        let client = CountingClient::good();
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        let outcome = processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();
        assert_eq!(outcome.newly_rated, 3);
        assert_eq!(outcome.cache_hits, 0);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.completed_batches, 1);
        assert!(outcome.all_complete);

        let session = db.load_session("s1").unwrap().unwrap();
        assert_eq!(session.line_ratings.len(), 3);
        assert_eq!(session.total_batches, Some(1));
        assert!(session.all_batches_complete());
    }

    #[test]
    fn out_of_order_batches_union_by_turn_index() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        // 25 rep lines -> 3 batches
        let all = lines(25);
        seed_session(&db, "s1", &all.iter().map(String::as_str).collect::<Vec<_>>());

        let cache = MemoryPhraseCache::new();
        let client = CountingClient::good();
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        for index in [2, 0, 1] {
            processor.process_batch("s1", index, &SpeakerNames::default()).unwrap();
        }

        let session = db.load_session("s1").unwrap().unwrap();
        assert_eq!(session.line_ratings.len(), 25);
        assert_eq!(session.rated_batches, 3);
        assert!(session.all_batches_complete());
        // rep turns sit at even indices in the seeded transcript
        assert!(session.line_ratings.keys().all(|k| k % 2 == 0));
    }

    #[test]
    fn reprocessing_a_batch_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let all = lines(4);
        seed_session(&db, "s1", &all.iter().map(String::as_str).collect::<Vec<_>>());

        let cache = MemoryPhraseCache::new();
        let client = CountingClient::good();
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        let first = processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();
        let second = processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();

        assert_eq!(first.completed_batches, 1);
        assert_eq!(second.completed_batches, 1);
        // second pass is all cache hits
        assert_eq!(second.cache_hits, 4);
        assert_eq!(second.newly_rated, 0);

        let session = db.load_session("s1").unwrap().unwrap();
        assert_eq!(session.line_ratings.len(), 4);
        assert_eq!(session.rated_batches, 1);
    }

    #[test]
    fn equal_normalizing_lines_hit_the_cache() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        seed_session(
            &db,
            "s1",
            &[
                "Does that work for you?",
                "  does THAT   work for you?  ",
            ],
        );

        let cache = MemoryPhraseCache::new();
        let client = CountingClient::good();
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        let outcome = processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();
        assert_eq!(client.count(), 1);
        assert_eq!(outcome.newly_rated, 1);
        assert_eq!(outcome.cache_hits, 1);
    }

    #[test]
    fn speaker_names_reach_the_line_prompt() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        seed_session(&db, "s1", &["Can we count on your support today?"]);

        let cache = MemoryPhraseCache::new();
        let client = RecordingClient::new();
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        let names = SpeakerNames {
            rep: Some("Jordan".to_string()),
            customer: Some("Mrs. Alvarez".to_string()),
        };
        processor.process_batch("s1", 0, &names).unwrap();

        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Jordan"));
        assert!(prompts[0].contains("Mrs. Alvarez"));
        assert!(!prompts[0].contains("{context}"));
    }

    #[test]
    fn absent_names_leave_no_placeholder_behind() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        seed_session(&db, "s1", &["Can we count on your support today?"]);

        let cache = MemoryPhraseCache::new();
        let client = RecordingClient::new();
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();

        let prompts = client.prompts.lock().unwrap();
        assert!(!prompts[0].contains("{context}"));
    }

    #[test]
    fn line_failures_become_markers_not_errors() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let all = lines(2);
        seed_session(&db, "s1", &all.iter().map(String::as_str).collect::<Vec<_>>());

        let cache = MemoryPhraseCache::new();
        let client = FailingClient;
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        let outcome = processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.completed_batches, 1);

        let session = db.load_session("s1").unwrap().unwrap();
        assert!(session.line_ratings.values().all(|r| r.is_failed()));
        // failures are never cached
        assert!(cache.is_empty());
    }

    #[test]
    fn retry_after_failure_overwrites_markers() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let all = lines(2);
        seed_session(&db, "s1", &all.iter().map(String::as_str).collect::<Vec<_>>());

        let cache = MemoryPhraseCache::new();
        let failing = FailingClient;
        let processor = LineRatingProcessor::new(&db, &cache, &failing);
        processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();

        let good = CountingClient::good();
        let processor = LineRatingProcessor::new(&db, &cache, &good);
        processor.process_batch("s1", 0, &SpeakerNames::default()).unwrap();

        let session = db.load_session("s1").unwrap().unwrap();
        assert!(session.line_ratings.values().all(|r| !r.is_failed()));
    }

    #[test]
    fn unknown_session_and_bad_index_are_errors() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let cache = MemoryPhraseCache::new();
        let client = CountingClient::good();
        let processor = LineRatingProcessor::new(&db, &cache, &client);

        assert!(matches!(
            processor.process_batch("missing", 0, &SpeakerNames::default()),
            Err(Error::SessionNotFound(_))
        ));

        let all = lines(2);
        seed_session(&db, "s1", &all.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(matches!(
            processor.process_batch("s1", 5, &SpeakerNames::default()),
            Err(Error::InvalidInput(_))
        ));
    }
}
