//! Rubric grading.
//!
//! One LLM call per session produces category scores, a summary, coaching
//! feedback, and optionally per-line ratings. The response is parsed
//! leniently (see [`repair`]) and degraded in stages: full packet, repaired
//! packet, isolated sections, and finally an error only when nothing usable
//! survives. Line ratings from the model are adopted verbatim or not at all;
//! a missing or malformed list falls back to the lexical rater in
//! [`heuristic`], never to a mix of the two.

pub mod heuristic;
pub mod repair;

use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::types::{
    CategoryScores, DeterministicMetrics, Feedback, LineLabel, LineRating, RubricPacket,
    Transcript,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Upper bound on prompt size; transcript rendering is cut at a char
/// boundary below this before interpolation.
const MAX_TRANSCRIPT_CHARS: usize = 12_000;

const RUBRIC_PROMPT: &str = r#"You are an expert door-to-door sales coach. Grade the following practice pitch transcript.

Respond with ONLY a JSON object, no markdown, in exactly this shape:
{
  "scores": {"rapport": 0-100, "discovery": 0-100, "objection_handling": 0-100, "closing": 0-100, "safety": 0-100},
  "summary": "two or three sentences on the overall performance",
  "feedback": {"strengths": ["..."], "improvements": ["..."], "specific_tips": ["..."]},
  "line_ratings": {"<turn index>": {"label": "excellent|good|poor|missed_opportunity", "rationale": "...", "alternatives": ["..."]}}
}

Rate only the rep's turns in line_ratings, keyed by the turn index shown in the transcript.

Conversation metrics (computed, trustworthy):
{metrics}

Transcript (index: speaker: text):
{transcript}
"#;

/// Result of one grading invocation.
#[derive(Debug)]
pub struct GradeOutcome {
    pub packet: RubricPacket,
    /// Hex SHA-256 of the exact prompt sent, for run observability
    pub prompt_hash: String,
}

/// Grades a session transcript against the fixed rubric via one LLM call.
pub struct RubricGrader<'a> {
    client: &'a dyn LlmClient,
}

impl<'a> RubricGrader<'a> {
    pub fn new(client: &'a dyn LlmClient) -> Self {
        Self { client }
    }

    pub fn grade(
        &self,
        transcript: &Transcript,
        metrics: &DeterministicMetrics,
    ) -> Result<GradeOutcome> {
        if transcript.is_empty() {
            return Err(Error::InvalidInput(
                "cannot grade an empty transcript".to_string(),
            ));
        }

        let prompt = build_prompt(transcript, metrics)?;
        let prompt_hash = hash_prompt(&prompt);

        let response = self.client.complete(&prompt)?;
        let packet = packet_from_response(&response, transcript)?;

        tracing::info!(
            overall = packet.scores.overall(),
            partial = packet.partial,
            line_ratings = packet.line_ratings.len(),
            "Rubric grading complete"
        );

        Ok(GradeOutcome {
            packet,
            prompt_hash,
        })
    }
}

pub fn build_prompt(
    transcript: &Transcript,
    metrics: &DeterministicMetrics,
) -> Result<String> {
    let mut rendered = String::new();
    for (idx, turn) in transcript.turns.iter().enumerate() {
        let line = format!("{}: {}: {}\n", idx, turn.speaker, turn.text);
        if rendered.len() + line.len() > MAX_TRANSCRIPT_CHARS {
            rendered.push_str("[transcript truncated]\n");
            break;
        }
        rendered.push_str(&line);
    }

    let metrics_json = serde_json::to_string_pretty(metrics)?;
    Ok(RUBRIC_PROMPT
        .replace("{metrics}", &metrics_json)
        .replace("{transcript}", &rendered))
}

pub fn hash_prompt(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse ladder: lenient full parse, then isolated sections, then error.
fn packet_from_response(response: &str, transcript: &Transcript) -> Result<RubricPacket> {
    if let Some(value) = repair::parse_lenient(response) {
        // guard against latching onto some embedded object that is not the packet
        let known_keys = ["scores", "summary", "feedback", "line_ratings"];
        if known_keys.iter().any(|k| value.get(k).is_some()) {
            return Ok(packet_from_value(&value, transcript));
        }
    }

    let scores = repair::extract_section(response, "scores");
    let summary = repair::extract_section(response, "summary");
    let feedback = repair::extract_section(response, "feedback");

    if scores.is_none() && summary.is_none() && feedback.is_none() {
        return Err(Error::LlmShape(
            "no parsable rubric sections in response".to_string(),
        ));
    }

    tracing::warn!("Full rubric parse failed; using partial section extraction");
    Ok(RubricPacket {
        scores: scores.as_ref().map(scores_from_value).unwrap_or_default(),
        summary: summary
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        feedback: feedback.as_ref().map(feedback_from_value).unwrap_or_default(),
        line_ratings: heuristic::rate_transcript(transcript),
        partial: true,
    })
}

fn packet_from_value(value: &Value, transcript: &Transcript) -> RubricPacket {
    let scores = value
        .get("scores")
        .map(scores_from_value)
        .unwrap_or_default();
    let summary = value
        .get("summary")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let feedback = value
        .get("feedback")
        .map(feedback_from_value)
        .unwrap_or_default();

    let line_ratings = match value.get("line_ratings").and_then(llm_line_ratings) {
        Some(ratings) if !ratings.is_empty() => ratings,
        _ => heuristic::rate_transcript(transcript),
    };

    RubricPacket {
        scores,
        summary,
        feedback,
        line_ratings,
        partial: false,
    }
}

fn scores_from_value(value: &Value) -> CategoryScores {
    let get = |name: &str| -> u8 {
        value
            .get(name)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            .min(100) as u8
    };
    CategoryScores {
        rapport: get("rapport"),
        discovery: get("discovery"),
        objection_handling: get("objection_handling"),
        closing: get("closing"),
        safety: get("safety"),
    }
}

fn feedback_from_value(value: &Value) -> Feedback {
    let list = |name: &str| -> Vec<String> {
        value
            .get(name)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    Feedback {
        strengths: list("strengths"),
        improvements: list("improvements"),
        specific_tips: list("specific_tips"),
    }
}

/// Adopt the model's line ratings verbatim, but only if every entry is well
/// formed. One bad index or label discards the whole list.
fn llm_line_ratings(value: &Value) -> Option<BTreeMap<usize, LineRating>> {
    let object = value.as_object()?;
    let mut ratings = BTreeMap::new();

    for (key, entry) in object {
        let index: usize = key.trim().parse().ok()?;
        let label = LineLabel::from_str(entry.get("label")?.as_str()?).ok()?;
        let rationale = entry
            .get("rationale")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let alternatives = entry
            .get("alternatives")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        ratings.insert(
            index,
            LineRating::Llm {
                label,
                rationale,
                alternatives,
            },
        );
    }
    Some(ratings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Speaker, Turn};
    use std::sync::Mutex;

    struct MockClient {
        responses: Mutex<Vec<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn returning(response: &str) -> Self {
            Self {
                responses: Mutex::new(vec![Ok(response.to_string())]),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing(error: Error) -> Self {
            Self {
                responses: Mutex::new(vec![Err(error)]),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl LlmClient for MockClient {
        fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("{}".to_string()))
        }
    }

    fn sample_transcript() -> Transcript {
        Transcript::new(vec![
            Turn::new(Speaker::Rep, "Hey there, I'm with the neighborhood solar program"),
            Turn::new(Speaker::Homeowner, "We're not interested"),
            Turn::new(Speaker::Rep, "I understand, most folks say that before seeing the numbers"),
        ])
    }

    const FULL_RESPONSE: &str = r#"{
        "scores": {"rapport": 85, "discovery": 60, "objection_handling": 75, "closing": 40, "safety": 90},
        "summary": "Warm opener, handled the brush-off well, never attempted a close.",
        "feedback": {
            "strengths": ["confident opener"],
            "improvements": ["ask for the appointment"],
            "specific_tips": ["offer two install windows"]
        },
        "line_ratings": {
            "0": {"label": "good", "rationale": "clear intro", "alternatives": []},
            "2": {"label": "excellent", "rationale": "empathetic reframe", "alternatives": ["Totally fair - what did you hear about the program?"]}
        }
    }"#;

    #[test]
    fn full_response_produces_complete_packet() {
        let client = MockClient::returning(FULL_RESPONSE);
        let grader = RubricGrader::new(&client);
        let outcome = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap();

        let packet = outcome.packet;
        assert_eq!(packet.scores.rapport, 85);
        assert!(!packet.partial);
        assert_eq!(packet.line_ratings.len(), 2);
        assert!(matches!(
            packet.line_ratings[&2],
            LineRating::Llm {
                label: LineLabel::Excellent,
                ..
            }
        ));
        assert_eq!(outcome.prompt_hash.len(), 64);
    }

    #[test]
    fn prompt_contains_transcript_and_metrics() {
        let client = MockClient::returning(FULL_RESPONSE);
        let grader = RubricGrader::new(&client);
        let metrics = DeterministicMetrics {
            filler_word_count: 7,
            ..Default::default()
        };
        grader.grade(&sample_transcript(), &metrics).unwrap();

        let prompts = client.prompts.lock().unwrap();
        assert!(prompts[0].contains("neighborhood solar program"));
        assert!(prompts[0].contains("\"filler_word_count\": 7"));
        assert!(prompts[0].contains("0: rep:"));
    }

    #[test]
    fn truncated_response_is_repaired() {
        let truncated = r#"{"scores":{"rapport":80,"discovery":7"#;
        let client = MockClient::returning(truncated);
        let grader = RubricGrader::new(&client);
        let outcome = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap();
        assert_eq!(outcome.packet.scores.rapport, 80);
    }

    #[test]
    fn malformed_line_ratings_fall_back_to_heuristic_wholesale() {
        let response = r#"{
            "scores": {"rapport": 70, "discovery": 70, "objection_handling": 70, "closing": 70, "safety": 70},
            "summary": "ok",
            "feedback": {"strengths": [], "improvements": [], "specific_tips": []},
            "line_ratings": {"0": {"label": "good"}, "two": {"label": "stellar"}}
        }"#;
        let client = MockClient::returning(response);
        let grader = RubricGrader::new(&client);
        let outcome = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap();

        // indices 0 and 2 are the rep turns
        assert_eq!(outcome.packet.line_ratings.len(), 2);
        for rating in outcome.packet.line_ratings.values() {
            assert!(matches!(rating, LineRating::Heuristic { .. }));
        }
    }

    #[test]
    fn missing_line_ratings_use_heuristic() {
        let response = r#"{"scores": {"rapport": 50, "discovery": 50, "objection_handling": 50, "closing": 50, "safety": 50}, "summary": "fine", "feedback": {}}"#;
        let client = MockClient::returning(response);
        let grader = RubricGrader::new(&client);
        let outcome = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap();
        assert!(!outcome.packet.line_ratings.is_empty());
        assert!(outcome
            .packet
            .line_ratings
            .values()
            .all(|r| matches!(r, LineRating::Heuristic { .. })));
    }

    #[test]
    fn hopeless_response_yields_partial_packet_from_sections() {
        let response = r#"Sure! The "scores": {"rapport": 65, "discovery": 55, "objection_handling": 45, "closing": 35, "safety": 95} and that is all ]} garbage"#;
        let client = MockClient::returning(response);
        let grader = RubricGrader::new(&client);
        let outcome = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap();
        assert!(outcome.packet.partial);
        assert_eq!(outcome.packet.scores.rapport, 65);
    }

    #[test]
    fn unusable_response_is_a_shape_error() {
        let client = MockClient::returning("I am unable to grade this conversation.");
        let grader = RubricGrader::new(&client);
        let err = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap_err();
        assert!(matches!(err, Error::LlmShape(_)));
    }

    #[test]
    fn transport_errors_propagate() {
        let client = MockClient::failing(Error::GradingUnavailable("connection refused".into()));
        let grader = RubricGrader::new(&client);
        let err = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap_err();
        assert!(matches!(err, Error::GradingUnavailable(_)));
    }

    #[test]
    fn out_of_range_scores_clamp() {
        let response = r#"{"scores": {"rapport": 400, "discovery": 80, "objection_handling": 80, "closing": 80, "safety": 80}, "summary": "s", "feedback": {}}"#;
        let client = MockClient::returning(response);
        let grader = RubricGrader::new(&client);
        let outcome = grader
            .grade(&sample_transcript(), &DeterministicMetrics::default())
            .unwrap();
        assert_eq!(outcome.packet.scores.rapport, 100);
    }

    #[test]
    fn empty_transcript_is_rejected() {
        let client = MockClient::returning(FULL_RESPONSE);
        let grader = RubricGrader::new(&client);
        let err = grader
            .grade(&Transcript::default(), &DeterministicMetrics::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
