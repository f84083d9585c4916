//! Lexical fallback line rater.
//!
//! Used when the LLM's line ratings are absent or unusable. Ratings produced
//! here always carry the heuristic source tag so downstream consumers can
//! tell them apart from model judgments.

use crate::types::{LineLabel, LineRating, Transcript};
use std::collections::BTreeMap;

/// Hedging markers that undercut a pitch.
const HEDGING_MARKERS: &[&str] = &[
    "i think",
    "maybe",
    "i guess",
    "sort of",
    "kind of",
    "not sure",
    "possibly",
    "i suppose",
];

/// Empathetic-reframe openers.
const REFRAME_MARKERS: &[&str] = &[
    "i understand",
    "i hear you",
    "that makes sense",
    "great question",
    "i appreciate",
    "totally fair",
];

/// Assumptive-question phrasing.
const ASSUMPTIVE_MARKERS: &[&str] = &[
    "when we",
    "which works better",
    "morning or afternoon",
    "would tuesday",
    "does that work for you",
    "shall we get you",
];

/// Rate one rep line by lexical signals alone.
pub fn rate_line(text: &str) -> LineRating {
    let lowered = text.trim().to_lowercase();
    let word_count = lowered.split_whitespace().count();

    if HEDGING_MARKERS.iter().any(|m| lowered.contains(m)) {
        return LineRating::Heuristic {
            label: LineLabel::Poor,
            rationale: Some("hedging language weakens the pitch".to_string()),
        };
    }

    if word_count < 4 {
        return LineRating::Heuristic {
            label: LineLabel::MissedOpportunity,
            rationale: Some("too brief to advance the conversation".to_string()),
        };
    }

    let reframes = REFRAME_MARKERS.iter().any(|m| lowered.contains(m));
    let assumptive = ASSUMPTIVE_MARKERS.iter().any(|m| lowered.contains(m));
    if reframes || assumptive {
        let rationale = if reframes {
            "empathetic reframe"
        } else {
            "assumptive question keeps momentum"
        };
        return LineRating::Heuristic {
            label: LineLabel::Excellent,
            rationale: Some(rationale.to_string()),
        };
    }

    LineRating::Heuristic {
        label: LineLabel::Good,
        rationale: None,
    }
}

/// Rate every rep turn of a transcript, keyed by absolute turn index.
pub fn rate_transcript(transcript: &Transcript) -> BTreeMap<usize, LineRating> {
    transcript
        .rep_turns()
        .map(|(idx, turn)| (idx, rate_line(&turn.text)))
        .collect()
}
