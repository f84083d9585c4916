//! Deterministic linguistic metrics.
//!
//! Pure projection of a transcript: no I/O, no failure mode beyond empty
//! input (which yields a fully-zeroed record). Recomputed fresh on every
//! request; the transcript remains the only source of truth.

use crate::types::{DeterministicMetrics, Speaker, Transcript};

/// Closed set of single-token discourse fillers, matched as whole words.
const FILLER_WORDS: &[&str] = &[
    "um",
    "uh",
    "umm",
    "uhh",
    "like",
    "basically",
    "actually",
    "literally",
    "honestly",
    "kinda",
    "sorta",
];

/// Two-token fillers, matched against adjacent word pairs.
const FILLER_PAIRS: &[(&str, &str)] = &[("you", "know"), ("i", "mean")];

/// Assumptive-close phrasings, matched as substrings of a lowercased rep turn.
const CLOSE_PATTERNS: &[&str] = &[
    "does that work for you",
    "when would be a good time",
    "which works better",
    "let's get you scheduled",
    "let's get that scheduled",
    "all we need to do",
    "we can have someone out",
    "morning or afternoon",
    "go ahead and get you",
];

/// Buying-signal phrasings looked for in homeowner turns.
const BUYING_SIGNALS: &[&str] = &[
    "how much",
    "what does it cost",
    "what's the price",
    "sounds good",
    "that makes sense",
    "i'm interested",
    "we've been thinking about",
    "when can you",
];

/// Contact-detail exchange cues (either side of the call).
const INFO_PATTERNS: &[&str] = &[
    "phone number",
    "best number",
    "email",
    "@",
    "reach you at",
    "your address",
];

/// Spouse-approval cues in homeowner turns.
const SPOUSE_PATTERNS: &[&str] = &[
    "my wife",
    "my husband",
    "my spouse",
    "talk to my",
    "check with my",
    "ask my",
];

/// Compute deterministic metrics for a transcript.
///
/// `duration_secs` is the total session duration; a zero or negative duration
/// yields a words-per-minute of 0 rather than an error.
pub fn extract(transcript: &Transcript, duration_secs: i64) -> DeterministicMetrics {
    if transcript.is_empty() {
        return DeterministicMetrics::default();
    }

    let mut rep_turn_count: u32 = 0;
    let mut rep_word_count: u32 = 0;
    let mut rep_question_count: u32 = 0;
    let mut filler_word_count: u32 = 0;
    let mut close_attempt_count: u32 = 0;
    let mut buying_signals = false;
    let mut info_collected = false;
    let mut spouse_mentioned = false;

    for turn in &transcript.turns {
        let lower = turn.text.to_lowercase();

        match turn.speaker {
            Speaker::Rep => {
                rep_turn_count += 1;
                rep_word_count += word_count(&turn.text);
                if turn.text.trim_end().ends_with('?') {
                    rep_question_count += 1;
                }
                filler_word_count += count_fillers(&lower);
                close_attempt_count += CLOSE_PATTERNS
                    .iter()
                    .filter(|p| lower.contains(*p))
                    .count() as u32;
            }
            Speaker::Homeowner => {
                if BUYING_SIGNALS.iter().any(|p| lower.contains(p)) {
                    buying_signals = true;
                }
                if SPOUSE_PATTERNS.iter().any(|p| lower.contains(p)) {
                    spouse_mentioned = true;
                }
            }
        }

        if INFO_PATTERNS.iter().any(|p| lower.contains(p)) {
            info_collected = true;
        }
    }

    let words_per_minute = if duration_secs > 0 && rep_word_count > 0 {
        let minutes = duration_secs as f64 / 60.0;
        (rep_word_count as f64 / minutes).round() as u32
    } else {
        0
    };

    let question_ratio_pct = if rep_turn_count > 0 {
        (rep_question_count as f64 / rep_turn_count as f64 * 100.0).round() as u32
    } else {
        0
    };

    DeterministicMetrics {
        filler_word_count,
        words_per_minute,
        question_ratio_pct,
        close_attempt_count,
        buying_signals,
        info_collected,
        spouse_mentioned,
        rep_turn_count,
        rep_word_count,
    }
}

/// Whitespace tokenization, discarding zero-length tokens.
fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Count filler occurrences as whole words, never substrings
/// ("hum" inside "human" must not match).
fn count_fillers(lower: &str) -> u32 {
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();

    let mut count: u32 = 0;
    for word in &words {
        if FILLER_WORDS.contains(word) {
            count += 1;
        }
    }
    for pair in words.windows(2) {
        if FILLER_PAIRS.contains(&(pair[0], pair[1])) {
            count += 1;
        }
    }
    count
}
