//! Complexity classifier
//!
//! Pure heuristic inferring a routing tier from task content. Four signals:
//! description word count, file-hint count, verification-step count, and
//! keyword presence. An explicit tier always wins, but the inference still
//! runs so disagreements can be reported.

use crate::domain_types::Tier;
use serde::{Deserialize, Serialize};
use tracing::debug;

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "architect",
    "migration",
    "redesign",
    "migrate",
    "security",
    "overhaul",
    "rewrite",
];

const TRIVIAL_KEYWORDS: &[&str] = &[
    "fix typo",
    "update readme",
    "bump version",
    "rename",
    "typo",
    "format",
    "lint",
    "version bump",
];

// Signal thresholds that count as "supporting" a complex classification.
const COMPLEX_WORDS: usize = 50;
const COMPLEX_FILES: usize = 4;
const COMPLEX_STEPS: usize = 4;

/// Raw signals extracted from the task content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signals {
    pub word_count: usize,
    pub file_count: usize,
    pub verification_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complex_keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trivial_keyword: Option<String>,
}

/// The inferred tier plus its supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub tier: Tier,
    pub confidence: f64,
    pub signals: Signals,
}

/// Where the effective tier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSource {
    Explicit,
    Inferred,
}

/// Classification attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complexity {
    pub effective_tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_tier: Option<Tier>,
    pub inferred: Inference,
    pub source: TierSource,
}

/// Classifier input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyParams<'a> {
    pub description: &'a str,
    pub file_hints: &'a [String],
    pub verification_steps: &'a [String],
    pub explicit_tier: Option<Tier>,
}

fn find_keyword(haystack: &str, needles: &[&str]) -> Option<String> {
    needles
        .iter()
        .find(|kw| haystack.contains(*kw))
        .map(|kw| (*kw).to_string())
}

fn extract_signals(params: &ClassifyParams<'_>) -> Signals {
    let lowered = params.description.to_lowercase();
    Signals {
        word_count: params.description.split_whitespace().count(),
        file_count: params.file_hints.len(),
        verification_count: params.verification_steps.len(),
        complex_keyword: find_keyword(&lowered, COMPLEX_KEYWORDS),
        trivial_keyword: find_keyword(&lowered, TRIVIAL_KEYWORDS),
    }
}

fn vote_words(n: usize) -> Tier {
    match n {
        0..=9 => Tier::Trivial,
        10..=50 => Tier::Standard,
        _ => Tier::Complex,
    }
}

fn vote_counts(n: usize) -> Tier {
    match n {
        0 => Tier::Trivial,
        1..=3 => Tier::Standard,
        _ => Tier::Complex,
    }
}

fn infer(signals: &Signals) -> Inference {
    // 1. Nothing to go on at all.
    if signals.word_count == 0
        && signals.file_count == 0
        && signals.verification_count == 0
        && signals.complex_keyword.is_none()
        && signals.trivial_keyword.is_none()
    {
        return Inference {
            tier: Tier::Unknown,
            confidence: 0.0,
            signals: signals.clone(),
        };
    }

    // 2. A complex keyword dominates; extra supporting signals raise
    //    confidence.
    if signals.complex_keyword.is_some() {
        let supporting = usize::from(signals.word_count > COMPLEX_WORDS)
            + usize::from(signals.file_count >= COMPLEX_FILES)
            + usize::from(signals.verification_count >= COMPLEX_STEPS);
        return Inference {
            tier: Tier::Complex,
            confidence: (0.7 + 0.1 * supporting as f64).min(1.0),
            signals: signals.clone(),
        };
    }

    // 3. A trivial keyword with small scope.
    if signals.trivial_keyword.is_some()
        && signals.file_count <= 3
        && signals.verification_count <= 3
    {
        let confidence = if signals.word_count < 10 { 0.9 } else { 0.75 };
        return Inference {
            tier: Tier::Trivial,
            confidence,
            signals: signals.clone(),
        };
    }

    // 4. Majority vote of the three scalar sub-scores.
    let votes = [
        vote_words(signals.word_count),
        vote_counts(signals.file_count),
        vote_counts(signals.verification_count),
    ];
    let tally = |tier: Tier| votes.iter().filter(|v| **v == tier).count();
    // Ties break toward standard, then complex, then trivial.
    let counts = [
        (tally(Tier::Trivial), 0u8, Tier::Trivial),
        (tally(Tier::Complex), 1u8, Tier::Complex),
        (tally(Tier::Standard), 2u8, Tier::Standard),
    ];
    let (winning_votes, _, mut tier) = counts
        .into_iter()
        .max_by_key(|(n, preference, _)| (*n, *preference))
        .unwrap_or((0, 2, Tier::Standard));
    let confidence = (winning_votes as f64 / votes.len() as f64).clamp(0.0, 1.0);

    // Pure heuristics never produce trivial without a keyword.
    if tier == Tier::Trivial && signals.trivial_keyword.is_none() {
        tier = Tier::Standard;
    }

    Inference {
        tier,
        confidence,
        signals: signals.clone(),
    }
}

/// Classifies task content. An explicit tier wins, but a disagreement with
/// the inference is reported.
#[must_use]
pub fn build(params: &ClassifyParams<'_>) -> Complexity {
    let signals = extract_signals(params);
    let inferred = infer(&signals);
    match params.explicit_tier {
        Some(explicit) => {
            if explicit != inferred.tier {
                debug!(
                    target: "telemetry",
                    explicit = %explicit,
                    inferred = %inferred.tier,
                    "tier disagreement"
                );
            }
            Complexity {
                effective_tier: explicit,
                explicit_tier: Some(explicit),
                inferred,
                source: TierSource::Explicit,
            }
        }
        None => Complexity {
            effective_tier: inferred.tier,
            explicit_tier: None,
            inferred,
            source: TierSource::Inferred,
        },
    }
}
