//! Cross-turn duplicate detection. Four layers evaluated in increasing
//! cost, short-circuiting on the first hit: exact hash, word Jaccard,
//! character-bigram Dice, then semantic embedding when an embedder is
//! available. Free-tier upstream caches occasionally replay a previous
//! response verbatim or near-verbatim; this is the net that catches it.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::clients::{Embedder, cosine_similarity};
use crate::util::text::{normalize_for_similarity, strip_response_footer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DetectionLayer {
    ExactHash,
    WordJaccard,
    BigramDice,
    Embedding,
}

impl DetectionLayer {
    pub(crate) fn name(self) -> &'static str {
        match self {
            DetectionLayer::ExactHash => "exact_hash",
            DetectionLayer::WordJaccard => "word_jaccard",
            DetectionLayer::BigramDice => "bigram_dice",
            DetectionLayer::Embedding => "embedding",
        }
    }
}

/// Detector verdict. `match_index` is the 0-based offset into the compared
/// list for the synchronous layers and -1 for the embedding layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DuplicateCheck {
    pub(crate) is_duplicate: bool,
    pub(crate) match_index: i64,
    pub(crate) layer: Option<DetectionLayer>,
}

impl DuplicateCheck {
    fn unique() -> Self {
        Self {
            is_duplicate: false,
            match_index: -1,
            layer: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DuplicateThresholds {
    /// Responses shorter than this (after footer stripping) skip all layers.
    pub(crate) min_length: usize,
    pub(crate) word_jaccard: f64,
    pub(crate) bigram_dice: f64,
    /// Bigram scores at or above this but below the match threshold are
    /// logged for threshold tuning.
    pub(crate) near_miss: f64,
    pub(crate) embedding: f64,
}

impl Default for DuplicateThresholds {
    fn default() -> Self {
        Self {
            min_length: 30,
            word_jaccard: 0.95,
            bigram_dice: 0.85,
            near_miss: 0.75,
            embedding: 0.93,
        }
    }
}

pub(crate) struct DuplicateDetector {
    thresholds: DuplicateThresholds,
    embedder: Option<Arc<dyn Embedder>>,
}

impl DuplicateDetector {
    pub(crate) fn new(thresholds: DuplicateThresholds, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            thresholds,
            embedder,
        }
    }

    /// Compare `candidate` against recent assistant messages (most recent
    /// first). Footers are stripped on both sides before any comparison.
    pub(crate) async fn check(&self, candidate: &str, recent: &[String]) -> DuplicateCheck {
        let stripped = strip_response_footer(candidate);
        if stripped.chars().count() < self.thresholds.min_length {
            return DuplicateCheck::unique();
        }
        if recent.is_empty() {
            return DuplicateCheck::unique();
        }

        let normalized = normalize_for_similarity(&stripped);
        let candidate_hash = xxh3_64(normalized.as_bytes());
        let candidate_words = word_set(&normalized);
        let candidate_bigrams = bigram_set(&normalized);

        for (index, previous) in recent.iter().enumerate() {
            let previous_normalized = normalize_for_similarity(&strip_response_footer(previous));
            if previous_normalized.is_empty() {
                continue;
            }

            // L1: byte-identical after normalization.
            if xxh3_64(previous_normalized.as_bytes()) == candidate_hash {
                debug!(index, layer = "exact_hash", "duplicate response detected");
                return DuplicateCheck {
                    is_duplicate: true,
                    match_index: index as i64,
                    layer: Some(DetectionLayer::ExactHash),
                };
            }

            // L2: unique-word Jaccard.
            let jaccard = jaccard_similarity(&candidate_words, &word_set(&previous_normalized));
            if jaccard >= self.thresholds.word_jaccard {
                debug!(index, jaccard, layer = "word_jaccard", "duplicate response detected");
                return DuplicateCheck {
                    is_duplicate: true,
                    match_index: index as i64,
                    layer: Some(DetectionLayer::WordJaccard),
                };
            }

            // L3: character-bigram Dice coefficient.
            let dice = dice_coefficient(&candidate_bigrams, &bigram_set(&previous_normalized));
            if dice >= self.thresholds.bigram_dice {
                debug!(index, dice, layer = "bigram_dice", "duplicate response detected");
                return DuplicateCheck {
                    is_duplicate: true,
                    match_index: index as i64,
                    layer: Some(DetectionLayer::BigramDice),
                };
            }
            if dice >= self.thresholds.near_miss {
                info!(
                    index,
                    dice,
                    threshold = self.thresholds.bigram_dice,
                    "near-miss similarity below duplicate threshold"
                );
            }
        }

        // L4: semantic embedding, only when the service is present and the
        // cheap layers stayed silent.
        if let Some(embedder) = self.embedder.as_ref().filter(|e| e.is_ready()) {
            match self.embedding_layer(embedder.as_ref(), &stripped, recent).await {
                Ok(Some(similarity)) => {
                    debug!(similarity, layer = "embedding", "duplicate response detected");
                    return DuplicateCheck {
                        is_duplicate: true,
                        match_index: -1,
                        layer: Some(DetectionLayer::Embedding),
                    };
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(error = %error, "embedding duplicate layer failed, treating as unique");
                }
            }
        }

        DuplicateCheck::unique()
    }

    async fn embedding_layer(
        &self,
        embedder: &dyn Embedder,
        candidate: &str,
        recent: &[String],
    ) -> anyhow::Result<Option<f32>> {
        let mut texts: Vec<String> = Vec::with_capacity(recent.len() + 1);
        texts.push(candidate.to_string());
        texts.extend(recent.iter().map(|r| strip_response_footer(r)));

        let vectors = embedder.embed(&texts).await?;
        let Some((candidate_vector, previous_vectors)) = vectors.split_first() else {
            return Ok(None);
        };

        for previous in previous_vectors {
            let similarity = cosine_similarity(candidate_vector, previous);
            if f64::from(similarity) >= self.thresholds.embedding {
                return Ok(Some(similarity));
            }
        }

        Ok(None)
    }
}

fn word_set(normalized: &str) -> FxHashSet<&str> {
    normalized.split_whitespace().collect()
}

fn jaccard_similarity(a: &FxHashSet<&str>, b: &FxHashSet<&str>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn bigram_set(normalized: &str) -> FxHashSet<SmallVec<[char; 2]>> {
    let chars: Vec<char> = normalized.chars().collect();
    chars
        .windows(2)
        .map(|pair| SmallVec::from_slice(pair))
        .collect()
}

fn dice_coefficient(
    a: &FxHashSet<SmallVec<[char; 2]>>,
    b: &FxHashSet<SmallVec<[char; 2]>>,
) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    (2.0 * intersection as f64) / (a.len() + b.len()) as f64
}
