//! Scoped memory retrieval. Splits the result budget between the current
//! channel and the persona-wide scope, and applies the personality filter
//! unless the owning persona shares long-term memory across personalities.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::clients::memory::{MemoryHit, MemorySearch, VectorMemoryStore};
use crate::store::models::PersonalityRecord;

/// Split a retrieval limit between channel scope and global scope.
///
/// The channel allocation is `ceil(limit * ratio)` so any positive ratio is
/// guaranteed at least one slot; the remainder goes to the global scope.
#[must_use]
pub fn split_budget(limit: usize, channel_budget_ratio: f64) -> (usize, usize) {
    if limit == 0 {
        return (0, 0);
    }
    let ratio = channel_budget_ratio.clamp(0.0, 1.0);
    if ratio == 0.0 {
        return (0, limit);
    }

    let channel = ((limit as f64) * ratio).ceil() as usize;
    let channel = channel.clamp(1, limit);
    (channel, limit - channel)
}

pub(crate) struct MemoryRetriever {
    store: Arc<dyn VectorMemoryStore>,
    channel_budget_ratio: f64,
    limit: usize,
}

impl MemoryRetriever {
    pub(crate) fn new(
        store: Arc<dyn VectorMemoryStore>,
        channel_budget_ratio: f64,
        limit: usize,
    ) -> Self {
        Self {
            store,
            channel_budget_ratio,
            limit,
        }
    }

    /// Retrieve memories relevant to `query` for the given personality.
    ///
    /// When the conversation has history, `oldest_history_timestamp` bounds
    /// retrieval to memories older than the visible window; with no history
    /// no exclusion window applies.
    pub(crate) async fn retrieve(
        &self,
        query: &str,
        personality: &PersonalityRecord,
        channel_id: Option<&str>,
        oldest_history_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<MemoryHit>> {
        let personality_filter: Option<Uuid> = if personality.share_ltm_across_personalities {
            None
        } else {
            Some(personality.id)
        };

        let (channel_limit, global_limit) = match channel_id {
            Some(_) => split_budget(self.limit, self.channel_budget_ratio),
            None => (0, self.limit),
        };

        let mut hits = Vec::with_capacity(self.limit);

        if channel_limit > 0 {
            let search = MemorySearch {
                text: query.to_string(),
                persona_id: personality.persona_id,
                personality_id: personality_filter,
                channel_id: channel_id.map(ToString::to_string),
                limit: channel_limit,
                created_before: oldest_history_timestamp,
            };
            match self.store.search_memories(&search).await {
                Ok(channel_hits) => hits.extend(channel_hits),
                Err(error) => {
                    warn!(error = %error, "channel-scope memory search failed, continuing");
                }
            }
        }

        if global_limit > 0 {
            let search = MemorySearch {
                text: query.to_string(),
                persona_id: personality.persona_id,
                personality_id: personality_filter,
                channel_id: None,
                limit: global_limit,
                created_before: oldest_history_timestamp,
            };
            match self.store.search_memories(&search).await {
                Ok(global_hits) => {
                    for hit in global_hits {
                        if !hits.iter().any(|h: &MemoryHit| h.text == hit.text) {
                            hits.push(hit);
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, "global-scope memory search failed, continuing");
                }
            }
        }

        hits.truncate(self.limit);
        Ok(hits)
    }
}
