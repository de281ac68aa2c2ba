//! Deferred memory storage. The generator is asked to defer memory writes on
//! every retry attempt; once a response is accepted this writer stores the
//! memory exactly once. A storage failure never fails the job (the user
//! already has a validated response); it lands in the pending queue instead.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::clients::ResponseGenerator;
use crate::store::dao::PendingMemoryDao;

use super::{DeferredMemoryRecord, MemoryScope};

pub(crate) struct DeferredMemoryWriter {
    generator: Arc<dyn ResponseGenerator>,
    pending_dao: Arc<dyn PendingMemoryDao>,
}

/// Outcome of a deferred store, surfaced in result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferredStoreOutcome {
    Stored,
    Queued,
    SkippedIncognito,
    None,
}

impl DeferredMemoryWriter {
    pub(crate) fn new(
        generator: Arc<dyn ResponseGenerator>,
        pending_dao: Arc<dyn PendingMemoryDao>,
    ) -> Self {
        Self {
            generator,
            pending_dao,
        }
    }

    /// Store the deferred memory for a settled response. Incognito requests
    /// never produce a memory.
    pub(crate) async fn store_once(
        &self,
        request_id: &str,
        memory: Option<&DeferredMemoryRecord>,
        scope: &MemoryScope,
        incognito: bool,
    ) -> Result<DeferredStoreOutcome> {
        let Some(memory) = memory else {
            return Ok(DeferredStoreOutcome::None);
        };

        if incognito {
            info!(request_id, "incognito request, skipping memory storage");
            return Ok(DeferredStoreOutcome::SkippedIncognito);
        }

        match self.generator.store_deferred_memory(memory, scope).await {
            Ok(()) => {
                info!(request_id, "deferred memory stored");
                Ok(DeferredStoreOutcome::Stored)
            }
            Err(error) => {
                warn!(
                    request_id,
                    error = %error,
                    "deferred memory storage failed, queueing for retry"
                );
                let mut metadata = memory.metadata.clone();
                if let Some(map) = metadata.as_object_mut() {
                    map.entry("requestId")
                        .or_insert_with(|| serde_json::json!(request_id));
                }
                self.pending_dao
                    .insert_pending_memory(&memory.text, &metadata)
                    .await?;
                Ok(DeferredStoreOutcome::Queued)
            }
        }
    }
}
