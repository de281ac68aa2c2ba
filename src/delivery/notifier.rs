//! Delivery notifications over Postgres `NOTIFY`/`LISTEN`. The worker
//! publishes `{jobId, requestId}` on the destination's channel after
//! persisting a result; a subscriber fetches the full row by job id, hands
//! it to its sink, and flips the row to delivered.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::{error, info, warn};

use super::persist::{JobResultRow, JobResultStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeliveryNotice {
    pub(crate) job_id: String,
    pub(crate) request_id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct DeliveryNotifier {
    pool: PgPool,
}

impl DeliveryNotifier {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) async fn publish(
        &self,
        channel: &str,
        job_id: &str,
        request_id: &str,
    ) -> Result<()> {
        let notice = DeliveryNotice {
            job_id: job_id.to_string(),
            request_id: request_id.to_string(),
        };
        let payload =
            serde_json::to_string(&notice).context("failed to serialize delivery notice")?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to publish delivery notice on {channel}"))?;

        info!(job_id, request_id, channel, "delivery notice published");
        Ok(())
    }
}

/// Transport-side handler for a persisted result. Soft failures and
/// successes arrive identically; the sink formats the user-facing message.
#[async_trait::async_trait]
pub(crate) trait DeliverySink: Send + Sync {
    async fn deliver(&self, result: &JobResultRow) -> Result<()>;
}

pub(crate) struct DeliverySubscriber {
    pool: PgPool,
    results: JobResultStore,
    sink: std::sync::Arc<dyn DeliverySink>,
    channels: Vec<String>,
}

impl DeliverySubscriber {
    pub(crate) fn new(
        pool: PgPool,
        results: JobResultStore,
        sink: std::sync::Arc<dyn DeliverySink>,
        channels: Vec<String>,
    ) -> Self {
        Self {
            pool,
            results,
            sink,
            channels,
        }
    }

    pub(crate) async fn run(self) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("failed to open delivery listener")?;

        let channel_refs: Vec<&str> = self.channels.iter().map(String::as_str).collect();
        listener
            .listen_all(channel_refs)
            .await
            .context("failed to subscribe to delivery channels")?;

        info!(channels = ?self.channels, "delivery subscriber listening");

        loop {
            let notification = listener
                .recv()
                .await
                .context("delivery listener connection lost")?;

            let notice: DeliveryNotice = match serde_json::from_str(notification.payload()) {
                Ok(notice) => notice,
                Err(parse_error) => {
                    warn!(
                        payload = notification.payload(),
                        error = %parse_error,
                        "ignoring malformed delivery notice"
                    );
                    continue;
                }
            };

            if let Err(delivery_error) = self.handle_notice(&notice).await {
                error!(
                    job_id = %notice.job_id,
                    error = %delivery_error,
                    "delivery failed; row stays pending"
                );
            }
        }
    }

    async fn handle_notice(&self, notice: &DeliveryNotice) -> Result<()> {
        let Some(row) = self.results.get_result(&notice.job_id).await? else {
            warn!(job_id = %notice.job_id, "delivery notice for unknown job result");
            return Ok(());
        };

        if row.status == super::persist::JobResultStatus::Delivered {
            info!(job_id = %notice.job_id, "result already delivered, skipping");
            return Ok(());
        }

        self.sink.deliver(&row).await?;

        let transitioned = self.results.mark_delivered(&notice.job_id).await?;
        if !transitioned {
            // Another subscriber won the CAS; double delivery is benign.
            info!(job_id = %notice.job_id, "result already delivered");
        }

        Ok(())
    }
}

/// Default sink: logs the hand-off. The real presentation layer runs in the
/// bot client and consumes the same notifications.
pub(crate) struct LoggingDeliverySink;

#[async_trait::async_trait]
impl DeliverySink for LoggingDeliverySink {
    async fn deliver(&self, result: &JobResultRow) -> Result<()> {
        info!(
            job_id = %result.job_id,
            request_id = %result.request_id,
            success = result.result.get("success").and_then(serde_json::Value::as_bool),
            "result ready for destination"
        );
        Ok(())
    }
}
