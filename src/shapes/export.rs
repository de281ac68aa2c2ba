//! Shapes export handler: fetch the full data set and render it into the
//! requested file format on the exchange row.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::queue::{HandlerOutcome, Job, JobHandler};
use crate::request::ShapesExportPayload;
use crate::store::dao::{CredentialDao, ExchangeJobDao};
use crate::util::secret::SecretBox;

use super::client::ShapesClient;
use super::error::ExchangeError;
use super::format::formatter_for;
use super::import::ShapesSettings;

pub(crate) struct ShapesExportHandler {
    credential_dao: Arc<dyn CredentialDao>,
    exchange_dao: Arc<dyn ExchangeJobDao>,
    secret: SecretBox,
    settings: ShapesSettings,
}

impl ShapesExportHandler {
    pub(crate) fn new(
        credential_dao: Arc<dyn CredentialDao>,
        exchange_dao: Arc<dyn ExchangeJobDao>,
        secret: SecretBox,
        settings: ShapesSettings,
    ) -> Self {
        Self {
            credential_dao,
            exchange_dao,
            secret,
            settings,
        }
    }

    async fn open_session(&self, user_id: &str) -> Result<ShapesClient, ExchangeError> {
        let sealed = self
            .credential_dao
            .exchange_credential(user_id)
            .await
            .map_err(|dao_error| ExchangeError::Mapping(dao_error.to_string()))?
            .ok_or(ExchangeError::Auth)?;

        let cookie = self.secret.open(&sealed).map_err(|_| ExchangeError::Auth)?;

        ShapesClient::new(
            &self.settings.base_url,
            cookie,
            self.settings.connect_timeout,
            self.settings.total_timeout,
            self.settings.page_size,
        )
    }

    async fn persist_credential(&self, user_id: &str, client: &ShapesClient) {
        let sealed = match self.secret.seal(&client.current_credential()) {
            Ok(sealed) => sealed,
            Err(seal_error) => {
                warn!(error = %seal_error, "failed to seal rotated shapes credential");
                return;
            }
        };
        if let Err(store_error) = self
            .credential_dao
            .store_exchange_credential(user_id, &sealed)
            .await
        {
            warn!(error = %store_error, "failed to persist rotated shapes credential");
        }
    }

    async fn conclude_error(
        &self,
        job: &Job,
        payload: &ShapesExportPayload,
        client: Option<&ShapesClient>,
        exchange_error: ExchangeError,
    ) -> Result<HandlerOutcome> {
        if let Some(client) = client {
            self.persist_credential(&payload.user_id, client).await;
        }

        if exchange_error.is_retryable() && !job.is_final_attempt() {
            return Err(exchange_error.into());
        }

        let message = exchange_error.to_string();
        self.exchange_dao
            .fail_exchange(payload.exchange_job_id, &message)
            .await?;

        Ok(HandlerOutcome {
            request_id: payload.exchange_job_id.to_string(),
            result: json!({
                "requestId": payload.exchange_job_id.to_string(),
                "success": false,
                "error": message,
            }),
            cache_write: None,
            delivery: None,
        })
    }
}

#[async_trait]
impl JobHandler for ShapesExportHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome> {
        let payload: ShapesExportPayload = serde_json::from_value(job.payload.clone())
            .context("failed to parse shapes export payload")?;

        self.exchange_dao
            .mark_exchange_in_progress(payload.exchange_job_id)
            .await?;

        let client = match self.open_session(&payload.user_id).await {
            Ok(client) => client,
            Err(session_error) => {
                return self
                    .conclude_error(job, &payload, None, session_error)
                    .await;
            }
        };

        let fetched = client.fetch_all(&payload.slug).await;
        self.persist_credential(&payload.user_id, &client).await;

        let data = match fetched {
            Ok(data) => data,
            Err(exchange_error) => {
                return self
                    .conclude_error(job, &payload, Some(&client), exchange_error)
                    .await;
            }
        };

        let formatter = formatter_for(payload.format);
        let content = formatter
            .render(&data)
            .context("failed to render export file")?;
        let file_name = format!("{}-export.{}", payload.slug, formatter.file_extension());

        let metadata = json!({
            "memoryCount": data.memories.len(),
            "storyCount": data.stories.len(),
            "format": formatter.file_extension(),
        });

        self.exchange_dao
            .complete_export(payload.exchange_job_id, &file_name, &content, &metadata)
            .await?;

        info!(
            exchange_job_id = %payload.exchange_job_id,
            file_name = %file_name,
            size_bytes = content.len(),
            "shapes export completed"
        );

        Ok(HandlerOutcome {
            request_id: payload.exchange_job_id.to_string(),
            result: json!({
                "requestId": payload.exchange_job_id.to_string(),
                "success": true,
                "fileName": file_name,
                "sizeBytes": content.len(),
            }),
            cache_write: None,
            delivery: None,
        })
    }
}
