use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

use crate::{
    api,
    clients::{
        Embedder, GatewayGeneratorClient, HttpEmbedder, HttpTranscriber, HttpVectorMemoryStore,
        HttpVisionModel, ResponseGenerator, Transcriber, VectorMemoryStore, VisionModel,
    },
    config::Config,
    delivery::{
        DeliveryNotifier, DeliverySubscriber, JobResultStore, ResultCache,
        notifier::LoggingDeliverySink,
    },
    describers::{AudioDescriber, ImageDescriber},
    memory::{deferred::DeferredMemoryWriter, pending::PendingMemoryRetrier, retrieval::MemoryRetriever},
    observability::Telemetry,
    orchestrator::JobChainOrchestrator,
    pipeline::{GenerationJobHandler, GenerationPipeline},
    pipeline::auth::AuthResolution,
    pipeline::config_resolution::ConfigResolution,
    pipeline::dedup::{DuplicateDetector, DuplicateThresholds},
    pipeline::dependencies::DependencyResolver,
    pipeline::generate::GenerationStage,
    queue::{JobQueue, JobRouter, JobStore},
    shapes::{ShapesExportHandler, ShapesImportHandler, import::ShapesSettings},
    store::dao::PgWorkerDao,
    store::models::PendingMemoryStats,
    util::retry::RetryConfig,
    util::secret::SecretBox,
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    orchestrator: Arc<JobChainOrchestrator>,
    dao: Arc<PgWorkerDao>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn orchestrator(&self) -> &JobChainOrchestrator {
        &self.registry.orchestrator
    }

    pub(crate) async fn pending_memory_stats(&self) -> Result<PendingMemoryStats> {
        use crate::store::dao::PendingMemoryDao;
        self.registry.dao.pending_memory_stats().await
    }
}

impl ComponentRegistry {
    /// Wire every component and start the worker pools and the delivery
    /// subscriber.
    ///
    /// # Errors
    /// Fails when telemetry, the credential sealer, or any HTTP client
    /// cannot be constructed.
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new()?;
        let metrics = telemetry.metrics_arc();

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections())
            .min_connections(config.db_min_connections())
            .acquire_timeout(config.db_acquire_timeout())
            .idle_timeout(Some(config.db_idle_timeout()))
            .max_lifetime(Some(config.db_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.db_dsn())
            .context("failed to configure database connection pool")?;

        let dao = Arc::new(PgWorkerDao::new(pool.clone()));
        let cache = ResultCache::new(pool.clone());
        let results = JobResultStore::new(pool.clone());
        let notifier = DeliveryNotifier::new(pool.clone());
        let queue = Arc::new(JobQueue::new(JobStore::new(pool.clone())));

        let secret = SecretBox::from_key_base64(config.credential_key_b64())
            .context("invalid credential encryption key")?;

        let generator: Arc<dyn ResponseGenerator> = Arc::new(
            GatewayGeneratorClient::new(
                config.generator_base_url(),
                config.generator_connect_timeout(),
                config.generator_total_timeout(),
                config.generator_service_token().map(ToString::to_string),
            )
            .context("failed to build response-generator client")?,
        );
        let transcriber: Arc<dyn Transcriber> = Arc::new(
            HttpTranscriber::new(
                config.transcription_base_url(),
                config.transcription_timeout(),
                config.audio_download_timeout(),
            )
            .context("failed to build transcription client")?,
        );
        let vision: Arc<dyn VisionModel> = Arc::new(
            HttpVisionModel::new(
                config.generator_base_url(),
                config.generator_total_timeout(),
                config.generator_service_token().map(ToString::to_string),
            )
            .context("failed to build vision client")?,
        );
        let memory_store: Arc<dyn VectorMemoryStore> = Arc::new(
            HttpVectorMemoryStore::new(config.memory_base_url(), config.memory_timeout())
                .context("failed to build vector memory client")?,
        );

        let embedder: Option<Arc<dyn Embedder>> = match config.embeddings_base_url() {
            Some(base_url) => match HttpEmbedder::new(
                base_url,
                config.embeddings_model(),
                config.embeddings_timeout(),
            ) {
                Ok(client) => Some(Arc::new(client) as Arc<dyn Embedder>),
                Err(embedder_error) => {
                    warn!(
                        error = %embedder_error,
                        "embedding client failed to initialize; semantic duplicate layer disabled"
                    );
                    None
                }
            },
            None => None,
        };

        let thresholds = DuplicateThresholds {
            min_length: config.duplicate_min_length(),
            word_jaccard: config.duplicate_word_jaccard_threshold(),
            bigram_dice: config.duplicate_bigram_dice_threshold(),
            near_miss: config.duplicate_near_miss_threshold(),
            embedding: config.duplicate_embedding_threshold(),
        };
        let detector = Arc::new(DuplicateDetector::new(thresholds, embedder));

        let retriever = Arc::new(MemoryRetriever::new(
            Arc::clone(&memory_store),
            config.memory_channel_budget_ratio(),
            config.memory_retrieval_limit(),
        ));
        let deferred = Arc::new(DeferredMemoryWriter::new(
            Arc::clone(&generator),
            dao.clone(),
        ));

        let http_retry = RetryConfig::new(
            config.http_max_retries(),
            config.http_backoff_base_ms(),
            config.http_backoff_cap_ms(),
        );
        let image_describer = Arc::new(ImageDescriber::new(
            vision,
            dao.clone(),
            config.vision_fallback_model().to_string(),
            http_retry,
            config.result_cache_ttl(),
        ));
        let audio_describer = Arc::new(AudioDescriber::new(
            transcriber,
            cache.clone(),
            config.result_cache_ttl(),
            config.transcript_cache_ttl(),
        ));

        let pipeline = Arc::new(GenerationPipeline::new(
            DependencyResolver::new(cache.clone()),
            ConfigResolution::new(
                dao.clone(),
                config.guest_default_model().to_string(),
                config.vision_fallback_model().to_string(),
            ),
            AuthResolution::new(dao.clone()),
            Arc::clone(&image_describer),
            GenerationStage::new(
                Arc::clone(&generator),
                detector,
                retriever,
                deferred,
                Arc::clone(&metrics),
                config.generation_max_attempts(),
            ),
            dao.clone(),
            Arc::clone(&metrics),
        ));

        let shapes_settings = ShapesSettings {
            base_url: config.shapes_base_url().to_string(),
            connect_timeout: config.shapes_connect_timeout(),
            total_timeout: config.shapes_total_timeout(),
            page_size: config.shapes_page_size(),
            avatar_max_bytes: config.avatar_max_bytes(),
            avatar_timeout: config.avatar_download_timeout(),
        };
        let import_handler = Arc::new(ShapesImportHandler::new(
            dao.clone(),
            dao.clone(),
            dao.clone(),
            Arc::clone(&memory_store),
            secret.clone(),
            shapes_settings.clone(),
        ));
        let export_handler = Arc::new(ShapesExportHandler::new(
            dao.clone(),
            dao.clone(),
            secret,
            shapes_settings,
        ));
        let retrier = Arc::new(PendingMemoryRetrier::new(
            dao.clone(),
            Arc::clone(&memory_store),
            config.pending_memory_max_attempts(),
            config.pending_memory_batch_size(),
        ));

        let router = Arc::new(JobRouter {
            generation: Arc::new(GenerationJobHandler::new(pipeline)),
            audio: audio_describer,
            image: image_describer,
            shapes_import: import_handler,
            shapes_export: export_handler,
            pending_memory: retrier,
        });

        queue
            .start(
                &config,
                router,
                cache.clone(),
                results.clone(),
                notifier,
                Arc::clone(&metrics),
            )
            .await
            .context("failed to start queue workers")?;

        let subscriber = DeliverySubscriber::new(
            pool,
            results,
            Arc::new(LoggingDeliverySink),
            config.delivery_channels().to_vec(),
        );
        tokio::spawn(async move {
            if let Err(subscriber_error) = subscriber.run().await {
                warn!(error = %subscriber_error, "delivery subscriber stopped");
            }
        });

        let orchestrator = Arc::new(JobChainOrchestrator::new(
            Arc::clone(&queue),
            metrics,
            config.queue_max_attempts(),
        ));

        let _pending_memory_daemon = crate::scheduler::daemon::spawn_pending_memory_daemon(
            Arc::clone(&queue),
            config.pending_memory_retry_interval(),
        );
        let _maintenance_daemon = crate::scheduler::daemon::spawn_maintenance_daemon(
            dao.clone(),
            cache.clone(),
            config.diagnostics_retention(),
            config.diagnostics_cleanup_interval(),
        );

        Ok(Self {
            config,
            telemetry,
            orchestrator,
            dao,
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
