//! Ingestion and evaluation orchestration.

use std::sync::Arc;

use anyhow::{Context, Result};
use lotto_adapters::{latest_draw_id, DrawSource, HttpDrawSource};
use lotto_storage::{DrawStore, HttpClientConfig, HttpFetcher, PgStore, ResultStore};
use serde::Serialize;
use tracing::info;

mod config;
pub mod evaluate;
pub mod ingest;
pub mod notify;

pub use config::LottoConfig;
pub use evaluate::{EvaluationError, EvaluationOutcome, EvaluationRequest, EvaluationRun, RunState};
pub use ingest::{
    IngestionConfig, IngestionCounts, IngestionPipeline, IngestionSummary, SkipReason,
    TaskFailure, TaskOutcome,
};
pub use notify::{LogNotifier, Notification, Notifier, NotifyError, WebhookNotifier};

pub const CRATE_NAME: &str = "lotto-sync";

/// Overrides applied on top of the environment for a single ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub from: Option<u32>,
    pub to: Option<u32>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub latest_remote_id: u32,
    pub stored_draws: u64,
    pub recorded_results: u64,
}

impl StatusReport {
    pub fn missing_draws(&self) -> u64 {
        u64::from(self.latest_remote_id).saturating_sub(self.stored_draws)
    }
}

fn http_source(config: &LottoConfig, http: HttpClientConfig) -> Result<Arc<dyn DrawSource>> {
    let http = HttpFetcher::new(http)?;
    Ok(Arc::new(HttpDrawSource::new(http, config.api_base_url.clone())))
}

async fn connect_store(config: &LottoConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn notifier(config: &LottoConfig) -> Result<Arc<dyn Notifier>> {
    match &config.notify_webhook_url {
        Some(url) => {
            let webhook = WebhookNotifier::new(url.clone(), config.http_timeout())
                .context("building webhook notifier")?;
            Ok(Arc::new(webhook))
        }
        None => {
            info!("LOTTO_NOTIFY_WEBHOOK_URL not set; notifications go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}

pub async fn migrate_from_env() -> Result<()> {
    let config = LottoConfig::from_env()?;
    let store = connect_store(&config).await?;
    DrawStore::ensure_schema(store.as_ref())
        .await
        .context("creating draws table")?;
    ResultStore::ensure_schema(store.as_ref())
        .await
        .context("creating results table")?;
    info!("schema ready");
    Ok(())
}

pub async fn run_ingestion_from_env(options: IngestOptions) -> Result<IngestionSummary> {
    let config = LottoConfig::from_env()?;
    // The pipeline paces requests itself, outside the per-fetch timeout.
    let source = http_source(
        &config,
        HttpClientConfig {
            rate_limit: None,
            ..config.http_client_config()
        },
    )?;
    let store = connect_store(&config).await?;
    DrawStore::ensure_schema(store.as_ref())
        .await
        .context("creating draws table")?;

    let mut ingestion = config.ingestion_config();
    if let Some(workers) = options.workers {
        ingestion.workers = workers.max(1);
    }
    let last = match options.to {
        Some(to) => to,
        None => latest_draw_id(source.as_ref())
            .await
            .context("resolving latest draw id")?,
    };
    let first = options.from.unwrap_or(1).max(1);
    if first > last {
        anyhow::bail!("empty id range {first}..={last}");
    }

    let pipeline = IngestionPipeline::new(source, store, ingestion);
    Ok(pipeline.run_range(first..=last).await)
}

pub async fn run_evaluation_from_env() -> Result<EvaluationOutcome> {
    let config = LottoConfig::from_env()?;
    let request = config.evaluation_request()?;
    let source = http_source(&config, config.http_client_config())?;
    let store = connect_store(&config).await?;
    ResultStore::ensure_schema(store.as_ref())
        .await
        .context("creating results table")?;

    let run = EvaluationRun::new(source, store, notifier(&config)?, config.recipient());
    let outcome = run.run(&request).await?;
    Ok(outcome)
}

pub async fn status_from_env() -> Result<StatusReport> {
    let config = LottoConfig::from_env()?;
    let source = http_source(&config, config.http_client_config())?;
    let store = connect_store(&config).await?;

    let latest_remote_id = latest_draw_id(source.as_ref())
        .await
        .context("resolving latest draw id")?;
    let stored_draws = DrawStore::count(store.as_ref())
        .await
        .context("counting stored draws")?;
    let recorded_results = ResultStore::count(store.as_ref())
        .await
        .context("counting recorded results")?;

    Ok(StatusReport {
        latest_remote_id,
        stored_draws,
        recorded_results,
    })
}
