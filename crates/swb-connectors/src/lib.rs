//! Connector ingress: external-source adapters that translate provider
//! events into `ingest.v1` envelopes and submit them.
//!
//! Connectors are stateless with respect to routing; they own only their
//! source cursor and their heartbeat. Translation is pure per adapter
//! module; the [`ConnectorRunner`] owns the poll loop, cursor persistence,
//! and stats rollups.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use swb_schemas::IngressEnvelope;

pub mod chat;
pub mod email;
pub mod telegram;

/// How the core answered one submitted envelope.
#[derive(Debug, Clone)]
pub enum SubmitResult {
    Accepted { request_id: Uuid, duplicate: bool },
    /// Structured backpressure rejection; the connector should slow down.
    Overload,
    /// Malformed envelope; the connector must fix and re-submit.
    Invalid(String),
}

/// The ingest entry point as connectors see it. The daemon implements this
/// over the pipeline; tests implement it in memory.
#[async_trait]
pub trait IngestEndpoint: Send + Sync {
    async fn submit(&self, envelope: IngressEnvelope) -> Result<SubmitResult>;
}

/// One poll against the external source.
pub struct PollBatch {
    pub envelopes: Vec<IngressEnvelope>,
    /// Cursor to persist after the batch lands. `None` keeps the old one.
    pub next_cursor: Option<String>,
    pub api_calls: i64,
}

/// A pull-based external source (mailbox, chat backlog, ...).
#[async_trait]
pub trait ConnectorSource: Send + Sync {
    fn connector_type(&self) -> &str;
    fn endpoint_identity(&self) -> &str;
    async fn poll(&self, cursor: Option<&str>) -> Result<PollBatch>;
}

/// Poll loop: fetch, submit, persist cursor, roll up stats, heartbeat.
pub struct ConnectorRunner {
    source: Arc<dyn ConnectorSource>,
    ingest: Arc<dyn IngestEndpoint>,
    pool: PgPool,
    poll_interval: Duration,
}

impl ConnectorRunner {
    pub fn new(
        source: Arc<dyn ConnectorSource>,
        ingest: Arc<dyn IngestEndpoint>,
        pool: PgPool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            ingest,
            pool,
            poll_interval,
        }
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.poll_interval);
        loop {
            tick.tick().await;
            let health = match self.poll_once().await {
                Ok(()) => "healthy",
                Err(e) => {
                    error!(
                        connector = self.source.connector_type(),
                        error = ?e,
                        "connector poll failed"
                    );
                    "error"
                }
            };

            if let Err(e) = swb_db::record_connector_heartbeat(
                &self.pool,
                self.source.connector_type(),
                self.source.endpoint_identity(),
                health,
            )
            .await
            {
                error!(error = ?e, "connector heartbeat rollup failed");
            }
        }
    }

    /// One poll + submit cycle. Overload defers the cursor so the batch is
    /// re-polled later instead of dropped.
    pub async fn poll_once(&self) -> Result<()> {
        let connector_type = self.source.connector_type();
        let endpoint = self.source.endpoint_identity();

        let cursor = swb_db::load_cursor(&self.pool, connector_type, endpoint).await?;
        let batch = self.source.poll(cursor.as_deref()).await?;

        let mut ingested = 0i64;
        let mut failed = 0i64;
        let mut deduped = 0i64;
        let mut overloaded = false;

        for envelope in batch.envelopes {
            match self.ingest.submit(envelope).await? {
                SubmitResult::Accepted { duplicate: true, .. } => deduped += 1,
                SubmitResult::Accepted { .. } => ingested += 1,
                SubmitResult::Overload => {
                    warn!(connector = connector_type, "core overloaded; deferring cursor");
                    overloaded = true;
                    break;
                }
                SubmitResult::Invalid(reason) => {
                    warn!(connector = connector_type, reason, "envelope rejected as invalid");
                    failed += 1;
                }
            }
        }

        if !overloaded {
            if let Some(next) = batch.next_cursor {
                swb_db::save_cursor(&self.pool, connector_type, endpoint, &next).await?;
            }
        }

        swb_db::record_ingest_stats(
            &self.pool,
            connector_type,
            endpoint,
            ingested,
            failed,
            deduped,
            batch.api_calls,
        )
        .await?;

        if ingested + deduped + failed > 0 {
            info!(
                connector = connector_type,
                ingested, deduped, failed, "connector batch submitted"
            );
        }
        Ok(())
    }
}
