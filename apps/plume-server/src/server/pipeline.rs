use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use plume_core::{AccountId, GuildId, InboundMessage, SystemId};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use super::{
    clock::{Clock, SystemClock},
    core::AppConfig,
    db::PgRepository,
    lanes::{ChannelLanes, LaneFull},
    metrics::ProxyMetrics,
    orchestrator::{ProxyError, ProxyOrchestrator, ProxyOutcome},
    repository::{InMemoryRepository, Repository},
    transport::{HttpRelayTransport, RelayTransport},
};

/// What one maintenance pass removed, plus what is still tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rate_limit_buckets: usize,
    pub latches: usize,
    pub cache_entries: usize,
    pub relays: usize,
    pub warning_slots: usize,
    pub tracked_buckets: usize,
    pub tracked_relays: usize,
}

/// The proxy service as a whole: orchestrator, channel lanes and upkeep.
pub struct ProxyPipeline {
    orchestrator: Arc<ProxyOrchestrator>,
    lanes: Arc<ChannelLanes>,
    metrics: Arc<ProxyMetrics>,
}

impl ProxyPipeline {
    pub fn new(
        config: &AppConfig,
        repo: Arc<dyn Repository>,
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(ProxyMetrics::default());
        let orchestrator = Arc::new(ProxyOrchestrator::new(
            config.orchestrator_config(),
            repo,
            transport,
            clock,
            metrics.clone(),
        ));
        let lanes = Arc::new(ChannelLanes::new(
            orchestrator.clone(),
            metrics.clone(),
            config.lane_capacity,
            config.lane_idle_timeout,
        ));
        Self {
            orchestrator,
            lanes,
            metrics,
        }
    }

    /// Wires the production repository and HTTP transport from `config`.
    ///
    /// # Errors
    /// Returns an error when the database URL or relay client is unusable.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let repo: Arc<dyn Repository> = if let Some(database_url) = &config.database_url {
            Arc::new(
                PgRepository::connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            tracing::warn!(event = "pipeline.init", repository = "in_memory");
            Arc::new(InMemoryRepository::new())
        };
        let transport = HttpRelayTransport::new(
            &config.relay_api_url,
            &config.relay_token,
            config.relay_request_timeout,
        )
        .map_err(|e| anyhow!("relay client init failed: {e}"))?;
        Ok(Self::new(
            config,
            repo,
            Arc::new(transport),
            Arc::new(SystemClock),
        ))
    }

    /// Queue `message` on its channel's lane.
    ///
    /// # Errors
    /// Returns [`LaneFull`] when the lane is at capacity.
    pub fn submit(&self, message: InboundMessage) -> Result<(), LaneFull> {
        self.lanes.submit(message)
    }

    /// Process `message` directly, bypassing the lanes.
    ///
    /// # Errors
    /// Returns [`ProxyError`] as [`ProxyOrchestrator::handle`] does.
    pub async fn handle(&self, message: InboundMessage) -> Result<ProxyOutcome, ProxyError> {
        self.orchestrator.handle(message).await
    }

    pub fn orchestrator(&self) -> &ProxyOrchestrator {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn active_lanes(&self) -> usize {
        self.lanes.active_lanes()
    }

    pub fn invalidate_account(&self, account: AccountId) {
        self.orchestrator.cache().invalidate(account);
    }

    pub fn invalidate_system(&self, system: SystemId) {
        self.orchestrator.cache().invalidate_system(system);
    }

    pub fn invalidate_guild_settings(&self, guild: GuildId, system: SystemId) {
        self.orchestrator
            .cache()
            .invalidate_guild_settings(guild, system);
    }

    pub fn run_maintenance(&self) -> MaintenanceReport {
        let orchestrator = &self.orchestrator;
        let report = MaintenanceReport {
            rate_limit_buckets: orchestrator.limiter().sweep(),
            latches: orchestrator.latch().prune_expired(),
            cache_entries: orchestrator.cache().purge_expired(),
            relays: orchestrator.registry().purge_expired(),
            warning_slots: orchestrator.warnings().prune(),
            tracked_buckets: orchestrator.limiter().len(),
            tracked_relays: orchestrator.registry().len(),
        };
        tracing::debug!(
            event = "pipeline.maintenance",
            rate_limit_buckets = report.rate_limit_buckets,
            latches = report.latches,
            cache_entries = report.cache_entries,
            relays = report.relays,
            warning_slots = report.warning_slots,
            tracked_buckets = report.tracked_buckets,
            tracked_relays = report.tracked_relays
        );
        report
    }

    /// Runs [`ProxyPipeline::run_maintenance`] every `interval` until aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pipeline.run_maintenance();
            }
        })
    }

    /// Waits for pending origin deletions.
    pub async fn settle(&self) {
        self.orchestrator.background().settle().await;
    }
}
