//! A capture process: lease-registered worker that runs processors and
//! campaigns for ownership.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use riptide_core::model::{CaptureId, CaptureInfo, ChangeFeedId};
use riptide_meta::{MetaClient, MetaError};
use riptide_puller::RegionEventClient;
use riptide_schema::SnapshotProvider;
use riptide_sink::MessageBusFactory;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::owner::{Owner, OwnerConfig};
use crate::processor::{Processor, ProcessorConfig};
use crate::scheduler::MinTablesScheduler;

/// Capture tuning.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Registration lease TTL; expiry removes the capture from membership.
    pub lease_ttl: Duration,
    /// Lease refresh cadence; must undercut the TTL comfortably.
    pub keepalive_interval: Duration,
    /// Pause between owner campaign attempts.
    pub campaign_interval: Duration,
    /// Changefeed discovery poll fallback.
    pub discovery_interval: Duration,
    /// Minimum gap before restarting a crashed processor.
    pub processor_restart_backoff: Duration,
    /// Address advertised to peers.
    pub advertise_addr: String,
    pub processor: ProcessorConfig,
    pub owner: OwnerConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(1500),
            campaign_interval: Duration::from_secs(1),
            discovery_interval: Duration::from_millis(500),
            processor_restart_backoff: Duration::from_secs(5),
            advertise_addr: "127.0.0.1:8300".to_string(),
            processor: ProcessorConfig::default(),
            owner: OwnerConfig::default(),
        }
    }
}

struct RunningProcessor {
    processor: Arc<Processor>,
    handle: JoinHandle<Result<()>>,
    started_at: tokio::time::Instant,
}

pub struct Capture {
    meta: MetaClient,
    info: CaptureInfo,
    region_client: Arc<dyn RegionEventClient>,
    snapshot_provider: Arc<dyn SnapshotProvider>,
    bus_factory: Option<Arc<dyn MessageBusFactory>>,
    config: CaptureConfig,
    cancel: CancellationToken,
}

impl Capture {
    pub fn new(
        meta: MetaClient,
        region_client: Arc<dyn RegionEventClient>,
        snapshot_provider: Arc<dyn SnapshotProvider>,
        bus_factory: Option<Arc<dyn MessageBusFactory>>,
        config: CaptureConfig,
        cancel: CancellationToken,
    ) -> Self {
        let info = CaptureInfo {
            id: CaptureId::new(format!("capture-{}", Uuid::new_v4())),
            advertise_addr: config.advertise_addr.clone(),
        };
        Self {
            meta,
            info,
            region_client,
            snapshot_provider,
            bus_factory,
            config,
            cancel,
        }
    }

    pub fn id(&self) -> &CaptureId {
        &self.info.id
    }

    /// Register, keep the lease alive, campaign for ownership and run
    /// processors until cancelled or the lease is lost.
    pub async fn run(&self) -> Result<()> {
        let lease = self
            .meta
            .register_capture(&self.info, self.config.lease_ttl)
            .await?;
        info!(capture = %self.info.id, lease = %lease, "capture registered");

        let keepalive = {
            let meta = self.meta.clone();
            let cancel = self.cancel.clone();
            let interval = self.config.keepalive_interval;
            let id = self.info.id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match meta.keep_alive(lease).await {
                        Ok(()) => {}
                        Err(MetaError::LeaseNotFound(_)) => {
                            // The lease expired under us: the cluster has
                            // already evicted this capture.
                            error!(capture = %id, "capture lease lost");
                            cancel.cancel();
                            return Err(ServerError::LeaseLost);
                        }
                        Err(e) if e.is_retriable() => {
                            warn!(error = %e, "lease keepalive failed, retrying");
                        }
                        Err(e) => {
                            cancel.cancel();
                            return Err(e.into());
                        }
                    }
                }
            })
        };

        let campaign = {
            let this = self.clone_parts();
            let lease_id = lease;
            tokio::spawn(async move { this.campaign_loop(lease_id).await })
        };

        let manager_result = self.processor_manager().await;

        self.cancel.cancel();
        let keepalive_result = keepalive.await.unwrap_or(Ok(()));
        let _ = campaign.await;
        // Graceful exit: give up the lease so peers evict us immediately
        // instead of waiting out the TTL.
        let _ = self.meta.store().revoke_lease(lease).await;

        keepalive_result.and(manager_result)
    }

    fn clone_parts(&self) -> CaptureParts {
        CaptureParts {
            meta: self.meta.clone(),
            id: self.info.id.clone(),
            region_client: self.region_client.clone(),
            snapshot_provider: self.snapshot_provider.clone(),
            bus_factory: self.bus_factory.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Discover changefeeds and keep one processor running per feed.
    async fn processor_manager(&self) -> Result<()> {
        let mut processors: HashMap<ChangeFeedId, RunningProcessor> = HashMap::new();
        let mut watch = self.meta.watch_changefeeds().await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = watch.recv() => {}
                _ = tokio::time::sleep(self.config.discovery_interval) => {}
            }

            let infos = match self.meta.get_all_changefeeds().await {
                Ok(infos) => infos,
                Err(e) if e.is_retriable() => {
                    warn!(error = %e, "changefeed discovery failed");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let known: HashMap<_, _> = infos.into_iter().collect();

            // Stop processors for removed changefeeds.
            let gone: Vec<ChangeFeedId> = processors
                .keys()
                .filter(|id| !known.contains_key(*id))
                .cloned()
                .collect();
            for id in gone {
                if let Some(running) = processors.remove(&id) {
                    info!(changefeed = %id, "stopping processor for removed changefeed");
                    running.processor.stop();
                    let _ = running.handle.await;
                }
            }

            for (id, info) in known {
                let needs_start = match processors.get(&id) {
                    None => true,
                    Some(running) => {
                        running.handle.is_finished()
                            && running.started_at.elapsed()
                                > self.config.processor_restart_backoff
                    }
                };
                if !needs_start {
                    continue;
                }
                if let Some(stale) = processors.remove(&id) {
                    match stale.handle.await {
                        Ok(Ok(())) | Ok(Err(_)) => {}
                        Err(join_err) => {
                            error!(changefeed = %id, error = %join_err, "processor panicked")
                        }
                    }
                }

                match self.start_processor(&id, info).await {
                    Ok(running) => {
                        processors.insert(id, running);
                    }
                    Err(e) => {
                        warn!(changefeed = %id, error = %e, "processor start failed");
                    }
                }
            }
        }

        for (_, running) in processors.drain() {
            running.processor.stop();
            let _ = running.handle.await;
        }
        Ok(())
    }

    async fn start_processor(
        &self,
        id: &ChangeFeedId,
        info: riptide_core::model::ChangeFeedInfo,
    ) -> Result<RunningProcessor> {
        let processor = Processor::new(
            self.meta.clone(),
            id.clone(),
            self.info.id.clone(),
            info,
            self.region_client.clone(),
            self.snapshot_provider.clone(),
            self.bus_factory.clone(),
            self.config.processor.clone(),
            self.cancel.child_token(),
        )
        .await?;
        let handle = tokio::spawn(processor.clone().run());
        info!(changefeed = %id, capture = %self.info.id, "processor started");
        Ok(RunningProcessor {
            processor,
            handle,
            started_at: tokio::time::Instant::now(),
        })
    }
}

/// The owned subset of capture state the campaign task needs.
struct CaptureParts {
    meta: MetaClient,
    id: CaptureId,
    region_client: Arc<dyn RegionEventClient>,
    snapshot_provider: Arc<dyn SnapshotProvider>,
    bus_factory: Option<Arc<dyn MessageBusFactory>>,
    config: CaptureConfig,
    cancel: CancellationToken,
}

impl CaptureParts {
    async fn campaign_loop(&self, lease: riptide_meta::LeaseId) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.campaign_interval) => {}
            }
            match self.meta.campaign_owner(&self.id, lease).await {
                Ok(Some(lock)) => {
                    info!(capture = %self.id, "won owner election");
                    let owner = Owner::new(
                        self.meta.clone(),
                        lock.clone(),
                        self.region_client.clone(),
                        self.snapshot_provider.clone(),
                        self.bus_factory.clone(),
                        Box::new(MinTablesScheduler),
                        self.config.owner.clone(),
                        self.cancel.child_token(),
                    );
                    if let Err(e) = owner.run().await {
                        if !e.is_cancelled() {
                            warn!(error = %e, "owner exited with error");
                        }
                    }
                    let _ = self.meta.resign_owner(&lock).await;
                }
                Ok(None) => {}
                Err(e) if e.is_retriable() => {
                    warn!(error = %e, "owner campaign failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
