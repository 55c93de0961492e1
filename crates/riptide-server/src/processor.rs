//! The per-(changefeed, capture) processor.
//!
//! Realizes the task status assigned by the owner: runs one
//! puller -> buffer -> sorter -> mounter chain per table, merges per-table
//! outputs into a single commit-ts-ordered stream bounded by the
//! cluster-wide resolved-ts, drains it into the sink, and reports the
//! local resolved/checkpoint position.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use riptide_core::model::{
    CaptureId, ChangeFeedId, ChangeFeedInfo, OperationStatus, RawTxn, Span, TableId, TaskPosition,
    TaskWorkload, Ts, WorkloadInfo,
};
use riptide_core::retry::ExponentialBackoff;
use riptide_core::TableFilter;
use riptide_meta::{MetaClient, Revision};
use riptide_puller::{Puller, RegionEventClient};
use riptide_schema::{Mounter, SchemaSnapshot, SnapshotProvider};
use riptide_sink::{new_sink, MessageBusFactory, Sink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ddl_handler::DdlHandler;
use crate::error::{Result, ServerError};

/// Processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Per-table puller buffer capacity.
    pub table_buffer_size: usize,
    /// Per-table mounted-transaction channel capacity.
    pub channel_size: usize,
    /// How often the local resolved-ts and checkpoint-ts are persisted.
    pub position_interval: Duration,
    /// How often the per-table workload report is persisted.
    pub workload_interval: Duration,
    /// Task-status poll fallback when no watch event arrives.
    pub status_poll_interval: Duration,
    /// Global resolved-ts poll interval.
    pub global_poll_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            table_buffer_size: 64,
            channel_size: 64,
            position_interval: Duration::from_secs(1),
            workload_interval: Duration::from_secs(10),
            status_poll_interval: Duration::from_millis(200),
            global_poll_interval: Duration::from_millis(100),
        }
    }
}

/// What flows from the merge stage to the sink drain. Transactions stay
/// raw until the drain stage: mounting happens behind the global barrier,
/// after every DDL at or below the forwarding horizon has been applied to
/// the snapshot.
#[derive(Debug, Clone)]
enum ProcessorEntry {
    Txn(RawTxn),
    Resolved(Ts),
}

/// Raw-transaction channel with single-slot put-back, so the merge stage
/// can peek one transaction past the forwarding boundary.
struct TxnChannel {
    rx: mpsc::Receiver<RawTxn>,
    put_back: Option<RawTxn>,
}

impl TxnChannel {
    fn new(rx: mpsc::Receiver<RawTxn>) -> Self {
        Self { rx, put_back: None }
    }

    /// Forward every transaction with `commit_ts <= ts` into `out`.
    ///
    /// A resolved tick at or beyond `ts` terminates the pass: the sorter
    /// releases data before the tick that covers it, so nothing at or
    /// below `ts` can still be behind such a tick. Returns false when the
    /// channel is closed (pipeline torn down).
    async fn forward(&mut self, ts: Ts, out: &mpsc::Sender<ProcessorEntry>) -> Result<bool> {
        if let Some(txn) = &self.put_back {
            if txn.commit_ts > ts {
                return Ok(true);
            }
        }
        if let Some(txn) = self.put_back.take() {
            let at_horizon = txn.is_resolved_tick() && txn.commit_ts == ts;
            Self::emit(txn, out).await?;
            if at_horizon {
                return Ok(true);
            }
        }
        loop {
            match self.rx.recv().await {
                None => return Ok(false),
                Some(txn) if txn.commit_ts > ts => {
                    self.put_back = Some(txn);
                    return Ok(true);
                }
                Some(txn) if txn.is_resolved_tick() && txn.commit_ts == ts => {
                    return Ok(true);
                }
                Some(txn) => Self::emit(txn, out).await?,
            }
        }
    }

    async fn emit(txn: RawTxn, out: &mpsc::Sender<ProcessorEntry>) -> Result<()> {
        // Per-table resolved ticks are consumed here; the merge stage emits
        // the cluster-wide marker itself.
        if txn.is_resolved_tick() {
            return Ok(());
        }
        out.send(ProcessorEntry::Txn(txn))
            .await
            .map_err(|_| ServerError::Cancelled)
    }
}

/// One table's running chain.
struct TablePipeline {
    cancel: CancellationToken,
    channel: Arc<tokio::sync::Mutex<TxnChannel>>,
    /// Highest global resolved-ts this table has been forwarded through.
    forwarded: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl TablePipeline {
    fn stop(&self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct Processor {
    meta: MetaClient,
    cf_id: ChangeFeedId,
    capture_id: CaptureId,
    info: ChangeFeedInfo,
    filter: TableFilter,
    region_client: Arc<dyn RegionEventClient>,
    sink: Arc<dyn Sink>,
    snapshot: Arc<RwLock<SchemaSnapshot>>,
    mounter: Arc<Mounter>,
    config: ProcessorConfig,
    cancel: CancellationToken,

    tables: Mutex<HashMap<TableId, Arc<TablePipeline>>>,
    table_resolved: Arc<DashMap<TableId, Ts>>,
    txn_count: AtomicU64,
    position: tokio::sync::Mutex<(TaskPosition, Revision)>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        meta: MetaClient,
        cf_id: ChangeFeedId,
        capture_id: CaptureId,
        info: ChangeFeedInfo,
        region_client: Arc<dyn RegionEventClient>,
        snapshot_provider: Arc<dyn SnapshotProvider>,
        bus_factory: Option<Arc<dyn MessageBusFactory>>,
        config: ProcessorConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let filter = TableFilter::new(&info.config)?;
        let start_ts = match meta.get_changefeed_status(&cf_id).await? {
            Some((status, _)) if !status.checkpoint_ts.is_zero() => status.checkpoint_ts,
            _ => info.get_start_ts(),
        };
        let snapshot = Arc::new(RwLock::new(snapshot_provider.snapshot_at(start_ts).await?));
        let mounter = Arc::new(Mounter::new(snapshot.clone()));
        // The sink shares the processor's snapshot, so message-bus
        // encoding always sees the schema the mounter used.
        let sink = new_sink(
            &info.sink_uri,
            &cf_id.0,
            &info.config,
            snapshot.clone(),
            bus_factory.as_ref().map(|f| f.as_ref() as _),
        )?;

        // A restart on the same capture resumes from the stored position;
        // a fresh capture seeds one at the start-ts.
        let (initial, rev) = match meta.get_task_position(&cf_id, &capture_id).await? {
            Some((position, rev)) => (position, rev),
            None => {
                let position = TaskPosition {
                    checkpoint_ts: start_ts,
                    resolved_ts: start_ts,
                    count: 0,
                    error: None,
                };
                let rev = meta
                    .put_task_position(&cf_id, &capture_id, &position, 0)
                    .await?;
                (position, rev)
            }
        };

        Ok(Arc::new(Self {
            meta,
            cf_id,
            capture_id,
            info,
            filter,
            region_client,
            sink,
            snapshot,
            mounter,
            config,
            cancel,
            tables: Mutex::new(HashMap::new()),
            table_resolved: Arc::new(DashMap::new()),
            txn_count: AtomicU64::new(0),
            position: tokio::sync::Mutex::new((initial, rev)),
        }))
    }

    /// Run all processor workers until cancellation or a terminal error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(changefeed = %self.cf_id, capture = %self.capture_id, "processor starting");

        let initial_rev = self.position.lock().await.1;
        debug!(revision = initial_rev, "initial task position persisted");

        let ddl_handler = DdlHandler::new(
            self.region_client.clone(),
            self.info.get_start_ts(),
            &self.cancel,
        );

        let (entry_tx, entry_rx) = mpsc::channel(128);
        let (executed_tx, executed_rx) = mpsc::channel(128);

        let mut workers = tokio::task::JoinSet::new();
        workers.spawn(self.clone().status_worker());
        workers.spawn(self.clone().global_resolved_worker(ddl_handler, entry_tx));
        workers.spawn(self.clone().sink_drain_worker(entry_rx, executed_tx));
        workers.spawn(self.clone().checkpoint_worker(executed_rx));
        workers.spawn(self.clone().local_resolved_worker());
        workers.spawn(self.clone().workload_worker());

        // The first failing worker cancels the rest; workers finishing
        // cleanly on cancellation drain here.
        let mut first_error: Option<ServerError> = None;
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        // Surface the fault through the task position so
                        // the owner can fail the changefeed.
                        let reason = e.to_string();
                        let _ = self
                            .update_position(|pos| pos.error = Some(reason.clone()))
                            .await;
                        first_error = Some(e);
                    }
                    self.cancel.cancel();
                }
                Err(join_err) => {
                    error!(error = %join_err, "processor worker panicked");
                    self.cancel.cancel();
                }
            }
        }

        for (_, pipeline) in self.tables.lock().drain() {
            pipeline.stop();
        }
        info!(changefeed = %self.cf_id, capture = %self.capture_id, "processor stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// CAS update of the task position, reloading on conflict.
    async fn update_position<F>(&self, apply: F) -> Result<()>
    where
        F: Fn(&mut TaskPosition),
    {
        let mut guard = self.position.lock().await;
        loop {
            let (mut pos, rev) = guard.clone();
            apply(&mut pos);
            pos.count = self.txn_count.load(Ordering::Relaxed);
            match self
                .meta
                .put_task_position(&self.cf_id, &self.capture_id, &pos, rev)
                .await
            {
                Ok(new_rev) => {
                    *guard = (pos, new_rev);
                    return Ok(());
                }
                Err(e) if e.is_cas_conflict() => {
                    match self
                        .meta
                        .get_task_position(&self.cf_id, &self.capture_id)
                        .await?
                    {
                        Some(latest) => *guard = latest,
                        None => return Err(ServerError::Cancelled),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ---- task status handling ----

    async fn status_worker(self: Arc<Self>) -> Result<()> {
        let mut watch = self
            .meta
            .watch_task_status(&self.cf_id, &self.capture_id)
            .await?;
        let mut had_status = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = watch.recv() => {}
                _ = tokio::time::sleep(self.config.status_poll_interval) => {}
            }
            match self.process_status(&mut had_status).await {
                Ok(()) => {}
                Err(e) if e.is_retriable() => {
                    warn!(error = %e, "task status pass failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process_status(&self, had_status: &mut bool) -> Result<()> {
        let Some((mut status, rev)) = self
            .meta
            .get_task_status(&self.cf_id, &self.capture_id)
            .await?
        else {
            if *had_status {
                // Our assignment was removed: the capture was evicted or
                // the changefeed is being torn down.
                info!(changefeed = %self.cf_id, "task status removed, stopping processor");
                self.cancel.cancel();
            }
            return Ok(());
        };
        *had_status = true;

        let mut dirty = false;
        let op_tables: Vec<TableId> = status.operation.keys().copied().collect();
        for table_id in op_tables {
            let op = status.operation[&table_id];
            match (op.delete, op.status) {
                (false, OperationStatus::Pending) => {
                    self.add_table(table_id, op.boundary_ts).await?;
                    status.operation.get_mut(&table_id).expect("op exists").status =
                        OperationStatus::Processed;
                    dirty = true;
                }
                (false, OperationStatus::Processed) => {
                    let caught_up = self
                        .table_resolved
                        .get(&table_id)
                        .map(|ts| *ts >= op.boundary_ts)
                        .unwrap_or(false);
                    if caught_up {
                        status.operation.get_mut(&table_id).expect("op exists").status =
                            OperationStatus::Finished;
                        dirty = true;
                    }
                }
                (true, OperationStatus::Pending) => {
                    let has_pipeline = self.tables.lock().contains_key(&table_id);
                    let next = if has_pipeline {
                        // Keep the pipeline draining until the boundary.
                        OperationStatus::Processed
                    } else {
                        OperationStatus::Finished
                    };
                    status.operation.get_mut(&table_id).expect("op exists").status = next;
                    dirty = true;
                }
                (true, OperationStatus::Processed) => {
                    if self.try_finish_removal(table_id, op.boundary_ts) {
                        status.operation.get_mut(&table_id).expect("op exists").status =
                            OperationStatus::Finished;
                        dirty = true;
                    }
                }
                (_, OperationStatus::Finished) => {}
            }
        }

        // Tables assigned with no pending operation (an owner recovering
        // from a stale status) still need pipelines.
        let assigned: Vec<(TableId, Ts)> = status
            .tables
            .iter()
            .filter(|(id, _)| !status.operation.contains_key(id))
            .map(|(id, ts)| (*id, *ts))
            .collect();
        for (table_id, start_ts) in assigned {
            let missing = !self.tables.lock().contains_key(&table_id);
            if missing {
                self.add_table(table_id, start_ts).await?;
            }
        }

        if dirty {
            match self
                .meta
                .put_task_status(&self.cf_id, &self.capture_id, &status, rev)
                .await
            {
                Ok(_) => {}
                // The owner raced us; the next pass reloads and reapplies.
                Err(e) if e.is_cas_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn add_table(&self, table_id: TableId, start_ts: Ts) -> Result<()> {
        if self.tables.lock().contains_key(&table_id) {
            return Ok(());
        }
        // Never start below the cluster-wide checkpoint.
        let global_checkpoint = self
            .meta
            .get_changefeed_status(&self.cf_id)
            .await?
            .map(|(s, _)| s.checkpoint_ts)
            .unwrap_or(Ts::ZERO);
        let start_ts = start_ts.max_with(global_checkpoint);

        info!(changefeed = %self.cf_id, table = %table_id, %start_ts, "starting table pipeline");
        let child = self.cancel.child_token();
        let puller = Arc::new(Puller::new(
            self.region_client.clone(),
            Span::table_span(table_id.0),
            start_ts,
            self.config.table_buffer_size,
            child.clone(),
        ));

        // Stream loss kills only this table; reconnect with backoff.
        let run_task = {
            let puller = puller.clone();
            let child = child.clone();
            tokio::spawn(async move {
                let mut backoff =
                    ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
                loop {
                    match puller.run().await {
                        Err(e) if e.is_retriable() && !child.is_cancelled() => {
                            let delay = backoff.next_delay().unwrap_or(Duration::from_secs(10));
                            warn!(error = %e, ?delay, "table stream lost, reconnecting");
                            tokio::time::sleep(delay).await;
                        }
                        _ => return,
                    }
                }
            })
        };

        let (raw_tx, mut raw_rx) = mpsc::channel(self.config.channel_size);
        let collect_task = {
            let puller = puller.clone();
            tokio::spawn(async move {
                let _ = puller.collect_raw_txns(raw_tx).await;
            })
        };

        let (txn_tx, txn_rx) = mpsc::channel(self.config.channel_size);
        let feed_task = {
            let table_resolved = self.table_resolved.clone();
            tokio::spawn(async move {
                while let Some(raw) = raw_rx.recv().await {
                    // Every transaction, resolved ticks included, advances
                    // this table's local resolved-ts.
                    table_resolved.insert(table_id, raw.commit_ts);
                    if txn_tx.send(raw).await.is_err() {
                        return;
                    }
                }
            })
        };

        let pipeline = Arc::new(TablePipeline {
            cancel: child,
            channel: Arc::new(tokio::sync::Mutex::new(TxnChannel::new(txn_rx))),
            forwarded: AtomicU64::new(start_ts.0),
            tasks: vec![run_task, collect_task, feed_task],
        });
        self.table_resolved.insert(table_id, start_ts);
        self.tables.lock().insert(table_id, pipeline);
        Ok(())
    }

    /// A removing table is done once it has been forwarded through its
    /// boundary and the sink has acknowledged that far.
    fn try_finish_removal(&self, table_id: TableId, boundary: Ts) -> bool {
        let Some(pipeline) = self.tables.lock().get(&table_id).cloned() else {
            return true;
        };
        let forwarded = Ts::new(pipeline.forwarded.load(Ordering::Acquire));
        if forwarded >= boundary && self.sink.checkpoint_ts() >= boundary {
            info!(changefeed = %self.cf_id, table = %table_id, "table drained, tearing down");
            pipeline.stop();
            self.tables.lock().remove(&table_id);
            self.table_resolved.remove(&table_id);
            true
        } else {
            false
        }
    }

    // ---- merge stage ----

    /// Forward per-table transactions up to the cluster-wide resolved-ts,
    /// then emit a synthetic resolved marker, so the sink never sees a
    /// commit-ts that has not been declared resolved cluster-wide.
    async fn global_resolved_worker(
        self: Arc<Self>,
        ddl_handler: DdlHandler,
        entry_tx: mpsc::Sender<ProcessorEntry>,
    ) -> Result<()> {
        let mut last_global = Ts::ZERO;
        let mut pending_jobs: Vec<riptide_core::model::DdlJob> = Vec::new();
        loop {
            if self.cancel.is_cancelled() {
                ddl_handler.close().await;
                return Ok(());
            }
            let global = match self.meta.get_changefeed_status(&self.cf_id).await {
                Ok(Some((status, _))) => status.resolved_ts,
                Ok(None) => Ts::ZERO,
                Err(e) if e.is_retriable() => {
                    tokio::time::sleep(self.config.global_poll_interval).await;
                    continue;
                }
                Err(e) => {
                    ddl_handler.close().await;
                    return Err(e.into());
                }
            };
            if global <= last_global {
                tokio::select! {
                    _ = self.cancel.cancelled() => continue,
                    _ = tokio::time::sleep(self.config.global_poll_interval) => continue,
                }
            }

            // Advance the shared snapshot through every DDL at or below
            // the new horizon before mounting rows beyond it.
            let (_, jobs) = ddl_handler.pull_ddl()?;
            pending_jobs.extend(jobs);
            pending_jobs.sort_by_key(|j| j.finished_ts);
            let mut kept = Vec::with_capacity(pending_jobs.len());
            for job in pending_jobs.drain(..) {
                if job.finished_ts <= global {
                    let mut snapshot = self.snapshot.write();
                    if job.finished_ts > snapshot.version() {
                        snapshot.apply(&job)?;
                    }
                } else {
                    kept.push(job);
                }
            }
            pending_jobs = kept;

            let pipelines: Vec<Arc<TablePipeline>> =
                self.tables.lock().values().cloned().collect();
            let forwards = pipelines.iter().map(|pipeline| {
                let entry_tx = entry_tx.clone();
                async move {
                    let mut channel = pipeline.channel.lock().await;
                    let open = channel.forward(global, &entry_tx).await?;
                    pipeline.forwarded.store(global.0, Ordering::Release);
                    Ok::<bool, ServerError>(open)
                }
            });
            futures::future::try_join_all(forwards).await?;

            entry_tx
                .send(ProcessorEntry::Resolved(global))
                .await
                .map_err(|_| ServerError::Cancelled)?;
            last_global = global;
        }
    }

    // ---- sink drain ----

    async fn sink_drain_worker(
        self: Arc<Self>,
        mut entry_rx: mpsc::Receiver<ProcessorEntry>,
        executed_tx: mpsc::Sender<ProcessorEntry>,
    ) -> Result<()> {
        while let Some(entry) = entry_rx.recv().await {
            match entry {
                ProcessorEntry::Txn(raw) => {
                    // Mounting happens here, behind the global barrier, so
                    // the snapshot already covers every DDL below this
                    // commit-ts.
                    let commit_ts = raw.commit_ts;
                    let mut txn = self.mounter.mount(raw)?;
                    if !self.filter.filter_txn(&mut txn) {
                        continue;
                    }
                    self.sink.emit_row_changed_events(&txn.dmls).await?;
                    self.txn_count.fetch_add(1, Ordering::Relaxed);
                    debug!(%commit_ts, "transaction drained");
                }
                ProcessorEntry::Resolved(ts) => {
                    self.sink.emit_resolved_event(ts).await?;
                    let _ = executed_tx.send(ProcessorEntry::Resolved(ts)).await;
                }
            }
        }
        // Channel closed by the merge stage: executed_tx drops here, which
        // closes the checkpoint worker in turn.
        Ok(())
    }

    // ---- position workers ----

    /// Consume executed entries and persist the checkpoint. The executed
    /// channel closes before the final write, so the last checkpoint
    /// always covers everything emitted.
    async fn checkpoint_worker(
        self: Arc<Self>,
        mut executed_rx: mpsc::Receiver<ProcessorEntry>,
    ) -> Result<()> {
        let mut candidate = Ts::ZERO;
        let mut written = Ts::ZERO;
        let mut ticker = tokio::time::interval(self.config.position_interval);
        loop {
            tokio::select! {
                entry = executed_rx.recv() => match entry {
                    None => break,
                    Some(ProcessorEntry::Resolved(ts)) => candidate = candidate.max_with(ts),
                    Some(ProcessorEntry::Txn(_)) => {}
                },
                _ = ticker.tick() => {
                    if candidate > written {
                        self.update_position(|pos| {
                            pos.checkpoint_ts = pos.checkpoint_ts.max_with(candidate);
                        })
                        .await?;
                        written = candidate;
                    }
                }
            }
        }
        if candidate > written {
            self.update_position(|pos| {
                pos.checkpoint_ts = pos.checkpoint_ts.max_with(candidate);
            })
            .await?;
        }
        Ok(())
    }

    /// Persist the local resolved-ts: the minimum over active tables, or
    /// the cluster-wide view when this capture holds no tables.
    async fn local_resolved_worker(self: Arc<Self>) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.position_interval) => {}
            }
            let local = self
                .table_resolved
                .iter()
                .map(|entry| *entry.value())
                .min();
            let resolved = match local {
                Some(ts) => ts,
                None => match self.meta.get_changefeed_status(&self.cf_id).await? {
                    Some((status, _)) => status.resolved_ts,
                    None => continue,
                },
            };
            self.update_position(|pos| {
                pos.resolved_ts = pos.resolved_ts.max_with(resolved);
            })
            .await?;
        }
    }

    async fn workload_worker(self: Arc<Self>) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.workload_interval) => {}
            }
            let workload: TaskWorkload = self
                .tables
                .lock()
                .keys()
                .map(|id| (*id, WorkloadInfo { workload: 1 }))
                .collect();
            self.meta
                .put_task_workload(&self.cf_id, &self.capture_id, &workload)
                .await?;
        }
    }
}
