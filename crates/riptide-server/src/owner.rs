//! The owner: cluster-wide changefeed controller.
//!
//! Exactly one capture holds the owner lock. For every changefeed it
//! (a) maintains the table set implied by DDL history and filters,
//! (b) places tables on live captures, (c) advances the global
//! resolved/checkpoint timestamps, (d) sequences DDL application, and
//! (e) persists the changefeed status.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use riptide_core::model::{
    AdminJobType, CaptureId, CaptureInfo, ChangeFeedId, ChangeFeedInfo, ChangeFeedState,
    ChangeFeedStatus, DDLEvent, DdlJob, TableId, TaskPosition, TaskStatus, Ts,
};
use riptide_core::TableFilter;
use riptide_meta::{MetaClient, OwnerLock, Revision};
use riptide_puller::RegionEventClient;
use riptide_schema::{SchemaInfoGetter, SchemaSnapshot, SnapshotProvider};
use riptide_sink::{new_sink, MessageBusFactory, Sink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ddl_handler::DdlHandler;
use crate::error::{Result, ServerError};
use crate::scheduler::Scheduler;

/// Owner tuning.
#[derive(Debug, Clone)]
pub struct OwnerConfig {
    /// Periodic tick ceiling; watches may trigger work sooner.
    pub tick_interval: Duration,
    /// Deadline for one tick.
    pub tick_timeout: Duration,
    /// Minimum gap between periodic rebalance passes.
    pub rebalance_interval: Duration,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            tick_timeout: Duration::from_secs(10),
            rebalance_interval: Duration::from_secs(600),
        }
    }
}

/// DDL sequencing states for one changefeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DdlExecState {
    /// Normal DML progress.
    SyncDml,
    /// A DDL barrier is set; waiting for every processor to drain to it.
    WaitToExecDdl,
    /// The barrier is reached; applying the job downstream.
    ExecDdl,
    /// Downstream DDL failed; operator action required.
    DdlExecuteFailed,
}

/// Owner-side state for one changefeed.
struct OwnedChangeFeed {
    id: ChangeFeedId,
    info: ChangeFeedInfo,
    filter: TableFilter,
    status: ChangeFeedStatus,
    status_rev: Revision,
    schema: Arc<RwLock<SchemaSnapshot>>,
    ddl_handler: DdlHandler,
    ddl_resolved_ts: Ts,
    ddl_executed_ts: Ts,
    ddl_job_history: VecDeque<DdlJob>,
    exec_state: DdlExecState,
    /// Tables known to the owner but not yet assigned: id -> start-ts.
    orphan_tables: BTreeMap<TableId, Ts>,
    /// Tables being withdrawn: id -> drain boundary.
    to_clean_tables: BTreeMap<TableId, Ts>,
    /// Two-phase rebalance plan: once the source finishes its delete, the
    /// freed table is directed here instead of through the scheduler.
    move_targets: HashMap<TableId, CaptureId>,
    sink: Arc<dyn Sink>,
    last_rebalance: tokio::time::Instant,
}

pub struct Owner {
    meta: MetaClient,
    lock: OwnerLock,
    region_client: Arc<dyn RegionEventClient>,
    snapshot_provider: Arc<dyn SnapshotProvider>,
    bus_factory: Option<Arc<dyn MessageBusFactory>>,
    scheduler: Box<dyn Scheduler>,
    config: OwnerConfig,
    cancel: CancellationToken,
    changefeeds: HashMap<ChangeFeedId, OwnedChangeFeed>,
}

impl Owner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta: MetaClient,
        lock: OwnerLock,
        region_client: Arc<dyn RegionEventClient>,
        snapshot_provider: Arc<dyn SnapshotProvider>,
        bus_factory: Option<Arc<dyn MessageBusFactory>>,
        scheduler: Box<dyn Scheduler>,
        config: OwnerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            meta,
            lock,
            region_client,
            snapshot_provider,
            bus_factory,
            scheduler,
            config,
            cancel,
            changefeeds: HashMap::new(),
        }
    }

    /// Drive ticks until cancellation or loss of the owner lock. Losing
    /// the lock is a silent exit: a peer has taken over.
    pub async fn run(mut self) -> Result<()> {
        info!(owner = %self.lock.capture_id, "owner started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
            if !self.meta.is_owner(&self.lock).await? {
                info!(owner = %self.lock.capture_id, "owner lock lost, stepping down");
                break;
            }
            match tokio::time::timeout(self.config.tick_timeout, self.tick()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => break,
                Ok(Err(e)) => {
                    // The tick aborted; persisted state is untouched and
                    // the next tick re-reads everything.
                    warn!(error = %e, "owner tick failed");
                }
                Err(_) => warn!("owner tick exceeded deadline"),
            }
        }
        for (_, cf) in self.changefeeds.drain() {
            cf.ddl_handler.close().await;
        }
        info!(owner = %self.lock.capture_id, "owner stopped");
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        let captures = self.meta.list_captures().await?;
        self.sync_changefeeds(&captures).await?;

        let live: HashSet<CaptureId> = captures.iter().map(|c| c.id.clone()).collect();
        let ids: Vec<ChangeFeedId> = self.changefeeds.keys().cloned().collect();
        for id in ids {
            let cf = self.changefeeds.get_mut(&id).expect("changefeed present");
            match cf
                .process(&self.meta, self.scheduler.as_ref(), &live, &self.config)
                .await
            {
                Ok(()) => {}
                Err(e) if is_terminal(&e) => {
                    error!(changefeed = %id, error = %e, "changefeed failed");
                    cf.fail(&self.meta, e.to_string()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reconcile the set of owned changefeeds with the definitions in the
    /// metadata store and apply admin jobs.
    async fn sync_changefeeds(&mut self, captures: &[CaptureInfo]) -> Result<()> {
        let infos = self.meta.get_all_changefeeds().await?;
        let known: HashSet<ChangeFeedId> = infos.iter().map(|(id, _)| id.clone()).collect();

        let gone: Vec<ChangeFeedId> = self
            .changefeeds
            .keys()
            .filter(|id| !known.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            info!(changefeed = %id, "changefeed definition removed");
            if let Some(cf) = self.changefeeds.remove(&id) {
                cf.ddl_handler.close().await;
            }
            for capture in captures {
                self.meta.delete_task_state(&id, &capture.id).await?;
            }
            self.meta.delete_changefeed(&id).await?;
        }

        for (id, info) in infos {
            if !self.changefeeds.contains_key(&id) {
                match self.init_changefeed(&id, info.clone()).await {
                    Ok(cf) => {
                        self.changefeeds.insert(id.clone(), cf);
                    }
                    Err(e) => {
                        warn!(changefeed = %id, error = %e, "changefeed init failed");
                        continue;
                    }
                }
            }
            let cf = self.changefeeds.get_mut(&id).expect("just inserted");
            cf.info = info;
            cf.apply_admin_job(&self.meta, captures).await?;
        }
        Ok(())
    }

    async fn init_changefeed(
        &self,
        id: &ChangeFeedId,
        info: ChangeFeedInfo,
    ) -> Result<OwnedChangeFeed> {
        let filter = TableFilter::new(&info.config)?;
        let (status, status_rev) = match self.meta.get_changefeed_status(id).await? {
            Some((status, rev)) => (status, rev),
            None => {
                let status = ChangeFeedStatus {
                    resolved_ts: info.get_start_ts(),
                    checkpoint_ts: info.get_start_ts(),
                    ..Default::default()
                };
                let rev = self.meta.put_changefeed_status(id, &status, 0).await?;
                (status, rev)
            }
        };
        let checkpoint = status.checkpoint_ts;

        let snapshot = self.snapshot_provider.snapshot_at(checkpoint).await?;
        // Everything already in the schema is an orphan to place.
        let mut orphan_tables = BTreeMap::new();
        for table_id in snapshot.table_ids() {
            let table = snapshot
                .table_by_id(table_id)
                .expect("listed table resolves");
            if !filter.should_ignore_table(&table.schema_name, &table.table_name) {
                orphan_tables.insert(table_id, checkpoint);
            }
        }
        let schema = Arc::new(RwLock::new(snapshot));

        let sink = new_sink(
            &info.sink_uri,
            &id.0,
            &info.config,
            schema.clone(),
            self.bus_factory.as_ref().map(|f| f.as_ref() as _),
        )?;
        let ddl_handler = DdlHandler::new(self.region_client.clone(), checkpoint, &self.cancel);

        info!(changefeed = %id, %checkpoint, tables = orphan_tables.len(), "changefeed adopted");
        Ok(OwnedChangeFeed {
            id: id.clone(),
            info,
            filter,
            status,
            status_rev,
            schema,
            ddl_handler,
            ddl_resolved_ts: checkpoint,
            ddl_executed_ts: checkpoint,
            ddl_job_history: VecDeque::new(),
            exec_state: DdlExecState::SyncDml,
            orphan_tables,
            to_clean_tables: BTreeMap::new(),
            move_targets: HashMap::new(),
            sink,
            last_rebalance: tokio::time::Instant::now(),
        })
    }
}

/// Schema and non-retriable sink faults poison only their changefeed.
fn is_terminal(e: &ServerError) -> bool {
    match e {
        ServerError::Schema(_) => true,
        ServerError::Sink(sink) => !sink.is_retriable(),
        _ => false,
    }
}

impl OwnedChangeFeed {
    /// One owner pass over this changefeed.
    async fn process(
        &mut self,
        meta: &MetaClient,
        scheduler: &dyn Scheduler,
        live: &HashSet<CaptureId>,
        config: &OwnerConfig,
    ) -> Result<()> {
        if self.status.state != ChangeFeedState::Normal {
            return Ok(());
        }

        let mut statuses: HashMap<CaptureId, (TaskStatus, Revision)> = meta
            .get_all_task_statuses(&self.id)
            .await?
            .into_iter()
            .map(|(capture, status, rev)| (capture, (status, rev)))
            .collect();
        let positions: HashMap<CaptureId, TaskPosition> = meta
            .get_all_task_positions(&self.id)
            .await?
            .into_iter()
            .collect();

        // A processor that hit a terminal fault surfaces it here; the
        // changefeed fails with the processor's reason.
        let processor_fault: Option<String> = positions.iter().find_map(|(capture, position)| {
            position
                .error
                .as_ref()
                .map(|reason| format!("processor on {capture} failed: {reason}"))
        });
        if let Some(reason) = processor_fault {
            error!(changefeed = %self.id, %reason, "failing changefeed");
            self.fail(meta, reason).await?;
            return Ok(());
        }

        self.reclaim_dead_captures(meta, live, &mut statuses).await?;
        self.reconcile_table_set(&statuses, live);
        self.maybe_rebalance(meta, scheduler, live, &mut statuses, config)
            .await?;
        self.balance(meta, scheduler, live, &mut statuses).await?;
        self.calc_timestamps(meta, live, &statuses, &positions).await?;
        self.maybe_exec_ddl(meta, live, &positions).await?;
        self.maybe_finish(meta, config).await?;
        Ok(())
    }

    /// Tables owned by captures that lost their lease return to the
    /// orphan pool, starting from the global checkpoint.
    async fn reclaim_dead_captures(
        &mut self,
        meta: &MetaClient,
        live: &HashSet<CaptureId>,
        statuses: &mut HashMap<CaptureId, (TaskStatus, Revision)>,
    ) -> Result<()> {
        let dead: Vec<CaptureId> = statuses
            .keys()
            .filter(|capture| !live.contains(*capture))
            .cloned()
            .collect();
        for capture in dead {
            let (status, _) = statuses.remove(&capture).expect("key listed");
            info!(changefeed = %self.id, capture = %capture, tables = status.tables.len(),
                "reclaiming tables from dead capture");
            // Both settled tables and in-flight adds come back.
            let reclaimed = status
                .tables
                .iter()
                .map(|(id, ts)| (*id, *ts))
                .chain(status.pending_add_tables());
            for (table_id, start_ts) in reclaimed {
                let start = start_ts.max_with(self.status.checkpoint_ts);
                self.orphan_tables.insert(table_id, start);
            }
            meta.delete_task_state(&self.id, &capture).await?;
        }
        Ok(())
    }

    /// Safety net: any expected table that is neither assigned, orphaned
    /// nor being cleaned goes back to the orphan pool.
    fn reconcile_table_set(
        &mut self,
        statuses: &HashMap<CaptureId, (TaskStatus, Revision)>,
        live: &HashSet<CaptureId>,
    ) {
        let mut assigned: HashSet<TableId> = HashSet::new();
        for (capture, (status, _)) in statuses {
            if live.contains(capture) {
                assigned.extend(status.tables.keys().copied());
                assigned.extend(status.pending_add_tables().map(|(id, _)| id));
            }
        }
        let snapshot = self.schema.read();
        for table_id in snapshot.table_ids() {
            if assigned.contains(&table_id)
                || self.orphan_tables.contains_key(&table_id)
                || self.to_clean_tables.contains_key(&table_id)
            {
                continue;
            }
            let table = snapshot.table_by_id(table_id).expect("listed table resolves");
            if self
                .filter
                .should_ignore_table(&table.schema_name, &table.table_name)
            {
                continue;
            }
            debug!(changefeed = %self.id, table = %table_id, "re-orphaning unassigned table");
            self.orphan_tables
                .insert(table_id, self.status.checkpoint_ts);
        }
    }

    /// Queue cleanups and place orphans. Skipped entirely while any
    /// capture still has a pending operation.
    async fn balance(
        &mut self,
        meta: &MetaClient,
        scheduler: &dyn Scheduler,
        live: &HashSet<CaptureId>,
        statuses: &mut HashMap<CaptureId, (TaskStatus, Revision)>,
    ) -> Result<()> {
        if statuses.values().any(|(status, _)| status.has_pending_op()) {
            return Ok(());
        }
        // Fold finished operations into the table maps before planning.
        for (capture, (status, rev)) in statuses.iter_mut() {
            if status.apply_finished_ops() {
                let new_rev = meta.put_task_status(&self.id, capture, status, *rev).await?;
                *rev = new_rev;
            }
        }

        // Cleanups first.
        let cleanups: Vec<(TableId, Ts)> =
            self.to_clean_tables.iter().map(|(t, ts)| (*t, *ts)).collect();
        for (table_id, boundary) in cleanups {
            let holder = statuses
                .iter()
                .find(|(_, (status, _))| {
                    status.tables.contains_key(&table_id)
                        || status.pending_add_tables().any(|(id, _)| id == table_id)
                })
                .map(|(capture, _)| capture.clone());
            match holder {
                Some(capture) => {
                    let (status, rev) = statuses.get_mut(&capture).expect("holder listed");
                    status.queue_delete(table_id, boundary);
                    let new_rev = meta
                        .put_task_status(&self.id, &capture, status, *rev)
                        .await?;
                    *rev = new_rev;
                    info!(changefeed = %self.id, table = %table_id, capture = %capture,
                        %boundary, "queued table cleanup");
                }
                None => {
                    // Nothing holds it; nothing to drain.
                }
            }
            self.to_clean_tables.remove(&table_id);
        }

        if self.orphan_tables.is_empty() {
            return Ok(());
        }

        // Directed placements from a rebalance plan take precedence.
        let directed: Vec<(TableId, Ts, CaptureId)> = self
            .orphan_tables
            .iter()
            .filter_map(|(table_id, start_ts)| {
                self.move_targets
                    .get(table_id)
                    .filter(|target| live.contains(*target))
                    .map(|target| (*table_id, *start_ts, target.clone()))
            })
            .collect();
        for (table_id, start_ts, target) in directed {
            let (status, rev) = statuses.entry(target.clone()).or_default();
            status.queue_add(table_id, start_ts);
            let new_rev = meta.put_task_status(&self.id, &target, status, *rev).await?;
            *rev = new_rev;
            self.orphan_tables.remove(&table_id);
            self.move_targets.remove(&table_id);
            info!(changefeed = %self.id, table = %table_id, capture = %target,
                "placed table per rebalance plan");
        }

        if self.orphan_tables.is_empty() || live.is_empty() {
            return Ok(());
        }

        let counts: HashMap<CaptureId, usize> = live
            .iter()
            .map(|capture| {
                let count = statuses
                    .get(capture)
                    .map(|(status, _)| {
                        status.tables.len() + status.pending_add_tables().count()
                    })
                    .unwrap_or(0);
                (capture.clone(), count)
            })
            .collect();
        let plan = scheduler.distribute(&self.orphan_tables, &counts);
        for (capture, tables) in plan {
            let (status, rev) = statuses.entry(capture.clone()).or_default();
            for (table_id, start_ts) in &tables {
                status.queue_add(*table_id, *start_ts);
            }
            let new_rev = meta.put_task_status(&self.id, &capture, status, *rev).await?;
            *rev = new_rev;
            for (table_id, _) in tables {
                self.orphan_tables.remove(&table_id);
                info!(changefeed = %self.id, table = %table_id, capture = %capture,
                    "placed orphan table");
            }
        }
        Ok(())
    }

    /// Periodic rebalance: delete-first moves computed from reported
    /// workloads. The freed tables return through the orphan pool with a
    /// directed target. Cyclic mode never rebalances periodically.
    async fn maybe_rebalance(
        &mut self,
        meta: &MetaClient,
        scheduler: &dyn Scheduler,
        live: &HashSet<CaptureId>,
        statuses: &mut HashMap<CaptureId, (TaskStatus, Revision)>,
        config: &OwnerConfig,
    ) -> Result<()> {
        if self.info.config.cyclic.enable {
            return Ok(());
        }
        if self.last_rebalance.elapsed() < config.rebalance_interval {
            return Ok(());
        }
        // Only a quiescent changefeed rebalances.
        if !self.orphan_tables.is_empty()
            || !self.to_clean_tables.is_empty()
            || statuses.values().any(|(status, _)| !status.operation.is_empty())
        {
            return Ok(());
        }

        let distribution: BTreeMap<CaptureId, Vec<TableId>> = statuses
            .iter()
            .filter(|(capture, _)| live.contains(*capture))
            .map(|(capture, (status, _))| {
                (capture.clone(), status.tables.keys().copied().collect())
            })
            .collect();
        let workloads: HashMap<_, _> = meta
            .get_all_task_workloads(&self.id)
            .await?
            .into_iter()
            .collect();
        let moves = scheduler.rebalance(&distribution, &workloads);
        self.last_rebalance = tokio::time::Instant::now();
        if moves.is_empty() {
            return Ok(());
        }

        let boundary = self.status.checkpoint_ts;
        for mv in moves {
            let Some((status, rev)) = statuses.get_mut(&mv.from) else {
                continue;
            };
            status.queue_delete(mv.table_id, boundary);
            let new_rev = meta.put_task_status(&self.id, &mv.from, status, *rev).await?;
            *rev = new_rev;
            self.move_targets.insert(mv.table_id, mv.to.clone());
            info!(changefeed = %self.id, table = %mv.table_id, from = %mv.from, to = %mv.to,
                "rebalance move queued");
        }
        Ok(())
    }

    async fn calc_timestamps(
        &mut self,
        meta: &MetaClient,
        live: &HashSet<CaptureId>,
        statuses: &HashMap<CaptureId, (TaskStatus, Revision)>,
        positions: &HashMap<CaptureId, TaskPosition>,
    ) -> Result<()> {
        if self.exec_state == DdlExecState::DdlExecuteFailed {
            return Ok(());
        }
        // Every live capture must have reported before the view advances.
        if live.iter().any(|capture| !positions.contains_key(capture)) {
            return Ok(());
        }

        let target = self.info.get_target_ts();
        let (mut min_resolved, mut min_checkpoint) = compute_position_minima(
            target,
            live,
            positions,
            statuses,
            &self.orphan_tables,
            &self.to_clean_tables,
        );

        if min_resolved > self.ddl_resolved_ts {
            self.pull_ddl()?;
            min_resolved = min_resolved.min_with(self.ddl_resolved_ts);
        }
        while self
            .ddl_job_history
            .front()
            .is_some_and(|job| job.finished_ts <= self.ddl_executed_ts)
        {
            self.ddl_job_history.pop_front();
        }
        if let Some(head) = self.ddl_job_history.front() {
            if min_resolved >= head.finished_ts {
                min_resolved = head.finished_ts;
                if self.exec_state == DdlExecState::SyncDml {
                    debug!(changefeed = %self.id, barrier = %head.finished_ts,
                        "ddl barrier set, waiting for drain");
                    self.exec_state = DdlExecState::WaitToExecDdl;
                }
            }
        }
        min_checkpoint = min_checkpoint.min_with(min_resolved);

        if self.status.advance(min_resolved, min_checkpoint) {
            self.persist_status(meta).await?;
            // Checkpoints reach the sink only outside a DDL barrier.
            if self.exec_state == DdlExecState::SyncDml {
                self.sink
                    .emit_checkpoint_event(self.status.checkpoint_ts)
                    .await?;
            }
        }
        Ok(())
    }

    fn pull_ddl(&mut self) -> Result<()> {
        let (resolved, jobs) = self.ddl_handler.pull_ddl()?;
        self.ddl_resolved_ts = resolved;
        for job in jobs {
            if job.finished_ts <= self.ddl_executed_ts {
                continue;
            }
            if self
                .filter
                .should_ignore_table(&job.schema_name, &job.table_name)
            {
                debug!(changefeed = %self.id, job = job.id, "discarding filtered ddl job");
                continue;
            }
            self.ddl_job_history.push_back(job);
        }
        Ok(())
    }

    /// Execute the head DDL job once the cluster has drained to its
    /// finished-ts.
    async fn maybe_exec_ddl(
        &mut self,
        meta: &MetaClient,
        live: &HashSet<CaptureId>,
        positions: &HashMap<CaptureId, TaskPosition>,
    ) -> Result<()> {
        if self.exec_state != DdlExecState::WaitToExecDdl {
            return Ok(());
        }
        let Some(head) = self.ddl_job_history.front().cloned() else {
            self.exec_state = DdlExecState::SyncDml;
            return Ok(());
        };
        if self.status.checkpoint_ts < head.finished_ts {
            return Ok(());
        }
        if live.iter().any(|capture| !positions.contains_key(capture)) {
            return Ok(());
        }

        self.exec_state = DdlExecState::ExecDdl;
        let diff = self.schema.write().apply(&head)?;
        for table_id in diff.added {
            let table = self.schema.read().table_by_id(table_id);
            let ignore = table
                .map(|t| {
                    self.filter
                        .should_ignore_table(&t.schema_name, &t.table_name)
                })
                .unwrap_or(true);
            if !ignore {
                self.orphan_tables.insert(table_id, head.finished_ts);
            }
        }
        for table_id in diff.dropped {
            self.orphan_tables.remove(&table_id);
            self.to_clean_tables.insert(table_id, head.finished_ts);
        }

        let skip_emit = self.info.config.cyclic.enable && !self.info.config.cyclic.sync_ddl;
        if !skip_emit {
            let event = DDLEvent::from_job(head.clone());
            if let Err(e) = self.sink.emit_ddl_event(&event).await {
                error!(changefeed = %self.id, query = %head.query, error = %e,
                    "downstream ddl failed");
                self.exec_state = DdlExecState::DdlExecuteFailed;
                return Err(ServerError::Sink(e));
            }
        }

        info!(changefeed = %self.id, query = %head.query, finished_ts = %head.finished_ts,
            "ddl applied");
        self.ddl_executed_ts = head.finished_ts;
        self.ddl_job_history.pop_front();
        self.exec_state = DdlExecState::SyncDml;
        self.persist_status(meta).await?;
        Ok(())
    }

    /// A bounded changefeed finishes once the checkpoint reaches its
    /// target.
    async fn maybe_finish(&mut self, meta: &MetaClient, _config: &OwnerConfig) -> Result<()> {
        let target = self.info.get_target_ts();
        if target != Ts::MAX && self.status.checkpoint_ts >= target {
            info!(changefeed = %self.id, %target, "changefeed reached target");
            self.status.state = ChangeFeedState::Finished;
            self.persist_status(meta).await?;
        }
        Ok(())
    }

    async fn apply_admin_job(&mut self, meta: &MetaClient, captures: &[CaptureInfo]) -> Result<()> {
        match self.info.admin_job_type {
            AdminJobType::None => Ok(()),
            AdminJobType::Stop => {
                if self.status.state == ChangeFeedState::Normal {
                    info!(changefeed = %self.id, "stopping changefeed");
                    self.status.state = ChangeFeedState::Stopped;
                    self.status.admin_job_type = AdminJobType::Stop;
                    self.persist_status(meta).await?;
                }
                Ok(())
            }
            AdminJobType::Resume => {
                if matches!(
                    self.status.state,
                    ChangeFeedState::Stopped | ChangeFeedState::Failed
                ) {
                    info!(changefeed = %self.id, "resuming changefeed");
                    self.status.state = ChangeFeedState::Normal;
                    self.status.error = None;
                    self.status.admin_job_type = AdminJobType::Resume;
                    self.exec_state = DdlExecState::SyncDml;
                    self.persist_status(meta).await?;
                }
                Ok(())
            }
            AdminJobType::Remove => {
                info!(changefeed = %self.id, "removing changefeed");
                for capture in captures {
                    meta.delete_task_state(&self.id, &capture.id).await?;
                }
                meta.delete_changefeed(&self.id).await?;
                // The next sync pass drops the in-memory state.
                Ok(())
            }
            AdminJobType::Finish => {
                if self.status.state == ChangeFeedState::Normal {
                    self.status.state = ChangeFeedState::Finished;
                    self.status.admin_job_type = AdminJobType::Finish;
                    self.persist_status(meta).await?;
                }
                Ok(())
            }
        }
    }

    async fn fail(&mut self, meta: &MetaClient, reason: String) -> Result<()> {
        self.status.state = ChangeFeedState::Failed;
        self.status.error = Some(reason);
        self.persist_status(meta).await
    }

    async fn persist_status(&mut self, meta: &MetaClient) -> Result<()> {
        let new_rev = meta
            .put_changefeed_status(&self.id, &self.status, self.status_rev)
            .await?;
        self.status_rev = new_rev;
        Ok(())
    }
}

/// The position part of the per-tick minima: processor positions, pending
/// operation boundaries, orphan start-ts and cleanup boundaries all clamp
/// the global view.
fn compute_position_minima(
    target: Ts,
    live: &HashSet<CaptureId>,
    positions: &HashMap<CaptureId, TaskPosition>,
    statuses: &HashMap<CaptureId, (TaskStatus, Revision)>,
    orphans: &BTreeMap<TableId, Ts>,
    to_clean: &BTreeMap<TableId, Ts>,
) -> (Ts, Ts) {
    let mut min_resolved = target;
    let mut min_checkpoint = target;
    for (capture, position) in positions {
        if !live.contains(capture) {
            continue;
        }
        min_resolved = min_resolved.min_with(position.resolved_ts);
        min_checkpoint = min_checkpoint.min_with(position.checkpoint_ts);
    }
    for (status, _) in statuses.values() {
        if let Some(boundary) = status.min_unfinished_boundary_ts() {
            min_resolved = min_resolved.min_with(boundary);
            min_checkpoint = min_checkpoint.min_with(boundary);
        }
    }
    for start_ts in orphans.values() {
        min_resolved = min_resolved.min_with(*start_ts);
        min_checkpoint = min_checkpoint.min_with(*start_ts);
    }
    for boundary in to_clean.values() {
        min_resolved = min_resolved.min_with(*boundary);
        min_checkpoint = min_checkpoint.min_with(*boundary);
    }
    (min_resolved, min_checkpoint)
}
