//! Dedicated puller over the schema change span.
//!
//! Collects finished DDL jobs and the DDL span's resolved-ts so the owner
//! (and each processor) can sequence schema changes against row progress.

use std::sync::Arc;

use parking_lot::Mutex;
use riptide_core::model::{DdlJob, Span, Ts};
use riptide_puller::{Puller, RegionEventClient};
use riptide_schema::unmarshal_ddl;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Result;

const DDL_BUFFER_SIZE: usize = 256;

#[derive(Default)]
struct DdlState {
    resolved_ts: Ts,
    jobs: Vec<DdlJob>,
    failed: Option<String>,
}

/// Pulls the DDL span and accumulates finished jobs for [`DdlHandler::pull_ddl`].
pub struct DdlHandler {
    state: Arc<Mutex<DdlState>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DdlHandler {
    /// Start pulling DDL jobs with `finished_ts > checkpoint_ts`.
    pub fn new(
        client: Arc<dyn RegionEventClient>,
        checkpoint_ts: Ts,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let puller = Arc::new(Puller::new(
            client,
            Span::ddl_span(),
            checkpoint_ts,
            DDL_BUFFER_SIZE,
            cancel.clone(),
        ));
        let state = Arc::new(Mutex::new(DdlState {
            resolved_ts: checkpoint_ts,
            ..Default::default()
        }));

        let run_task = {
            let puller = puller.clone();
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = puller.run().await {
                    if !e.is_cancelled() {
                        error!(error = %e, "ddl puller stopped");
                        state.lock().failed = Some(e.to_string());
                    }
                }
            })
        };

        let collect_task = {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let (tx, mut rx) = mpsc::channel(DDL_BUFFER_SIZE);
                let collector = tokio::spawn(async move {
                    let _ = puller.collect_raw_txns(tx).await;
                });
                while let Some(raw) = rx.recv().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if raw.is_resolved_tick() {
                        state.lock().resolved_ts = raw.commit_ts;
                        continue;
                    }
                    for entry in &raw.entries {
                        match unmarshal_ddl(entry) {
                            Ok(Some(job)) => {
                                debug!(job = job.id, finished_ts = %job.finished_ts, "collected ddl job");
                                state.lock().jobs.push(job);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error!(error = %e, "undecodable ddl entry");
                                state.lock().failed = Some(e.to_string());
                            }
                        }
                    }
                }
                collector.abort();
            })
        };

        Self {
            state,
            cancel,
            tasks: vec![run_task, collect_task],
        }
    }

    /// Drain collected jobs and report the DDL span resolved-ts.
    pub fn pull_ddl(&self) -> Result<(Ts, Vec<DdlJob>)> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.failed {
            return Err(crate::error::ServerError::Config(format!(
                "ddl stream failed: {reason}"
            )));
        }
        let jobs = std::mem::take(&mut state.jobs);
        Ok((state.resolved_ts, jobs))
    }

    pub async fn close(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
