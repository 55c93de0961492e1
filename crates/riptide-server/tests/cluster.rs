//! End-to-end replication scenarios over an in-memory cluster: real
//! captures (owner + processors) fed by scripted region streams, emitting
//! into a shared in-memory message bus.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use riptide_core::model::{
    ChangeFeedId, ChangeFeedInfo, ColumnInfo, ColumnType, ColumnValue, DdlAction, DdlJob,
    RawKVEntry, RegionId, Span, TableId, TableInfo, Ts,
};
use riptide_core::ReplicaConfig;
use riptide_meta::{KeySpace, MemMetaStore, MetaClient};
use riptide_puller::testing::{ScriptHandle, ScriptedRegionClient};
use riptide_schema::{rowcodec, FixedSnapshotProvider, SchemaSnapshot};
use riptide_server::{Capture, CaptureConfig, OwnerConfig, ProcessorConfig};
use riptide_sink::codec::{self, Message};
use riptide_sink::{MemMessageBus, MessageBus, MessageBusFactory};
use tokio_util::sync::CancellationToken;

fn column(id: i64, name: &str, col_type: ColumnType, pk: bool) -> ColumnInfo {
    ColumnInfo {
        id,
        name: name.to_string(),
        col_type,
        primary_key: pk,
        unique: pk,
        generated: false,
        public: true,
        nullable: !pk,
    }
}

fn table(id: i64, schema: &str, name: &str, with_name_col: bool) -> TableInfo {
    let mut columns = vec![column(1, "id", ColumnType::Int, true)];
    if with_name_col {
        columns.push(column(2, "name", ColumnType::Varchar, false));
    }
    TableInfo {
        id: TableId(id),
        schema_name: schema.to_string(),
        table_name: name.to_string(),
        columns,
        pk_handle: Some("id".to_string()),
    }
}

fn put_row(table_id: i64, handle: i64, name: Option<&str>, commit_ts: u64) -> RawKVEntry {
    let mut columns = BTreeMap::new();
    columns.insert("id".to_string(), ColumnValue::Int(handle));
    if let Some(name) = name {
        columns.insert("name".to_string(), ColumnValue::String(name.to_string()));
    }
    RawKVEntry::put(
        rowcodec::encode_row_key(TableId(table_id), handle),
        rowcodec::encode_row_value(&columns),
        Ts::new(commit_ts - 1),
        Ts::new(commit_ts),
    )
}

/// Every sink created in the cluster shares one bus, standing in for one
/// downstream.
struct SharedBusFactory {
    bus: Arc<MemMessageBus>,
}

impl MessageBusFactory for SharedBusFactory {
    fn create(
        &self,
        _brokers: &str,
        _topic: &str,
        _partitions: i32,
    ) -> riptide_sink::Result<Arc<dyn MessageBus>> {
        Ok(self.bus.clone())
    }
}

#[derive(Clone)]
struct TestCluster {
    store: Arc<MemMetaStore>,
    meta: MetaClient,
    region_client: Arc<ScriptedRegionClient>,
    provider: Arc<FixedSnapshotProvider>,
    bus: Arc<MemMessageBus>,
}

impl TestCluster {
    fn new(tables: Vec<TableInfo>, version: Ts) -> Self {
        let store = Arc::new(MemMetaStore::new());
        let meta = MetaClient::new(store.clone(), KeySpace::default());
        Self {
            store,
            meta,
            region_client: Arc::new(ScriptedRegionClient::new()),
            provider: Arc::new(FixedSnapshotProvider::new(SchemaSnapshot::with_tables(
                tables, version,
            ))),
            bus: Arc::new(MemMessageBus::new(1)),
        }
    }

    fn capture(&self, cancel: CancellationToken) -> Capture {
        let config = CaptureConfig {
            lease_ttl: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(200),
            campaign_interval: Duration::from_millis(100),
            discovery_interval: Duration::from_millis(100),
            processor_restart_backoff: Duration::from_secs(2),
            advertise_addr: "127.0.0.1:0".to_string(),
            processor: ProcessorConfig {
                position_interval: Duration::from_millis(50),
                status_poll_interval: Duration::from_millis(50),
                global_poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
            owner: OwnerConfig {
                tick_interval: Duration::from_millis(50),
                ..Default::default()
            },
        };
        Capture::new(
            self.meta.clone(),
            self.region_client.clone(),
            self.provider.clone(),
            Some(Arc::new(SharedBusFactory {
                bus: self.bus.clone(),
            })),
            config,
            cancel,
        )
    }

    async fn create_changefeed(&self, id: &str, start_ts: u64, config: ReplicaConfig) {
        let mut info = ChangeFeedInfo::new("kafka://bus:9092/cdc?partition-num=1");
        info.start_ts = Ts::new(start_ts);
        info.config = config;
        self.meta
            .create_changefeed(&ChangeFeedId::new(id), &info)
            .await
            .expect("create changefeed");
    }

    fn table_handle(&self, table_id: i64) -> ScriptHandle {
        self.region_client.handle(&Span::table_span(table_id))
    }

    fn ddl_handle(&self) -> ScriptHandle {
        self.region_client.handle(&Span::ddl_span())
    }

    fn messages(&self) -> Vec<Message> {
        self.bus
            .messages(0)
            .into_iter()
            .map(|(_, value)| codec::decode(&value).expect("decodable message"))
            .collect()
    }

    fn dml_commits(&self) -> Vec<u64> {
        self.messages()
            .iter()
            .filter_map(|m| match m {
                Message::Dml { commit_ts, .. } => Some(commit_ts.0),
                _ => None,
            })
            .collect()
    }

    async fn checkpoint(&self, id: &str) -> u64 {
        self.meta
            .get_changefeed_status(&ChangeFeedId::new(id))
            .await
            .expect("status read")
            .map(|(status, _)| status.checkpoint_ts.0)
            .unwrap_or(0)
    }

    async fn resolved(&self, id: &str) -> u64 {
        self.meta
            .get_changefeed_status(&ChangeFeedId::new(id))
            .await
            .expect("status read")
            .map(|(status, _)| status.resolved_ts.0)
            .unwrap_or(0)
    }
}

async fn wait_until<F, Fut>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Create a changefeed with one table and watch the first transaction
/// reach the downstream with an advancing checkpoint.
#[tokio::test(flavor = "multi_thread")]
async fn test_create_and_initial_sync() {
    let cluster = TestCluster::new(vec![table(10, "test", "t", false)], Ts::new(900));
    cluster
        .create_changefeed("sync", 1000, ReplicaConfig::default())
        .await;

    let cancel = CancellationToken::new();
    let capture = cluster.capture(cancel.clone());
    let run = tokio::spawn(async move { capture.run().await });

    let rows = cluster.table_handle(10);
    let ddl = cluster.ddl_handle();
    rows.resolved(RegionId(1), Ts::new(1000));
    ddl.resolved(RegionId(9), Ts::new(1000));
    rows.entry(RegionId(1), put_row(10, 1, None, 1100));
    rows.resolved(RegionId(1), Ts::new(1200));
    ddl.resolved(RegionId(9), Ts::new(1300));

    wait_until("first row downstream", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move { cluster.dml_commits().contains(&1100) }
    })
    .await;
    wait_until("checkpoint past 1100", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move { cluster.checkpoint("sync").await >= 1100 }
    })
    .await;

    // The replicated row carries the primary key value.
    let dml_values: Vec<_> = cluster
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            Message::Dml { dmls, .. } => Some(dmls),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(dml_values
        .iter()
        .any(|dml| dml.values.get("id") == Some(&ColumnValue::Int(1))));

    cancel.cancel();
    let _ = run.await;
}

/// A DDL acts as a barrier: the ALTER reaches the downstream exactly once,
/// before any row that depends on it.
#[tokio::test(flavor = "multi_thread")]
async fn test_ddl_barrier() {
    let cluster = TestCluster::new(vec![table(10, "test", "t", false)], Ts::new(900));
    cluster
        .create_changefeed("ddl", 1000, ReplicaConfig::default())
        .await;

    let cancel = CancellationToken::new();
    let capture = cluster.capture(cancel.clone());
    let run = tokio::spawn(async move { capture.run().await });

    let rows = cluster.table_handle(10);
    let ddl = cluster.ddl_handle();
    rows.resolved(RegionId(1), Ts::new(1000));
    ddl.resolved(RegionId(9), Ts::new(1000));
    rows.entry(RegionId(1), put_row(10, 1, None, 1100));
    rows.resolved(RegionId(1), Ts::new(1150));

    wait_until("initial row", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move { cluster.dml_commits().contains(&1100) }
    })
    .await;

    // ALTER TABLE test.t ADD name varchar, finished at 1200.
    let job = DdlJob {
        id: 1,
        schema_name: "test".to_string(),
        table_name: "t".to_string(),
        table_id: TableId(10),
        action: DdlAction::AddColumn,
        query: "ALTER TABLE test.t ADD name varchar(20)".to_string(),
        finished_ts: Ts::new(1200),
        table_info: Some(table(10, "test", "t", true)),
        new_table_id: None,
    };
    ddl.entry(
        RegionId(9),
        RawKVEntry::put(
            Span::ddl_span().start.clone(),
            serde_json::to_vec(&job).unwrap(),
            Ts::new(1199),
            Ts::new(1200),
        ),
    );
    ddl.resolved(RegionId(9), Ts::new(1250));
    rows.entry(RegionId(1), put_row(10, 2, Some("a"), 1300));
    rows.resolved(RegionId(1), Ts::new(1350));

    wait_until("alter downstream", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move {
            cluster
                .messages()
                .iter()
                .any(|m| matches!(m, Message::Ddl { commit_ts, .. } if commit_ts.0 == 1200))
        }
    })
    .await;

    // Release the post-DDL row.
    ddl.resolved(RegionId(9), Ts::new(1400));
    wait_until("post-ddl row", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move { cluster.dml_commits().contains(&1300) }
    })
    .await;

    let messages = cluster.messages();
    let ddl_count = messages
        .iter()
        .filter(|m| matches!(m, Message::Ddl { .. }))
        .count();
    assert_eq!(ddl_count, 1, "alter must reach the downstream exactly once");

    // The ALTER precedes the row that uses the new column, and the row
    // decodes with it.
    let ddl_pos = messages
        .iter()
        .position(|m| matches!(m, Message::Ddl { .. }))
        .unwrap();
    let row2_pos = messages
        .iter()
        .position(|m| matches!(m, Message::Dml { commit_ts, .. } if commit_ts.0 == 1300))
        .unwrap();
    assert!(ddl_pos < row2_pos);
    match &messages[row2_pos] {
        Message::Dml { dmls, .. } => {
            assert_eq!(
                dmls[0].values.get("name"),
                Some(&ColumnValue::String("a".to_string()))
            );
            assert!(dmls[0].columns.iter().any(|c| c.name == "name"));
        }
        other => panic!("unexpected message {other:?}"),
    }

    cancel.cancel();
    let _ = run.await;
}

/// System-schema tables are never replicated, but the resolved-ts still
/// advances past their writes.
#[tokio::test(flavor = "multi_thread")]
async fn test_filter_ignores_system_schema() {
    let cluster = TestCluster::new(
        vec![
            table(10, "test", "t", false),
            table(20, "mysql", "user", false),
        ],
        Ts::new(900),
    );
    cluster
        .create_changefeed("filter", 1000, ReplicaConfig::default())
        .await;

    let cancel = CancellationToken::new();
    let capture = cluster.capture(cancel.clone());
    let run = tokio::spawn(async move { capture.run().await });

    let rows = cluster.table_handle(10);
    let ddl = cluster.ddl_handle();
    rows.resolved(RegionId(1), Ts::new(1000));
    ddl.resolved(RegionId(9), Ts::new(1000));
    rows.resolved(RegionId(1), Ts::new(1500));
    ddl.resolved(RegionId(9), Ts::new(1500));

    wait_until("resolved past 1400", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move { cluster.resolved("filter").await > 1400 }
    })
    .await;

    // Nothing from the system schema made it downstream.
    for message in cluster.messages() {
        if let Message::Dml { dmls, .. } = message {
            assert!(dmls.iter().all(|dml| dml.schema != "mysql"));
        }
    }

    cancel.cancel();
    let _ = run.await;
}

/// Losing a capture reassigns its tables; the checkpoint never regresses.
#[tokio::test(flavor = "multi_thread")]
async fn test_capture_failure_reassigns_tables() {
    let tables: Vec<TableInfo> = (1..=4)
        .map(|i| table(i, "test", &format!("t{i}"), false))
        .collect();
    let cluster = TestCluster::new(tables, Ts::new(900));

    let handles: Vec<ScriptHandle> = (1..=4).map(|i| cluster.table_handle(i)).collect();
    let ddl = cluster.ddl_handle();
    for handle in &handles {
        handle.resolved(RegionId(1), Ts::new(1000));
    }
    ddl.resolved(RegionId(9), Ts::new(1000));

    let cancel_a = CancellationToken::new();
    let capture_a = cluster.capture(cancel_a.clone());
    let id_a = capture_a.id().clone();
    let run_a = tokio::spawn(async move { capture_a.run().await });

    let cancel_b = CancellationToken::new();
    let capture_b = cluster.capture(cancel_b.clone());
    let run_b = tokio::spawn(async move { capture_b.run().await });

    // Both captures must be registered before the changefeed exists, so
    // the initial placement spreads 2/2.
    wait_until("both captures registered", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move { cluster.meta.list_captures().await.unwrap().len() == 2 }
    })
    .await;
    cluster
        .create_changefeed("failover", 1000, ReplicaConfig::default())
        .await;

    let cf = ChangeFeedId::new("failover");
    wait_until("tables split across captures", Duration::from_secs(10), || {
        let cluster = cluster.clone();
        let cf = cf.clone();
        async move {
            let statuses = cluster.meta.get_all_task_statuses(&cf).await.unwrap();
            let owned: usize = statuses.iter().map(|(_, s, _)| s.tables.len()).sum();
            owned == 4
                && statuses
                    .iter()
                    .filter(|(_, s, _)| !s.tables.is_empty())
                    .count()
                    == 2
        }
    })
    .await;

    for handle in &handles {
        handle.resolved(RegionId(1), Ts::new(1100));
    }
    ddl.resolved(RegionId(9), Ts::new(1200));
    wait_until("checkpoint moving", Duration::from_secs(10), || {
        let cluster = cluster.clone();
        async move { cluster.checkpoint("failover").await >= 1100 }
    })
    .await;
    let checkpoint_before = cluster.checkpoint("failover").await;

    // Kill capture B; its lease expires and the owner reclaims.
    cancel_b.cancel();
    let _ = run_b.await;

    wait_until("tables reassigned to A", Duration::from_secs(15), || {
        let cluster = cluster.clone();
        let cf = cf.clone();
        let id_a = id_a.clone();
        async move {
            cluster.store.expire_dead_leases();
            let statuses = cluster.meta.get_all_task_statuses(&cf).await.unwrap();
            statuses.len() == 1 && statuses[0].0 == id_a && statuses[0].1.tables.len() == 4
        }
    })
    .await;

    for handle in &handles {
        handle.resolved(RegionId(1), Ts::new(1300));
    }
    ddl.resolved(RegionId(9), Ts::new(1400));

    wait_until(
        "checkpoint advances after failover",
        Duration::from_secs(10),
        || {
            let cluster = cluster.clone();
            async move { cluster.checkpoint("failover").await >= 1300 }
        },
    )
    .await;
    assert!(cluster.checkpoint("failover").await >= checkpoint_before);

    cancel_a.cancel();
    let _ = run_a.await;
}

/// Transactions on the ignore list are dropped whole.
#[tokio::test(flavor = "multi_thread")]
async fn test_ignore_txn_commit_ts() {
    let cluster = TestCluster::new(vec![table(10, "test", "t", false)], Ts::new(900));
    let config = ReplicaConfig {
        ignore_txn_commit_ts: vec![Ts::new(2000)],
        ..Default::default()
    };
    cluster.create_changefeed("ignore", 1000, config).await;

    let cancel = CancellationToken::new();
    let capture = cluster.capture(cancel.clone());
    let run = tokio::spawn(async move { capture.run().await });

    let rows = cluster.table_handle(10);
    let ddl = cluster.ddl_handle();
    rows.resolved(RegionId(1), Ts::new(1000));
    ddl.resolved(RegionId(9), Ts::new(1000));
    rows.entry(RegionId(1), put_row(10, 1, None, 2000));
    rows.entry(RegionId(1), put_row(10, 2, None, 2001));
    rows.resolved(RegionId(1), Ts::new(2100));
    ddl.resolved(RegionId(9), Ts::new(2100));

    wait_until("unfiltered txn downstream", Duration::from_secs(5), || {
        let cluster = cluster.clone();
        async move { cluster.dml_commits().contains(&2001) }
    })
    .await;
    assert!(!cluster.dml_commits().contains(&2000));

    cancel.cancel();
    let _ = run.await;
}

/// Scenario from the wire-format contract: a DML transaction encodes and
/// decodes bit-exactly with a valid checksum.
#[tokio::test]
async fn test_message_bus_roundtrip() {
    let snapshot = SchemaSnapshot::with_tables(vec![table(10, "test", "t", true)], Ts::new(1));
    let mut columns = BTreeMap::new();
    columns.insert("id".to_string(), ColumnValue::Int(7));
    columns.insert("name".to_string(), ColumnValue::String("x".to_string()));
    let row = riptide_core::model::RowChangedEvent {
        schema: "test".to_string(),
        table: "t".to_string(),
        kind: riptide_core::model::RowKind::Insert,
        commit_ts: Ts::new(5000),
        columns,
    };

    let encoded = codec::encode_dml_txn("cdc-test", Ts::new(5000), &[row.clone()], &snapshot)
        .expect("encode");
    match codec::decode(&encoded).expect("decode with valid crc") {
        Message::Dml {
            cdc_id,
            commit_ts,
            dmls,
        } => {
            assert_eq!(cdc_id, "cdc-test");
            assert_eq!(commit_ts, Ts::new(5000));
            assert_eq!(dmls.len(), 1);
            assert_eq!(dmls[0].values.get("id"), Some(&ColumnValue::Int(7)));
            assert_eq!(
                dmls[0].values.get("name"),
                Some(&ColumnValue::String("x".to_string()))
            );
        }
        other => panic!("unexpected message {other:?}"),
    }
}
