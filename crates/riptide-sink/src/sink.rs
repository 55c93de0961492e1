//! The sink contract and sink-URI dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use riptide_core::model::{DDLEvent, RowChangedEvent, Ts};
use riptide_core::ReplicaConfig;
use riptide_schema::SchemaInfoGetter;
use url::Url;

use crate::blackhole::BlackholeSink;
use crate::error::{Result, SinkError};
use crate::mq::{MessageBus, MqSink};
use crate::mysql::MySqlSink;

/// Anything a changefeed may emit into.
///
/// Delivery is at-least-once: emitters may replay the tail after a
/// failover, so every operation must be idempotent downstream.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Apply row changes. Rows arrive grouped by commit-ts; all rows of one
    /// commit-ts are applied in a single downstream transaction where the
    /// downstream supports it, with row-level idempotency otherwise.
    async fn emit_row_changed_events(&self, rows: &[RowChangedEvent]) -> Result<()>;

    /// Apply a schema change. Ignorable downstream errors (already exists,
    /// does not exist on drop) are absorbed and reported as success.
    async fn emit_ddl_event(&self, ddl: &DDLEvent) -> Result<()>;

    /// Advisory: the cluster-wide checkpoint advanced.
    async fn emit_checkpoint_event(&self, ts: Ts) -> Result<()>;

    /// The cluster-wide resolved-ts advanced. Message-bus sinks forward
    /// this so readers can release buffered transactions.
    async fn emit_resolved_event(&self, ts: Ts) -> Result<()>;

    /// Highest commit-ts durably acknowledged downstream.
    fn checkpoint_ts(&self) -> Ts;
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Sink(checkpoint_ts={:?})", self.checkpoint_ts())
    }
}

/// Scheme prefix for raw DSN sink URIs.
const DSN_SCHEME: &str = "dsn://";

/// Builds the message-bus client for `kafka://` sinks; the bus itself is an
/// external collaborator.
pub trait MessageBusFactory: Send + Sync {
    fn create(&self, brokers: &str, topic: &str, partitions: i32) -> Result<Arc<dyn MessageBus>>;
}

/// Create a sink from a sink URI.
///
/// Supported schemes: `mysql://`, `tidb://`, `kafka://broker/topic`,
/// `blackhole://` and `dsn://<raw-dsn>`. Unknown schemes are an error.
pub fn new_sink(
    sink_uri: &str,
    cdc_id: &str,
    config: &ReplicaConfig,
    schema: Arc<dyn SchemaInfoGetter>,
    bus_factory: Option<&dyn MessageBusFactory>,
) -> Result<Arc<dyn Sink>> {
    if let Some(dsn) = strip_dsn(sink_uri) {
        return Ok(Arc::new(MySqlSink::from_dsn(dsn, &config.sink)?));
    }

    let url =
        Url::parse(sink_uri).map_err(|e| SinkError::InvalidUri(format!("{sink_uri}: {e}")))?;
    match url.scheme().to_ascii_lowercase().as_str() {
        "blackhole" => Ok(Arc::new(BlackholeSink::new())),
        "mysql" | "tidb" => Ok(Arc::new(MySqlSink::from_url(&url, &config.sink)?)),
        "kafka" => {
            let factory = bus_factory.ok_or_else(|| {
                SinkError::InvalidUri("kafka sink requires a message-bus client".into())
            })?;
            let brokers = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => return Err(SinkError::InvalidUri("kafka uri without broker".into())),
            };
            let topic = url.path().trim_start_matches('/').to_string();
            if topic.is_empty() {
                return Err(SinkError::InvalidUri("kafka uri without topic".into()));
            }
            let mut partitions: i32 = 1;
            let mut max_message_bytes = config.sink.max_message_bytes;
            for (key, value) in url.query_pairs() {
                match key.as_ref() {
                    "partition-num" => {
                        partitions = value
                            .parse()
                            .map_err(|_| SinkError::InvalidUri("bad partition-num".into()))?;
                    }
                    "max-message-bytes" => {
                        max_message_bytes = value
                            .parse()
                            .map_err(|_| SinkError::InvalidUri("bad max-message-bytes".into()))?;
                    }
                    _ => {}
                }
            }
            let bus = factory.create(&brokers, &topic, partitions)?;
            Ok(Arc::new(MqSink::new(
                bus,
                cdc_id.to_string(),
                schema,
                max_message_bytes,
            )))
        }
        other => Err(SinkError::UnsupportedScheme(other.to_string())),
    }
}

fn strip_dsn(sink_uri: &str) -> Option<&str> {
    let prefix = sink_uri.get(..DSN_SCHEME.len())?;
    if prefix.eq_ignore_ascii_case(DSN_SCHEME) {
        Some(&sink_uri[DSN_SCHEME.len()..])
    } else {
        None
    }
}
