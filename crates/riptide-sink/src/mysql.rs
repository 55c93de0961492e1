//! MySQL-compatible SQL sink.
//!
//! Row changes are rendered idempotently: inserts and updates become
//! `REPLACE INTO`, deletes address the row by its unique key with
//! `LIMIT 1`. Replaying a suffix of the stream converges to the same
//! downstream state, which is all at-least-once delivery needs.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, Params, Pool, TxOpts, Value};
use riptide_core::config::SinkConfig;
use riptide_core::model::{ColumnValue, DDLEvent, RowChangedEvent, RowKind, Ts};
use riptide_core::retry::{retry_with_backoff, ExponentialBackoff};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, SinkError};
use crate::sink::Sink;

/// Downstream DDL errors that indicate the statement already took effect;
/// absorbed so DDL replay stays idempotent.
const IGNORABLE_DDL_ERRNOS: [u16; 7] = [
    1007, // database exists
    1008, // database does not exist on drop
    1050, // table exists
    1051, // unknown table on drop
    1060, // duplicate column
    1061, // duplicate key name
    1091, // can't drop field or key that does not exist
];

pub struct MySqlSink {
    pool: Pool,
    worker_count: usize,
    checkpoint: AtomicU64,
}

impl MySqlSink {
    /// Build from a `mysql://` or `tidb://` sink URI.
    pub fn from_url(url: &Url, config: &SinkConfig) -> Result<Self> {
        let mut normalized = url.clone();
        if url.scheme().eq_ignore_ascii_case("tidb") {
            // The downstream speaks the MySQL protocol either way.
            let rewritten = url.as_str().replacen("tidb://", "mysql://", 1);
            normalized = Url::parse(&rewritten)
                .map_err(|e| SinkError::InvalidUri(e.to_string()))?;
        }
        let opts = Opts::from_url(normalized.as_str()).map_err(mysql_async::Error::from)?;
        Ok(Self::with_opts(opts, config))
    }

    /// Build from a raw DSN (the `dsn://` scheme with the prefix removed),
    /// accepted in `user:password@host:port/db` form.
    pub fn from_dsn(dsn: &str, config: &SinkConfig) -> Result<Self> {
        let opts =
            Opts::from_url(&format!("mysql://{dsn}")).map_err(mysql_async::Error::from)?;
        Ok(Self::with_opts(opts, config))
    }

    fn with_opts(opts: Opts, config: &SinkConfig) -> Self {
        Self {
            pool: Pool::new(opts),
            worker_count: config.worker_count.max(1),
            checkpoint: AtomicU64::new(0),
        }
    }

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5))
            .with_max_attempts(5)
    }

    /// Apply one bucket of same-commit-ts rows in a single transaction.
    async fn write_bucket(&self, rows: &[&RowChangedEvent]) -> Result<()> {
        let statements: Vec<(String, Params)> = rows
            .iter()
            .map(|row| build_dml(row))
            .collect::<Result<_>>()?;

        retry_with_backoff(Self::backoff(), "mysql-dml", || {
            let statements = statements.clone();
            async move {
                let mut conn = self.pool.get_conn().await.map_err(SinkError::MySql)?;
                let mut tx = conn
                    .start_transaction(TxOpts::default())
                    .await
                    .map_err(SinkError::MySql)?;
                for (sql, params) in &statements {
                    tx.exec_drop(sql.as_str(), params.clone())
                        .await
                        .map_err(SinkError::MySql)?;
                }
                tx.commit().await.map_err(SinkError::MySql)?;
                Ok(())
            }
        })
        .await
    }

    fn advance_checkpoint(&self, ts: Ts) {
        let mut current = self.checkpoint.load(Ordering::Acquire);
        while ts.0 > current {
            match self.checkpoint.compare_exchange_weak(
                current,
                ts.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

#[async_trait]
impl Sink for MySqlSink {
    async fn emit_row_changed_events(&self, rows: &[RowChangedEvent]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        // Rows arrive grouped by commit-ts; groups are applied in ts order
        // so the checkpoint only ever covers fully applied prefixes.
        let mut groups: BTreeMap<Ts, Vec<&RowChangedEvent>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.commit_ts).or_default().push(row);
        }

        for (commit_ts, group) in groups {
            // Within one commit-ts, partition by table across workers.
            // Buckets commit independently; REPLACE/DELETE keep every row
            // idempotent, so partial application is safe to replay.
            let mut buckets: HashMap<usize, Vec<&RowChangedEvent>> = HashMap::new();
            for row in group {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                row.schema.hash(&mut hasher);
                row.table.hash(&mut hasher);
                let bucket = (hasher.finish() as usize) % self.worker_count;
                buckets.entry(bucket).or_default().push(row);
            }
            let writes = buckets.values().map(|bucket| self.write_bucket(bucket));
            futures::future::try_join_all(writes).await?;
            self.advance_checkpoint(commit_ts);
            debug!(%commit_ts, "applied transaction group");
        }
        Ok(())
    }

    async fn emit_ddl_event(&self, ddl: &DDLEvent) -> Result<()> {
        let result = retry_with_backoff(Self::backoff(), "mysql-ddl", || async move {
            let mut conn = self.pool.get_conn().await.map_err(SinkError::MySql)?;
            if !ddl.schema.is_empty() {
                let use_db = format!("USE {}", quote_ident(&ddl.schema));
                if let Err(e) = conn.query_drop(use_db).await {
                    // Creating the database itself: there is nothing to
                    // switch into yet.
                    if !is_ignorable_ddl_error(&e) {
                        return Err(SinkError::MySql(e));
                    }
                }
            }
            conn.query_drop(&ddl.query).await.map_err(SinkError::MySql)
        })
        .await;

        match result {
            Ok(()) => {
                info!(query = %ddl.query, finished_ts = %ddl.finished_ts, "applied ddl");
                Ok(())
            }
            Err(SinkError::MySql(e)) if is_ignorable_ddl_error(&e) => {
                warn!(query = %ddl.query, error = %e, "ignoring expected ddl error");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn emit_checkpoint_event(&self, _ts: Ts) -> Result<()> {
        Ok(())
    }

    async fn emit_resolved_event(&self, _ts: Ts) -> Result<()> {
        Ok(())
    }

    fn checkpoint_ts(&self) -> Ts {
        Ts::new(self.checkpoint.load(Ordering::Acquire))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn column_value_to_sql(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::NULL,
        ColumnValue::Bool(b) => Value::Int(i64::from(*b)),
        ColumnValue::Int(v) => Value::Int(*v),
        ColumnValue::UInt(v) => Value::UInt(*v),
        ColumnValue::Float(v) => Value::Double(*v),
        ColumnValue::String(v) => Value::Bytes(v.clone().into_bytes()),
        ColumnValue::Bytes(v) => Value::Bytes(v.clone()),
    }
}

/// Render one row change as (sql, params).
fn build_dml(row: &RowChangedEvent) -> Result<(String, Params)> {
    let table = format!("{}.{}", quote_ident(&row.schema), quote_ident(&row.table));
    match row.kind {
        RowKind::Insert | RowKind::Update => {
            let names: Vec<String> = row.columns.keys().map(|n| quote_ident(n)).collect();
            let placeholders: Vec<&str> = row.columns.iter().map(|_| "?").collect();
            let sql = format!(
                "REPLACE INTO {}({}) VALUES ({})",
                table,
                names.join(","),
                placeholders.join(",")
            );
            let params: Vec<Value> = row.columns.values().map(column_value_to_sql).collect();
            Ok((sql, Params::Positional(params)))
        }
        RowKind::Delete => {
            // Deletes carry only the unique-key columns.
            let conditions: Vec<String> = row
                .columns
                .keys()
                .map(|n| format!("{} = ?", quote_ident(n)))
                .collect();
            let sql = format!(
                "DELETE FROM {} WHERE {} LIMIT 1",
                table,
                conditions.join(" AND ")
            );
            let params: Vec<Value> = row.columns.values().map(column_value_to_sql).collect();
            Ok((sql, Params::Positional(params)))
        }
    }
}

fn is_ignorable_ddl_error(e: &mysql_async::Error) -> bool {
    match e {
        mysql_async::Error::Server(server) => IGNORABLE_DDL_ERRNOS.contains(&server.code),
        _ => false,
    }
}
