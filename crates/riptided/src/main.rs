//! riptide replication daemon.
//!
//! Usage:
//!   # Standalone demo: synthetic upstream into a blackhole sink
//!   riptided --create-changefeed demo
//!
//!   # Standalone demo into a MySQL-compatible downstream
//!   riptided --create-changefeed demo --sink-uri mysql://root@127.0.0.1:4000/

mod cli;
mod datagen;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use riptide_core::model::{
    ChangeFeedId, ChangeFeedInfo, ColumnInfo, ColumnType, TableId, TableInfo, Ts,
};
use riptide_meta::{KeySpace, MemMetaStore, MetaClient};
use riptide_schema::{FixedSnapshotProvider, SchemaSnapshot};
use riptide_server::{Capture, CaptureConfig};
use riptide_sink::{MemMessageBus, MessageBus, MessageBusFactory};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use datagen::DatagenRegionClient;

/// Message-bus factory for `kafka://` sink URIs in standalone mode: an
/// in-memory bus stands in for the real cluster.
struct MemBusFactory;

impl MessageBusFactory for MemBusFactory {
    fn create(
        &self,
        _brokers: &str,
        _topic: &str,
        partitions: i32,
    ) -> riptide_sink::Result<Arc<dyn MessageBus>> {
        Ok(Arc::new(MemMessageBus::new(partitions)))
    }
}

fn demo_tables() -> Vec<TableInfo> {
    vec![TableInfo {
        id: TableId(1),
        schema_name: "demo".to_string(),
        table_name: "events".to_string(),
        columns: vec![
            ColumnInfo {
                id: 1,
                name: "id".to_string(),
                col_type: ColumnType::Int,
                primary_key: true,
                unique: true,
                generated: false,
                public: true,
                nullable: false,
            },
            ColumnInfo {
                id: 2,
                name: "payload".to_string(),
                col_type: ColumnType::Varchar,
                primary_key: false,
                unique: false,
                generated: false,
                public: true,
                nullable: true,
            },
        ],
        pk_handle: Some("id".to_string()),
    }]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    }

    let store = Arc::new(MemMetaStore::new());
    let meta = MetaClient::new(store.clone(), KeySpace::new(&cli.meta_prefix));

    // Expired leases are reaped here; captures only refresh their own.
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                for lease in store.expire_dead_leases() {
                    tracing::warn!(%lease, "expired lease reaped");
                }
            }
        });
    }

    let seed_ts = if cli.start_ts > 0 {
        Ts::new(cli.start_ts)
    } else {
        Ts::from_unix_ms(unix_now_ms())
    };
    let tables = demo_tables();
    let region_client = Arc::new(DatagenRegionClient::new(
        tables.clone(),
        cli.datagen_rate,
        seed_ts,
    ));
    let snapshot_provider = Arc::new(FixedSnapshotProvider::new(SchemaSnapshot::with_tables(
        tables, seed_ts,
    )));

    if let Some(id) = &cli.create_changefeed {
        let mut info = ChangeFeedInfo::new(cli.sink_uri.clone());
        info.start_ts = Ts::new(cli.start_ts);
        info.target_ts = Ts::new(cli.target_ts);
        match meta.create_changefeed(&ChangeFeedId::new(id.clone()), &info).await {
            Ok(()) => tracing::info!(changefeed = %id, sink = %cli.sink_uri, "changefeed created"),
            Err(e) => tracing::warn!(changefeed = %id, error = %e, "changefeed not created"),
        }
    }

    let cancel = CancellationToken::new();
    let capture = Capture::new(
        meta,
        region_client,
        snapshot_provider,
        Some(Arc::new(MemBusFactory)),
        CaptureConfig {
            lease_ttl: cli.lease_ttl(),
            advertise_addr: cli.addr.clone(),
            ..Default::default()
        },
        cancel.clone(),
    );
    tracing::info!(capture = %capture.id(), addr = %cli.addr, "riptided starting");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    let mut run = tokio::spawn(async move { capture.run().await });
    tokio::select! {
        // A signal or lease loss: give the capture a bounded drain.
        _ = cancel.cancelled() => {
            match tokio::time::timeout(Duration::from_secs(30), &mut run).await {
                Ok(Ok(Ok(()))) => tracing::info!("capture shut down cleanly"),
                Ok(Ok(Err(e))) => tracing::error!(error = %e, "capture exited with error"),
                Ok(Err(e)) => tracing::error!(error = %e, "capture task panicked"),
                Err(_) => tracing::warn!("shutdown timed out, forcing exit"),
            }
        }
        result = &mut run => match result {
            Ok(Ok(())) => tracing::info!("capture finished"),
            Ok(Err(e)) => tracing::error!(error = %e, "capture exited with error"),
            Err(e) => tracing::error!(error = %e, "capture task panicked"),
        }
    }
    Ok(())
}

fn unix_now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
