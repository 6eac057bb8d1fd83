use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use realtime_mux::metrics;
use realtime_mux::telemetry::init_tracing;
use realtime_mux::{ListenerCallbacks, MuxConfig, RealtimeMux, SubscribeOptions, SubscriptionRegistry};
use realtime_transport::{ChangeKind, ConnectionId, LocalTransport, TransportStatus};
use tracing::info;

/// Drives shared subscriptions over the in-memory transport and injects
/// channel failures to exercise reconnect backoff.
#[derive(Debug, Parser)]
#[command(name = "realtime-mux")]
struct Args {
    #[arg(long, env = "TRACKER_REALTIME_TABLE", default_value = "tickets")]
    table: String,
    #[arg(long, env = "TRACKER_REALTIME_FILTER")]
    filter: Option<String>,
    #[arg(long, default_value_t = 2)]
    subscribers: usize,
    #[arg(long, default_value_t = 1)]
    failures: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = MuxConfig::from_env();
    init_tracing(&cfg.log_filter);

    let transport = LocalTransport::new();
    let registry = SubscriptionRegistry::create();
    let mux = RealtimeMux::create(registry.clone(), Arc::new(transport.clone()), cfg.policy());

    let handles: Vec<_> = (0..args.subscribers)
        .map(|index| {
            let mut options = SubscribeOptions::new(args.table.clone()).with_callbacks(
                ListenerCallbacks::new().on_insert(move |event| {
                    info!(subscriber = index, payload = %event.payload, "insert received");
                    Ok(())
                }),
            );
            if let Some(filter) = &args.filter {
                options = options.with_filter(filter.clone());
            }
            mux.subscribe(options)
        })
        .collect();

    let mut status = handles
        .first()
        .ok_or_else(|| anyhow!("at least one subscriber is required"))?
        .watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = ?current, "subscriber 0 status");
        }
    });

    let filter = args.filter.as_deref();
    let mut connection = wait_for_connection(&transport, &args.table, filter, None).await?;
    transport.acknowledge(connection)?;
    transport.emit_change(
        connection,
        ChangeKind::Insert,
        serde_json::json!({"id": "T-1", "title": "first ticket"}),
    )?;

    for failure in 1..=args.failures {
        info!(failure, connection_id = %connection, "injecting channel error");
        transport.emit_status(connection, TransportStatus::ChannelError)?;
        connection = wait_for_connection(&transport, &args.table, filter, Some(connection)).await?;
        transport.acknowledge(connection)?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    info!(
        opens = transport.open_count(),
        closes = transport.close_count(),
        channels = registry.len(),
        "shutting down"
    );
    drop(handles);
    registry.dispose_all();
    print!("{}", String::from_utf8_lossy(&metrics::gather()));
    Ok(())
}

/// Polls until a live connection other than `previous` exists for the pair.
async fn wait_for_connection(
    transport: &LocalTransport,
    table: &str,
    filter: Option<&str>,
    previous: Option<ConnectionId>,
) -> Result<ConnectionId> {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if let Some(id) = transport.latest_connection(table, filter) {
                if Some(id) != previous {
                    return id;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timed out waiting for transport connection")
}
