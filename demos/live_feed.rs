//! Stream live fleet updates from a running simulation backend.
//!
//! ```text
//! FLEET_SYNC_URL=http://localhost:8000 RUST_LOG=fleet_sync=debug cargo run --example live_feed
//! ```

use std::time::Duration;

use fleet_sync::{EventType, SyncClient, SyncEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let client = SyncClient::from_env()?;

    client
        .on(EventType::SimulationTick, |envelope| {
            if let SyncEvent::SimulationTick(tick) = &envelope.event {
                println!(
                    "tick {} at {} active_trucks={:?} bins_needing_collection={:?}",
                    tick.tick_count,
                    tick.sim_time.as_deref().unwrap_or("-"),
                    tick.active_trucks(),
                    tick.bins_needing_collection()
                );
            }
            Ok(())
        })
        .await?;
    client
        .on(EventType::OptimizationComplete, |envelope| {
            if let SyncEvent::OptimizationComplete(done) = &envelope.event {
                println!(
                    "routes optimized: {} trucks, {} bins, {:.1} km",
                    done.trucks_optimized, done.bins_assigned, done.total_distance
                );
            }
            Ok(())
        })
        .await?;
    client
        .on(EventType::ConnectionLost, |envelope| {
            println!("connection lost: {}", envelope.payload["reason"]);
            Ok(())
        })
        .await?;

    client.subscribe_simulation().await?;
    client.subscribe_optimization().await?;
    client.connect().await?;

    let mut status_every = tokio::time::interval(Duration::from_secs(10));
    status_every.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status_every.tick() => {
                match client.ping().await {
                    Ok(rtt) => println!("rtt {rtt:?}"),
                    Err(err) => println!("ping failed: {err}"),
                }
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}
