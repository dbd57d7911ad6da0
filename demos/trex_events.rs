//! TRex async event monitor
//!
//! Prints port events and a per-port packet count from the global
//! statistics until Ctrl-C.
//!
//! Run with: TREX_SERVER=10.0.0.5 cargo run --example trex_events
//!
//! Requires: a TRex server started with `./t-rex-64 -i`

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use trex_rpc::{AsyncTopic, Result, RpcClient, RpcConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = std::env::var("TREX_SERVER").unwrap_or_else(|_| "127.0.0.1".into());
    let config = RpcConfig::new(server, "trex-events").with_async_silence_timeout(Duration::from_secs(3));

    let client = RpcClient::new(config);
    client.connect().await?;

    let mut events = client.subscribe();
    client.barrier(Duration::from_secs(5)).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };

                match event.topic() {
                    AsyncTopic::Event => println!("event: {:?}", event.server_event()),
                    AsyncTopic::Global => {
                        if let Some(stats) = event.stats() {
                            for (port, counters) in &stats.ports {
                                println!("port {port}: opackets={}", counters.get("opackets").cloned().unwrap_or_default());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if !client.state().is_connected() {
            println!("connection lost");
            break;
        }
    }

    client.close().await?;
    Ok(())
}
