//! In-process TRex emulation
//!
//! Runs a minimal server on the in-memory transport and talks to it with a
//! regular client. No TRex installation needed.
//!
//! Run with: cargo run --example trex_memory

use std::time::Duration;

use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use trex_rpc::protocol::{Request, Response};
use trex_rpc::{
    // ---
    AsyncEvent,
    Channel,
    Envelope,
    Result,
    RpcClient,
    RpcConfig,
    ServerEvent,
    TransportBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = TransportBuilder::new()
        .server("memory")
        .node_id("fake-trex")
        .server_mode()
        .transport_type("memory")
        .build()
        .await?;
    let mut requests = server.subscribe(Channel::Request.into()).await?;

    let responder = tokio::spawn({
        let server = server.clone();
        async move {
            while let Some(env) = requests.inbox.recv().await {
                let Ok(req) = Request::decode(&env.payload) else {
                    continue;
                };
                let result = match req.method.as_str() {
                    "get_version" => json!({"version": "v3.02", "built_by": "memory"}),
                    _ => json!({}),
                };
                let response = Response::success(req.id, result).encode()?;
                server.publish(Envelope::response(response)).await?;

                let started = AsyncEvent::new("trex-event", json!(ServerEvent::PORT_STARTED), json!({"port_id": 0}));
                server.publish(Envelope::event(started.encode()?)).await?;
            }
            Ok::<_, trex_rpc::RpcError>(())
        }
    });

    let client = RpcClient::new(RpcConfig::memory("client"));
    client.connect().await?;
    let mut events = client.subscribe();

    let version = client.get_version(Duration::from_secs(1)).await?;
    println!("server version: {}", version.version);

    let started = client.call("start_traffic", Value::Null, Duration::from_secs(1)).await?;
    println!("start_traffic -> {started}");

    if let Some(event) = events.recv().await {
        println!("async event: {:?}", event.server_event());
    }

    client.close().await?;
    server.close().await?;
    responder.abort();
    Ok(())
}
