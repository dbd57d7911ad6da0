// tests/port.rs

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use common::{connect_client, init_logging, trex_reply, FakeTrex, Reply};
use trex_rpc::protocol::{ErrorObject, Request};
use trex_rpc::{
    //
    MemoryHub,
    PortState,
    RpcConfig,
    RpcError,
    TrafficOptions,
};

const HANDLER: &str = "hX8c2";

/// Server-side state of one emulated port.
#[derive(Default)]
struct PortSim {
    owner: Option<String>,
    streams: u32,
    transmitting: bool,
    /// Status polls left before a running job finishes.
    polls_left: u32,
    opackets: u64,
    rx_good: u64,
}

impl PortSim {
    fn state(&self) -> &'static str {
        match (self.transmitting, self.streams) {
            (true, _) => "TX",
            (false, 0) => "IDLE",
            (false, _) => "STREAMS",
        }
    }
}

type Ports = Arc<Mutex<HashMap<u64, PortSim>>>;

fn port_server(ports: Ports) -> impl Fn(&Request) -> Reply + Send + Sync {
    // ---
    move |req| {
        let Some(port_id) = req.params.get("port_id").and_then(Value::as_u64) else {
            return trex_reply(req);
        };
        let mut ports = ports.lock().unwrap();
        let port = ports.entry(port_id).or_default();

        let owned = req.params.get("handler").and_then(Value::as_str) == Some(HANDLER);
        let not_owned = || {
            Reply::Err(
                ErrorObject::new(-32000, "Port is not owned")
                    .with_specific_err(format!("port {port_id} is not owned by you")),
            )
        };

        match req.method.as_str() {
            "acquire" => {
                let user = req.params["user"].as_str().unwrap_or_default().to_string();
                let force = req.params["force"].as_bool().unwrap_or(false);
                match port.owner.clone().filter(|owner| *owner != user && !force) {
                    Some(owner) => Reply::Err(
                        ErrorObject::new(-32000, "Port is owned")
                            .with_specific_err(format!("port {port_id} is owned by '{owner}'")),
                    ),
                    None => {
                        port.owner = Some(user);
                        Reply::Ok(json!(HANDLER))
                    }
                }
            }
            "get_port_status" => {
                let status = json!({
                    "owner": port.owner.clone().unwrap_or_default(),
                    "state": port.state(),
                    "max_stream_id": port.streams,
                });
                if port.transmitting {
                    port.polls_left = port.polls_left.saturating_sub(1);
                    port.transmitting = port.polls_left > 0;
                }
                Reply::Ok(status)
            }
            "get_port_stats" => {
                port.opackets += 100;
                Reply::Ok(json!({"opackets": port.opackets, "tx_pps": 1000.0}))
            }
            "get_port_xstats_names" => Reply::Ok(json!({"xstats_names": ["rx_good", "tx_errors"]})),
            "get_port_xstats_values" => {
                port.rx_good += 10;
                Reply::Ok(json!({"xstats_values": [port.rx_good, 0]}))
            }
            _ if !owned => not_owned(),
            "release" => {
                port.owner = None;
                Reply::Ok(json!({}))
            }
            "remove_all_streams" => {
                port.streams = 0;
                Reply::Ok(json!({}))
            }
            "add_stream" => {
                port.streams += 1;
                Reply::Ok(json!({}))
            }
            "service" => Reply::Ok(json!({})),
            "start_traffic" => {
                port.transmitting = true;
                port.polls_left = 3;
                Reply::Ok(json!({}))
            }
            "stop_traffic" => {
                port.transmitting = false;
                Reply::Ok(json!({}))
            }
            _ => trex_reply(req),
        }
    }
}

async fn start() -> (FakeTrex, trex_rpc::RpcClient, Ports) {
    // ---
    init_logging();

    let ports: Ports = Arc::default();
    let hub = MemoryHub::new();
    let server = FakeTrex::on_hub(&hub, port_server(ports.clone())).await;
    let client = connect_client(&hub, RpcConfig::memory("ports").with_request_timeout(Duration::from_secs(5))).await;
    (server, client, ports)
}

#[tokio::test]
async fn test_acquire_and_release() {
    // ---
    let (server, client, ports) = start().await;

    let mut mine = client.port(0).with_user("alice");
    mine.acquire(false).await.unwrap();
    assert_eq!(mine.handler(), Some(HANDLER));
    assert_eq!(mine.status().await.unwrap().owner, "alice");

    let mut theirs = client.port(0).with_user("bob");
    let err = theirs.acquire(false).await.unwrap_err();
    assert_eq!(err.remote().map(|remote| remote.message.as_str()), Some("port 0 is owned by 'alice'"));
    assert!(theirs.handler().is_none());

    theirs.acquire(true).await.unwrap();
    assert_eq!(ports.lock().unwrap()[&0].owner.as_deref(), Some("bob"));

    theirs.release().await.unwrap();
    assert!(theirs.handler().is_none());
    assert!(ports.lock().unwrap()[&0].owner.is_none());

    let acquire = &server.requests_for("acquire")[0];
    assert_eq!(acquire.params["user"], "alice");
    assert_eq!(acquire.params["force"], false);
    assert!(acquire.params["session_id"].is_u64());

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_commands_without_ownership_fail() {
    // ---
    let (server, client, _ports) = start().await;

    let port = client.port(1);
    let err = port.reset().await.unwrap_err();
    assert!(err.remote().is_some(), "{err:?}");

    let sent = server.requests_for("remove_all_streams");
    assert!(sent[0].params.get("handler").is_none());

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_reserve_ports() {
    // ---
    let (server, client, ports) = start().await;

    let reserved = client.reserve_ports(&[0, 1, 3], false).await.unwrap();
    let ids: Vec<_> = reserved.iter().map(|port| port.port_id()).collect();
    assert_eq!(ids, vec![0, 1, 3]);
    assert!(reserved.iter().all(|port| port.handler() == Some(HANDLER)));
    assert_eq!(ports.lock().unwrap().len(), 3);

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_streams_and_traffic() {
    // ---
    let (server, client, _ports) = start().await;

    let mut port = client.port(0);
    port.acquire(false).await.unwrap();

    let result = port.start_traffic(&TrafficOptions::default()).await;
    assert!(matches!(result, Err(RpcError::InvalidArgument(_))), "{result:?}");

    let streams = [json!({"enabled": true, "isg": 0.0}), json!({"enabled": true, "isg": 10.0})];
    port.write_streams(&streams).await.unwrap();
    assert_eq!(port.status().await.unwrap().state, PortState::Streams);

    let added = server.requests_for("add_stream");
    let stream_ids: Vec<_> = added.iter().map(|req| req.params["stream_id"].clone()).collect();
    assert_eq!(stream_ids, vec![json!(1), json!(2)]);
    assert_eq!(added[1].params["stream"], streams[1]);
    assert!(added.iter().all(|req| req.params["handler"] == HANDLER));

    port.set_service_mode(true).await.unwrap();
    assert_eq!(server.requests_for("service")[0].params["enabled"], true);

    port.start_traffic(&TrafficOptions::rate("10kpps").unwrap()).await.unwrap();
    let start = &server.requests_for("start_traffic")[0];
    assert_eq!(start.params["mul"], json!({"type": "pps", "value": 10000.0, "op": "abs"}));
    assert_eq!(start.params["duration"], -1.0);

    port.wait_idle(Duration::from_secs(1), Duration::from_secs(30)).await.unwrap();
    assert_eq!(port.status().await.unwrap().state, PortState::Streams);

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_idle_times_out() {
    // ---
    let (server, client, ports) = start().await;

    let mut port = client.port(0);
    port.acquire(false).await.unwrap();
    port.write_streams(&[json!({"enabled": true})]).await.unwrap();
    port.start_traffic(&TrafficOptions::default()).await.unwrap();
    ports.lock().unwrap().get_mut(&0).unwrap().polls_left = u32::MAX;

    let result = port.wait_idle(Duration::from_secs(1), Duration::from_secs(3)).await;
    assert!(matches!(result, Err(RpcError::Timeout)), "{result:?}");

    port.stop_traffic().await.unwrap();
    assert!(!port.status().await.unwrap().state.is_transmitting());

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_stats_relative_to_baseline() {
    // ---
    let (server, client, _ports) = start().await;

    let mut port = client.port(0);

    // without a baseline the raw counters come back
    assert_eq!(port.stats().await.unwrap()["opackets"], 100);

    port.clear_stats().await.unwrap();

    let stats = port.stats().await.unwrap();
    assert_eq!(stats["opackets"], 100);
    assert_eq!(stats["tx_pps"], 1000.0);

    let xstats = port.xstats().await.unwrap();
    assert_eq!(xstats["rx_good"], 10);
    assert_eq!(xstats["tx_errors"], 0);

    // names are fetched once
    assert_eq!(server.requests_for("get_port_xstats_names").len(), 1);

    client.close().await.unwrap();
    server.shutdown().await;
}
