// tests/common/mod.rs
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use trex_rpc::protocol::{ErrorObject, Request, Response};
use trex_rpc::{
    //
    create_memory_transport_with_hub,
    AsyncEvent,
    Channel,
    Envelope,
    MemoryHub,
    RpcClient,
    RpcConfig,
    TransportConfig,
    TransportMode,
    TransportPtr,
    DEFAULT_ASYNC_PORT,
    DEFAULT_SYNC_PORT,
};

pub const API_HANDLER: &str = "Zq7Lw1Wp";

/// What the fake server does with one request.
pub enum Reply {
    Ok(Value),
    Err(ErrorObject),
    /// Sent verbatim as the response item.
    Raw(Value),
    /// No response at all.
    Silent,
}

pub type Responder = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Replies like a TRex stateless server.
pub fn trex_reply(req: &Request) -> Reply {
    // ---
    match req.method.as_str() {
        "api_sync_v2" => Reply::Ok(json!({"api_h": API_HANDLER})),
        "get_version" => Reply::Ok(json!({
            "version": "v3.02",
            "build_date": "Feb 16 2023",
            "build_time": "11:09:34",
            "built_by": "hhaim",
            "mode": "STL",
        })),
        "ping" | "publish_now" => Reply::Ok(json!({})),
        "get_supported_cmds" => Reply::Ok(json!(["api_sync_v2", "get_version", "ping", "publish_now"])),
        "get_port_status" => Reply::Ok(json!({
            "port_id": req.params.get("port_id").cloned().unwrap_or(Value::Null),
            "owner": "",
            "state": "IDLE",
        })),
        _ => Reply::Err(ErrorObject::new(-32601, "Method not found")),
    }
}

pub fn transport_config(node_id: &str, mode: TransportMode) -> TransportConfig {
    // ---
    TransportConfig {
        server: "memory".into(),
        sync_port: DEFAULT_SYNC_PORT,
        async_port: Some(DEFAULT_ASYNC_PORT),
        node_id: node_id.into(),
        mode,
        transport_type: Some("memory".into()),
        compression_threshold: None,
    }
}

/// In-process stand-in for a TRex server.
pub struct FakeTrex {
    // ---
    transport: TransportPtr,
    requests: Arc<Mutex<Vec<Request>>>,
    skip_acks: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeTrex {
    // ---

    pub async fn on_hub(hub: &Arc<MemoryHub>, responder: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        // ---
        let transport = create_memory_transport_with_hub(
            transport_config("fake-trex", TransportMode::Server),
            hub.clone(),
        )
        .await
        .expect("failed to create server transport");

        Self::start(transport, Arc::new(responder)).await
    }

    pub async fn start(transport: TransportPtr, responder: Responder) -> Self {
        // ---
        let mut handle = transport
            .subscribe(Channel::Request.into())
            .await
            .expect("server subscribe failed");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let skip_acks = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let transport = transport.clone();
            let requests = requests.clone();
            let skip_acks = skip_acks.clone();
            async move {
                while let Some(env) = handle.inbox.recv().await {
                    serve(&transport, &responder, &requests, &skip_acks, &env.payload).await;
                }
            }
        });

        Self {
            transport,
            requests,
            skip_acks,
            task,
        }
    }

    /// Requests received so far, batches flattened.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<Request> {
        // ---
        self.requests()
            .into_iter()
            .filter(|req| req.method == method)
            .collect()
    }

    /// Withhold the next `count` barrier acknowledgements.
    pub fn skip_barrier_acks(&self, count: usize) {
        self.skip_acks.store(count, Ordering::SeqCst);
    }

    pub async fn push_event(&self, event: &AsyncEvent) {
        // ---
        let payload = event.encode().expect("event encode failed");
        self.transport
            .publish(Envelope::event(payload))
            .await
            .expect("event publish failed");
    }

    /// Publish an arbitrary message on the response channel.
    pub async fn send_raw(&self, message: Value) {
        // ---
        let payload = serde_json::to_vec(&message).expect("encode failed");
        self.transport
            .publish(Envelope::response(payload))
            .await
            .expect("response publish failed");
    }

    /// Publish raw bytes on the response channel.
    pub async fn send_bytes(&self, payload: Vec<u8>) {
        // ---
        self.transport
            .publish(Envelope::response(payload))
            .await
            .expect("response publish failed");
    }

    pub async fn shutdown(self) {
        // ---
        self.transport.close().await.expect("server close failed");
        self.task.abort();
    }
}

async fn serve(
    transport: &TransportPtr,
    responder: &Responder,
    requests: &Mutex<Vec<Request>>,
    skip_acks: &AtomicUsize,
    payload: &[u8],
) {
    // ---
    let Ok(message) = serde_json::from_slice::<Value>(payload) else {
        return;
    };
    let (items, is_batch) = match message {
        Value::Array(items) => (items, true),
        other => (vec![other], false),
    };

    let mut replies = Vec::new();
    let mut barrier_keys = Vec::new();

    for item in items {
        let Ok(req) = serde_json::from_value::<Request>(item) else {
            continue;
        };
        requests.lock().unwrap().push(req.clone());

        let reply = match responder(&req) {
            Reply::Ok(result) => Response::success(req.id, result).to_value().unwrap(),
            Reply::Err(error) => Response::failure(req.id, error).to_value().unwrap(),
            Reply::Raw(value) => value,
            Reply::Silent => continue,
        };
        replies.push(reply);

        if req.method == "publish_now" {
            if let Some(key) = req.params.get("key").and_then(Value::as_u64) {
                barrier_keys.push(key);
            }
        }
    }

    if replies.is_empty() {
        return;
    }
    let message = if is_batch {
        Value::Array(replies)
    } else {
        replies.remove(0)
    };
    let payload = serde_json::to_vec(&message).unwrap();
    let _ = transport.publish(Envelope::response(payload)).await;

    for key in barrier_keys {
        let skipped = skip_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if skipped {
            continue;
        }
        let ack = AsyncEvent::new("trex-barrier", json!(key), json!({}));
        let _ = transport.publish(Envelope::event(ack.encode().unwrap())).await;
    }
}

/// Client connected through `hub`.
pub async fn connect_client(hub: &Arc<MemoryHub>, config: RpcConfig) -> RpcClient {
    // ---
    let transport = create_memory_transport_with_hub(
        transport_config(&config.transport_id, TransportMode::Client),
        hub.clone(),
    )
    .await
    .expect("failed to create client transport");

    RpcClient::with_transport(transport, config)
        .await
        .expect("client connect failed")
}

/// Poll `cond` until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    // ---
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
