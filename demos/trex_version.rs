//! TRex version query
//!
//! Connects to a TRex server, negotiates the stateless API and prints the
//! server version and the supported commands.
//!
//! Run with: TREX_SERVER=10.0.0.5 cargo run --example trex_version
//!
//! Requires: a TRex server started with `./t-rex-64 -i`

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use trex_rpc::{ApiVersion, Result, RetryConfig, RpcClient, RpcConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = std::env::var("TREX_SERVER").unwrap_or_else(|_| "127.0.0.1".into());

    let config = RpcConfig::new(server, "trex-version")
        .with_retry(RetryConfig::default())
        .with_api_sync(ApiVersion::stateless());

    let client = RpcClient::new(config);
    client.connect().await?;

    let version = client.get_version(Duration::from_secs(5)).await?;
    println!(
        "TRex {} built {} {} by {}",
        version.version, version.build_date, version.build_time, version.built_by
    );

    let cmds = client.get_supported_cmds().await?;
    println!("{} supported commands", cmds.len());

    client.close().await?;
    Ok(())
}
