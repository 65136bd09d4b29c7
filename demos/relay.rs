//! Example: Run the relay from a config file
//!
//! Loads `relay.toml` when it exists, otherwise reads `PACKET_RELAY_*`
//! environment variables, installs logging and relays until the session
//! ends.
//!
//! Run with: `cargo run --example relay -- relay.toml`

use packet_relay::config::ProxyConfig;
use packet_relay::protocol::{HandlerChain, PacketLogger};
use packet_relay::service::Proxy;
use packet_relay::utils::logging;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "relay.toml".to_string());
    let config = if Path::new(&path).exists() {
        ProxyConfig::from_file(&path)?
    } else {
        ProxyConfig::from_env()?
    };
    logging::init(&config.logging)?;

    let chain = HandlerChain::new().with(Arc::new(PacketLogger));
    Proxy::new(config, chain)?.run().await?;
    Ok(())
}
