use std::{env, sync::Arc};

use async_trait::async_trait;
use chordring::{
    config::{Config, LogLevel, TransportConfig},
    dht::{DelegateHook, EventCtx, Ring},
    error::{Error, Result},
    transport::NetworkTransport,
};
use log::info;

struct EventLogger;

#[async_trait]
impl DelegateHook for EventLogger {
    async fn emit_event(&self, ctx: EventCtx) {
        info!(
            "{:?} on {}: primary {:?}, secondary {:?}, replicas {:?}",
            ctx.ev_type, ctx.target, ctx.primary_item, ctx.secondary_item, ctx.item_list
        );
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::Parse(format!("invalid value for {}: {}", name, value))),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let port = args
        .get(1)
        .ok_or(Error::Parse("missing port argument".into()))?;
    let bootstrap = args.get(2);

    let log_level: LogLevel = env_or("NODE_LOG_LEVEL", LogLevel::Info)?;
    env_logger::Builder::new()
        .filter_level(log_level.into())
        .parse_default_env()
        .init();

    let hostname = env::var("NODE_HOSTNAME").unwrap_or("127.0.0.1".to_owned());
    let public_addr = format!("{}:{}", hostname, port);
    let config = Config::new(public_addr.clone())
        .with_num_vnodes(env_or("NODE_VNODES", 3)?)
        .with_replicas(env_or("NODE_REPLICAS", 2)?)
        .with_log_level(log_level);

    let transport = NetworkTransport::bind(TransportConfig::new(format!("0.0.0.0:{}", port))).await?;

    info!("Initializing node on {}", public_addr);
    let ring = match bootstrap {
        Some(existing) => Ring::join(config, transport.clone(), existing).await?,
        None => Ring::create(config, transport.clone()).await?,
    };
    ring.register_delegate_hook(Arc::new(EventLogger));

    for vnode in ring.my_vnodes() {
        info!("hosting vnode {}", vnode);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    ring.shutdown();
    transport.shutdown();

    Ok(())
}
