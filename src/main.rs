use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use libp2p::Multiaddr;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use snapshot_relay::config::{
    default_bootstrap_peers, BridgeConfig, ConnectionConfig, HostConfig, Limit, LogLevel, PoolConfig,
    ResourceLimits, Watermarks, DEFAULT_RPC_PORT,
};
use snapshot_relay::{
    load_keypair, retry, ConnectionManager, Dispatcher, FailureReporter, HttpDirectory, HttpReporter, KeySource,
    LogReporter, RelayerSource, RetryPolicy, RpcServer, SequencerDirectory, StaticDirectory, StreamPool,
    SubmissionBridge, TrustStore,
};

#[derive(Parser, Debug)]
#[command(name = "snapshot-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local submission RPC port.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_RPC_PORT)]
    port: u16,

    /// Data market contract address used to look up the sequencer.
    #[arg(long, env = "DATA_MARKET_ADDRESS", default_value = "")]
    data_market: String,

    /// Endpoint receiving failure reports. Failures are only logged when unset.
    #[arg(long, env = "REPORTING_URL")]
    reporting_url: Option<String>,

    #[arg(long, env = "RELAYER_LIST_URL")]
    relayer_list_url: Option<String>,

    #[arg(long, env = "RELAYER_LIST_FILE", conflicts_with = "relayer_list_url")]
    relayer_list_file: Option<PathBuf>,

    /// Hex ed25519 secret; created on first start if the file does not exist.
    #[arg(long, env = "PRIVATE_KEY_FILE")]
    private_key_file: Option<PathBuf>,

    #[arg(long, env = "PRIVATE_KEY", conflicts_with = "private_key_file", hide_env_values = true)]
    private_key: Option<String>,

    #[arg(long, env = "POOL_SIZE", default_value_t = 20)]
    pool_size: usize,

    #[arg(long, env = "HEALTH_CHECK_TIMEOUT_MS", default_value_t = 500)]
    health_check_timeout_ms: u64,

    #[arg(long, env = "WRITE_TIMEOUT_MS", default_value_t = 5_000)]
    write_timeout_ms: u64,

    #[arg(long, env = "MAX_WRITE_RETRIES", default_value_t = 2)]
    max_write_retries: u32,

    #[arg(long, env = "MAX_CONCURRENT_WRITES", default_value_t = 64)]
    max_concurrent_writes: usize,

    #[arg(long, env = "MAX_QUEUE_SIZE", default_value_t = 1024)]
    max_queue_size: usize,

    #[arg(long, env = "WORKER_POOL_SIZE", default_value_t = 16)]
    worker_pool_size: usize,

    #[arg(long, env = "CONNECTION_REFRESH_SECS", default_value_t = 300)]
    connection_refresh_secs: u64,

    /// 0 (off) to 6 (trace), or a level name. `RUST_LOG` takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "4")]
    log_level: LogLevel,

    /// P2P listen addresses. Defaults to TCP and QUIC on all interfaces.
    #[arg(long = "listen", value_name = "MULTIADDR")]
    listen: Vec<Multiaddr>,

    /// Bootstrap peers (`.../p2p/<id>`). Defaults to the public IPFS bootstrap list.
    #[arg(long = "bootstrap", value_name = "MULTIADDR")]
    bootstrap: Vec<Multiaddr>,

    #[arg(long, env = "RENDEZVOUS_POINT", default_value = snapshot_relay::config::DEFAULT_RENDEZVOUS_POINT)]
    rendezvous: String,

    #[arg(long, env = "RELAYER_RENDEZVOUS_POINT", default_value = snapshot_relay::config::DEFAULT_RELAYER_RENDEZVOUS_POINT)]
    relayer_rendezvous: String,

    #[arg(long, env = "SEQUENCER_DIRECTORY_URL")]
    sequencer_directory_url: Option<String>,

    /// Fixed sequencer address (`.../p2p/<id>`), bypassing the directory.
    #[arg(long, env = "SEQUENCER_ADDR", conflicts_with = "sequencer_directory_url")]
    sequencer_addr: Option<Multiaddr>,

    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    connect_timeout_secs: u64,

    #[arg(long, default_value_t = 100)]
    low_water: usize,

    #[arg(long, default_value_t = 400)]
    high_water: usize,

    #[arg(long, default_value_t = 60)]
    grace_period_secs: u64,

    #[arg(long, default_value = "unlimited")]
    memory_limit: Limit,

    #[arg(long, default_value = "unlimited")]
    fd_limit: Limit,

    #[arg(long, default_value = "unlimited")]
    stream_limit: Limit,

    #[arg(long, default_value = "unlimited")]
    connection_limit: Limit,

    #[arg(long)]
    no_relay_service: bool,

    #[arg(long)]
    no_upnp: bool,

    /// Seconds between telemetry log lines.
    #[arg(short, long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    telemetry_interval: u64,
}

impl Args {
    fn key_source(&self) -> KeySource {
        match (&self.private_key, &self.private_key_file) {
            (Some(hex), _) => KeySource::Hex(hex.clone()),
            (None, Some(path)) => KeySource::File(path.clone()),
            (None, None) => KeySource::Ephemeral,
        }
    }

    fn relayer_source(&self) -> Option<RelayerSource> {
        if let Some(path) = &self.relayer_list_file {
            return Some(RelayerSource::File(path.clone()));
        }
        self.relayer_list_url.clone().map(RelayerSource::Url)
    }

    fn directory(&self) -> Result<Arc<dyn SequencerDirectory>> {
        if let Some(addr) = &self.sequencer_addr {
            return Ok(Arc::new(StaticDirectory::from_addr(addr)?));
        }
        let Some(url) = &self.sequencer_directory_url else {
            bail!("one of --sequencer-addr or --sequencer-directory-url is required");
        };
        if self.data_market.is_empty() {
            bail!("--data-market is required with a sequencer directory");
        }
        let max_age = Duration::from_secs(self.connection_refresh_secs);
        Ok(Arc::new(HttpDirectory::new(url.clone(), max_age)?))
    }

    fn host_config(&self) -> HostConfig {
        let mut config = HostConfig {
            limits: ResourceLimits {
                memory_bytes: self.memory_limit,
                file_descriptors: self.fd_limit,
                streams: self.stream_limit,
                connections: self.connection_limit,
                ..ResourceLimits::default()
            },
            watermarks: Watermarks {
                low_water: self.low_water,
                high_water: self.high_water,
                grace_period: Duration::from_secs(self.grace_period_secs),
            },
            relay_service: !self.no_relay_service,
            upnp: !self.no_upnp,
            ..HostConfig::default()
        };
        if !self.listen.is_empty() {
            config.listen_addrs = self.listen.clone();
        }
        config
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            data_market: self.data_market.clone(),
            rendezvous_point: self.rendezvous.clone(),
            relayer_rendezvous_point: self.relayer_rendezvous.clone(),
            bootstrap_peers: if self.bootstrap.is_empty() {
                default_bootstrap_peers()
            } else {
                self.bootstrap.clone()
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            refresh_interval: Duration::from_secs(self.connection_refresh_secs),
            ..ConnectionConfig::default()
        }
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_size,
            health_check_timeout: Duration::from_millis(self.health_check_timeout_ms),
            ..PoolConfig::default()
        }
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            max_write_retries: self.max_write_retries,
            max_concurrent_writes: self.max_concurrent_writes,
            max_queue_size: self.max_queue_size,
            worker_pool_size: self.worker_pool_size,
            ..BridgeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = load_keypair(&args.key_source()).context("loading node identity")?;

    let trust = Arc::new(TrustStore::new());
    if let Err(e) = trust.load_with_fallback(args.relayer_source().as_ref()).await {
        warn!(error = %e, "no trusted relayer list, relay fallback disabled");
    }

    let manager = Arc::new(
        ConnectionManager::new(
            keypair,
            args.host_config(),
            args.connection_config(),
            Arc::clone(&trust),
            args.directory()?,
        )
        .context("invalid connection configuration")?,
    );
    info!(peer = %manager.local_peer_id(), "starting snapshot relay");

    let startup = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(120)).with_max_attempts(7);
    if let Err(e) = retry(&startup, "initial sequencer connection", || manager.establish_connection()).await {
        warn!(error = %e, "sequencer unreachable at startup, will reconnect on demand");
    }

    let pool = Arc::new(StreamPool::new(Arc::clone(&manager), args.pool_config()).context("invalid pool configuration")?);
    let reporter: Arc<dyn FailureReporter> = match &args.reporting_url {
        Some(url) => Arc::new(HttpReporter::new(url.clone())?),
        None => Arc::new(LogReporter),
    };
    let bridge = SubmissionBridge::new(Arc::clone(&pool), Arc::clone(&manager), reporter, args.bridge_config())
        .context("invalid bridge configuration")?;
    let dispatcher = Arc::new(Dispatcher::spawn(Arc::new(bridge)));

    let rpc_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let server = RpcServer::bind(rpc_addr, Arc::clone(&dispatcher))
        .await
        .with_context(|| format!("binding submission server on {rpc_addr}"))?;

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(cancel.clone()));
    let refresh_task = manager.spawn_refresh(cancel.clone());

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let peers = manager.connected_peers().await;
                info!(
                    phase = ?manager.phase(),
                    generation = manager.current_generation(),
                    peers,
                    idle_streams = pool.idle_count(),
                    checked_out = pool.checked_out_count(),
                    "telemetry snapshot"
                );
            }
        }
    }

    cancel.cancel();
    match server_task.await {
        Ok(Err(e)) => warn!(error = %e, "submission server ended with an error"),
        Err(e) => warn!(error = %e, "submission server task failed"),
        Ok(Ok(())) => {}
    }
    let _ = refresh_task.await;
    pool.stop();
    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => dispatcher.shutdown().await,
        Err(shared) => warn!(
            holders = Arc::strong_count(&shared),
            "dispatcher still shared, skipping queue drain"
        ),
    }
    manager.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_interval_must_be_positive() {
        assert!(Args::try_parse_from(["snapshot-relay", "--telemetry-interval", "0"]).is_err());
        let args = Args::try_parse_from(["snapshot-relay", "--telemetry-interval", "15"]).unwrap();
        assert_eq!(args.telemetry_interval, 15);
    }

    #[test]
    fn zero_refresh_interval_is_a_config_error() {
        let args = Args::try_parse_from(["snapshot-relay", "--connection-refresh-secs", "0"]).unwrap();
        assert!(args.connection_config().validate().is_err());
    }
}
