//! `mptund`: reads the INI-style configuration, stands up the logical
//! address allocator and the multipath tunnel manager, binds every
//! configured bearer, and runs until SIGINT. Mirrors `Program::Program` /
//! `Program::run` in shape: parse args, configure the allocator, build the
//! tunnels, then block on the control loop.

mod cli;
mod logging;
mod wiring;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tunnel::alloc::LogicalAddressAllocator;
use tunnel::bearer::gre::GreBearer;
use tunnel::bearer::tcp::TcpBearer;
use tunnel::bearer::udp::UdpBearer;
use tunnel::bearer::{BearerDescriptor, Protocol, Role};
use tunnel::manager::{BearerHandle, MpTunnelMgr};
use tunnel::vif::VirtualIfMgr;

use cli::Cli;
use wiring::BearerConfig;

const BIND_MAX_ATTEMPTS: u32 = 60;
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let mut argv: Vec<String> = std::env::args().collect();
    rewrite_vv_token(&mut argv);

    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(err) => {
            err.print().ok();
            return exit_code_for_clap_error(&err);
        }
    };

    if cli.version {
        println!("mptund {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    logging::init(cli.logstdout);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// `clap` has no way to express a literal two-character short token like
/// `-vv` distinct from the short flag `v` supplied twice, which is how the
/// original's hand-rolled argument scanner treats it (a whole-string
/// comparison, not short-flag stacking). Rewriting it to `--logstdout`
/// before parsing reproduces that whole-token semantics.
fn rewrite_vv_token(argv: &mut [String]) {
    for arg in argv.iter_mut() {
        if arg == "-vv" {
            *arg = "--logstdout".to_string();
        }
    }
}

fn exit_code_for_clap_error(err: &clap::Error) -> ExitCode {
    use clap::error::ErrorKind;
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(config = %cli.config.display(), "mptund is starting");

    let config_text = std::fs::read_to_string(&cli.config)
        .map_err(|e| anyhow::anyhow!("error opening {}: {e}", cli.config.display()))?;
    let cfg = tunnel::config::parse(&config_text)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let allocator: Arc<LogicalAddressAllocator> = Arc::new(LogicalAddressAllocator::default());
    if let Some(range) = wiring::read_address_range(&cfg) {
        allocator
            .configure(range.first_ip, range.last_ip, range.ttl)
            .map_err(|e| anyhow::anyhow!("logical_address_range: {e}"))?;
    } else {
        tracing::warn!("no [logical_address_range] configured; SIP registration will fail");
    }

    let bearer_configs = wiring::build_bearers(&cfg, cli.port)?;

    let vif = Arc::new(VirtualIfMgr::new());
    let mgr = Arc::new(MpTunnelMgr::new(vif.clone()));

    for bearer in &bearer_configs {
        bind_and_register(&mgr, bearer).await?;
    }

    tracing::info!(tunnels = mgr.size().await, "all configured bearers are up");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen for ctrl-c: {e}"))?;

    tracing::warn!("shutting down the server...");

    Ok(())
}

async fn bind_and_register(mgr: &MpTunnelMgr, bearer: &BearerConfig) -> anyhow::Result<()> {
    let descriptor = BearerDescriptor::new(
        bearer.local_address,
        bearer.remote_address,
        bearer.port,
        bearer.port,
        bearer.protocol,
    );

    let handle = match bearer.protocol {
        Protocol::Gre => BearerHandle::Gre(
            bind_with_retries(bearer, || GreBearer::bind(bearer.local_address)).await?,
        ),
        Protocol::Udp => BearerHandle::Udp(
            bind_with_retries(bearer, || UdpBearer::bind(bearer.local_address, bearer.port))
                .await?,
        ),
        Protocol::Tcp => match descriptor.role() {
            Role::Server => {
                // Probe the listener address up front so a persistently busy
                // port is retried the same way a GRE/UDP bind failure is,
                // rather than silently retrying forever inside the bearer's
                // own connection manager.
                bind_with_retries(bearer, || {
                    std::net::TcpListener::bind((bearer.local_address, bearer.port)).map(drop)
                })
                .await?;

                BearerHandle::Tcp(TcpBearer::spawn_server(bearer.local_address, bearer.port))
            }
            Role::Client => BearerHandle::Tcp(TcpBearer::spawn_client(
                bearer.local_address,
                0,
                bearer.remote_address,
                bearer.port,
            )),
        },
    };

    if !mgr.add_bearer(&bearer.ifname, descriptor, handle).await {
        anyhow::bail!(
            "bearer {:?} on tunnel {:?}: remote address already bound to another interface",
            bearer.bearer_name,
            bearer.ifname
        );
    }

    Ok(())
}

/// Retries a fallible bind up to [`BIND_MAX_ATTEMPTS`] times, sleeping
/// [`BIND_RETRY_INTERVAL`] between attempts, matching `makeSipServer`'s
/// `bindMaxAttempts = 60` / `sleep(5)` loop.
async fn bind_with_retries<T, E: std::fmt::Display>(
    bearer: &BearerConfig,
    mut attempt: impl FnMut() -> Result<T, E>,
) -> anyhow::Result<T> {
    let mut attempts_left = BIND_MAX_ATTEMPTS;

    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) if attempts_left > 0 => {
                tracing::warn!(
                    bearer = %bearer.bearer_name,
                    %err,
                    attempts_left,
                    "bind failed, retrying"
                );
                attempts_left -= 1;
                tokio::time::sleep(BIND_RETRY_INTERVAL).await;
            }
            Err(err) => {
                anyhow::bail!(
                    "bearer {:?}: failed to bind after {} attempts: {}",
                    bearer.bearer_name,
                    BIND_MAX_ATTEMPTS,
                    err
                );
            }
        }
    }
}
