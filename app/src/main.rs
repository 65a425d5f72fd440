use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use proxy_core::drain;
use proxy_core::error::ProxyError;
use proxy_core::metrics::Metrics;
use proxy_core::signal::Shutdown;
use proxy_core::telemetry::{self, LogFormat};
use proxy_engine::facade::{DefaultDelegate, RequestContextFacade};
use proxy_engine::frontend;
use proxy_session::altsvc::AltServiceRegistry;
use proxy_session::dialer::Dialer;
use proxy_session::pool::SessionPool;
use proxy_session::race::RaceController;
use proxy_transport::dns::CachedResolver;
use proxy_transport::stream::Socket;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

mod config;

const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(about = "A forward proxy engine", long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Use config from an inline string.
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from a file.
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the configuration, then exit.
	#[arg(long)]
	validate_only: bool,

	/// Print the version and exit.
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> std::process::ExitCode {
	let args = Args::parse();

	if args.version {
		println!("proxyd {}", env!("CARGO_PKG_VERSION"));
		return std::process::ExitCode::SUCCESS;
	}

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("failed to start the async runtime: {e}");
			return std::process::ExitCode::from(1);
		},
	};
	runtime.block_on(run(args))
}

async fn run(args: Args) -> std::process::ExitCode {
	let cfg = match load_config(&args).await {
		Ok(cfg) => cfg,
		Err(e) => {
			eprintln!("configuration error: {e}");
			return std::process::ExitCode::from(1);
		},
	};

	let log_format: LogFormat = cfg.log_format.parse().unwrap_or_default();
	telemetry::setup_logging(log_format);

	if args.validate_only {
		println!("configuration is valid");
		return std::process::ExitCode::SUCCESS;
	}

	info!(listen = %cfg.listen_addr, "starting");

	let resolver = match CachedResolver::system() {
		Ok(r) => Arc::new(r),
		Err(e) => {
			eprintln!("failed to initialize the resolver: {e}");
			return std::process::ExitCode::from(3);
		},
	};

	let metrics = Arc::new(Metrics::new());

	let pool = SessionPool::with_metrics(metrics.clone());
	let quic_host_allowlist = Arc::new(cfg.quic_host_allowlist.clone());
	let dialer = match Dialer::with_quic_config(pool, resolver, cfg.enable_quic, quic_host_allowlist.clone()) {
		Ok(d) => Arc::new(d),
		Err(e) => {
			eprintln!("failed to initialize the upstream dialer: {e}");
			return std::process::ExitCode::from(1);
		},
	};
	let altsvc = AltServiceRegistry::new();
	let race_config = proxy_session::race::RaceConfig {
		enable_quic: cfg.enable_quic,
		mark_broken_when_network_blackholes: cfg.mark_broken_when_network_blackholes,
		retry_without_alt_svc_on_quic_errors: cfg.retry_without_alt_svc_on_quic_errors,
		quic_host_allowlist,
	};
	let race = Arc::new(RaceController::with_metrics(dialer, altsvc.clone(), cfg.require_confirmation, race_config, metrics.clone()));
	let facade = RequestContextFacade::with_metrics(race, altsvc, metrics);

	let listener = match TcpListener::bind(cfg.listen_addr).await {
		Ok(l) => l,
		Err(e) => {
			eprintln!("failed to bind {}: {e}", cfg.listen_addr);
			return std::process::ExitCode::from(2);
		},
	};

	let shutdown = Shutdown::new();
	let (drain_trigger, drain_watcher) = drain::new();

	let accept = async move |watch: drain::DrainWatcher| {
		let wait = watch.clone().wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					match accepted {
						Ok((stream, peer)) => spawn_connection(stream, peer, facade.clone(), watch.clone()),
						Err(e) => warn!(error = %e, "accept failed"),
					}
				}
				_ = &mut wait => {
					info!("accept loop draining");
					return;
				}
			}
		}
	};

	tokio::select! {
		() = drain::run_with_drain("accept-loop".to_string(), drain_watcher, DRAIN_DEADLINE, accept) => {},
		() = shutdown.wait() => {
			drain_trigger.start_drain_and_wait(drain::DrainMode::Graceful).await;
		}
	}

	std::process::ExitCode::SUCCESS
}

fn spawn_connection(stream: TcpStream, peer: std::net::SocketAddr, facade: RequestContextFacade, watch: drain::DrainWatcher) {
	tokio::spawn(async move {
		// Held for the lifetime of the connection so a graceful drain waits
		// for it to finish instead of severing it mid-flight.
		let _watch = watch;
		debug!(%peer, "accepted connection");
		if let Err(e) = serve(stream, facade).await {
			warn!(%peer, error = %e, "connection setup failed");
		}
	});
}

/// Reads the CONNECT handshake off `stream` with a one-byte internal buffer
/// so nothing the client sends past the blank line is consumed by the
/// parser's own buffering — those bytes must reach the Byte-Pump's early
/// pull untouched.
async fn serve(stream: TcpStream, facade: RequestContextFacade) -> anyhow::Result<()> {
	let mut reader = BufReader::with_capacity(1, stream);
	let request = frontend::read_connect_request(&mut reader).await?;

	let delegate = Arc::new(DefaultDelegate);
	let server = match facade.dial(request.target.clone(), &delegate).await {
		Ok(server) => server,
		Err(ProxyError::ProxyAuthRequired) => {
			frontend::write_proxy_auth_required(&mut reader, "proxyd").await?;
			return Ok(());
		},
		Err(e) => {
			warn!(target = %request.target, error = %e, "upstream dial failed");
			frontend::write_connect_failed(&mut reader, 502, "Bad Gateway").await?;
			return Ok(());
		},
	};

	// Only now that the upstream is actually reachable does the client get
	// told the tunnel is open.
	frontend::write_connect_ok(&mut reader).await?;
	let stream = reader.into_inner();
	let client = Socket::from_tcp(stream)?;

	if let Err(e) = facade.run(client, server, delegate).await {
		warn!(target = %request.target, error = %e, "forward connection ended with an error");
	}
	Ok(())
}

async fn load_config(args: &Args) -> anyhow::Result<config::Config> {
	match (&args.config, &args.file) {
		(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file may be given"),
		(Some(inline), None) => config::parse_config(inline),
		(None, Some(path)) => config::load_from_file(path).await,
		(None, None) => Ok(config::Config::default()),
	}
}
