#![forbid(unsafe_code)]

mod config;
mod handlers;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relay_util::endpoint::TcpEndpoint;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::dispatch::HandlerTable;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::listener::Listener;
use crate::server::state::ServerState;
use crate::store::{ChatStore, MemoryStore, SqliteStore};

/// How long shutdown waits for sessions to flush and exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--bind tcp://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: {})\n\
\t          Format: tcp://host:port\n\
\t--config   Config file (default: ~/.chat_relay/config.toml)\n\
\t--help     Show this help\n\
",
		config::DEFAULT_BIND
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(endpoint: &str) -> SocketAddr {
	let bind = TcpEndpoint::parse(endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relay_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn open_store(persistence: &config::PersistenceSettings) -> anyhow::Result<Arc<dyn ChatStore>> {
	if !persistence.enabled {
		info!("persistence disabled; using in-memory store");
		return Ok(Arc::new(MemoryStore::new()));
	}

	let Some(database_url) = persistence.database_url.as_deref() else {
		return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
	};
	Ok(Arc::new(SqliteStore::connect(database_url).await?))
}

/// Resolves once on ctrl-c; stays pending if the signal cannot be installed.
async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c; shutdown only on listener failure");
		std::future::pending::<()>().await;
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = resolve_bind(args.bind.as_deref().unwrap_or(&server_cfg.server.bind));

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store = open_store(&server_cfg.persistence).await?;

	let mut table = HandlerTable::builder();
	handlers::register_all(&mut table, store)?;
	let table = table.build();
	info!(actions = table.len(), "handler table built");

	let state = ServerState::new(table, server_cfg.server.connection_settings());

	let health_state = HealthState::new(state.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let listener = Listener::bind(bind_addr, state.clone(), server_cfg.server.max_connections).await?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		shutdown_signal().await;
		info!("shutdown requested");
		let _ = shutdown_tx.send(true);
	});

	health_state.mark_ready();
	let result = listener.run(shutdown_rx).await;
	health_state.mark_not_ready();

	if !state.connections.wait_idle(DRAIN_TIMEOUT).await {
		warn!(
			remaining = state.connections.len().await,
			"sessions still open after drain timeout"
		);
	}
	info!("relay_server stopped");

	result
}
