#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use confab_server::config;
use confab_server::server::auth::HmacTokenVerifier;
use confab_server::server::directory::OpenDirectory;
use confab_server::server::dispatcher::BroadcastDispatcher;
use confab_server::server::gateway::{Gateway, run_gateway};
use confab_server::server::health::{HealthState, spawn_health_server};
use confab_server::server::history::{HttpApi, MessageHistoryService, spawn_http_api};
use confab_server::server::registry::SubscriptionRegistry;
use confab_server::server::store::{MemoryMessageStore, MessageStore, SqliteMessageStore};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: confab_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Websocket bind address (default: from config, 127.0.0.1:8200)\n\
\t--config   Config file path (default: ~/.confab/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,confab_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("confab_server");
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

	match bind.parse::<std::net::SocketAddr>() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		server_cfg.server.ws_bind = bind;
	}

	let Some(hmac_secret) = server_cfg.server.auth_hmac_secret.clone() else {
		anyhow::bail!("no auth_hmac_secret configured; set [server] auth_hmac_secret or CONFAB_AUTH_HMAC_SECRET");
	};

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store: Arc<dyn MessageStore> = match server_cfg.persistence.database_url.as_deref() {
		Some(url) => {
			info!(url, "opening sqlite message store");
			Arc::new(SqliteMessageStore::open(url).await?)
		}
		None => {
			warn!("no database_url configured; messages will not survive a restart");
			Arc::new(MemoryMessageStore::new())
		}
	};

	let registry = Arc::new(SubscriptionRegistry::new());
	let directory = Arc::new(OpenDirectory::new());
	let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone(), store.clone(), directory.clone()));
	let verifier = Arc::new(HmacTokenVerifier::new(hmac_secret));

	let http_bind = server_cfg
		.server
		.http_bind
		.parse::<std::net::SocketAddr>()
		.with_context(|| format!("invalid http bind address {:?}", server_cfg.server.http_bind))?;
	let api = Arc::new(HttpApi::new(
		MessageHistoryService::new(store.clone()),
		dispatcher.clone(),
		verifier.clone(),
	));
	spawn_http_api(http_bind, api);
	info!(%http_bind, "http api listening");

	let gateway = Arc::new(Gateway {
		registry,
		dispatcher,
		verifier,
		directory,
		settings: server_cfg.server.clone(),
	});

	let listener = tokio::net::TcpListener::bind(&server_cfg.server.ws_bind)
		.await
		.with_context(|| format!("bind websocket listener on {}", server_cfg.server.ws_bind))?;
	info!(bind = %server_cfg.server.ws_bind, "websocket gateway listening");

	health_state.mark_ready();

	run_gateway(listener, gateway).await
}
