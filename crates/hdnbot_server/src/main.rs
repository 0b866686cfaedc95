#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use hdnbot_domain::TokenKind;
use hdnbot_platform::twitch::{HelixClient, TwitchOAuth};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hdnbot_server::context::{BotContext, Platform};
use hdnbot_server::tokens::TokenManager;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: hdnbot [--config path] [--authorize-chat code | --authorize-broadcaster code]\n\
\n\
Options:\n\
\t--config                 Config file (default: ~/.hdnbot/config.toml, or $HDNBOT_CONFIG)\n\
\t--authorize-chat         Exchange an OAuth code for the bot account token and exit\n\
\t--authorize-broadcaster  Exchange an OAuth code for the channel owner token and exit\n\
\t--help                   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config_path: Option<PathBuf>,
	authorize: Option<(TokenKind, String)>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config_path: None,
		authorize: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			"--authorize-chat" | "--authorize-broadcaster" => {
				let kind = if arg == "--authorize-chat" {
					TokenKind::Chat
				} else {
					TokenKind::Broadcaster
				};
				let code = it.next().unwrap_or_else(|| usage_and_exit());
				if code.trim().is_empty() {
					eprintln!("{arg} needs the code from the OAuth redirect");
					usage_and_exit();
				}
				if args.authorize.is_some() {
					eprintln!("only one --authorize-* flag may be given");
					usage_and_exit();
				}
				args.authorize = Some((kind, code.trim().to_string()));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,hdnbot_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("hdnbot_server");
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

fn init_metrics(bind: Option<SocketAddr>) {
	let Some(addr) = bind else {
		return;
	};

	if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
	{
		warn!(error = %e, "failed to start metrics exporter");
	} else {
		info!(%addr, "metrics exporter listening");
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => match std::env::var(hdnbot_server::config::CONFIG_PATH_ENV) {
			Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
			_ => hdnbot_server::config::default_config_path()?,
		},
	};
	let cfg = hdnbot_server::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), channel = %cfg.twitch.channel, "loaded bot config (toml + env overrides)");

	init_metrics(cfg.metrics_bind);

	let store = hdnbot_server::store::connect(&cfg.database_url).await?;

	let oauth = TwitchOAuth::new(
		cfg.twitch.oauth_url.clone(),
		cfg.twitch.client_id.clone(),
		cfg.twitch.client_secret.clone(),
	)
	.context("build oauth client")?;
	let tokens = TokenManager::new(Arc::new(oauth), Arc::clone(&store), cfg.tokens.clone());

	let helix = Arc::new(
		HelixClient::new(cfg.twitch.helix_url.clone(), cfg.twitch.client_id.clone(), tokens.clone())
			.context("build helix client")?,
	);
	let platform = Platform {
		catalog: helix.clone(),
		users: helix.clone(),
		chat: helix,
		connector: hdnbot_server::bus::default_connector(),
	};
	let ctx = BotContext::new(&cfg, store, tokens, platform);

	if let Some((kind, code)) = args.authorize {
		let capability = ctx.authorize(kind, &code).await?;
		info!(%kind, ?capability, "token stored; restart without --authorize-* to run the bot");
		ctx.shutdown().await;
		return Ok(());
	}

	ctx.start().await?;
	info!("hdnbot running; press ctrl-c to stop");

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!(error = %e, "failed to listen for ctrl-c");
	}
	ctx.shutdown().await;
	Ok(())
}
