#![forbid(unsafe_code)]

use confab_client_core::{SessionConfig, SessionNotice, SessionState, spawn};
use confab_domain::ChannelId;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: confab_client --token <token> [--connect ws://host:port] [--channel name]...\n\
\n\
Options:\n\
	--token     Access token for the handshake (required)\n\
	--connect   Server endpoint (default: ws://127.0.0.1:8200)\n\
	--channel   Channel to join (repeatable; default: general)\n\
	--help      Show this help\n\
\n\
Examples:\n\
	confab_client --token $TOKEN --channel general\n\
	confab_client --token $TOKEN --connect ws://confab.example.com:8200 --channel dev --channel random\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,confab_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	url: String,
	token: String,
	channels: Vec<String>,
}

fn parse_args() -> Args {
	let mut url = "ws://127.0.0.1:8200".to_string();
	let mut token: Option<String> = None;
	let mut channels: Vec<String> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				url = v;
			}
			"--token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--token must be non-empty");
					usage_and_exit();
				}
				token = Some(v);
			}
			"--channel" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--channel must be non-empty");
					usage_and_exit();
				}
				channels.push(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(token) = token else {
		eprintln!("--token is required");
		usage_and_exit();
	};

	if channels.is_empty() {
		channels.push(ChannelId::FALLBACK_NAME.to_string());
	}

	Args { url, token, channels }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let (handle, mut notices) = spawn(SessionConfig::new(args.url, args.token));

	for name in &args.channels {
		let channel_id = name.parse::<ChannelId>().map_err(|e| anyhow::anyhow!("invalid channel {name:?}: {e}"))?;
		handle.join(channel_id).await?;
	}

	while let Some(notice) = notices.recv().await {
		match notice {
			SessionNotice::StateChanged(SessionState::Ready) => info!("session ready"),
			SessionNotice::StateChanged(SessionState::Reconnecting { attempt }) => {
				warn!(attempt, "reconnecting");
			}
			SessionNotice::StateChanged(SessionState::Failed { reason }) => {
				warn!(%reason, "session failed");
				break;
			}
			SessionNotice::StateChanged(SessionState::Closed) => break,
			SessionNotice::StateChanged(state) => info!(?state, "session state"),
			SessionNotice::Welcome { subject_id, .. } => info!(subject = %subject_id, "authenticated"),
			SessionNotice::Message(message) => {
				println!(
					"[{}] {}: {}",
					message.channel_id, message.author_display_name, message.body
				);
			}
			SessionNotice::ServerError { code, reason } => warn!(%code, %reason, "server error"),
		}
	}

	Ok(())
}
