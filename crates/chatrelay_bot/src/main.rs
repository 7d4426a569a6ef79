#![forbid(unsafe_code)]

mod config;
mod health;
mod supervisor;
mod transport;


use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chatrelay_core::{ClassifierConfig, EventClassifier, QueueConfig, RelayQueue};
use chatrelay_filter::{FilterConfig, WordFilter};
use chatrelay_platform::kick::SecondarySlot;
use chatrelay_platform::{SecretString, StaticTokenProvider, TokenProvider, TransportFactory, TransportSlot};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::BotConfig;
use crate::health::spawn_health_server;
use crate::supervisor::{ConnectionSupervisor, SecondaryRefresh, SupervisorConfig, SupervisorDeps, SupervisorHandle};
use crate::transport::DemoTransportFactory;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatrelay_bot [--config path]\n\
\n\
Options:\n\
\t--config  Config file path (default: ~/.chatrelay/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

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
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatrelay_bot=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
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

fn build_supervisor(cfg: &BotConfig) -> anyhow::Result<(ConnectionSupervisor, SupervisorHandle)> {
	let filter = WordFilter::new(FilterConfig {
		banned_words: cfg.filter.banned_words.clone(),
		block_words: cfg.filter.block_words.clone(),
		exceptions: cfg.filter.exceptions.clone(),
		strict: cfg.filter.strict,
	})?;

	let classifier = EventClassifier::new(
		ClassifierConfig {
			source_channel: cfg.relay.source_channel.clone(),
			memory_capacity: cfg.relay.memory_capacity,
			ban_notice_patterns: cfg.relay.ban_notice_patterns.clone(),
		},
		filter,
	)?;

	let supervisor_cfg = SupervisorConfig {
		backoff_floor: cfg.transport.backoff_floor,
		backoff_ceiling: cfg.transport.backoff_ceiling,
		backoff_multiplier: cfg.transport.backoff_multiplier,
		max_reconnect_attempts: cfg.transport.max_reconnect_attempts,
		health_check_interval: cfg.transport.health_check_interval,
		token_refresh_interval: cfg.transport.token_refresh_interval,
		..SupervisorConfig::default()
	};

	let (handle, command_rx) = SupervisorHandle::new(supervisor_cfg.command_channel_capacity);
	let transport_slot = TransportSlot::new();

	let secondary = cfg.kick.as_ref().map(|kick| {
		let token = kick.access_token.clone().unwrap_or_else(|| SecretString::new(String::new()));
		SecondaryRefresh {
			provider: Arc::new(StaticTokenProvider::new(token)),
			slot: SecondarySlot::new(),
			base_url: kick.base_url.clone(),
			broadcaster_user_id: kick.broadcaster_user_id,
		}
	});
	let secondary_slot = secondary.as_ref().map(|s| s.slot.clone());

	let queue = RelayQueue::new(
		QueueConfig {
			capacity: cfg.relay.queue_capacity,
			max_per_window: cfg.relay.per_minute_cap,
			min_interval: cfg.relay.min_interval,
			duplicate_window: cfg.relay.duplicate_window,
		},
		cfg.relay.destination_channels.clone(),
		transport_slot.clone(),
		secondary_slot,
		Arc::new(handle.clone()),
	);

	let token = cfg
		.transport
		.access_token
		.clone()
		.unwrap_or_else(|| SecretString::new(String::new()));
	let token_provider: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(token));
	let factory: Arc<dyn TransportFactory> = Arc::new(DemoTransportFactory::new(cfg.relay.source_channel.clone()));

	let deps = SupervisorDeps {
		factory,
		token_provider,
		secondary,
		transport_slot,
		classifier,
		queue,
	};

	let supervisor = ConnectionSupervisor::start(supervisor_cfg, deps, handle, command_rx);
	let handle = supervisor.handle();
	Ok((supervisor, handle))
}

enum Shutdown {
	Signal(&'static str),
	Finished(anyhow::Result<()>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let cfg = config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let (mut supervisor, handle) = build_supervisor(&cfg)?;

	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, Arc::new(handle.clone()));
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let destinations: Vec<String> = cfg.relay.destination_channels.iter().map(|c| c.to_string()).collect();
	info!(
		source = %cfg.relay.source_channel,
		?destinations,
		secondary = cfg.kick.is_some(),
		"relay starting"
	);

	let mut sigterm = signal(SignalKind::terminate())?;
	let outcome = tokio::select! {
		_ = tokio::signal::ctrl_c() => Shutdown::Signal("SIGINT"),
		_ = sigterm.recv() => Shutdown::Signal("SIGTERM"),
		result = supervisor.join() => Shutdown::Finished(result),
	};

	match outcome {
		Shutdown::Signal(sig) => {
			info!(signal = sig, "shutting down");
			supervisor.stop().await;
		}
		Shutdown::Finished(result) => {
			// the supervisor only finishes on its own when it went Fatal
			result?;
		}
	}

	info!("relay stopped");
	Ok(())
}
