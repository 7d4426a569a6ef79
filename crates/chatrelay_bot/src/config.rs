#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatrelay_core::classifier::default_ban_notice_patterns;
use chatrelay_domain::ChannelName;
use chatrelay_platform::SecretString;
use chatrelay_platform::kick::DEFAULT_KICK_BASE_URL;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chatrelay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatrelay").join("config.toml"))
}

/// Load the bot config from TOML and env overrides. Malformed configuration
/// is fatal at startup.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BotConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg)?;
	cfg.validate()?;

	Ok(cfg)
}

/// Bot configuration (v1).
#[derive(Debug, Clone)]
pub struct BotConfig {
	pub relay: RelaySettings,
	pub filter: FilterSettings,
	pub transport: TransportSettings,
	pub kick: Option<KickSettings>,
	pub server: ServerSettings,
}

/// Relay routing and queue tuning.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	/// Channel whose events are relayed.
	pub source_channel: ChannelName,
	/// Primary destination channels, in fan-out order.
	pub destination_channels: Vec<ChannelName>,
	/// Successful sends allowed per rate window.
	pub per_minute_cap: u32,
	/// Pause between consecutive sends.
	pub min_interval: Duration,
	/// Identical text within this window is silently suppressed.
	pub duplicate_window: Duration,
	/// Per-user message memory capacity.
	pub memory_capacity: usize,
	/// Outbound queue bound.
	pub queue_capacity: usize,
	/// Patterns recognizing moderation-bot ban notices in plain chat.
	pub ban_notice_patterns: Vec<String>,
}

/// Word-filter lists and mode.
#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
	pub strict: bool,
	pub banned_words: Vec<String>,
	pub block_words: Vec<String>,
	pub exceptions: BTreeMap<String, Vec<String>>,
}

/// Transport credentials and reconnect tuning.
#[derive(Debug, Clone)]
pub struct TransportSettings {
	/// Primary platform access token for the static provider.
	pub access_token: Option<SecretString>,
	pub backoff_floor: Duration,
	pub backoff_ceiling: Duration,
	pub backoff_multiplier: f64,
	pub max_reconnect_attempts: u32,
	pub health_check_interval: Duration,
	pub token_refresh_interval: Duration,
}

/// Secondary-platform destination settings.
#[derive(Debug, Clone)]
pub struct KickSettings {
	pub base_url: String,
	pub access_token: Option<SecretString>,
	pub broadcaster_user_id: u64,
}

/// Process-level endpoints.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	relay: FileRelaySettings,

	#[serde(default)]
	filter: FileFilterSettings,

	#[serde(default)]
	transport: FileTransportSettings,

	kick: Option<FileKickSettings>,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	source_channel: Option<String>,
	destination_channels: Option<Vec<String>>,
	per_minute_cap: Option<u32>,
	min_interval_ms: Option<u64>,
	duplicate_window_secs: Option<u64>,
	memory_capacity: Option<usize>,
	queue_capacity: Option<usize>,
	ban_notice_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFilterSettings {
	strict: Option<bool>,
	#[serde(default)]
	banned_words: Vec<String>,
	#[serde(default)]
	block_words: Vec<String>,
	#[serde(default)]
	exceptions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTransportSettings {
	access_token: Option<String>,
	backoff_floor_ms: Option<u64>,
	backoff_ceiling_ms: Option<u64>,
	backoff_multiplier: Option<f64>,
	max_reconnect_attempts: Option<u32>,
	health_check_secs: Option<u64>,
	token_refresh_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKickSettings {
	base_url: Option<String>,
	access_token: Option<String>,
	broadcaster_user_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	health_bind: Option<String>,
	metrics_bind: Option<String>,
}

impl BotConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let source_channel = file
			.relay
			.source_channel
			.as_deref()
			.map(ChannelName::new)
			.transpose()
			.context("relay.source_channel")?
			.ok_or_else(|| anyhow!("relay.source_channel is required"))?;

		let destination_channels = file
			.relay
			.destination_channels
			.unwrap_or_default()
			.iter()
			.map(|s| ChannelName::new(s.as_str()))
			.collect::<Result<Vec<_>, _>>()
			.context("relay.destination_channels")?;

		let relay = RelaySettings {
			source_channel,
			destination_channels,
			per_minute_cap: file.relay.per_minute_cap.unwrap_or(20),
			min_interval: Duration::from_millis(file.relay.min_interval_ms.unwrap_or(1_000)),
			duplicate_window: Duration::from_secs(file.relay.duplicate_window_secs.unwrap_or(10)),
			memory_capacity: file.relay.memory_capacity.unwrap_or(200),
			queue_capacity: file.relay.queue_capacity.unwrap_or(1_024),
			ban_notice_patterns: file.relay.ban_notice_patterns.unwrap_or_else(default_ban_notice_patterns),
		};

		let filter = FilterSettings {
			strict: file.filter.strict.unwrap_or(false),
			banned_words: file.filter.banned_words,
			block_words: file.filter.block_words,
			exceptions: file.filter.exceptions,
		};

		let transport = TransportSettings {
			access_token: file
				.transport
				.access_token
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new),
			backoff_floor: Duration::from_millis(file.transport.backoff_floor_ms.unwrap_or(5_000)),
			backoff_ceiling: Duration::from_millis(file.transport.backoff_ceiling_ms.unwrap_or(60_000)),
			backoff_multiplier: file.transport.backoff_multiplier.unwrap_or(1.5),
			max_reconnect_attempts: file.transport.max_reconnect_attempts.unwrap_or(10),
			health_check_interval: Duration::from_secs(file.transport.health_check_secs.unwrap_or(30)),
			token_refresh_interval: Duration::from_secs(file.transport.token_refresh_secs.unwrap_or(50 * 60)),
		};

		let kick = match file.kick {
			Some(k) => {
				let broadcaster_user_id = k
					.broadcaster_user_id
					.ok_or_else(|| anyhow!("kick.broadcaster_user_id is required when [kick] is present"))?;
				Some(KickSettings {
					base_url: k
						.base_url
						.filter(|s| !s.trim().is_empty())
						.unwrap_or_else(|| DEFAULT_KICK_BASE_URL.to_string()),
					access_token: k.access_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
					broadcaster_user_id,
				})
			}
			None => None,
		};

		let server = ServerSettings {
			health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
		};

		Ok(Self {
			relay,
			filter,
			transport,
			kick,
			server,
		})
	}

	fn validate(&mut self) -> anyhow::Result<()> {
		if self.relay.destination_channels.is_empty() {
			return Err(anyhow!("relay.destination_channels must name at least one channel"));
		}
		if self
			.relay
			.destination_channels
			.iter()
			.any(|d| *d == self.relay.source_channel)
			&& self.relay.destination_channels.len() == 1
		{
			warn!("relay destination equals the source channel");
		}
		if self.relay.per_minute_cap == 0 {
			return Err(anyhow!("relay.per_minute_cap must be positive"));
		}
		if self.relay.memory_capacity == 0 {
			return Err(anyhow!("relay.memory_capacity must be positive"));
		}
		if self.relay.queue_capacity == 0 {
			return Err(anyhow!("relay.queue_capacity must be positive"));
		}
		if self.transport.access_token.is_none() {
			return Err(anyhow!(
				"transport.access_token is required (or set CHATRELAY_ACCESS_TOKEN)"
			));
		}
		if self.transport.max_reconnect_attempts == 0 {
			return Err(anyhow!("transport.max_reconnect_attempts must be positive"));
		}
		if self.transport.backoff_multiplier < 1.0 {
			return Err(anyhow!("transport.backoff_multiplier must be >= 1.0"));
		}
		if self.transport.backoff_floor > self.transport.backoff_ceiling {
			warn!(
				floor_ms = self.transport.backoff_floor.as_millis() as u64,
				ceiling_ms = self.transport.backoff_ceiling.as_millis() as u64,
				"transport.backoff_floor > backoff_ceiling; swapping"
			);
			std::mem::swap(&mut self.transport.backoff_floor, &mut self.transport.backoff_ceiling);
		}

		Ok(())
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut BotConfig) -> anyhow::Result<()> {
	if let Ok(v) = std::env::var("CHATRELAY_SOURCE_CHANNEL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.relay.source_channel = ChannelName::new(v).context("CHATRELAY_SOURCE_CHANNEL")?;
			info!("relay config: source_channel overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_DESTINATION_CHANNELS") {
		let channels = v
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(ChannelName::new)
			.collect::<Result<Vec<_>, _>>()
			.context("CHATRELAY_DESTINATION_CHANNELS")?;
		if !channels.is_empty() {
			cfg.relay.destination_channels = channels;
			info!("relay config: destination_channels overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_PER_MINUTE_CAP")
		&& let Ok(cap) = v.trim().parse::<u32>()
	{
		cfg.relay.per_minute_cap = cap;
		info!(cap, "relay config: per_minute_cap overridden by env");
	}

	if let Ok(v) = std::env::var("CHATRELAY_ACCESS_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.transport.access_token = Some(SecretString::new(v));
			info!("transport config: access_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_MAX_RECONNECT_ATTEMPTS")
		&& let Ok(max) = v.trim().parse::<u32>()
	{
		cfg.transport.max_reconnect_attempts = max;
		info!(max, "transport config: max_reconnect_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("CHATRELAY_KICK_ACCESS_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			if let Some(kick) = cfg.kick.as_mut() {
				kick.access_token = Some(SecretString::new(v));
				info!("kick config: access_token overridden by env");
			} else {
				warn!("CHATRELAY_KICK_ACCESS_TOKEN set but no [kick] section configured; ignoring");
			}
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	Ok(())
}
