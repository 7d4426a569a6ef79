#![forbid(unsafe_code)]

//! Connection supervisor: owns the transport lifecycle, the reconnect state
//! machine and the periodic maintenance timers.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use chatrelay_core::{ConnectionGate, EventClassifier, RelayQueue};
use chatrelay_platform::kick::{KickClient, SecondarySlot};
use chatrelay_platform::{ChatTransport, ReadyState, TokenLease, TokenProvider, TransportEvent, TransportFactory, TransportSlot};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection lifecycle states. Exactly one instance, owned by the
/// supervisor run loop; `Fatal` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Fatal,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Reconnecting => "reconnecting",
			ConnectionState::Fatal => "fatal",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub backoff_floor: Duration,
	pub backoff_ceiling: Duration,
	pub backoff_multiplier: f64,

	/// Consecutive connect failures before the supervisor goes `Fatal`.
	pub max_reconnect_attempts: u32,

	pub health_check_interval: Duration,
	pub token_refresh_interval: Duration,
	pub window_reset_interval: Duration,
	pub command_channel_capacity: usize,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			backoff_floor: Duration::from_secs(5),
			backoff_ceiling: Duration::from_secs(60),
			backoff_multiplier: 1.5,
			max_reconnect_attempts: 10,
			health_check_interval: Duration::from_secs(30),
			token_refresh_interval: Duration::from_secs(50 * 60),
			window_reset_interval: Duration::from_secs(60),
			command_channel_capacity: 64,
		}
	}
}

/// Commands consumed by the supervisor run loop.
#[derive(Debug)]
pub enum Command {
	Reconnect { reason: String },
	HealthTick,
	RefreshTick,
	Stop,
}

struct Shared {
	state: Mutex<ConnectionState>,
	reconnect_in_flight: AtomicBool,
	command_tx: mpsc::Sender<Command>,
}

/// Cloneable handle exposing the supervisor contract to the queue and the
/// health endpoint.
#[derive(Clone)]
pub struct SupervisorHandle {
	shared: Arc<Shared>,
}

impl SupervisorHandle {
	/// Build a handle plus the command receiver the run loop will consume.
	/// Split from `ConnectionSupervisor::start` so the outbound queue can
	/// hold the handle before the supervisor exists.
	pub fn new(command_channel_capacity: usize) -> (Self, mpsc::Receiver<Command>) {
		let (command_tx, command_rx) = mpsc::channel(command_channel_capacity);
		let shared = Arc::new(Shared {
			state: Mutex::new(ConnectionState::Disconnected),
			reconnect_in_flight: AtomicBool::new(false),
			command_tx,
		});
		(Self { shared }, command_rx)
	}

	pub fn state(&self) -> ConnectionState {
		*self.shared.state.lock()
	}

	pub fn is_sendable(&self) -> bool {
		self.state() == ConnectionState::Connected
	}

	/// Ask for a reconnect; triggers collapse while one is in flight.
	pub fn request_reconnect(&self, reason: &str) {
		if self.shared.reconnect_in_flight.load(Ordering::SeqCst) {
			return;
		}
		let _ = self.shared.command_tx.try_send(Command::Reconnect {
			reason: reason.to_string(),
		});
	}
}

impl ConnectionGate for SupervisorHandle {
	fn is_sendable(&self) -> bool {
		SupervisorHandle::is_sendable(self)
	}

	fn request_reconnect(&self) {
		SupervisorHandle::request_reconnect(self, "outbound send failure");
	}
}

/// External collaborators wired into the supervisor.
pub struct SupervisorDeps {
	pub factory: Arc<dyn TransportFactory>,
	pub token_provider: Arc<dyn TokenProvider>,
	pub secondary: Option<SecondaryRefresh>,
	pub transport_slot: TransportSlot,
	pub classifier: EventClassifier,
	pub queue: RelayQueue,
}

/// Secondary-platform credential refresh wiring. The client is replaced
/// only when the lease value actually changed.
pub struct SecondaryRefresh {
	pub provider: Arc<dyn TokenProvider>,
	pub slot: SecondarySlot,
	pub base_url: String,
	pub broadcaster_user_id: u64,
}

/// Owns the run loop and the named timer tasks. All timers are started in
/// `start` and cancelled in `stop`.
pub struct ConnectionSupervisor {
	handle: SupervisorHandle,
	run: Option<JoinHandle<anyhow::Result<()>>>,
	shutdown_tx: watch::Sender<bool>,
	timers: Vec<JoinHandle<()>>,
}

impl ConnectionSupervisor {
	pub fn start(
		cfg: SupervisorConfig,
		deps: SupervisorDeps,
		handle: SupervisorHandle,
		command_rx: mpsc::Receiver<Command>,
	) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let mut timers = Vec::with_capacity(3);
		{
			let tx = handle.shared.command_tx.clone();
			timers.push(spawn_named_interval(
				"health-check",
				cfg.health_check_interval,
				shutdown_rx.clone(),
				move || {
					let _ = tx.try_send(Command::HealthTick);
				},
			));
		}
		{
			let tx = handle.shared.command_tx.clone();
			timers.push(spawn_named_interval(
				"credential-refresh",
				cfg.token_refresh_interval,
				shutdown_rx.clone(),
				move || {
					let _ = tx.try_send(Command::RefreshTick);
				},
			));
		}
		{
			let queue = deps.queue.clone();
			timers.push(spawn_named_interval(
				"rate-window-reset",
				cfg.window_reset_interval,
				shutdown_rx,
				move || {
					queue.reset_window();
				},
			));
		}

		let run = tokio::spawn(run_loop(RunContext {
			cfg,
			shared: Arc::clone(&handle.shared),
			deps,
			command_rx,
		}));

		Self {
			handle,
			run: Some(run),
			shutdown_tx,
			timers,
		}
	}

	pub fn handle(&self) -> SupervisorHandle {
		self.handle.clone()
	}

	/// Wait for the run loop to finish. `Err` means the supervisor went
	/// `Fatal` and the process must terminate. Cancellation-safe: dropping
	/// the future leaves the run loop owned for a later `stop`.
	pub async fn join(&mut self) -> anyhow::Result<()> {
		let Some(run) = self.run.as_mut() else {
			return Ok(());
		};
		let result = match run.await {
			Ok(result) => result,
			Err(e) => Err(anyhow!("supervisor run task failed: {e}")),
		};
		self.run = None;
		result
	}

	/// Stop the run loop and cancel every timer.
	pub async fn stop(&mut self) {
		let _ = self.shutdown_tx.send(true);
		let _ = self.handle.shared.command_tx.send(Command::Stop).await;

		for timer in self.timers.drain(..) {
			let _ = timer.await;
		}
		if let Some(run) = self.run.take() {
			let _ = run.await;
		}
	}
}

/// Multiply the backoff delay, capped at the ceiling.
pub(crate) fn next_backoff(current: Duration, multiplier: f64, ceiling: Duration) -> Duration {
	let next_ms = (current.as_millis() as f64 * multiplier) as u64;
	Duration::from_millis(next_ms).min(ceiling)
}

fn spawn_named_interval(
	name: &'static str,
	period: Duration,
	mut shutdown_rx: watch::Receiver<bool>,
	tick: impl Fn() + Send + 'static,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		// the first tick completes immediately
		interval.tick().await;

		loop {
			tokio::select! {
				_ = interval.tick() => tick(),
				_ = shutdown_rx.changed() => {
					debug!(task = name, "timer cancelled");
					break;
				}
			}
		}
	})
}

struct RunContext {
	cfg: SupervisorConfig,
	shared: Arc<Shared>,
	deps: SupervisorDeps,
	command_rx: mpsc::Receiver<Command>,
}

fn set_state(shared: &Shared, state: ConnectionState) {
	*shared.state.lock() = state;
	metrics::gauge!("chatrelay_connection_state").set(state_metric(state));
	debug!(state = state.as_str(), "connection state changed");
}

fn state_metric(state: ConnectionState) -> f64 {
	match state {
		ConnectionState::Disconnected => 0.0,
		ConnectionState::Connecting => 1.0,
		ConnectionState::Connected => 2.0,
		ConnectionState::Reconnecting => 3.0,
		ConnectionState::Fatal => 4.0,
	}
}

/// Returns `false` when a `Stop` command arrived during the wait. Other
/// commands are discarded: a reconnect is already in progress.
async fn sleep_or_stop(command_rx: &mut mpsc::Receiver<Command>, delay: Duration) -> bool {
	let sleep = tokio::time::sleep(delay);
	tokio::pin!(sleep);

	loop {
		tokio::select! {
			_ = &mut sleep => return true,
			cmd = command_rx.recv() => match cmd {
				None | Some(Command::Stop) => return false,
				Some(_) => {}
			}
		}
	}
}

/// Discard commands that accumulated while connecting so stale triggers do
/// not immediately tear down a fresh connection. Returns `true` when a
/// `Stop` was among them.
fn drain_pending_commands(command_rx: &mut mpsc::Receiver<Command>) -> bool {
	loop {
		match command_rx.try_recv() {
			Ok(Command::Stop) => return true,
			Ok(_) => {}
			Err(_) => return false,
		}
	}
}

async fn teardown(deps: &SupervisorDeps, transport: &dyn ChatTransport) {
	deps.transport_slot.clear().await;
	transport.disconnect().await;
}

async fn refresh_secondary(deps: &SupervisorDeps, current: &mut Option<TokenLease>) {
	let Some(secondary) = &deps.secondary else {
		return;
	};

	match secondary.provider.get_valid_token().await {
		Ok(Some(fresh)) => {
			let changed = current.as_ref().map(|c| !c.same_token(&fresh)).unwrap_or(true);
			if changed {
				let client = KickClient::new(
					&secondary.base_url,
					fresh.access_token.expose(),
					secondary.broadcaster_user_id,
				);
				secondary.slot.set(client).await;
				info!("secondary platform client refreshed");
			}
			*current = Some(fresh);
		}
		Ok(None) => warn!("no secondary platform lease available"),
		Err(e) => warn!(error = %e, "secondary platform credential lookup failed"),
	}
}

async fn run_loop(mut ctx: RunContext) -> anyhow::Result<()> {
	let mut attempts: u32 = 0;
	let mut delay = ctx.cfg.backoff_floor;
	let mut lease: Option<TokenLease> = None;
	let mut secondary_lease: Option<TokenLease> = None;

	refresh_secondary(&ctx.deps, &mut secondary_lease).await;

	loop {
		// === connect phase ===
		if attempts >= ctx.cfg.max_reconnect_attempts {
			set_state(&ctx.shared, ConnectionState::Fatal);
			error!(attempts, "reconnect attempts exhausted; giving up");
			return Err(anyhow!("reconnect attempts exhausted after {attempts} attempts"));
		}

		if attempts > 0 {
			info!(
				attempt = attempts + 1,
				max = ctx.cfg.max_reconnect_attempts,
				delay_ms = delay.as_millis() as u64,
				"waiting before reconnect attempt"
			);
			if !sleep_or_stop(&mut ctx.command_rx, delay).await {
				set_state(&ctx.shared, ConnectionState::Disconnected);
				return Ok(());
			}
			delay = next_backoff(delay, ctx.cfg.backoff_multiplier, ctx.cfg.backoff_ceiling);
		}

		set_state(&ctx.shared, ConnectionState::Connecting);
		attempts = attempts.saturating_add(1);

		let current_lease = match lease.clone() {
			Some(l) => l,
			None => match ctx.deps.token_provider.get_valid_token().await {
				Ok(Some(l)) => {
					lease = Some(l.clone());
					l
				}
				Ok(None) => {
					warn!("no valid credential lease available; retrying");
					set_state(&ctx.shared, ConnectionState::Reconnecting);
					continue;
				}
				Err(e) => {
					warn!(error = %e, "credential lookup failed; retrying");
					set_state(&ctx.shared, ConnectionState::Reconnecting);
					continue;
				}
			},
		};

		let (transport, mut events_rx) = match ctx.deps.factory.connect(&current_lease).await {
			Ok(pair) => pair,
			Err(e) => {
				metrics::counter!("chatrelay_connect_failures_total").increment(1);
				warn!(error = %e, attempt = attempts, "transport connect failed");
				set_state(&ctx.shared, ConnectionState::Reconnecting);
				continue;
			}
		};

		ctx.deps.transport_slot.set(Arc::clone(&transport)).await;
		set_state(&ctx.shared, ConnectionState::Connected);
		ctx.shared.reconnect_in_flight.store(false, Ordering::SeqCst);
		attempts = 0;
		delay = ctx.cfg.backoff_floor;
		metrics::counter!("chatrelay_connected_total").increment(1);
		info!("transport connected");

		if drain_pending_commands(&mut ctx.command_rx) {
			teardown(&ctx.deps, transport.as_ref()).await;
			set_state(&ctx.shared, ConnectionState::Disconnected);
			return Ok(());
		}

		ctx.deps.queue.notify_sendable();

		// === event phase ===
		let reason = loop {
			tokio::select! {
				cmd = ctx.command_rx.recv() => {
					let Some(cmd) = cmd else {
						// every handle dropped; nothing can drive us anymore
						teardown(&ctx.deps, transport.as_ref()).await;
						set_state(&ctx.shared, ConnectionState::Disconnected);
						return Ok(());
					};

					match cmd {
						Command::Stop => {
							teardown(&ctx.deps, transport.as_ref()).await;
							set_state(&ctx.shared, ConnectionState::Disconnected);
							info!("supervisor stopped");
							return Ok(());
						}
						Command::Reconnect { reason } => break reason,
						Command::HealthTick => {
							if transport.ready_state() != ReadyState::Open
								&& !ctx.shared.reconnect_in_flight.load(Ordering::SeqCst)
							{
								break "health check found transport closed".to_string();
							}
						}
						Command::RefreshTick => {
							refresh_secondary(&ctx.deps, &mut secondary_lease).await;

							if let Some(current) = &lease
								&& !ctx.deps.token_provider.validate(current).await
							{
								info!("credential lease no longer valid; refreshing and reconnecting");
								lease = None;
								break "credential lease refreshed".to_string();
							}
						}
					}
				}

				ev = events_rx.recv() => {
					let Some(ev) = ev else {
						break "transport event stream ended".to_string();
					};

					match ev {
						TransportEvent::Connected => debug!("transport reported connected"),
						TransportEvent::Disconnected { reason } => break format!("transport disconnected: {reason}"),
						TransportEvent::Error { detail } => break format!("transport error: {detail}"),
						TransportEvent::Chat(event) => {
							if let Some(intent) = ctx.deps.classifier.classify(&event) {
								ctx.deps.queue.enqueue(intent);
							}
						}
					}
				}
			}
		};

		// === reconnect phase ===
		ctx.shared.reconnect_in_flight.store(true, Ordering::SeqCst);
		set_state(&ctx.shared, ConnectionState::Reconnecting);
		metrics::counter!("chatrelay_reconnects_total").increment(1);
		warn!(%reason, "tearing down transport for reconnect");
		teardown(&ctx.deps, transport.as_ref()).await;

		if drain_pending_commands(&mut ctx.command_rx) {
			set_state(&ctx.shared, ConnectionState::Disconnected);
			return Ok(());
		}
	}
}
