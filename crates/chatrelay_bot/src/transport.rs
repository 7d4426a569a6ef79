#![forbid(unsafe_code)]

//! Demo transport used for local end-to-end runs. The real wire protocol
//! lives behind [`TransportFactory`] implementations provided by the
//! deployment.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_domain::{ChannelName, ChatEvent};
use chatrelay_platform::{
	ChatTransport, ReadyState, TokenLease, TransportEvent, TransportEventRx, TransportFactory, bounded_event_channel,
	new_session_id,
};
use tracing::{debug, info};

/// Factory that synthesizes source-channel chat traffic and logs outbound
/// sends instead of contacting a platform.
pub struct DemoTransportFactory {
	source_channel: ChannelName,
	emit_interval: Duration,
}

impl DemoTransportFactory {
	pub fn new(source_channel: ChannelName) -> Self {
		Self {
			source_channel,
			emit_interval: Duration::from_secs(5),
		}
	}
}

struct DemoTransport {
	open: AtomicBool,
	session_id: String,
}

#[async_trait]
impl ChatTransport for DemoTransport {
	async fn send(&self, destination: &ChannelName, text: &str) -> anyhow::Result<()> {
		if !self.open.load(Ordering::SeqCst) {
			anyhow::bail!("demo transport is closed");
		}
		info!(destination = %destination, %text, "demo transport send");
		Ok(())
	}

	fn ready_state(&self) -> ReadyState {
		if self.open.load(Ordering::SeqCst) {
			ReadyState::Open
		} else {
			ReadyState::Closed
		}
	}

	async fn disconnect(&self) {
		self.open.store(false, Ordering::SeqCst);
		debug!(session_id = %self.session_id, "demo transport disconnected");
	}
}

#[async_trait]
impl TransportFactory for DemoTransportFactory {
	async fn connect(&self, _lease: &TokenLease) -> anyhow::Result<(Arc<dyn ChatTransport>, TransportEventRx)> {
		let session_id = new_session_id();
		let (events_tx, events_rx) = bounded_event_channel(256);

		let transport = Arc::new(DemoTransport {
			open: AtomicBool::new(true),
			session_id: session_id.clone(),
		});

		let _ = events_tx.try_send(TransportEvent::Connected);
		info!(%session_id, "demo transport connected");

		let emitter = Arc::clone(&transport);
		let channel = self.source_channel.clone();
		let emit_interval = self.emit_interval;
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(emit_interval);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			interval.tick().await;

			let mut tick: u64 = 0;
			loop {
				interval.tick().await;
				if !emitter.open.load(Ordering::SeqCst) {
					break;
				}

				tick += 1;
				let event = match tick % 4 {
					1 | 2 => ChatEvent::message(channel.clone(), "demo_user", format!("demo chat message #{tick}")),
					3 => ChatEvent::timeout(channel.clone(), "demo_user", 600),
					_ => ChatEvent::ban(channel.clone(), "demo_user"),
				};

				if events_tx.send(TransportEvent::Chat(event)).await.is_err() {
					break;
				}
			}
			debug!(%session_id, "demo event emitter stopped");
		});

		Ok((transport, events_rx))
	}
}
