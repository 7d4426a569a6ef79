#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chatrelay_domain::ChannelName;
use chatrelay_platform::TransportSlot;
use chatrelay_platform::ascii_fold::ascii_fold;
use chatrelay_platform::kick::SecondarySlot;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ConnectionGate;
use crate::classifier::RelayIntent;

/// Outbound queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
	/// Maximum queued messages; the oldest is evicted beyond this.
	pub capacity: usize,

	/// Successful sends allowed per rate window.
	pub max_per_window: u32,

	/// Pause between consecutive sends.
	pub min_interval: Duration,

	/// Re-sending identical text within this window is a silent no-op.
	pub duplicate_window: Duration,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			capacity: 1024,
			max_per_window: 20,
			min_interval: Duration::from_secs(1),
			duplicate_window: Duration::from_secs(10),
		}
	}
}

/// A queued relay message.
#[derive(Debug)]
struct OutboundMessage {
	text: String,
	origin_user: Option<String>,
	enqueued_at: Instant,
}

struct LastSend {
	text: String,
	at: Instant,
}

enum SendOutcome {
	Sent,
	/// Duplicate within the suppression window; consumed the queue slot
	/// without contacting any destination.
	Suppressed,
	Failed,
}

/// Rate-limited FIFO relay queue with duplicate suppression and
/// multi-destination fan-out.
///
/// A single drain loop runs at a time; re-entrant triggers are no-ops. On a
/// send failure the message goes back to the front of the queue, a reconnect
/// is requested, and draining stops until the next enqueue, window reset or
/// reconnect completion.
#[derive(Clone)]
pub struct RelayQueue {
	inner: Arc<Inner>,
}

struct Inner {
	cfg: QueueConfig,
	destinations: Vec<ChannelName>,
	transport: TransportSlot,
	secondary: Option<SecondarySlot>,
	gate: Arc<dyn ConnectionGate>,
	queue: Mutex<VecDeque<OutboundMessage>>,
	window_count: AtomicU32,
	last_sent: Mutex<Option<LastSend>>,
	drain_active: AtomicBool,
}

impl RelayQueue {
	pub fn new(
		cfg: QueueConfig,
		destinations: Vec<ChannelName>,
		transport: TransportSlot,
		secondary: Option<SecondarySlot>,
		gate: Arc<dyn ConnectionGate>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				cfg,
				destinations,
				transport,
				secondary,
				gate,
				queue: Mutex::new(VecDeque::new()),
				window_count: AtomicU32::new(0),
				last_sent: Mutex::new(None),
				drain_active: AtomicBool::new(false),
			}),
		}
	}

	/// Append a relay intent and trigger the drain loop.
	pub fn enqueue(&self, intent: RelayIntent) {
		{
			let mut queue = self.inner.queue.lock();
			if queue.len() >= self.inner.cfg.capacity {
				if let Some(dropped) = queue.pop_front() {
					metrics::counter!("chatrelay_queue_evicted_total").increment(1);
					warn!(text = %dropped.text, "relay queue full; evicting oldest message");
				}
			}
			queue.push_back(OutboundMessage {
				text: intent.text,
				origin_user: intent.origin_user,
				enqueued_at: Instant::now(),
			});
		}

		self.trigger_drain();
	}

	/// Reset the per-window send counter and resume draining. Driven by the
	/// supervisor's window-reset timer.
	pub fn reset_window(&self) {
		self.inner.window_count.store(0, Ordering::SeqCst);
		self.trigger_drain();
	}

	/// Resume draining after a reconnect completed.
	pub fn notify_sendable(&self) {
		self.trigger_drain();
	}

	pub fn len(&self) -> usize {
		self.inner.queue.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.queue.lock().is_empty()
	}

	/// True when no drain loop is currently running.
	pub fn is_idle(&self) -> bool {
		!self.inner.drain_active.load(Ordering::SeqCst)
	}

	fn trigger_drain(&self) {
		if self
			.inner
			.drain_active
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			let inner = Arc::clone(&self.inner);
			tokio::spawn(drain(inner));
		}
	}
}

async fn drain(inner: Arc<Inner>) {
	loop {
		while inner.window_count.load(Ordering::SeqCst) < inner.cfg.max_per_window {
			let Some(message) = inner.queue.lock().pop_front() else {
				break;
			};

			match attempt_send(&inner, &message).await {
				SendOutcome::Sent => {
					inner.window_count.fetch_add(1, Ordering::SeqCst);
					metrics::counter!("chatrelay_relayed_total").increment(1);
					tokio::time::sleep(inner.cfg.min_interval).await;
				}
				SendOutcome::Suppressed => {
					metrics::counter!("chatrelay_suppressed_total").increment(1);
				}
				SendOutcome::Failed => {
					metrics::counter!("chatrelay_send_failures_total").increment(1);
					inner.queue.lock().push_front(message);
					inner.drain_active.store(false, Ordering::SeqCst);
					inner.gate.request_reconnect();
					return;
				}
			}
		}

		inner.drain_active.store(false, Ordering::SeqCst);

		// Re-check for work enqueued between the loop condition and the flag
		// release; whoever wins the flag race continues.
		if inner.queue.lock().is_empty() || inner.window_count.load(Ordering::SeqCst) >= inner.cfg.max_per_window {
			return;
		}
		if inner
			.drain_active
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}
	}
}

async fn attempt_send(inner: &Inner, message: &OutboundMessage) -> SendOutcome {
	let composed = match &message.origin_user {
		Some(user) => format!("{user}: {}", message.text),
		None => message.text.clone(),
	};

	{
		let last = inner.last_sent.lock();
		if let Some(last) = last.as_ref()
			&& last.text == composed
			&& last.at.elapsed() < inner.cfg.duplicate_window
		{
			debug!(text = %composed, "suppressing duplicate relay");
			return SendOutcome::Suppressed;
		}
	}

	if !inner.gate.is_sendable() {
		warn!("connection not sendable; deferring relay until reconnect");
		return SendOutcome::Failed;
	}

	let Some(transport) = inner.transport.current().await else {
		warn!("no live transport; deferring relay until reconnect");
		return SendOutcome::Failed;
	};

	let primary = async {
		let sends = inner.destinations.iter().map(|dest| transport.send(dest, &composed));
		let results = futures::future::join_all(sends).await;

		let mut failed = false;
		for (dest, result) in inner.destinations.iter().zip(results) {
			if let Err(e) = result {
				warn!(destination = %dest, error = %e, "primary destination send failed");
				failed = true;
			}
		}
		failed
	};

	let secondary = async {
		let Some(slot) = &inner.secondary else {
			return;
		};
		let Some(client) = slot.current().await else {
			return;
		};

		// Secondary failures never fail the attempt and never requeue.
		let folded = ascii_fold(&composed);
		if let Err(e) = client.send_message(&folded).await {
			metrics::counter!("chatrelay_secondary_failures_total").increment(1);
			warn!(error = %e, "secondary platform send failed");
		}
	};

	let (primary_failed, ()) = tokio::join!(primary, secondary);
	if primary_failed {
		return SendOutcome::Failed;
	}

	let queued_for = message.enqueued_at.elapsed();
	debug!(text = %composed, queued_ms = queued_for.as_millis() as u64, "relayed message");

	*inner.last_sent.lock() = Some(LastSend {
		text: composed,
		at: Instant::now(),
	});
	SendOutcome::Sent
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicU32;

	use async_trait::async_trait;
	use chatrelay_platform::{ChatTransport, ReadyState};

	use super::*;

	struct RecordingTransport {
		sent: Mutex<Vec<(String, String)>>,
		/// Per-attempt outcomes, in order; attempts beyond the plan succeed.
		fail_plan: Mutex<VecDeque<bool>>,
		attempts: AtomicU32,
	}

	impl RecordingTransport {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				sent: Mutex::new(Vec::new()),
				fail_plan: Mutex::new(VecDeque::new()),
				attempts: AtomicU32::new(0),
			})
		}

		fn fail_attempts(&self, plan: &[bool]) {
			*self.fail_plan.lock() = plan.iter().copied().collect();
		}

		fn sent_texts(&self) -> Vec<String> {
			self.sent.lock().iter().map(|(_, text)| text.clone()).collect()
		}
	}

	#[async_trait]
	impl ChatTransport for RecordingTransport {
		async fn send(&self, destination: &ChannelName, text: &str) -> anyhow::Result<()> {
			self.attempts.fetch_add(1, Ordering::SeqCst);
			let fail = self.fail_plan.lock().pop_front().unwrap_or(false);
			if fail {
				anyhow::bail!("scripted send failure");
			}
			self.sent.lock().push((destination.to_string(), text.to_string()));
			Ok(())
		}

		fn ready_state(&self) -> ReadyState {
			ReadyState::Open
		}

		async fn disconnect(&self) {}
	}

	struct TestGate {
		sendable: AtomicBool,
		reconnect_requests: AtomicU32,
	}

	impl TestGate {
		fn new(sendable: bool) -> Arc<Self> {
			Arc::new(Self {
				sendable: AtomicBool::new(sendable),
				reconnect_requests: AtomicU32::new(0),
			})
		}
	}

	impl ConnectionGate for TestGate {
		fn is_sendable(&self) -> bool {
			self.sendable.load(Ordering::SeqCst)
		}

		fn request_reconnect(&self) {
			self.reconnect_requests.fetch_add(1, Ordering::SeqCst);
		}
	}

	struct Fixture {
		queue: RelayQueue,
		transport: Arc<RecordingTransport>,
		gate: Arc<TestGate>,
	}

	async fn fixture(cfg: QueueConfig) -> Fixture {
		let transport = RecordingTransport::new();
		let slot = TransportSlot::new();
		slot.set(transport.clone()).await;
		let gate = TestGate::new(true);

		let queue = RelayQueue::new(
			cfg,
			vec![ChannelName::new("dest").unwrap()],
			slot,
			None,
			gate.clone(),
		);

		Fixture { queue, transport, gate }
	}

	fn intent(text: &str) -> RelayIntent {
		RelayIntent {
			text: text.to_string(),
			origin_user: None,
		}
	}

	async fn settle(queue: &RelayQueue) {
		tokio::time::timeout(Duration::from_secs(600), async {
			loop {
				tokio::time::sleep(Duration::from_millis(20)).await;
				if queue.is_idle() {
					return;
				}
			}
		})
		.await
		.expect("queue did not settle");
	}

	#[tokio::test(start_paused = true)]
	async fn relays_in_fifo_order() {
		let f = fixture(QueueConfig::default()).await;

		f.queue.enqueue(intent("one"));
		f.queue.enqueue(intent("two"));
		f.queue.enqueue(intent("three"));
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["one", "two", "three"]);
		assert!(f.queue.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn origin_user_prefixes_the_text() {
		let f = fixture(QueueConfig::default()).await;

		f.queue.enqueue(RelayIntent {
			text: "hello".to_string(),
			origin_user: Some("system".to_string()),
		});
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["system: hello"]);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_send_retries_in_place_preserving_order() {
		let f = fixture(QueueConfig::default()).await;
		// "two" fails once, then succeeds on retry.
		f.transport.fail_attempts(&[false, true]);

		f.queue.enqueue(intent("one"));
		f.queue.enqueue(intent("two"));
		f.queue.enqueue(intent("three"));
		settle(&f.queue).await;

		assert_eq!(f.gate.reconnect_requests.load(Ordering::SeqCst), 1);
		assert_eq!(f.queue.len(), 2);

		// simulate the reconnect completing
		f.queue.notify_sendable();
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["one", "two", "three"]);
	}

	#[tokio::test(start_paused = true)]
	async fn window_cap_stops_the_drain_until_reset() {
		let f = fixture(QueueConfig {
			max_per_window: 2,
			..QueueConfig::default()
		})
		.await;

		f.queue.enqueue(intent("one"));
		f.queue.enqueue(intent("two"));
		f.queue.enqueue(intent("three"));
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["one", "two"]);
		assert_eq!(f.queue.len(), 1);

		f.queue.reset_window();
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["one", "two", "three"]);
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_within_window_is_suppressed_and_uncounted() {
		let f = fixture(QueueConfig {
			max_per_window: 2,
			..QueueConfig::default()
		})
		.await;

		f.queue.enqueue(intent("same"));
		f.queue.enqueue(intent("same"));
		f.queue.enqueue(intent("other"));
		settle(&f.queue).await;

		// The duplicate consumed its slot without a destination call and
		// without counting against the cap, so "other" still fit.
		assert_eq!(f.transport.sent_texts(), vec!["same", "other"]);
		assert!(f.queue.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn identical_text_after_the_window_sends_again() {
		let f = fixture(QueueConfig::default()).await;

		f.queue.enqueue(intent("same"));
		settle(&f.queue).await;

		tokio::time::sleep(Duration::from_secs(11)).await;

		f.queue.enqueue(intent("same"));
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["same", "same"]);
	}

	#[tokio::test(start_paused = true)]
	async fn unsendable_gate_defers_and_requests_reconnect() {
		let f = fixture(QueueConfig::default()).await;
		f.gate.sendable.store(false, Ordering::SeqCst);

		f.queue.enqueue(intent("held"));
		settle(&f.queue).await;

		assert!(f.transport.sent_texts().is_empty());
		assert_eq!(f.queue.len(), 1);
		assert_eq!(f.gate.reconnect_requests.load(Ordering::SeqCst), 1);

		f.gate.sendable.store(true, Ordering::SeqCst);
		f.queue.notify_sendable();
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["held"]);
	}

	#[tokio::test(start_paused = true)]
	async fn bounded_queue_evicts_oldest_when_full() {
		let f = fixture(QueueConfig {
			capacity: 2,
			..QueueConfig::default()
		})
		.await;
		f.gate.sendable.store(false, Ordering::SeqCst);

		f.queue.enqueue(intent("one"));
		settle(&f.queue).await;
		f.queue.enqueue(intent("two"));
		settle(&f.queue).await;
		f.queue.enqueue(intent("three"));
		settle(&f.queue).await;

		assert_eq!(f.queue.len(), 2);

		f.gate.sendable.store(true, Ordering::SeqCst);
		f.queue.notify_sendable();
		settle(&f.queue).await;

		assert_eq!(f.transport.sent_texts(), vec!["two", "three"]);
	}

	#[tokio::test(start_paused = true)]
	async fn sends_fan_out_to_every_destination() {
		let transport = RecordingTransport::new();
		let slot = TransportSlot::new();
		slot.set(transport.clone()).await;
		let gate = TestGate::new(true);

		let queue = RelayQueue::new(
			QueueConfig::default(),
			vec![ChannelName::new("alpha").unwrap(), ChannelName::new("beta").unwrap()],
			slot,
			None,
			gate,
		);

		queue.enqueue(intent("hi"));
		settle(&queue).await;

		let mut destinations: Vec<String> = transport.sent.lock().iter().map(|(dest, _)| dest.clone()).collect();
		destinations.sort();
		assert_eq!(destinations, vec!["alpha", "beta"]);
	}
}
