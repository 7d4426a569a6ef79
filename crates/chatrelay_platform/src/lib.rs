#![forbid(unsafe_code)]

pub mod ascii_fold;
pub mod kick;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chatrelay_domain::{ChannelName, ChatEvent};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Credential lease obtained from the external token provider.
///
/// Treated as a capability that must be periodically re-validated; never
/// persisted by this crate.
#[derive(Debug, Clone)]
pub struct TokenLease {
	pub access_token: SecretString,
	pub expires_at: SystemTime,
}

impl TokenLease {
	pub fn new(access_token: SecretString, expires_at: SystemTime) -> Self {
		Self { access_token, expires_at }
	}

	/// True when the lease expires within `buffer` from now.
	pub fn expires_within(&self, buffer: Duration) -> bool {
		match SystemTime::now().checked_add(buffer) {
			Some(deadline) => deadline >= self.expires_at,
			None => true,
		}
	}

	/// Whether two leases carry the same token value.
	pub fn same_token(&self, other: &TokenLease) -> bool {
		self.access_token.expose() == other.access_token.expose()
	}
}

/// External credential collaborator.
#[async_trait]
pub trait TokenProvider: Send + Sync {
	/// Return a currently valid lease, refreshing stored credentials when
	/// possible. `None` means no lease can be produced without an
	/// interactive authorization flow.
	async fn get_valid_token(&self) -> anyhow::Result<Option<TokenLease>>;

	/// Check a lease against the issuing service.
	async fn validate(&self, lease: &TokenLease) -> bool;
}

/// Provider for deployments that manage tokens outside the process: hands
/// out the configured token with a far-future expiry.
pub struct StaticTokenProvider {
	token: SecretString,
}

impl StaticTokenProvider {
	pub fn new(token: SecretString) -> Self {
		Self { token }
	}
}

const STATIC_LEASE_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
	async fn get_valid_token(&self) -> anyhow::Result<Option<TokenLease>> {
		if self.token.expose().trim().is_empty() {
			return Ok(None);
		}

		let expires_at = SystemTime::now()
			.checked_add(STATIC_LEASE_LIFETIME)
			.unwrap_or(SystemTime::UNIX_EPOCH);
		Ok(Some(TokenLease::new(self.token.clone(), expires_at)))
	}

	async fn validate(&self, lease: &TokenLease) -> bool {
		!lease.access_token.expose().trim().is_empty()
	}
}

/// Transport socket state as reported by the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
	Open,
	Closed,
}

/// Transport → supervisor event.
#[derive(Debug, Clone)]
pub enum TransportEvent {
	/// The connection is established and subscribed.
	Connected,

	/// The connection dropped.
	Disconnected { reason: String },

	/// A transport-level error occurred.
	Error { detail: String },

	/// A normalized chat event from the source platform.
	Chat(ChatEvent),
}

pub type TransportEventTx = mpsc::Sender<TransportEvent>;
pub type TransportEventRx = mpsc::Receiver<TransportEvent>;

/// A live connection to the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
	/// Deliver `text` to `destination` on the primary platform.
	async fn send(&self, destination: &ChannelName, text: &str) -> anyhow::Result<()>;

	fn ready_state(&self) -> ReadyState;

	async fn disconnect(&self);
}

/// Builds transports from a credential lease. The excluded wire protocol
/// lives behind this boundary.
#[async_trait]
pub trait TransportFactory: Send + Sync {
	/// Establish a connection and return it with its event stream. Resolves
	/// only once the connection is usable for sending.
	async fn connect(&self, lease: &TokenLease) -> anyhow::Result<(Arc<dyn ChatTransport>, TransportEventRx)>;
}

/// Shared slot holding the live transport; the supervisor swaps it on
/// reconnect, the outbound queue reads it per send attempt.
#[derive(Clone, Default)]
pub struct TransportSlot {
	inner: Arc<RwLock<Option<Arc<dyn ChatTransport>>>>,
}

impl TransportSlot {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn set(&self, transport: Arc<dyn ChatTransport>) {
		*self.inner.write().await = Some(transport);
	}

	pub async fn clear(&self) {
		*self.inner.write().await = None;
	}

	pub async fn current(&self) -> Option<Arc<dyn ChatTransport>> {
		self.inner.read().await.clone()
	}
}

/// Build a standard bounded transport event channel.
pub fn bounded_event_channel(capacity: usize) -> (TransportEventTx, TransportEventRx) {
	mpsc::channel(capacity)
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_redacts_in_debug_and_display() {
		let s = SecretString::new("very-secret");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "very-secret");
	}

	#[test]
	fn lease_token_comparison() {
		let now = SystemTime::now();
		let a = TokenLease::new(SecretString::new("tok"), now);
		let b = TokenLease::new(SecretString::new("tok"), now + Duration::from_secs(60));
		let c = TokenLease::new(SecretString::new("other"), now);

		assert!(a.same_token(&b));
		assert!(!a.same_token(&c));
	}

	#[test]
	fn lease_expiry_buffer() {
		let lease = TokenLease::new(SecretString::new("tok"), SystemTime::now() + Duration::from_secs(30));
		assert!(lease.expires_within(Duration::from_secs(60)));
		assert!(!lease.expires_within(Duration::from_secs(1)));
	}

	#[tokio::test]
	async fn static_provider_requires_a_nonempty_token() {
		let empty = StaticTokenProvider::new(SecretString::new("  "));
		assert!(empty.get_valid_token().await.unwrap().is_none());

		let provider = StaticTokenProvider::new(SecretString::new("tok"));
		let lease = provider.get_valid_token().await.unwrap().expect("lease");
		assert!(provider.validate(&lease).await);
		assert!(!lease.expires_within(Duration::from_secs(60)));
	}
}
