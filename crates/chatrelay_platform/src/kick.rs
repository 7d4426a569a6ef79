#![forbid(unsafe_code)]

//! Secondary-platform chat client (Kick public API shape).

use std::sync::Arc;

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use tokio::sync::RwLock;

pub const DEFAULT_KICK_BASE_URL: &str = "https://api.kick.com";

/// Minimal Kick chat client: bearer-token authenticated message posting.
#[derive(Debug, Clone)]
pub struct KickClient {
	base_url: String,
	access_token: String,
	broadcaster_user_id: u64,
	client: reqwest::Client,
}

impl KickClient {
	pub fn new(base_url: impl Into<String>, access_token: impl Into<String>, broadcaster_user_id: u64) -> Self {
		Self {
			base_url: base_url.into(),
			access_token: access_token.into(),
			broadcaster_user_id,
			client: reqwest::Client::new(),
		}
	}

	pub fn set_access_token(&mut self, token: impl Into<String>) {
		self.access_token = token.into();
	}

	fn auth_header(&self) -> anyhow::Result<String> {
		if self.access_token.trim().is_empty() {
			return Err(anyhow!("missing kick access token"));
		}
		Ok(format!("Bearer {}", self.access_token.trim()))
	}

	pub async fn send_message(&self, content: &str) -> anyhow::Result<()> {
		let url = format!("{}/public/v1/chat", self.base_url.trim_end_matches('/'));
		let body = KickPostChatRequest {
			broadcaster_user_id: self.broadcaster_user_id,
			content: content.to_string(),
			reply_to_message_id: None,
			type_field: "user".to_string(),
		};

		let resp = self
			.client
			.post(url)
			.header("Authorization", self.auth_header()?)
			.json(&body)
			.send()
			.await
			.context("kick send chat")?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => Ok(()),
			status => Err(anyhow!("kick send chat failed: status={}", status)),
		}
	}
}

/// Shared slot holding the secondary-platform client. The supervisor's
/// credential refresh replaces the client only when the lease changed; the
/// outbound queue reads it per fan-out.
#[derive(Clone, Default)]
pub struct SecondarySlot {
	inner: Arc<RwLock<Option<KickClient>>>,
}

impl SecondarySlot {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn set(&self, client: KickClient) {
		*self.inner.write().await = Some(client);
	}

	pub async fn current(&self) -> Option<KickClient> {
		self.inner.read().await.clone()
	}

	pub async fn has_client(&self) -> bool {
		self.inner.read().await.is_some()
	}
}

#[derive(Debug, serde::Serialize)]
struct KickPostChatRequest {
	broadcaster_user_id: u64,
	content: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	reply_to_message_id: Option<String>,
	#[serde(rename = "type")]
	type_field: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chat_request_serializes_with_kick_field_names() {
		let body = KickPostChatRequest {
			broadcaster_user_id: 42,
			content: "hello".to_string(),
			reply_to_message_id: None,
			type_field: "user".to_string(),
		};

		let json = serde_json::to_value(&body).unwrap();
		assert_eq!(json["broadcaster_user_id"], 42);
		assert_eq!(json["content"], "hello");
		assert_eq!(json["type"], "user");
		assert!(json.get("reply_to_message_id").is_none());
	}

	#[test]
	fn auth_header_requires_a_token() {
		let client = KickClient::new(DEFAULT_KICK_BASE_URL, "", 42);
		assert!(client.auth_header().is_err());

		let client = KickClient::new(DEFAULT_KICK_BASE_URL, " tok ", 42);
		assert_eq!(client.auth_header().unwrap(), "Bearer tok");
	}
}
