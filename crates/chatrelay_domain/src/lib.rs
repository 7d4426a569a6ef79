#![forbid(unsafe_code)]

use core::fmt;
use core::hash::{Hash, Hasher};
use core::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty value")]
	Empty,
	#[error("unknown event kind: {0}")]
	UnknownKind(String),
}

/// Chat channel name.
///
/// Stored without the leading `#`; comparisons are ASCII case-insensitive
/// because chat platforms treat `#Channel` and `#channel` as the same room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Create a non-empty `ChannelName`, stripping a leading `#`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseError> {
		let name = name.into();
		let name = name.trim().trim_start_matches('#');
		if name.is_empty() {
			return Err(ParseError::Empty);
		}
		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl PartialEq for ChannelName {
	fn eq(&self, other: &Self) -> bool {
		self.0.eq_ignore_ascii_case(&other.0)
	}
}

impl Eq for ChannelName {}

impl Hash for ChannelName {
	fn hash<H: Hasher>(&self, state: &mut H) {
		for b in self.0.bytes() {
			state.write_u8(b.to_ascii_lowercase());
		}
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

/// The four transport event kinds the relay consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventKind {
	Message,
	Ban,
	Timeout,
	Delete,
}

impl ChatEventKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ChatEventKind::Message => "message",
			ChatEventKind::Ban => "ban",
			ChatEventKind::Timeout => "timeout",
			ChatEventKind::Delete => "delete",
		}
	}
}

impl fmt::Display for ChatEventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ChatEventKind {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"message" => Ok(ChatEventKind::Message),
			"ban" => Ok(ChatEventKind::Ban),
			"timeout" => Ok(ChatEventKind::Timeout),
			"delete" | "message_delete" => Ok(ChatEventKind::Delete),
			other => Err(ParseError::UnknownKind(other.to_string())),
		}
	}
}

/// Normalized chat event as delivered by the transport.
///
/// Produced by the transport layer, consumed exactly once by the classifier,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
	pub kind: ChatEventKind,

	pub channel: ChannelName,

	/// The user the event is about: the sender for `Message`, the moderated
	/// user for `Ban`/`Timeout`, empty for `Delete` when unknown.
	pub actor: String,

	/// Message text for `Message` and `Delete` events.
	pub text: Option<String>,

	/// Timeout duration for `Timeout` events.
	pub duration_seconds: Option<u64>,

	pub timestamp: SystemTime,
}

impl ChatEvent {
	fn new(kind: ChatEventKind, channel: ChannelName, actor: impl Into<String>) -> Self {
		Self {
			kind,
			channel,
			actor: actor.into(),
			text: None,
			duration_seconds: None,
			timestamp: SystemTime::now(),
		}
	}

	pub fn message(channel: ChannelName, sender: impl Into<String>, text: impl Into<String>) -> Self {
		let mut ev = Self::new(ChatEventKind::Message, channel, sender);
		ev.text = Some(text.into());
		ev
	}

	pub fn ban(channel: ChannelName, user: impl Into<String>) -> Self {
		Self::new(ChatEventKind::Ban, channel, user)
	}

	pub fn timeout(channel: ChannelName, user: impl Into<String>, duration_seconds: u64) -> Self {
		let mut ev = Self::new(ChatEventKind::Timeout, channel, user);
		ev.duration_seconds = Some(duration_seconds);
		ev
	}

	pub fn delete(channel: ChannelName, text: impl Into<String>) -> Self {
		let mut ev = Self::new(ChatEventKind::Delete, channel, String::new());
		ev.text = Some(text.into());
		ev
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_name_strips_hash_and_compares_case_insensitively() {
		let a = ChannelName::new("#SomeChannel").unwrap();
		let b = ChannelName::new("somechannel").unwrap();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "SomeChannel");
		assert_eq!(a.to_string(), "SomeChannel");
	}

	#[test]
	fn channel_name_hash_agrees_with_eq() {
		use std::collections::HashSet;

		let mut set = HashSet::new();
		set.insert(ChannelName::new("Mixed").unwrap());
		assert!(set.contains(&ChannelName::new("mixed").unwrap()));
		assert!(set.contains(&ChannelName::new("#MIXED").unwrap()));
	}

	#[test]
	fn rejects_empty_channel_names() {
		assert!(ChannelName::new("").is_err());
		assert!(ChannelName::new("   ").is_err());
		assert!(ChannelName::new("#").is_err());
	}

	#[test]
	fn event_kind_parse_and_display() {
		assert_eq!("ban".parse::<ChatEventKind>().unwrap(), ChatEventKind::Ban);
		assert_eq!("Message".parse::<ChatEventKind>().unwrap(), ChatEventKind::Message);
		assert_eq!("message_delete".parse::<ChatEventKind>().unwrap(), ChatEventKind::Delete);
		assert!("raid".parse::<ChatEventKind>().is_err());
		assert_eq!(ChatEventKind::Timeout.to_string(), "timeout");
	}

	#[test]
	fn event_constructors_fill_kind_specific_fields() {
		let ch = ChannelName::new("main").unwrap();

		let msg = ChatEvent::message(ch.clone(), "alice", "hello");
		assert_eq!(msg.kind, ChatEventKind::Message);
		assert_eq!(msg.text.as_deref(), Some("hello"));

		let to = ChatEvent::timeout(ch.clone(), "bob", 600);
		assert_eq!(to.duration_seconds, Some(600));
		assert!(to.text.is_none());

		let del = ChatEvent::delete(ch, "gone");
		assert!(del.actor.is_empty());
		assert_eq!(del.text.as_deref(), Some("gone"));
	}
}
