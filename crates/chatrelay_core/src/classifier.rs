#![forbid(unsafe_code)]

use chatrelay_domain::{ChannelName, ChatEvent, ChatEventKind};
use chatrelay_filter::WordFilter;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::memory::UserMemory;

/// Text substituted when the filter's block verdict suppresses a message.
pub const BLOCKED_PLACEHOLDER: &str = "[message withheld]";

/// Fallback when no message is remembered for a moderated user.
pub const NO_DATA: &str = "no data";

/// Origin attached to intents synthesized from ban-notice messages.
pub const SYSTEM_ORIGIN: &str = "system";

/// A composed, ready-to-send relay text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayIntent {
	pub text: String,
	pub origin_user: Option<String>,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
	#[error("invalid ban-notice pattern {pattern:?}: {source}")]
	InvalidBanNoticePattern {
		pattern: String,
		source: regex::Error,
	},
}

/// Classifier configuration.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
	pub source_channel: ChannelName,

	/// Capacity of the per-user message memory.
	pub memory_capacity: usize,

	/// Patterns that recognize third-party moderation bots announcing bans
	/// in plain chat.
	pub ban_notice_patterns: Vec<String>,
}

impl ClassifierConfig {
	pub fn new(source_channel: ChannelName) -> Self {
		Self {
			source_channel,
			memory_capacity: 200,
			ban_notice_patterns: default_ban_notice_patterns(),
		}
	}
}

/// Default ban-notice patterns, matched case-insensitively against message
/// text.
pub fn default_ban_notice_patterns() -> Vec<String> {
	[
		r"has been (permanently )?banned",
		r"permanently banned",
		r"banned by",
		r"\.ban\s+\w+",
		r"banned \w+",
	]
	.iter()
	.map(|s| s.to_string())
	.collect()
}

/// Turns transport events into relay intents, consulting the user memory and
/// the word filter.
pub struct EventClassifier {
	source_channel: ChannelName,
	memory: UserMemory,
	filter: WordFilter,
	ban_notice: Vec<Regex>,
}

impl EventClassifier {
	pub fn new(cfg: ClassifierConfig, filter: WordFilter) -> Result<Self, ClassifierError> {
		let mut ban_notice = Vec::with_capacity(cfg.ban_notice_patterns.len());
		for pattern in &cfg.ban_notice_patterns {
			let re = Regex::new(&format!("(?i){pattern}")).map_err(|source| ClassifierError::InvalidBanNoticePattern {
				pattern: pattern.clone(),
				source,
			})?;
			ban_notice.push(re);
		}

		Ok(Self {
			source_channel: cfg.source_channel,
			memory: UserMemory::new(cfg.memory_capacity),
			filter,
			ban_notice,
		})
	}

	/// Classify one transport event, returning the relay intent to enqueue,
	/// if any. Events from other channels are dropped.
	pub fn classify(&mut self, event: &ChatEvent) -> Option<RelayIntent> {
		if event.channel != self.source_channel {
			return None;
		}

		match event.kind {
			ChatEventKind::Message => self.on_message(event),
			ChatEventKind::Ban | ChatEventKind::Timeout => self.on_moderation(event),
			ChatEventKind::Delete => self.on_delete(event),
		}
	}

	/// Runtime access to the word lists.
	pub fn filter_mut(&mut self) -> &mut WordFilter {
		&mut self.filter
	}

	pub fn memory_len(&self) -> usize {
		self.memory.len()
	}

	fn on_message(&mut self, event: &ChatEvent) -> Option<RelayIntent> {
		let text = event.text.as_deref().unwrap_or("");
		if text.is_empty() || event.actor.trim().is_empty() {
			return None;
		}

		self.memory.put(&event.actor, text);

		if self.ban_notice.iter().any(|re| re.is_match(text)) {
			debug!(sender = %event.actor, "ban notice recognized in chat message");
			return Some(RelayIntent {
				text: format!("{} was banned. Last message: \"{text}\"", event.actor),
				origin_user: Some(SYSTEM_ORIGIN.to_string()),
			});
		}

		None
	}

	fn on_moderation(&mut self, event: &ChatEvent) -> Option<RelayIntent> {
		let last = self.memory.take(&event.actor).unwrap_or_else(|| NO_DATA.to_string());
		let shown = self.filtered_text(&last);

		let text = match event.kind {
			ChatEventKind::Timeout => {
				let duration = event.duration_seconds.unwrap_or(0);
				format!(
					"{} timed out @{} for {duration}s. Last words: \"{shown}\"",
					event.channel, event.actor
				)
			}
			_ => format!("{} banned @{}. Last words: \"{shown}\"", event.channel, event.actor),
		};

		Some(RelayIntent { text, origin_user: None })
	}

	fn on_delete(&self, event: &ChatEvent) -> Option<RelayIntent> {
		let text = event.text.as_deref().unwrap_or("");
		let shown = self.filtered_text(text);
		Some(RelayIntent {
			text: format!("deleted message: \"{shown}\""),
			origin_user: None,
		})
	}

	fn filtered_text(&self, text: &str) -> String {
		let verdict = self.filter.analyze(text);
		if verdict.should_block {
			debug!(found = ?verdict.found_words, "block verdict; withholding relay text");
			return BLOCKED_PLACEHOLDER.to_string();
		}
		if verdict.contains_banned {
			debug!(found = ?verdict.found_words, "censoring relay text");
			return verdict.censored_text;
		}
		text.to_string()
	}
}

#[cfg(test)]
mod tests {
	use chatrelay_filter::FilterConfig;

	use super::*;

	fn channel(name: &str) -> ChannelName {
		ChannelName::new(name).unwrap()
	}

	fn classifier_with(filter_cfg: FilterConfig) -> EventClassifier {
		let filter = WordFilter::new(filter_cfg).unwrap();
		EventClassifier::new(ClassifierConfig::new(channel("source")), filter).unwrap()
	}

	fn classifier() -> EventClassifier {
		classifier_with(FilterConfig::default())
	}

	#[test]
	fn ignores_events_from_other_channels() {
		let mut c = classifier();
		let ev = ChatEvent::ban(channel("elsewhere"), "alice");
		assert!(c.classify(&ev).is_none());
		assert_eq!(c.memory_len(), 0);
	}

	#[test]
	fn channel_match_is_case_insensitive() {
		let mut c = classifier();
		let ev = ChatEvent::message(channel("SOURCE"), "alice", "hi");
		c.classify(&ev);
		assert_eq!(c.memory_len(), 1);
	}

	#[test]
	fn messages_record_memory_and_relay_nothing() {
		let mut c = classifier();
		let ev = ChatEvent::message(channel("source"), "alice", "my last words");
		assert!(c.classify(&ev).is_none());
		assert_eq!(c.memory_len(), 1);
	}

	#[test]
	fn empty_or_anonymous_messages_are_not_recorded() {
		let mut c = classifier();
		assert!(c.classify(&ChatEvent::message(channel("source"), "alice", "")).is_none());
		assert!(c.classify(&ChatEvent::message(channel("source"), "  ", "hello")).is_none());
		assert_eq!(c.memory_len(), 0);
	}

	#[test]
	fn ban_relays_last_words_and_consumes_the_entry() {
		let mut c = classifier();
		c.classify(&ChatEvent::message(channel("source"), "alice", "bye everyone"));

		let intent = c.classify(&ChatEvent::ban(channel("source"), "Alice")).expect("intent");
		assert_eq!(intent.text, "source banned @Alice. Last words: \"bye everyone\"");
		assert!(intent.origin_user.is_none());
		assert_eq!(c.memory_len(), 0);

		// second ban for the same user falls back to the placeholder text
		let intent = c.classify(&ChatEvent::ban(channel("source"), "alice")).expect("intent");
		assert!(intent.text.contains(NO_DATA));
	}

	#[test]
	fn timeout_includes_the_duration() {
		let mut c = classifier();
		c.classify(&ChatEvent::message(channel("source"), "bob", "oops"));

		let intent = c
			.classify(&ChatEvent::timeout(channel("source"), "bob", 600))
			.expect("intent");
		assert_eq!(intent.text, "source timed out @bob for 600s. Last words: \"oops\"");
	}

	#[test]
	fn banned_words_are_censored_in_relayed_text() {
		let mut c = classifier_with(FilterConfig {
			banned_words: vec!["kurwa".to_string()],
			..FilterConfig::default()
		});
		c.classify(&ChatEvent::message(channel("source"), "alice", "kurwa again"));

		let intent = c.classify(&ChatEvent::ban(channel("source"), "alice")).expect("intent");
		assert!(intent.text.contains("k***a again"), "got: {}", intent.text);
	}

	#[test]
	fn block_verdict_replaces_the_whole_text() {
		let mut c = classifier_with(FilterConfig {
			block_words: vec!["sentinel".to_string()],
			..FilterConfig::default()
		});
		c.classify(&ChatEvent::message(channel("source"), "alice", "this has the sentinel in it"));

		let intent = c.classify(&ChatEvent::ban(channel("source"), "alice")).expect("intent");
		assert!(intent.text.contains(BLOCKED_PLACEHOLDER));
		assert!(!intent.text.contains("sentinel"));
	}

	#[test]
	fn delete_relays_filtered_text_without_touching_memory() {
		let mut c = classifier_with(FilterConfig {
			banned_words: vec!["kurwa".to_string()],
			..FilterConfig::default()
		});
		c.classify(&ChatEvent::message(channel("source"), "alice", "kept"));

		let intent = c
			.classify(&ChatEvent::delete(channel("source"), "kurwa was said"))
			.expect("intent");
		assert_eq!(intent.text, "deleted message: \"k***a was said\"");
		assert_eq!(c.memory_len(), 1);
	}

	#[test]
	fn ban_notice_in_plain_chat_yields_system_intent() {
		let mut c = classifier();
		let intent = c
			.classify(&ChatEvent::message(
				channel("source"),
				"modbot",
				"troll123 has been permanently banned",
			))
			.expect("intent");

		assert_eq!(intent.origin_user.as_deref(), Some(SYSTEM_ORIGIN));
		assert!(intent.text.contains("modbot was banned"));
		// the notice text itself is still recorded as modbot's last message
		assert_eq!(c.memory_len(), 1);
	}
}
