#![forbid(unsafe_code)]

//! Word-filter/censorship engine.
//!
//! All matching happens on a normalized form of the text (lowercased,
//! diacritics stripped, non-alphanumerics dropped) so that spacing, casing
//! and accent tricks do not bypass the lists. Censoring rewrites the
//! original text so the output stays readable.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Filter construction/mutation errors.
#[derive(Debug, Error)]
pub enum FilterError {
	#[error("invalid filter pattern: {0}")]
	Pattern(#[from] regex::Error),
}

/// Word-filter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
	/// Words that get censored in relayed text.
	pub banned_words: Vec<String>,

	/// Words that veto the whole message (see [`WordFilter::should_block`]).
	pub block_words: Vec<String>,

	/// Per-banned-word carrier substrings that void a match, e.g. a match on
	/// a short slur is ignored when the text also contains a longer benign
	/// word carrying it.
	pub exceptions: BTreeMap<String, Vec<String>>,

	/// Match banned words only as whole tokens instead of anywhere.
	pub strict: bool,
}

/// Verdict produced by [`WordFilter::analyze`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CensorVerdict {
	pub contains_banned: bool,
	pub should_block: bool,
	pub censored_text: String,

	/// Every configured banned word whose normalized form occurs in the
	/// normalized text. For logging; never decides blocking.
	pub found_words: Vec<String>,
}

const REPLACEMENT: char = '*';

struct BannedEntry {
	word: String,
	norm: String,
	/// Case-insensitive match of the word as written, against original text.
	censor_re: Regex,
	/// Whole-word variant used by [`WordFilter::censor_heavy`].
	heavy_re: Regex,
	/// Whole-token match against normalized text (strict mode).
	strict_re: Regex,
}

impl BannedEntry {
	fn build(word: &str) -> Result<Self, FilterError> {
		let word = word.to_lowercase();
		let norm = normalize(&word);
		let censor_re = Regex::new(&format!("(?i){}", regex::escape(&word)))?;
		let heavy_re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&word)))?;
		let strict_re = Regex::new(&format!(r"\b{}\b", regex::escape(&norm)))?;
		Ok(Self {
			word,
			norm,
			censor_re,
			heavy_re,
			strict_re,
		})
	}
}

/// Pure text filter over a fixed word configuration.
///
/// Not internally synchronized; callers mutating the lists from concurrent
/// flows must serialize access themselves.
pub struct WordFilter {
	strict: bool,
	entries: Vec<BannedEntry>,
	block_norms: Vec<String>,
	/// normalized banned word -> normalized carrier substrings
	exceptions: BTreeMap<String, Vec<String>>,
}

impl WordFilter {
	pub fn new(cfg: FilterConfig) -> Result<Self, FilterError> {
		let mut entries = Vec::with_capacity(cfg.banned_words.len());
		for word in &cfg.banned_words {
			let word = word.to_lowercase();
			if entries.iter().any(|e: &BannedEntry| e.word == word) {
				continue;
			}
			entries.push(BannedEntry::build(&word)?);
		}

		let block_norms = cfg.block_words.iter().map(|w| normalize(w)).filter(|n| !n.is_empty()).collect();

		let exceptions = cfg
			.exceptions
			.iter()
			.map(|(word, carriers)| {
				let carriers = carriers.iter().map(|c| normalize(c)).filter(|n| !n.is_empty()).collect();
				(normalize(word), carriers)
			})
			.collect();

		Ok(Self {
			strict: cfg.strict,
			entries,
			block_norms,
			exceptions,
		})
	}

	/// Whether whole-token (strict) matching is active.
	pub fn is_strict(&self) -> bool {
		self.strict
	}

	/// True iff some banned word, not voided by a carrier exception, occurs
	/// in the text.
	pub fn contains_banned(&self, text: &str) -> bool {
		let norm_text = normalize(text);

		self.entries.iter().any(|entry| {
			if entry.norm.is_empty() {
				return false;
			}
			if self.strict {
				return entry.strict_re.is_match(&norm_text);
			}
			if self.is_false_positive(&norm_text, entry) {
				return false;
			}
			norm_text.contains(&entry.norm)
		})
	}

	/// Hard veto: the text contains a block-list term. Independent of
	/// censorship; the caller must suppress the whole message.
	pub fn should_block(&self, text: &str) -> bool {
		let norm_text = normalize(text);
		self.block_norms.iter().any(|b| norm_text.contains(b))
	}

	/// Mask every banned-word occurrence in the original text, keeping the
	/// first and last character. Matches of length <= 2 are masked entirely.
	pub fn censor(&self, text: &str) -> String {
		let mut out = text.to_string();
		for entry in &self.entries {
			if entry.word.is_empty() {
				continue;
			}
			out = entry.censor_re.replace_all(&out, |caps: &regex::Captures<'_>| mask_partial(&caps[0])).into_owned();
		}
		out
	}

	/// Mask whole banned words entirely (word-boundary match), for
	/// destinations that must not leak the word shape.
	pub fn censor_heavy(&self, text: &str) -> String {
		let mut out = text.to_string();
		for entry in &self.entries {
			if entry.word.is_empty() {
				continue;
			}
			out = entry
				.heavy_re
				.replace_all(&out, |caps: &regex::Captures<'_>| {
					REPLACEMENT.to_string().repeat(caps[0].chars().count())
				})
				.into_owned();
		}
		out
	}

	/// Full verdict for one text: banned/block flags, censored rendition and
	/// the list of matched words.
	pub fn analyze(&self, text: &str) -> CensorVerdict {
		let norm_text = normalize(text);
		let found_words = self
			.entries
			.iter()
			.filter(|e| !e.norm.is_empty() && norm_text.contains(&e.norm))
			.map(|e| e.word.clone())
			.collect();

		CensorVerdict {
			contains_banned: self.contains_banned(text),
			should_block: self.should_block(text),
			censored_text: self.censor(text),
			found_words,
		}
	}

	/// Add a banned word at runtime. No-op when already present.
	pub fn add_word(&mut self, word: &str) -> Result<(), FilterError> {
		let word = word.to_lowercase();
		if word.trim().is_empty() || self.entries.iter().any(|e| e.word == word) {
			return Ok(());
		}
		self.entries.push(BannedEntry::build(&word)?);
		Ok(())
	}

	/// Remove a banned word at runtime. No-op when absent.
	pub fn remove_word(&mut self, word: &str) {
		let word = word.to_lowercase();
		self.entries.retain(|e| e.word != word);
	}

	pub fn banned_word_count(&self) -> usize {
		self.entries.len()
	}

	fn is_false_positive(&self, norm_text: &str, entry: &BannedEntry) -> bool {
		let Some(carriers) = self.exceptions.get(&entry.norm) else {
			return false;
		};
		carriers.iter().any(|c| norm_text.contains(c))
	}
}

/// Normalize text for matching: lowercase, strip diacritics via NFD
/// decomposition, keep only ASCII letters and digits.
pub fn normalize(text: &str) -> String {
	text.to_lowercase()
		.nfd()
		.filter(|c| !is_combining_mark(*c))
		.filter(|c| c.is_ascii_alphanumeric())
		.collect()
}

fn mask_partial(m: &str) -> String {
	let chars: Vec<char> = m.chars().collect();
	if chars.len() <= 2 {
		return REPLACEMENT.to_string().repeat(chars.len());
	}

	let mut out = String::with_capacity(m.len());
	out.push(chars[0]);
	for _ in 0..chars.len() - 2 {
		out.push(REPLACEMENT);
	}
	out.push(chars[chars.len() - 1]);
	out
}
