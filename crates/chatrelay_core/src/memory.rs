#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

/// Bounded FIFO map from username to that user's last message.
///
/// Keys are lowercased so display-name casing differences collapse onto one
/// entry. Insertion beyond capacity evicts the oldest-inserted key first;
/// updating an existing key does not refresh its age.
#[derive(Debug)]
pub struct UserMemory {
	capacity: usize,
	entries: HashMap<String, String>,
	order: VecDeque<String>,
}

impl UserMemory {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: HashMap::with_capacity(capacity),
			order: VecDeque::with_capacity(capacity),
		}
	}

	/// Record `text` as `user`'s last message, evicting the oldest entry when
	/// the cache is full.
	pub fn put(&mut self, user: &str, text: impl Into<String>) {
		if self.capacity == 0 {
			return;
		}

		let key = user.to_lowercase();
		if self.entries.contains_key(&key) {
			self.entries.insert(key, text.into());
			return;
		}

		while self.entries.len() >= self.capacity {
			let Some(oldest) = self.order.pop_front() else {
				break;
			};
			self.entries.remove(&oldest);
		}

		self.entries.insert(key.clone(), text.into());
		self.order.push_back(key);
	}

	pub fn get(&self, user: &str) -> Option<&str> {
		self.entries.get(&user.to_lowercase()).map(String::as_str)
	}

	/// Remove and return `user`'s last message (one-shot consumption).
	pub fn take(&mut self, user: &str) -> Option<String> {
		let key = user.to_lowercase();
		let text = self.entries.remove(&key)?;
		if let Some(pos) = self.order.iter().position(|k| *k == key) {
			self.order.remove(pos);
		}
		Some(text)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn records_and_takes_last_message() {
		let mut mem = UserMemory::new(4);
		mem.put("Alice", "first");
		mem.put("alice", "second");

		assert_eq!(mem.len(), 1);
		assert_eq!(mem.get("ALICE"), Some("second"));
		assert_eq!(mem.take("alice"), Some("second".to_string()));
		assert_eq!(mem.take("alice"), None);
		assert!(mem.is_empty());
	}

	#[test]
	fn evicts_oldest_inserted_key_at_capacity() {
		let mut mem = UserMemory::new(2);
		mem.put("a", "1");
		mem.put("b", "2");
		mem.put("c", "3");

		assert_eq!(mem.len(), 2);
		assert_eq!(mem.get("a"), None);
		assert_eq!(mem.get("b"), Some("2"));
		assert_eq!(mem.get("c"), Some("3"));
	}

	#[test]
	fn updating_an_existing_key_keeps_its_age() {
		let mut mem = UserMemory::new(2);
		mem.put("a", "1");
		mem.put("b", "2");
		mem.put("a", "updated");
		mem.put("c", "3");

		// "a" is still the oldest insertion, so it goes first.
		assert_eq!(mem.get("a"), None);
		assert_eq!(mem.get("b"), Some("2"));
		assert_eq!(mem.get("c"), Some("3"));
	}

	#[test]
	fn take_frees_a_slot_without_disturbing_order() {
		let mut mem = UserMemory::new(2);
		mem.put("a", "1");
		mem.put("b", "2");
		assert_eq!(mem.take("a"), Some("1".to_string()));

		mem.put("c", "3");
		mem.put("d", "4");

		assert_eq!(mem.get("b"), None);
		assert_eq!(mem.get("c"), Some("3"));
		assert_eq!(mem.get("d"), Some("4"));
	}

	#[test]
	fn zero_capacity_never_stores() {
		let mut mem = UserMemory::new(0);
		mem.put("a", "1");
		assert!(mem.is_empty());
		assert_eq!(mem.get("a"), None);
	}

	proptest! {
		#[test]
		fn never_exceeds_capacity(ops in prop::collection::vec(("[a-f]", "[a-z]{0,6}"), 0..200), capacity in 1usize..8) {
			let mut mem = UserMemory::new(capacity);
			for (user, text) in ops {
				mem.put(&user, text);
				prop_assert!(mem.len() <= capacity);
			}
		}

		#[test]
		fn eviction_removes_earliest_inserted(users in prop::collection::vec("[a-z]{1,4}", 1..40)) {
			let capacity = 4usize;
			let mut mem = UserMemory::new(capacity);
			// reference model: insertion order of currently-held keys
			let mut model: Vec<String> = Vec::new();
			let mut seen: Vec<String> = Vec::new();

			for user in &users {
				let key = user.to_lowercase();
				if !seen.contains(&key) {
					seen.push(key.clone());
				}
				if !model.contains(&key) {
					if model.len() == capacity {
						model.remove(0);
					}
					model.push(key);
				}
				mem.put(user, "msg");
			}

			for key in &seen {
				prop_assert_eq!(mem.get(key).is_some(), model.contains(key));
			}
		}
	}
}
