#![forbid(unsafe_code)]

//! Charset folding for destinations with a restricted character set.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Map accented letters to their unaccented ASCII equivalents.
///
/// ASCII passes through untouched. Letters that do not NFD-decompose to an
/// ASCII base (`ł`, `ø`, ...) get explicit mappings; anything with no ASCII
/// equivalent is kept as-is.
pub fn ascii_fold(text: &str) -> String {
	let mut out = String::with_capacity(text.len());

	for c in text.chars() {
		if c.is_ascii() {
			out.push(c);
			continue;
		}

		match c {
			'ł' => out.push('l'),
			'Ł' => out.push('L'),
			'ø' => out.push('o'),
			'Ø' => out.push('O'),
			'đ' => out.push('d'),
			'Đ' => out.push('D'),
			'ß' => out.push_str("ss"),
			'æ' => out.push_str("ae"),
			'Æ' => out.push_str("AE"),
			'œ' => out.push_str("oe"),
			'Œ' => out.push_str("OE"),
			_ => fold_decomposed(c, &mut out),
		}
	}

	out
}

fn fold_decomposed(c: char, out: &mut String) {
	let mut wrote_base = false;
	for d in c.to_string().nfd() {
		if is_combining_mark(d) {
			continue;
		}
		if d.is_ascii() {
			out.push(d);
			wrote_base = true;
		} else {
			// no ASCII equivalent; keep the original character
			out.push(c);
			return;
		}
	}

	if !wrote_base {
		out.push(c);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn polish_pangram_folds_to_ascii() {
		let folded = ascii_fold("zażółć gęślą jaźń");
		assert_eq!(folded, "zazolc gesla jazn");
		assert!(folded.is_ascii());
	}

	#[test]
	fn ascii_passes_through_unchanged() {
		assert_eq!(ascii_fold("plain ASCII 123 !?"), "plain ASCII 123 !?");
	}

	#[test]
	fn explicit_mappings_cover_non_decomposing_letters() {
		assert_eq!(ascii_fold("Łódź"), "Lodz");
		assert_eq!(ascii_fold("Øresund"), "Oresund");
		assert_eq!(ascii_fold("straße"), "strasse");
	}

	#[test]
	fn unmappable_characters_are_kept() {
		assert_eq!(ascii_fold("price: 5€"), "price: 5€");
	}
}
