#![forbid(unsafe_code)]

pub mod timer;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now_secs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
}

/// Truncate to at most `max` characters (not bytes).
pub fn truncate_chars(s: &str, max: usize) -> String {
	match s.char_indices().nth(max) {
		Some((idx, _)) => s[..idx].to_string(),
		None => s.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn truncate_respects_char_boundaries() {
		assert_eq!(truncate_chars("hello", 10), "hello");
		assert_eq!(truncate_chars("hello", 3), "hel");
		assert_eq!(truncate_chars("ééé", 2), "éé");
		assert_eq!(truncate_chars("", 0), "");
	}

	#[test]
	fn unix_now_is_after_2023() {
		assert!(unix_now_secs() > 1_672_531_200);
	}
}
