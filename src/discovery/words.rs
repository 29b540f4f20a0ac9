//! Session strings: three lowercase English words joined by hyphens.
//!
//! Case-insensitive on input, canonical lowercase in storage. The list
//! gives 128^3 ≈ 2M combinations, plenty for the handful of concurrent
//! sessions a discovery instance serves.

use rand::seq::SliceRandom;
use rand::Rng;

/// 128 short, distinct, easy-to-say words.
pub const WORDS: &[&str] = &[
    "acorn", "amber", "anvil", "apple", "arrow", "aspen", "badge", "bagel",
    "basil", "beach", "birch", "bison", "blaze", "bloom", "brass", "brave",
    "bread", "brook", "candle", "canyon", "cedar", "chalk", "cherry", "cliff",
    "cloud", "clover", "coast", "comet", "copper", "coral", "crane", "creek",
    "cricket", "crystal", "daisy", "dawn", "delta", "drift", "eagle", "ember",
    "fable", "falcon", "fern", "field", "flint", "forest", "fox", "frost",
    "garden", "ginger", "glade", "gold", "granite", "grove", "harbor", "hawk",
    "hazel", "heron", "hill", "holly", "ivory", "jade", "juniper", "kestrel",
    "lagoon", "lake", "lantern", "laurel", "lemon", "lily", "linen", "lotus",
    "maple", "marble", "meadow", "mint", "mist", "moon", "moss", "mountain",
    "north", "oak", "ocean", "olive", "onyx", "opal", "orchard", "osprey",
    "otter", "pearl", "pebble", "pine", "plum", "pond", "poppy", "prairie",
    "quiet", "quill", "rain", "raven", "reed", "ridge", "river", "robin",
    "rose", "rowan", "saffron", "sage", "sand", "shore", "silver", "sky",
    "slate", "snow", "sparrow", "spring", "spruce", "star", "stone", "storm",
    "summer", "thistle", "tide", "timber", "trail", "violet", "willow", "wren",
];

/// Generate a fresh `word-word-word` session string.
pub fn generate<R: Rng>(rng: &mut R) -> String {
    let mut picks = WORDS.choose_multiple(rng, 3);
    format!(
        "{}-{}-{}",
        picks.next().unwrap(),
        picks.next().unwrap(),
        picks.next().unwrap()
    )
}

/// Canonicalize user input: lowercase, exactly three alphabetic words
/// separated by single hyphens. Returns `None` for anything else.
pub fn canonicalize(input: &str) -> Option<String> {
    let lowered = input.trim().to_ascii_lowercase();
    let parts: Vec<&str> = lowered.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    for part in &parts {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_lowercase()) {
            return None;
        }
    }
    Some(lowered)
}

/// Quick shape check without allocating.
pub fn looks_like_session_string(input: &str) -> bool {
    canonicalize(input).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_strings_canonicalize() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let s = generate(&mut rng);
            assert_eq!(canonicalize(&s).as_deref(), Some(s.as_str()));
            assert_eq!(s.split('-').count(), 3);
        }
    }

    #[test]
    fn input_is_case_insensitive() {
        assert_eq!(canonicalize("Quiet-MAPLE-Heron").as_deref(), Some("quiet-maple-heron"));
        assert_eq!(canonicalize("  quiet-maple-heron  ").as_deref(), Some("quiet-maple-heron"));
    }

    #[test]
    fn malformed_inputs_rejected() {
        assert!(canonicalize("two-words").is_none());
        assert!(canonicalize("four-little-words-here").is_none());
        assert!(canonicalize("with-digit5-word").is_none());
        assert!(canonicalize("a--b").is_none());
        assert!(canonicalize("").is_none());
        assert!(!looks_like_session_string("127.0.0.1:9000"));
    }
}
