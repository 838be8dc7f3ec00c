//! Human-readable encoding of digests and ids.
//!
//! Hex digests are hard to remember even when only the first few
//! characters matter. This encoding maps each of the leading bytes to a
//! memorable two-part token from a fixed dictionary, and appends the
//! remaining bytes as unpadded URL-safe base64. The dictionary is part
//! of the stored layout and must never change.
//!
//! The encoding is reversible but exists for diagnostics only; nothing
//! security-relevant depends on it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Number of leading bytes rendered as dictionary words.
pub const WORD_BYTES: usize = 3;

/// Separator between the word section and the base64 tail.
const SPLIT_CHAR: char = '.';

// Each byte maps to FIRST[high nibble] + SECOND[low nibble]. All atoms
// are exactly four characters, which keeps decoding unambiguous.
const FIRST: [&str; 16] = [
    "Bold", "Calm", "Cool", "Damp", "Deep", "Fair", "Fast", "Glad",
    "Keen", "Kind", "Late", "Loud", "Mild", "Pale", "Warm", "Wise",
];
const SECOND: [&str; 16] = [
    "Bear", "Crow", "Deer", "Dove", "Hare", "Hawk", "Ibex", "Lark",
    "Lynx", "Mole", "Newt", "Seal", "Swan", "Toad", "Wolf", "Wren",
];

/// Length in characters of one encoded word.
const WORD_LEN: usize = 8;

/// Render a single byte as its dictionary word.
pub fn word(byte: u8) -> String {
    format!("{}{}", FIRST[(byte >> 4) as usize], SECOND[(byte & 0x0f) as usize])
}

fn unword(token: &str) -> Option<u8> {
    if token.len() != WORD_LEN {
        return None;
    }
    let first = FIRST.iter().position(|w| *w == &token[..4])? as u8;
    let second = SECOND.iter().position(|w| *w == &token[4..])? as u8;
    Some((first << 4) | second)
}

/// Encode bytes as leading dictionary words plus a base64 tail.
pub fn encode(bytes: &[u8]) -> String {
    encode_n(bytes, WORD_BYTES)
}

/// Encode with an explicit number of word-rendered leading bytes.
pub fn encode_n(bytes: &[u8], num_word_bytes: usize) -> String {
    let split = num_word_bytes.min(bytes.len());
    let words: String = bytes[..split].iter().map(|b| word(*b)).collect();
    let tail = URL_SAFE_NO_PAD.encode(&bytes[split..]);
    if tail.is_empty() {
        words
    } else if words.is_empty() {
        format!("{SPLIT_CHAR}{tail}")
    } else {
        format!("{words}{SPLIT_CHAR}{tail}")
    }
}

/// Decode a string produced by [`encode`] back into bytes.
pub fn decode(encoded: &str) -> Option<Vec<u8>> {
    let (words, tail) = match encoded.find(SPLIT_CHAR) {
        Some(idx) => (&encoded[..idx], &encoded[idx + 1..]),
        None => (encoded, ""),
    };
    if words.len() % WORD_LEN != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(words.len() / WORD_LEN + tail.len());
    for chunk in 0..words.len() / WORD_LEN {
        out.push(unword(&words[chunk * WORD_LEN..(chunk + 1) * WORD_LEN])?);
    }
    out.extend(URL_SAFE_NO_PAD.decode(tail).ok()?);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_covers_all_bytes_uniquely() {
        let mut seen = std::collections::HashSet::new();
        for b in 0..=255u8 {
            assert!(seen.insert(word(b)), "duplicate word for byte {b}");
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let bytes: Vec<u8> = (0..32).map(|i| (i * 37 % 251) as u8).collect();
        let encoded = encode(&bytes);
        assert_eq!(decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_encoding_is_stable() {
        // Pinned: this value is embedded in stored memo URIs.
        assert_eq!(encode(&[0x00, 0x10, 0xff, 0xab, 0xcd]), "BoldBearCalmBearWiseWren.q80");
    }

    #[test]
    fn test_short_inputs() {
        assert_eq!(decode(&encode(&[])).unwrap(), Vec::<u8>::new());
        assert_eq!(decode(&encode(&[7])).unwrap(), vec![7]);
    }

    #[test]
    fn test_no_trailing_separator_without_tail() {
        let encoded = encode(&[1, 2, 3]);
        assert!(!encoded.contains(SPLIT_CHAR));
    }
}
