//! Text normalisation ahead of fuzzy matching.
//!
//! Attackers evade keyword detection with fullwidth forms, zero-width
//! characters, and whitespace games. The matcher therefore compares
//! normalised text: NFKC, invisible characters stripped, lowercased,
//! whitespace collapsed.

use unicode_normalization::UnicodeNormalization;

/// Zero-width and invisible characters stripped before comparison.
const INVISIBLE_CHARS: &[char] = &[
    '\u{200B}', // zero-width space
    '\u{200C}', // zero-width non-joiner
    '\u{200D}', // zero-width joiner
    '\u{FEFF}', // BOM
    '\u{00AD}', // soft hyphen
    '\u{2060}', // word joiner
];

/// Normalise text for similarity comparison: NFKC, strip invisibles and
/// Unicode tag characters, lowercase, collapse runs of whitespace, trim.
#[must_use]
pub fn normalise(input: &str) -> String {
    let cleaned: String = input
        .nfkc()
        .filter(|c| !INVISIBLE_CHARS.contains(c) && !is_tag_char(*c))
        .collect();
    let lowered = cleaned.to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Unicode tag characters (U+E0001–U+E007F) duplicate ASCII invisibly and
/// can smuggle hidden text through the pipeline.
fn is_tag_char(c: char) -> bool {
    (0xE0001..=0xE007F).contains(&(c as u32))
}
