//! Short unique identifiers for URLs: random tokens for photos, text-derived
//! slugs for places.

use rand::Rng;
use tracing::warn;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_ATTEMPTS: usize = 100;

pub const DEFAULT_SLUG_LEN: usize = 8;

/// Random lowercase-alphanumeric token of the given length.
pub fn random_slug(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Random slug that does not satisfy `exists`.
///
/// Regenerates up to 100 times. If every attempt collides, the current Unix
/// timestamp is appended to a final candidate as a deterministic escape hatch.
/// That fallback trades slug length for guaranteed termination; it is expected
/// to be unreachable in practice at 36^8 tokens per place.
pub fn unique_slug<F>(len: usize, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    for _ in 0..MAX_ATTEMPTS {
        let candidate = random_slug(len);
        if !exists(&candidate) {
            return candidate;
        }
    }
    warn!(
        "random slug space exhausted after {} attempts, falling back to timestamp suffix",
        MAX_ATTEMPTS
    );
    format!("{}{}", random_slug(len), chrono::Utc::now().timestamp())
}

/// Derive a URL slug from human text: lowercase, transliterate common accented
/// Latin characters, collapse everything else to hyphens, truncate at a word
/// boundary.
pub fn text_slug(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_hyphen = true; // suppress leading hyphen
    for c in text.chars() {
        let folded = fold_char(c);
        if folded.is_empty() {
            if !last_hyphen {
                out.push('-');
                last_hyphen = true;
            }
        } else {
            out.push_str(folded);
            last_hyphen = false;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.len() > max_len {
        // Cut at the last word boundary that fits.
        match out[..max_len].rfind('-') {
            Some(idx) if idx > 0 => out.truncate(idx),
            _ => out.truncate(max_len),
        }
    }
    out
}

/// Text-derived slug made unique by appending `-2`, `-3`, ... while `exists`
/// reports a collision.
pub fn unique_text_slug<F>(text: &str, max_len: usize, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    let base = text_slug(text, max_len);
    let base = if base.is_empty() {
        random_slug(DEFAULT_SLUG_LEN)
    } else {
        base
    };
    if !exists(&base) {
        return base;
    }
    let mut n = 2u64;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn fold_char(c: char) -> &'static str {
    match c {
        'a'..='z' | '0'..='9' => ascii_str(c),
        'A'..='Z' => ascii_str(c.to_ascii_lowercase()),
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ñ' | 'Ñ' => "n",
        'ç' | 'Ç' => "c",
        'ß' => "ss",
        'æ' | 'Æ' => "ae",
        'ø' | 'Ø' => "o",
        _ => "",
    }
}

fn ascii_str(c: char) -> &'static str {
    const TABLE: &str = "abcdefghijklmnopqrstuvwxyz0123456789";
    let idx = match c {
        'a'..='z' => c as usize - 'a' as usize,
        '0'..='9' => 26 + (c as usize - '0' as usize),
        _ => return "",
    };
    &TABLE[idx..idx + 1]
}
