//! Fractional ordering keys.
//!
//! Keys are strings over `a..=z`, compared lexicographically. A key never
//! ends in `a` (the lowest digit): with that rule there is always room for
//! another key strictly between any two distinct keys, so items can be
//! reordered forever without renumbering their neighbours.
//!
//! Reading a key as a base-26 fraction (`"n"` = 13/26, `"nb"` = 13/26 +
//! 1/676, ...) makes lexicographic order and numeric order agree.

use thiserror::Error;

/// Lowest digit of the alphabet.
const LOW: u8 = b'a';

/// Number of digits.
const BASE: u8 = 26;

/// Key used when nothing else is known: the middle of the key space.
pub const DEFAULT_POSITION: &str = "n";

/// Digit range used for fresh layouts (`c..=x`), leaving room at both ends.
const LAYOUT_FIRST: u32 = 2;
const LAYOUT_LAST: u32 = 23;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    #[error("key `{key}` contains `{ch}`, outside a..=z")]
    InvalidCharacter { key: String, ch: char },

    #[error("key `{before}` is not below `{after}`")]
    OutOfOrder { before: String, after: String },

    #[error("no key fits between `{before}` and `{after}`")]
    NoRoom { before: String, after: String },
}

fn validate(key: &str) -> Result<(), PositionError> {
    match key.chars().find(|c| !c.is_ascii_lowercase()) {
        Some(ch) => Err(PositionError::InvalidCharacter {
            key: key.to_string(),
            ch,
        }),
        None => Ok(()),
    }
}

/// Trailing lowest digits carry no value (`"ba"` sorts like `"b"` padded).
fn trim_low(key: &str) -> &str {
    key.trim_end_matches(LOW as char)
}

/// Generate a key strictly between `before` and `after`.
///
/// - both `None`: the midpoint, `"n"`
/// - `before` only: a key after it (append)
/// - `after` only: a key before it (prepend)
/// - both: `before < result < after`, provided `before < after`
pub fn key_between(before: Option<&str>, after: Option<&str>) -> Result<String, PositionError> {
    if let Some(b) = before {
        validate(b)?;
    }
    if let Some(a) = after {
        validate(a)?;
    }

    let lo = before.map(trim_low).unwrap_or("");
    let hi = match after {
        Some(a) => {
            if let Some(b) = before {
                if b >= a {
                    return Err(PositionError::OutOfOrder {
                        before: b.to_string(),
                        after: a.to_string(),
                    });
                }
            }
            let trimmed = trim_low(a);
            if trimmed <= lo {
                return Err(PositionError::NoRoom {
                    before: before.unwrap_or("").to_string(),
                    after: a.to_string(),
                });
            }
            Some(trimmed)
        }
        None => None,
    };

    let key = midpoint(lo.as_bytes(), hi.map(str::as_bytes));
    // Only ASCII lowercase bytes are ever pushed.
    Ok(key.into_iter().map(char::from).collect())
}

/// Midpoint of two digit strings, `a < b` (`b = None` is +infinity).
/// Neither input ends in the lowest digit and neither does the output.
fn midpoint(mut a: &[u8], mut b: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();

    loop {
        if let Some(upper) = b {
            let shared = upper
                .iter()
                .enumerate()
                .take_while(|(i, c)| a.get(*i).copied().unwrap_or(LOW) == **c)
                .count();
            if shared > 0 {
                out.extend_from_slice(&upper[..shared]);
                a = a.get(shared..).unwrap_or(&[]);
                b = Some(&upper[shared..]).filter(|rest| !rest.is_empty());
                continue;
            }
        }

        let digit_a = a.first().map(|c| c - LOW).unwrap_or(0);
        let digit_b = b.and_then(|u| u.first()).map(|c| c - LOW).unwrap_or(BASE);

        if digit_b.saturating_sub(digit_a) > 1 {
            // Round half up: `None, None` lands on 'n'.
            out.push(LOW + (digit_a + digit_b + 1) / 2);
            return out;
        }

        // Adjacent digits. If the upper bound has more digits, its first
        // digit alone already sits strictly between the two.
        if let Some(upper) = b {
            if upper.len() > 1 {
                out.push(upper[0]);
                return out;
            }
        }

        // Otherwise keep `a`'s digit and go one level deeper, unbounded above.
        out.push(LOW + digit_a);
        a = a.get(1..).unwrap_or(&[]);
        b = None;
    }
}

/// `count` evenly spaced keys for a fresh list, in ascending order.
///
/// Up to 22 items get single-letter keys spread over `c..=x`. Larger lists
/// get fixed-width base-26 keys over the same range, wide enough that all
/// values are distinct.
pub fn initial_positions(count: usize) -> Vec<String> {
    let span = LAYOUT_LAST - LAYOUT_FIRST;

    match count {
        0 => Vec::new(),
        1 => vec![DEFAULT_POSITION.to_string()],
        n if n <= (span + 1) as usize => {
            let steps = (n - 1) as u32;
            (0..n as u32)
                .map(|i| {
                    let digit = LAYOUT_FIRST + (i * span + steps / 2) / steps;
                    char::from(LOW + digit as u8).to_string()
                })
                .collect()
        }
        n => {
            let steps = (n - 1) as u128;
            let mut width: u32 = 2;
            while (span as u128) * 26u128.pow(width - 1) < steps {
                width += 1;
            }
            let unit = 26u128.pow(width - 1);
            let lo = LAYOUT_FIRST as u128 * unit;
            let range = span as u128 * unit;

            (0..n as u128)
                .map(|i| encode(lo + i * range / steps, width))
                .collect()
        }
    }
}

/// Fixed-width base-26 rendering with trailing lowest digits dropped.
fn encode(mut value: u128, width: u32) -> String {
    let mut digits = vec![LOW; width as usize];
    for slot in digits.iter_mut().rev() {
        *slot = LOW + (value % 26) as u8;
        value /= 26;
    }
    while digits.len() > 1 && digits.last() == Some(&LOW) {
        digits.pop();
    }
    digits.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midpoint_of_empty_space() {
        assert_eq!(key_between(None, None).unwrap(), "n");
    }

    #[test]
    fn test_between_with_gap() {
        assert_eq!(key_between(Some("a"), Some("c")).unwrap(), "b");
        let k = key_between(Some("c"), Some("x")).unwrap();
        assert!(k.as_str() > "c" && k.as_str() < "x");
    }

    #[test]
    fn test_between_adjacent_letters_goes_deeper() {
        let k = key_between(Some("n"), Some("o")).unwrap();
        assert_eq!(k, "nn");
    }

    #[test]
    fn test_between_uses_longer_upper_prefix() {
        let k = key_between(Some("n"), Some("oc")).unwrap();
        assert_eq!(k, "o");
    }

    #[test]
    fn test_append_past_last_letter() {
        let k = key_between(Some("z"), None).unwrap();
        assert_eq!(k, "zn");
        assert!(k.as_str() > "z");
        let k2 = key_between(Some("zz"), None).unwrap();
        assert!(k2.as_str() > "zz");
    }

    #[test]
    fn test_prepend_before_low_letter() {
        let k = key_between(None, Some("b")).unwrap();
        assert_eq!(k, "an");
        assert!(k.as_str() < "b");
    }

    #[test]
    fn test_before_with_trailing_low_digit() {
        let k = key_between(Some("ba"), Some("c")).unwrap();
        assert!(k.as_str() > "ba" && k.as_str() < "c");
        assert!(!k.ends_with('a'));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            key_between(Some("c"), Some("b")),
            Err(PositionError::OutOfOrder { .. })
        ));
        assert!(matches!(
            key_between(Some("b"), Some("b")),
            Err(PositionError::OutOfOrder { .. })
        ));
        assert!(matches!(
            key_between(Some("b"), Some("ba")),
            Err(PositionError::NoRoom { .. })
        ));
        assert!(matches!(
            key_between(None, Some("a")),
            Err(PositionError::NoRoom { .. })
        ));
        assert!(matches!(
            key_between(Some("B"), None),
            Err(PositionError::InvalidCharacter { ch: 'B', .. })
        ));
    }

    #[test]
    fn test_initial_positions_small() {
        assert!(initial_positions(0).is_empty());
        assert_eq!(initial_positions(1), vec!["n"]);
        assert_eq!(initial_positions(2), vec!["c", "x"]);

        let keys = initial_positions(22);
        assert_eq!(keys.len(), 22);
        assert_eq!(keys.first().map(String::as_str), Some("c"));
        assert_eq!(keys.last().map(String::as_str), Some("x"));
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_initial_positions_large() {
        let keys = initial_positions(1000);
        assert_eq!(keys.len(), 1000);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(keys.iter().all(|k| !k.ends_with('a')));
        assert!(keys[0].as_str() >= "c");
        assert!(keys[999].as_str() <= "x");

        // Still room to prepend and append.
        assert!(key_between(None, Some(&keys[0])).is_ok());
        assert!(key_between(Some(&keys[999]), None).is_ok());
    }
}
