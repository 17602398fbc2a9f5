//! Fractional index strings for ordered results.
//!
//! A fractional index is a lexicographically comparable base-62 string
//! interpreted as a fraction in (0, 1). Between any two distinct keys a new
//! key can always be generated without relabeling neighbors, which is what
//! lets the ordered-window operator move rows around without renumbering
//! the whole result set.
//!
//! Generated keys never end in the smallest digit (`'0'`), so lexicographic
//! order and fractional order agree. Only the ordering of keys is
//! observable; the exact digits are an implementation detail.

const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = 62;

fn digit_value(c: u8) -> usize {
    DIGITS.iter().position(|d| *d == c).expect("fractional index digit")
}

/// Generate a key strictly between `a` and `b`.
///
/// `None` bounds mean the start/end of the key space. When both bounds are
/// given, `a` must be lexicographically smaller than `b`.
pub fn key_between(a: Option<&str>, b: Option<&str>) -> String {
    if let (Some(a), Some(b)) = (a, b) {
        assert!(a < b, "key_between bounds out of order: {a:?} >= {b:?}");
    }
    midpoint(a.unwrap_or(""), b)
}

// Midpoint of the open interval (a, b), where `a` and `b` are fractions in
// [0, 1) written in base 62 and `b = None` means 1.
fn midpoint(a: &str, b: Option<&str>) -> String {
    if let Some(b) = b {
        // Strip the longest common prefix, treating a missing digit in `a`
        // as zero.
        let mut n = 0;
        let ab = a.as_bytes();
        let bb = b.as_bytes();
        while n < bb.len() && ab.get(n).copied().unwrap_or(b'0') == bb[n] {
            n += 1;
        }
        if n > 0 {
            let rest = midpoint(&a[n.min(a.len())..], Some(&b[n..]));
            return format!("{}{}", &b[..n], rest);
        }
    }

    let digit_a = a.as_bytes().first().map(|c| digit_value(*c)).unwrap_or(0);
    let digit_b = b
        .map(|b| digit_value(b.as_bytes()[0]))
        .unwrap_or(BASE);

    if digit_b - digit_a > 1 {
        let mid = (digit_a + digit_b + 1) / 2;
        (DIGITS[mid] as char).to_string()
    } else if b.map(|b| b.len() > 1).unwrap_or(false) {
        // `b` is `digit_b` followed by more digits; its first digit alone is
        // already strictly between.
        b.unwrap()[..1].to_string()
    } else {
        // Consecutive digits: recurse into the tail of `a` against the top
        // of the space.
        let head = DIGITS[digit_a] as char;
        let tail = midpoint(if a.is_empty() { "" } else { &a[1..] }, None);
        format!("{head}{tail}")
    }
}
