//! Fractional order keys for [`List`](crate::ContainerKind::List) entries.
//!
//! Keys are strings over the base-62 alphabet `0-9A-Za-z`, which is already
//! in ASCII order, so plain string comparison reflects list order. A key
//! never ends in `0`: that keeps room below every key, which is what lets
//! repeated "insert before" chains go on forever without renumbering.

use thiserror::Error;

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = DIGITS.len();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderKeyError {
    #[error("invalid order key {0:?}")]
    InvalidKey(String),
    #[error("order keys out of order: {lower:?} >= {upper:?}")]
    OutOfOrder { lower: String, upper: String },
}

fn digit_value(c: u8) -> Option<usize> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as usize),
        b'A'..=b'Z' => Some((c - b'A') as usize + 10),
        b'a'..=b'z' => Some((c - b'a') as usize + 36),
        _ => None,
    }
}

/// Check that `key` could have been produced by this generator.
pub fn validate_key(key: &str) -> Result<(), OrderKeyError> {
    let well_formed = !key.is_empty()
        && !key.ends_with('0')
        && key.bytes().all(|c| digit_value(c).is_some());
    if well_formed {
        Ok(())
    } else {
        Err(OrderKeyError::InvalidKey(key.to_string()))
    }
}

/// Generate a key strictly between `a` and `b`.
///
/// `None` means "unbounded" on that side; with both sides unbounded the
/// canonical midpoint `"V"` is returned.
pub fn generate_key_between(a: Option<&str>, b: Option<&str>) -> Result<String, OrderKeyError> {
    if let Some(a) = a {
        validate_key(a)?;
    }
    if let Some(b) = b {
        validate_key(b)?;
    }
    if let (Some(a), Some(b)) = (a, b) {
        if a >= b {
            return Err(OrderKeyError::OutOfOrder {
                lower: a.to_string(),
                upper: b.to_string(),
            });
        }
    }
    Ok(midpoint(a.unwrap_or("").as_bytes(), b.map(str::as_bytes)))
}

/// Generate `n` increasing keys, all strictly between `a` and `b`.
pub fn generate_n_keys_between(
    a: Option<&str>,
    b: Option<&str>,
    n: usize,
) -> Result<Vec<String>, OrderKeyError> {
    let mut keys: Vec<String> = Vec::with_capacity(n);
    for _ in 0..n {
        let prev = keys.last().map(String::as_str).or(a);
        let key = generate_key_between(prev, b)?;
        keys.push(key);
    }
    Ok(keys)
}

/// Midpoint of `a` (missing digits read as `0`) and `b` (`None` = one past
/// the last digit). Callers guarantee `a < b` and no trailing zeros.
fn midpoint(mut a: &[u8], mut b: Option<&[u8]>) -> String {
    let mut out: Vec<u8> = Vec::new();

    loop {
        if let Some(upper) = b {
            // Copy the shared prefix. It always stops before the end of
            // `upper`, otherwise `a >= upper`.
            let shared = upper
                .iter()
                .enumerate()
                .take_while(|(i, c)| a.get(*i).copied().unwrap_or(b'0') == **c)
                .count();
            if shared > 0 {
                out.extend_from_slice(&upper[..shared]);
                a = a.get(shared..).unwrap_or(&[]);
                b = Some(&upper[shared..]);
                continue;
            }
        }

        let low = a.first().and_then(|c| digit_value(*c)).unwrap_or(0);
        let high = b
            .and_then(|upper| upper.first())
            .and_then(|c| digit_value(*c))
            .unwrap_or(BASE);

        if high - low > 1 {
            out.push(DIGITS[(low + high) / 2]);
            break;
        }

        // Adjacent digits: `upper`'s first digit alone already fits if
        // `upper` continues past it.
        if let Some(upper) = b {
            if upper.len() > 1 {
                out.push(upper[0]);
                break;
            }
        }

        // Otherwise keep `a`'s digit and look for room one level deeper,
        // where the upper bound no longer constrains us.
        out.push(DIGITS[low]);
        a = a.get(1..).unwrap_or(&[]);
        b = None;
    }

    // Only alphabet bytes are ever pushed.
    out.into_iter().map(char::from).collect()
}
