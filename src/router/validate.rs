//! Field checks shared by the handlers

use crate::store::record::MAX_NAME_LEN;

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_PASSWORD_LEN: usize = 30;
pub const MAX_CONTENT_LEN: usize = 1000;

/// Most messages a single history read returns
pub const MAX_HISTORY: usize = 50;

/// Display names, login tokens and channel names
pub fn name(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_NAME_LEN
}

pub fn password(s: &str) -> bool {
    (MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&s.len())
}

pub fn content(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_CONTENT_LEN
}

/// `0` public or `1` private
pub fn publicity(s: &str) -> Option<i32> {
    match s {
        "0" => Some(0),
        "1" => Some(1),
        _ => None,
    }
}

/// Hex timestamp, optionally `0x`-prefixed; must be positive
pub fn timestamp(s: &str) -> Option<i32> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    i32::from_str_radix(digits, 16).ok().filter(|&t| t > 0)
}

pub fn format_timestamp(t: i32) -> String {
    format!("{:x}", t)
}

/// Plain decimal, no sign
pub fn decimal<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Privilege level: any decimal `i32`, sign allowed
pub fn privilege(s: &str) -> Option<i32> {
    s.parse().ok()
}
