//! Random suffixes for resource names.

use rand::Rng;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Eight lowercase alphanumeric characters, safe for DNS-1123 names.
#[must_use]
pub fn random_string() -> String {
    let mut rng = rand::rng();
    (0..8)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Random integer in `[min, max]`.
#[must_use]
pub fn random_num(min: i64, max: i64) -> i64 {
    if min >= max {
        return min;
    }
    rand::rng().random_range(min..=max)
}
