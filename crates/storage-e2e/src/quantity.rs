//! Capacity quantities and small comparison helpers.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

/// Bytes in a Kubernetes quantity such as `5Gi`, `500Mi` or `1.5G`.
/// Fractional byte counts round up.
///
/// # Errors
///
/// Returns an error for malformed quantities.
pub fn parse_capacity_to_bytes(capacity: &str) -> Result<i64> {
    let re = Regex::new(r"^([0-9]+(?:\.[0-9]+)?)(Ki|Mi|Gi|Ti|Pi|Ei|k|K|M|G|T|P|E)?$")
        .context("invalid quantity pattern")?;
    let caps = re
        .captures(capacity.trim())
        .ok_or_else(|| anyhow!("invalid capacity quantity: {capacity:?}"))?;
    let number: f64 = caps[1]
        .parse()
        .with_context(|| format!("invalid number in {capacity:?}"))?;
    let multiplier: f64 = match caps.get(2).map(|m| m.as_str()) {
        None => 1.0,
        Some("Ki") => 1024.0,
        Some("Mi") => 1024f64.powi(2),
        Some("Gi") => 1024f64.powi(3),
        Some("Ti") => 1024f64.powi(4),
        Some("Pi") => 1024f64.powi(5),
        Some("Ei") => 1024f64.powi(6),
        Some("k" | "K") => 1e3,
        Some("M") => 1e6,
        Some("G") => 1e9,
        Some("T") => 1e12,
        Some("P") => 1e15,
        Some("E") => 1e18,
        Some(other) => bail!("unsupported suffix {other:?}"),
    };
    #[allow(clippy::cast_possible_truncation)]
    Ok((number * multiplier).ceil() as i64)
}

/// Whether dotted version `a` is strictly above `b`, for example
/// `4.14 > 4.9`.
///
/// # Errors
///
/// Returns an error when a component is not a number or the versions have a
/// different number of components.
pub fn version_is_above(a: &str, b: &str) -> Result<bool> {
    let parse = |v: &str| -> Result<Vec<u64>> {
        v.split('.')
            .map(|part| {
                part.parse::<u64>()
                    .with_context(|| format!("invalid version component {part:?} in {v:?}"))
            })
            .collect()
    };
    let (va, vb) = (parse(a)?, parse(b)?);
    if va.len() != vb.len() {
        bail!("cannot compare {a:?} with {b:?}: different component counts");
    }
    Ok(va > vb)
}

/// Elements of `b` that occur exactly once in `a`, in `b`'s order.
#[must_use]
pub fn slice_intersect(a: &[&str], b: &[String]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for item in a {
        *seen.entry(*item).or_default() += 1;
    }
    b.iter()
        .filter(|item| seen.get(item.as_str()) == Some(&1))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_capacity_to_bytes("1Gi").unwrap(), 1_073_741_824);
        assert_eq!(parse_capacity_to_bytes("500Mi").unwrap(), 524_288_000);
        assert_eq!(parse_capacity_to_bytes("2Ki").unwrap(), 2048);
    }

    #[test]
    fn test_parse_decimal_and_plain() {
        assert_eq!(parse_capacity_to_bytes("1.5G").unwrap(), 1_500_000_000);
        assert_eq!(parse_capacity_to_bytes("128974848").unwrap(), 128_974_848);
        assert_eq!(parse_capacity_to_bytes("1k").unwrap(), 1000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_capacity_to_bytes("Gi").is_err());
        assert!(parse_capacity_to_bytes("5 apples").is_err());
    }

    #[test]
    fn test_version_is_above() {
        assert!(version_is_above("4.14", "4.9").unwrap());
        assert!(!version_is_above("4.9", "4.9").unwrap());
        assert!(!version_is_above("1.30", "1.31").unwrap());
        assert!(version_is_above("4.14", "4.14.1").is_err());
    }

    #[test]
    fn test_slice_intersect_keeps_b_order() {
        let supported = ["ebs.csi.aws.com", "efs.csi.aws.com", "disk.csi.azure.com"];
        let installed = vec![
            "efs.csi.aws.com".to_string(),
            "ebs.csi.aws.com".to_string(),
            "csi.vsphere.vmware.com".to_string(),
        ];
        assert_eq!(
            slice_intersect(&supported, &installed),
            vec!["efs.csi.aws.com", "ebs.csi.aws.com"]
        );
    }
}
