//! Storage quantity parsing and target volume sizing.
//!
//! Volume capacities arrive as Kubernetes quantity strings ("10Gi", "512M",
//! "1073741824"). Target volumes are sized in bytes and written back in
//! binary-SI form.

use crate::Error;

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Extra bytes reserved when the target keeps or switches into block mode
pub const BLOCK_OVERHEAD_BYTES: u64 = 8 * 1024 * 1024;

/// Parse a storage quantity into bytes.
///
/// Accepts binary suffixes (Ki..Ei), decimal suffixes (k..E) and bare byte
/// counts. Fractional values are only accepted with a suffix ("1.5Gi").
pub fn parse_bytes(quantity: &str) -> Result<u64, Error> {
    let quantity = quantity.trim();
    let invalid = || Error::validation(format!("invalid storage quantity: {quantity:?}"));

    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, mult)| quantity.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((quantity, 1));

    if number.is_empty() {
        return Err(invalid());
    }

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }

    if multiplier == 1 {
        return Err(invalid());
    }
    let fractional: f64 = number.parse().map_err(|_| invalid())?;
    if !fractional.is_finite() || fractional < 0.0 {
        return Err(invalid());
    }
    Ok((fractional * multiplier as f64).ceil() as u64)
}

/// Render bytes as the largest exact binary-SI quantity ("10Gi", "8Mi", "1000").
pub fn format_bytes(bytes: u64) -> String {
    BINARY_SUFFIXES
        .iter()
        .rev()
        .find(|(_, mult)| bytes >= *mult && bytes % mult == 0)
        .map(|(suffix, mult)| format!("{}{}", bytes / mult, suffix))
        .unwrap_or_else(|| bytes.to_string())
}

/// Volume mode of a persistent volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeMode {
    /// Raw block device
    Block,
    /// Formatted filesystem
    Filesystem,
}

impl VolumeMode {
    /// Parse the Kubernetes `volumeMode` field; absent means Filesystem
    pub fn from_spec(mode: Option<&str>) -> Self {
        match mode {
            Some("Block") => Self::Block,
            _ => Self::Filesystem,
        }
    }

    /// Kubernetes API string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "Block",
            Self::Filesystem => "Filesystem",
        }
    }
}

/// Compute the size of a migration target volume.
///
/// The provisioned capacity wins when the backend over-allocated the source.
/// Otherwise the current capacity is padded for the mode change: filesystem
/// metadata costs ~1% going block→filesystem, nothing going filesystem→block,
/// and a fixed 8Mi otherwise.
pub fn target_size(
    capacity: u64,
    provisioned: Option<u64>,
    source_mode: Option<VolumeMode>,
    target_mode: VolumeMode,
) -> u64 {
    if let Some(real) = provisioned {
        if real > capacity {
            return real;
        }
    }

    match (source_mode, target_mode) {
        (Some(VolumeMode::Block), VolumeMode::Filesystem) => capacity + capacity / 100,
        (Some(VolumeMode::Filesystem), VolumeMode::Block) => capacity,
        _ => capacity + BLOCK_OVERHEAD_BYTES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GI: u64 = 1 << 30;

    #[test]
    fn parses_common_quantities() {
        assert_eq!(parse_bytes("10Gi").unwrap(), 10 * GI);
        assert_eq!(parse_bytes("512Mi").unwrap(), 512 << 20);
        assert_eq!(parse_bytes("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_bytes("4096").unwrap(), 4096);
        assert_eq!(parse_bytes(" 1.5Gi ").unwrap(), GI + GI / 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("Gi").is_err());
        assert!(parse_bytes("ten").is_err());
        assert!(parse_bytes("1.5").is_err());
        assert!(parse_bytes("-1Gi").is_err());
    }

    #[test]
    fn formats_exact_binary_units() {
        assert_eq!(format_bytes(10 * GI), "10Gi");
        assert_eq!(format_bytes(10 * GI + BLOCK_OVERHEAD_BYTES), "10248Mi");
        assert_eq!(format_bytes(1000), "1000");
    }

    #[test]
    fn provisioned_capacity_wins_when_larger() {
        let size = target_size(10 * GI, Some(12 * GI), None, VolumeMode::Block);
        assert_eq!(size, 12 * GI);
    }

    #[test]
    fn block_to_filesystem_adds_one_percent() {
        let size = target_size(
            100 * GI,
            None,
            Some(VolumeMode::Block),
            VolumeMode::Filesystem,
        );
        assert_eq!(size, 101 * GI);
    }

    #[test]
    fn filesystem_to_block_needs_no_overhead() {
        let size = target_size(
            10 * GI,
            Some(GI),
            Some(VolumeMode::Filesystem),
            VolumeMode::Block,
        );
        assert_eq!(size, 10 * GI);
    }

    #[test]
    fn same_mode_adds_block_overhead() {
        let size = target_size(10 * GI, None, Some(VolumeMode::Block), VolumeMode::Block);
        assert_eq!(size, 10 * GI + BLOCK_OVERHEAD_BYTES);
        let unknown_source = target_size(10 * GI, None, None, VolumeMode::Filesystem);
        assert_eq!(unknown_source, 10 * GI + BLOCK_OVERHEAD_BYTES);
    }
}
