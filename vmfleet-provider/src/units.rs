//! Human-readable size parsing and formatting.

use humansize::{format_size, BINARY};

use crate::error::{ProviderError, Result};

const MB: u64 = 1024 * 1024;

/// Minimum size of a freshly allocated local volume.
pub const MIN_VOLUME_SIZE: u64 = MB;

/// Parse sizes like `"512M"`, `"2G"`, `"1.5g"`, `"4096"` (bytes) into bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::InvalidConfig("empty size".to_string()));
    }

    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    let multiplier: u64 = match suffix.to_ascii_lowercase().trim_end_matches(&['b', 'i'][..]) {
        "" => 1,
        "k" => 1024,
        "m" => MB,
        "g" => 1024 * MB,
        "t" => 1024 * 1024 * MB,
        _ => {
            return Err(ProviderError::InvalidConfig(format!(
                "invalid size suffix in {:?}",
                input
            )))
        }
    };

    let value: f64 = number.trim().parse().map_err(|_| {
        ProviderError::InvalidConfig(format!("invalid size {:?}", input))
    })?;
    if value < 0.0 {
        return Err(ProviderError::InvalidConfig(format!("negative size {:?}", input)));
    }

    Ok((value * multiplier as f64) as u64)
}

/// Format a byte count for tables and wire messages.
pub fn human_size(bytes: u64) -> String {
    format_size(bytes, BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("512M").unwrap(), 512 * MB);
        assert_eq!(parse_size("2g").unwrap(), 2048 * MB);
        assert_eq!(parse_size("1GiB").unwrap(), 1024 * MB);
        assert_eq!(parse_size("1.5G").unwrap(), 1536 * MB);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(MB), "1 MiB");
    }
}
