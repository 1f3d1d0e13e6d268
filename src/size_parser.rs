//! Byte-size string parsing
//!
//! Supports both decimal (KB, MB, GB) and binary (KiB, MiB, GiB) suffixes,
//! case-insensitive, with fractional values like "1.5GB".

use anyhow::{anyhow, Result};

/// Parse a size string into bytes.
///
/// Examples:
/// - "1MiB" → 1,048,576
/// - "512KB" → 512,000
/// - "1.5GB" → 1,500,000,000
/// - "4096" → 4,096
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(anyhow!("empty size string"));
    }

    let (number_part, suffix) = split_number_suffix(input);
    if number_part.is_empty() {
        return Err(anyhow!("no number found in size string: {}", input));
    }

    let value: f64 = number_part
        .parse()
        .map_err(|_| anyhow!("invalid number: {}", number_part))?;
    if value < 0.0 {
        return Err(anyhow!("size cannot be negative: {}", input));
    }

    let multiplier = parse_suffix(suffix)?;
    Ok((value * multiplier as f64).round() as u64)
}

/// Split input at the first character that is neither a digit nor a dot.
fn split_number_suffix(input: &str) -> (&str, &str) {
    match input.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(i) => (&input[..i], &input[i..]),
        None => (input, ""),
    }
}

fn parse_suffix(suffix: &str) -> Result<u64> {
    match suffix.trim().to_uppercase().as_str() {
        "" | "B" => Ok(1),
        "K" | "KB" => Ok(1_000),
        "KI" | "KIB" => Ok(1_024),
        "M" | "MB" => Ok(1_000_000),
        "MI" | "MIB" => Ok(1_048_576),
        "G" | "GB" => Ok(1_000_000_000),
        "GI" | "GIB" => Ok(1_073_741_824),
        _ => Err(anyhow!(
            "unknown size suffix: {}. Supported: B, K/KB/KiB, M/MB/MiB, G/GB/GiB",
            suffix
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_numbers() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1048576").unwrap(), 1048576);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_unit_table() {
        assert_eq!(parse_size("1B").unwrap(), 1);
        assert_eq!(parse_size("1K").unwrap(), 1_000);
        assert_eq!(parse_size("1KB").unwrap(), 1_000);
        assert_eq!(parse_size("1Ki").unwrap(), 1_024);
        assert_eq!(parse_size("1KiB").unwrap(), 1_024);
        assert_eq!(parse_size("1M").unwrap(), 1_000_000);
        assert_eq!(parse_size("1MB").unwrap(), 1_000_000);
        assert_eq!(parse_size("1Mi").unwrap(), 1_048_576);
        assert_eq!(parse_size("1MiB").unwrap(), 1_048_576);
        assert_eq!(parse_size("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1Gi").unwrap(), 1_073_741_824);
        assert_eq!(parse_size("1GiB").unwrap(), 1_073_741_824);
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(parse_size("1mib").unwrap(), 1_048_576);
        assert_eq!(parse_size("1MIB").unwrap(), 1_048_576);
        assert_eq!(parse_size("8mb").unwrap(), 8_000_000);
        assert_eq!(parse_size("1gib").unwrap(), 1_073_741_824);
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_size("1.5MB").unwrap(), 1_500_000);
        assert_eq!(parse_size("0.5GB").unwrap(), 500_000_000);
        assert_eq!(parse_size("2.5MiB").unwrap(), 2_621_440);
    }

    #[test]
    fn test_parse_whitespace() {
        assert_eq!(parse_size("  8MB  ").unwrap(), 8_000_000);
        assert_eq!(parse_size(" 1.5GiB ").unwrap(), 1_610_612_736);
    }

    #[test]
    fn test_errors() {
        assert!(parse_size("").is_err());
        assert!(parse_size("   ").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("-1MB").is_err());
        assert!(parse_size("1XB").is_err());
        assert!(parse_size("1TB").is_err());
        assert!(parse_size("abc").is_err());
    }
}
