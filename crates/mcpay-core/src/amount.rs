//! Rendering a token's smallest unit as a human-readable amount.
//!
//! Integer-only: no `f64` anywhere, amounts are carried as decimal strings.

use crate::error::McpayError;

/// Largest number of decimals supported (`10^38` still fits in a `u128`).
const MAX_DECIMALS: u32 = 38;

/// Convert a raw amount in the smallest unit to a decimal string.
///
/// `format_units("100", 6)` is `"0.0001"`; trailing zeros are trimmed.
pub fn format_units(raw: &str, decimals: u32) -> Result<String, McpayError> {
    if decimals > MAX_DECIMALS {
        return Err(McpayError::InvalidAmount(format!(
            "unsupported decimals: {decimals}"
        )));
    }
    let units: u128 = raw
        .trim()
        .parse()
        .map_err(|e| McpayError::InvalidAmount(format!("'{raw}': {e}")))?;
    if decimals == 0 {
        return Ok(units.to_string());
    }
    let multiplier = 10u128.pow(decimals);
    let whole = units / multiplier;
    let fraction = units % multiplier;
    let raw = format!("{}.{:0width$}", whole, fraction, width = decimals as usize);
    let trimmed = raw.trim_end_matches('0').trim_end_matches('.');
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_units() {
        assert_eq!(format_units("100", 6).unwrap(), "0.0001");
        assert_eq!(format_units("1000000", 6).unwrap(), "1");
        assert_eq!(format_units("1500000", 6).unwrap(), "1.5");
        assert_eq!(format_units("0", 6).unwrap(), "0");
        assert_eq!(format_units("42", 0).unwrap(), "42");
    }

    #[test]
    fn test_format_units_rejects_garbage() {
        assert!(format_units("abc", 6).is_err());
        assert!(format_units("-5", 6).is_err());
        assert!(format_units("1", 39).is_err());
    }

    #[test]
    fn test_large_amounts_survive_conversion() {
        // 10^19 does not fit in i64
        let raw = "10000000000000000000";
        let human = format_units(raw, 18).unwrap();
        assert_eq!(human, "10");
        assert_eq!(format_units("10000000000000000001", 18).unwrap(), "10.000000000000000001");
    }
}
