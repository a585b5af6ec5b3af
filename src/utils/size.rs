//! Human-readable byte sizes (`512M`, `2G`, `1.5G`).

use crate::error::{IsolatorError, Result};

const UNITS: [(char, u64); 5] = [
    ('B', 1),
    ('K', 1024),
    ('M', 1024 * 1024),
    ('G', 1024 * 1024 * 1024),
    ('T', 1024 * 1024 * 1024 * 1024),
];

/// Parses a size string with a binary unit suffix into bytes.
///
/// A bare number is taken as bytes. Fractional values are allowed (`1.5G`).
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || IsolatorError::InvalidOverride(format!("invalid size '{input}'"));

    let last = trimmed.chars().last().ok_or_else(invalid)?;
    let (number, multiplier) = if last.is_ascii_digit() {
        (trimmed, 1)
    } else {
        let unit = last.to_ascii_uppercase();
        let (_, multiplier) = UNITS
            .iter()
            .find(|(symbol, _)| *symbol == unit)
            .ok_or_else(invalid)?;
        (&trimmed[..trimmed.len() - last.len_utf8()], *multiplier)
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid());
    }

    let bytes = value * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// Formats a byte count using the largest unit that divides it exactly.
pub fn format_size(bytes: u64) -> String {
    UNITS
        .iter()
        .rev()
        .find(|(_, multiplier)| bytes >= *multiplier && bytes % multiplier == 0)
        .map(|(symbol, multiplier)| match symbol {
            'B' => bytes.to_string(),
            _ => format!("{}{}", bytes / multiplier, symbol),
        })
        .unwrap_or_else(|| bytes.to_string())
}
