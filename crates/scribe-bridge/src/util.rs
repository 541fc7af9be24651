// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions for parsing configuration values.

use crate::errors::ConfigError;

/// Parses a size string into a number of bytes.
///
/// Accepts a plain integer or an integer followed by one of the binary
/// suffixes `k`, `m`, `g`, `t` (case-insensitive). Whitespace is trimmed.
///
/// # Examples
///
/// ```
/// use scribe_bridge::util::parse_size;
///
/// assert_eq!(parse_size("1024").unwrap(), 1024);
/// assert_eq!(parse_size("32m").unwrap(), 32 * 1024 * 1024);
/// assert!(parse_size("lots").is_err());
/// ```
pub fn parse_size(value: &str) -> Result<usize, ConfigError> {
    let trimmed = value.trim();
    let invalid = || ConfigError::InvalidSize(value.to_string());

    let Some(last) = trimmed.chars().last() else {
        return Err(invalid());
    };

    let (digits, multiplier) = match last.to_ascii_lowercase() {
        'k' => (&trimmed[..trimmed.len() - 1], 1usize << 10),
        'm' => (&trimmed[..trimmed.len() - 1], 1usize << 20),
        'g' => (&trimmed[..trimmed.len() - 1], 1usize << 30),
        't' => (&trimmed[..trimmed.len() - 1], 1usize << 40),
        _ => (trimmed, 1),
    };

    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)
}

/// Parses a boolean flag the way the configuration surface spells them.
pub fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
