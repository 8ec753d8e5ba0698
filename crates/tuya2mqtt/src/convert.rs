//! Conversion between raw device ranges and MQTT-facing percentages.
//!
//! Both directions round half-to-even. Results are not clamped: a raw reading
//! above `max` reports more than 100%.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("invalid configuration: maximum raw value must be positive, got {max}")]
    InvalidConfiguration { max: u32 },
}

/// Convert a raw device value in `[0, max]` to a percentage.
pub fn raw_to_percent(raw: i64, max: u32) -> Result<i64, ConversionError> {
    if max == 0 {
        return Err(ConversionError::InvalidConfiguration { max });
    }

    Ok((raw as f64 / f64::from(max) * 100.0).round_ties_even() as i64)
}

/// Convert a percentage back to a raw device value in `[0, max]`.
pub fn percent_to_raw(percent: f64, max: u32) -> Result<i64, ConversionError> {
    if max == 0 {
        return Err(ConversionError::InvalidConfiguration { max });
    }

    Ok((percent / 100.0 * f64::from(max)).round_ties_even() as i64)
}
