//! # Validation Module
//!
//! Input validation for names that end up in broker key expressions and for
//! configuration values.
//!
//! ## Why Site Names Are Restricted
//! ```text
//! canopy/{site}/up/telemetry
//!        ^^^^^^
//!        one key-expression chunk: no '/', and none of the
//!        zenoh wildcard/verbatim characters  * $ ? #
//! ```
//!
//! ## Usage
//! ```rust
//! use canopy_core::validation::{validate_site_name, parse_fire_time};
//!
//! assert!(validate_site_name("north-field-02").is_ok());
//! assert!(validate_site_name("north/field").is_err());
//! assert_eq!(parse_fire_time("00:05").unwrap().to_string(), "00:05:00");
//! ```

use chrono::NaiveTime;

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted site or channel name.
pub const MAX_NAME_LEN: usize = 64;

// =============================================================================
// Name Validators
// =============================================================================

fn validate_chunk(field: &str, value: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only ASCII letters, digits, hyphens, and underscores"
                .to_string(),
        });
    }

    Ok(())
}

/// Validates a broker-addressable site name.
///
/// ## Rules
/// - 1 to 64 characters
/// - ASCII letters, digits, `-` and `_` only
pub fn validate_site_name(name: &str) -> ValidationResult<()> {
    validate_chunk("site name", name)
}

/// Validates an actuator channel name (same alphabet as site names).
pub fn validate_channel_name(name: &str) -> ValidationResult<()> {
    validate_chunk("channel", name)
}

// =============================================================================
// Time & Retention Validators
// =============================================================================

/// Parses a daily fire time in `HH:MM` form.
pub fn parse_fire_time(value: &str) -> ValidationResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| {
        ValidationError::InvalidFormat {
            field: "fire_at".to_string(),
            reason: format!("expected HH:MM ({e})"),
        }
    })
}

/// Validates retention windows.
///
/// ## Rules
/// - Detail data is kept at least 1 day
/// - Alarms are kept at least as long as detail data
pub fn validate_retention(detail_days: u32, alarm_days: u32) -> ValidationResult<()> {
    if detail_days == 0 {
        return Err(ValidationError::OutOfRange {
            field: "detail_days".to_string(),
            min: 1,
            max: i64::from(u32::MAX),
        });
    }

    if alarm_days < detail_days {
        return Err(ValidationError::OutOfRange {
            field: "alarm_days".to_string(),
            min: i64::from(detail_days),
            max: i64::from(u32::MAX),
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_site_name() {
        assert!(validate_site_name("farm-01").is_ok());
        assert!(validate_site_name("Greenhouse_B").is_ok());
        assert!(validate_site_name("").is_err());
        assert!(validate_site_name("a/b").is_err());
        assert!(validate_site_name("farm*").is_err());
        assert!(validate_site_name("$farm").is_err());
        assert!(validate_site_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_parse_fire_time() {
        assert_eq!(
            parse_fire_time("00:05").unwrap(),
            NaiveTime::from_hms_opt(0, 5, 0).unwrap()
        );
        assert_eq!(
            parse_fire_time(" 23:59 ").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 0).unwrap()
        );
        assert!(parse_fire_time("24:00").is_err());
        assert!(parse_fire_time("5 past midnight").is_err());
    }

    #[test]
    fn test_validate_retention() {
        assert!(validate_retention(30, 90).is_ok());
        assert!(validate_retention(30, 30).is_ok());
        assert!(validate_retention(0, 90).is_err());
        assert!(validate_retention(30, 7).is_err());
    }
}
