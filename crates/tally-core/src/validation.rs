//! # Validation Module
//!
//! Input checks applied at every boundary: device registration, cart
//! administration, and inbound scan events.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Phone review screen ──► ScanEvent ──► channel ──► decode + validate    │
//! │                                                        │                │
//! │                                    invalid? ──► log + drop (no ack)     │
//! │                                                        │                │
//! │                                                        ▼                │
//! │                                               Scan Event Router         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::{MAX_ITEM_QUANTITY, MAX_NAME_LENGTH};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest scan code accepted from a device.
pub const MAX_CODE_LENGTH: usize = 128;

fn validate_name(field: &str, value: &str) -> ValidationResult<String> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > MAX_NAME_LENGTH {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NAME_LENGTH,
        });
    }

    Ok(value.to_string())
}

/// Validates a device name and returns it trimmed.
///
/// ```rust
/// use tally_core::validation::validate_device_name;
///
/// assert_eq!(validate_device_name("  Phone A ").unwrap(), "Phone A");
/// assert!(validate_device_name("   ").is_err());
/// ```
pub fn validate_device_name(name: &str) -> ValidationResult<String> {
    validate_name("device name", name)
}

/// Validates a cart name and returns it trimmed.
pub fn validate_cart_name(name: &str) -> ValidationResult<String> {
    validate_name("cart name", name)
}

/// Validates a scanned code.
///
/// ## Rules
/// - Must not be empty after trimming
/// - At most 128 characters
pub fn validate_code(code: &str) -> ValidationResult<()> {
    let code = code.trim();

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "code".to_string(),
        });
    }

    if code.len() > MAX_CODE_LENGTH {
        return Err(ValidationError::TooLong {
            field: "code".to_string(),
            max: MAX_CODE_LENGTH,
        });
    }

    Ok(())
}

/// Validates a scan quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY (999)
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a device identifier.
///
/// Devices generate UUID v4 identities; anything else is refused so a typo
/// in a config file cannot impersonate another phone's topic.
pub fn validate_device_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "device_id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: "device_id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_names() {
        assert_eq!(validate_cart_name(" Mostrador ").unwrap(), "Mostrador");
        assert!(validate_cart_name("").is_err());
        assert!(validate_device_name(&"x".repeat(61)).is_err());
        assert!(validate_device_name(&"x".repeat(60)).is_ok());
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code("1042").is_ok());
        assert!(validate_code("  ").is_err());
        assert!(validate_code(&"9".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(999).is_ok());

        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(1000).is_err());
    }

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("phone-a").is_err());
    }
}
