//! # Paired Devices
//!
//! A device is a mobile scanner known to the terminal. Its status decides
//! whether it may push scans.
//!
//! ## Approval State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   register ──► ┌─────────┐  approve   ┌──────────┐   block   ┌────────┐ │
//! │                │ Pending │ ─────────► │ Approved │ ────────► │Blocked │ │
//! │                └─────────┘            └──────────┘ ◄──────── └────────┘ │
//! │                                                      unblock            │
//! │                                                                         │
//! │   any state ── delete ──► (gone; the device must register again)       │
//! │                                                                         │
//! │   Re-applying the current state is a no-op. Everything else is         │
//! │   rejected with CoreError::InvalidTransition and changes nothing.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Device Status
// =============================================================================

/// Approval state of a paired device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DeviceStatus {
    /// Registered, waiting for an administrator.
    Pending,
    /// Allowed to push scans.
    Approved,
    /// Refused by an administrator; scanning halts.
    Blocked,
}

impl DeviceStatus {
    /// Resolves an administrator action against this status.
    ///
    /// | action \ status | Pending    | Approved   | Blocked    |
    /// |-----------------|------------|------------|------------|
    /// | approve         | → Approved | no-op      | rejected   |
    /// | block           | rejected   | → Blocked  | no-op      |
    /// | unblock         | rejected   | no-op      | → Approved |
    pub fn apply(self, action: DeviceAction) -> CoreResult<Transition> {
        use DeviceAction::*;
        use DeviceStatus::*;

        let to = match (action, self) {
            (Approve, Pending) => Approved,
            (Approve, Approved) => return Ok(Transition::Unchanged(self)),
            (Block, Approved) => Blocked,
            (Block, Blocked) => return Ok(Transition::Unchanged(self)),
            (Unblock, Blocked) => Approved,
            (Unblock, Approved) => return Ok(Transition::Unchanged(self)),
            (action, current) => {
                return Err(CoreError::InvalidTransition { action, current });
            }
        };

        Ok(Transition::Changed { from: self, to })
    }

    /// Returns true if a device in this status may push scans.
    pub fn can_scan(&self) -> bool {
        matches!(self, DeviceStatus::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Approved => "approved",
            DeviceStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Actions & Transitions
// =============================================================================

/// An administrator action on a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DeviceAction {
    Approve,
    Block,
    Unblock,
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAction::Approve => write!(f, "approve"),
            DeviceAction::Block => write!(f, "block"),
            DeviceAction::Unblock => write!(f, "unblock"),
        }
    }
}

/// Outcome of a valid action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status flipped.
    Changed { from: DeviceStatus, to: DeviceStatus },
    /// The device was already in the requested state.
    Unchanged(DeviceStatus),
}

impl Transition {
    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }

    /// Status after the transition.
    pub fn status(&self) -> DeviceStatus {
        match self {
            Transition::Changed { to, .. } => *to,
            Transition::Unchanged(status) => *status,
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// A device record as stored by the terminal and pushed to the device.
///
/// Wire shape: `{ device_id, name, status, last_active, registered_at }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Device {
    /// Client-generated identifier, immutable for the device's lifetime.
    pub device_id: String,

    /// Name shown to the administrator and stamped on scans.
    pub name: String,

    pub status: DeviceStatus,

    /// Last heartbeat (or registration) time.
    #[ts(as = "String")]
    pub last_active: DateTime<Utc>,

    #[ts(as = "String")]
    pub registered_at: DateTime<Utc>,
}

impl Device {
    /// Creates a freshly registered device in `Pending`.
    pub fn register(device_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Device {
            device_id: device_id.into(),
            name: name.into(),
            status: DeviceStatus::Pending,
            last_active: now,
            registered_at: now,
        }
    }

    /// Applies an administrator action, mutating the status only on success.
    pub fn apply(&mut self, action: DeviceAction) -> CoreResult<Transition> {
        let transition = self.status.apply(action)?;
        self.status = transition.status();
        Ok(transition)
    }

    /// Topic on which this device receives its own status pushes.
    pub fn topic(&self) -> String {
        device_topic(&self.device_id)
    }
}

/// Per-device topic name: `device_<deviceId>`.
pub fn device_topic(device_id: &str) -> String {
    format!("device_{}", device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_starts_pending() {
        let device = Device::register("dev-1", "Phone A");
        assert_eq!(device.status, DeviceStatus::Pending);
        assert_eq!(device.topic(), "device_dev-1");
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut device = Device::register("dev-1", "Phone A");

        let t = device.apply(DeviceAction::Approve).unwrap();
        assert_eq!(
            t,
            Transition::Changed {
                from: DeviceStatus::Pending,
                to: DeviceStatus::Approved
            }
        );

        device.apply(DeviceAction::Block).unwrap();
        assert_eq!(device.status, DeviceStatus::Blocked);

        device.apply(DeviceAction::Unblock).unwrap();
        assert_eq!(device.status, DeviceStatus::Approved);
    }

    #[test]
    fn test_reapplying_current_state_is_noop() {
        assert_eq!(
            DeviceStatus::Approved.apply(DeviceAction::Approve).unwrap(),
            Transition::Unchanged(DeviceStatus::Approved)
        );
        assert_eq!(
            DeviceStatus::Blocked.apply(DeviceAction::Block).unwrap(),
            Transition::Unchanged(DeviceStatus::Blocked)
        );
        assert!(!DeviceStatus::Approved
            .apply(DeviceAction::Unblock)
            .unwrap()
            .is_changed());
    }

    #[test]
    fn test_invalid_transitions_leave_state_alone() {
        let mut pending = Device::register("dev-1", "Phone A");
        assert!(pending.apply(DeviceAction::Block).is_err());
        assert!(pending.apply(DeviceAction::Unblock).is_err());
        assert_eq!(pending.status, DeviceStatus::Pending);

        let mut blocked = Device::register("dev-2", "Phone B");
        blocked.status = DeviceStatus::Blocked;
        let err = blocked.apply(DeviceAction::Approve).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                action: DeviceAction::Approve,
                current: DeviceStatus::Blocked
            }
        ));
        assert_eq!(blocked.status, DeviceStatus::Blocked);
    }

    #[test]
    fn test_wire_shape() {
        let device = Device::register("dev-1", "Phone A");
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["device_id"], "dev-1");
        assert_eq!(json["status"], "pending");
        assert!(json.get("last_active").is_some());
    }
}
