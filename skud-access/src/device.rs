//! Devices as seen by the access core
//!
//! Device CRUD belongs to the device-management collaborator. The core only
//! needs a device's class and its two identity-lock fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of device classes
///
/// Behaviour that differs between classes is expressed as a capability
/// method here, never as a class comparison at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Door controller / badge reader
    #[serde(rename = "skud")]
    AccessControl,
    #[serde(rename = "gateway")]
    Gateway,
    #[serde(rename = "mesh_node")]
    MeshNode,
    #[serde(rename = "simple_device")]
    Simple,
}

impl DeviceClass {
    /// Protected requests must echo a one-time challenge
    pub fn requires_challenge(&self) -> bool {
        matches!(self, DeviceClass::AccessControl)
    }

    /// DESFire cards must present their rotating token
    pub fn requires_card_token(&self) -> bool {
        matches!(self, DeviceClass::AccessControl)
    }

    /// Hardware identity is pinned and checked on every request
    pub fn hardware_locked(&self) -> bool {
        matches!(self, DeviceClass::AccessControl)
    }

    /// Cards may be linked to this device
    pub fn accepts_cards(&self) -> bool {
        matches!(self, DeviceClass::AccessControl)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::AccessControl => "skud",
            DeviceClass::Gateway => "gateway",
            DeviceClass::MeshNode => "mesh_node",
            DeviceClass::Simple => "simple_device",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of a device record the access core reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub class: DeviceClass,
    /// Confirmed hardware identifier
    #[serde(default)]
    pub chip_id: Option<String>,
    /// Identifier seen but not yet confirmed by an operator
    #[serde(default)]
    pub pending_chip_id: Option<String>,
}

impl Device {
    pub fn new(name: &str, class: DeviceClass) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            class,
            chip_id: None,
            pending_chip_id: None,
        }
    }
}
