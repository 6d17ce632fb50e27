//! Identity Lock
//!
//! Pins a reader's credential to the hardware it first showed up on. Until
//! an operator confirms an identifier the lock only records what it sees;
//! once confirmed, any other identifier is treated as cloned electronics.

use std::sync::Arc;

use log::{info, warn};
use uuid::Uuid;

use crate::device::Device;
use crate::error::AccessError;
use crate::events::{EventSink, HardwareIdAction, LiveEvent};
use crate::store::{DeviceRegistry, StoreError};

/// Treatment of requests that carry no hardware identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPolicy {
    /// Let them through, flagged as suspicious (older firmware)
    #[default]
    Lenient,
    /// Reject them once the device has a confirmed identifier
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityVerdict {
    /// Device class is not hardware-locked
    Exempt,
    /// Presented identifier equals the confirmed one
    Confirmed,
    /// No confirmed identifier yet; `updated` if the pending slot changed
    PendingConfirmation { updated: bool },
    /// No header, allowed under the lenient policy
    Unverified,
    /// No header on a confirmed device under the strict policy
    MissingHeader,
    CloneDetected { presented: String },
}

impl IdentityVerdict {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, IdentityVerdict::MissingHeader | IdentityVerdict::CloneDetected { .. })
    }

    /// Worth an operator's attention even if allowed
    pub fn is_suspicious(&self) -> bool {
        !matches!(
            self,
            IdentityVerdict::Exempt | IdentityVerdict::Confirmed | IdentityVerdict::PendingConfirmation { .. }
        )
    }
}

pub struct IdentityLock {
    registry: Arc<dyn DeviceRegistry>,
    events: Arc<dyn EventSink>,
    policy: IdentityPolicy,
}

impl IdentityLock {
    pub fn new(registry: Arc<dyn DeviceRegistry>, events: Arc<dyn EventSink>, policy: IdentityPolicy) -> Self {
        Self { registry, events, policy }
    }

    pub fn policy(&self) -> IdentityPolicy {
        self.policy
    }

    /// Check the hardware identifier presented with a request
    pub fn check(&self, device: &Device, presented: Option<&str>) -> Result<IdentityVerdict, StoreError> {
        if !device.class.hardware_locked() {
            return Ok(IdentityVerdict::Exempt);
        }

        // Compared byte for byte; only an empty value counts as absent
        let presented = presented.filter(|id| !id.is_empty());
        let Some(presented) = presented else {
            if device.chip_id.is_some() && self.policy == IdentityPolicy::Strict {
                warn!("Device {} sent no hardware id, rejected", device.id);
                return Ok(IdentityVerdict::MissingHeader);
            }
            warn!("Device {} sent no hardware id", device.id);
            return Ok(IdentityVerdict::Unverified);
        };

        match &device.chip_id {
            Some(confirmed) if confirmed == presented => Ok(IdentityVerdict::Confirmed),
            Some(_) => {
                warn!("Hardware id mismatch on device {}: possible clone", device.id);
                Ok(IdentityVerdict::CloneDetected { presented: presented.to_string() })
            }
            None => {
                if device.pending_chip_id.as_deref() == Some(presented) {
                    return Ok(IdentityVerdict::PendingConfirmation { updated: false });
                }
                self.registry.set_pending_chip_id(device.id, presented)?;
                info!("Device {} awaiting hardware id confirmation", device.id);
                self.events.publish(LiveEvent::HardwareIdPending {
                    device_id: device.id,
                    hardware_id: presented.to_string(),
                });
                Ok(IdentityVerdict::PendingConfirmation { updated: true })
            }
        }
    }

    /// Operator action: promote the pending identifier
    pub fn confirm(&self, device_id: Uuid) -> Result<String, AccessError> {
        let confirmed = self
            .registry
            .confirm_chip_id(device_id)?
            .ok_or(AccessError::NotFound("pending hardware id"))?;
        info!("Hardware id confirmed for device {}", device_id);
        self.changed(device_id, HardwareIdAction::Confirmed);
        Ok(confirmed)
    }

    pub fn reject_pending(&self, device_id: Uuid) -> Result<(), AccessError> {
        self.registry.reject_pending_chip_id(device_id)?;
        info!("Pending hardware id rejected for device {}", device_id);
        self.changed(device_id, HardwareIdAction::Rejected);
        Ok(())
    }

    /// Forget both identifiers, for a replaced reader
    pub fn clear(&self, device_id: Uuid) -> Result<(), AccessError> {
        self.registry.clear_chip_id(device_id)?;
        info!("Hardware id cleared for device {}", device_id);
        self.changed(device_id, HardwareIdAction::Cleared);
        Ok(())
    }

    fn changed(&self, device_id: Uuid, action: HardwareIdAction) {
        self.events.publish(LiveEvent::HardwareIdChanged { device_id, action });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceClass;
    use crate::events::EventHub;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        hub: Arc<EventHub>,
        lock: IdentityLock,
        device_id: Uuid,
    }

    fn fixture(policy: IdentityPolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(EventHub::new());
        let device = Device::new("Door", DeviceClass::AccessControl);
        let device_id = device.id;
        store.upsert_device(device);
        let lock = IdentityLock::new(store.clone(), hub.clone(), policy);
        Fixture { store, hub, lock, device_id }
    }

    impl Fixture {
        fn present(&self, id: Option<&str>) -> IdentityVerdict {
            let device = self.store.device(self.device_id).unwrap().unwrap();
            self.lock.check(&device, id).unwrap()
        }
    }

    #[test]
    fn test_transition_pending_then_clone() {
        let f = fixture(IdentityPolicy::Lenient);
        let events = f.hub.subscribe();

        assert_eq!(f.present(Some("A")), IdentityVerdict::PendingConfirmation { updated: true });
        assert_eq!(f.present(Some("A")), IdentityVerdict::PendingConfirmation { updated: false });
        assert_eq!(f.present(Some("B")), IdentityVerdict::PendingConfirmation { updated: true });
        assert_eq!(
            f.store.device(f.device_id).unwrap().unwrap().pending_chip_id.as_deref(),
            Some("B")
        );
        assert_eq!(events.try_iter().count(), 2);

        // Operator saw A on the label and re-pins it
        f.store.set_pending_chip_id(f.device_id, "A").unwrap();
        assert_eq!(f.lock.confirm(f.device_id).unwrap(), "A");

        assert_eq!(f.present(Some("A")), IdentityVerdict::Confirmed);
        let verdict = f.present(Some("B"));
        assert_eq!(verdict, IdentityVerdict::CloneDetected { presented: "B".into() });
        assert!(!verdict.is_allowed());
    }

    #[test]
    fn test_missing_header_lenient() {
        let f = fixture(IdentityPolicy::Lenient);
        f.present(Some("A"));
        f.lock.confirm(f.device_id).unwrap();

        let verdict = f.present(None);
        assert_eq!(verdict, IdentityVerdict::Unverified);
        assert!(verdict.is_allowed());
        assert!(verdict.is_suspicious());
        assert_eq!(f.present(Some("")), IdentityVerdict::Unverified);
    }

    #[test]
    fn test_hardware_id_compared_exactly() {
        let f = fixture(IdentityPolicy::Lenient);
        f.present(Some("CHIP-A"));
        f.lock.confirm(f.device_id).unwrap();

        assert_eq!(f.present(Some("CHIP-A")), IdentityVerdict::Confirmed);
        for padded in [" CHIP-A", "CHIP-A\n", "chip-a"] {
            assert_eq!(
                f.present(Some(padded)),
                IdentityVerdict::CloneDetected { presented: padded.into() }
            );
        }
        assert_eq!(f.present(Some("  ")), IdentityVerdict::CloneDetected { presented: "  ".into() });
    }

    #[test]
    fn test_missing_header_strict() {
        let f = fixture(IdentityPolicy::Strict);
        // Onboarding still allowed
        assert_eq!(f.present(None), IdentityVerdict::Unverified);

        f.present(Some("A"));
        f.lock.confirm(f.device_id).unwrap();
        assert_eq!(f.present(None), IdentityVerdict::MissingHeader);
        assert_eq!(f.present(Some("")), IdentityVerdict::MissingHeader);
    }

    #[test]
    fn test_confirm_without_pending() {
        let f = fixture(IdentityPolicy::Lenient);
        assert!(matches!(
            f.lock.confirm(f.device_id),
            Err(AccessError::NotFound("pending hardware id"))
        ));
    }

    #[test]
    fn test_reject_and_clear() {
        let f = fixture(IdentityPolicy::Lenient);
        f.present(Some("A"));
        f.lock.reject_pending(f.device_id).unwrap();
        assert!(f.store.device(f.device_id).unwrap().unwrap().pending_chip_id.is_none());

        f.present(Some("B"));
        f.lock.confirm(f.device_id).unwrap();
        f.lock.clear(f.device_id).unwrap();
        assert_eq!(f.present(Some("C")), IdentityVerdict::PendingConfirmation { updated: true });
    }

    #[test]
    fn test_other_classes_exempt() {
        let f = fixture(IdentityPolicy::Strict);
        let gateway = Device::new("Gateway", DeviceClass::Gateway);
        assert_eq!(f.lock.check(&gateway, Some("X")).unwrap(), IdentityVerdict::Exempt);
        assert_eq!(f.lock.check(&gateway, None).unwrap(), IdentityVerdict::Exempt);
    }
}
