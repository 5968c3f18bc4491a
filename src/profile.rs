use std::fmt;
use uuid::Uuid;

use crate::{
    platform::{DiscoveredServices, WriteKind},
    VARIANT_A_NOTIFY_CHAR_UUID, VARIANT_A_SERVICE_UUID, VARIANT_A_WRITE_CHAR_UUID,
    VARIANT_B_NOTIFY_CHAR_UUID, VARIANT_B_SERVICE_UUID, VARIANT_B_WRITE_CHAR_UUID,
};

/// Known control-module families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleVariant {
    /// Vendor service `FEE9` with a 128-bit characteristic pair
    A,
    /// Serial-style service `FFF0` with `FFF1`/`FFF2` characteristics
    B,
}

impl fmt::Display for ModuleVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// UUID triad used to talk to one connected module
///
/// Resolved once after service discovery and passed explicitly to every
/// write and subscribe for that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceProfile {
    /// Primary service
    pub service: Uuid,
    /// Characteristic commands are written to
    pub write: Uuid,
    /// Characteristic responses are notified on
    pub notify: Uuid,
    /// Module family
    pub variant: ModuleVariant,
}

impl ServiceProfile {
    /// Profile for a module family
    #[must_use]
    pub const fn for_variant(variant: ModuleVariant) -> Self {
        match variant {
            ModuleVariant::A => Self {
                service: VARIANT_A_SERVICE_UUID,
                write: VARIANT_A_WRITE_CHAR_UUID,
                notify: VARIANT_A_NOTIFY_CHAR_UUID,
                variant,
            },
            ModuleVariant::B => Self {
                service: VARIANT_B_SERVICE_UUID,
                write: VARIANT_B_WRITE_CHAR_UUID,
                notify: VARIANT_B_NOTIFY_CHAR_UUID,
                variant,
            },
        }
    }

    /// Pick the profile matching a discovered service set
    ///
    /// Variant B is chosen when its service is present; everything else is
    /// treated as variant A.
    #[must_use]
    pub fn resolve(services: &[Uuid]) -> Self {
        if services.contains(&VARIANT_B_SERVICE_UUID) {
            Self::for_variant(ModuleVariant::B)
        } else {
            Self::for_variant(ModuleVariant::A)
        }
    }

    /// Whether `discovered` exposes this triad with unacknowledged writes on
    /// the write characteristic and notify or indicate on the notify one
    ///
    /// A platform that reports no characteristics is taken at its word.
    #[must_use]
    pub fn supported_by(&self, discovered: &DiscoveredServices) -> bool {
        if discovered.characteristics.is_empty() {
            return true;
        }

        let writable = discovered
            .characteristic(self.service, self.write)
            .is_some_and(|c| {
                matches!(
                    c.properties.write_kind(),
                    Some(WriteKind::WithoutResponse | WriteKind::Both)
                )
            });
        let notifying = discovered
            .characteristic(self.service, self.notify)
            .is_some_and(|c| c.properties.can_subscribe());

        writable && notifying
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_parsing() {
        let parsed = Uuid::parse_str("0000fee9-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(parsed, VARIANT_A_SERVICE_UUID);

        let parsed = Uuid::parse_str("D44BC439-ABFD-45A2-B575-925416129601").unwrap();
        assert_eq!(parsed, VARIANT_A_WRITE_CHAR_UUID);

        let parsed = Uuid::parse_str("0000FFF1-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(parsed, VARIANT_B_NOTIFY_CHAR_UUID);
    }

    #[test]
    fn test_resolve_variant_b_when_fff0_present() {
        let generic_access = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5F9B_34FB);
        let profile = ServiceProfile::resolve(&[generic_access, VARIANT_B_SERVICE_UUID]);

        assert_eq!(profile.variant, ModuleVariant::B);
        assert_eq!(profile.service, VARIANT_B_SERVICE_UUID);
        assert_eq!(profile.write, VARIANT_B_WRITE_CHAR_UUID);
        assert_eq!(profile.notify, VARIANT_B_NOTIFY_CHAR_UUID);
    }

    #[test]
    fn test_resolve_defaults_to_variant_a() {
        let profile = ServiceProfile::resolve(&[VARIANT_A_SERVICE_UUID]);
        assert_eq!(profile.variant, ModuleVariant::A);
        assert_eq!(profile.notify, VARIANT_A_NOTIFY_CHAR_UUID);

        let profile = ServiceProfile::resolve(&[]);
        assert_eq!(profile, ServiceProfile::for_variant(ModuleVariant::A));
    }

    #[test]
    fn test_supported_by_checks_triad_operations() {
        use crate::{
            platform::{CharacteristicInfo, CharacteristicProperties},
            testing::module_characteristics,
            types::PeripheralHandle,
        };

        let services = vec![VARIANT_B_SERVICE_UUID];
        let mut discovered = DiscoveredServices {
            peripheral: PeripheralHandle::new("A1:B2:C3:D4:E5:F6", None, 0),
            characteristics: module_characteristics(&services),
            services,
        };
        let profile = ServiceProfile::resolve(&discovered.services);
        assert!(profile.supported_by(&discovered));

        // Acknowledged writes only
        for c in &mut discovered.characteristics {
            if c.uuid == VARIANT_B_WRITE_CHAR_UUID {
                c.properties = CharacteristicProperties {
                    write: true,
                    ..CharacteristicProperties::default()
                };
            }
        }
        assert!(!profile.supported_by(&discovered));

        discovered.characteristics = vec![CharacteristicInfo {
            service: VARIANT_B_SERVICE_UUID,
            uuid: VARIANT_B_WRITE_CHAR_UUID,
            properties: CharacteristicProperties {
                write_without_response: true,
                ..CharacteristicProperties::default()
            },
        }];
        assert!(!profile.supported_by(&discovered));

        discovered.characteristics.clear();
        assert!(profile.supported_by(&discovered));
    }
}
