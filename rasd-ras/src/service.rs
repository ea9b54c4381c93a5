//! Ranging Service attribute table.
//!
//! The GATT table of the service is fixed, so it is declared as data: the
//! host stack registers the primary service and its characteristics from
//! [`service_table`] and routes attribute callbacks back into the RRSP core.

use bytes::BufMut;

/// Characteristic property bits, mirroring the GATT characteristic
/// properties field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties(u8);

impl Properties {
    pub const READ: Properties = Properties(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Properties = Properties(0x04);
    pub const NOTIFY: Properties = Properties(0x10);
    pub const INDICATE: Properties = Properties(0x20);

    pub const fn union(self, other: Properties) -> Properties {
        Properties(self.0 | other.0)
    }

    pub const fn contains(self, other: Properties) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Attribute permissions of a characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// No access on the value attribute (gated by the CCC descriptor only).
    None,
    ReadEncrypt,
    WriteEncrypt,
}

/// One characteristic declaration of the Ranging Service.
#[derive(Debug, Clone, Copy)]
pub struct CharacteristicDef {
    pub uuid: u16,
    pub properties: Properties,
    pub permission: Permission,
    /// Whether a Client Characteristic Configuration descriptor follows.
    pub ccc: bool,
}

/// RAS Features bits.
const FEAT_REALTIME_RD: u32 = 1 << 0;

/// Characteristic declarations, in attribute order.
///
/// The Real-time Ranging Data characteristic is only declared when the
/// feature is enabled; the on-demand transfer set is always present.
pub fn service_table(realtime_rd: bool) -> Vec<CharacteristicDef> {
    let mut table = vec![CharacteristicDef {
        uuid: crate::RAS_FEATURES_UUID,
        properties: Properties::READ,
        permission: Permission::ReadEncrypt,
        ccc: false,
    }];

    if realtime_rd {
        table.push(CharacteristicDef {
            uuid: crate::RAS_REALTIME_RD_UUID,
            properties: Properties::NOTIFY.union(Properties::INDICATE),
            permission: Permission::None,
            ccc: true,
        });
    }

    table.extend([
        CharacteristicDef {
            uuid: crate::RAS_ONDEMAND_RD_UUID,
            properties: Properties::NOTIFY.union(Properties::INDICATE),
            permission: Permission::None,
            ccc: true,
        },
        CharacteristicDef {
            uuid: crate::RAS_CP_UUID,
            properties: Properties::WRITE_WITHOUT_RESPONSE.union(Properties::INDICATE),
            permission: Permission::WriteEncrypt,
            ccc: true,
        },
        CharacteristicDef {
            uuid: crate::RAS_RD_READY_UUID,
            properties: Properties::READ
                .union(Properties::NOTIFY)
                .union(Properties::INDICATE),
            permission: Permission::ReadEncrypt,
            ccc: true,
        },
        CharacteristicDef {
            uuid: crate::RAS_RD_OVERWRITTEN_UUID,
            properties: Properties::READ
                .union(Properties::NOTIFY)
                .union(Properties::INDICATE),
            permission: Permission::ReadEncrypt,
            ccc: true,
        },
    ]);

    table
}

/// RAS Features bitmap value.
///
/// Bit 0 advertises real-time ranging data; the retrieve-lost-segments,
/// abort and filter bits stay clear because the control point rejects those
/// opcodes.
pub fn features_bitmap(realtime_rd: bool) -> u32 {
    let mut features = 0;
    if realtime_rd {
        features |= FEAT_REALTIME_RD;
    }
    features
}

/// Encoded value of the RAS Features characteristic, served on read.
pub fn encode_features<B: BufMut>(realtime_rd: bool, buf: &mut B) {
    buf.put_u32_le(features_bitmap(realtime_rd));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_without_realtime() {
        let table = service_table(false);
        let uuids: Vec<u16> = table.iter().map(|def| def.uuid).collect();
        assert_eq!(uuids, vec![0x2c14, 0x2c16, 0x2c17, 0x2c18, 0x2c19]);
    }

    #[test]
    fn test_table_with_realtime() {
        let table = service_table(true);
        assert!(table.iter().any(|def| def.uuid == 0x2c15));
    }

    #[test]
    fn test_control_point_declaration() {
        let table = service_table(false);
        let cp = table.iter().find(|def| def.uuid == 0x2c17).unwrap();
        assert!(cp.properties.contains(Properties::WRITE_WITHOUT_RESPONSE));
        assert!(cp.properties.contains(Properties::INDICATE));
        assert!(!cp.properties.contains(Properties::READ));
        assert_eq!(cp.permission, Permission::WriteEncrypt);
        assert!(cp.ccc);
    }

    #[test]
    fn test_features_value() {
        let mut buf = Vec::new();
        encode_features(false, &mut buf);
        assert_eq!(buf, vec![0, 0, 0, 0]);

        buf.clear();
        encode_features(true, &mut buf);
        assert_eq!(buf, vec![1, 0, 0, 0]);
    }
}
