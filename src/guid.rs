//! GUIDs as they cross the boundary.
//!
//! The engine passes `GUID*` in native field order (`u32`, `u16`, `u16`,
//! `[u8; 8]`).  On the Rust side every identity is a [`uuid::Uuid`]; the two
//! convert losslessly through `from_fields` / `as_fields`.

use uuid::Uuid;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl From<Uuid> for Guid {
    fn from(u: Uuid) -> Self {
        let (data1, data2, data3, data4) = u.as_fields();
        Guid { data1, data2, data3, data4: *data4 }
    }
}

impl From<Guid> for Uuid {
    fn from(g: Guid) -> Self {
        Uuid::from_fields(g.data1, g.data2, g.data3, &g.data4)
    }
}

impl Guid {
    /// Read a GUID out of a 16-byte binary property (class ids are reported
    /// that way by `GetHandlerProperty2`).
    pub fn from_native_bytes(b: &[u8]) -> Option<Guid> {
        if b.len() != 16 {
            return None;
        }
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&b[8..16]);
        Some(Guid {
            data1: u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            data2: u16::from_ne_bytes([b[4], b[5]]),
            data3: u16::from_ne_bytes([b[6], b[7]]),
            data4,
        })
    }
}

// ── Interface ids ───────────────────────────────────────────────────────────
//
// Every engine interface id has the shape 23170F69-40C1-278A-0000-000gg0ii0000
// (group `gg`, interface `ii`).  `IUnknown` is the COM constant.

pub const IID_IUNKNOWN: Uuid = Uuid::from_u128(0x00000000_0000_0000_C000_000000000046);

pub const IID_IPROGRESS:                       Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000000050000);
pub const IID_ISEQUENTIAL_IN_STREAM:           Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000300010000);
pub const IID_ISEQUENTIAL_OUT_STREAM:          Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000300020000);
pub const IID_IIN_STREAM:                      Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000300030000);
pub const IID_IOUT_STREAM:                     Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000300040000);
pub const IID_ICOMPRESS_CODECS_INFO:           Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000400600000);
pub const IID_IHASHERS:                        Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000400C10000);
pub const IID_IARCHIVE_OPEN_CALLBACK:          Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000600100000);
pub const IID_IARCHIVE_OPEN_VOLUME_CALLBACK:   Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000600300000);
pub const IID_IARCHIVE_EXTRACT_CALLBACK:       Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000600200000);
pub const IID_IARCHIVE_EXTRACT_CALLBACK_MSG:   Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000600210000);
pub const IID_IIN_ARCHIVE:                     Uuid = Uuid::from_u128(0x23170F69_40C1_278A_0000_000600600000);
