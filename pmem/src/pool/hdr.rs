/// The on-disk pool header.
///
/// Every headered part reserves 8 KiB at offset 0; only the first 4 KiB are
/// defined and checksummed. All integer fields are little-endian on disk.
use core::mem::{offset_of, size_of};

use static_assertions::const_assert_eq;

use crate::error::{fail, Error, Result};
use crate::util;

pub const POOL_HDR_SIG_LEN: usize = 8;

/// On-disk space reserved for the header in each headered part.
pub const POOL_HDR_SIZE: usize = 8192;

/// Defined, checksummed portion of the header.
pub const POOL_HDR_LEN: usize = 4096;

const CHECKSUM_OFF: usize = 4088;
const RESERVED_LEN: usize = 4040;

#[repr(C)]
#[derive(Clone)]
pub struct PoolHdr {
    /// ASCII tag identifying the pool kind, null-padded.
    pub signature: [u8; POOL_HDR_SIG_LEN],
    /// Format version; 0 means uninitialized.
    pub major: u32,
    pub compat_features: u32,
    pub incompat_features: u32,
    pub ro_compat_features: u32,
    /// Pool identity, shared by every part and replica.
    pub uuid: [u8; 16],
    /// Creation time, seconds since the epoch.
    pub crtime: u64,
    reserved: [u8; RESERVED_LEN],
    /// Fletcher64 over the header with this slot treated as zero.
    pub checksum: u64,
}

const_assert_eq!(size_of::<PoolHdr>(), POOL_HDR_LEN);
const_assert_eq!(offset_of!(PoolHdr, signature), 0);
const_assert_eq!(offset_of!(PoolHdr, major), 8);
const_assert_eq!(offset_of!(PoolHdr, compat_features), 12);
const_assert_eq!(offset_of!(PoolHdr, incompat_features), 16);
const_assert_eq!(offset_of!(PoolHdr, ro_compat_features), 20);
const_assert_eq!(offset_of!(PoolHdr, uuid), 24);
const_assert_eq!(offset_of!(PoolHdr, crtime), 40);
const_assert_eq!(offset_of!(PoolHdr, checksum), CHECKSUM_OFF);

/// The identity a caller expects of a pool: its signature, the format
/// version this library writes, and the feature bits it understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAttr {
    pub signature: [u8; POOL_HDR_SIG_LEN],
    pub major: u32,
    pub compat_features: u32,
    pub incompat_features: u32,
    pub ro_compat_features: u32,
}

impl PoolAttr {
    /// Attr for the given signature string (null-padded, at most 8 bytes)
    /// at format version 1 with no feature bits.
    pub fn new(signature: &str) -> Result<PoolAttr> {
        let bytes = signature.as_bytes();
        if bytes.is_empty() || bytes.len() > POOL_HDR_SIG_LEN {
            fail!(Error::InvalidArgument, "bad pool signature \"{}\"", signature);
        }
        let mut sig = [0u8; POOL_HDR_SIG_LEN];
        sig[..bytes.len()].copy_from_slice(bytes);
        Ok(PoolAttr {
            signature: sig,
            major: 1,
            compat_features: 0,
            incompat_features: 0,
            ro_compat_features: 0,
        })
    }
}

/// Result of validating a stored header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrInfo {
    pub uuid: [u8; 16],
    pub crtime: u64,
    pub compat_features: u32,
    pub incompat_features: u32,
    pub ro_compat_features: u32,
    /// Unsupported ro_compat bits were present; open read-only.
    pub read_only: bool,
}

impl PoolHdr {
    pub fn new(attr: &PoolAttr, uuid: [u8; 16], crtime: u64) -> PoolHdr {
        PoolHdr {
            signature: attr.signature,
            major: attr.major,
            compat_features: attr.compat_features,
            incompat_features: attr.incompat_features,
            ro_compat_features: attr.ro_compat_features,
            uuid,
            crtime,
            reserved: [0; RESERVED_LEN],
            checksum: 0,
        }
    }

    /// Serialize to the on-disk image with the checksum inserted.
    pub fn encode(&self) -> [u8; POOL_HDR_LEN] {
        let mut buf = [0u8; POOL_HDR_LEN];
        buf[0..8].copy_from_slice(&self.signature);
        buf[8..12].copy_from_slice(&self.major.to_le_bytes());
        buf[12..16].copy_from_slice(&self.compat_features.to_le_bytes());
        buf[16..20].copy_from_slice(&self.incompat_features.to_le_bytes());
        buf[20..24].copy_from_slice(&self.ro_compat_features.to_le_bytes());
        buf[24..40].copy_from_slice(&self.uuid);
        buf[40..48].copy_from_slice(&self.crtime.to_le_bytes());
        util::checksum(&mut buf, CHECKSUM_OFF, true);
        buf
    }

    /// Validate a stored header image against the expected identity.
    ///
    /// Order of checks: truncation, zero major, checksum, signature,
    /// version, features. Unknown incompat bits fail the open; unknown
    /// ro_compat bits force read-only; unknown compat bits are ignored.
    pub fn validate(image: &[u8], attr: &PoolAttr) -> Result<HdrInfo> {
        if image.len() < POOL_HDR_LEN {
            fail!(Error::InvalidHeader, "truncated pool header ({} bytes)", image.len());
        }
        let image = &image[..POOL_HDR_LEN];

        let field_u32 =
            |off: usize| u32::from_le_bytes(image[off..off + 4].try_into().unwrap());

        let major = field_u32(8);
        if major == 0 {
            fail!(Error::InvalidHeader, "invalid major version (0)");
        }

        let mut copy = [0u8; POOL_HDR_LEN];
        copy.copy_from_slice(image);
        if !util::checksum(&mut copy, CHECKSUM_OFF, false) {
            fail!(Error::InvalidHeader, "invalid checksum of pool header");
        }

        let mut signature = [0u8; POOL_HDR_SIG_LEN];
        signature.copy_from_slice(&image[0..8]);
        if signature != attr.signature {
            fail!(
                Error::WrongType,
                "wrong pool type: \"{}\" (expected \"{}\")",
                String::from_utf8_lossy(&signature),
                String::from_utf8_lossy(&attr.signature)
            );
        }

        if major != attr.major {
            fail!(
                Error::VersionMismatch,
                "pool format major version {} not supported (library supports {})",
                major,
                attr.major
            );
        }

        let compat_features = field_u32(12);
        let incompat_features = field_u32(16);
        let ro_compat_features = field_u32(20);

        let unknown_incompat = incompat_features & !attr.incompat_features;
        if unknown_incompat != 0 {
            fail!(
                Error::UnsupportedIncompat,
                "unsafe to continue due to unknown incompat features: {:#x}",
                unknown_incompat
            );
        }

        let mut read_only = false;
        let unknown_ro = ro_compat_features & !attr.ro_compat_features;
        if unknown_ro != 0 {
            log::warn!(
                "switching to read-only mode due to unknown ro_compat features: {:#x}",
                unknown_ro
            );
            read_only = true;
        }

        let unknown_compat = compat_features & !attr.compat_features;
        if unknown_compat != 0 {
            log::info!("ignoring unknown compat features: {:#x}", unknown_compat);
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&image[24..40]);
        let crtime = u64::from_le_bytes(image[40..48].try_into().unwrap());

        Ok(HdrInfo {
            uuid,
            crtime,
            compat_features,
            incompat_features,
            ro_compat_features,
            read_only,
        })
    }
}
