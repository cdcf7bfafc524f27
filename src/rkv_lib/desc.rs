/// On-disk layout descriptors: store header, database registry,
/// skip-list node blocks (SBLK), key-value payload blocks (KVBLK),
/// flag sets and the error taxonomy.
///
/// All multi-byte integers on disk are little-endian, except stored
/// keys of integer-key databases which are big-endian so that
/// lexicographic order equals numeric order.
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;

/*
 * Store file magic and version
 */
pub const RKV_MAGIC: [u8; 8] = *b"RKVDB\r\n1";
pub const RKV_VERSION: u8 = 1;

/*
 * Engine limits
 */
pub const MAX_LEVEL: usize = 24          /* Skip-list level cap */;
pub const KVBLK_MAX: usize = 63          /* KV slots per payload block */;
pub const SBLK_SIZE: u64 = 512           /* Node block size, fixed */;
pub const SBLK_LKLEN: usize = 116        /* First-key prefix bytes kept in a node */;
pub const KVBLK_SZPOW_MIN: u8 = 10       /* Smallest payload block: 1 KiB */;
pub const KVBLK_SZPOW_MAX: u8 = 29       /* Largest payload block: 512 MiB */;
pub const KVBLK_CLASSES: usize = (KVBLK_SZPOW_MAX - KVBLK_SZPOW_MIN + 1) as usize;
pub const MAX_KVSZ: u64 = 0xFFF_FFFF     /* key+value cap: 256 MiB - 1 */;
pub const REG_SLOTS: usize = 64          /* Database registry capacity */;

/*
 * Header layout (block 0). Data blocks start at max(psize, 4096).
 */
pub const HDR_MAGIC_OFF: u64 = 0x00;
pub const HDR_VERSION_OFF: u64 = 0x08;
pub const HDR_PSIZE_OFF: u64 = 0x0c;
pub const HDR_MAXDBID_OFF: u64 = 0x10;
pub const HDR_DEND_OFF: u64 = 0x18;
pub const HDR_REG_OFF: u64 = 0x20;
pub const REG_SLOT_SIZE: u64 = 32;
pub const HDR_FREE_KV_OFF: u64 = HDR_REG_OFF + REG_SLOTS as u64 * REG_SLOT_SIZE;
pub const HDR_FREE_SBLK_OFF: u64 = HDR_FREE_KV_OFF + KVBLK_CLASSES as u64 * 8;
pub const HDR_END: u64 = HDR_FREE_SBLK_OFF + 8;

pub const KVBLK_HDR_SIZE: u64 = 16 + KVBLK_MAX as u64 * 12;

/*
 * Database flags (closed set)
 */
pub const DBF_UINT32_KEYS: u32 = 0x01  /* Keys are 4-byte big-endian integers */;
pub const DBF_UINT64_KEYS: u32 = 0x02  /* Keys are 8-byte big-endian integers */;
pub const DBF_DUP_U32_VALS: u32 = 0x04 /* Values are sorted u32 arrays */;
pub const DBF_DUP_U64_VALS: u32 = 0x08 /* Values are sorted u64 arrays */;
pub const DBF_ALL: u32 = 0x0f;

/*
 * Store open flags
 */
pub const OF_NOLOCKS: u32 = 0x01 /* Skip engine/database locking, single thread only */;
pub const OF_RDONLY: u32 = 0x02  /* Reject mutating calls */;
pub const OF_TRUNC: u32 = 0x04   /* Drop existing file content on open */;

/*
 * Put / cursor-set flags
 */
pub const PF_NO_OVERWRITE: u32 = 0x01 /* Fail with KeyExists on present key */;
pub const PF_DUP_REMOVE: u32 = 0x02   /* Remove the element, duplicate-array modes */;
pub const PF_SYNC: u32 = 0x04         /* Flush after the operation */;

/*
 * SBLK flags
 */
pub const SBLK_F_HEAD: u8 = 0x01 /* Per-database sentinel node, holds no entries */;

/// Store header as materialised at offset 0.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct StoreHdr {
    pub magic: [u8; 8],  /* 000 */
    pub version: u8,     /* 008 */
    pub pad0: [u8; 3],
    pub psize: Le32,     /* 00c page size at creation */
    pub maxdbid: Le32,   /* 010 highest database id ever created */
    pub pad1: [u8; 4],
    pub dend: Le64,      /* 018 allocation high-water mark */
}

/// One database registry slot. `dbid == 0` marks a free slot.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct RegSlot {
    pub dbid: Le32,
    pub flags: Le32,
    pub root: Le64,  /* head SBLK offset */
    pub seed: Le64,  /* level-coin RNG seed */
    pub atime: Le64, /* last access, ms since epoch */
}

/// KVBLK directory entry. `klen == 0` marks a free or tombstoned slot.
/// `off` is relative to the payload area; key bytes are immediately
/// followed by value bytes.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct KvpDisk {
    pub off: Le32,
    pub klen: Le32,
    pub vlen: Le32,
}

/// KVBLK block header, directory included.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct KvblkHdr {
    pub szpow: u8, /* block size is 1 << szpow */
    pub flags: u8,
    pub pad0: [u8; 2],
    pub used: Le32,  /* payload high-water mark */
    pub holes: Le32, /* tombstoned payload bytes */
    pub pad1: [u8; 4],
    pub dir: [KvpDisk; KVBLK_MAX],
}

/*
 * SBLK on-disk layout (fixed 512 bytes, parsed by hand in sblk.rs):
 *
 *   000 level u8    001 lkl u8    002 pnum u8    003 flags u8
 *   004 fkl   u32   (full first-key length)
 *   008 p0    u64   (level-0 back pointer, 0 = head)
 *   010 kvblk u64   (payload block offset, 0 for the head sentinel)
 *   018 fwd   u64 * 24
 *   0d8 pi    u8  * 63  (directory indices in ascending key order)
 *   117 lk    u8  * 116 (first-key prefix for fence comparisons)
 *   18b pad to 512
 */
pub const SBLK_FKL_OFF: usize = 0x04;
pub const SBLK_P0_OFF: usize = 0x08;
pub const SBLK_KVBLK_OFF: usize = 0x10;
pub const SBLK_FWD_OFF: usize = 0x18;
pub const SBLK_PI_OFF: usize = 0xd8;
pub const SBLK_LK_OFF: usize = 0x117;

/// Stable numeric error codes exposed to embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    NotFound = 75001,
    KeyExists = 75002,
    MaxKvSize = 75003,
    Corrupted = 75004,
    DupValueSize = 75005,
    KeyNumValueSize = 75006,
    IncompatibleDbMode = 75007,
    Readonly = 75008,
    InvalidState = 75009,
    Threading = 75010,
    Io = 75011,
    MaxOff = 75012,
    MmapOverlap = 75013,
    NotMmaped = 75014,
    ResizePolicyFail = 75015,
    NotAligned = 75016,
    OutOfBounds = 75017,
    FileClosed = 75018,
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    KeyExists,
    #[error("key/value size exceeds the 256 MiB record limit")]
    MaxKvSize,
    #[error("store corrupted: {0}")]
    Corrupted(&'static str),
    #[error("duplicate-array element width mismatch")]
    DupValueSize,
    #[error("key length does not match the database key width")]
    KeyNumValueSize,
    #[error("database exists with a different flag set")]
    IncompatibleDbMode,
    #[error("store is read-only")]
    Readonly,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("lock subsystem failure")]
    Threading,
    #[error(transparent)]
    Exf(#[from] extfile::ExfError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KvError>;

impl KvError {
    /// Map any error to its stable numeric code.
    pub fn code(&self) -> ErrorCode {
        use extfile::ExfError;
        match self {
            KvError::NotFound => ErrorCode::NotFound,
            KvError::KeyExists => ErrorCode::KeyExists,
            KvError::MaxKvSize => ErrorCode::MaxKvSize,
            KvError::Corrupted(_) => ErrorCode::Corrupted,
            KvError::DupValueSize => ErrorCode::DupValueSize,
            KvError::KeyNumValueSize => ErrorCode::KeyNumValueSize,
            KvError::IncompatibleDbMode => ErrorCode::IncompatibleDbMode,
            KvError::Readonly => ErrorCode::Readonly,
            KvError::InvalidState(_) => ErrorCode::InvalidState,
            KvError::Threading => ErrorCode::Threading,
            KvError::Io(_) => ErrorCode::Io,
            KvError::Exf(err) => match err {
                ExfError::Io(_) => ErrorCode::Io,
                ExfError::NotAligned => ErrorCode::NotAligned,
                ExfError::MmapOverlap => ErrorCode::MmapOverlap,
                ExfError::NotMmaped => ErrorCode::NotMmaped,
                ExfError::ResizePolicyFail => ErrorCode::ResizePolicyFail,
                ExfError::MaxOff => ErrorCode::MaxOff,
                ExfError::OutOfBounds => ErrorCode::OutOfBounds,
                ExfError::InvalidState => ErrorCode::InvalidState,
                ExfError::Closed => ErrorCode::FileClosed,
            },
        }
    }
}

/// Key validation against the database key mode.
pub fn check_key(flags: u32, key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::InvalidState("empty key"));
    }
    if flags & DBF_UINT32_KEYS != 0 && key.len() != 4 {
        return Err(KvError::KeyNumValueSize);
    }
    if flags & DBF_UINT64_KEYS != 0 && key.len() != 8 {
        return Err(KvError::KeyNumValueSize);
    }
    Ok(())
}

/// Record size validation: key plus value must stay under 256 MiB.
pub fn check_kv_size(klen: usize, vlen: usize) -> Result<()> {
    if klen as u64 + vlen as u64 > MAX_KVSZ {
        return Err(KvError::MaxKvSize);
    }
    Ok(())
}

/// Validate a database flag set: only known bits, widths exclusive.
pub fn check_db_flags(flags: u32) -> Result<()> {
    if flags & !DBF_ALL != 0 {
        return Err(KvError::InvalidState("unknown database flags"));
    }
    if flags & DBF_UINT32_KEYS != 0 && flags & DBF_UINT64_KEYS != 0 {
        return Err(KvError::InvalidState("conflicting key width flags"));
    }
    if flags & DBF_DUP_U32_VALS != 0 && flags & DBF_DUP_U64_VALS != 0 {
        return Err(KvError::InvalidState("conflicting value width flags"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn disk_struct_sizes() {
        assert_eq!(size_of::<StoreHdr>(), 0x20);
        assert_eq!(size_of::<RegSlot>(), REG_SLOT_SIZE as usize);
        assert_eq!(size_of::<KvpDisk>(), 12);
        assert_eq!(size_of::<KvblkHdr>(), KVBLK_HDR_SIZE as usize);
        assert_eq!(HDR_FREE_KV_OFF, 0x820);
        assert_eq!(HDR_FREE_SBLK_OFF, 0x8c0);
        assert!(HDR_END <= 4096);
    }

    #[test]
    fn key_checks() {
        assert!(check_key(0, b"k").is_ok());
        assert!(matches!(
            check_key(0, b""),
            Err(KvError::InvalidState(_))
        ));
        assert!(check_key(DBF_UINT32_KEYS, &1u32.to_be_bytes()).is_ok());
        assert!(matches!(
            check_key(DBF_UINT32_KEYS, b"abc"),
            Err(KvError::KeyNumValueSize)
        ));
        assert!(matches!(
            check_key(DBF_UINT64_KEYS, &1u32.to_be_bytes()),
            Err(KvError::KeyNumValueSize)
        ));
    }

    #[test]
    fn kv_size_boundary() {
        assert!(check_kv_size(4, (MAX_KVSZ - 4) as usize).is_ok());
        assert!(matches!(
            check_kv_size(4, MAX_KVSZ as usize - 3),
            Err(KvError::MaxKvSize)
        ));
    }

    #[test]
    fn db_flag_sets() {
        assert!(check_db_flags(DBF_UINT32_KEYS | DBF_DUP_U64_VALS).is_ok());
        assert!(check_db_flags(DBF_UINT32_KEYS | DBF_UINT64_KEYS).is_err());
        assert!(check_db_flags(DBF_DUP_U32_VALS | DBF_DUP_U64_VALS).is_err());
        assert!(check_db_flags(0x100).is_err());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(u32::from(ErrorCode::NotFound), 75001);
        assert_eq!(KvError::NotFound.code(), ErrorCode::NotFound);
        let code: ErrorCode = 75004u32.try_into().unwrap();
        assert_eq!(code, ErrorCode::Corrupted);
        assert_eq!(
            KvError::Exf(extfile::ExfError::MaxOff).code(),
            ErrorCode::MaxOff
        );
    }
}
