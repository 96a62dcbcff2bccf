//! Journal record model and wire layout.
//!
//! ## Record Format
//!
//! Every record is exactly [`ENTRY_SIZE`] bytes, little-endian, with
//! all unused bytes zero:
//!
//! ```text
//! | kind (1) | pad (3) | tx_size (4) | staging_id (8) |
//! | rtype (1) | pad (7) | target index (8) | xattr (64) | pad (32) |
//! ```
//!
//! The record size divides the hole-punching block size evenly, so a
//! punched journal prefix is always a whole number of records.
//!
//! ## Transaction Chaining
//!
//! Records of one transaction are contiguous and carry a strictly
//! descending `tx_size`: the number of records remaining in the
//! transaction, including the current one. The last record of a
//! transaction has `tx_size == 1`. Recovery walks this chain to
//! distinguish complete transactions from torn writes; any break in
//! the descending sequence discards the remainder of the journal.
//!
//! Two properties are load-bearing: kind byte `0` is never valid, so
//! an all-zero record (a punched region or the zeroed tail of the
//! file) can never be mistaken for data; and `tx_size == 0` always
//! breaks the chain.

use tarn_blob::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr, XATTR_LEN};

/// Size in bytes of one journal record on disk.
pub const ENTRY_SIZE: usize = 128;

/// The operation a journal record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A new object was created from staged content.
    CreateObject = 1,
    /// An existing object's content and attributes were replaced.
    UpdateObject = 2,
    /// An existing object's attributes were replaced.
    UpdateXattr = 3,
    /// An object was removed.
    DeleteObject = 4,
    /// A new recoverable temporary was created from staged content.
    CreateTemporary = 5,
    /// A recoverable temporary's content and attributes were replaced.
    UpdateTemporary = 6,
    /// A recoverable temporary's attributes were replaced.
    UpdateTemporaryXattr = 7,
    /// A recoverable temporary was removed.
    DeleteTemporary = 8,
}

impl EntryKind {
    /// Converts a byte to an entry kind. Zero is reserved.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::CreateObject),
            2 => Some(Self::UpdateObject),
            3 => Some(Self::UpdateXattr),
            4 => Some(Self::DeleteObject),
            5 => Some(Self::CreateTemporary),
            6 => Some(Self::UpdateTemporary),
            7 => Some(Self::UpdateTemporaryXattr),
            8 => Some(Self::DeleteTemporary),
            _ => None,
        }
    }

    /// Converts the entry kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this kind targets a durable object (as opposed to a
    /// recoverable temporary).
    #[must_use]
    pub const fn targets_object(self) -> bool {
        matches!(
            self,
            Self::CreateObject | Self::UpdateObject | Self::UpdateXattr | Self::DeleteObject
        )
    }

    /// Whether a record of this kind references staged content.
    #[must_use]
    pub const fn carries_content(self) -> bool {
        matches!(
            self,
            Self::CreateObject | Self::UpdateObject | Self::CreateTemporary | Self::UpdateTemporary
        )
    }
}

/// What a journal record applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTarget {
    /// A durable object and its pending attribute record.
    Object {
        /// The object id.
        id: ObjectId,
        /// The attribute record to install.
        xattr: Xattr,
    },
    /// A recoverable temporary and its pending attribute record.
    Temporary {
        /// The temporary's recovery id.
        id: RecoveryId,
        /// The attribute record to install.
        xattr: TemporaryXattr,
    },
}

/// One fixed-size journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    /// The operation described.
    pub kind: EntryKind,
    /// Records remaining in this transaction, including this one.
    pub tx_size: u32,
    /// Staging temporary index, when [`EntryKind::carries_content`].
    pub staging_id: u64,
    /// The object or temporary the record applies to.
    pub target: EntryTarget,
}

impl JournalEntry {
    /// Encodes the record into its on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes[0] = self.kind.as_byte();
        bytes[4..8].copy_from_slice(&self.tx_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.staging_id.to_le_bytes());
        match &self.target {
            EntryTarget::Object { id, xattr } => {
                bytes[24..32].copy_from_slice(&id.as_u64().to_le_bytes());
                bytes[32..32 + XATTR_LEN].copy_from_slice(xattr.as_bytes());
            }
            EntryTarget::Temporary { id, xattr } => {
                bytes[16] = id.rtype.as_byte();
                bytes[24..32].copy_from_slice(&id.index.to_le_bytes());
                bytes[32..32 + XATTR_LEN].copy_from_slice(xattr.as_bytes());
            }
        }
        bytes
    }

    /// Decodes a record from its on-disk form.
    ///
    /// Returns `None` when the bytes do not form a valid record - an
    /// unknown kind byte, a zeroed region, or a target that does not
    /// match the kind. Recovery treats that as the end of usable data.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ENTRY_SIZE {
            return None;
        }
        let kind = EntryKind::from_byte(bytes[0])?;
        let tx_size = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        let staging_id = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let index = u64::from_le_bytes(bytes[24..32].try_into().ok()?);
        let xattr_bytes: [u8; XATTR_LEN] = bytes[32..32 + XATTR_LEN].try_into().ok()?;

        let target = if kind.targets_object() {
            if bytes[16] != 0 {
                return None;
            }
            EntryTarget::Object {
                id: ObjectId::new(index),
                xattr: Xattr::new(xattr_bytes),
            }
        } else {
            let rtype = RecoveryType::from_byte(bytes[16])?;
            EntryTarget::Temporary {
                id: RecoveryId::new(rtype, index),
                xattr: TemporaryXattr::new(xattr_bytes),
            }
        };

        Some(Self {
            kind,
            tx_size,
            staging_id,
            target,
        })
    }
}

/// Encodes a transaction's records into one contiguous buffer.
#[must_use]
pub(crate) fn encode_entries(entries: &[JournalEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for entry in entries {
        bytes.extend_from_slice(&entry.encode());
    }
    bytes
}
