//! Core identifier and attribute types shared by the blob and journal layers.

use std::fmt;

/// Size in bytes of an extended attribute record.
pub const XATTR_LEN: usize = 64;

/// Stable identifier of a durable object.
///
/// Object ids are assigned by the caller and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Creates a new object ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{:x}", self.0)
    }
}

/// The kind of a recoverable temporary.
///
/// `Staging` and `Journal` are reserved for the journaling layer
/// itself; the remaining kinds are free for applications to assign
/// meaning to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RecoveryType {
    /// Staged content pending its move into a final location.
    Staging = 0,
    /// The journal file itself. At most one exists at any time.
    Journal = 1,
    /// Application-defined durable temporaries.
    User = 2,
    /// Application-defined scratch state that survives restart.
    Scratch = 3,
}

impl RecoveryType {
    /// Every recovery type, in recovery-enumeration order.
    pub const ALL: [RecoveryType; 4] = [
        RecoveryType::Staging,
        RecoveryType::Journal,
        RecoveryType::User,
        RecoveryType::Scratch,
    ];

    /// Converts a byte to a recovery type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Staging),
            1 => Some(Self::Journal),
            2 => Some(Self::User),
            3 => Some(Self::Scratch),
            _ => None,
        }
    }

    /// Converts the recovery type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Short lowercase name, used in display output and file names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Journal => "journal",
            Self::User => "user",
            Self::Scratch => "scratch",
        }
    }
}

impl fmt::Display for RecoveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed identifier of a recoverable temporary.
///
/// Ordering is recovery-type major, so all ids of one type form a
/// contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecoveryId {
    /// The kind of temporary.
    pub rtype: RecoveryType,
    /// Index within the kind.
    pub index: u64,
}

impl RecoveryId {
    /// Creates a new recovery ID.
    #[must_use]
    pub const fn new(rtype: RecoveryType, index: u64) -> Self {
        Self { rtype, index }
    }
}

impl fmt::Display for RecoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rtype, self.index)
    }
}

/// Fixed-size opaque attribute record attached to a durable object.
///
/// The blob and journal layers never interpret the bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Xattr(pub [u8; XATTR_LEN]);

impl Xattr {
    /// Creates an attribute record from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; XATTR_LEN]) -> Self {
        Self(bytes)
    }

    /// An all-zero attribute record.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; XATTR_LEN])
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; XATTR_LEN] {
        &self.0
    }
}

impl fmt::Debug for Xattr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xattr({:02x?}..)", &self.0[..8])
    }
}

/// Fixed-size opaque attribute record attached to a recoverable temporary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TemporaryXattr(pub [u8; XATTR_LEN]);

impl TemporaryXattr {
    /// Creates an attribute record from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; XATTR_LEN]) -> Self {
        Self(bytes)
    }

    /// An all-zero attribute record.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; XATTR_LEN])
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; XATTR_LEN] {
        &self.0
    }
}

impl fmt::Debug for TemporaryXattr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TemporaryXattr({:02x?}..)", &self.0[..8])
    }
}

/// Store-assigned token for an open temporary.
///
/// Tokens are only meaningful to the store that issued them and are
/// not stable across restarts; restart-stable addressing goes through
/// [`RecoveryId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TempId(pub u64);

impl TempId {
    /// Creates a temporary token from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw token value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp:{}", self.0)
    }
}
