//! Small helpers shared by integration suites.

use tarn_blob::{TemporaryXattr, Xattr, XATTR_LEN};
use tarn_journal::{DetachedTemporary, Journal, JournalResult};

/// An attribute record filled with one byte.
#[must_use]
pub fn xattr(byte: u8) -> Xattr {
    Xattr::new([byte; XATTR_LEN])
}

/// A temporary attribute record filled with one byte.
#[must_use]
pub fn temp_xattr(byte: u8) -> TemporaryXattr {
    TemporaryXattr::new([byte; XATTR_LEN])
}

/// A detached temporary pre-filled with `data`.
pub fn content(journal: &Journal, data: &[u8]) -> JournalResult<DetachedTemporary> {
    let temp = journal.new_detached_temporary()?;
    temp.write_at(0, data)?;
    Ok(temp)
}
