//! Directory-backed blob store for persistent storage.
//!
//! This module handles the on-disk layout of a Tarn store:
//!
//! ```text
//! <root>/
//! ├─ LOCK                  # Advisory lock for single-process access
//! ├─ obj/                  # Durable objects: <id> content + <id>.xa attribute
//! ├─ rec/                  # Tagged temporaries: <type>-<index> + .xa sidecar
//! └─ tmp/                  # Anonymous temporaries (crash garbage; cleared on open)
//! ```
//!
//! Renames within the store are the atomicity primitive: placing an
//! object and tagging a temporary are both a rename plus a directory
//! fsync. Anonymous temporaries left behind by a crash carry no
//! recovery obligation and are deleted on open.

use crate::error::{BlobError, BlobResult};
use crate::store::{BlobStore, RecoveredBlob};
use crate::types::{
    ObjectId, RecoveryId, RecoveryType, TempId, TemporaryXattr, Xattr, XATTR_LEN,
};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const OBJECTS_DIR: &str = "obj";
const RECOVERY_DIR: &str = "rec";
const SCRATCH_DIR: &str = "tmp";
/// Sidecar suffix for attribute records.
const XATTR_SUFFIX: &str = "xa";

struct TempRecord {
    path: PathBuf,
    file: Mutex<File>,
    tag: Option<RecoveryId>,
}

/// A directory-backed blob store.
///
/// Data survives process restarts; an advisory lock file guards the
/// directory so only one process can open the store at a time.
///
/// # Durability
///
/// - Temporary contents reach disk via [`BlobStore::sync_temporary`]
///   (`File::sync_all`).
/// - Namespace changes (placement, tags, removals) become durable once
///   the affected directories are fsynced, which happens inline for
///   placement and in [`BlobStore::sync_all`] for everything else.
pub struct DirStore {
    root: PathBuf,
    _lock_file: File,
    temps: HashMap<TempId, TempRecord>,
    next_temp: u64,
}

impl DirStore {
    /// Opens or creates a store at the given directory.
    ///
    /// Leftover anonymous temporaries from a previous run are deleted;
    /// tagged temporaries and objects are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::StoreLocked`] if another process holds the
    /// lock, or an I/O error if the layout cannot be created.
    pub fn open(path: &Path) -> BlobResult<Self> {
        fs::create_dir_all(path.join(OBJECTS_DIR))?;
        fs::create_dir_all(path.join(RECOVERY_DIR))?;
        fs::create_dir_all(path.join(SCRATCH_DIR))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(BlobError::StoreLocked);
        }

        // Anonymous temporaries from a crashed run are unreferenced.
        for entry in fs::read_dir(path.join(SCRATCH_DIR))? {
            let entry = entry?;
            let _ = fs::remove_file(entry.path());
        }

        Ok(Self {
            root: path.to_path_buf(),
            _lock_file: lock_file,
            temps: HashMap::new(),
            next_temp: 0,
        })
    }

    /// Returns the store's root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: ObjectId) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(format!("{:016x}", id.as_u64()))
    }

    fn recovery_path(&self, id: RecoveryId) -> PathBuf {
        self.root
            .join(RECOVERY_DIR)
            .join(format!("{}-{:020}", id.rtype.name(), id.index))
    }

    fn temp(&self, temp: TempId) -> BlobResult<&TempRecord> {
        self.temps
            .get(&temp)
            .ok_or(BlobError::NoSuchTemporary { temp })
    }

    fn take_temp(&mut self, temp: TempId) -> BlobResult<TempRecord> {
        self.temps
            .remove(&temp)
            .ok_or(BlobError::NoSuchTemporary { temp })
    }

    /// Writes a 64-byte attribute sidecar next to `base` using the
    /// write-then-rename pattern.
    fn write_sidecar(&self, base: &Path, bytes: &[u8; XATTR_LEN]) -> BlobResult<()> {
        let final_path = base.with_extension(XATTR_SUFFIX);
        let temp_path = base.with_extension("xa.new");
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    fn read_sidecar(base: &Path) -> BlobResult<Option<[u8; XATTR_LEN]>> {
        let path = base.with_extension(XATTR_SUFFIX);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = [0u8; XATTR_LEN];
        file.read_exact(&mut bytes).map_err(|_| {
            BlobError::corrupted(format!("truncated attribute sidecar: {}", path.display()))
        })?;
        Ok(Some(bytes))
    }

    fn remove_sidecar(base: &Path) -> BlobResult<()> {
        match fs::remove_file(base.with_extension(XATTR_SUFFIX)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn sync_dir(&self, name: &str) -> BlobResult<()> {
        File::open(self.root.join(name))?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self, _name: &str) -> BlobResult<()> {
        // Windows NTFS journals metadata operations itself.
        Ok(())
    }
}

fn file_read_range(file: &mut File, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
    let size = file.metadata()?.len();
    let end = offset.saturating_add(len as u64);
    if offset > size || end > size {
        return Err(BlobError::ReadPastEnd { offset, len, size });
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![0u8; len];
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Punches a hole in the file so the range reads as zeros and the
/// underlying blocks are reclaimed.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn zero_file_range(file: &mut File, offset: u64, len: u64) -> BlobResult<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    // Filesystems without punch support fall through to literal zeros.
    zero_file_range_portable(file, offset, len)
}

#[cfg(not(target_os = "linux"))]
fn zero_file_range(file: &mut File, offset: u64, len: u64) -> BlobResult<()> {
    zero_file_range_portable(file, offset, len)
}

fn zero_file_range_portable(file: &mut File, offset: u64, len: u64) -> BlobResult<()> {
    const CHUNK: usize = 64 * 1024;
    let size = file.metadata()?.len();
    let end = (offset + len).min(size);
    if offset >= end {
        return Ok(());
    }
    file.seek(SeekFrom::Start(offset))?;
    let zeros = [0u8; CHUNK];
    let mut remaining = (end - offset) as usize;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        file.write_all(&zeros[..n])?;
        remaining -= n;
    }
    Ok(())
}

impl BlobStore for DirStore {
    fn open_object(&self, id: ObjectId) -> BlobResult<Option<Xattr>> {
        let path = self.object_path(id);
        if !path.exists() {
            return Ok(None);
        }
        match Self::read_sidecar(&path)? {
            Some(bytes) => Ok(Some(Xattr::new(bytes))),
            None => Err(BlobError::corrupted(format!(
                "object {} has no attribute sidecar",
                id
            ))),
        }
    }

    fn read_object(&self, id: ObjectId, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
        let mut file = match File::open(self.object_path(id)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NoSuchObject { id })
            }
            Err(e) => return Err(e.into()),
        };
        file_read_range(&mut file, offset, len)
    }

    fn object_size(&self, id: ObjectId) -> BlobResult<u64> {
        match fs::metadata(self.object_path(id)) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NoSuchObject { id })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn place_object(&mut self, id: ObjectId, xattr: &Xattr, content: TempId) -> BlobResult<()> {
        let record = self.take_temp(content)?;
        let target = self.object_path(id);

        // Content must be on disk before the rename makes it reachable.
        record.file.lock().sync_all()?;
        self.write_sidecar(&target, xattr.as_bytes())?;
        fs::rename(&record.path, &target)?;
        Self::remove_sidecar(&record.path)?;
        self.sync_dir(OBJECTS_DIR)?;
        self.sync_dir(RECOVERY_DIR)?;
        self.sync_dir(SCRATCH_DIR)?;
        Ok(())
    }

    fn set_object_xattr(&mut self, id: ObjectId, xattr: &Xattr) -> BlobResult<()> {
        let path = self.object_path(id);
        if !path.exists() {
            return Err(BlobError::NoSuchObject { id });
        }
        self.write_sidecar(&path, xattr.as_bytes())
    }

    fn remove_object(&mut self, id: ObjectId) -> BlobResult<()> {
        let path = self.object_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NoSuchObject { id })
            }
            Err(e) => return Err(e.into()),
        }
        Self::remove_sidecar(&path)?;
        self.sync_dir(OBJECTS_DIR)
    }

    fn new_temporary(&mut self) -> BlobResult<TempId> {
        let temp = TempId::new(self.next_temp);
        self.next_temp += 1;
        let path = self.root.join(SCRATCH_DIR).join(format!("t{}", temp.as_u64()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.temps.insert(
            temp,
            TempRecord {
                path,
                file: Mutex::new(file),
                tag: None,
            },
        );
        Ok(temp)
    }

    fn write_temporary(&mut self, temp: TempId, offset: u64, data: &[u8]) -> BlobResult<()> {
        let record = self.temp(temp)?;
        let mut file = record.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read_temporary(&self, temp: TempId, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
        let record = self.temp(temp)?;
        file_read_range(&mut record.file.lock(), offset, len)
    }

    fn temporary_size(&self, temp: TempId) -> BlobResult<u64> {
        let record = self.temp(temp)?;
        Ok(record.file.lock().metadata()?.len())
    }

    fn sync_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        let record = self.temp(temp)?;
        record.file.lock().sync_all()?;
        Ok(())
    }

    fn zero_temporary(&mut self, temp: TempId, offset: u64, len: u64) -> BlobResult<()> {
        if len == 0 {
            return Ok(());
        }
        let record = self.temp(temp)?;
        zero_file_range(&mut record.file.lock(), offset, len)
    }

    fn tag_temporary(
        &mut self,
        temp: TempId,
        id: RecoveryId,
        xattr: Option<&TemporaryXattr>,
    ) -> BlobResult<()> {
        let target = self.recovery_path(id);
        let old_path = self.temp(temp)?.path.clone();
        if old_path != target {
            if target.exists() {
                return Err(BlobError::RecoveryIdTaken { id });
            }
            fs::rename(&old_path, &target)?;
            // Carry the old sidecar along unless a fresh record replaces it.
            let old_sidecar = old_path.with_extension(XATTR_SUFFIX);
            if old_sidecar.exists() {
                if xattr.is_none() {
                    fs::rename(&old_sidecar, target.with_extension(XATTR_SUFFIX))?;
                } else {
                    fs::remove_file(&old_sidecar)?;
                }
            }
        }
        if let Some(xattr) = xattr {
            self.write_sidecar(&target, xattr.as_bytes())?;
        }
        let record = self
            .temps
            .get_mut(&temp)
            .ok_or(BlobError::NoSuchTemporary { temp })?;
        record.path = target;
        record.tag = Some(id);
        Ok(())
    }

    fn overwrite_temporary(
        &mut self,
        dst: TempId,
        xattr: &TemporaryXattr,
        src: TempId,
    ) -> BlobResult<()> {
        let dst_path = self.temp(dst)?.path.clone();
        let source = self.take_temp(src)?;

        source.file.lock().sync_all()?;
        fs::rename(&source.path, &dst_path)?;
        Self::remove_sidecar(&source.path)?;
        self.write_sidecar(&dst_path, xattr.as_bytes())?;

        // The old handle points at the unlinked inode; reopen.
        let file = OpenOptions::new().read(true).write(true).open(&dst_path)?;
        let record = self
            .temps
            .get_mut(&dst)
            .ok_or(BlobError::NoSuchTemporary { temp: dst })?;
        record.file = Mutex::new(file);
        Ok(())
    }

    fn set_temporary_xattr(&mut self, temp: TempId, xattr: &TemporaryXattr) -> BlobResult<()> {
        let path = self.temp(temp)?.path.clone();
        self.write_sidecar(&path, xattr.as_bytes())
    }

    fn temporary_xattr(&self, temp: TempId) -> BlobResult<TemporaryXattr> {
        let record = self.temp(temp)?;
        Ok(match Self::read_sidecar(&record.path)? {
            Some(bytes) => TemporaryXattr::new(bytes),
            None => TemporaryXattr::zeroed(),
        })
    }

    fn drop_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        let record = self.take_temp(temp)?;
        fs::remove_file(&record.path)?;
        Self::remove_sidecar(&record.path)?;
        Ok(())
    }

    fn recover_temporaries(&mut self, rtype: RecoveryType) -> BlobResult<Vec<RecoveredBlob>> {
        // Stale tokens from an earlier enumeration of this type are
        // superseded by the fresh ones.
        self.temps.retain(|_, r| r.tag.map(|t| t.rtype) != Some(rtype));

        let prefix = format!("{}-", rtype.name());
        let mut found = Vec::new();
        for entry in fs::read_dir(self.root.join(RECOVERY_DIR))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(index_str) = name.strip_prefix(&prefix) else {
                continue;
            };
            if index_str.contains('.') {
                continue; // sidecar
            }
            let index: u64 = index_str.parse().map_err(|_| {
                BlobError::corrupted(format!("unparseable recovery file name: {name}"))
            })?;

            let old_id = RecoveryId::new(rtype, index);
            let path = entry.path();
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let xattr = match Self::read_sidecar(&path)? {
                Some(bytes) => TemporaryXattr::new(bytes),
                None => TemporaryXattr::zeroed(),
            };

            let temp = TempId::new(self.next_temp);
            self.next_temp += 1;
            self.temps.insert(
                temp,
                TempRecord {
                    path,
                    file: Mutex::new(file),
                    tag: Some(old_id),
                },
            );
            found.push(RecoveredBlob { temp, old_id, xattr });
        }
        found.sort_by_key(|r| r.old_id);
        Ok(found)
    }

    fn sync_all(&mut self) -> BlobResult<()> {
        self.sync_dir(OBJECTS_DIR)?;
        self.sync_dir(RECOVERY_DIR)?;
        self.sync_dir(SCRATCH_DIR)?;
        #[cfg(unix)]
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for DirStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirStore")
            .field("root", &self.root)
            .field("open_temporaries", &self.temps.len())
            .finish_non_exhaustive()
    }
}
