//! In-memory blob store for testing.

use crate::error::{BlobError, BlobResult};
use crate::store::{BlobStore, RecoveredBlob};
use crate::types::{ObjectId, RecoveryId, RecoveryType, TempId, TemporaryXattr, Xattr};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct StoredObject {
    xattr: Xattr,
    content: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredTemp {
    xattr: TemporaryXattr,
    content: Vec<u8>,
    tag: Option<RecoveryId>,
}

/// An in-memory blob store.
///
/// This store keeps all state in memory and is suitable for:
/// - Unit tests
/// - Integration tests, including crash simulation: tearing down the
///   journaling layer and handing the same `MemoryStore` to a fresh
///   recovery pass behaves exactly like a process restart, because
///   temporary tokens are reissued through recovery enumeration.
///
/// # Example
///
/// ```rust
/// use tarn_blob::{BlobStore, MemoryStore, ObjectId, Xattr};
///
/// let mut store = MemoryStore::new();
/// let temp = store.new_temporary().unwrap();
/// store.write_temporary(temp, 0, b"hello").unwrap();
/// store.place_object(ObjectId::new(1), &Xattr::zeroed(), temp).unwrap();
/// assert_eq!(store.read_object(ObjectId::new(1), 0, 5).unwrap(), b"hello");
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: HashMap<ObjectId, StoredObject>,
    temps: HashMap<TempId, StoredTemp>,
    tags: HashMap<RecoveryId, TempId>,
    next_temp: u64,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of durable objects currently stored.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of live temporaries, tagged or not.
    #[must_use]
    pub fn temporary_count(&self) -> usize {
        self.temps.len()
    }

    /// Number of temporaries tagged with the given recovery type.
    #[must_use]
    pub fn tagged_count(&self, rtype: RecoveryType) -> usize {
        self.tags.keys().filter(|id| id.rtype == rtype).count()
    }

    fn temp(&self, temp: TempId) -> BlobResult<&StoredTemp> {
        self.temps
            .get(&temp)
            .ok_or(BlobError::NoSuchTemporary { temp })
    }

    fn temp_mut(&mut self, temp: TempId) -> BlobResult<&mut StoredTemp> {
        self.temps
            .get_mut(&temp)
            .ok_or(BlobError::NoSuchTemporary { temp })
    }

    fn take_temp(&mut self, temp: TempId) -> BlobResult<StoredTemp> {
        let record = self
            .temps
            .remove(&temp)
            .ok_or(BlobError::NoSuchTemporary { temp })?;
        if let Some(tag) = record.tag {
            self.tags.remove(&tag);
        }
        Ok(record)
    }
}

fn read_range(content: &[u8], offset: u64, len: usize) -> BlobResult<Vec<u8>> {
    let size = content.len() as u64;
    let start = offset as usize;
    let end = start.saturating_add(len);
    if offset > size || end > content.len() {
        return Err(BlobError::ReadPastEnd { offset, len, size });
    }
    Ok(content[start..end].to_vec())
}

fn write_range(content: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let end = offset as usize + data.len();
    if end > content.len() {
        content.resize(end, 0);
    }
    content[offset as usize..end].copy_from_slice(data);
}

impl BlobStore for MemoryStore {
    fn open_object(&self, id: ObjectId) -> BlobResult<Option<Xattr>> {
        Ok(self.objects.get(&id).map(|o| o.xattr))
    }

    fn read_object(&self, id: ObjectId, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
        let object = self
            .objects
            .get(&id)
            .ok_or(BlobError::NoSuchObject { id })?;
        read_range(&object.content, offset, len)
    }

    fn object_size(&self, id: ObjectId) -> BlobResult<u64> {
        let object = self
            .objects
            .get(&id)
            .ok_or(BlobError::NoSuchObject { id })?;
        Ok(object.content.len() as u64)
    }

    fn place_object(&mut self, id: ObjectId, xattr: &Xattr, content: TempId) -> BlobResult<()> {
        let temp = self.take_temp(content)?;
        self.objects.insert(
            id,
            StoredObject {
                xattr: *xattr,
                content: temp.content,
            },
        );
        Ok(())
    }

    fn set_object_xattr(&mut self, id: ObjectId, xattr: &Xattr) -> BlobResult<()> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(BlobError::NoSuchObject { id })?;
        object.xattr = *xattr;
        Ok(())
    }

    fn remove_object(&mut self, id: ObjectId) -> BlobResult<()> {
        self.objects
            .remove(&id)
            .ok_or(BlobError::NoSuchObject { id })?;
        Ok(())
    }

    fn new_temporary(&mut self) -> BlobResult<TempId> {
        let temp = TempId::new(self.next_temp);
        self.next_temp += 1;
        self.temps.insert(
            temp,
            StoredTemp {
                xattr: TemporaryXattr::zeroed(),
                content: Vec::new(),
                tag: None,
            },
        );
        Ok(temp)
    }

    fn write_temporary(&mut self, temp: TempId, offset: u64, data: &[u8]) -> BlobResult<()> {
        let record = self.temp_mut(temp)?;
        write_range(&mut record.content, offset, data);
        Ok(())
    }

    fn read_temporary(&self, temp: TempId, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
        read_range(&self.temp(temp)?.content, offset, len)
    }

    fn temporary_size(&self, temp: TempId) -> BlobResult<u64> {
        Ok(self.temp(temp)?.content.len() as u64)
    }

    fn sync_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        self.temp(temp)?;
        Ok(())
    }

    fn zero_temporary(&mut self, temp: TempId, offset: u64, len: u64) -> BlobResult<()> {
        let record = self.temp_mut(temp)?;
        let start = offset as usize;
        let end = (offset + len).min(record.content.len() as u64) as usize;
        if start < end {
            record.content[start..end].fill(0);
        }
        Ok(())
    }

    fn tag_temporary(
        &mut self,
        temp: TempId,
        id: RecoveryId,
        xattr: Option<&TemporaryXattr>,
    ) -> BlobResult<()> {
        if let Some(&holder) = self.tags.get(&id) {
            if holder != temp {
                return Err(BlobError::RecoveryIdTaken { id });
            }
        }
        let record = self
            .temps
            .get_mut(&temp)
            .ok_or(BlobError::NoSuchTemporary { temp })?;
        let old_tag = record.tag.replace(id);
        if let Some(xattr) = xattr {
            record.xattr = *xattr;
        }
        if let Some(old) = old_tag {
            if old != id {
                self.tags.remove(&old);
            }
        }
        self.tags.insert(id, temp);
        Ok(())
    }

    fn overwrite_temporary(
        &mut self,
        dst: TempId,
        xattr: &TemporaryXattr,
        src: TempId,
    ) -> BlobResult<()> {
        let source = self.take_temp(src)?;
        let record = self.temp_mut(dst)?;
        record.content = source.content;
        record.xattr = *xattr;
        Ok(())
    }

    fn set_temporary_xattr(&mut self, temp: TempId, xattr: &TemporaryXattr) -> BlobResult<()> {
        self.temp_mut(temp)?.xattr = *xattr;
        Ok(())
    }

    fn temporary_xattr(&self, temp: TempId) -> BlobResult<TemporaryXattr> {
        Ok(self.temp(temp)?.xattr)
    }

    fn drop_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        self.take_temp(temp)?;
        Ok(())
    }

    fn recover_temporaries(&mut self, rtype: RecoveryType) -> BlobResult<Vec<RecoveredBlob>> {
        let mut found: Vec<RecoveredBlob> = self
            .tags
            .iter()
            .filter(|(id, _)| id.rtype == rtype)
            .filter_map(|(&old_id, &temp)| {
                self.temps.get(&temp).map(|record| RecoveredBlob {
                    temp,
                    old_id,
                    xattr: record.xattr,
                })
            })
            .collect();
        found.sort_by_key(|r| r.old_id);
        Ok(found)
    }

    fn sync_all(&mut self) -> BlobResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_with(store: &mut MemoryStore, data: &[u8]) -> TempId {
        let temp = store.new_temporary().unwrap();
        store.write_temporary(temp, 0, data).unwrap();
        temp
    }

    #[test]
    fn place_object_consumes_temporary() {
        let mut store = MemoryStore::new();
        let temp = temp_with(&mut store, b"payload");
        store
            .place_object(ObjectId::new(9), &Xattr::new([7; 64]), temp)
            .unwrap();

        assert_eq!(store.temporary_count(), 0);
        assert_eq!(
            store.open_object(ObjectId::new(9)).unwrap(),
            Some(Xattr::new([7; 64]))
        );
        assert_eq!(store.read_object(ObjectId::new(9), 0, 7).unwrap(), b"payload");
    }

    #[test]
    fn place_object_replaces_existing() {
        let mut store = MemoryStore::new();
        let t1 = temp_with(&mut store, b"old");
        store
            .place_object(ObjectId::new(1), &Xattr::zeroed(), t1)
            .unwrap();

        let t2 = temp_with(&mut store, b"new!");
        store
            .place_object(ObjectId::new(1), &Xattr::new([1; 64]), t2)
            .unwrap();

        assert_eq!(store.object_size(ObjectId::new(1)).unwrap(), 4);
        assert_eq!(store.read_object(ObjectId::new(1), 0, 4).unwrap(), b"new!");
    }

    #[test]
    fn read_past_end_fails() {
        let mut store = MemoryStore::new();
        let temp = temp_with(&mut store, b"abc");
        let result = store.read_temporary(temp, 2, 10);
        assert!(matches!(result, Err(BlobError::ReadPastEnd { .. })));
    }

    #[test]
    fn write_extends_content() {
        let mut store = MemoryStore::new();
        let temp = store.new_temporary().unwrap();
        store.write_temporary(temp, 4, b"late").unwrap();
        assert_eq!(store.temporary_size(temp).unwrap(), 8);
        assert_eq!(store.read_temporary(temp, 0, 4).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn tag_and_recover() {
        let mut store = MemoryStore::new();
        let t1 = temp_with(&mut store, b"one");
        let t2 = temp_with(&mut store, b"two");
        store
            .tag_temporary(
                t1,
                RecoveryId::new(RecoveryType::User, 5),
                Some(&TemporaryXattr::new([5; 64])),
            )
            .unwrap();
        store
            .tag_temporary(
                t2,
                RecoveryId::new(RecoveryType::User, 2),
                Some(&TemporaryXattr::new([2; 64])),
            )
            .unwrap();

        let recovered = store.recover_temporaries(RecoveryType::User).unwrap();
        assert_eq!(recovered.len(), 2);
        // id order
        assert_eq!(recovered[0].old_id.index, 2);
        assert_eq!(recovered[1].old_id.index, 5);
        assert!(store
            .recover_temporaries(RecoveryType::Staging)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn tag_collision_rejected() {
        let mut store = MemoryStore::new();
        let t1 = store.new_temporary().unwrap();
        let t2 = store.new_temporary().unwrap();
        let id = RecoveryId::new(RecoveryType::Scratch, 0);
        store.tag_temporary(t1, id, None).unwrap();
        let result = store.tag_temporary(t2, id, None);
        assert!(matches!(result, Err(BlobError::RecoveryIdTaken { .. })));
    }

    #[test]
    fn retag_moves_the_tag() {
        let mut store = MemoryStore::new();
        let temp = store.new_temporary().unwrap();
        let staging = RecoveryId::new(RecoveryType::Staging, 0);
        let user = RecoveryId::new(RecoveryType::User, 1);
        store.tag_temporary(temp, staging, None).unwrap();
        store.tag_temporary(temp, user, None).unwrap();

        assert!(store.recover_temporaries(RecoveryType::Staging).unwrap().is_empty());
        assert_eq!(store.recover_temporaries(RecoveryType::User).unwrap().len(), 1);
    }

    #[test]
    fn overwrite_temporary_consumes_source() {
        let mut store = MemoryStore::new();
        let dst = temp_with(&mut store, b"old content");
        store
            .tag_temporary(dst, RecoveryId::new(RecoveryType::User, 1), None)
            .unwrap();
        let src = temp_with(&mut store, b"fresh");

        store
            .overwrite_temporary(dst, &TemporaryXattr::new([9; 64]), src)
            .unwrap();

        assert_eq!(store.temporary_count(), 1);
        assert_eq!(store.read_temporary(dst, 0, 5).unwrap(), b"fresh");
        assert_eq!(store.temporary_xattr(dst).unwrap(), TemporaryXattr::new([9; 64]));
        // dst keeps its tag
        assert_eq!(store.recover_temporaries(RecoveryType::User).unwrap().len(), 1);
    }

    #[test]
    fn zero_temporary_fills_with_zeros() {
        let mut store = MemoryStore::new();
        let temp = temp_with(&mut store, b"xxxxxxxx");
        store.zero_temporary(temp, 2, 4).unwrap();
        assert_eq!(store.read_temporary(temp, 0, 8).unwrap(), b"xx\0\0\0\0xx");
    }

    #[test]
    fn drop_temporary_releases_tag() {
        let mut store = MemoryStore::new();
        let temp = store.new_temporary().unwrap();
        store
            .tag_temporary(temp, RecoveryId::new(RecoveryType::User, 3), None)
            .unwrap();
        store.drop_temporary(temp).unwrap();
        assert_eq!(store.temporary_count(), 0);
        assert!(store.recover_temporaries(RecoveryType::User).unwrap().is_empty());
    }

    #[test]
    fn remove_missing_object_fails() {
        let mut store = MemoryStore::new();
        let result = store.remove_object(ObjectId::new(404));
        assert!(matches!(result, Err(BlobError::NoSuchObject { .. })));
    }
}
