//! Operation-recording blob store wrapper.

use parking_lot::Mutex;
use std::sync::Arc;
use tarn_blob::{
    BlobResult, BlobStore, ObjectId, RecoveredBlob, RecoveryId, RecoveryType, TempId,
    TemporaryXattr, Xattr,
};

/// Shared operation log for a [`RecordingStore`].
#[derive(Debug, Default)]
pub struct Recorder {
    ops: Mutex<Vec<String>>,
}

impl Recorder {
    /// Every recorded operation, in execution order.
    #[must_use]
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    /// Clears the log.
    pub fn clear(&self) {
        self.ops.lock().clear();
    }

    fn push(&self, op: String) {
        self.ops.lock().push(op);
    }
}

/// A blob store wrapper that logs every mutating operation.
///
/// Used to assert pipeline shape: apply ordering within a transaction,
/// serialization across transactions, and sync/punch placement.
pub struct RecordingStore {
    inner: Box<dyn BlobStore>,
    recorder: Arc<Recorder>,
}

impl RecordingStore {
    /// Wraps a store; the returned recorder holds the log.
    pub fn new(inner: Box<dyn BlobStore>) -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (
            Self {
                inner,
                recorder: Arc::clone(&recorder),
            },
            recorder,
        )
    }
}

impl BlobStore for RecordingStore {
    fn open_object(&self, id: ObjectId) -> BlobResult<Option<Xattr>> {
        self.inner.open_object(id)
    }

    fn read_object(&self, id: ObjectId, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
        self.inner.read_object(id, offset, len)
    }

    fn object_size(&self, id: ObjectId) -> BlobResult<u64> {
        self.inner.object_size(id)
    }

    fn place_object(&mut self, id: ObjectId, xattr: &Xattr, content: TempId) -> BlobResult<()> {
        self.recorder.push(format!("place_object {id}"));
        self.inner.place_object(id, xattr, content)
    }

    fn set_object_xattr(&mut self, id: ObjectId, xattr: &Xattr) -> BlobResult<()> {
        self.recorder.push(format!("set_object_xattr {id}"));
        self.inner.set_object_xattr(id, xattr)
    }

    fn remove_object(&mut self, id: ObjectId) -> BlobResult<()> {
        self.recorder.push(format!("remove_object {id}"));
        self.inner.remove_object(id)
    }

    fn new_temporary(&mut self) -> BlobResult<TempId> {
        self.inner.new_temporary()
    }

    fn write_temporary(&mut self, temp: TempId, offset: u64, data: &[u8]) -> BlobResult<()> {
        self.recorder
            .push(format!("write_temporary {temp} @{offset}+{}", data.len()));
        self.inner.write_temporary(temp, offset, data)
    }

    fn read_temporary(&self, temp: TempId, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
        self.inner.read_temporary(temp, offset, len)
    }

    fn temporary_size(&self, temp: TempId) -> BlobResult<u64> {
        self.inner.temporary_size(temp)
    }

    fn sync_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        self.recorder.push(format!("sync_temporary {temp}"));
        self.inner.sync_temporary(temp)
    }

    fn zero_temporary(&mut self, temp: TempId, offset: u64, len: u64) -> BlobResult<()> {
        self.recorder
            .push(format!("zero_temporary {temp} @{offset}+{len}"));
        self.inner.zero_temporary(temp, offset, len)
    }

    fn tag_temporary(
        &mut self,
        temp: TempId,
        id: RecoveryId,
        xattr: Option<&TemporaryXattr>,
    ) -> BlobResult<()> {
        self.recorder.push(format!("tag_temporary {temp} as {id}"));
        self.inner.tag_temporary(temp, id, xattr)
    }

    fn overwrite_temporary(
        &mut self,
        dst: TempId,
        xattr: &TemporaryXattr,
        src: TempId,
    ) -> BlobResult<()> {
        self.recorder
            .push(format!("overwrite_temporary {dst} from {src}"));
        self.inner.overwrite_temporary(dst, xattr, src)
    }

    fn set_temporary_xattr(&mut self, temp: TempId, xattr: &TemporaryXattr) -> BlobResult<()> {
        self.recorder.push(format!("set_temporary_xattr {temp}"));
        self.inner.set_temporary_xattr(temp, xattr)
    }

    fn temporary_xattr(&self, temp: TempId) -> BlobResult<TemporaryXattr> {
        self.inner.temporary_xattr(temp)
    }

    fn drop_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        self.recorder.push(format!("drop_temporary {temp}"));
        self.inner.drop_temporary(temp)
    }

    fn recover_temporaries(&mut self, rtype: RecoveryType) -> BlobResult<Vec<RecoveredBlob>> {
        self.inner.recover_temporaries(rtype)
    }

    fn sync_all(&mut self) -> BlobResult<()> {
        self.recorder.push("sync_all".to_string());
        self.inner.sync_all()
    }
}
