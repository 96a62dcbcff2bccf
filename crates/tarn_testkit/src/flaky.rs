//! Fault-injecting blob store wrapper.
//!
//! Crash recovery cannot be tested by actually crashing the test
//! process, so tests cut the commit pipeline instead: a scripted fault
//! makes a chosen store operation fail, the journal poisons itself,
//! and the test tears it down and runs recovery over the same store -
//! exactly the state a real crash at that point would leave behind.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tarn_blob::{
    BlobError, BlobResult, BlobStore, ObjectId, RecoveredBlob, RecoveryId, RecoveryType, TempId,
    TemporaryXattr, Xattr,
};

/// A class of store operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Object placement (create/overwrite apply, replay).
    PlaceObject,
    /// Object removal.
    RemoveObject,
    /// Object attribute replacement.
    SetObjectXattr,
    /// Tagging a temporary with a recovery id (staging, adoption).
    TagTemporary,
    /// Writing temporary content (includes journal appends).
    WriteTemporary,
    /// Per-temporary sync (the journal durability barrier).
    SyncTemporary,
    /// The global post-apply sync.
    SyncAll,
    /// Hole punching.
    ZeroTemporary,
}

/// Shared fault script for a [`FlakyStore`].
///
/// Armed fault points fail every matching operation until disarmed.
#[derive(Debug, Default)]
pub struct FaultPlan {
    armed: Mutex<HashSet<FaultPoint>>,
    tripped: Mutex<Vec<FaultPoint>>,
}

impl FaultPlan {
    /// Arms a fault point.
    pub fn arm(&self, point: FaultPoint) {
        self.armed.lock().insert(point);
    }

    /// Disarms a fault point.
    pub fn disarm(&self, point: FaultPoint) {
        self.armed.lock().remove(&point);
    }

    /// Disarms everything.
    pub fn disarm_all(&self) {
        self.armed.lock().clear();
    }

    /// Every fault that actually fired, in order.
    #[must_use]
    pub fn tripped(&self) -> Vec<FaultPoint> {
        self.tripped.lock().clone()
    }

    fn check(&self, point: FaultPoint) -> BlobResult<()> {
        if self.armed.lock().contains(&point) {
            self.tripped.lock().push(point);
            return Err(BlobError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected fault: {point:?}"),
            )));
        }
        Ok(())
    }
}

/// A blob store wrapper that fails scripted operation classes.
pub struct FlakyStore {
    inner: Box<dyn BlobStore>,
    plan: Arc<FaultPlan>,
}

impl FlakyStore {
    /// Wraps a store; the returned plan scripts its failures.
    pub fn new(inner: Box<dyn BlobStore>) -> (Self, Arc<FaultPlan>) {
        let plan = Arc::new(FaultPlan::default());
        (
            Self {
                inner,
                plan: Arc::clone(&plan),
            },
            plan,
        )
    }

    /// Unwraps the inner store.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn BlobStore> {
        self.inner
    }
}

impl BlobStore for FlakyStore {
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
        self.plan.check(FaultPoint::PlaceObject)?;
        self.inner.place_object(id, xattr, content)
    }

    fn set_object_xattr(&mut self, id: ObjectId, xattr: &Xattr) -> BlobResult<()> {
        self.plan.check(FaultPoint::SetObjectXattr)?;
        self.inner.set_object_xattr(id, xattr)
    }

    fn remove_object(&mut self, id: ObjectId) -> BlobResult<()> {
        self.plan.check(FaultPoint::RemoveObject)?;
        self.inner.remove_object(id)
    }

    fn new_temporary(&mut self) -> BlobResult<TempId> {
        self.inner.new_temporary()
    }

    fn write_temporary(&mut self, temp: TempId, offset: u64, data: &[u8]) -> BlobResult<()> {
        self.plan.check(FaultPoint::WriteTemporary)?;
        self.inner.write_temporary(temp, offset, data)
    }

    fn read_temporary(&self, temp: TempId, offset: u64, len: usize) -> BlobResult<Vec<u8>> {
        self.inner.read_temporary(temp, offset, len)
    }

    fn temporary_size(&self, temp: TempId) -> BlobResult<u64> {
        self.inner.temporary_size(temp)
    }

    fn sync_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        self.plan.check(FaultPoint::SyncTemporary)?;
        self.inner.sync_temporary(temp)
    }

    fn zero_temporary(&mut self, temp: TempId, offset: u64, len: u64) -> BlobResult<()> {
        self.plan.check(FaultPoint::ZeroTemporary)?;
        self.inner.zero_temporary(temp, offset, len)
    }

    fn tag_temporary(
        &mut self,
        temp: TempId,
        id: RecoveryId,
        xattr: Option<&TemporaryXattr>,
    ) -> BlobResult<()> {
        self.plan.check(FaultPoint::TagTemporary)?;
        self.inner.tag_temporary(temp, id, xattr)
    }

    fn overwrite_temporary(
        &mut self,
        dst: TempId,
        xattr: &TemporaryXattr,
        src: TempId,
    ) -> BlobResult<()> {
        self.inner.overwrite_temporary(dst, xattr, src)
    }

    fn set_temporary_xattr(&mut self, temp: TempId, xattr: &TemporaryXattr) -> BlobResult<()> {
        self.inner.set_temporary_xattr(temp, xattr)
    }

    fn temporary_xattr(&self, temp: TempId) -> BlobResult<TemporaryXattr> {
        self.inner.temporary_xattr(temp)
    }

    fn drop_temporary(&mut self, temp: TempId) -> BlobResult<()> {
        self.inner.drop_temporary(temp)
    }

    fn recover_temporaries(&mut self, rtype: RecoveryType) -> BlobResult<Vec<RecoveredBlob>> {
        self.inner.recover_temporaries(rtype)
    }

    fn sync_all(&mut self) -> BlobResult<()> {
        self.plan.check(FaultPoint::SyncAll)?;
        self.inner.sync_all()
    }
}
