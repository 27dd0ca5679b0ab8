use crate::{FileRequest, FileRequestUsage, RequestRecycler, RequestStatus};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A request that was handed out to code outside the streaming system.
///
/// Outside code refers to it through [`FileRequestPtr`], which counts references. Once the last
/// `FileRequestPtr` goes away the request is given back to its owner to be reused. The request may
/// still be referenced from inside the request graph at that point.
pub struct ExternalFileRequest {
    request: Arc<FileRequest>,
    ref_count: AtomicUsize,
    owner: Weak<dyn RequestRecycler>,
}

impl ExternalFileRequest {
    pub fn new(owner: Weak<dyn RequestRecycler>) -> Arc<Self> {
        Arc::new(ExternalFileRequest {
            request: Arc::new(FileRequest::new(FileRequestUsage::External)),
            ref_count: AtomicUsize::new(0),
            owner,
        })
    }

    pub fn request(&self) -> &Arc<FileRequest> {
        &self.request
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    fn release(self: &Arc<Self>) {
        let previous = self.ref_count.fetch_sub(1, Ordering::Release);
        assert!(previous > 0, "External file request was released more often than referenced");
        if previous != 1 {
            return;
        }

        atomic::fence(Ordering::Acquire);
        match self.owner.upgrade() {
            Some(owner) => owner.recycle_request(self.clone()),
            None => panic!("External file request outlived the context that created it"),
        }
    }
}

impl fmt::Debug for ExternalFileRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ExternalFileRequest")
            .field("request", &self.request)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Counted reference to an [`ExternalFileRequest`]. Cloning adds a reference and dropping removes
/// one. Dropping the last reference recycles the request.
pub struct FileRequestPtr {
    external: Arc<ExternalFileRequest>,
}

impl FileRequestPtr {
    pub fn new(external: Arc<ExternalFileRequest>) -> Self {
        external.add_ref();
        FileRequestPtr { external }
    }

    pub fn request(&self) -> &Arc<FileRequest> {
        &self.external.request
    }

    pub fn external(&self) -> &Arc<ExternalFileRequest> {
        &self.external
    }

    pub fn ref_count(&self) -> usize {
        self.external.ref_count()
    }

    /// A reference that doesn't keep the request from being recycled
    pub fn handle(&self) -> FileRequestHandle {
        FileRequestHandle::new(self.request())
    }
}

impl Clone for FileRequestPtr {
    fn clone(&self) -> Self {
        FileRequestPtr::new(self.external.clone())
    }
}

impl Drop for FileRequestPtr {
    fn drop(&mut self) {
        self.external.release();
    }
}

impl Deref for FileRequestPtr {
    type Target = FileRequest;

    fn deref(&self) -> &FileRequest {
        &self.external.request
    }
}

impl fmt::Debug for FileRequestPtr {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("FileRequestPtr")
            .field(&Arc::as_ptr(self.request()))
            .finish()
    }
}

impl PartialEq for FileRequestPtr {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(self.request(), other.request())
    }
}

impl Eq for FileRequestPtr {}

impl Hash for FileRequestPtr {
    fn hash<H: Hasher>(
        &self,
        state: &mut H,
    ) {
        Arc::as_ptr(self.request()).hash(state);
    }
}

/// Lightweight reference to a request. It's only used to identify a request and check on it, it
/// doesn't keep the request alive or prevent it from being recycled and reused.
#[derive(Clone)]
pub struct FileRequestHandle {
    request: Weak<FileRequest>,
}

impl FileRequestHandle {
    pub fn new(request: &Arc<FileRequest>) -> Self {
        FileRequestHandle {
            request: Arc::downgrade(request),
        }
    }

    pub fn upgrade(&self) -> Option<Arc<FileRequest>> {
        self.request.upgrade()
    }

    /// Status of the request, if it's still allocated
    pub fn status(&self) -> Option<RequestStatus> {
        self.upgrade().map(|x| x.status())
    }

    pub fn refers_to(
        &self,
        request: &Arc<FileRequest>,
    ) -> bool {
        std::ptr::eq(self.request.as_ptr(), Arc::as_ptr(request))
    }
}

impl From<&FileRequestPtr> for FileRequestHandle {
    fn from(ptr: &FileRequestPtr) -> Self {
        ptr.handle()
    }
}

impl fmt::Debug for FileRequestHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("FileRequestHandle")
            .field(&self.request.as_ptr())
            .finish()
    }
}

impl PartialEq for FileRequestHandle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Weak::ptr_eq(&self.request, &other.request)
    }
}

impl Eq for FileRequestHandle {}

impl PartialEq<FileRequestPtr> for FileRequestHandle {
    fn eq(
        &self,
        other: &FileRequestPtr,
    ) -> bool {
        self.refers_to(other.request())
    }

    #[allow(clippy::partialeq_ne_impl)]
    fn ne(
        &self,
        other: &FileRequestPtr,
    ) -> bool {
        !self.refers_to(other.request())
    }
}

impl PartialEq<FileRequestHandle> for FileRequestPtr {
    fn eq(
        &self,
        other: &FileRequestHandle,
    ) -> bool {
        other.refers_to(self.request())
    }

    #[allow(clippy::partialeq_ne_impl)]
    fn ne(
        &self,
        other: &FileRequestHandle,
    ) -> bool {
        !other.refers_to(self.request())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRecycler {
        recycled: Mutex<Vec<Arc<ExternalFileRequest>>>,
    }

    impl RequestRecycler for RecordingRecycler {
        fn recycle_request(
            &self,
            request: Arc<ExternalFileRequest>,
        ) {
            self.recycled.lock().unwrap().push(request);
        }
    }

    fn new_ptr(recycler: &Arc<RecordingRecycler>) -> FileRequestPtr {
        let recycler: Arc<dyn RequestRecycler> = recycler.clone();
        FileRequestPtr::new(ExternalFileRequest::new(Arc::downgrade(&recycler)))
    }

    #[test]
    fn last_reference_recycles_once() {
        let recycler = Arc::new(RecordingRecycler::default());
        let ptr = new_ptr(&recycler);
        assert_eq!(ptr.ref_count(), 1);
        assert_eq!(ptr.usage(), FileRequestUsage::External);

        let clone = ptr.clone();
        assert_eq!(ptr.ref_count(), 2);
        drop(ptr);
        assert!(recycler.recycled.lock().unwrap().is_empty());
        assert_eq!(clone.ref_count(), 1);

        drop(clone);
        let recycled = recycler.recycled.lock().unwrap();
        assert_eq!(recycled.len(), 1);
        assert_eq!(recycled[0].ref_count(), 0);
    }

    #[test]
    fn concurrent_clones_and_releases_recycle_once() {
        let recycler = Arc::new(RecordingRecycler::default());
        for iteration in 0..20 {
            let ptr = new_ptr(&recycler);
            let clones: Vec<FileRequestPtr> = (0..8).map(|_| ptr.clone()).collect();
            drop(ptr);

            std::thread::scope(|scope| {
                for clone in clones {
                    scope.spawn(move || {
                        for _ in 0..100 {
                            let extra = clone.clone();
                            assert!(extra.ref_count() >= 2);
                            drop(extra);
                        }
                        drop(clone);
                    });
                }
            });

            let recycled = recycler.recycled.lock().unwrap();
            assert_eq!(recycled.len(), iteration + 1);
            assert_eq!(recycled[iteration].ref_count(), 0);
        }
    }

    #[test]
    fn equality_between_handles_and_ptrs() {
        let recycler = Arc::new(RecordingRecycler::default());
        let a = new_ptr(&recycler);
        let b = new_ptr(&recycler);
        let a_handle = a.handle();
        let b_handle = FileRequestHandle::from(&b);

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a_handle == a);
        assert!(a == a_handle);
        assert!(a_handle != b);
        assert!(b != a_handle);
        assert_eq!(a_handle, a_handle.clone());
        assert_ne!(a_handle, b_handle);
    }

    #[test]
    fn handle_does_not_keep_request_alive() {
        let recycler = Arc::new(RecordingRecycler::default());
        let ptr = new_ptr(&recycler);
        ptr.set_status(RequestStatus::Queued);
        let handle = ptr.handle();
        assert_eq!(handle.status(), Some(RequestStatus::Queued));

        drop(ptr);
        // The recycler keeps the storage, so the handle still resolves
        assert!(handle.upgrade().is_some());
        recycler.recycled.lock().unwrap().clear();
        assert!(handle.upgrade().is_none());
        assert!(handle.status().is_none());
    }

    #[test]
    #[should_panic(expected = "outlived")]
    fn releasing_without_owner_panics() {
        let recycler = Arc::new(RecordingRecycler::default());
        let ptr = new_ptr(&recycler);
        drop(recycler);
        drop(ptr);
    }
}
