use crate::request_command::*;
use crate::streamer_types::{
    Deadline, FileRange, Priority, ReadBuffer, ReportType, RequestMemoryAllocator, RequestStatus,
};
use crate::{CompressionInfo, FileRequestPtr, RequestPath};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// Largest number of direct dependencies a single request can track.
pub const MAX_DEPENDENCY_COUNT: u32 = (1 << 21) - 1;

pub type OnCompletionCallback = Box<dyn FnOnce(&FileRequest) + Send + 'static>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileRequestUsage {
    // Created and recycled by the streamer context itself
    Internal,
    // Wrapped in an ExternalFileRequest and kept alive by FileRequestPtr references
    External,
}

/// A single unit of work in the request graph.
///
/// A request starts out empty and gets its operation assigned exactly once through one of the
/// `create_*` functions. Requests form a tree through their parent link: a request that has a
/// parent counts as a dependency of that parent, and the parent only resolves once all of its
/// dependencies resolved. The parent link doesn't keep the parent alive.
///
/// All state can be read and changed through a shared reference so a request can be inspected
/// by the thread that issued it while a worker thread advances it.
pub struct FileRequest {
    command: Mutex<FileRequestCommand>,
    on_completion: Mutex<Option<OnCompletionCallback>>,
    estimated_completion: Mutex<Option<Instant>>,
    parent: Mutex<Option<Weak<FileRequest>>>,
    pending_id: AtomicU64,
    status: AtomicU8,
    dependencies: AtomicU32,
    // Set while the request sits in a context's completed queue, or once it was finalized
    completion_queued: AtomicBool,
    usage: FileRequestUsage,
}

impl FileRequest {
    pub fn new(usage: FileRequestUsage) -> Self {
        FileRequest {
            command: Mutex::new(FileRequestCommand::Empty),
            on_completion: Mutex::new(None),
            estimated_completion: Mutex::new(None),
            parent: Mutex::new(None),
            pending_id: AtomicU64::new(0),
            status: AtomicU8::new(RequestStatus::Pending as u8),
            dependencies: AtomicU32::new(0),
            completion_queued: AtomicBool::new(false),
            usage,
        }
    }

    //
    // Command assignment
    //

    /// Makes this request stand in for an externally issued request. This request becomes the
    /// parent of the external request so it resolves once the whole external chain resolved.
    pub fn create_request_link(
        self: &Arc<Self>,
        request: FileRequestPtr,
    ) {
        let mut command = self.command.lock().unwrap();
        assert_unassigned(&command, ExternalRequestData::NAME);
        request.request().set_optional_parent(Some(self));
        *command = ExternalRequestData { request }.into();
    }

    pub fn create_request_path_store(
        &self,
        parent: Option<&Arc<FileRequest>>,
        path: RequestPath,
    ) {
        self.assign_command(RequestPathStoreData { path }.into(), parent);
    }

    /// Reads into memory owned by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn create_read_request(
        &self,
        path: RequestPath,
        output: ReadBuffer,
        output_size: u64,
        offset: u64,
        size: u64,
        deadline: Deadline,
        priority: Priority,
    ) {
        debug_assert!(
            output_size <= output.len() as u64,
            "Output size {} is larger than the {} byte output buffer",
            output_size,
            output.len()
        );
        let data =
            ReadRequestData::with_buffer(path, output, output_size, offset, size, deadline, priority);
        self.assign_command(data.into(), None);
    }

    /// Reads into memory that's requested from `allocator` once the read is processed. The
    /// request owns that memory until it's taken out with [`ReadRequestData::take_output`] and
    /// gives it back to the allocator otherwise.
    pub fn create_read_request_with_allocator(
        &self,
        path: RequestPath,
        allocator: Arc<dyn RequestMemoryAllocator>,
        offset: u64,
        size: u64,
        deadline: Deadline,
        priority: Priority,
    ) {
        let data = ReadRequestData::with_allocator(path, allocator, offset, size, deadline, priority);
        self.assign_command(data.into(), None);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_read(
        &self,
        parent: Option<&Arc<FileRequest>>,
        output: ReadBuffer,
        output_offset: u64,
        path: RequestPath,
        offset: u64,
        size: u64,
        shared_read: bool,
    ) {
        let data = ReadData {
            output,
            output_offset,
            path,
            offset,
            size,
            shared_read,
        };
        self.assign_command(data.into(), parent);
    }

    pub fn create_compressed_read(
        &self,
        parent: Option<&Arc<FileRequest>>,
        compression_info: CompressionInfo,
        output: ReadBuffer,
        read_offset: u64,
        read_size: u64,
    ) {
        let data = CompressedReadData {
            compression_info,
            output,
            read_offset,
            read_size,
        };
        self.assign_command(data.into(), parent);
    }

    pub fn create_file_exists_check(
        &self,
        path: RequestPath,
    ) {
        self.assign_command(FileExistsCheckData { path, found: false }.into(), None);
    }

    pub fn create_file_meta_data_retrieval(
        &self,
        path: RequestPath,
    ) {
        let data = FileMetaDataRetrievalData {
            path,
            file_size: 0,
            found: false,
        };
        self.assign_command(data.into(), None);
    }

    pub fn create_cancel(
        &self,
        target: FileRequestPtr,
    ) {
        self.assign_command(CancelData { target }.into(), None);
    }

    pub fn create_reschedule(
        &self,
        target: FileRequestPtr,
        new_deadline: Deadline,
        new_priority: Priority,
    ) {
        let data = RescheduleData {
            target,
            new_deadline,
            new_priority,
        };
        self.assign_command(data.into(), None);
    }

    pub fn create_flush(
        &self,
        path: RequestPath,
    ) {
        self.assign_command(FlushData { path }.into(), None);
    }

    pub fn create_flush_all(&self) {
        self.assign_command(FlushAllData.into(), None);
    }

    pub fn create_dedicated_cache_creation(
        &self,
        parent: Option<&Arc<FileRequest>>,
        path: RequestPath,
        range: FileRange,
    ) {
        self.assign_command(CreateDedicatedCacheData { path, range }.into(), parent);
    }

    pub fn create_dedicated_cache_destruction(
        &self,
        parent: Option<&Arc<FileRequest>>,
        path: RequestPath,
        range: FileRange,
    ) {
        self.assign_command(DestroyDedicatedCacheData { path, range }.into(), parent);
    }

    pub fn create_report(
        &self,
        report_type: ReportType,
    ) {
        let data = ReportData {
            report_type,
            output: Vec::default(),
        };
        self.assign_command(data.into(), None);
    }

    pub fn create_custom(
        &self,
        parent: Option<&Arc<FileRequest>>,
        data: Box<dyn Any + Send>,
        fail_when_unhandled: bool,
    ) {
        let data = CustomData {
            data,
            fail_when_unhandled,
        };
        self.assign_command(data.into(), parent);
    }

    pub fn create_wait(
        &self,
        parent: Option<&Arc<FileRequest>>,
    ) {
        self.assign_command(WaitData.into(), parent);
    }

    fn assign_command(
        &self,
        new_command: FileRequestCommand,
        parent: Option<&Arc<FileRequest>>,
    ) {
        {
            let mut command = self.command.lock().unwrap();
            assert_unassigned(&command, new_command.name());
            *command = new_command;
        }
        self.set_optional_parent(parent);
    }

    //
    // Dependencies
    //

    /// Registers this request as a dependency of `parent`. Does nothing if there's no parent.
    pub fn set_optional_parent(
        &self,
        parent: Option<&Arc<FileRequest>>,
    ) {
        if let Some(parent) = parent {
            *self.parent.lock().unwrap() = Some(Arc::downgrade(parent));
            parent.add_dependency();
        }
    }

    pub fn parent(&self) -> Option<Arc<FileRequest>> {
        self.parent.lock().unwrap().as_ref().and_then(|x| x.upgrade())
    }

    pub fn num_dependencies(&self) -> u32 {
        self.dependencies.load(Ordering::Acquire)
    }

    fn add_dependency(&self) {
        let result = self
            .dependencies
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count < MAX_DEPENDENCY_COUNT {
                    Some(count + 1)
                } else {
                    None
                }
            });
        assert!(
            result.is_ok(),
            "A file request can't have more than {} dependencies",
            MAX_DEPENDENCY_COUNT
        );
    }

    /// Marks one dependency as resolved and returns how many are left.
    pub fn remove_dependency(&self) -> u32 {
        let result = self
            .dependencies
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match result {
            Ok(previous) => previous - 1,
            Err(_) => panic!("A dependency was resolved on a file request that has none"),
        }
    }

    /// True if this request, or any request it's a dependency of, stands in for `request`.
    /// `request` can be a [`FileRequestPtr`] or a [`FileRequestHandle`](crate::FileRequestHandle).
    pub fn works_on<T>(
        &self,
        request: &T,
    ) -> bool
    where
        FileRequestPtr: PartialEq<T>,
    {
        if self.links_to(request) {
            return true;
        }

        let mut next = self.parent();
        while let Some(current) = next {
            if current.links_to(request) {
                return true;
            }
            next = current.parent();
        }

        false
    }

    fn links_to<T>(
        &self,
        request: &T,
    ) -> bool
    where
        FileRequestPtr: PartialEq<T>,
    {
        match &*self.command.lock().unwrap() {
            FileRequestCommand::ExternalRequest(link) => link.request == *request,
            _ => false,
        }
    }

    //
    // Command access
    //

    pub fn command(&self) -> MutexGuard<'_, FileRequestCommand> {
        self.command.lock().unwrap()
    }

    /// Finds the closest request, starting with this one and moving up through the parents,
    /// whose command is a `T` and runs `f` on it.
    pub fn command_from_chain<T: CommandVariant, R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        if let Some(data) = T::from_command_mut(&mut self.command()) {
            return Some(f(data));
        }

        let mut next = self.parent();
        while let Some(current) = next {
            {
                let mut command = current.command();
                if let Some(data) = T::from_command_mut(&mut command) {
                    return Some(f(data));
                }
            }
            next = current.parent();
        }

        None
    }

    pub fn fails_when_unhandled(&self) -> bool {
        self.command().fails_when_unhandled()
    }

    //
    // Status
    //

    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Moves the request to `status` unless that would reopen a finished request, succeed or
    /// cancel after it already failed or cancel after it finished. Moving to `Failed` is always
    /// accepted. Returns whether the status was changed.
    pub fn set_status(
        &self,
        status: RequestStatus,
    ) -> bool {
        let result = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if RequestStatus::from_u8(current).can_transition_to(status) {
                    Some(status as u8)
                } else {
                    None
                }
            });

        if let Err(current) = result {
            log::trace!(
                "Ignored status change from {:?} to {:?}",
                RequestStatus::from_u8(current),
                status
            );
        }

        result.is_ok()
    }

    //
    // Scheduling information
    //

    /// Sets the estimated completion on this request and all requests it's a dependency of, so
    /// the root of the tree always shows the latest estimate.
    pub fn set_estimated_completion(
        &self,
        time: Instant,
    ) {
        *self.estimated_completion.lock().unwrap() = Some(time);

        let mut next = self.parent();
        while let Some(current) = next {
            *current.estimated_completion.lock().unwrap() = Some(time);
            next = current.parent();
        }
    }

    pub fn estimated_completion(&self) -> Option<Instant> {
        *self.estimated_completion.lock().unwrap()
    }

    pub fn pending_id(&self) -> u64 {
        self.pending_id.load(Ordering::Relaxed)
    }

    pub fn set_pending_id(
        &self,
        pending_id: u64,
    ) {
        self.pending_id.store(pending_id, Ordering::Relaxed);
    }

    pub fn usage(&self) -> FileRequestUsage {
        self.usage
    }

    /// Claims the request for the completed queue. Returns false if it's already queued or was
    /// finalized since the last reset.
    pub(crate) fn try_queue_completion(&self) -> bool {
        self.completion_queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_queued_completion(&self) {
        self.completion_queued.store(false, Ordering::Release);
    }

    pub fn is_completion_queued(&self) -> bool {
        self.completion_queued.load(Ordering::Acquire)
    }

    //
    // Completion
    //

    pub fn set_on_completion(
        &self,
        callback: impl FnOnce(&FileRequest) + Send + 'static,
    ) {
        *self.on_completion.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn has_on_completion(&self) -> bool {
        self.on_completion.lock().unwrap().is_some()
    }

    /// Runs the completion callback. The callback is consumed, so it runs at most once even if
    /// this is called again. Returns whether a callback ran.
    pub fn invoke_on_completion(&self) -> bool {
        let callback = self.on_completion.lock().unwrap().take();
        match callback {
            Some(callback) => {
                callback(self);
                true
            }
            None => false,
        }
    }

    /// Puts the request back into the state it had when it was constructed.
    pub fn reset(&self) {
        // Dropped once all locks are released, the old command may hold references to other
        // requests which get recycled as a result
        let previous_command = std::mem::take(&mut *self.command.lock().unwrap());
        let previous_callback = self.on_completion.lock().unwrap().take();
        *self.estimated_completion.lock().unwrap() = None;
        *self.parent.lock().unwrap() = None;
        self.status
            .store(RequestStatus::Pending as u8, Ordering::Release);
        self.dependencies.store(0, Ordering::Release);
        self.completion_queued.store(false, Ordering::Release);

        drop(previous_callback);
        drop(previous_command);
    }
}

fn assert_unassigned(
    command: &FileRequestCommand,
    new_command_name: &str,
) {
    assert!(
        command.is_empty(),
        "Attempting to set FileRequest to '{}', but '{}' was already assigned",
        new_command_name,
        command.name()
    );
}

impl fmt::Debug for FileRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let command_name = self
            .command
            .try_lock()
            .map(|x| x.name())
            .unwrap_or("<locked>");
        f.debug_struct("FileRequest")
            .field("command", &command_name)
            .field("status", &self.status())
            .field("dependencies", &self.num_dependencies())
            .field("pending_id", &self.pending_id())
            .field("usage", &self.usage)
            .finish()
    }
}
