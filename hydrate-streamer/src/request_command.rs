//! The operation a [`FileRequest`](crate::FileRequest) describes.
//!
//! Every kind of operation has its own data struct and [`FileRequestCommand`] holds exactly one
//! of them. The per-kind policies (processing order and whether the request has to fail when no
//! backend handles it) are constants on the [`CommandVariant`] implementation of each struct.

use crate::streamer_types::{
    Deadline, FileRange, MemoryType, Priority, ReadBuffer, ReportType, RequestMemoryAllocator,
    PRIORITY_HIGH, PRIORITY_HIGHEST, PRIORITY_LOW, PRIORITY_LOWEST, PRIORITY_MEDIUM,
};
use crate::{CompressionInfo, FileRequestPtr, RequestPath, Statistic};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Links a request to a request that was issued from outside the streaming system. The request
/// holding this data becomes the parent of the external request, so the external chain can be
/// waited on and identified as a unit.
#[derive(Debug)]
pub struct ExternalRequestData {
    pub request: FileRequestPtr,
}

/// Stores a resolved path so requests further down the chain can use it.
#[derive(Debug)]
pub struct RequestPathStoreData {
    pub path: RequestPath,
}

/// Where a read request puts the data it reads.
pub enum ReadRequestOutput {
    /// Memory owned by the caller. The request writes into it but never frees it.
    Buffer(ReadBuffer),
    /// Memory requested from an allocator once the read is processed. The request owns the
    /// buffer until it's taken with [`ReadRequestData::take_output`].
    Allocator {
        allocator: Arc<dyn RequestMemoryAllocator>,
        buffer: Option<Vec<u8>>,
    },
}

impl fmt::Debug for ReadRequestOutput {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ReadRequestOutput::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
            ReadRequestOutput::Allocator { buffer, .. } => f
                .debug_struct("Allocator")
                .field("buffer_len", &buffer.as_ref().map(|x| x.len()))
                .finish(),
        }
    }
}

/// A read as issued by a caller, before it's split up into reads a device can service.
#[derive(Debug)]
pub struct ReadRequestData {
    pub path: RequestPath,
    pub output: ReadRequestOutput,
    pub output_size: u64,
    pub offset: u64,
    pub size: u64,
    pub deadline: Deadline,
    pub priority: Priority,
    pub memory_type: MemoryType,
}

impl ReadRequestData {
    pub fn with_buffer(
        path: RequestPath,
        output: ReadBuffer,
        output_size: u64,
        offset: u64,
        size: u64,
        deadline: Deadline,
        priority: Priority,
    ) -> Self {
        ReadRequestData {
            path,
            output: ReadRequestOutput::Buffer(output),
            output_size,
            offset,
            size,
            deadline,
            priority,
            memory_type: MemoryType::ReadWrite,
        }
    }

    /// The allocator is locked here and unlocked when this data is dropped.
    pub fn with_allocator(
        path: RequestPath,
        allocator: Arc<dyn RequestMemoryAllocator>,
        offset: u64,
        size: u64,
        deadline: Deadline,
        priority: Priority,
    ) -> Self {
        allocator.lock_allocator();
        ReadRequestData {
            path,
            output: ReadRequestOutput::Allocator {
                allocator,
                buffer: None,
            },
            output_size: 0,
            offset,
            size,
            deadline,
            priority,
            memory_type: MemoryType::ReadWrite,
        }
    }

    pub fn uses_allocator(&self) -> bool {
        matches!(self.output, ReadRequestOutput::Allocator { .. })
    }

    /// Makes sure there's memory to read into, asking the allocator for it if needed. Returns
    /// false if the allocator couldn't provide memory.
    pub fn allocate_output(
        &mut self,
        alignment: usize,
    ) -> bool {
        match &mut self.output {
            ReadRequestOutput::Buffer(_) => true,
            ReadRequestOutput::Allocator { allocator, buffer } => {
                if buffer.is_some() {
                    return true;
                }

                match allocator.allocate(self.size, self.size, alignment) {
                    Some(result) => {
                        self.output_size = result.buffer.len() as u64;
                        self.memory_type = result.memory_type;
                        *buffer = Some(result.buffer);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Runs `f` on the memory the read writes into. Returns `None` if the memory has not been
    /// allocated yet or was already taken.
    pub fn with_output<R>(
        &mut self,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        match &mut self.output {
            ReadRequestOutput::Buffer(buffer) => Some(f(&mut buffer.lock())),
            ReadRequestOutput::Allocator { buffer, .. } => buffer.as_mut().map(|x| f(x)),
        }
    }

    /// Hands an allocated buffer over to the caller. After this the buffer is no longer
    /// released when this data is dropped. Always `None` for caller provided buffers.
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        match &mut self.output {
            ReadRequestOutput::Buffer(_) => None,
            ReadRequestOutput::Allocator { buffer, .. } => buffer.take(),
        }
    }
}

impl Drop for ReadRequestData {
    fn drop(&mut self) {
        if let ReadRequestOutput::Allocator { allocator, buffer } = &mut self.output {
            if let Some(buffer) = buffer.take() {
                allocator.release(buffer);
            }
            allocator.unlock_allocator();
        }
    }
}

/// A read that a single device can service directly.
#[derive(Debug)]
pub struct ReadData {
    pub output: ReadBuffer,
    // Offset into the output the data is written to
    pub output_offset: u64,
    pub path: RequestPath,
    pub offset: u64,
    pub size: u64,
    // Allow other readers to share the data that's being read
    pub shared_read: bool,
}

/// A read of data that has to be decompressed before it's usable.
#[derive(Debug)]
pub struct CompressedReadData {
    pub compression_info: CompressionInfo,
    pub output: ReadBuffer,
    // Offset and size within the uncompressed data
    pub read_offset: u64,
    pub read_size: u64,
}

#[derive(Debug)]
pub struct FileExistsCheckData {
    pub path: RequestPath,
    pub found: bool,
}

#[derive(Debug)]
pub struct FileMetaDataRetrievalData {
    pub path: RequestPath,
    pub file_size: u64,
    pub found: bool,
}

#[derive(Debug)]
pub struct CancelData {
    pub target: FileRequestPtr,
}

#[derive(Debug)]
pub struct RescheduleData {
    pub target: FileRequestPtr,
    pub new_deadline: Deadline,
    pub new_priority: Priority,
}

#[derive(Debug)]
pub struct FlushData {
    pub path: RequestPath,
}

#[derive(Debug)]
pub struct FlushAllData;

#[derive(Debug)]
pub struct CreateDedicatedCacheData {
    pub path: RequestPath,
    pub range: FileRange,
}

#[derive(Debug)]
pub struct DestroyDedicatedCacheData {
    pub path: RequestPath,
    pub range: FileRange,
}

#[derive(Debug)]
pub struct ReportData {
    pub report_type: ReportType,
    pub output: Vec<Statistic>,
}

/// Operation defined by a backend. The data is passed through untouched.
pub struct CustomData {
    pub data: Box<dyn Any + Send>,
    pub fail_when_unhandled: bool,
}

impl fmt::Debug for CustomData {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CustomData")
            .field("fail_when_unhandled", &self.fail_when_unhandled)
            .finish_non_exhaustive()
    }
}

/// Does no work of its own and completes once its dependencies complete.
#[derive(Debug)]
pub struct WaitData;

#[derive(Debug, Default)]
pub enum FileRequestCommand {
    /// Nothing has been assigned to the request yet
    #[default]
    Empty,
    ExternalRequest(ExternalRequestData),
    RequestPathStore(RequestPathStoreData),
    ReadRequest(ReadRequestData),
    Read(ReadData),
    CompressedRead(CompressedReadData),
    FileExistsCheck(FileExistsCheckData),
    FileMetaDataRetrieval(FileMetaDataRetrievalData),
    Cancel(CancelData),
    Reschedule(RescheduleData),
    Flush(FlushData),
    FlushAll(FlushAllData),
    CreateDedicatedCache(CreateDedicatedCacheData),
    DestroyDedicatedCache(DestroyDedicatedCacheData),
    Report(ReportData),
    Custom(CustomData),
    Wait(WaitData),
}

/// Implemented by the data struct of every kind of request.
pub trait CommandVariant: Sized {
    const NAME: &'static str;
    /// Hint for the order requests are processed in. Cancels go first so less work is wasted.
    const ORDER_PRIORITY: Priority;
    /// Whether a request of this kind has to fail if nothing handled it. [`CustomData`]
    /// overrides this per request.
    const FAIL_WHEN_UNHANDLED: bool;

    fn from_command(command: &FileRequestCommand) -> Option<&Self>;

    fn from_command_mut(command: &mut FileRequestCommand) -> Option<&mut Self>;
}

macro_rules! command_variant {
    ($data:ty, $variant:ident, $priority:expr, $fail_when_unhandled:expr) => {
        impl CommandVariant for $data {
            const NAME: &'static str = stringify!($variant);
            const ORDER_PRIORITY: Priority = $priority;
            const FAIL_WHEN_UNHANDLED: bool = $fail_when_unhandled;

            fn from_command(command: &FileRequestCommand) -> Option<&Self> {
                match command {
                    FileRequestCommand::$variant(data) => Some(data),
                    _ => None,
                }
            }

            fn from_command_mut(command: &mut FileRequestCommand) -> Option<&mut Self> {
                match command {
                    FileRequestCommand::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }

        impl From<$data> for FileRequestCommand {
            fn from(data: $data) -> Self {
                FileRequestCommand::$variant(data)
            }
        }
    };
}

command_variant!(ExternalRequestData, ExternalRequest, PRIORITY_LOWEST, true);
command_variant!(RequestPathStoreData, RequestPathStore, PRIORITY_MEDIUM, true);
command_variant!(ReadRequestData, ReadRequest, PRIORITY_MEDIUM, true);
command_variant!(ReadData, Read, PRIORITY_MEDIUM, true);
command_variant!(CompressedReadData, CompressedRead, PRIORITY_MEDIUM, true);
command_variant!(FileExistsCheckData, FileExistsCheck, PRIORITY_HIGH, true);
command_variant!(FileMetaDataRetrievalData, FileMetaDataRetrieval, PRIORITY_HIGH, true);
command_variant!(CancelData, Cancel, PRIORITY_HIGHEST, false);
command_variant!(RescheduleData, Reschedule, PRIORITY_HIGH, false);
command_variant!(FlushData, Flush, PRIORITY_HIGH, false);
command_variant!(FlushAllData, FlushAll, PRIORITY_LOW, false);
command_variant!(CreateDedicatedCacheData, CreateDedicatedCache, PRIORITY_HIGH, true);
command_variant!(DestroyDedicatedCacheData, DestroyDedicatedCache, PRIORITY_HIGH, true);
command_variant!(ReportData, Report, PRIORITY_LOW, false);
command_variant!(CustomData, Custom, PRIORITY_LOWEST, true);
command_variant!(WaitData, Wait, PRIORITY_MEDIUM, false);

struct VariantInfo {
    name: &'static str,
    order_priority: Priority,
    fail_when_unhandled: bool,
}

impl VariantInfo {
    fn of<T: CommandVariant>() -> Self {
        VariantInfo {
            name: T::NAME,
            order_priority: T::ORDER_PRIORITY,
            fail_when_unhandled: T::FAIL_WHEN_UNHANDLED,
        }
    }
}

impl FileRequestCommand {
    pub fn is_empty(&self) -> bool {
        matches!(self, FileRequestCommand::Empty)
    }

    fn variant_info(&self) -> Option<VariantInfo> {
        use FileRequestCommand::*;
        let info = match self {
            Empty => return None,
            ExternalRequest(_) => VariantInfo::of::<ExternalRequestData>(),
            RequestPathStore(_) => VariantInfo::of::<RequestPathStoreData>(),
            ReadRequest(_) => VariantInfo::of::<ReadRequestData>(),
            Read(_) => VariantInfo::of::<ReadData>(),
            CompressedRead(_) => VariantInfo::of::<CompressedReadData>(),
            FileExistsCheck(_) => VariantInfo::of::<FileExistsCheckData>(),
            FileMetaDataRetrieval(_) => VariantInfo::of::<FileMetaDataRetrievalData>(),
            Cancel(_) => VariantInfo::of::<CancelData>(),
            Reschedule(_) => VariantInfo::of::<RescheduleData>(),
            Flush(_) => VariantInfo::of::<FlushData>(),
            FlushAll(_) => VariantInfo::of::<FlushAllData>(),
            CreateDedicatedCache(_) => VariantInfo::of::<CreateDedicatedCacheData>(),
            DestroyDedicatedCache(_) => VariantInfo::of::<DestroyDedicatedCacheData>(),
            Report(_) => VariantInfo::of::<ReportData>(),
            Custom(_) => VariantInfo::of::<CustomData>(),
            Wait(_) => VariantInfo::of::<WaitData>(),
        };
        Some(info)
    }

    pub fn name(&self) -> &'static str {
        self.variant_info().map(|x| x.name).unwrap_or("Empty")
    }

    pub fn order_priority(&self) -> Priority {
        match self.variant_info() {
            Some(info) => info.order_priority,
            None => panic!("Order priority requested for a request that has no command assigned"),
        }
    }

    pub fn fails_when_unhandled(&self) -> bool {
        match self {
            FileRequestCommand::Custom(data) => data.fail_when_unhandled,
            _ => match self.variant_info() {
                Some(info) => info.fail_when_unhandled,
                None => panic!(
                    "Unhandled failure policy requested for a request that has no command assigned"
                ),
            },
        }
    }

    pub fn get<T: CommandVariant>(&self) -> Option<&T> {
        T::from_command(self)
    }

    pub fn get_mut<T: CommandVariant>(&mut self) -> Option<&mut T> {
        T::from_command_mut(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streamer_types::{NO_DEADLINE, PRIORITY_MEDIUM};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingAllocator {
        locks: AtomicUsize,
        unlocks: AtomicUsize,
        allocations: AtomicUsize,
        releases: AtomicUsize,
        released_sizes: Mutex<Vec<usize>>,
    }

    impl RequestMemoryAllocator for CountingAllocator {
        fn lock_allocator(&self) {
            self.locks.fetch_add(1, Ordering::SeqCst);
        }

        fn unlock_allocator(&self) {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
        }

        fn allocate(
            &self,
            _minimal_size: u64,
            recommended_size: u64,
            _alignment: usize,
        ) -> Option<crate::RequestMemoryAllocatorResult> {
            self.allocations.fetch_add(1, Ordering::SeqCst);
            Some(crate::RequestMemoryAllocatorResult {
                buffer: vec![0; recommended_size as usize],
                memory_type: MemoryType::WriteCombined,
            })
        }

        fn release(
            &self,
            buffer: Vec<u8>,
        ) {
            self.released_sizes.lock().unwrap().push(buffer.len());
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn allocator_read(allocator: &Arc<CountingAllocator>) -> ReadRequestData {
        ReadRequestData::with_allocator(
            RequestPath::new("data.pak"),
            allocator.clone(),
            0,
            128,
            NO_DEADLINE,
            PRIORITY_MEDIUM,
        )
    }

    #[test]
    fn dropping_unclaimed_allocation_releases_it() {
        let allocator = Arc::new(CountingAllocator::default());
        let mut data = allocator_read(&allocator);
        assert_eq!(allocator.locks.load(Ordering::SeqCst), 1);
        assert!(data.allocate_output(1));
        assert_eq!(data.output_size, 128);
        assert_eq!(data.memory_type, MemoryType::WriteCombined);
        drop(data);

        assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
        assert_eq!(*allocator.released_sizes.lock().unwrap(), vec![128]);
        assert_eq!(allocator.unlocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_without_allocation_only_unlocks() {
        let allocator = Arc::new(CountingAllocator::default());
        drop(allocator_read(&allocator));

        assert_eq!(allocator.allocations.load(Ordering::SeqCst), 0);
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 0);
        assert_eq!(allocator.unlocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn taken_output_is_not_released() {
        let allocator = Arc::new(CountingAllocator::default());
        let mut data = allocator_read(&allocator);
        assert!(data.allocate_output(1));
        data.with_output(|x| x[0] = 42).unwrap();
        let output = data.take_output().unwrap();
        assert_eq!(output[0], 42);
        drop(data);

        assert_eq!(allocator.releases.load(Ordering::SeqCst), 0);
        assert_eq!(allocator.unlocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allocating_twice_keeps_first_buffer() {
        let allocator = Arc::new(CountingAllocator::default());
        let mut data = allocator_read(&allocator);
        assert!(data.allocate_output(1));
        assert!(data.allocate_output(1));
        assert_eq!(allocator.allocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn caller_buffer_is_left_alone() {
        let buffer = ReadBuffer::new(16);
        let mut data = ReadRequestData::with_buffer(
            RequestPath::new("data.pak"),
            buffer.clone(),
            16,
            0,
            16,
            NO_DEADLINE,
            PRIORITY_MEDIUM,
        );
        assert!(!data.uses_allocator());
        assert!(data.allocate_output(1));
        data.with_output(|x| x[3] = 9).unwrap();
        assert!(data.take_output().is_none());
        drop(data);
        assert_eq!(buffer.lock()[3], 9);
    }

    #[test]
    fn fail_policies() {
        let wait: FileRequestCommand = WaitData.into();
        assert!(!wait.fails_when_unhandled());
        let flush_all: FileRequestCommand = FlushAllData.into();
        assert!(!flush_all.fails_when_unhandled());
        let exists: FileRequestCommand = FileExistsCheckData {
            path: RequestPath::new("a"),
            found: false,
        }
        .into();
        assert!(exists.fails_when_unhandled());
        assert_eq!(exists.order_priority(), PRIORITY_HIGH);

        let custom_ignored: FileRequestCommand = CustomData {
            data: Box::new(5u32),
            fail_when_unhandled: false,
        }
        .into();
        assert!(!custom_ignored.fails_when_unhandled());
        let custom_required: FileRequestCommand = CustomData {
            data: Box::new(5u32),
            fail_when_unhandled: true,
        }
        .into();
        assert!(custom_required.fails_when_unhandled());
    }

    #[test]
    #[should_panic]
    fn empty_command_has_no_fail_policy() {
        FileRequestCommand::Empty.fails_when_unhandled();
    }

    #[test]
    fn typed_access() {
        let mut command: FileRequestCommand = FileMetaDataRetrievalData {
            path: RequestPath::new("a"),
            file_size: 0,
            found: false,
        }
        .into();
        assert_eq!(command.name(), "FileMetaDataRetrieval");
        assert!(command.get::<FileExistsCheckData>().is_none());
        let data = command.get_mut::<FileMetaDataRetrievalData>().unwrap();
        data.file_size = 10;
        data.found = true;
        assert_eq!(command.get::<FileMetaDataRetrievalData>().unwrap().file_size, 10);
        assert_eq!(FileRequestCommand::Empty.name(), "Empty");
    }
}
