use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Relative importance of a request. Higher values are processed first when deadlines tie.
pub type Priority = u8;

pub const PRIORITY_LOWEST: Priority = 0;
pub const PRIORITY_LOW: Priority = 64;
pub const PRIORITY_MEDIUM: Priority = 128;
pub const PRIORITY_HIGH: Priority = 192;
pub const PRIORITY_HIGHEST: Priority = 255;

/// Time budget, relative to when the request was queued, within which the data should be
/// available. Only the scheduler interprets this.
pub type Deadline = Duration;

pub const NO_DEADLINE: Deadline = Duration::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestStatus {
    // Request has been created but not handed to the scheduler yet
    Pending,
    // Request is waiting in the scheduler
    Queued,
    // Request is being worked on
    Processing,
    Completed,
    Canceled,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed
        )
    }

    // Once a request finished it can't be reopened, success can't follow a failure or cancel and
    // a cancel can't follow a finished request. Failing is always allowed.
    pub fn can_transition_to(
        self,
        next: RequestStatus,
    ) -> bool {
        use RequestStatus::*;
        match next {
            Pending | Queued | Processing => !self.is_terminal(),
            Completed => !matches!(self, Failed | Canceled),
            Canceled => !matches!(self, Failed | Completed),
            Failed => true,
        }
    }

    pub(crate) fn from_u8(value: u8) -> RequestStatus {
        match value {
            0 => RequestStatus::Pending,
            1 => RequestStatus::Queued,
            2 => RequestStatus::Processing,
            3 => RequestStatus::Completed,
            4 => RequestStatus::Canceled,
            5 => RequestStatus::Failed,
            _ => panic!("Invalid request status value {}", value),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ReportType {
    // Configuration of every node that processes requests
    Config,
    // Files that are currently held open
    FileLocks,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryType {
    ReadWrite,
    // Memory that is fast to write but slow to read back, for example memory shared with a GPU
    WriteCombined,
}

/// Part of a file that a dedicated cache covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileRange {
    EntireFile,
    Range { offset: u64, size: u64 },
}

impl FileRange {
    pub fn new(
        offset: u64,
        size: u64,
    ) -> Self {
        FileRange::Range { offset, size }
    }

    pub fn is_entire_file(&self) -> bool {
        matches!(self, FileRange::EntireFile)
    }

    pub fn offset(&self) -> u64 {
        match self {
            FileRange::EntireFile => 0,
            FileRange::Range { offset, .. } => *offset,
        }
    }
}

/// Output memory for a read that stays owned by whoever issued the read. The request holds a
/// clone of it and writes into it; it never frees or shrinks it.
#[derive(Clone, Default)]
pub struct ReadBuffer(Arc<Mutex<Vec<u8>>>);

impl ReadBuffer {
    pub fn new(size: usize) -> Self {
        ReadBuffer(Arc::new(Mutex::new(vec![0; size])))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        ReadBuffer(Arc::new(Mutex::new(data)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// True if both refer to the same storage
    pub fn ptr_eq(
        &self,
        other: &ReadBuffer,
    ) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for ReadBuffer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct RequestMemoryAllocatorResult {
    pub buffer: Vec<u8>,
    pub memory_type: MemoryType,
}

/// Provides memory for reads whose size is only known once the request is processed.
///
/// The allocator is locked for as long as a request may still allocate from it. Every
/// `lock_allocator` is paired with exactly one `unlock_allocator`, and every buffer handed out by
/// `allocate` either ends up with the caller or comes back through `release`.
pub trait RequestMemoryAllocator: Send + Sync {
    fn lock_allocator(&self);

    fn unlock_allocator(&self);

    /// Returns a buffer of at least `minimal_size` bytes. `recommended_size` may be larger to
    /// allow for alignment padding. Returns `None` if no memory is available.
    fn allocate(
        &self,
        minimal_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> Option<RequestMemoryAllocatorResult>;

    fn release(
        &self,
        buffer: Vec<u8>,
    );
}

/// Heap backed allocator that tracks outstanding locks and allocations.
#[derive(Default)]
pub struct DefaultRequestMemoryAllocator {
    lock_counter: AtomicI32,
    allocation_counter: AtomicI32,
}

impl DefaultRequestMemoryAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn lock_counter(&self) -> i32 {
        self.lock_counter.load(Ordering::Acquire)
    }

    pub fn allocation_counter(&self) -> i32 {
        self.allocation_counter.load(Ordering::Acquire)
    }
}

impl Drop for DefaultRequestMemoryAllocator {
    fn drop(&mut self) {
        let lock_counter = self.lock_counter();
        if lock_counter != 0 {
            log::error!(
                "DefaultRequestMemoryAllocator dropped while still locked {} time(s)",
                lock_counter
            );
        }

        let allocation_counter = self.allocation_counter();
        if allocation_counter != 0 {
            log::error!(
                "DefaultRequestMemoryAllocator dropped with {} allocation(s) not released",
                allocation_counter
            );
        }
    }
}

impl RequestMemoryAllocator for DefaultRequestMemoryAllocator {
    fn lock_allocator(&self) {
        self.lock_counter.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock_allocator(&self) {
        let previous = self.lock_counter.fetch_sub(1, Ordering::AcqRel);
        assert!(
            previous > 0,
            "DefaultRequestMemoryAllocator was unlocked more often than it was locked"
        );
    }

    fn allocate(
        &self,
        _minimal_size: u64,
        recommended_size: u64,
        _alignment: usize,
    ) -> Option<RequestMemoryAllocatorResult> {
        let size = usize::try_from(recommended_size).ok()?;
        self.allocation_counter.fetch_add(1, Ordering::AcqRel);
        Some(RequestMemoryAllocatorResult {
            buffer: vec![0; size],
            memory_type: MemoryType::ReadWrite,
        })
    }

    fn release(
        &self,
        buffer: Vec<u8>,
    ) {
        drop(buffer);
        let previous = self.allocation_counter.fetch_sub(1, Ordering::AcqRel);
        assert!(
            previous > 0,
            "DefaultRequestMemoryAllocator released more buffers than it allocated"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Queued.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Canceled.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
    }

    #[test]
    fn status_round_trips_through_u8() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Queued,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Canceled,
            RequestStatus::Failed,
        ] {
            assert_eq!(RequestStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn default_allocator_counts() {
        let allocator = DefaultRequestMemoryAllocator::new();
        allocator.lock_allocator();
        let result = allocator.allocate(10, 16, 1).unwrap();
        assert_eq!(result.buffer.len(), 16);
        assert_eq!(allocator.allocation_counter(), 1);
        allocator.release(result.buffer);
        allocator.unlock_allocator();
        assert_eq!(allocator.allocation_counter(), 0);
        assert_eq!(allocator.lock_counter(), 0);
    }

    #[test]
    fn read_buffer_shares_storage() {
        let buffer = ReadBuffer::new(4);
        let clone = buffer.clone();
        clone.lock()[2] = 7;
        assert_eq!(buffer.to_vec(), vec![0, 0, 7, 0]);
        assert!(buffer.ptr_eq(&clone));
        assert!(!buffer.ptr_eq(&ReadBuffer::new(4)));
    }
}
