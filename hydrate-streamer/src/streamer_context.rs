use crate::{
    ExternalFileRequest, FileRequest, FileRequestPtr, FileRequestUsage, ReportType, RequestStatus,
    Statistic, StreamerContextConfig,
};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

const STATISTICS_OWNER: &str = "StreamerContext";

/// Takes back an external request once nothing outside the streaming system references it.
pub trait RequestRecycler: Send + Sync {
    fn recycle_request(
        &self,
        request: Arc<ExternalFileRequest>,
    );
}

/// Hands out requests, takes them back for reuse and resolves completed requests.
///
/// Completed requests are queued with [`mark_request_as_completed`](Self::mark_request_as_completed)
/// from any thread. [`finalize_completed_requests`](Self::finalize_completed_requests) then runs
/// their callbacks, resolves the dependency they were for on their parent and recycles them.
pub struct StreamerContext {
    config: StreamerContextConfig,
    self_ref: Weak<StreamerContext>,
    internal_requests: Mutex<Vec<Arc<FileRequest>>>,
    external_requests: Mutex<Vec<Arc<ExternalFileRequest>>>,
    completed_tx: Sender<Arc<FileRequest>>,
    completed_rx: Receiver<Arc<FileRequest>>,
    internal_requests_allocated: AtomicUsize,
    external_requests_allocated: AtomicUsize,
    finalized_request_count: AtomicUsize,
}

impl StreamerContext {
    pub fn new(config: StreamerContextConfig) -> Arc<Self> {
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
        Arc::new_cyclic(|self_ref: &Weak<StreamerContext>| {
            let owner: Weak<dyn RequestRecycler> = self_ref.clone();
            let internal_requests = (0..config.initial_internal_requests)
                .map(|_| Arc::new(FileRequest::new(FileRequestUsage::Internal)))
                .collect();
            let external_requests = (0..config.initial_external_requests)
                .map(|_| ExternalFileRequest::new(owner.clone()))
                .collect();

            log::debug!(
                "Created streamer context with {} internal and {} external requests",
                config.initial_internal_requests,
                config.initial_external_requests
            );

            StreamerContext {
                internal_requests_allocated: AtomicUsize::new(config.initial_internal_requests),
                external_requests_allocated: AtomicUsize::new(config.initial_external_requests),
                finalized_request_count: AtomicUsize::new(0),
                config,
                self_ref: self_ref.clone(),
                internal_requests: Mutex::new(internal_requests),
                external_requests: Mutex::new(external_requests),
                completed_tx,
                completed_rx,
            }
        })
    }

    pub fn config(&self) -> &StreamerContextConfig {
        &self.config
    }

    //
    // Request allocation
    //

    pub fn get_new_internal_request(&self) -> Arc<FileRequest> {
        let pooled = self.internal_requests.lock().unwrap().pop();
        pooled.unwrap_or_else(|| {
            self.internal_requests_allocated
                .fetch_add(1, Ordering::Relaxed);
            Arc::new(FileRequest::new(FileRequestUsage::Internal))
        })
    }

    pub fn get_new_external_request(&self) -> FileRequestPtr {
        let pooled = self.external_requests.lock().unwrap().pop();
        let external = pooled.unwrap_or_else(|| self.allocate_external_request());
        FileRequestPtr::new(external)
    }

    pub fn get_new_external_request_batch(
        &self,
        count: usize,
    ) -> Vec<FileRequestPtr> {
        let mut requests = Vec::with_capacity(count);
        {
            let mut pool = self.external_requests.lock().unwrap();
            let pooled_count = count.min(pool.len());
            let first_taken = pool.len() - pooled_count;
            requests.extend(pool.drain(first_taken..).map(FileRequestPtr::new));
        }

        while requests.len() < count {
            requests.push(FileRequestPtr::new(self.allocate_external_request()));
        }

        requests
    }

    fn allocate_external_request(&self) -> Arc<ExternalFileRequest> {
        self.external_requests_allocated
            .fetch_add(1, Ordering::Relaxed);
        let owner: Weak<dyn RequestRecycler> = self.self_ref.clone();
        ExternalFileRequest::new(owner)
    }

    //
    // Recycling
    //

    pub fn recycle_internal_request(
        &self,
        request: Arc<FileRequest>,
    ) {
        assert_eq!(
            request.usage(),
            FileRequestUsage::Internal,
            "Only internal requests can be recycled directly"
        );

        // Reset outside of the pool lock, dropping the old command can recycle other requests
        request.reset();

        let mut pool = self.internal_requests.lock().unwrap();
        if pool.len() < self.config.max_pooled_internal_requests {
            pool.push(request);
        } else {
            log::trace!("Internal request pool is full, freeing recycled request");
        }
    }

    //
    // Completion
    //

    /// Queues a request to be finalized. Can be called from any thread.
    ///
    /// A request is queued at most once until it's reset, so a worker completing a request while
    /// another thread cancels it doesn't finalize or recycle it twice. A request that still has
    /// dependencies when it's finalized waits for its last dependency to queue it again.
    pub fn mark_request_as_completed(
        &self,
        request: Arc<FileRequest>,
    ) {
        if !request.try_queue_completion() {
            log::trace!("Request was already marked as completed {:?}", request);
            return;
        }

        log::trace!("Request marked as completed {:?}", request);
        // The receiver lives as long as self, so this can't fail
        let _ = self.completed_tx.send(request);
    }

    /// Resolves a request no backend knew how to process, failing it if its kind requires that.
    pub fn complete_unhandled_request(
        &self,
        request: Arc<FileRequest>,
    ) {
        if request.fails_when_unhandled() {
            log::warn!(
                "{} request was not handled by any backend and has failed",
                request.command().name()
            );
            request.set_status(RequestStatus::Failed);
        } else {
            log::debug!(
                "{} request was not handled by any backend",
                request.command().name()
            );
            request.set_status(RequestStatus::Completed);
        }

        self.mark_request_as_completed(request);
    }

    /// Finalizes every request that was marked as completed, including parents that complete as a
    /// result. Returns true if any request was finalized.
    #[profiling::function]
    pub fn finalize_completed_requests(&self) -> bool {
        let mut has_finalized = false;
        while let Ok(request) = self.completed_rx.try_recv() {
            has_finalized = true;
            self.finalize_request(request);
        }

        has_finalized
    }

    fn finalize_request(
        &self,
        request: Arc<FileRequest>,
    ) {
        if request.num_dependencies() > 0 {
            request.clear_queued_completion();
            // The last dependency may have resolved before the flag was cleared
            if request.num_dependencies() > 0 || !request.try_queue_completion() {
                log::debug!(
                    "Deferring finalize of {:?} until its dependencies resolve",
                    request
                );
                return;
            }
        }

        // Anything that was marked completed without a final outcome did all of its work
        request.set_status(RequestStatus::Completed);
        let status = request.status();
        log::debug!("Finalizing {:?}", request);

        let parent = request.parent();
        request.invoke_on_completion();

        if let Some(parent) = parent {
            if matches!(status, RequestStatus::Failed | RequestStatus::Canceled) {
                parent.set_status(status);
            }

            if parent.remove_dependency() == 0 {
                parent.set_status(RequestStatus::Completed);
                self.mark_request_as_completed(parent);
            }
        }

        self.finalized_request_count
            .fetch_add(1, Ordering::Relaxed);

        if request.usage() == FileRequestUsage::Internal {
            self.recycle_internal_request(request);
        }
    }

    //
    // Reporting
    //

    pub fn report(
        &self,
        report_type: ReportType,
        output: &mut Vec<Statistic>,
    ) {
        match report_type {
            ReportType::Config => {
                output.push(Statistic::create_integer(
                    STATISTICS_OWNER,
                    "Initial internal requests",
                    self.config.initial_internal_requests as i64,
                    "Number of internal requests allocated when the context was created",
                ));
                output.push(Statistic::create_integer(
                    STATISTICS_OWNER,
                    "Initial external requests",
                    self.config.initial_external_requests as i64,
                    "Number of external requests allocated when the context was created",
                ));
                output.push(Statistic::create_integer(
                    STATISTICS_OWNER,
                    "Max pooled internal requests",
                    self.config.max_pooled_internal_requests as i64,
                    "Number of recycled internal requests kept for reuse",
                ));
                output.push(Statistic::create_integer(
                    STATISTICS_OWNER,
                    "Max pooled external requests",
                    self.config.max_pooled_external_requests as i64,
                    "Number of recycled external requests kept for reuse",
                ));
            }
            // The context doesn't hold files open
            ReportType::FileLocks => {}
        }
    }

    pub fn collect_statistics(
        &self,
        statistics: &mut Vec<Statistic>,
    ) {
        let pooled_internal = self.internal_requests.lock().unwrap().len();
        let pooled_external = self.external_requests.lock().unwrap().len();
        let allocated_internal = self.internal_requests_allocated.load(Ordering::Relaxed);
        let allocated_external = self.external_requests_allocated.load(Ordering::Relaxed);

        statistics.push(Statistic::create_integer(
            STATISTICS_OWNER,
            "Available internal requests",
            pooled_internal as i64,
            "Internal requests that are ready to be reused",
        ));
        statistics.push(Statistic::create_integer(
            STATISTICS_OWNER,
            "Available external requests",
            pooled_external as i64,
            "External requests that are ready to be reused",
        ));
        statistics.push(Statistic::create_integer(
            STATISTICS_OWNER,
            "Allocated internal requests",
            allocated_internal as i64,
            "Internal requests allocated over the lifetime of the context",
        ));
        statistics.push(Statistic::create_integer(
            STATISTICS_OWNER,
            "Allocated external requests",
            allocated_external as i64,
            "External requests allocated over the lifetime of the context",
        ));
        statistics.push(Statistic::create_integer(
            STATISTICS_OWNER,
            "Pending completions",
            self.completed_rx.len() as i64,
            "Requests waiting to be finalized",
        ));
        statistics.push(Statistic::create_integer(
            STATISTICS_OWNER,
            "Finalized requests",
            self.finalized_request_count.load(Ordering::Relaxed) as i64,
            "Requests finalized over the lifetime of the context",
        ));
    }

    pub fn available_internal_requests(&self) -> usize {
        self.internal_requests.lock().unwrap().len()
    }

    pub fn available_external_requests(&self) -> usize {
        self.external_requests.lock().unwrap().len()
    }
}

impl RequestRecycler for StreamerContext {
    fn recycle_request(
        &self,
        request: Arc<ExternalFileRequest>,
    ) {
        request.request().reset();

        let mut pool = self.external_requests.lock().unwrap();
        if pool.len() < self.config.max_pooled_external_requests {
            pool.push(request);
        } else {
            log::trace!("External request pool is full, freeing recycled request");
        }
    }
}

impl Drop for StreamerContext {
    fn drop(&mut self) {
        let unfinalized = self.completed_rx.len();
        if unfinalized > 0 {
            log::warn!(
                "Streamer context dropped with {} completed request(s) that were never finalized",
                unfinalized
            );
        }
    }
}

impl std::fmt::Debug for StreamerContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StreamerContext")
            .field("config", &self.config)
            .field("available_internal_requests", &self.available_internal_requests())
            .field("available_external_requests", &self.available_external_requests())
            .finish()
    }
}
