use crossbeam_channel::{Receiver, Sender};
use hydrate_streamer::request_command::{
    CancelData, FileExistsCheckData, FileMetaDataRetrievalData, ReadRequestData, ReportData,
};
use hydrate_streamer::{
    DefaultRequestMemoryAllocator, FileRequest, FileRequestCommand, FileRequestPtr, ReadBuffer,
    ReportType, RequestMemoryAllocator, RequestPath, RequestStatus, StreamerContext,
    StreamerContextConfig, NO_DEADLINE, PRIORITY_HIGH, PRIORITY_MEDIUM,
};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

fn demo_file_path() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml"))
}

// Services requests on its own thread using blocking file IO
struct DeviceThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DeviceThread {
    fn new(
        context: Arc<StreamerContext>,
        request_rx: Receiver<Arc<FileRequest>>,
    ) -> Self {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("Device Thread".into())
            .spawn(move || {
                profiling::register_thread!("DeviceThread");
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            match msg {
                                Ok(request) => process_request(&context, request),
                                Err(_) => break,
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .unwrap();

        DeviceThread {
            finish_tx,
            join_handle,
        }
    }

    fn finish(self) {
        self.finish_tx.send(()).unwrap();
        self.join_handle.join().unwrap();
    }
}

fn read_file_range(
    data: &mut ReadRequestData,
) -> std::io::Result<u64> {
    if !data.allocate_output(1) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "allocator could not provide memory",
        ));
    }

    let mut file = std::fs::File::open(data.path.as_str())?;
    let file_size = file.metadata()?.len();
    let size = data.size.min(file_size.saturating_sub(data.offset));
    file.seek(SeekFrom::Start(data.offset))?;
    data.with_output(|output| file.read_exact(&mut output[..size as usize]))
        .unwrap_or(Ok(()))?;
    Ok(size)
}

fn process_request(
    context: &StreamerContext,
    request: Arc<FileRequest>,
) {
    profiling::scope!("process_request");
    request.set_status(RequestStatus::Processing);

    let handled = {
        let mut command = request.command();
        match &mut *command {
            FileRequestCommand::ReadRequest(data) => {
                log::trace!("Start read of {}", data.path);
                match read_file_range(data) {
                    Ok(size) => {
                        log::debug!("Read {} bytes from {}", size, data.path);
                        request.set_status(RequestStatus::Completed);
                    }
                    Err(error) => {
                        log::error!("Read of {} failed: {}", data.path, error);
                        request.set_status(RequestStatus::Failed);
                    }
                }
                true
            }
            FileRequestCommand::FileExistsCheck(data) => {
                data.found = std::path::Path::new(data.path.as_str()).is_file();
                request.set_status(RequestStatus::Completed);
                true
            }
            FileRequestCommand::FileMetaDataRetrieval(data) => {
                match std::fs::metadata(data.path.as_str()) {
                    Ok(metadata) => {
                        data.file_size = metadata.len();
                        data.found = true;
                        request.set_status(RequestStatus::Completed);
                    }
                    Err(_) => {
                        request.set_status(RequestStatus::Failed);
                    }
                }
                true
            }
            FileRequestCommand::Report(data) => {
                context.report(data.report_type, &mut data.output);
                request.set_status(RequestStatus::Completed);
                true
            }
            _ => false,
        }
    };

    if handled {
        context.mark_request_as_completed(request);
    } else {
        context.complete_unhandled_request(request);
    }
}

// Holds issued requests until they are dispatched to the device
struct Scheduler {
    context: Arc<StreamerContext>,
    device_tx: Sender<Arc<FileRequest>>,
    pending: Vec<Arc<FileRequest>>,
    links: Vec<Arc<FileRequest>>,
}

impl Scheduler {
    fn issue(
        &mut self,
        request: &FileRequestPtr,
    ) {
        let link = self.context.get_new_internal_request();
        link.create_request_link(request.clone());
        request.set_status(RequestStatus::Queued);
        self.pending.push(request.request().clone());
        self.links.push(link);
    }

    #[profiling::function]
    fn dispatch(&mut self) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|x| std::cmp::Reverse(x.command().order_priority()));

        let mut canceled = vec![false; pending.len()];
        for i in 0..pending.len() {
            if canceled[i] {
                continue;
            }

            let request = &pending[i];
            let cancel_target = request
                .command()
                .get::<CancelData>()
                .map(|x| x.target.handle());
            match cancel_target {
                Some(target) => {
                    for (j, other) in pending.iter().enumerate() {
                        if j != i && !canceled[j] && other.works_on(&target) {
                            log::info!("Canceling {:?}", other);
                            other.set_status(RequestStatus::Canceled);
                            self.context.mark_request_as_completed(other.clone());
                            canceled[j] = true;
                        }
                    }
                    request.set_status(RequestStatus::Completed);
                    self.context.mark_request_as_completed(request.clone());
                }
                None => {
                    request.set_estimated_completion(Instant::now() + Duration::from_millis(1));
                    self.device_tx.send(request.clone()).unwrap();
                }
            }
        }

        // Finalized links are recycled by the context
        self.links.retain(|x| !x.command().is_empty());
    }
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => StreamerContextConfig::read_from_path(&PathBuf::from(path)).unwrap(),
        None => StreamerContextConfig::default(),
    };
    let context = StreamerContext::new(config);

    let (device_tx, device_rx) = crossbeam_channel::unbounded();
    let device_thread = DeviceThread::new(context.clone(), device_rx);
    let mut scheduler = Scheduler {
        context: context.clone(),
        device_tx,
        pending: Vec::default(),
        links: Vec::default(),
    };

    let path = RequestPath::from_path(&demo_file_path());
    let completed = Arc::new(AtomicUsize::new(0));
    let mut requests = Vec::default();

    // Read into memory owned by the caller
    let output = ReadBuffer::new(64);
    let read = context.get_new_external_request();
    read.create_read_request(path.clone(), output.clone(), 64, 0, 64, NO_DEADLINE, PRIORITY_MEDIUM);
    let read_output = output.clone();
    let completed_clone = completed.clone();
    read.set_on_completion(move |request| {
        let data = read_output.to_vec();
        log::info!(
            "Read finished with {:?}: {:?}",
            request.status(),
            String::from_utf8_lossy(&data)
        );
        completed_clone.fetch_add(1, Ordering::SeqCst);
    });
    requests.push(read);

    // Read into memory provided by an allocator once the read is processed
    let allocator = Arc::new(DefaultRequestMemoryAllocator::new());
    let allocated_read = context.get_new_external_request();
    allocated_read.create_read_request_with_allocator(
        path.clone(),
        allocator.clone(),
        16,
        32,
        NO_DEADLINE,
        PRIORITY_HIGH,
    );
    let completed_clone = completed.clone();
    let allocator_clone = allocator.clone();
    allocated_read.set_on_completion(move |request| {
        let output = request
            .command()
            .get_mut::<ReadRequestData>()
            .and_then(|x| x.take_output());
        log::info!(
            "Allocated read finished with {:?}, {:?} bytes",
            request.status(),
            output.as_ref().map(|x| x.len())
        );
        // Taken memory is ours to give back
        if let Some(output) = output {
            allocator_clone.release(output);
        }
        completed_clone.fetch_add(1, Ordering::SeqCst);
    });
    requests.push(allocated_read);

    let exists = context.get_new_external_request();
    exists.create_file_exists_check(path.clone());
    let completed_clone = completed.clone();
    exists.set_on_completion(move |request| {
        let found = request
            .command()
            .get::<FileExistsCheckData>()
            .map(|x| x.found);
        log::info!("Exists check finished: {:?}", found);
        completed_clone.fetch_add(1, Ordering::SeqCst);
    });
    requests.push(exists);

    let metadata = context.get_new_external_request();
    metadata.create_file_meta_data_retrieval(path.clone());
    let completed_clone = completed.clone();
    metadata.set_on_completion(move |request| {
        let file_size = request
            .command()
            .get::<FileMetaDataRetrievalData>()
            .map(|x| x.file_size);
        log::info!("Metadata retrieval finished: {:?} bytes", file_size);
        completed_clone.fetch_add(1, Ordering::SeqCst);
    });
    requests.push(metadata);

    // Issue a read and cancel it before it's dispatched
    let doomed = context.get_new_external_request();
    doomed.create_read_request(
        RequestPath::new("does/not/matter.bin"),
        ReadBuffer::new(8),
        8,
        0,
        8,
        NO_DEADLINE,
        PRIORITY_MEDIUM,
    );
    let completed_clone = completed.clone();
    doomed.set_on_completion(move |request| {
        log::info!("Doomed read finished with {:?}", request.status());
        completed_clone.fetch_add(1, Ordering::SeqCst);
    });
    let cancel = context.get_new_external_request();
    cancel.create_cancel(doomed.clone());
    requests.push(doomed);
    requests.push(cancel);

    let report = context.get_new_external_request();
    report.create_report(ReportType::Config);
    let completed_clone = completed.clone();
    report.set_on_completion(move |request| {
        if let Some(data) = request.command().get::<ReportData>() {
            println!("{}", serde_json::to_string_pretty(&data.output).unwrap());
        }
        completed_clone.fetch_add(1, Ordering::SeqCst);
    });
    requests.push(report);

    // Nothing handles a flush in this demo, it completes without failing
    let flush = context.get_new_external_request();
    flush.create_flush(path);
    requests.push(flush);

    for request in &requests {
        scheduler.issue(request);
    }
    scheduler.dispatch();

    let expected = 6;
    while completed.load(Ordering::SeqCst) < expected {
        profiling::scope!("Frame");
        if !context.finalize_completed_requests() {
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.dispatch();
        profiling::finish_frame!();
    }

    for request in &requests {
        log::info!("{:?}", request.request());
    }
    drop(requests);

    let mut statistics = Vec::default();
    context.collect_statistics(&mut statistics);
    println!("{}", serde_json::to_string_pretty(&statistics).unwrap());

    device_thread.finish();
}
