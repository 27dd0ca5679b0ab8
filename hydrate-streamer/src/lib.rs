//! Request graph for asynchronous file streaming.
//!
//! A [`FileRequest`] describes one operation (a read, an existence check, a cancel, ...). Requests
//! form trees where a parent only resolves once all of its children resolved. External code
//! holds requests through [`FileRequestPtr`] and the [`StreamerContext`] hands requests out,
//! finalizes them once they complete and recycles them.

mod streamer_types;
pub use streamer_types::*;

mod streamer_error;
pub use streamer_error::*;

mod config;
pub use config::StreamerContextConfig;

mod request_path;
pub use request_path::RequestPath;

mod compression_info;
pub use compression_info::{CompressionInfo, CompressionTag};

mod statistics;
pub use statistics::{Statistic, StatisticValue};

pub mod request_command;
pub use request_command::{CommandVariant, FileRequestCommand};

mod file_request;
pub use file_request::{FileRequest, FileRequestUsage, OnCompletionCallback, MAX_DEPENDENCY_COUNT};

mod request_handle;
pub use request_handle::{ExternalFileRequest, FileRequestHandle, FileRequestPtr};

mod streamer_context;
pub use streamer_context::{RequestRecycler, StreamerContext};
