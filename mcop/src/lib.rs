pub mod audio;
pub mod buffer;
pub mod chunk_queue;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod dynamic_request;
pub mod error;
pub mod message;
pub mod mutex;
pub mod notification;
pub mod object;
pub mod thread;
pub mod types;

pub use buffer::Buffer;
pub use config::{McopConfig, ThreadMode};
pub use dispatcher::Dispatcher;
pub use dynamic_request::DynamicRequest;
pub use error::{Error, Result};
pub use object::{ObjectReference, Skeleton};
pub use thread::Threads;
pub use types::{AnyValue, MethodSignature, TypeCode};

use std::sync::Arc;

/// Picks the thread strategy the config asks for and builds the dispatcher.
pub fn init(config: McopConfig) -> Arc<Dispatcher> {
    let threads = match config.threads {
        ThreadMode::Native => Threads::native(),
        ThreadMode::None => Threads::new(),
    };
    tracing::debug!("using '{}' threads", threads.active().name());
    Dispatcher::new(config, Arc::new(threads))
}
