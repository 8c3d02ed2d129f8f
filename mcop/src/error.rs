use crate::message::ReturnStatus;
use thiserror::Error;

/// Errors raised inside the runtime. The invocation and audio surfaces
/// collapse these into `bool`/last-error results and a log line.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no reply for request {0} within {1} ms")]
    Timeout(u32, u64),

    #[error("reply for unknown request {0}")]
    UnknownRequest(u32),

    #[error("remote side answered {0:?}")]
    Remote(ReturnStatus),

    #[error("malformed message: {0}")]
    BadMessage(String),

    #[error("thread strategy already registered ({0})")]
    AlreadyRegistered(&'static str),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn device_open_error(direction: &str, device: &str, err: impl std::fmt::Display) -> String {
    format!("Failed to open OSS {direction} '{device}': {err}")
}

pub fn device_io_error(direction: &str, op: &str, err: impl std::fmt::Display) -> String {
    format!("OSS {direction} {op} failed: {err}")
}
