use {
    filament_core::{AllocationError, FlsError, ProtocolError},
    std::io,
    thiserror::Error,
};

/// Failure of an event-subsystem operation issued by a fiber.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    #[error("the event subsystem is not initialized")]
    NotInitialized,
    #[error("operation requires a fiber running on a runtime manager")]
    NotInFiber,
    #[error("descriptor was closed while waiting on it")]
    Closed,
    #[error("another fiber is already waiting for the same readiness on this descriptor")]
    Busy,
    #[error("event backend error: {0}")]
    Io(#[from] io::Error),
}

/// Non-blocking poll sentinels. `Ok(0)` from [`EventLoop::poll`](crate::EventLoop::poll) is a
/// valid "nothing ready" answer and is not represented here.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum PollError {
    #[error("the event subsystem is not initialized")]
    NotInitialized,
    #[error("another thread is polling; try again")]
    TryAgain,
}

/// Why a typed join did not produce the fiber's return value.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("fiber panicked: {0}")]
    Panicked(String),
    #[error("fiber was detached while the join was waiting")]
    DetachedWhileJoining,
    #[error("fiber result has an unexpected type")]
    UnexpectedPayload,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
    #[cfg(feature = "serde_json")]
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Any error this crate reports.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Fls(#[from] FlsError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unable to start the runtime: {0}")]
    Io(#[from] io::Error),
    #[error("not running on a runtime manager thread")]
    NoRuntime,
}
