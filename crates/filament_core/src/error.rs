use {crate::FLS_KEYS_MAX, std::io, thiserror::Error};

/// Misuse of join/try_join/detach against a fiber whose detach state has already moved past the
/// point the caller expected. Every failing path leaves the fiber untouched.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("fiber is detached")]
    Detached,
    #[error("fiber already has a joiner")]
    AlreadyJoined,
    #[error("fiber has not finished yet")]
    WouldBlock,
    #[error("fiber handle refers to an earlier generation of this fiber")]
    Stale,
    #[error("a fiber cannot join itself")]
    SelfJoin,
    #[error("fiber adapts an OS thread and never completes")]
    NotJoinable,
}

/// Fiber-local storage capacity or bounds violation.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FlsError {
    #[error("all {} fiber-local storage keys are in use", FLS_KEYS_MAX)]
    Exhausted,
    #[error("fiber-local storage key {0} is out of range")]
    InvalidKey(u32),
}

/// A fiber could not be created because its stack or context could not be allocated. Nothing
/// partially built is left behind.
#[derive(Debug, Error)]
#[error("unable to allocate a fiber with a {stack_size} byte stack")]
pub struct AllocationError {
    stack_size: usize,
    #[source]
    source: io::Error,
}

impl AllocationError {
    pub fn new(stack_size: usize, source: io::Error) -> Self {
        AllocationError { stack_size, source }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}
