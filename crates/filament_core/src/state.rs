use {
    crate::ProtocolError,
    std::sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

/// Where a fiber is in its execution. Owned by the scheduler; the join/detach protocol only
/// writes `Ready` (when it wakes a party) and `Done` (when a fiber completes).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ExecutionState {
    /// Currently executing on some manager thread (or, for an adapted OS thread, alive).
    Running = 1,
    /// Queued, waiting for a manager to resume it.
    Ready = 2,
    /// Suspended until another party or the event subsystem wakes it.
    Waiting = 3,
    /// The entry function returned and completion was recorded.
    Done = 4,
    /// Switching out of its stack on the way to `Waiting`. The fiber must not be resumed
    /// until the switch finishes.
    SavingStateToWait = 5,
}

impl ExecutionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Ready,
            3 => Self::Waiting,
            4 => Self::Done,
            5 => Self::SavingStateToWait,
            _ => unreachable!("invalid execution state {v}"),
        }
    }
}

/// Lock-free cell holding an [`ExecutionState`].
#[derive(Debug)]
pub struct AtomicExecutionState(AtomicU8);

impl AtomicExecutionState {
    pub fn new(state: ExecutionState) -> Self {
        AtomicExecutionState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ExecutionState {
        ExecutionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ExecutionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The four protocol states from the join/detach rendezvous plus the terminal `Joined` state
/// reached once a joiner has been granted the result.
///
/// | Operation | From | To | Who sleeps / who wakes |
/// |---|---|---|---|
/// | complete | `None` | `WaitForJoiner` | finisher publishes itself and sleeps |
/// | complete | `WaitToJoin` | `Joined` | finisher wakes the sleeping joiner |
/// | complete | `Detached` | (unchanged) | nobody |
/// | join | `None` | `WaitToJoin` | joiner publishes itself and sleeps |
/// | join / try_join | `WaitForJoiner` | `Joined` | joiner wakes the sleeping finisher |
/// | detach | `None` | `Detached` | nobody |
/// | detach | `WaitForJoiner` / `WaitToJoin` | `Detached` | detacher wakes the sleeper |
///
/// Every other combination is an error and leaves the state alone. The party moving the state
/// *into* a waiting state is always the one that sleeps; the party moving it *out* of a waiting
/// state is always the one that wakes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum DetachState {
    None = 0,
    WaitForJoiner = 1,
    WaitToJoin = 2,
    Detached = 3,
    Joined = 4,
}

impl DetachState {
    pub const ALL: [DetachState; 5] = [
        DetachState::None,
        DetachState::WaitForJoiner,
        DetachState::WaitToJoin,
        DetachState::Detached,
        DetachState::Joined,
    ];

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::WaitForJoiner,
            2 => Self::WaitToJoin,
            3 => Self::Detached,
            4 => Self::Joined,
            _ => unreachable!("invalid detach state {v}"),
        }
    }

    /// Whether the state can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, DetachState::Detached | DetachState::Joined)
    }

    /// Whether a party is (or is about to be) asleep on the rendezvous slot.
    pub fn has_sleeper(self) -> bool {
        matches!(self, DetachState::WaitForJoiner | DetachState::WaitToJoin)
    }

    /// Transition taken by the finishing fiber. `Err` means there is nothing to do.
    pub fn on_complete(self) -> Result<DetachState, ProtocolError> {
        match self {
            DetachState::None => Ok(DetachState::WaitForJoiner),
            DetachState::WaitToJoin => Ok(DetachState::Joined),
            DetachState::Detached => Err(ProtocolError::Detached),
            // Completion happens once, and nobody but the finisher leaves `None` for these.
            DetachState::WaitForJoiner | DetachState::Joined => Err(ProtocolError::AlreadyJoined),
        }
    }

    pub fn on_join(self) -> Result<DetachState, ProtocolError> {
        match self {
            DetachState::None => Ok(DetachState::WaitToJoin),
            DetachState::WaitForJoiner => Ok(DetachState::Joined),
            DetachState::WaitToJoin | DetachState::Joined => Err(ProtocolError::AlreadyJoined),
            DetachState::Detached => Err(ProtocolError::Detached),
        }
    }

    pub fn on_try_join(self) -> Result<DetachState, ProtocolError> {
        match self {
            DetachState::None => Err(ProtocolError::WouldBlock),
            state => state.on_join(),
        }
    }

    pub fn on_detach(self) -> Result<DetachState, ProtocolError> {
        match self {
            DetachState::None | DetachState::WaitForJoiner | DetachState::WaitToJoin => {
                Ok(DetachState::Detached)
            }
            DetachState::Detached => Err(ProtocolError::Detached),
            DetachState::Joined => Err(ProtocolError::AlreadyJoined),
        }
    }
}

const STATE_BITS: u32 = 3;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

fn pack(generation: u64, state: DetachState) -> u64 {
    (generation << STATE_BITS) | state as u64
}

fn unpack(word: u64) -> (u64, DetachState) {
    (word >> STATE_BITS, DetachState::from_u8((word & STATE_MASK) as u8))
}

/// A [`DetachState`] packed with the generation of the fiber object it belongs to, so that a
/// transition requested through a stale handle fails in the same compare-and-exchange that
/// would otherwise have applied it.
#[derive(Debug)]
pub(crate) struct DetachWord(AtomicU64);

impl DetachWord {
    pub(crate) fn new(generation: u64) -> Self {
        DetachWord(AtomicU64::new(pack(generation, DetachState::None)))
    }

    pub(crate) fn load(&self) -> (u64, DetachState) {
        unpack(self.0.load(Ordering::Acquire))
    }

    /// Applies `transition` to the current state with a single successful CAS and returns the
    /// state it replaced. `generation` of `None` skips the staleness check (used by the owner).
    pub(crate) fn advance(
        &self,
        generation: Option<u64>,
        transition: impl Fn(DetachState) -> Result<DetachState, ProtocolError>,
    ) -> Result<DetachState, ProtocolError> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let (current_generation, state) = unpack(current);
            if generation.map_or(false, |g| g != current_generation) {
                return Err(ProtocolError::Stale);
            }
            let next = transition(state)?;
            match self.0.compare_exchange_weak(
                current,
                pack(current_generation, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }

    /// Starts the next generation in state `None`. Returns the new generation.
    pub(crate) fn recycle(&self) -> u64 {
        let (generation, _) = self.load();
        let next = generation.wrapping_add(1) & (u64::MAX >> STATE_BITS);
        self.0.store(pack(next, DetachState::None), Ordering::Release);
        next
    }
}
