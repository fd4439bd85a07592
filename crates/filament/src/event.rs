//! Readiness and timer waits.
//!
//! A fiber waiting on a descriptor or a deadline is parked in the [`EventLoop`] until a manager
//! polling the loop observes the event and schedules it again. Registrations are oneshot:
//! every wake-up is re-armed for whichever waiter is left on the descriptor.

use {
    crate::{
        context::WaitRequest,
        fiber::FiberInner,
        runtime::Handle,
        sched, EventError, PollError,
    },
    bitflags::bitflags,
    parking_lot::Mutex,
    polling::{Event, Events, Poller},
    std::{
        cmp::{Ordering as CmpOrdering, Reverse},
        collections::{BinaryHeap, HashMap},
        fmt::{Debug, Formatter},
        io,
        os::fd::{BorrowedFd, RawFd},
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
    tracing::{debug, trace, warn},
};

bitflags! {
    /// Readiness a fiber can wait for.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct Interest: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

// Scratch bits written by the event loop before scheduling a waiter. The low bits mirror
// `Interest`.
const SCRATCH_CLOSED: u32 = 0x4;
const SCRATCH_TIMER: u32 = 0x8;

/// Longest sleep a deadline is computed for.
const MAX_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Default)]
struct Waiters {
    reader: Option<Arc<FiberInner>>,
    writer: Option<Arc<FiberInner>>,
    /// Whether the descriptor is currently known to the poller.
    added: bool,
}

impl Waiters {
    fn interest(&self) -> Interest {
        let mut interest = Interest::empty();
        interest.set(Interest::READ, self.reader.is_some());
        interest.set(Interest::WRITE, self.writer.is_some());
        interest
    }

    fn is_empty(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// Removes the waiters `ready` satisfies. A fiber waiting for both directions is removed
    /// from both slots at once.
    fn take_ready(&mut self, ready: Interest, woken: &mut Vec<Arc<FiberInner>>) {
        let mut take = |slot: &mut Option<Arc<FiberInner>>, bits: Interest| {
            if let Some(fiber) = slot.take() {
                fiber.scratch.fetch_or(bits.bits(), Ordering::AcqRel);
                woken.push(fiber);
            }
        };
        if ready.contains(Interest::READ) {
            take(&mut self.reader, Interest::READ);
        }
        if ready.contains(Interest::WRITE) {
            take(&mut self.writer, Interest::WRITE);
        }
        for fiber in woken.iter() {
            if self.reader.as_ref().map_or(false, |f| Arc::ptr_eq(f, fiber)) {
                self.reader = None;
            }
            if self.writer.as_ref().map_or(false, |f| Arc::ptr_eq(f, fiber)) {
                self.writer = None;
            }
        }
        woken.dedup_by(|a, b| Arc::ptr_eq(a, b));
    }
}

struct Timer {
    deadline: Instant,
    seq: u64,
    fiber: Arc<FiberInner>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// The event subsystem of one runtime: a [`Poller`] for descriptor readiness plus a deadline
/// heap for sleeping fibers.
///
/// Only one thread waits on the poller at a time. [`EventLoop::poll`] reports
/// [`PollError::TryAgain`] while another thread holds it, and [`EventLoop::poll_blocking`]
/// sleeps for its timeout instead.
pub struct EventLoop {
    poller: Poller,
    initialized: AtomicBool,
    busy: AtomicBool,
    blocked: AtomicBool,
    events: Mutex<Events>,
    waiters: Mutex<HashMap<RawFd, Waiters>>,
    timers: Mutex<BinaryHeap<Reverse<Timer>>>,
    next_timer: AtomicU64,
}

impl EventLoop {
    /// Initializes the subsystem.
    pub fn new() -> io::Result<Self> {
        let event_loop = EventLoop {
            poller: Poller::new()?,
            initialized: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            events: Mutex::new(Events::new()),
            waiters: Mutex::new(HashMap::new()),
            timers: Mutex::new(BinaryHeap::new()),
            next_timer: AtomicU64::new(0),
        };
        debug!("Event loop initialized.");
        Ok(event_loop)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Tears the subsystem down. Fibers still waiting on it are abandoned. Later polls report
    /// [`PollError::NotInitialized`].
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let waiters: Vec<_> = self.waiters.lock().drain().collect();
        for (fd, entry) in &waiters {
            if entry.added {
                self.forget(*fd);
            }
        }
        let timers = std::mem::take(&mut *self.timers.lock());
        debug!(
            descriptors = waiters.len(),
            timers = timers.len(),
            "Event loop shut down."
        );
        if let Err(err) = self.poller.notify() {
            warn!(?err, "Unable to interrupt a blocked poll.");
        }
    }

    /// Dispatches whatever is ready right now without blocking. Returns the number of fibers
    /// woken; `Ok(0)` means nothing was ready.
    pub fn poll(&self) -> Result<usize, PollError> {
        if !self.is_initialized() {
            return Err(PollError::NotInitialized);
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(PollError::TryAgain);
        }
        let woken = self.turn(Duration::ZERO);
        self.busy.store(false, Ordering::Release);
        Ok(woken)
    }

    /// Waits up to `timeout` (less if a timer expires sooner) for events and dispatches them.
    /// Returns the number of fibers woken.
    pub fn poll_blocking(&self, timeout: Duration) -> usize {
        if !self.is_initialized()
            || self
                .busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            thread::sleep(timeout);
            return 0;
        }
        let woken = self.turn(timeout);
        self.busy.store(false, Ordering::Release);
        woken
    }

    /// Drops every registration on `fd` and wakes its waiters with [`EventError::Closed`].
    /// Must be called before the descriptor is closed. Returns the number of fibers woken.
    pub fn on_fd_closed(&self, fd: RawFd) -> usize {
        let Some(mut entry) = self.waiters.lock().remove(&fd) else {
            return 0;
        };
        if entry.added {
            self.forget(fd);
        }
        let mut woken = Vec::new();
        entry.take_ready(Interest::all(), &mut woken);
        for fiber in &woken {
            fiber.scratch.fetch_or(SCRATCH_CLOSED, Ordering::AcqRel);
        }
        debug!(fd, woken = woken.len(), "Descriptor closed.");
        let count = woken.len();
        woken.into_iter().for_each(sched::schedule);
        count
    }

    /// Fibers currently waiting on a descriptor or a timer.
    pub fn waiting(&self) -> usize {
        let descriptors: usize = self
            .waiters
            .lock()
            .values()
            .map(|entry| usize::from(entry.reader.is_some()) + usize::from(entry.writer.is_some()))
            .sum();
        descriptors + self.timers.lock().len()
    }

    pub(crate) fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        fiber: Arc<FiberInner>,
    ) -> Result<(), (Arc<FiberInner>, EventError)> {
        if !self.is_initialized() {
            return Err((fiber, EventError::NotInitialized));
        }
        let mut waiters = self.waiters.lock();
        let entry = waiters.entry(fd).or_default();
        if (interest.contains(Interest::READ) && entry.reader.is_some())
            || (interest.contains(Interest::WRITE) && entry.writer.is_some())
        {
            return Err((fiber, EventError::Busy));
        }
        if interest.contains(Interest::READ) {
            entry.reader = Some(Arc::clone(&fiber));
        }
        if interest.contains(Interest::WRITE) {
            entry.writer = Some(Arc::clone(&fiber));
        }
        if let Err(err) = self.arm(fd, entry) {
            entry.take_ready(interest, &mut Vec::new());
            if entry.is_empty() && !entry.added {
                waiters.remove(&fd);
            }
            fiber.scratch.store(0, Ordering::Relaxed);
            return Err((fiber, err.into()));
        }
        trace!(fd, ?interest, id = %fiber.id(), "Waiting for readiness.");
        Ok(())
    }

    pub(crate) fn add_timer(
        &self,
        deadline: Instant,
        fiber: Arc<FiberInner>,
    ) -> Result<(), (Arc<FiberInner>, EventError)> {
        if !self.is_initialized() {
            return Err((fiber, EventError::NotInitialized));
        }
        let seq = self.next_timer.fetch_add(1, Ordering::Relaxed);
        trace!(id = %fiber.id(), ?deadline, "Sleeping.");
        self.timers.lock().push(Reverse(Timer {
            deadline,
            seq,
            fiber,
        }));
        self.wake_blocked();
        Ok(())
    }

    /// Interrupts a thread blocked in [`EventLoop::poll_blocking`], if there is one.
    pub(crate) fn wake_blocked(&self) {
        if self.blocked.load(Ordering::Acquire) {
            if let Err(err) = self.poller.notify() {
                warn!(?err, "Unable to interrupt a blocked poll.");
            }
        }
    }

    /// One pass over the poller and the timer heap. The caller holds `busy`.
    fn turn(&self, timeout: Duration) -> usize {
        let timeout = self
            .timers
            .lock()
            .peek()
            .map_or(timeout, |Reverse(timer)| {
                timeout.min(timer.deadline.saturating_duration_since(Instant::now()))
            });

        let mut woken = Vec::new();
        {
            let mut events = self.events.lock();
            events.clear();
            self.blocked.store(!timeout.is_zero(), Ordering::Release);
            let waited = self.poller.wait(&mut events, Some(timeout));
            self.blocked.store(false, Ordering::Release);
            match waited {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => warn!(?err, "Unable to wait for events."),
            }

            let mut waiters = self.waiters.lock();
            for event in events.iter() {
                let fd = event.key as RawFd;
                let Some(entry) = waiters.get_mut(&fd) else {
                    continue;
                };
                let mut ready = Interest::empty();
                ready.set(Interest::READ, event.readable);
                ready.set(Interest::WRITE, event.writable);
                entry.take_ready(ready, &mut woken);
                if let Err(err) = self.arm(fd, entry) {
                    warn!(fd, ?err, "Unable to re-arm descriptor.");
                }
            }
        }

        let now = Instant::now();
        let mut timers = self.timers.lock();
        while timers
            .peek()
            .map_or(false, |Reverse(timer)| timer.deadline <= now)
        {
            if let Some(Reverse(timer)) = timers.pop() {
                timer.fiber.scratch.fetch_or(SCRATCH_TIMER, Ordering::AcqRel);
                woken.push(timer.fiber);
            }
        }
        drop(timers);

        let count = woken.len();
        woken.into_iter().for_each(sched::schedule);
        count
    }

    /// Points the poller at the interest the remaining waiters on `fd` need.
    fn arm(&self, fd: RawFd, entry: &mut Waiters) -> io::Result<()> {
        let interest = entry.interest();
        let event = poll_event(fd, interest);
        if entry.added {
            // SAFETY: Descriptors with registrations stay open until `on_fd_closed`.
            match self
                .poller
                .modify(unsafe { BorrowedFd::borrow_raw(fd) }, event)
            {
                // Closed without `on_fd_closed` and reopened under the same number.
                Err(err) if err.kind() == io::ErrorKind::NotFound => entry.added = false,
                result => return result,
            }
        }
        if interest.is_empty() {
            return Ok(());
        }
        // SAFETY: As above. The registration is removed in `on_fd_closed` or `shutdown`.
        unsafe { self.poller.add(fd, event)? };
        entry.added = true;
        Ok(())
    }

    fn forget(&self, fd: RawFd) {
        // SAFETY: Callers of `on_fd_closed` have not closed the descriptor yet.
        if let Err(err) = self.poller.delete(unsafe { BorrowedFd::borrow_raw(fd) }) {
            debug!(fd, ?err, "Descriptor was already gone from the poller.");
        }
    }
}

impl Debug for EventLoop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("initialized", &self.is_initialized())
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("descriptors", &self.waiters.lock().len())
            .field("timers", &self.timers.lock().len())
            .finish()
    }
}

fn poll_event(fd: RawFd, interest: Interest) -> Event {
    let key = fd as usize;
    match (
        interest.contains(Interest::READ),
        interest.contains(Interest::WRITE),
    ) {
        (true, true) => Event::all(key),
        (true, false) => Event::readable(key),
        (false, true) => Event::writable(key),
        (false, false) => Event::none(key),
    }
}

/// Suspends the calling fiber until `fd` is ready for some of `interest`. Returns the readiness
/// observed.
pub fn wait_for_event(fd: RawFd, interest: Interest) -> Result<Interest, EventError> {
    let fiber = sched::running().ok_or(EventError::NotInFiber)?;
    if interest.is_empty() {
        return Ok(Interest::empty());
    }
    fiber.scratch.store(0, Ordering::Relaxed);
    sched::suspend_wait(&fiber, WaitRequest::Readiness { fd, interest });
    let bits = fiber.scratch.swap(0, Ordering::Acquire);
    if let Some(fault) = fiber.take_fault() {
        return Err(fault);
    }
    if bits & SCRATCH_CLOSED != 0 {
        return Err(EventError::Closed);
    }
    Ok(Interest::from_bits_truncate(bits) & interest)
}

/// Suspends the calling fiber for at least `duration`. Outside of a fiber this sleeps the OS
/// thread.
pub fn sleep(duration: Duration) -> Result<(), EventError> {
    let Some(fiber) = sched::running() else {
        thread::sleep(duration);
        return Ok(());
    };
    if duration.is_zero() {
        sched::yield_now();
        return Ok(());
    }
    let deadline = Instant::now() + duration.min(MAX_SLEEP);
    fiber.scratch.store(0, Ordering::Relaxed);
    sched::suspend_wait(&fiber, WaitRequest::Sleep(deadline));
    fiber.scratch.store(0, Ordering::Relaxed);
    fiber.take_fault().map_or(Ok(()), Err)
}

/// Tells the calling fiber's runtime that `fd` is about to be closed. Waiters on it wake with
/// [`EventError::Closed`]. Returns the number of fibers woken.
pub fn fd_closed(fd: RawFd) -> Result<usize, EventError> {
    let handle = Handle::current().ok_or(EventError::NotInFiber)?;
    Ok(handle.events().on_fd_closed(fd))
}
