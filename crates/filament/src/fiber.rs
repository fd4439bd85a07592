use {
    crate::{
        context::{self, Context, FiberYielder},
        runtime::Shared,
        sched::{self, Scheduler},
        EventError, JoinError,
    },
    corosensei::stack::DefaultStack,
    filament_core::{
        AllocationError, AtomicExecutionState, DetachState, ExecutionState, FiberId, JoinCell,
        Participant, Payload, ProtocolError, MIN_STACK_SIZE,
    },
    parking_lot::Mutex,
    std::{
        any::Any,
        fmt::{Debug, Formatter},
        marker::PhantomData,
        panic::{self, AssertUnwindSafe},
        ptr,
        sync::{
            atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
            Arc, Weak,
        },
        thread::{self, Thread},
    },
    tracing::trace,
};

static NEXT_SERIAL: AtomicUsize = AtomicUsize::new(0);

/// The shared fiber object. Outlives any single fiber: once a fiber finishes, the object is
/// recycled with a bumped generation and may host another fiber.
pub(crate) struct FiberInner {
    serial: usize,
    pub(crate) state: AtomicExecutionState,
    pub(crate) cell: JoinCell<FiberInner>,
    /// Written by the one mechanism that wakes a waiting fiber, read by the fiber once resumed.
    pub(crate) scratch: AtomicU32,
    pub(crate) kind: Kind,
}

pub(crate) enum Kind {
    Spawned(Spawned),
    Root(Root),
}

/// A fiber with its own stack, run by the managers of one runtime.
pub(crate) struct Spawned {
    pub(crate) home: Weak<Shared>,
    pub(crate) context: Mutex<Option<Context>>,
    spare: Mutex<Option<DefaultStack>>,
    yielder: AtomicPtr<FiberYielder>,
    fault: Mutex<Option<EventError>>,
}

/// An OS thread adapted into a fiber. It waits by parking the thread.
pub(crate) struct Root {
    pub(crate) thread: Thread,
    pub(crate) woken: AtomicBool,
}

impl Participant for FiberInner {
    fn join_cell(&self) -> &JoinCell<Self> {
        &self.cell
    }
}

impl FiberInner {
    fn spawned(home: Weak<Shared>) -> Self {
        FiberInner {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            state: AtomicExecutionState::new(ExecutionState::Ready),
            cell: JoinCell::default(),
            scratch: AtomicU32::new(0),
            kind: Kind::Spawned(Spawned {
                home,
                context: Mutex::new(None),
                spare: Mutex::new(None),
                yielder: AtomicPtr::new(ptr::null_mut()),
                fault: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn root() -> Self {
        FiberInner {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            state: AtomicExecutionState::new(ExecutionState::Running),
            cell: JoinCell::default(),
            scratch: AtomicU32::new(0),
            kind: Kind::Root(Root {
                thread: thread::current(),
                woken: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        FiberId::new(self.serial, self.cell.generation())
    }

    pub(crate) fn spawned_parts(&self) -> Option<&Spawned> {
        match &self.kind {
            Kind::Spawned(spawned) => Some(spawned),
            Kind::Root(_) => None,
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        matches!(self.kind, Kind::Root(_))
    }

    pub(crate) fn home(&self) -> Option<Arc<Shared>> {
        self.spawned_parts().and_then(|spawned| spawned.home.upgrade())
    }

    pub(crate) fn yielder(&self) -> Option<&FiberYielder> {
        let yielder = self.spawned_parts()?.yielder.load(Ordering::Acquire);
        // SAFETY: The pointer is set by the trampoline to the yielder living on this fiber's
        //         stack and cleared before that stack is left for the last time.
        unsafe { yielder.as_ref() }
    }

    pub(crate) fn set_fault(&self, fault: EventError) {
        if let Some(spawned) = self.spawned_parts() {
            *spawned.fault.lock() = Some(fault);
        }
    }

    pub(crate) fn take_fault(&self) -> Option<EventError> {
        self.spawned_parts()?.fault.lock().take()
    }

    /// Returns a dead fiber's stack and identity to the pool's care. Called by maintenance once
    /// the fiber's context has returned for good.
    pub(crate) fn recycle(&self) -> u64 {
        if let Some(spawned) = self.spawned_parts() {
            let context = spawned.context.lock().take();
            if let Some(stack) = context.and_then(Context::into_stack) {
                *spawned.spare.lock() = Some(stack);
            }
            spawned.yielder.store(ptr::null_mut(), Ordering::Release);
            spawned.fault.lock().take();
        }
        self.scratch.store(0, Ordering::Relaxed);
        let generation = self.cell.recycle();
        trace!(id = %self.id(), "Recycled fiber object.");
        generation
    }
}

/// Builds the fiber object for `entry`, reusing a pooled object and its stack when possible.
pub(crate) fn create<F, T>(
    shared: &Arc<Shared>,
    stack_size: usize,
    entry: F,
) -> Result<Arc<FiberInner>, AllocationError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    debug_assert!(
        stack_size >= MIN_STACK_SIZE,
        "stack size {stack_size} is below the minimum of {MIN_STACK_SIZE}"
    );
    let fiber = shared
        .pool
        .pop()
        .unwrap_or_else(|| Arc::new(FiberInner::spawned(Arc::downgrade(shared))));
    let Some(spawned) = fiber.spawned_parts() else {
        unreachable!("root fiber found in the pool");
    };

    let spare = spawned
        .spare
        .lock()
        .take()
        .filter(|stack| context::stack_size(stack) >= stack_size);
    let stack = match spare {
        Some(stack) => stack,
        None => match context::allocate_stack(stack_size) {
            Ok(stack) => stack,
            Err(source) => {
                if shared.pool.push(fiber).is_err() {
                    trace!("Fiber pool is full. Releasing fiber object.");
                }
                return Err(AllocationError::new(stack_size, source));
            }
        },
    };

    *spawned.context.lock() = Some(Context::new(stack, trampoline(entry)));
    fiber.state.store(ExecutionState::Ready);
    shared.live.fetch_add(1, Ordering::Relaxed);
    trace!(id = %fiber.id(), stack_size, "Created fiber.");
    Ok(fiber)
}

/// Reports a panic that escaped a fiber's entry function to whoever joins it.
struct Panicked(Box<dyn Any + Send>);

impl Panicked {
    fn message(&self) -> String {
        if let Some(panic) = self.0.downcast_ref::<&'static str>() {
            panic.to_string()
        } else if let Some(panic) = self.0.downcast_ref::<String>() {
            panic.clone()
        } else {
            "Box<dyn Any>".into()
        }
    }
}

fn trampoline<F, T>(entry: F) -> impl FnOnce(&FiberYielder) + 'static
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    move |yielder| {
        sched::run_periodic_maintenance();
        let Some(fiber) = sched::running() else {
            unreachable!("fiber entered outside of a manager");
        };
        if let Some(spawned) = fiber.spawned_parts() {
            spawned
                .yielder
                .store(yielder as *const _ as *mut _, Ordering::Release);
        }

        trace!(id = %fiber.id(), "Entering fiber.");
        let result: Payload = match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(value) => Box::new(value),
            Err(panic) => Box::new(Panicked(panic)),
        };
        mark_completed(&fiber, result);

        if let Some(spawned) = fiber.spawned_parts() {
            spawned.yielder.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

/// Hands `result` to the joiner (now or once one arrives) and marks the fiber done. May suspend
/// until a joiner or detacher releases the fiber.
pub(crate) fn mark_completed(fiber: &Arc<FiberInner>, result: Payload) {
    fiber
        .cell
        .complete(Arc::clone(fiber), result, &Scheduler);
    fiber.state.store(ExecutionState::Done);
    trace!(id = %fiber.id(), "Fiber completed.");
}

/// An untyped handle to one incarnation of a fiber.
///
/// Handles are cheap to clone. Operations through a handle whose fiber object has since been
/// recycled fail with [`ProtocolError::Stale`].
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
    generation: u64,
}

impl Fiber {
    pub(crate) fn new(inner: Arc<FiberInner>) -> Self {
        let generation = inner.cell.generation();
        Fiber { inner, generation }
    }

    /// Adapts the calling OS thread into a fiber so it can take part in joins. Calling this
    /// again on the same thread returns the same fiber.
    pub fn from_calling_thread() -> Fiber {
        Fiber::new(sched::root())
    }

    pub fn id(&self) -> FiberId {
        FiberId::new(self.inner.serial, self.generation)
    }

    pub fn state(&self) -> ExecutionState {
        if self.is_stale() {
            ExecutionState::Done
        } else {
            self.inner.state.load()
        }
    }

    pub fn detach_state(&self) -> DetachState {
        self.inner.cell.state()
    }

    /// Whether this fiber adapts an OS thread.
    pub fn is_root(&self) -> bool {
        self.inner.is_root()
    }

    /// Whether the fiber object has been recycled since this handle was made.
    pub fn is_stale(&self) -> bool {
        self.inner.cell.generation() != self.generation
    }

    /// Waits for the fiber to finish and takes its result. The calling fiber (or thread)
    /// suspends until then. `Ok(None)` means the fiber was detached while this join waited.
    pub fn join(&self) -> Result<Option<Payload>, ProtocolError> {
        if self.inner.is_root() {
            return Err(ProtocolError::NotJoinable);
        }
        self.inner
            .cell
            .join(self.generation, sched::current_inner(), &Scheduler)
    }

    /// Takes the result if the fiber has already finished. Never waits for the fiber itself,
    /// but may yield briefly while a finisher is still switching out of its stack.
    pub fn try_join(&self) -> Result<Option<Payload>, ProtocolError> {
        if self.inner.is_root() {
            return Err(ProtocolError::NotJoinable);
        }
        self.inner.cell.try_join(self.generation, &Scheduler)
    }

    /// Gives up the right to join. A fiber waiting in [`Fiber::join`] for this one wakes up
    /// without a result.
    pub fn detach(&self) -> Result<(), ProtocolError> {
        self.inner.cell.detach(self.generation, &Scheduler)
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.generation == other.generation
    }
}

impl Eq for Fiber {}

impl Debug for Fiber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("detach_state", &self.detach_state())
            .finish()
    }
}

/// An owned permission to join a fiber returning `T`.
///
/// Dropping the handle detaches the fiber, like [`std::thread::JoinHandle`].
pub struct JoinHandle<T> {
    fiber: Fiber,
    armed: bool,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    fn new(fiber: Fiber) -> Self {
        JoinHandle {
            fiber,
            armed: true,
            _result: PhantomData,
        }
    }

    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.fiber.detach_state(),
            DetachState::WaitForJoiner | DetachState::Joined
        ) || self.fiber.is_stale()
    }

    pub fn join(mut self) -> Result<T, JoinError> {
        self.armed = false;
        match self.fiber.join() {
            Ok(Some(payload)) => downcast(payload),
            Ok(None) => Err(JoinError::DetachedWhileJoining),
            Err(err) => Err(err.into()),
        }
    }

    /// Joins only if the fiber has already finished; otherwise gives the handle back.
    pub fn try_join(mut self) -> Result<Result<T, JoinError>, Self> {
        match self.fiber.try_join() {
            Err(ProtocolError::WouldBlock) => Err(self),
            Ok(Some(payload)) => {
                self.armed = false;
                Ok(downcast(payload))
            }
            Ok(None) => {
                self.armed = false;
                Ok(Err(JoinError::DetachedWhileJoining))
            }
            Err(err) => {
                self.armed = false;
                Ok(Err(err.into()))
            }
        }
    }

    pub fn detach(mut self) -> Result<(), ProtocolError> {
        self.armed = false;
        self.fiber.detach()
    }

    /// Gives up typed joining in favor of an untyped handle. The fiber is not detached.
    pub fn into_fiber(mut self) -> Fiber {
        self.armed = false;
        self.fiber.clone()
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.fiber.detach() {
                trace!(id = %self.fiber.id(), ?err, "Fiber was not detached on drop.");
            }
        }
    }
}

impl<T> Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("JoinHandle").field(&self.fiber).finish()
    }
}

fn downcast<T: 'static>(payload: Payload) -> Result<T, JoinError> {
    match payload.downcast::<T>() {
        Ok(value) => Ok(*value),
        Err(payload) => match payload.downcast::<Panicked>() {
            Ok(panicked) => Err(JoinError::Panicked(panicked.message())),
            Err(_) => Err(JoinError::UnexpectedPayload),
        },
    }
}

/// A created fiber that no manager will run until [`Unscheduled::schedule`] is called.
/// Dropping it releases the fiber without ever running it.
pub struct Unscheduled<T> {
    inner: Option<Arc<FiberInner>>,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> Unscheduled<T> {
    pub(crate) fn new(inner: Arc<FiberInner>) -> Self {
        Unscheduled {
            inner: Some(inner),
            _result: PhantomData,
        }
    }

    pub fn id(&self) -> Option<FiberId> {
        self.inner.as_ref().map(|inner| inner.id())
    }

    pub fn schedule(mut self) -> JoinHandle<T> {
        let Some(inner) = self.inner.take() else {
            unreachable!("unscheduled fiber was already consumed");
        };
        let fiber = Fiber::new(Arc::clone(&inner));
        sched::schedule(inner);
        JoinHandle::new(fiber)
    }
}

impl<T> Drop for Unscheduled<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            trace!(id = %inner.id(), "Releasing fiber that was never scheduled.");
            if let Some(shared) = inner.home() {
                inner.recycle();
                shared.live.fetch_sub(1, Ordering::Relaxed);
                let _ = shared.pool.push(inner);
            }
        }
    }
}

impl<T> Debug for Unscheduled<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unscheduled")
            .field("id", &self.inner.as_ref().map(|inner| inner.id()))
            .finish()
    }
}

/// Configures a fiber before creating it.
///
/// ```no_run
/// let runtime = filament::Runtime::new().unwrap();
/// let handle = runtime
///     .builder()
///     .stack_size(256 * 1024)
///     .spawn(|| 6 * 7)
///     .unwrap();
/// assert_eq!(handle.join().unwrap(), 42);
/// ```
#[derive(Debug)]
pub struct Builder {
    shared: Arc<Shared>,
    stack_size: Option<usize>,
}

impl Builder {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Builder {
            shared,
            stack_size: None,
        }
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Creates the fiber and makes it runnable.
    pub fn spawn<F, T>(self, entry: F) -> Result<JoinHandle<T>, AllocationError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.spawn_unscheduled(entry)?.schedule())
    }

    /// Creates the fiber without handing it to the scheduler.
    pub fn spawn_unscheduled<F, T>(self, entry: F) -> Result<Unscheduled<T>, AllocationError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let stack_size = self
            .stack_size
            .unwrap_or_else(|| self.shared.config.default_stack_size());
        create(&self.shared, stack_size, entry).map(Unscheduled::new)
    }
}
