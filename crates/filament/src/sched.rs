//! Manager threads and the scheduler-side half of the join/detach protocol.
//!
//! Every lookup of thread-local state goes through a non-inlined accessor, since a fiber that
//! suspends may resume on a different manager thread.

use {
    crate::{
        context::{SlotRef, Suspend, WaitRequest},
        fiber::{FiberInner, Kind},
        runtime::{Handle, Shared},
        Error, Fiber, JoinHandle,
    },
    filament_core::{AtomicSlot, ExecutionState, Rendezvous},
    std::{
        cell::RefCell,
        sync::{atomic::Ordering, Arc},
        thread,
    },
    tracing::{debug, trace, warn},
};

#[derive(Default)]
struct Local {
    shared: Option<Arc<Shared>>,
    running: Option<Arc<FiberInner>>,
    done: Option<Arc<FiberInner>>,
    root: Option<Arc<FiberInner>>,
}

thread_local! {
    static LOCAL: RefCell<Local> = RefCell::new(Local::default());
}

/// The fiber this manager is currently running, if any.
#[inline(never)]
pub(crate) fn running() -> Option<Arc<FiberInner>> {
    LOCAL.with(|local| local.borrow().running.clone())
}

#[inline(never)]
fn set_running(fiber: Option<Arc<FiberInner>>) {
    LOCAL.with(|local| local.borrow_mut().running = fiber);
}

#[inline(never)]
pub(crate) fn runtime() -> Option<Arc<Shared>> {
    LOCAL.with(|local| local.borrow().shared.clone())
}

/// The calling thread's root fiber, created on first use.
#[inline(never)]
pub(crate) fn root() -> Arc<FiberInner> {
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let root = local.root.get_or_insert_with(|| {
            let root = Arc::new(FiberInner::root());
            debug!(id = %root.id(), "Adapted calling thread into a fiber.");
            root
        });
        Arc::clone(root)
    })
}

pub(crate) fn current_inner() -> Arc<FiberInner> {
    running().unwrap_or_else(root)
}

/// The fiber calling this function. Outside of a runtime this is the calling thread's root
/// fiber.
pub fn current() -> Fiber {
    Fiber::new(current_inner())
}

/// Spawns a fiber on the runtime the caller is running on.
pub fn spawn<F, T>(entry: F) -> Result<JoinHandle<T>, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(Handle::current().ok_or(Error::NoRuntime)?.spawn(entry)?)
}

/// Lets other ready fibers run. Outside of a fiber this yields the OS thread.
pub fn yield_now() {
    match running() {
        Some(fiber) => {
            trace!(id = %fiber.id(), "Yielding.");
            suspend(&fiber, Suspend::Yield);
        }
        None => thread::yield_now(),
    }
}

/// Suspends the running fiber until its manager has carried out `request` and somebody has
/// scheduled it again.
pub(crate) fn suspend_wait(fiber: &FiberInner, request: WaitRequest) {
    fiber.state.store(ExecutionState::SavingStateToWait);
    suspend(fiber, Suspend::Wait(request));
}

fn suspend(fiber: &FiberInner, suspend: Suspend) {
    match fiber.yielder() {
        Some(yielder) => {
            yielder.suspend(suspend);
        }
        None => unreachable!("fiber {} suspended outside of its own stack", fiber.id()),
    }
}

/// Makes `fiber` runnable: spawned fibers go to the back of their runtime's ready queue,
/// root fibers get their thread unparked.
pub(crate) fn schedule(fiber: Arc<FiberInner>) {
    match &fiber.kind {
        Kind::Spawned(spawned) => match spawned.home.upgrade() {
            Some(shared) => {
                fiber.state.store(ExecutionState::Ready);
                trace!(id = %fiber.id(), "Scheduled.");
                shared.ready.push(fiber);
                shared.events.wake_blocked();
            }
            None => warn!(id = %fiber.id(), "Runtime is gone. Dropping wake-up."),
        },
        Kind::Root(root) => {
            fiber.state.store(ExecutionState::Ready);
            root.woken.store(true, Ordering::Release);
            root.thread.unpark();
        }
    }
}

/// Reclaims the fiber that most recently finished on this manager.
#[inline(never)]
pub(crate) fn run_periodic_maintenance() {
    let (shared, done) = LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        (local.shared.clone(), local.done.take())
    });
    if let (Some(shared), Some(fiber)) = (shared, done) {
        reclaim(&shared, fiber);
    }
}

fn reclaim(shared: &Shared, fiber: Arc<FiberInner>) {
    debug_assert!(fiber.cell.state().is_terminal());
    fiber.recycle();
    shared.live.fetch_sub(1, Ordering::Relaxed);
    if shared.pool.push(fiber).is_err() {
        trace!("Fiber pool is full. Releasing fiber object.");
    }
}

/// The runtime's [`Rendezvous`]: spawned fibers switch stacks, root fibers park their thread.
pub(crate) struct Scheduler;

impl Rendezvous<FiberInner> for Scheduler {
    fn set_and_wait(&self, slot: &AtomicSlot<Arc<FiberInner>>, me: Arc<FiberInner>) {
        match &me.kind {
            Kind::Spawned(_) => suspend_wait(&me, WaitRequest::Publish(SlotRef::new(slot))),
            Kind::Root(root) => {
                me.state.store(ExecutionState::Waiting);
                let displaced = slot.publish(Arc::clone(&me));
                assert!(displaced.is_none(), "rendezvous slot was already occupied");
                while !root.woken.swap(false, Ordering::AcqRel) {
                    thread::park();
                }
                me.state.store(ExecutionState::Running);
            }
        }
    }

    fn clear_or_wait(&self, slot: &AtomicSlot<Arc<FiberInner>>) -> Arc<FiberInner> {
        loop {
            if let Some(party) = slot.take() {
                return party;
            }
            // The party is still switching out; its manager publishes it momentarily.
            yield_now();
        }
    }

    fn schedule(&self, party: Arc<FiberInner>) {
        schedule(party)
    }
}

/// Runs fibers from `shared` until the runtime shuts down and no ready fiber is left.
pub(crate) fn run_manager(shared: Arc<Shared>, index: usize) {
    LOCAL.with(|local| local.borrow_mut().shared = Some(Arc::clone(&shared)));
    debug!(index, "Manager started.");
    loop {
        run_periodic_maintenance();
        if let Some(fiber) = shared.ready.pop() {
            resume(&shared, fiber);
            continue;
        }
        if matches!(shared.events.poll(), Ok(n) if n > 0) {
            continue;
        }
        if shared.is_shutting_down() && shared.ready.is_empty() {
            break;
        }
        shared.events.poll_blocking(shared.config.idle_timeout());
    }
    run_periodic_maintenance();
    LOCAL.with(|local| local.borrow_mut().shared = None);
    debug!(index, "Manager stopped.");
}

fn resume(shared: &Shared, fiber: Arc<FiberInner>) {
    let Some(spawned) = fiber.spawned_parts() else {
        warn!(id = %fiber.id(), "Root fiber found on the ready queue. Ignoring.");
        return;
    };
    fiber.state.store(ExecutionState::Running);
    set_running(Some(Arc::clone(&fiber)));
    trace!(id = %fiber.id(), "Resuming.");
    let outcome = match spawned.context.lock().as_mut() {
        Some(context) => context.resume(),
        None => unreachable!("fiber {} has no execution context", fiber.id()),
    };
    set_running(None);

    match outcome {
        Some(Suspend::Yield) => schedule(fiber),
        Some(Suspend::Wait(request)) => {
            fiber.state.store(ExecutionState::Waiting);
            wait(shared, fiber, request);
        }
        None => {
            trace!(id = %fiber.id(), "Fiber exited.");
            let previous = LOCAL.with(|local| local.borrow_mut().done.replace(fiber));
            if let Some(previous) = previous {
                reclaim(shared, previous);
            }
        }
    }
}

/// Carries out a wait request for a fiber whose stack has just been switched out.
fn wait(shared: &Shared, fiber: Arc<FiberInner>, request: WaitRequest) {
    match request {
        WaitRequest::Publish(slot) => {
            // SAFETY: The fiber that made the request is suspended in it right now.
            let displaced = unsafe { slot.get() }.publish(fiber);
            assert!(displaced.is_none(), "rendezvous slot was already occupied");
        }
        WaitRequest::Sleep(deadline) => {
            if let Err((fiber, err)) = shared.events.add_timer(deadline, fiber) {
                fiber.set_fault(err);
                schedule(fiber);
            }
        }
        WaitRequest::Readiness { fd, interest } => {
            if let Err((fiber, err)) = shared.events.register(fd, interest, fiber) {
                fiber.set_fault(err);
                schedule(fiber);
            }
        }
    }
}
