use {
    crate::{
        fiber::{Builder, FiberInner},
        sched, Config, Error, EventLoop, JoinHandle,
    },
    crossbeam_queue::{ArrayQueue, SegQueue},
    filament_core::{AllocationError, FlsRegistry},
    std::{
        fmt::{Debug, Formatter},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
    },
    tracing::{debug, error, info},
};

/// State shared by a runtime's managers, its handles and its fibers.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) ready: SegQueue<Arc<FiberInner>>,
    pub(crate) pool: ArrayQueue<Arc<FiberInner>>,
    pub(crate) events: EventLoop,
    pub(crate) fls: FlsRegistry,
    pub(crate) live: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("ready", &self.ready.len())
            .field("pooled", &self.pool.len())
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("shutdown", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// A cheap, cloneable reference to a running [`Runtime`].
#[derive(Clone, Debug)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The runtime whose manager is running the caller, if any.
    pub fn current() -> Option<Handle> {
        sched::runtime().map(|shared| Handle { shared })
    }

    pub fn builder(&self) -> Builder {
        Builder::new(Arc::clone(&self.shared))
    }

    /// Spawns a fiber with the configured default stack size.
    pub fn spawn<F, T>(&self, entry: F) -> Result<JoinHandle<T>, AllocationError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.builder().spawn(entry)
    }

    /// Fiber-local storage shared by every fiber of this runtime.
    pub fn fls(&self) -> &FlsRegistry {
        &self.shared.fls
    }

    pub fn events(&self) -> &EventLoop {
        &self.shared.events
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Fibers created and not yet reclaimed.
    pub fn live_fibers(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    /// Finished fiber objects waiting to be reused.
    pub fn pooled_fibers(&self) -> usize {
        self.shared.pool.len()
    }
}

/// Owns the manager threads that run fibers.
///
/// ```no_run
/// use filament::Runtime;
///
/// let runtime = Runtime::new().unwrap();
/// let answer = runtime.spawn(|| {
///     let child = filament::spawn(|| 21).unwrap();
///     child.join().unwrap() * 2
/// });
/// assert_eq!(answer.unwrap().join().unwrap(), 42);
/// runtime.shutdown();
/// ```
///
/// Shutting down (explicitly or on drop) waits for the ready queue to drain. Fibers still
/// waiting on a join, a timer or a descriptor at that point are abandoned: they are never
/// resumed, and their stacks and fiber objects are leaked rather than unwound.
pub struct Runtime {
    handle: Handle,
    managers: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    pub fn new() -> Result<Self, Error> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            ready: SegQueue::new(),
            pool: ArrayQueue::new(config.pool_size().max(1)),
            events: EventLoop::new()?,
            fls: FlsRegistry::new(),
            live: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            config,
        });
        let mut runtime = Runtime {
            handle: Handle {
                shared: Arc::clone(&shared),
            },
            managers: Vec::new(),
        };
        for index in 0..shared.config.manager_count() {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", shared.config.name_prefix()))
                .spawn(move || sched::run_manager(shared, index));
            match spawned {
                Ok(manager) => runtime.managers.push(manager),
                Err(err) => {
                    error!(index, ?err, "Unable to start manager thread.");
                    runtime.stop();
                    return Err(err.into());
                }
            }
        }
        info!(managers = runtime.managers.len(), "Runtime started.");
        Ok(runtime)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn builder(&self) -> Builder {
        self.handle.builder()
    }

    pub fn spawn<F, T>(&self, entry: F) -> Result<JoinHandle<T>, AllocationError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn(entry)
    }

    pub fn fls(&self) -> &FlsRegistry {
        self.handle.fls()
    }

    /// Stops the managers once the ready queue is empty, then shuts down the event subsystem.
    /// Returns the number of manager threads that panicked.
    pub fn shutdown(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        let shared = &self.handle.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        shared.events.wake_blocked();

        let mut panicked = 0;
        for manager in self.managers.drain(..) {
            if manager.thread().id() == thread::current().id() {
                // A fiber dropped its own runtime; this manager exits on its own.
                continue;
            }
            if let Err(e) = manager.join() {
                let msg = "Manager exited due to panic.";
                if let Some(panic) = e.downcast_ref::<&'static str>() {
                    error!(panic, msg);
                } else if let Some(panic) = e.downcast_ref::<String>() {
                    error!(panic, msg);
                } else {
                    error!(msg);
                }
                panicked += 1;
            }
        }

        let abandoned = shared.live.load(Ordering::Relaxed);
        if abandoned > 0 {
            debug!(abandoned, "Abandoning fibers that were still waiting.");
        }
        shared.events.shutdown();
        shared.fls.clear();
        while shared.pool.pop().is_some() {}
        info!("Runtime stopped.");
        panicked
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("shared", &self.handle.shared)
            .field("managers", &self.managers.len())
            .finish()
    }
}
