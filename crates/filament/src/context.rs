use {
    crate::{fiber::FiberInner, Interest},
    corosensei::{
        stack::{DefaultStack, Stack},
        Coroutine, CoroutineResult, Yielder,
    },
    filament_core::AtomicSlot,
    std::{os::fd::RawFd, ptr::NonNull, sync::Arc, time::Instant},
};

/// What a fiber asks of its manager when it gives up the CPU.
#[derive(Debug)]
pub(crate) enum Suspend {
    /// Requeue at the back of the ready queue.
    Yield,
    /// Park until woken. The manager carries out the request only after the fiber's stack has
    /// been switched out, so whoever picks the fiber up from there can resume it immediately.
    Wait(WaitRequest),
}

#[derive(Debug)]
pub(crate) enum WaitRequest {
    /// Publish the fiber into a rendezvous slot.
    Publish(SlotRef),
    /// Wake the fiber once the deadline has passed.
    Sleep(Instant),
    /// Wake the fiber once the descriptor is ready.
    Readiness { fd: RawFd, interest: Interest },
}

/// A rendezvous slot owned by some fiber object the suspending fiber keeps alive on its stack.
#[derive(Debug)]
pub(crate) struct SlotRef(NonNull<AtomicSlot<Arc<FiberInner>>>);

// SAFETY: The slot itself is `Sync`; the pointer is only dereferenced by the manager that
//         switched the owning fiber out, while that fiber is still suspended.
unsafe impl Send for SlotRef {}

impl SlotRef {
    pub(crate) fn new(slot: &AtomicSlot<Arc<FiberInner>>) -> Self {
        SlotRef(NonNull::from(slot))
    }

    /// # Safety
    ///
    /// The fiber that created this reference must still be suspended in the wait that carried it.
    pub(crate) unsafe fn get(&self) -> &AtomicSlot<Arc<FiberInner>> {
        self.0.as_ref()
    }
}

pub(crate) type FiberYielder = Yielder<(), Suspend>;

/// A suspended (or not yet started) stack of execution.
///
/// Contexts move between manager threads. Code running on a fiber must therefore not keep
/// borrows of thread-local state across a suspension point.
pub(crate) struct Context {
    coroutine: Option<Coroutine<(), Suspend, (), DefaultStack>>,
}

// SAFETY: The coroutine is only ever resumed by one manager at a time (its owner holds the
//         fiber's context lock), and the runtime never caches thread-local addresses across a
//         suspension.
unsafe impl Send for Context {}

impl Context {
    pub(crate) fn new(
        stack: DefaultStack,
        entry: impl FnOnce(&FiberYielder) + 'static,
    ) -> Self {
        Context {
            coroutine: Some(Coroutine::with_stack(stack, move |yielder, ()| {
                entry(yielder)
            })),
        }
    }

    /// Runs the fiber until it suspends. `None` means it returned and must never be resumed again.
    pub(crate) fn resume(&mut self) -> Option<Suspend> {
        let coroutine = self.coroutine.as_mut()?;
        if coroutine.done() {
            unreachable!("resumed a fiber context that already finished");
        }
        match coroutine.resume(()) {
            CoroutineResult::Yield(suspend) => Some(suspend),
            CoroutineResult::Return(()) => None,
        }
    }

    /// Gives the stack back for reuse. Only a context that ran to completion has a reusable
    /// stack; any other context is dropped along with its entry closure.
    pub(crate) fn into_stack(mut self) -> Option<DefaultStack> {
        let coroutine = self.coroutine.take()?;
        if !coroutine.done() {
            self.coroutine = Some(coroutine);
            return None;
        }
        Some(coroutine.into_stack())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(coroutine) = self.coroutine.as_mut() {
            if coroutine.started() && !coroutine.done() {
                // SAFETY: Nothing resumes this context again. Whatever lives on its stack is
                //         leaked rather than unwound on a thread it was never running on.
                unsafe { coroutine.force_reset() };
            }
        }
    }
}

pub(crate) fn stack_size(stack: &DefaultStack) -> usize {
    stack.base().get() - stack.limit().get()
}

pub(crate) fn allocate_stack(size: usize) -> std::io::Result<DefaultStack> {
    DefaultStack::new(size)
}

#[cfg(test)]
mod test {
    use {super::*, std::sync::Arc};

    #[test]
    fn only_finished_contexts_give_their_stack_back() {
        let captured = Arc::new(());
        let unstarted = Context::new(allocate_stack(64 * 1024).unwrap(), {
            let captured = Arc::clone(&captured);
            move |_| drop(captured)
        });
        assert_eq!(Arc::strong_count(&captured), 2);
        assert!(unstarted.into_stack().is_none());
        assert_eq!(Arc::strong_count(&captured), 1);

        let mut finished = Context::new(allocate_stack(64 * 1024).unwrap(), |_| {});
        assert!(finished.resume().is_none());
        let stack = finished.into_stack().unwrap();
        assert!(stack_size(&stack) >= 64 * 1024);
    }
}
