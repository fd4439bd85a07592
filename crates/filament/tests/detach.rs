use {
    common::{runtime, wait_until},
    filament::{DetachState, JoinError, ProtocolError},
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

mod common;

fn gated(gate: &Arc<AtomicBool>) -> impl FnOnce() -> u32 + Send + 'static {
    let gate = Arc::clone(gate);
    move || {
        while !gate.load(Ordering::Acquire) {
            filament::yield_now();
        }
        9
    }
}

#[test]
fn detach_wakes_a_waiting_joiner_without_a_result() {
    let rt = runtime(2);
    let gate = Arc::new(AtomicBool::new(false));
    let target = rt.spawn(gated(&gate)).unwrap().into_fiber();
    let joiner = rt
        .spawn({
            let target = target.clone();
            move || target.join().map(|result| result.is_none())
        })
        .unwrap();

    wait_until(|| target.detach_state() == DetachState::WaitToJoin);
    target.detach().unwrap();
    assert_eq!(joiner.join().unwrap(), Ok(true));
    assert_eq!(target.detach_state(), DetachState::Detached);

    // The detached fiber still runs to completion and its result is dropped.
    gate.store(true, Ordering::Release);
    wait_until(|| rt.handle().live_fibers() == 0);
    assert!(target.is_stale());
}

#[test]
fn typed_joiner_reports_detach_while_joining() {
    let rt = runtime(2);
    let gate = Arc::new(AtomicBool::new(false));
    let handle = rt.spawn(gated(&gate)).unwrap();
    let target = handle.fiber().clone();
    let joiner = rt.spawn(move || handle.join()).unwrap();

    wait_until(|| target.detach_state() == DetachState::WaitToJoin);
    target.detach().unwrap();
    assert!(matches!(
        joiner.join().unwrap(),
        Err(JoinError::DetachedWhileJoining)
    ));
    gate.store(true, Ordering::Release);
    wait_until(|| rt.handle().live_fibers() == 0);
}

#[test]
fn detaching_a_finished_fiber_releases_it() {
    let rt = runtime(1);
    let handle = rt.spawn(|| 5).unwrap();
    let target = handle.fiber().clone();
    wait_until(|| target.detach_state() == DetachState::WaitForJoiner);
    handle.detach().unwrap();
    wait_until(|| rt.handle().pooled_fibers() == 1);
    assert_eq!(rt.handle().live_fibers(), 0);
    assert_eq!(target.detach().unwrap_err(), ProtocolError::Stale);
}

#[test]
fn dropping_a_join_handle_detaches() {
    let rt = runtime(1);
    let gate = Arc::new(AtomicBool::new(false));
    let handle = rt.spawn(gated(&gate)).unwrap();
    let target = handle.fiber().clone();
    drop(handle);
    assert_eq!(target.detach_state(), DetachState::Detached);

    gate.store(true, Ordering::Release);
    wait_until(|| rt.handle().live_fibers() == 0);
    assert!(target.is_stale());
}

#[test]
fn a_detached_fiber_cannot_be_detached_or_joined_again() {
    let rt = runtime(1);
    let gate = Arc::new(AtomicBool::new(false));
    let target = rt.spawn(gated(&gate)).unwrap().into_fiber();
    target.detach().unwrap();
    assert_eq!(target.detach().unwrap_err(), ProtocolError::Detached);
    assert_eq!(target.join().unwrap_err(), ProtocolError::Detached);
    assert_eq!(target.try_join().unwrap_err(), ProtocolError::Detached);
    gate.store(true, Ordering::Release);
    wait_until(|| rt.handle().live_fibers() == 0);
}

#[test]
fn only_one_joiner_is_admitted() {
    let rt = runtime(2);
    let gate = Arc::new(AtomicBool::new(false));
    let target = rt.spawn(gated(&gate)).unwrap().into_fiber();
    let joiner = rt
        .spawn({
            let target = target.clone();
            move || {
                target
                    .join()
                    .map(|result| result.map(|payload| *payload.downcast::<u32>().unwrap()))
            }
        })
        .unwrap();

    wait_until(|| target.detach_state() == DetachState::WaitToJoin);
    assert_eq!(target.join().unwrap_err(), ProtocolError::AlreadyJoined);
    assert_eq!(target.try_join().unwrap_err(), ProtocolError::AlreadyJoined);

    gate.store(true, Ordering::Release);
    assert_eq!(joiner.join().unwrap(), Ok(Some(9)));
    wait_until(|| rt.handle().live_fibers() == 0);
    assert_eq!(target.detach().unwrap_err(), ProtocolError::Stale);
}

#[test]
fn a_fiber_that_detaches_itself_cannot_be_joined() {
    let rt = runtime(2);
    let gate = Arc::new(AtomicBool::new(false));
    let target = rt
        .spawn({
            let gate = Arc::clone(&gate);
            move || {
                filament::current().detach()?;
                while !gate.load(Ordering::Acquire) {
                    filament::yield_now();
                }
                Ok::<_, ProtocolError>(())
            }
        })
        .unwrap()
        .into_fiber();

    wait_until(|| target.detach_state() == DetachState::Detached);
    let joiner = rt
        .spawn({
            let target = target.clone();
            move || target.join().map(|_| ())
        })
        .unwrap();
    assert_eq!(joiner.join().unwrap(), Err(ProtocolError::Detached));

    gate.store(true, Ordering::Release);
    wait_until(|| rt.handle().live_fibers() == 0);
    assert!(target.is_stale());
}
