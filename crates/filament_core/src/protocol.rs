use {
    crate::{state::DetachWord, AtomicSlot, DetachState, Payload, ProtocolError},
    std::{
        fmt::{Debug, Formatter},
        ptr,
        sync::Arc,
    },
};

/// A party to the join/detach protocol: something that carries a [`JoinCell`] and is shared
/// through an [`Arc`]. The runtime implements this for its fiber objects.
pub trait Participant: Sized {
    fn join_cell(&self) -> &JoinCell<Self>;
}

/// How parties sleep and wake. The protocol decides *who* sleeps and *who* wakes; the
/// scheduler behind this trait decides *how*.
pub trait Rendezvous<T> {
    /// Suspends `me` and, only once it has fully stopped running, publishes it into `slot`.
    /// Returns after some other party has passed `me` to [`Rendezvous::schedule`].
    fn set_and_wait(&self, slot: &AtomicSlot<Arc<T>>, me: Arc<T>);

    /// Takes the party published into `slot`, waiting for the publication if the party is
    /// still on its way to sleep. Never waits on anything but that publication.
    fn clear_or_wait(&self, slot: &AtomicSlot<Arc<T>>) -> Arc<T>;

    /// Makes a party taken with [`Rendezvous::clear_or_wait`] runnable again.
    fn schedule(&self, party: Arc<T>);
}

/// The per-fiber half of the join/detach rendezvous.
///
/// The detach state (packed with the fiber object's generation) decides which of the
/// finisher, the joiner and the detacher sleeps and which one wakes it; see [`DetachState`]
/// for the table. `join_info` holds whichever party is asleep. `result` holds the finisher's
/// payload until a joiner claims it, or the joiner's incoming payload while it sleeps.
pub struct JoinCell<T> {
    word: DetachWord,
    join_info: AtomicSlot<Arc<T>>,
    result: AtomicSlot<Box<Payload>>,
}

impl<T> JoinCell<T> {
    pub fn new(generation: u64) -> Self {
        JoinCell {
            word: DetachWord::new(generation),
            join_info: AtomicSlot::empty(),
            result: AtomicSlot::empty(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.word.load().0
    }

    pub fn state(&self) -> DetachState {
        self.word.load().1
    }

    /// Prepares the cell for the next fiber to occupy the same object: drops any unclaimed
    /// result, bumps the generation and resets the state to [`DetachState::None`]. Only the
    /// owner of a dead fiber may call this. Returns the new generation.
    pub fn recycle(&self) -> u64 {
        drop(self.join_info.take());
        drop(self.result.take());
        self.word.recycle()
    }
}

impl<T: Participant> JoinCell<T> {
    /// Records that the fiber owning this cell has finished with `result`.
    ///
    /// Without a joiner yet, the finisher publishes itself and sleeps until a joiner claims the
    /// result or a detacher releases it. With a joiner already asleep, the result is moved to
    /// the joiner and the joiner is woken. A detached fiber drops its result and returns.
    pub fn complete<R: Rendezvous<T>>(&self, me: Arc<T>, result: Payload, rendezvous: &R) {
        self.result.publish(Box::new(result));
        match self.word.advance(None, DetachState::on_complete) {
            Ok(DetachState::None) => rendezvous.set_and_wait(&self.join_info, me),
            Ok(_) => {
                let joiner = rendezvous.clear_or_wait(&self.join_info);
                if let Some(result) = self.result.take() {
                    joiner.join_cell().result.publish(result);
                }
                rendezvous.schedule(joiner);
            }
            Err(_) => drop(self.result.take()),
        }
    }

    /// Waits for the fiber owning this cell to finish and takes its result.
    ///
    /// `Ok(None)` means the joiner was admitted but the target was detached before it finished.
    pub fn join<R: Rendezvous<T>>(
        &self,
        generation: u64,
        me: Arc<T>,
        rendezvous: &R,
    ) -> Result<Option<Payload>, ProtocolError> {
        if ptr::eq(me.join_cell(), self) {
            return Err(ProtocolError::SelfJoin);
        }
        match self.word.advance(Some(generation), DetachState::on_join)? {
            DetachState::None => {
                let cell = Arc::clone(&me);
                rendezvous.set_and_wait(&self.join_info, me);
                Ok(cell.join_cell().result.take().map(|result| *result))
            }
            _ => Ok(self.claim_from_finisher(rendezvous)),
        }
    }

    /// Takes the result only if the fiber owning this cell is already waiting for a joiner.
    /// Never waits for the finisher to finish; [`Rendezvous::clear_or_wait`] may still wait out
    /// a finisher that is on its way to sleep.
    pub fn try_join<R: Rendezvous<T>>(
        &self,
        generation: u64,
        rendezvous: &R,
    ) -> Result<Option<Payload>, ProtocolError> {
        self.word.advance(Some(generation), DetachState::on_try_join)?;
        Ok(self.claim_from_finisher(rendezvous))
    }

    /// Gives up the right to join. Wakes whichever party is asleep on this cell.
    pub fn detach<R: Rendezvous<T>>(
        &self,
        generation: u64,
        rendezvous: &R,
    ) -> Result<(), ProtocolError> {
        if self
            .word
            .advance(Some(generation), DetachState::on_detach)?
            .has_sleeper()
        {
            rendezvous.schedule(rendezvous.clear_or_wait(&self.join_info));
        }
        Ok(())
    }

    fn claim_from_finisher<R: Rendezvous<T>>(&self, rendezvous: &R) -> Option<Payload> {
        // Taken before the finisher is woken: once it runs again it may be recycled.
        let result = self.result.take();
        rendezvous.schedule(rendezvous.clear_or_wait(&self.join_info));
        result.map(|result| *result)
    }
}

impl<T> Default for JoinCell<T> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T> Debug for JoinCell<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (generation, state) = self.word.load();
        f.debug_struct("JoinCell")
            .field("generation", &generation)
            .field("state", &state)
            .field("sleeper", &!self.join_info.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::{
            sync::{
                atomic::{AtomicBool, AtomicUsize, Ordering},
                Arc, Barrier, Mutex,
            },
            thread::{self, Thread},
            time::Duration,
        },
    };

    /// A protocol party backed by an OS thread.
    #[derive(Default)]
    struct Party {
        cell: JoinCell<Party>,
        thread: Mutex<Option<Thread>>,
        woken: AtomicBool,
        wakes: AtomicUsize,
    }

    impl Participant for Party {
        fn join_cell(&self) -> &JoinCell<Self> {
            &self.cell
        }
    }

    struct Threads;

    impl Rendezvous<Party> for Threads {
        fn set_and_wait(&self, slot: &AtomicSlot<Arc<Party>>, me: Arc<Party>) {
            *me.thread.lock().unwrap() = Some(thread::current());
            let waiting = Arc::clone(&me);
            assert!(slot.publish(me).is_none(), "slot already occupied");
            while !waiting.woken.swap(false, Ordering::AcqRel) {
                thread::park();
            }
        }

        fn clear_or_wait(&self, slot: &AtomicSlot<Arc<Party>>) -> Arc<Party> {
            loop {
                if let Some(party) = slot.take() {
                    return party;
                }
                thread::yield_now();
            }
        }

        fn schedule(&self, party: Arc<Party>) {
            party.wakes.fetch_add(1, Ordering::Relaxed);
            party.woken.store(true, Ordering::Release);
            if let Some(thread) = party.thread.lock().unwrap().as_ref() {
                thread.unpark();
            }
        }
    }

    fn party() -> Arc<Party> {
        Arc::new(Party::default())
    }

    fn payload(v: u32) -> Payload {
        Box::new(v)
    }

    fn value(p: Option<Payload>) -> Option<u32> {
        p.map(|p| *p.downcast::<u32>().unwrap())
    }

    fn finish_on_thread(target: &Arc<Party>, v: u32) -> thread::JoinHandle<()> {
        let target = Arc::clone(target);
        thread::spawn(move || target.cell.complete(Arc::clone(&target), payload(v), &Threads))
    }

    fn wait_for_state(target: &Arc<Party>, state: DetachState) {
        while target.cell.state() != state {
            thread::yield_now();
        }
    }

    #[test]
    fn joiner_claims_result_from_waiting_finisher() {
        let target = party();
        let finisher = finish_on_thread(&target, 7);
        wait_for_state(&target, DetachState::WaitForJoiner);

        let joiner = party();
        assert_eq!(value(target.cell.join(1, joiner, &Threads).unwrap()), Some(7));
        finisher.join().unwrap();
        assert_eq!(target.cell.state(), DetachState::Joined);
        assert_eq!(target.wakes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn finisher_hands_result_to_waiting_joiner() {
        let target = party();
        let joiner = party();
        let joining = {
            let (target, joiner) = (Arc::clone(&target), Arc::clone(&joiner));
            thread::spawn(move || value(target.cell.join(1, joiner, &Threads).unwrap()))
        };
        wait_for_state(&target, DetachState::WaitToJoin);
        thread::sleep(Duration::from_millis(5));

        target.cell.complete(Arc::clone(&target), payload(9), &Threads);
        assert_eq!(joining.join().unwrap(), Some(9));
        assert_eq!(target.cell.state(), DetachState::Joined);
        assert_eq!(joiner.wakes.load(Ordering::Relaxed), 1);
        assert_eq!(target.wakes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn detach_wakes_waiting_joiner_without_a_result() {
        let target = party();
        let joining = {
            let target = Arc::clone(&target);
            thread::spawn(move || target.cell.join(1, party(), &Threads))
        };
        wait_for_state(&target, DetachState::WaitToJoin);
        target.cell.detach(1, &Threads).unwrap();
        assert!(joining.join().unwrap().unwrap().is_none());

        // The finisher later sees Detached and returns without sleeping.
        target.cell.complete(Arc::clone(&target), payload(1), &Threads);
        assert_eq!(target.wakes.load(Ordering::Relaxed), 0);
        assert_eq!(target.cell.state(), DetachState::Detached);
    }

    #[test]
    fn detach_releases_waiting_finisher() {
        let target = party();
        let finisher = finish_on_thread(&target, 3);
        wait_for_state(&target, DetachState::WaitForJoiner);
        target.cell.detach(1, &Threads).unwrap();
        finisher.join().unwrap();
        assert_eq!(target.wakes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn misuse_leaves_state_untouched() {
        let target = party();
        assert_eq!(
            target.cell.try_join(1, &Threads).unwrap_err(),
            ProtocolError::WouldBlock
        );
        assert_eq!(target.cell.state(), DetachState::None);

        assert_eq!(
            target.cell.join(1, Arc::clone(&target), &Threads).unwrap_err(),
            ProtocolError::SelfJoin
        );
        assert_eq!(
            target.cell.detach(2, &Threads).unwrap_err(),
            ProtocolError::Stale
        );

        target.cell.detach(1, &Threads).unwrap();
        assert_eq!(
            target.cell.detach(1, &Threads).unwrap_err(),
            ProtocolError::Detached
        );
        assert_eq!(
            target.cell.join(1, party(), &Threads).unwrap_err(),
            ProtocolError::Detached
        );
        assert_eq!(target.cell.state(), DetachState::Detached);
    }

    #[test]
    fn second_joiner_is_rejected() {
        let target = party();
        let joining = {
            let target = Arc::clone(&target);
            thread::spawn(move || value(target.cell.join(1, party(), &Threads).unwrap()))
        };
        wait_for_state(&target, DetachState::WaitToJoin);
        assert_eq!(
            target.cell.join(1, party(), &Threads).unwrap_err(),
            ProtocolError::AlreadyJoined
        );
        assert_eq!(
            target.cell.try_join(1, &Threads).unwrap_err(),
            ProtocolError::AlreadyJoined
        );
        target.cell.complete(Arc::clone(&target), payload(4), &Threads);
        assert_eq!(joining.join().unwrap(), Some(4));
        assert_eq!(
            target.cell.detach(1, &Threads).unwrap_err(),
            ProtocolError::AlreadyJoined
        );
    }

    #[test]
    fn recycling_invalidates_old_handles() {
        let target = party();
        target.cell.detach(1, &Threads).unwrap();
        target.cell.complete(Arc::clone(&target), payload(0), &Threads);
        assert_eq!(target.cell.recycle(), 2);
        assert_eq!(target.cell.state(), DetachState::None);
        assert_eq!(
            target.cell.try_join(1, &Threads).unwrap_err(),
            ProtocolError::Stale
        );
        assert_eq!(
            target.cell.try_join(2, &Threads).unwrap_err(),
            ProtocolError::WouldBlock
        );
    }

    #[test]
    fn racing_join_and_complete_always_rendezvous() {
        for i in 0..500 {
            let target = party();
            let barrier = Arc::new(Barrier::new(2));
            let joining = {
                let (target, barrier) = (Arc::clone(&target), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    value(target.cell.join(1, party(), &Threads).unwrap())
                })
            };
            barrier.wait();
            target.cell.complete(Arc::clone(&target), payload(i), &Threads);
            assert_eq!(joining.join().unwrap(), Some(i));
            assert_eq!(target.cell.state(), DetachState::Joined);
        }
    }

    #[test]
    fn racing_join_detach_and_complete_never_strand_a_party() {
        for i in 0..500 {
            let target = party();
            let barrier = Arc::new(Barrier::new(3));
            let joining = {
                let (target, barrier) = (Arc::clone(&target), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    target.cell.join(1, party(), &Threads).map(value)
                })
            };
            let detaching = {
                let (target, barrier) = (Arc::clone(&target), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    target.cell.detach(1, &Threads)
                })
            };
            barrier.wait();
            target.cell.complete(Arc::clone(&target), payload(i), &Threads);

            let joined = joining.join().unwrap();
            let detached = detaching.join().unwrap();
            match (joined, detached) {
                (Ok(Some(v)), Err(ProtocolError::AlreadyJoined)) => assert_eq!(v, i),
                (Ok(None), Ok(())) | (Err(ProtocolError::Detached), Ok(())) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
            assert!(target.cell.state().is_terminal());
            assert!(target.wakes.load(Ordering::Relaxed) <= 1);
        }
    }
}
