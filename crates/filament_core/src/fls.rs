use {
    crate::{FlsError, FLS_KEYS_MAX},
    std::{
        fmt::{Debug, Formatter},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// Names one fiber-local storage slot.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct FlsKey(u32);

impl FlsKey {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<FlsKey> for u32 {
    fn from(key: FlsKey) -> Self {
        key.0
    }
}

impl From<u32> for FlsKey {
    fn from(index: u32) -> Self {
        FlsKey(index)
    }
}

/// A fixed table of [`FLS_KEYS_MAX`] word-sized values, each guarded by an in-use flag.
///
/// Values are shared by every fiber that uses the registry; a key does not give each fiber its
/// own copy. Reads of a key that is out of range or not in use yield `0`.
pub struct FlsRegistry {
    in_use: Box<[AtomicBool]>,
    values: Box<[AtomicUsize]>,
}

impl FlsRegistry {
    pub fn new() -> Self {
        FlsRegistry {
            in_use: (0..FLS_KEYS_MAX).map(|_| AtomicBool::new(false)).collect(),
            values: (0..FLS_KEYS_MAX).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Claims the lowest free key. Its value starts at `0`.
    pub fn create_key(&self) -> Result<FlsKey, FlsError> {
        for (index, in_use) in self.in_use.iter().enumerate() {
            if in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.values[index].store(0, Ordering::Release);
                return Ok(FlsKey(index as u32));
            }
        }
        Err(FlsError::Exhausted)
    }

    /// Releases `key` and resets its value so the next claimant starts from `0`.
    pub fn delete_key(&self, key: FlsKey) -> Result<(), FlsError> {
        let index = self.check(key)?;
        self.values[index].store(0, Ordering::Release);
        self.in_use[index].store(false, Ordering::Release);
        Ok(())
    }

    pub fn get(&self, key: FlsKey) -> usize {
        match self.check(key) {
            Ok(index) if self.in_use[index].load(Ordering::Acquire) => {
                self.values[index].load(Ordering::Acquire)
            }
            _ => 0,
        }
    }

    pub fn set(&self, key: FlsKey, value: usize) -> Result<(), FlsError> {
        let index = self.check(key)?;
        self.values[index].store(value, Ordering::Release);
        Ok(())
    }

    /// Number of keys currently claimed.
    pub fn len(&self) -> usize {
        self.in_use
            .iter()
            .filter(|in_use| in_use.load(Ordering::Relaxed))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every key.
    pub fn clear(&self) {
        for (in_use, value) in self.in_use.iter().zip(self.values.iter()) {
            value.store(0, Ordering::Release);
            in_use.store(false, Ordering::Release);
        }
    }

    fn check(&self, key: FlsKey) -> Result<usize, FlsError> {
        if key.index() < FLS_KEYS_MAX {
            Ok(key.index())
        } else {
            Err(FlsError::InvalidKey(key.0))
        }
    }
}

impl Default for FlsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for FlsRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlsRegistry")
            .field("keys_in_use", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use {super::*, proptest::prelude::*, std::sync::Arc};

    #[test]
    fn first_key_is_immediately_usable() {
        let fls = FlsRegistry::new();
        let key = fls.create_key().unwrap();
        assert_eq!(key, FlsKey(0));
        assert_eq!(fls.get(key), 0);
        fls.set(key, 42).unwrap();
        assert_eq!(fls.get(key), 42);
    }

    #[test]
    fn registry_is_exhausted_after_max_keys() {
        let fls = FlsRegistry::new();
        for expected in 0..FLS_KEYS_MAX {
            assert_eq!(fls.create_key().unwrap().index(), expected);
        }
        assert_eq!(fls.create_key(), Err(FlsError::Exhausted));

        fls.delete_key(FlsKey(17)).unwrap();
        assert_eq!(fls.create_key(), Ok(FlsKey(17)));
    }

    #[test]
    fn out_of_range_keys_are_rejected() {
        let fls = FlsRegistry::new();
        let key = FlsKey::from(FLS_KEYS_MAX as u32);
        assert_eq!(fls.set(key, 1), Err(FlsError::InvalidKey(1024)));
        assert_eq!(fls.delete_key(key), Err(FlsError::InvalidKey(1024)));
        assert_eq!(fls.get(key), 0);
    }

    #[test]
    fn deleted_keys_read_as_zero_and_restart_at_zero() {
        let fls = FlsRegistry::new();
        let key = fls.create_key().unwrap();
        fls.set(key, 5).unwrap();
        fls.delete_key(key).unwrap();
        assert_eq!(fls.get(key), 0);
        let again = fls.create_key().unwrap();
        assert_eq!(again, key);
        assert_eq!(fls.get(again), 0);
    }

    #[test]
    fn writes_after_delete_do_not_reach_the_next_claimant() {
        let fls = FlsRegistry::new();
        let key = fls.create_key().unwrap();
        fls.delete_key(key).unwrap();
        fls.set(key, 99).unwrap();
        assert_eq!(fls.create_key(), Ok(key));
        assert_eq!(fls.get(key), 0);
    }

    #[test]
    fn concurrent_creators_never_share_a_key() {
        let fls = Arc::new(FlsRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let fls = Arc::clone(&fls);
                std::thread::spawn(move || {
                    (0..FLS_KEYS_MAX / 8)
                        .map(|_| fls.create_key().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut keys: Vec<_> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), FLS_KEYS_MAX);
        assert_eq!(fls.len(), FLS_KEYS_MAX);
        fls.clear();
        assert!(fls.is_empty());
    }

    proptest! {
        #[test]
        fn set_then_get_returns_the_last_value(
            writes in proptest::collection::vec((0u32..8, any::<usize>()), 1..64),
        ) {
            let fls = FlsRegistry::new();
            let keys: Vec<_> = (0..8).map(|_| fls.create_key().unwrap()).collect();
            let mut expected = [0usize; 8];
            for (slot, value) in writes {
                fls.set(keys[slot as usize], value).unwrap();
                expected[slot as usize] = value;
            }
            for (key, value) in keys.iter().zip(expected) {
                prop_assert_eq!(fls.get(*key), value);
            }
        }
    }
}
