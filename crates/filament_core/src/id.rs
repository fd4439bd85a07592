use core::fmt::{Debug, Display, Formatter};

/// Identifies one incarnation of a fiber object.
///
/// `serial` names the object and never changes; `generation` starts at 1 and is bumped every
/// time the object is recycled for a new fiber. Two ids are only equal when both match, so a
/// handle kept past its fiber's lifetime can be told apart from the object's next occupant.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct FiberId {
    serial: usize,
    generation: u64,
}

impl FiberId {
    pub fn new(serial: usize, generation: u64) -> Self {
        FiberId { serial, generation }
    }

    pub fn serial(&self) -> usize {
        self.serial
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Debug for FiberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        Display::fmt(self, f)
    }
}

impl Display for FiberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(":")?;
        Display::fmt(&self.serial, f)?;
        if self.generation != 1 {
            f.write_str("#")?;
            Display::fmt(&self.generation, f)?;
        }
        Ok(())
    }
}

impl From<(usize, u64)> for FiberId {
    fn from((serial, generation): (usize, u64)) -> Self {
        FiberId::new(serial, generation)
    }
}

impl From<FiberId> for (usize, u64) {
    fn from(id: FiberId) -> Self {
        (id.serial, id.generation)
    }
}
