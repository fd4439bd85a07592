//! This module specifies the core types for the [Filament](https://docs.rs/filament/) fiber
//! runtime.
//!
//! Nothing in here knows how to switch stacks or run a scheduler. The crate holds the pieces
//! that must be correct under every interleaving and are therefore worth testing in isolation:
//!
//! - [`JoinCell`]: the lock-free join/detach rendezvous between a finishing fiber and the
//!   fiber (if any) that wants its result, generic over a [`Rendezvous`] implementation.
//! - [`AtomicSlot`]: the single-slot publish/consume cell the protocol is built from.
//! - [`DetachState`] / [`ExecutionState`]: the state machines, with the transition table as
//!   pure functions.
//! - [`FlsRegistry`]: the fixed-capacity fiber-local storage table.
//!
//! # Features
//!
//! - `serde`: Implement `Serialize` and `Deserialize` where applicable.

#![cfg_attr(all(doc, CHANNEL_NIGHTLY), feature(doc_auto_cfg))]
#![deny(unused_must_use)]
#![warn(rust_2018_idioms, unreachable_pub)]

use std::time::Duration;

mod error;
mod fls;
mod id;
mod protocol;
mod slot;
mod state;

/// Stack size used when the caller does not ask for one.
pub const DEFAULT_STACK_SIZE: usize = 102_400;

/// Smallest stack a caller may request. Requesting less is a contract violation that is not
/// checked in release builds.
pub const MIN_STACK_SIZE: usize = 1024;

/// How long an idle manager thread waits for events before looking for work again. Higher
/// values burn less CPU on idle threads; lower values pick up new work sooner.
pub const TIME_RESOLUTION: Duration = Duration::from_millis(5);

/// Number of fiber-local storage keys a registry can hand out.
pub const FLS_KEYS_MAX: usize = 1024;

/// The owned result a fiber hands to its joiner.
pub type Payload = Box<dyn std::any::Any + Send>;

pub use error::{AllocationError, FlsError, ProtocolError};

pub use fls::{FlsKey, FlsRegistry};

pub use id::FiberId;

pub use protocol::{JoinCell, Participant, Rendezvous};

pub use slot::{AtomicSlot, SlotPointer};

pub use state::{AtomicExecutionState, DetachState, ExecutionState};
