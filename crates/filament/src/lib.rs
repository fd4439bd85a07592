//! Filament is a cooperative fiber runtime: many fibers multiplexed over a few manager threads,
//! each running until it suspends.
//!
//! Finishing fibers and the fibers that want their results meet in a lock-free join/detach
//! rendezvous (see [`filament_core::JoinCell`]). Exactly one outcome is agreed on whether the
//! fiber finishes first, the joiner arrives first, or the fiber is detached while somebody
//! waits for it.
//!
//! # Usage
//!
//! ```no_run
//! use {filament::Runtime, std::time::Duration};
//!
//! let runtime = Runtime::new().unwrap();
//! let sleeper = runtime
//!     .spawn(|| {
//!         filament::sleep(Duration::from_millis(10)).unwrap();
//!         "rested"
//!     })
//!     .unwrap();
//! assert_eq!(sleeper.join().unwrap(), "rested");
//! ```
//!
//! The calling thread joins as a *root fiber*: an OS thread adapted so that it can take part
//! in the protocol by parking instead of switching stacks.
//!
//! # Features
//!
//! - `serde`: Implement `Serialize` and `Deserialize` for [`Config`] and the core id/state types.
//! - `serde_json`: Include [`Config::from_json`].

#![cfg_attr(all(doc, CHANNEL_NIGHTLY), feature(doc_auto_cfg))]
#![deny(unused_must_use)]
#![warn(rust_2018_idioms, unreachable_pub)]

mod config;
mod context;
mod error;
mod event;
mod fiber;
mod runtime;
mod sched;

pub use config::Config;

pub use error::{ConfigError, Error, EventError, JoinError, PollError};

pub use event::{fd_closed, sleep, wait_for_event, EventLoop, Interest};

pub use fiber::{Builder, Fiber, JoinHandle, Unscheduled};

pub use filament_core::{
    AllocationError, DetachState, ExecutionState, FiberId, FlsError, FlsKey, FlsRegistry,
    Payload, ProtocolError, DEFAULT_STACK_SIZE, FLS_KEYS_MAX, MIN_STACK_SIZE, TIME_RESOLUTION,
};

pub use runtime::{Handle, Runtime};

pub use sched::{current, spawn, yield_now};
