//! `backupd-scheduler`: profile lifecycle and invocation scheduling.
//!
//! # Overview
//!
//! The [`registry::ProfileRegistry`] holds the active backup profiles as an
//! immutable snapshot and gives every profile generation its own
//! [`types::CancellationScope`]. Each tick the worker asks it for the next
//! [`types::InvocationDescriptor`] of every profile, feeds those into the
//! [`queue::InvocationScheduler`], and drains whatever is due.
//!
//! | Step               | Owner                  | Guarantees                                  |
//! |--------------------|------------------------|---------------------------------------------|
//! | reload             | `ProfileRegistry`      | atomic swap; changed/removed scopes revoked |
//! | `get_invocations`  | `ProfileRegistry`      | one descriptor per profile with a next run  |
//! | `schedule`         | `InvocationScheduler`  | one pending entry per (profile, instant)    |
//! | `drain_due`        | `InvocationScheduler`  | ascending order, revoked entries dropped    |

pub mod error;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod types;

pub use error::{Result, SchedulerError};
pub use queue::InvocationScheduler;
pub use registry::{ProfileRegistry, RejectedProfile, ReloadReport};
pub use schedule::{parse_time_zone, CronClock};
pub use types::{CancellationScope, InvocationDescriptor, Profile, SearchDefinition};
