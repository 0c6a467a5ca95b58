//! Userspace lifecycle for port-policy filter programs: load a compiled
//! object, write the policy port, attach to cgroup socket hooks or to an
//! interface's XDP ingress, and detach in reverse order on shutdown.

pub mod attach;
pub mod collection;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod object;
pub mod policy;
pub mod shutdown;
pub mod supervisor;

pub use error::{FilterError, Stage, StageError};
