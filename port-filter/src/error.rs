use std::{fmt, io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("object {} not found or unreadable", .path.display())]
    ObjectNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("object is malformed: {reason}")]
    ObjectMalformed { reason: String },

    #[error("program {program} rejected by the kernel verifier")]
    VerificationRejected {
        program: String,
        verifier_log: String,
        #[source]
        source: io::Error,
    },

    #[error("permission denied while {action}")]
    PermissionDenied {
        action: String,
        #[source]
        source: io::Error,
    },

    #[error("kernel resources exhausted while {action}")]
    ResourceExhausted {
        action: String,
        #[source]
        source: io::Error,
    },

    #[error("{kind} {name} not found in object")]
    NameNotFound { kind: ObjectKind, name: String },

    #[error("policy value {value} is outside 1..=65535")]
    InvalidPolicyValue { value: i64 },

    #[error("failed to write policy into map {map}: {reason}")]
    MapWriteFailed { map: String, reason: String },

    #[error("interface {name} not found")]
    InterfaceNotFound {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach to {target}: {reason}")]
    AttachFailed { target: String, reason: String },

    #[error("failed to detach {link}: {reason}")]
    DetachFailed { link: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectKind {
    Map,
    Program,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Map => f.write_str("map"),
            ObjectKind::Program => f.write_str("program"),
        }
    }
}

/// Coarse outcome of a failed kernel call, decided by its errno.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelFailure {
    Permission,
    Exhausted,
    Other,
}

pub fn classify_errno(err: &io::Error) -> KernelFailure {
    match err.raw_os_error() {
        Some(libc::EPERM) => KernelFailure::Permission,
        Some(libc::ENOMEM | libc::E2BIG | libc::ENOSPC | libc::EMFILE | libc::ENFILE) => {
            KernelFailure::Exhausted
        }
        _ => KernelFailure::Other,
    }
}

impl FilterError {
    /// Maps a kernel failure onto the privilege/resource variants, handing
    /// anything else to `otherwise`.
    pub fn from_kernel(
        action: impl Into<String>,
        source: io::Error,
        otherwise: impl FnOnce(String, io::Error) -> FilterError,
    ) -> Self {
        let action = action.into();
        match classify_errno(&source) {
            KernelFailure::Permission => FilterError::PermissionDenied { action, source },
            KernelFailure::Exhausted => FilterError::ResourceExhausted { action, source },
            KernelFailure::Other => otherwise(action, source),
        }
    }
}

/// Lifecycle stage a fatal error came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Config,
    Load,
    Build,
    Configure,
    Attach,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Load => "load",
            Stage::Build => "build",
            Stage::Configure => "configure",
            Stage::Attach => "attach",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: FilterError,
}

pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> StageExt<T> for Result<T, FilterError> {
    fn stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}
