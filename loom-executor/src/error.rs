//! Error types for the executor crate.

use std::path::PathBuf;

use loom_core::CoreError;

/// Ways a sandboxed invocation can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The handler source does not parse.
    #[error("handler failed to compile: {message}")]
    Compile { message: String },

    /// The handler raised an error, or returned something that is not a
    /// valid response.
    #[error("{message}")]
    Runtime { message: String, stack: Option<String> },

    /// The handler required a module that is neither a safe built-in nor
    /// installed for this route.
    #[error("dependency '{name}' is not installed for this route")]
    DependencyMissing { name: String, stack: Option<String> },

    /// The wall-clock deadline elapsed.
    #[error("execution exceeded its {after_ms} ms deadline")]
    Timeout { after_ms: u64 },

    /// The sandbox itself could not be built or driven.
    #[error("sandbox failure: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Lua stack traceback, when one was captured.
    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Runtime { stack, .. } | Self::DependencyMissing { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime { message: message.into(), stack: None }
    }
}

/// Errors raised while provisioning per-route dependencies.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// The declared dependency string is malformed.
    #[error(transparent)]
    InvalidDependency(#[from] CoreError),

    /// The package source has no such package.
    #[error("package '{name}' not found")]
    PackageNotFound { name: String },

    /// The package source could not be reached or answered with an error.
    #[error("failed to fetch package '{name}': {reason}")]
    Fetch { name: String, reason: String },

    /// The package was fetched but does not compile.
    #[error("package '{name}' is not valid Lua: {reason}")]
    InvalidPackage { name: String, reason: String },

    /// The registry base URL is unusable.
    #[error("invalid package registry url '{url}': {reason}")]
    InvalidRegistryUrl { url: String, reason: String },

    /// A module file could not be read or written.
    #[error("module storage failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
