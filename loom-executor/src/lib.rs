//! Sandboxed execution of route handlers for the Loom engine.
//!
//! Handlers are Lua 5.4 chunks. [`compile`] syntax-checks a source once;
//! [`Sandbox::run`] executes it in a brand-new Lua state with a reduced
//! standard library, host primitives, a mediated `require`, a memory
//! ceiling, and a wall-clock deadline. The [`DependencyProvisioner`]
//! installs each route's packages into an isolated directory and loads
//! them back as the [`ModuleSet`] its [`ModuleResolver`] sees.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod builtins;
pub mod config;
pub mod convert;
pub mod error;
pub mod executable;
pub mod invocation;
pub mod provisioner;
pub mod resolver;
pub mod sandbox;

pub use builtins::BuiltinModule;
pub use config::{
    SandboxLimits, DEFAULT_CUSTOM_TIMEOUT, DEFAULT_INSTRUCTION_INTERVAL, DEFAULT_LOGIC_TIMEOUT,
    DEFAULT_MEMORY_LIMIT_BYTES,
};
pub use error::{ExecutionError, ProvisionError};
pub use executable::{compile, Executable};
pub use invocation::{
    ExecutionReport, HandlerResponse, InvocationContext, InvocationUser, ResponseBody,
};
pub use provisioner::{
    DependencyProvisioner, DirectoryPackageSource, FailedDependency, HttpPackageSource,
    InstallReport, Package, PackageSource,
};
pub use resolver::{ModuleResolver, ModuleSet, Resolution};
pub use sandbox::{Sandbox, BACKSTOP_GRACE, DEFAULT_MAX_CONCURRENT};
