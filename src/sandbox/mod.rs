//! The script engine: one fresh V8 isolate per execution, reachable host
//! resources limited to the capability table.

mod allowlist;
mod builder;
pub mod diagnostic;
mod fetch;
mod host;
mod ops;

pub use allowlist::{Capability, ModuleAllowlist, ModuleNotAllowed};
pub use builder::{Capabilities, ExecutionMode, RequestDescriptor, SandboxSpec};
pub use fetch::FetchPolicy;
pub use host::{ExecError, ExecutionHost, ExecutionReport, HostLimits, ScriptFailure, ScriptResponse};
pub use ops::resolve_in_root;

/// Resource name user code is compiled under; stack frames point at it.
pub const SCRIPT_NAME: &str = "endpoint.js";
