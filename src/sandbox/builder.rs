use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde::{Deserialize, Serialize};

use super::allowlist::ModuleAllowlist;
use super::fetch::FetchPolicy;
use super::host::{HostLimits, Interrupt};
use super::ops::{scriptgate_sandbox, ConsoleBuffer, Deadline, TimerCancels};

const BOOTSTRAP_NAME: &str = "sandbox:bootstrap.js";
const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// The host resources a sandbox may reach, fixed at startup.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub allowlist: ModuleAllowlist,
    /// Root for the `fs` module and working directory for `child_process`.
    pub fs_root: PathBuf,
    pub fetch: FetchPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Bound to an inbound request; runs to completion and may shape a response.
    Direct,
    /// Wrapped in an async function; pending work gets the settle window.
    Async,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Direct => "direct",
            ExecutionMode::Async => "async",
        }
    }
}

/// The inbound request as a script sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

/// Everything needed to build one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub source: String,
    pub mode: ExecutionMode,
    pub request: Option<RequestDescriptor>,
    pub capabilities: Arc<Capabilities>,
}

impl SandboxSpec {
    pub fn direct(source: String, request: RequestDescriptor, capabilities: Arc<Capabilities>) -> Self {
        Self {
            source,
            mode: ExecutionMode::Direct,
            request: Some(request),
            capabilities,
        }
    }

    pub fn async_wrapped(source: String, capabilities: Arc<Capabilities>) -> Self {
        Self {
            source,
            mode: ExecutionMode::Async,
            request: None,
            capabilities,
        }
    }

    /// The text handed to V8. The async wrapper opens on the snippet's first
    /// line so reported line numbers match the source.
    pub fn script_text(&self) -> String {
        match self.mode {
            ExecutionMode::Direct => self.source.clone(),
            ExecutionMode::Async => format!(
                "(async () => {{ try {{ {}\n}} catch (__error) {{ console.error('Error in execution: ' + (__error && __error.message !== undefined ? __error.message : String(__error))); }} }})();",
                self.source
            ),
        }
    }
}

/// Read once by the bootstrap script.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxContext {
    pub mode: ExecutionMode,
    pub request: Option<RequestDescriptor>,
    pub process: ProcessInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub platform: &'static str,
    pub arch: &'static str,
    pub pid: u32,
    pub version: String,
}

impl ProcessInfo {
    fn current() -> Self {
        Self {
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            pid: std::process::id(),
            version: format!("scriptgate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Create a fresh isolate for `spec` and install the sandbox globals.
///
/// Nothing is shared with any other run: new isolate, new op state, new
/// console buffer.
pub fn build_runtime(
    spec: &SandboxSpec,
    limits: &HostLimits,
    interrupt: &Arc<Interrupt>,
) -> Result<JsRuntime, anyhow::Error> {
    let create_params = v8::Isolate::create_params().heap_limits(0, limits.max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![scriptgate_sandbox::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    let handle = runtime.v8_isolate().thread_safe_handle();
    let flag = interrupt.clone();
    runtime.add_near_heap_limit_callback(move |current, _initial| {
        flag.heap_exhausted.store(true, Ordering::SeqCst);
        handle.terminate_execution();
        // Headroom for the isolate to unwind after termination.
        current * 2
    });

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(ConsoleBuffer::default());
        state.put(TimerCancels::default());
        state.put(spec.capabilities.clone());
        state.put(Deadline(Instant::now() + limits.budget(spec.mode)));
        state.put(SandboxContext {
            mode: spec.mode,
            request: spec.request.clone(),
            process: ProcessInfo::current(),
        });
    }

    runtime.execute_script(BOOTSTRAP_NAME, BOOTSTRAP_JS.to_string())?;
    Ok(runtime)
}
