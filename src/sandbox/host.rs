//! Runs one sandbox to completion under a wall-clock bound.
//!
//! `JsRuntime` is `!Send` and a synchronous loop never yields, so each run
//! gets its own OS thread and current-thread Tokio runtime. The caller keeps
//! the isolate's thread-safe handle and terminates execution from outside
//! when the bound elapses.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions};
use serde::Deserialize;
use tokio::sync::oneshot;

use super::builder::{build_runtime, ExecutionMode, SandboxSpec};
use super::diagnostic;
use super::ops::ConsoleBuffer;
use super::SCRIPT_NAME;

const RESPONSE_PROBE_NAME: &str = "sandbox:response.js";

/// How long to wait for a terminated worker before giving up on it.
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HostLimits {
    pub timeout: Duration,
    pub settle_window: Duration,
    pub max_heap_size: usize,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            settle_window: Duration::from_secs(2),
            max_heap_size: 64 * 1024 * 1024,
        }
    }
}

impl HostLimits {
    /// Total wall-clock a run in `mode` may use.
    pub fn budget(&self, mode: ExecutionMode) -> Duration {
        match mode {
            ExecutionMode::Direct => self.timeout,
            ExecutionMode::Async => self.timeout + self.settle_window,
        }
    }

    fn timeout_message(&self) -> String {
        format!("Script execution timed out after {}ms", self.timeout.as_millis())
    }

    fn heap_message(&self) -> String {
        format!(
            "Script exceeded the memory limit of {}MB",
            self.max_heap_size / (1024 * 1024)
        )
    }
}

/// Shared between a worker and its watchdog.
#[derive(Debug, Default)]
pub struct Interrupt {
    pub timed_out: AtomicBool,
    pub heap_exhausted: AtomicBool,
    settling: AtomicBool,
}

impl Interrupt {
    fn fired(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst) || self.heap_exhausted.load(Ordering::SeqCst)
    }
}

/// What the script explicitly set on `response`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptResponse {
    #[serde(default = "default_status")]
    pub status: serde_json::Value,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default)]
    pub body: serde_json::Value,
}

fn default_status() -> serde_json::Value {
    serde_json::Value::from(200)
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub output: String,
    pub console: String,
    pub return_value: Option<String>,
    /// Direct mode only.
    pub response: Option<ScriptResponse>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ScriptFailure {
    pub message: String,
    pub line: Option<usize>,
    pub timed_out: bool,
    pub output: String,
    pub console: String,
}

impl ScriptFailure {
    fn bare(message: String, timed_out: bool) -> Self {
        Self {
            message,
            line: None,
            timed_out,
            output: String::new(),
            console: String::new(),
        }
    }

    /// The operator-facing text for this failure against `source`.
    pub fn diagnostic(&self, source: &str) -> String {
        diagnostic::render(&self.message, self.line, source)
    }
}

#[derive(Debug)]
pub enum ExecError {
    /// The script failed: thrown error, syntax error, timeout, heap limit.
    Script(ScriptFailure),
    /// The host failed around the script.
    Host(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Script(failure) => write!(f, "Script failed: {}", failure.message),
            ExecError::Host(msg) => write!(f, "Execution host error: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {}

#[derive(Debug, Clone, Default)]
pub struct ExecutionHost {
    limits: HostLimits,
}

impl ExecutionHost {
    pub fn new(limits: HostLimits) -> Self {
        Self { limits }
    }

    pub async fn run(&self, spec: SandboxSpec) -> Result<ExecutionReport, ExecError> {
        let limits = self.limits.clone();
        let interrupt = Arc::new(Interrupt::default());
        let (handle_tx, handle_rx) = oneshot::channel::<v8::IsolateHandle>();
        let (done_tx, mut done_rx) = oneshot::channel();

        let worker_limits = limits.clone();
        let worker_interrupt = interrupt.clone();
        std::thread::Builder::new()
            .name("script-runner".to_string())
            .spawn(move || {
                let result = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(run_isolated(
                        spec,
                        worker_limits,
                        worker_interrupt,
                        handle_tx,
                    )),
                    Err(e) => Err(ExecError::Host(format!("failed to start script runtime: {e}"))),
                };
                let _ = done_tx.send(result);
            })
            .map_err(|e| ExecError::Host(format!("failed to spawn script worker: {e}")))?;

        let Ok(isolate) = handle_rx.await else {
            return worker_result(done_rx.await);
        };

        tokio::select! {
            result = &mut done_rx => return worker_result(result),
            _ = tokio::time::sleep(limits.timeout) => {}
        }

        if interrupt.settling.load(Ordering::SeqCst) {
            tokio::select! {
                result = &mut done_rx => return worker_result(result),
                _ = tokio::time::sleep(limits.settle_window) => {}
            }
        }

        tracing::warn!(
            timeout_ms = limits.timeout.as_millis() as u64,
            "Script exceeded its time limit, terminating"
        );
        interrupt.timed_out.store(true, Ordering::SeqCst);
        isolate.terminate_execution();

        match tokio::time::timeout(TERMINATION_GRACE, done_rx).await {
            Ok(result) => worker_result(result),
            Err(_) => {
                tracing::error!("Script worker did not stop after termination, abandoning it");
                Err(ExecError::Script(ScriptFailure::bare(limits.timeout_message(), true)))
            }
        }
    }
}

fn worker_result(
    result: Result<Result<ExecutionReport, ExecError>, oneshot::error::RecvError>,
) -> Result<ExecutionReport, ExecError> {
    result.unwrap_or_else(|_| Err(ExecError::Host("script worker exited unexpectedly".to_string())))
}

async fn run_isolated(
    spec: SandboxSpec,
    limits: HostLimits,
    interrupt: Arc<Interrupt>,
    handle_tx: oneshot::Sender<v8::IsolateHandle>,
) -> Result<ExecutionReport, ExecError> {
    let started = Instant::now();

    let mut runtime = build_runtime(&spec, &limits, &interrupt)
        .map_err(|e| ExecError::Host(format!("failed to build sandbox: {e}")))?;

    if handle_tx.send(runtime.v8_isolate().thread_safe_handle()).is_err() {
        return Err(ExecError::Host("execution host went away".to_string()));
    }

    let completion = match runtime.execute_script(SCRIPT_NAME, spec.script_text()) {
        Ok(value) => value,
        Err(err) => return Err(ExecError::Script(failure_from(&mut runtime, err, &limits, &interrupt))),
    };

    let mut response = None;
    match spec.mode {
        ExecutionMode::Direct => {
            response = read_response(&mut runtime)
                .map_err(|err| ExecError::Script(failure_from(&mut runtime, err, &limits, &interrupt)))?;
        }
        ExecutionMode::Async => {
            interrupt.settling.store(true, Ordering::SeqCst);
            settle(&mut runtime, &limits, &interrupt).await;
        }
    }

    if interrupt.fired() {
        runtime
            .v8_isolate()
            .thread_safe_handle()
            .cancel_terminate_execution();
    }
    let return_value = describe_value(&mut runtime, completion);
    let buffer = console_buffer(&mut runtime);

    Ok(ExecutionReport {
        output: buffer.output_text(),
        console: buffer.console_text(),
        return_value,
        response,
        elapsed: started.elapsed(),
    })
}

/// Drive pending work for up to the settle window, then stop looking.
/// Output that arrives later is lost.
async fn settle(runtime: &mut JsRuntime, limits: &HostLimits, interrupt: &Interrupt) {
    let outcome = tokio::time::timeout(
        limits.settle_window,
        runtime.run_event_loop(PollEventLoopOptions::default()),
    )
    .await;

    let message = match outcome {
        Ok(Ok(())) | Err(_) => return,
        Ok(Err(_)) if interrupt.heap_exhausted.load(Ordering::SeqCst) => limits.heap_message(),
        Ok(Err(_)) if interrupt.timed_out.load(Ordering::SeqCst) => limits.timeout_message(),
        Ok(Err(err)) => error_parts(&err).0,
    };

    if let Some(buffer) = runtime.op_state().borrow_mut().try_borrow_mut::<ConsoleBuffer>() {
        buffer.write("error", &format!("Error in execution: {message}"));
    }
}

fn failure_from(
    runtime: &mut JsRuntime,
    err: anyhow::Error,
    limits: &HostLimits,
    interrupt: &Interrupt,
) -> ScriptFailure {
    let buffer = console_buffer(runtime);
    let (message, line, timed_out) = if interrupt.heap_exhausted.load(Ordering::SeqCst) {
        (limits.heap_message(), None, false)
    } else if interrupt.timed_out.load(Ordering::SeqCst) {
        (limits.timeout_message(), None, true)
    } else {
        let (message, line) = error_parts(&err);
        (message, line, false)
    };

    ScriptFailure {
        message,
        line,
        timed_out,
        output: buffer.output_text(),
        console: buffer.console_text(),
    }
}

/// Message and user-script line of a thrown error.
fn error_parts(err: &anyhow::Error) -> (String, Option<usize>) {
    let Some(js) = err.downcast_ref::<JsError>() else {
        return (err.to_string(), None);
    };

    let message = js.message.clone().unwrap_or_else(|| {
        js.exception_message
            .trim_start_matches("Uncaught ")
            .to_string()
    });
    let message = match js.name.as_deref() {
        Some(name) if !name.is_empty() && name != "Error" => format!("{name}: {message}"),
        _ => message,
    };

    let line = js
        .frames
        .iter()
        .find(|frame| frame.file_name.as_deref() == Some(SCRIPT_NAME))
        .and_then(|frame| frame.line_number)
        .and_then(|n| usize::try_from(n).ok())
        .or_else(|| js.stack.as_deref().and_then(diagnostic::line_from_stack));

    (message, line)
}

fn console_buffer(runtime: &mut JsRuntime) -> ConsoleBuffer {
    runtime
        .op_state()
        .borrow()
        .try_borrow::<ConsoleBuffer>()
        .cloned()
        .unwrap_or_default()
}

fn read_response(runtime: &mut JsRuntime) -> Result<Option<ScriptResponse>, anyhow::Error> {
    let value = runtime.execute_script(RESPONSE_PROBE_NAME, "globalThis.response".to_string())?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, value);
    if !local.is_object() {
        return Ok(None);
    }

    let scope = &mut v8::TryCatch::new(scope);
    let Some(json) = v8::json::stringify(scope, local) else {
        anyhow::bail!("response could not be serialized");
    };
    let json = json.to_rust_string_lossy(scope);

    let response = serde_json::from_str(&json)
        .map_err(|e| anyhow::anyhow!("response is malformed: {e}"))?;
    Ok(Some(response))
}

/// String form of a completion value: strings as-is, everything else as
/// JSON where possible. `undefined`, `null` and unsettled promises are `None`.
fn describe_value(runtime: &mut JsRuntime, value: v8::Global<v8::Value>) -> Option<String> {
    let scope = &mut runtime.handle_scope();
    let mut local = v8::Local::new(scope, value);

    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
        match promise.state() {
            v8::PromiseState::Fulfilled => local = promise.result(scope),
            _ => return None,
        }
    }

    if local.is_null_or_undefined() {
        return None;
    }
    if local.is_string() {
        return Some(local.to_rust_string_lossy(scope));
    }

    let scope = &mut v8::TryCatch::new(scope);
    match v8::json::stringify(scope, local) {
        Some(json) => Some(json.to_rust_string_lossy(scope)),
        None => local.to_string(scope).map(|s| s.to_rust_string_lossy(scope)),
    }
}
