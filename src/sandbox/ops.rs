//! Host ops behind the sandbox globals.
//!
//! Every op that touches a host resource re-checks that its capability was
//! granted to the running sandbox, so a script that reaches `Deno.core.ops`
//! before it is removed still cannot widen its allowlist.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::rc::Rc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use anyhow::anyhow;
use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

use super::allowlist::{Capability, ModuleNotAllowed};
use super::builder::{Capabilities, SandboxContext};
use super::fetch::op_fetch;

/// Largest reply `net.send` will buffer.
const MAX_NET_RESPONSE: u64 = 1024 * 1024;

/// `PATH` handed to spawned processes in place of the host environment.
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How often a running child is polled between output chunks.
const SPAWN_POLL: Duration = Duration::from_millis(10);

/// What the script printed, in two transcripts.
#[derive(Debug, Default, Clone)]
pub struct ConsoleBuffer {
    pub output: Vec<String>,
    pub console: Vec<String>,
}

impl ConsoleBuffer {
    pub fn write(&mut self, level: &str, text: &str) {
        match level {
            "warn" => self.console.push(format!("[warn] {text}")),
            "error" => self.console.push(format!("[error] {text}")),
            _ => {
                self.output.push(text.to_string());
                self.console.push(text.to_string());
            }
        }
    }

    pub fn output_text(&self) -> String {
        self.output.join("\n")
    }

    pub fn console_text(&self) -> String {
        self.console.join("\n")
    }
}

/// Wall-clock point after which blocking ops give up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(pub Instant);

impl Deadline {
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

pub(crate) fn granted(state: &OpState, capability: Capability) -> Result<Arc<Capabilities>, AnyError> {
    let capabilities = state.borrow::<Arc<Capabilities>>();
    if capabilities.allowlist.grants(capability) {
        Ok(capabilities.clone())
    } else {
        Err(ModuleNotAllowed::new(capability.module_name()).into())
    }
}

/// Map a script-supplied path onto the sandbox root.
///
/// Absolute and relative paths are both taken relative to the root. `..`
/// may not climb above it, and an existing ancestor that canonicalizes
/// outside the root (a symlink out) is refused.
pub fn resolve_in_root(root: &Path, requested: &str) -> Result<PathBuf, AnyError> {
    let mut relative = PathBuf::new();
    for component in Path::new(requested).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(anyhow!("Path '{requested}' escapes the sandbox directory"));
                }
            }
            Component::Normal(part) => relative.push(part),
        }
    }

    let resolved = if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(&relative)
    };
    let canonical_root = root
        .canonicalize()
        .map_err(|e| anyhow!("Sandbox directory is unavailable: {e}"))?;

    let mut probe = Some(resolved.as_path());
    while let Some(candidate) = probe {
        if candidate.exists() {
            let canonical = candidate.canonicalize()?;
            if !canonical.starts_with(&canonical_root) {
                return Err(anyhow!("Path '{requested}' escapes the sandbox directory"));
            }
            break;
        }
        probe = candidate.parent();
    }

    Ok(resolved)
}

fn fs_path(state: &OpState, requested: &str) -> Result<PathBuf, AnyError> {
    let capabilities = granted(state, Capability::Fs)?;
    resolve_in_root(&capabilities.fs_root, requested)
}

// ── Runtime plumbing ───────────────────────────────────────────

#[op2]
#[serde]
pub fn op_sandbox_context(state: &mut OpState) -> SandboxContext {
    state.borrow::<SandboxContext>().clone()
}

#[op2(fast)]
pub fn op_console_write(state: &mut OpState, #[string] level: &str, #[string] text: &str) {
    if let Some(buffer) = state.try_borrow_mut::<ConsoleBuffer>() {
        buffer.write(level, text);
    }
}

#[op2(fast)]
pub fn op_require(state: &mut OpState, #[string] name: &str) -> Result<(), AnyError> {
    let capabilities = state.borrow::<Arc<Capabilities>>();
    capabilities.allowlist.resolve(name)?;
    Ok(())
}

/// Wake-ups for timer sleeps, keyed by timer id, so clearing a timer
/// releases the event loop instead of waiting the delay out.
#[derive(Debug, Default)]
pub struct TimerCancels(HashMap<u32, Rc<Notify>>);

impl TimerCancels {
    fn handle(&mut self, id: u32) -> Rc<Notify> {
        self.0.entry(id).or_default().clone()
    }
}

/// Resolves `true` once the delay passes, `false` if the timer was cleared.
#[op2(async)]
pub async fn op_sandbox_sleep(state: Rc<RefCell<OpState>>, id: u32, delay: u32) -> bool {
    let cancel = match state.borrow_mut().try_borrow_mut::<TimerCancels>() {
        Some(timers) => timers.handle(id),
        None => Rc::new(Notify::new()),
    };

    let slept = tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(u64::from(delay))) => true,
        _ = cancel.notified() => false,
    };

    if let Some(timers) = state.borrow_mut().try_borrow_mut::<TimerCancels>() {
        timers.0.remove(&id);
    }
    slept
}

#[op2(fast)]
pub fn op_sandbox_timer_cancel(state: &mut OpState, id: u32) {
    if let Some(timers) = state.try_borrow_mut::<TimerCancels>() {
        // A stored permit covers a sleep that has not been polled yet.
        timers.handle(id).notify_one();
    }
}

#[op2]
#[string]
pub fn op_bytes_encode(#[buffer] data: &[u8], #[string] encoding: &str) -> Result<String, AnyError> {
    use base64::Engine;

    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(String::from_utf8_lossy(data).into_owned()),
        "hex" => Ok(hex::encode(data)),
        "base64" => Ok(base64::engine::general_purpose::STANDARD.encode(data)),
        other => Err(anyhow!("Unknown encoding: {other}")),
    }
}

#[op2]
#[buffer]
pub fn op_bytes_decode(#[string] text: &str, #[string] encoding: &str) -> Result<Vec<u8>, AnyError> {
    use base64::Engine;

    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(text.as_bytes().to_vec()),
        "hex" => hex::decode(text).map_err(|e| anyhow!("Invalid hex: {e}")),
        "base64" => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| anyhow!("Invalid base64: {e}")),
        other => Err(anyhow!("Unknown encoding: {other}")),
    }
}

// ── fs ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    pub is_file: bool,
    pub is_directory: bool,
    pub modified_ms: f64,
}

#[op2]
#[buffer]
pub fn op_fs_read(state: &mut OpState, #[string] path: &str) -> Result<Vec<u8>, AnyError> {
    let target = fs_path(state, path)?;
    std::fs::read(&target).map_err(|e| anyhow!("Cannot read '{path}': {e}"))
}

#[op2(fast)]
pub fn op_fs_write(
    state: &mut OpState,
    #[string] path: &str,
    #[buffer] data: &[u8],
    append: bool,
) -> Result<(), AnyError> {
    let target = fs_path(state, path)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&target)
        .map_err(|e| anyhow!("Cannot write '{path}': {e}"))?;
    file.write_all(data)
        .map_err(|e| anyhow!("Cannot write '{path}': {e}"))?;
    Ok(())
}

#[op2(fast)]
pub fn op_fs_exists(state: &mut OpState, #[string] path: &str) -> bool {
    fs_path(state, path).is_ok_and(|target| target.exists())
}

#[op2]
#[serde]
pub fn op_fs_readdir(state: &mut OpState, #[string] path: &str) -> Result<Vec<String>, AnyError> {
    let target = fs_path(state, path)?;
    let mut names = std::fs::read_dir(&target)
        .map_err(|e| anyhow!("Cannot read directory '{path}': {e}"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

#[op2(fast)]
pub fn op_fs_mkdir(state: &mut OpState, #[string] path: &str, recursive: bool) -> Result<(), AnyError> {
    let target = fs_path(state, path)?;
    let result = if recursive {
        std::fs::create_dir_all(&target)
    } else {
        std::fs::create_dir(&target)
    };
    result.map_err(|e| anyhow!("Cannot create directory '{path}': {e}"))
}

#[op2(fast)]
pub fn op_fs_remove(state: &mut OpState, #[string] path: &str, recursive: bool) -> Result<(), AnyError> {
    let capabilities = granted(state, Capability::Fs)?;
    let target = resolve_in_root(&capabilities.fs_root, path)?;
    if target == capabilities.fs_root {
        return Err(anyhow!("Cannot remove the sandbox directory"));
    }

    let result = if target.is_dir() {
        if recursive {
            std::fs::remove_dir_all(&target)
        } else {
            std::fs::remove_dir(&target)
        }
    } else {
        std::fs::remove_file(&target)
    };
    result.map_err(|e| anyhow!("Cannot remove '{path}': {e}"))
}

#[op2]
#[serde]
pub fn op_fs_stat(state: &mut OpState, #[string] path: &str) -> Result<FileStat, AnyError> {
    let target = fs_path(state, path)?;
    let meta = std::fs::metadata(&target).map_err(|e| anyhow!("Cannot stat '{path}': {e}"))?;
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0);

    Ok(FileStat {
        size: meta.len(),
        is_file: meta.is_file(),
        is_directory: meta.is_dir(),
        modified_ms,
    })
}

// ── net ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetRequest {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[op2(fast)]
pub fn op_net_ip_version(state: &mut OpState, #[string] input: &str) -> Result<u32, AnyError> {
    granted(state, Capability::Net)?;
    Ok(match input.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => 4,
        Ok(IpAddr::V6(_)) => 6,
        Err(_) => 0,
    })
}

/// Connect, write `data`, half-close, and read the reply to EOF.
#[op2(async)]
#[string]
pub async fn op_net_send(
    state: Rc<RefCell<OpState>>,
    #[serde] request: NetRequest,
) -> Result<String, AnyError> {
    let remaining = {
        let state = state.borrow();
        granted(&state, Capability::Net)?;
        state.borrow::<Deadline>().remaining()
    };
    let wait = request
        .timeout_ms
        .map(Duration::from_millis)
        .map_or(remaining, |t| t.min(remaining));

    let exchange = async {
        let mut stream = tokio::net::TcpStream::connect((request.host.as_str(), request.port)).await?;
        stream.write_all(request.data.as_bytes()).await?;
        stream.shutdown().await?;
        let mut reply = Vec::new();
        (&mut stream).take(MAX_NET_RESPONSE).read_to_end(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    };

    let reply = tokio::time::timeout(wait, exchange)
        .await
        .map_err(|_| anyhow!("Connection to {}:{} timed out", request.host, request.port))?
        .map_err(|e| anyhow!("Connection to {}:{} failed: {e}", request.host, request.port))?;

    Ok(String::from_utf8_lossy(&reply).into_owned())
}

// ── child_process ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run a process to completion with an empty environment, inside the
/// sandbox directory. Killed when the run's deadline passes.
#[op2]
#[serde]
pub fn op_process_spawn(state: &mut OpState, #[serde] request: SpawnRequest) -> Result<SpawnOutput, AnyError> {
    let capabilities = granted(state, Capability::ChildProcess)?;
    let deadline = *state.borrow::<Deadline>();

    let mut command = if request.shell {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&request.command);
        command
    } else {
        let mut command = Command::new(&request.command);
        command.args(&request.args);
        command
    };
    command
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .current_dir(&capabilities.fs_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn '{}': {e}", request.command))?;

    if let Some(mut stdin) = child.stdin.take() {
        let input = request.input.unwrap_or_default();
        thread::spawn(move || {
            let _ = stdin.write_all(input.as_bytes());
        });
    }

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        pump(stdout, Pipe::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump(stderr, Pipe::Stderr, tx.clone());
    }
    drop(tx);

    // A backgrounded grandchild can keep the pipes open after the shell
    // exits, so reads are bounded by the deadline as well as the child.
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;
    let mut pipes_open = true;
    while status.is_none() || pipes_open {
        if deadline.expired() {
            kill_group(&mut child);
            return Err(anyhow!("Command '{}' timed out", request.command));
        }
        if status.is_none() {
            match child.try_wait() {
                Ok(exited) => status = exited,
                Err(e) => {
                    kill_group(&mut child);
                    return Err(e.into());
                }
            }
        }
        match rx.recv_timeout(SPAWN_POLL) {
            Ok((Pipe::Stdout, chunk)) => stdout.extend_from_slice(&chunk),
            Ok((Pipe::Stderr, chunk)) => stderr.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => pipes_open = false,
        }
    }
    // Nothing the command started outlives the call.
    kill_group(&mut child);

    Ok(SpawnOutput {
        status: status.and_then(|status| status.code()),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

fn pump(mut pipe: impl Read + Send + 'static, which: Pipe, tx: mpsc::Sender<(Pipe, Vec<u8>)>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((which, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// SIGKILL the child's whole process group, then reap the child.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Ok(pgid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

// ── zlib ───────────────────────────────────────────────────────

#[op2]
#[buffer]
pub fn op_zlib(state: &mut OpState, #[string] mode: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, AnyError> {
    use flate2::read::{GzDecoder, ZlibDecoder};
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    granted(state, Capability::Zlib)?;

    let out = match mode {
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        "gunzip" => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| anyhow!("Invalid gzip data: {e}"))?;
            out
        }
        "inflate" => {
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| anyhow!("Invalid deflate data: {e}"))?;
            out
        }
        other => return Err(anyhow!("Unsupported zlib mode: {other}")),
    };
    Ok(out)
}

// ── crypto ─────────────────────────────────────────────────────

#[op2]
#[string]
pub fn op_crypto_uuid(state: &mut OpState) -> Result<String, AnyError> {
    granted(state, Capability::Crypto)?;
    Ok(uuid::Uuid::new_v4().to_string())
}

#[op2(fast)]
pub fn op_crypto_fill(state: &mut OpState, #[buffer] buf: &mut [u8]) -> Result<(), AnyError> {
    use rand::RngCore;

    granted(state, Capability::Crypto)?;
    rand::rng().fill_bytes(buf);
    Ok(())
}

#[op2]
#[buffer]
pub fn op_crypto_digest(
    state: &mut OpState,
    #[string] algorithm: &str,
    #[buffer] data: &[u8],
) -> Result<Vec<u8>, AnyError> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    granted(state, Capability::Crypto)?;

    let digest = match algorithm.to_ascii_lowercase().replace('-', "").as_str() {
        "sha256" => Sha256::digest(data).to_vec(),
        "sha384" => Sha384::digest(data).to_vec(),
        "sha512" => Sha512::digest(data).to_vec(),
        _ => {
            return Err(anyhow!(
                "Unsupported digest algorithm: {algorithm}. Supported: sha256, sha384, sha512"
            ))
        }
    };
    Ok(digest)
}

deno_core::extension!(
    scriptgate_sandbox,
    ops = [
        op_sandbox_context,
        op_console_write,
        op_require,
        op_sandbox_sleep,
        op_sandbox_timer_cancel,
        op_bytes_encode,
        op_bytes_decode,
        op_fs_read,
        op_fs_write,
        op_fs_exists,
        op_fs_readdir,
        op_fs_mkdir,
        op_fs_remove,
        op_fs_stat,
        op_net_ip_version,
        op_net_send,
        op_process_spawn,
        op_zlib,
        op_crypto_uuid,
        op_crypto_fill,
        op_crypto_digest,
        op_fetch,
    ],
);
