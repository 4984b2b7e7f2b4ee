//! Sandbox Executor - runs composed programs under a deadline
//!
//! **Core Responsibility:**
//! Execute a composed source with stdin and capture raw combined output.
//!
//! **Boundary:**
//! - Knows HOW to execute (local process, warm container)
//! - Does NOT know scoring rules or evaluate correctness
//! - Non-zero exit is ordinary behavior, returned as data
//! - Only an unreachable substrate is an error
//!
//! Two strategies share the [`Sandbox`] trait: [`ProcessSandbox`] spawns a
//! fresh process in its own temporary directory, [`ContainerSandbox`] reuses
//! one warm container per language and rewrites its scratch mount each run.

use crate::config::LanguageExecution;
use crate::docker::{ensure_running, ContainerRuntime, ContainerSpec, SCRATCH_DIR};
use async_trait::async_trait;
use autograder_common::error::SandboxError;
use autograder_common::types::{ExecutionRequest, ExecutionResult};
use lazy_static::lazy_static;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Safety limits to prevent pathological inputs from reaching the substrate
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
/// Captured output beyond this is discarded
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Extra time the caller waits past the in-sandbox timeout before killing
pub const KILL_GRACE: Duration = Duration::from_millis(500);
const DRAIN_GRACE: Duration = Duration::from_millis(100);
const KILL_DEADLINE: Duration = Duration::from_secs(5);

/// Name of the stdin file in the scratch mount
pub const INPUT_FILE: &str = "input.txt";

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const FALLBACK_LANG: &str = "C.UTF-8";

lazy_static! {
    static ref SAFE_FILE_NAME: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").unwrap();
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `request.source` with `request.stdin` under `request.timeout_seconds`
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError>;
}

/// Reject requests the substrate should never see
pub fn validate_request(request: &ExecutionRequest) -> Result<(), SandboxError> {
    if request.source.len() > MAX_SOURCE_CODE_BYTES {
        return Err(SandboxError::TooLarge {
            what: "source code",
            limit: MAX_SOURCE_CODE_BYTES,
        });
    }
    if request.stdin.len() > MAX_TEST_INPUT_BYTES {
        return Err(SandboxError::TooLarge {
            what: "test input",
            limit: MAX_TEST_INPUT_BYTES,
        });
    }
    Ok(())
}

/// Declared file names come from assignment markup; anything that could
/// escape the scratch directory falls back to the language default.
pub fn sanitize_file_name<'a>(name: &'a str, fallback: &'a str) -> &'a str {
    let name = name.trim();
    if name.is_empty() || name == INPUT_FILE || name.contains("..") || !SAFE_FILE_NAME.is_match(name) {
        if !name.is_empty() {
            warn!(file_name = %name, fallback = %fallback, "Rejected declared file name");
        }
        return fallback;
    }
    name
}

/// Programs reading line by line expect a terminated last line
pub fn terminated_stdin(stdin: &str) -> String {
    let mut input = stdin.to_string();
    if !input.is_empty() && !input.ends_with('\n') {
        input.push('\n');
    }
    input
}

/// POSIX single-quote escaping for `sh -c` scripts
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub(crate) fn push_capped(captured: &mut Vec<u8>, chunk: &[u8]) {
    let room = MAX_OUTPUT_BYTES.saturating_sub(captured.len());
    captured.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

/// Fresh local process per run
pub struct ProcessSandbox {
    execution: LanguageExecution,
}

impl ProcessSandbox {
    pub fn new(execution: LanguageExecution) -> Self {
        Self { execution }
    }
}

/// Untrusted programs see only these variables; worker credentials stay out
fn sandbox_env(workdir: &Path) -> Vec<(&'static str, String)> {
    let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
    let lang = std::env::var("LANG").unwrap_or_else(|_| FALLBACK_LANG.to_string());
    vec![
        ("PATH", path),
        ("HOME", workdir.to_string_lossy().into_owned()),
        ("LANG", lang),
    ]
}

/// The child leads its own process group, so this reaches anything it forked
fn kill_process_group(pgid: u32) {
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        validate_request(request)?;

        let workdir = tempfile::tempdir()
            .map_err(|e| SandboxError::unavailable(format!("Failed to create work directory: {}", e)))?;
        let file_name = sanitize_file_name(&request.file_name, &self.execution.file_name);
        let source_path = workdir.path().join(file_name);
        tokio::fs::write(&source_path, &request.source)
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to write source: {}", e)))?;

        let argv = self.execution.command_line(&source_path.to_string_lossy());
        debug!(command = ?argv, "Spawning sandbox process");

        // stderr folded into stdout so output keeps its interleaving
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(r#"exec "$@" 2>&1"#)
            .arg("sh")
            .args(&argv)
            .current_dir(workdir.path())
            .env_clear()
            .envs(sandbox_env(workdir.path()))
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::unavailable(format!("Failed to spawn {}: {}", self.execution.command, e)))?;
        let pgid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let input = terminated_stdin(&request.stdin);
            tokio::spawn(async move {
                // Programs may exit without reading their input
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::unavailable("Child process has no stdout"))?;

        let deadline = Duration::from_secs(request.timeout_seconds);
        let mut captured = Vec::new();
        let mut buf = [0u8; 8192];

        let run = async {
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                push_capped(&mut captured, &buf[..n]);
            }
            child.wait().await
        };

        let finished = tokio::time::timeout(deadline, run).await;
        // Background jobs must not outlive the run
        if let Some(pgid) = pgid {
            kill_process_group(pgid);
        }
        match finished {
            Ok(Ok(status)) => Ok(ExecutionResult {
                exit_code: status.code().map(i64::from),
                output: String::from_utf8_lossy(&captured).into_owned(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(SandboxError::unavailable(format!("Failed to collect process output: {}", e))),
            Err(_) => {
                warn!(timeout_seconds = request.timeout_seconds, "Process exceeded deadline, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out process");
                }
                let drain = async {
                    while let Ok(n) = stdout.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        push_capped(&mut captured, &buf[..n]);
                    }
                };
                let _ = tokio::time::timeout(DRAIN_GRACE, drain).await;

                Ok(ExecutionResult {
                    exit_code: None,
                    output: String::from_utf8_lossy(&captured).into_owned(),
                    timed_out: true,
                })
            }
        }
    }
}

/// One warm container per language; runs are serialized on its scratch mount
pub struct ContainerSandbox<R: ContainerRuntime> {
    runtime: Arc<R>,
    container: ContainerSpec,
    execution: LanguageExecution,
    scratch: tokio::sync::Mutex<()>,
}

impl<R: ContainerRuntime> ContainerSandbox<R> {
    pub fn new(runtime: Arc<R>, container: ContainerSpec, execution: LanguageExecution) -> Self {
        Self {
            runtime,
            container,
            execution,
            scratch: tokio::sync::Mutex::new(()),
        }
    }

    pub fn container(&self) -> &ContainerSpec {
        &self.container
    }

    /// Shell script run inside the container; `timeout` is the first deadline
    fn run_script(&self, file_name: &str, timeout_seconds: u64) -> String {
        let source_path = format!("{}/{}", SCRATCH_DIR, file_name);
        let command = self
            .execution
            .command_line(&source_path)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "cd {dir} && timeout {secs} {command} < {dir}/{input} 2>&1",
            dir = SCRATCH_DIR,
            secs = timeout_seconds,
            command = command,
            input = INPUT_FILE,
        )
    }

    async fn kill_scratch_processes(&self) {
        let argv = vec![
            "pkill".to_string(),
            "-9".to_string(),
            "-f".to_string(),
            format!("{}/", SCRATCH_DIR),
        ];
        if let Err(e) = self.runtime.exec(&self.container.name, argv, KILL_DEADLINE).await {
            warn!(container = %self.container.name, error = %e, "Failed to kill timed-out run");
        }
    }
}

/// Overwrite the scratch directory in place; the directory itself is a bind
/// mount source and must survive.
async fn reset_scratch(dir: &Path, files: &[(&str, &str)]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    for (name, contents) in files {
        tokio::fs::write(dir.join(name), contents).await?;
    }
    Ok(())
}

#[async_trait]
impl<R: ContainerRuntime + 'static> Sandbox for ContainerSandbox<R> {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        validate_request(request)?;

        let _slot = self.scratch.lock().await;

        // Bind mount sources have to exist before the container is created
        tokio::fs::create_dir_all(&self.container.scratch_host_dir)
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to create scratch directory: {}", e)))?;
        ensure_running(self.runtime.as_ref(), &self.container).await?;

        let file_name = sanitize_file_name(&request.file_name, &self.execution.file_name);
        let stdin = terminated_stdin(&request.stdin);
        reset_scratch(
            &self.container.scratch_host_dir,
            &[(file_name, request.source.as_str()), (INPUT_FILE, stdin.as_str())],
        )
        .await
        .map_err(|e| SandboxError::unavailable(format!("Failed to write scratch files: {}", e)))?;

        let script = self.run_script(file_name, request.timeout_seconds);
        let deadline = Duration::from_secs(request.timeout_seconds) + KILL_GRACE;
        debug!(container = %self.container.name, script = %script, "Executing in warm container");

        let started = Instant::now();
        let mut result = self
            .runtime
            .exec(
                &self.container.name,
                vec!["sh".to_string(), "-c".to_string(), script],
                deadline,
            )
            .await?;

        if result.timed_out {
            warn!(
                container = %self.container.name,
                timeout_seconds = request.timeout_seconds,
                "In-sandbox timeout missed, killing run"
            );
            self.kill_scratch_processes().await;
        } else if matches!(result.exit_code, Some(124) | Some(137) | Some(143))
            && started.elapsed() >= Duration::from_secs(request.timeout_seconds)
        {
            // `timeout` fired inside the container
            result.timed_out = true;
        }

        Ok(result)
    }
}
