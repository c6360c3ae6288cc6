//! Bounded subprocess execution of the external processing engine

use crate::types::{LogContext, SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine invocation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParams {
    /// Engine executable (SNAP graph processing tool)
    pub executable: PathBuf,
    /// Arguments placed before the graph file
    pub extra_args: Vec<String>,
    /// Wall-clock limit per attempt; `None` waits indefinitely
    pub timeout_secs: Option<u64>,
    /// Attempts per task, including the first
    pub max_attempts: u32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/opt/snap/bin/gpt"),
            extra_args: Vec::new(),
            timeout_secs: Some(4 * 60 * 60),
            max_attempts: 1,
        }
    }
}

impl EngineParams {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Outcome of one engine run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// `None` when the process was killed
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
    pub aborted: bool,
    pub attempts: u32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.aborted
    }

    /// Short failure description for logs and task outcomes
    pub fn failure_reason(&self) -> Option<String> {
        if self.success() {
            None
        } else if self.aborted {
            Some("aborted".to_string())
        } else if self.timed_out {
            Some(format!("timed out after {:.0?}", self.elapsed))
        } else {
            match self.exit_code {
                Some(code) => Some(format!("exit code {}", code)),
                None => Some("terminated by signal".to_string()),
            }
        }
    }
}

/// Runs a serialized processing graph
pub trait ProcessingEngine: Send + Sync {
    fn execute(&self, graph_file: &Path) -> SarResult<ExecutionResult>;
}

/// Subprocess engine with timeout, retry and a shared abort flag
pub struct GptEngine {
    params: EngineParams,
    abort: Arc<AtomicBool>,
    ctx: LogContext,
}

impl GptEngine {
    pub fn new(params: EngineParams, ctx: LogContext) -> Self {
        Self::with_abort_flag(params, Arc::new(AtomicBool::new(false)), ctx)
    }

    pub fn with_abort_flag(params: EngineParams, abort: Arc<AtomicBool>, ctx: LogContext) -> Self {
        Self { params, abort, ctx }
    }

    /// Flag that stops the running engine when set
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    fn run_once(&self, graph_file: &Path) -> SarResult<ExecutionResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SarError::ProcessingEngine(format!("Cannot start runtime: {}", e)))?;
        runtime.block_on(self.run_child(graph_file))
    }

    async fn run_child(&self, graph_file: &Path) -> SarResult<ExecutionResult> {
        let start = Instant::now();
        let mut child = tokio::process::Command::new(&self.params.executable)
            .args(&self.params.extra_args)
            .arg(graph_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SarError::ProcessingEngine(format!(
                    "Failed to spawn {}: {}",
                    self.params.executable.display(),
                    e
                ))
            })?;

        let stdout = tokio::spawn(read_pipe(child.stdout.take(), "stdout", self.ctx.clone()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take(), "stderr", self.ctx.clone()));

        let deadline = self.params.timeout().map(|t| start + t);
        let mut result = ExecutionResult::default();

        loop {
            match tokio::time::timeout(POLL_INTERVAL, child.wait()).await {
                Ok(status) => {
                    let status = status.map_err(|e| {
                        SarError::ProcessingEngine(format!("Waiting for engine failed: {}", e))
                    })?;
                    result.exit_code = status.code();
                    break;
                }
                Err(_) => {
                    if self.abort.load(Ordering::SeqCst) {
                        log::warn!("{} Abort requested, killing engine", self.ctx);
                        result.aborted = true;
                    } else if deadline.map_or(false, |d| Instant::now() >= d) {
                        log::warn!(
                            "{} Engine exceeded {:?} timeout, killing it",
                            self.ctx,
                            self.params.timeout()
                        );
                        result.timed_out = true;
                    } else {
                        continue;
                    }
                    if let Err(e) = child.kill().await {
                        log::warn!("{} Failed to kill engine: {}", self.ctx, e);
                    }
                    break;
                }
            }
        }

        result.stdout = drain(stdout, &self.ctx).await;
        result.stderr = drain(stderr, &self.ctx).await;
        result.elapsed = start.elapsed();
        Ok(result)
    }
}

impl ProcessingEngine for GptEngine {
    fn execute(&self, graph_file: &Path) -> SarResult<ExecutionResult> {
        let attempts = self.params.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            log::info!(
                "{} Running {} {} (attempt {}/{})",
                self.ctx,
                self.params.executable.display(),
                graph_file.display(),
                attempt,
                attempts
            );

            let mut result = self.run_once(graph_file)?;
            result.attempts = attempt;

            for line in result.stderr.lines().filter(|l| !l.trim().is_empty()) {
                if result.success() {
                    log::debug!("{} engine: {}", self.ctx, line);
                } else {
                    log::warn!("{} engine: {}", self.ctx, line);
                }
            }

            match result.failure_reason() {
                None => {
                    log::info!("{} Engine finished in {:.1?}", self.ctx, result.elapsed);
                    return Ok(result);
                }
                Some(reason) => {
                    log::warn!("{} Engine attempt {} failed: {}", self.ctx, attempt, reason);
                    if result.aborted || attempt >= attempts {
                        return Ok(result);
                    }
                }
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>, name: &'static str, ctx: LogContext) -> String {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        // keep whatever was read before the error
        if let Err(e) = pipe.read_to_end(&mut buffer).await {
            log::warn!(
                "{} Engine {} read failed after {} bytes: {}",
                ctx,
                name,
                buffer.len(),
                e
            );
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Collect a reader task; a grandchild may keep the pipe open after a kill
async fn drain(task: tokio::task::JoinHandle<String>, ctx: &LogContext) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            log::warn!("{} Engine output reader failed: {}", ctx, e);
            String::new()
        }
        Err(_) => {
            log::debug!("{} Engine output still open after {:?}, dropped", ctx, OUTPUT_DRAIN_TIMEOUT);
            String::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("engine.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        path
    }

    fn engine(script: &Path, timeout_secs: Option<u64>, max_attempts: u32) -> GptEngine {
        GptEngine::new(
            EngineParams {
                executable: PathBuf::from("/bin/sh"),
                extra_args: vec![script.to_string_lossy().into_owned()],
                timeout_secs,
                max_attempts,
            },
            LogContext::new("engine-test"),
        )
    }

    /// Reader failing after a partial read
    struct BrokenPipe {
        sent: bool,
    }

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.sent {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                )));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_pipe_error_keeps_partial_output() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let text = runtime.block_on(read_pipe(
            Some(BrokenPipe { sent: false }),
            "stdout",
            LogContext::new("engine-test"),
        ));
        assert_eq!(text, "partial");
        let empty = runtime.block_on(read_pipe(None::<BrokenPipe>, "stderr", LogContext::default()));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_success_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let sh = script(dir.path(), "echo \"graph=$1\"\necho warn >&2\nexit 0");
        let result = engine(&sh, Some(30), 1).execute(Path::new("/tmp/g.xml")).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "graph=/tmp/g.xml");
        assert_eq!(result.stderr.trim(), "warn");
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_nonzero_exit_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let sh = script(
            dir.path(),
            &format!("echo x >> {}\nexit 3", counter.display()),
        );
        let result = engine(&sh, None, 2).execute(Path::new("g.xml")).unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.attempts, 2);
        assert_eq!(result.failure_reason().unwrap(), "exit code 3");
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let sh = script(dir.path(), "exec sleep 30");
        let start = Instant::now();
        let result = engine(&sh, Some(1), 1).execute(Path::new("g.xml")).unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[test]
    fn test_abort_flag() {
        let dir = tempfile::tempdir().unwrap();
        let sh = script(dir.path(), "exec sleep 30");
        let engine = engine(&sh, None, 3);
        let flag = engine.abort_handle();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::SeqCst);
        });
        let result = engine.execute(Path::new("g.xml")).unwrap();
        setter.join().unwrap();
        assert!(result.aborted);
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_spawn_failure() {
        let engine = GptEngine::new(
            EngineParams {
                executable: PathBuf::from("/nonexistent/gpt"),
                ..EngineParams::default()
            },
            LogContext::default(),
        );
        assert!(matches!(
            engine.execute(Path::new("g.xml")),
            Err(SarError::ProcessingEngine(_))
        ));
    }
}
