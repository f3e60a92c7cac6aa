//! Execution backends. A backend receives an operation spec, runs it
//! somewhere and returns the directory holding `results.csv`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use cs_types::{CancelToken, EvaluationError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::pipeline::OperationSpec;

/// File name of the operation spec inside the output directory.
pub const OPERATION_FILE: &str = "operation.yaml";
/// Combined stdout/stderr of the backend process.
pub const BACKEND_LOG: &str = "backend.log";

/// Where and on whose behalf an operation runs.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Parent directory for the run's output directory.
    pub base_result_dir: PathBuf,
    pub trial_id: u64,
    pub cancel: CancelToken,
}

/// Runs operation specs. Implementations must return promptly once the
/// request's cancel token is set.
pub trait Backend: Send + Sync {
    fn execute(&self, spec: &OperationSpec, request: &BackendRequest) -> Result<PathBuf, EvaluationError>;
}

/// Runs an external program once per operation.
///
/// Arguments may contain `{spec}` and `{output}`, replaced with the path of the
/// written operation file and the output directory. The program runs inside
/// the output directory, in its own process group so that stopping it also
/// stops everything it spawned.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec!["{spec}".to_string()],
            poll_interval: Duration::from_millis(50),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Kill runs that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `<timestamp>_<trial>`; the trial id keeps concurrent runs apart even
    /// within the same millisecond.
    fn output_dir(request: &BackendRequest) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H_%M_%S_%3f");
        request
            .base_result_dir
            .join(format!("{}_{}", stamp, request.trial_id))
    }

    fn command(&self, spec_path: &Path, output_dir: &Path) -> Command {
        let spec_arg = spec_path.display().to_string();
        let output_arg = output_dir.display().to_string();

        let mut cmd = Command::new(&self.program);
        cmd.args(
            self.args
                .iter()
                .map(|arg| arg.replace("{spec}", &spec_arg).replace("{output}", &output_arg)),
        )
        .current_dir(output_dir)
        .stdin(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    fn supervise(&self, child: &mut Child, request: &BackendRequest) -> Result<(), EvaluationError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(EvaluationError::BackendFailed {
                        message: format!("{} exited with {}", self.program, status),
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    terminate(child);
                    return Err(EvaluationError::BackendFailed {
                        message: format!("waiting for {} failed: {}", self.program, e),
                    });
                }
            }

            if request.cancel.is_cancelled() {
                debug!(trial = request.trial_id, pid = child.id(), "Cancelling backend process");
                terminate(child);
                return Err(EvaluationError::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    warn!(trial = request.trial_id, pid = child.id(), "Backend process timed out");
                    terminate(child);
                    return Err(EvaluationError::BackendFailed {
                        message: format!("{} timed out after {:?}", self.program, timeout),
                    });
                }
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl Backend for CommandBackend {
    fn execute(&self, spec: &OperationSpec, request: &BackendRequest) -> Result<PathBuf, EvaluationError> {
        let setup = |what: &str, e: std::io::Error| EvaluationError::Setup {
            message: format!("{}: {}", what, e),
        };

        let output_dir = Self::output_dir(request);
        fs::create_dir_all(&output_dir).map_err(|e| setup("creating output directory", e))?;

        let spec_path = output_dir.join(OPERATION_FILE);
        cs_data::write_atomic(&spec_path, spec.base_file.as_bytes())
            .map_err(|e| setup("writing operation file", e))?;

        let log = File::create(output_dir.join(BACKEND_LOG)).map_err(|e| setup("creating backend log", e))?;
        let log_err = log.try_clone().map_err(|e| setup("creating backend log", e))?;

        let mut child = self
            .command(&spec_path, &output_dir)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| setup(&format!("starting {}", self.program), e))?;

        debug!(
            trial = request.trial_id,
            pid = child.id(),
            output = %output_dir.display(),
            "Backend process started"
        );
        self.supervise(&mut child, request)?;
        Ok(output_dir)
    }
}

/// Kill the child's process group, then the child itself, and reap it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let killed = Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match killed {
            Ok(status) if !status.success() => {
                debug!("kill exited with {} for process group {}", status, group)
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", group, e),
        }
    }
    if let Err(e) = child.kill() {
        warn!("Failed to kill backend process {}: {}", child.id(), e);
    }
    match child.wait() {
        Ok(status) => debug!(pid = child.id(), %status, "Backend process reaped"),
        Err(e) => warn!("Failed to reap backend process {}: {}", child.id(), e),
    }
}

/// Enforces a minimum interval between successive backend invocations.
#[derive(Debug)]
pub struct InvocationThrottle {
    spacing: Duration,
    last: Mutex<Option<Instant>>,
}

impl InvocationThrottle {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Block until at least `spacing` has passed since the previous call
    /// returned. Waiting callers are served one at a time.
    pub fn wait(&self) {
        let mut last = self.last.lock();
        if let Some(previous) = *last {
            let ready_at = previous + self.spacing;
            let now = Instant::now();
            if ready_at > now {
                thread::sleep(ready_at - now);
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn spec() -> OperationSpec {
        OperationSpec {
            document: json!({"type": "node_chain"}),
            base_file: "type: node_chain\n".to_string(),
        }
    }

    fn request(dir: &Path, trial_id: u64) -> BackendRequest {
        BackendRequest {
            base_result_dir: dir.to_path_buf(),
            trial_id,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_throttle_spaces_invocations() {
        let throttle = Arc::new(InvocationThrottle::new(Duration::from_millis(40)));
        let started = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let throttle = throttle.clone();
                thread::spawn(move || throttle.wait())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // First call passes immediately, the other two wait one interval each
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_backend_success_writes_spec() {
        let dir = tempdir().unwrap();
        let backend = CommandBackend::new("sh").with_args(vec![
            "-c".into(),
            "cp {spec} {output}/copy.yaml && echo metric > results.csv".into(),
        ]);

        let output = backend.execute(&spec(), &request(dir.path(), 7)).unwrap();
        assert!(output.starts_with(dir.path()));
        assert!(output.file_name().unwrap().to_string_lossy().ends_with("_7"));
        assert_eq!(fs::read_to_string(output.join("copy.yaml")).unwrap(), "type: node_chain\n");
        assert!(output.join("results.csv").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_backend_failure_and_missing_program() {
        let dir = tempdir().unwrap();
        let failing = CommandBackend::new("sh").with_args(vec!["-c".into(), "exit 3".into()]);
        assert!(matches!(
            failing.execute(&spec(), &request(dir.path(), 1)),
            Err(EvaluationError::BackendFailed { .. })
        ));

        let missing = CommandBackend::new("/nonexistent/backend-program");
        assert!(matches!(
            missing.execute(&spec(), &request(dir.path(), 2)),
            Err(EvaluationError::Setup { .. })
        ));
    }

    #[cfg(unix)]
    #[cfg(unix)]
    #[test]
    fn test_terminate_reaps_process_group() {
        use std::os::unix::process::CommandExt;

        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let started = Instant::now();
        terminate(&mut child);

        assert!(child.try_wait().unwrap().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_command_backend_timeout_and_cancel() {
        let dir = tempdir().unwrap();
        let slow = CommandBackend::new("sh")
            .with_args(vec!["-c".into(), "sleep 30".into()])
            .with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        assert!(matches!(
            slow.execute(&spec(), &request(dir.path(), 1)),
            Err(EvaluationError::BackendFailed { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(10));

        let cancelled = request(dir.path(), 2);
        cancelled.cancel.cancel();
        let slow = slow.with_timeout(None);
        assert_eq!(
            slow.execute(&spec(), &cancelled).unwrap_err(),
            EvaluationError::Cancelled
        );
    }
}
