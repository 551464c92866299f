//! Worker processes and the links the scheduler drives them through.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::protocol::{read_message, write_message, ResultMessage, TaskMessage};
use crate::WorkerId;

const JOIN_POLL: Duration = Duration::from_millis(25);

/// The scheduler's handle on one worker: its private task channel plus
/// lifecycle control.
pub trait WorkerLink: Send {
    fn send(&mut self, task: &TaskMessage) -> Result<()>;

    /// Forced stop. Safe to call on a worker that already exited.
    fn terminate(&mut self);

    /// Waits up to `timeout` for the worker to exit; `true` once it has.
    fn join(&mut self, timeout: Duration) -> bool;
}

pub trait WorkerLauncher {
    /// Starts worker `worker_id` on `model_path`. Everything the worker
    /// reports ends up on `results`.
    fn launch(
        &self,
        worker_id: WorkerId,
        model_path: &Path,
        results: Sender<ResultMessage>,
    ) -> Result<Box<dyn WorkerLink>>;
}

/// Starts workers as `<program> <args…> --worker-id N --model PATH`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-executes the running binary in worker mode.
    pub fn current_exe(config_path: &Path) -> Result<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Ok(Self::new(
            program,
            vec!["worker".into(), "--config".into(), config_path.as_os_str().to_owned()],
        ))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        worker_id: WorkerId,
        model_path: &Path,
        results: Sender<ResultMessage>,
    ) -> Result<Box<dyn WorkerLink>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .arg("--model")
            .arg(model_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn worker {} ({})", worker_id, self.program.display()))?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("worker {} pipes unavailable", worker_id));
            }
        };
        let worker = ProcessWorker {
            worker_id,
            child,
            stdin: Some(stdin),
        };
        thread::Builder::new()
            .name(format!("worker-{}-results", worker_id))
            .spawn(move || forward_results(worker_id, stdout, results))
            .context("spawn result reader thread")?;
        debug!(worker = worker_id, pid = worker.child.id(), "worker process started");
        Ok(Box::new(worker))
    }
}

/// Pumps a worker's stdout into the shared result channel. A stream that
/// ends without a clean shutdown surfaces as an `Error` for that worker,
/// which the scheduler ignores once it is already shutting down.
fn forward_results(worker_id: WorkerId, stdout: ChildStdout, results: Sender<ResultMessage>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_message::<_, ResultMessage>(&mut reader) {
            Ok(Some(message)) => {
                if message.worker_id() != worker_id {
                    warn!(
                        worker = worker_id,
                        claimed = message.worker_id(),
                        "result carries a foreign worker id"
                    );
                }
                if results.send(message).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = results.send(ResultMessage::Error {
                    worker_id,
                    error: "worker exited unexpectedly".to_string(),
                });
                return;
            }
            Err(err) if err.downcast_ref::<std::io::Error>().is_some() => {
                let _ = results.send(ResultMessage::Error {
                    worker_id,
                    error: format!("result stream failed: {:#}", err),
                });
                return;
            }
            Err(err) => {
                warn!(worker = worker_id, error = %err, "skipping undecodable result line");
            }
        }
    }
}

pub struct ProcessWorker {
    worker_id: WorkerId,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl WorkerLink for ProcessWorker {
    fn send(&mut self, task: &TaskMessage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("task channel of worker {} is closed", self.worker_id))?;
        write_message(stdin, task)
    }

    fn terminate(&mut self) {
        self.stdin.take();
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = self.child.kill() {
                    warn!(worker = self.worker_id, error = %e, "failed to kill worker");
                }
            }
        }
    }

    fn join(&mut self, timeout: Duration) -> bool {
        // a closed stdin reads as "channel closed" in the worker
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush();
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(worker = self.worker_id, %status, "worker process exited");
                    return true;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(JOIN_POLL),
                Ok(None) => return false,
                Err(e) => {
                    warn!(worker = self.worker_id, error = %e, "cannot query worker status");
                    return false;
                }
            }
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Exited,
    Killed,
    /// Still alive after the forced stop.
    Abandoned,
}

/// Join with `join_timeout`; if the worker is still alive, terminate it and
/// join again with `kill_grace`.
pub fn join_or_kill(
    worker_id: WorkerId,
    link: &mut dyn WorkerLink,
    join_timeout: Duration,
    kill_grace: Duration,
) -> StopOutcome {
    if link.join(join_timeout) {
        return StopOutcome::Exited;
    }
    warn!(worker = worker_id, "worker did not exit in time, terminating");
    link.terminate();
    if link.join(kill_grace) {
        StopOutcome::Killed
    } else {
        warn!(worker = worker_id, "worker still alive after terminate");
        StopOutcome::Abandoned
    }
}

/// Launches one worker per model copy. If any launch fails, the workers
/// already started are stopped before the error is returned.
pub fn spawn_pool(
    launcher: &dyn WorkerLauncher,
    model_paths: &BTreeMap<WorkerId, PathBuf>,
    results: &Sender<ResultMessage>,
    kill_grace: Duration,
) -> Result<Vec<(WorkerId, Box<dyn WorkerLink>)>> {
    let mut started: Vec<(WorkerId, Box<dyn WorkerLink>)> = Vec::with_capacity(model_paths.len());
    for (&worker_id, model_path) in model_paths {
        match launcher.launch(worker_id, model_path, results.clone()) {
            Ok(link) => {
                info!(worker = worker_id, model = %model_path.display(), "started worker");
                started.push((worker_id, link));
            }
            Err(err) => {
                for (id, link) in started.iter_mut() {
                    link.terminate();
                    join_or_kill(*id, link.as_mut(), kill_grace, kill_grace);
                }
                return Err(err.context(format!("failed to start worker {}", worker_id)));
            }
        }
    }
    Ok(started)
}
