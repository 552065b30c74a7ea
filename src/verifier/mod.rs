//! The external verifier interface (§6.3): handing the instrumented C text
//! to one or more model-checker backends and racing them with a timeout,
//! keeping only the first conclusive answer.
//!
//! Grounded on `original_source/shadowdp/checker.py`'s `check()`, which
//! spawns MathSAT/Z3/SMTInterpol as subprocesses, fans their stdout into a
//! `Queue` from one `Thread` per backend, and takes whichever reports
//! `"Verification result: TRUE"` first within a 30s budget, killing the
//! rest. This port keeps the same shape (one OS thread + `mpsc::Sender`
//! per backend, a single blocking `recv_timeout` on the result channel)
//! but goes through a `VerifierBackend` trait instead of hardcoding three
//! process names, so a test can substitute an in-process fake.

use crate::error::VerifierError;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Outcome of checking one candidate program against the external
/// verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    CounterexampleFound(String),
}

/// One external model-checker the race can include.
pub trait VerifierBackend: Send + Sync {
    /// Human-readable name, used in diagnostics and in excluding a backend
    /// that isn't installed.
    fn name(&self) -> &str;

    /// Spawns the backend against `source_path`, returning the running
    /// child process so the race can poll/kill it.
    fn spawn(&self, source_path: &str) -> std::io::Result<Child>;

    /// Interprets a backend's combined stdout/stderr into an outcome.
    fn interpret(&self, output: &str) -> Option<VerificationOutcome>;
}

/// Spawns `program`, a real OS command, and recognizes the same
/// `"Verification result: TRUE"` / `"Verification result: FALSE"` markers
/// the original tooling's backends print.
pub struct ProcessBackend {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl VerifierBackend for ProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn spawn(&self, source_path: &str) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg(source_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn interpret(&self, output: &str) -> Option<VerificationOutcome> {
        if output.contains("Verification result: TRUE") {
            Some(VerificationOutcome::Verified)
        } else if output.contains("Verification result: FALSE") {
            Some(VerificationOutcome::CounterexampleFound(output.to_string()))
        } else {
            None
        }
    }
}

/// Races every backend in `backends` against `source_path`, returning the
/// first conclusive answer within `timeout`. Losing processes are killed;
/// a backend whose process never resolves within the timeout is treated
/// as unavailable rather than failed, matching the original's
/// best-effort multi-solver racing.
pub fn race_backends(
    backends: &[Box<dyn VerifierBackend>],
    source_path: &str,
    timeout: Duration,
) -> Result<VerificationOutcome, VerifierError> {
    if backends.is_empty() {
        return Err(VerifierError::Unavailable);
    }

    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();

    for backend in backends {
        let name = backend.name().to_string();
        let child = match backend.spawn(source_path) {
            Ok(child) => child,
            Err(_) => continue,
        };
        let tx = tx.clone();
        let outcome_interpreter = BackendOutputReader {
            name: name.clone(),
        };
        handles.push(thread::spawn(move || {
            let result = wait_for_output(child, timeout);
            let _ = tx.send((outcome_interpreter.name, result));
        }));
    }
    drop(tx);

    match rx.recv_timeout(timeout) {
        Ok((backend_name, Ok(output))) => {
            for backend in backends {
                if backend.name() == backend_name {
                    if let Some(outcome) = backend.interpret(&output) {
                        return Ok(outcome);
                    }
                    return Err(VerifierError::BackendFailed {
                        backend: backend_name,
                        diagnostics: output,
                    });
                }
            }
            Err(VerifierError::Unavailable)
        }
        Ok((backend_name, Err(_))) => Err(VerifierError::Timeout {
            backend: backend_name,
            seconds: timeout.as_secs(),
        }),
        Err(_) => Err(VerifierError::Unavailable),
    }
}

struct BackendOutputReader {
    name: String,
}

fn wait_for_output(mut child: Child, timeout: Duration) -> Result<String, ()> {
    use std::io::Read;

    let start = std::time::Instant::now();
    loop {
        if let Ok(Some(_)) = child.try_wait() {
            let mut output = String::new();
            if let Some(mut stdout) = child.stdout.take() {
                let _ = stdout.read_to_string(&mut output);
            }
            return Ok(output);
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(());
        }
        thread::sleep(Duration::from_millis(50));
    }
}
