//! Command runner capability
//!
//! The engine never spawns processes directly. Every `iptables`, `ip6tables`
//! and `ipset` invocation goes through a [`CommandRunner`], so tests can swap
//! in a recording implementation and never touch the real kernel.
//!
//! # Example
//!
//! ```no_run
//! use vpnfw::command::{CommandRunner, SystemRunner};
//! use std::time::Duration;
//!
//! let runner = SystemRunner;
//! let argv = vec!["iptables".to_string(), "-S".to_string()];
//! let rules = runner.run_timeout(&argv, Duration::from_secs(15))?;
//! println!("{rules}");
//! # Ok::<(), vpnfw::Error>(())
//! ```

use crate::core::error::{Error, Result};
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval between `try_wait` polls of a bounded command
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs an external program and captures its standard output.
///
/// `argv[0]` is the program. A non-zero exit is an error carrying the
/// captured stderr.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String]) -> Result<String>;

    /// Like [`run`](Self::run) but kills the child once `timeout` elapses.
    fn run_timeout(&self, argv: &[String], timeout: Duration) -> Result<String>;
}

/// [`CommandRunner`] backed by [`std::process::Command`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn spawn(argv: &[String]) -> Result<(String, std::process::Child)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty command line".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Command {
                program: program.clone(),
                message: format!("failed to start: {e}"),
                stderr: Some(e.to_string()),
                exit_code: None,
            })?;

        Ok((program.clone(), child))
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String]) -> Result<String> {
        let (program, child) = Self::spawn(argv)?;
        let output = child.wait_with_output()?;
        check_output(&program, &output)
    }

    fn run_timeout(&self, argv: &[String], timeout: Duration) -> Result<String> {
        let (program, mut child) = Self::spawn(argv)?;
        let deadline = Instant::now() + timeout;
        // A full pipe would stall the child until the deadline
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                // Ignore kill errors: the child may have exited in between
                let _ = child.kill();
                let _ = child.wait();
                tracing::error!(program = %program, "Command timed out, killed");
                return Err(Error::Timeout {
                    program,
                    secs: timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let output = Output {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };
        check_output(&program, &output)
    }
}

/// Reads a child pipe to the end on its own thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            // A read error only truncates diagnostics
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn check_output(program: &str, output: &Output) -> Result<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = match output.status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    };
    tracing::debug!(program, %message, stderr = %stderr, "Command failed");

    Err(Error::Command {
        program: program.to_string(),
        message,
        stderr: (!stderr.is_empty()).then_some(stderr),
        exit_code: output.status.code(),
    })
}
