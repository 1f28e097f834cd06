use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default wall-clock budget for an external program.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of an external program invocation. The three cases are kept
/// apart because callers map them to different error codes.
#[derive(Debug)]
pub enum RunError {
    /// The process could not be started at all.
    Os(io::Error),
    /// The process exceeded its timeout and has been killed and reaped.
    Timeout { command: String, timeout: Duration },
    /// The process finished with a non-zero exit status.
    ReturnValue { command: String, code: Option<i32> },
}

/// Run an external program synchronously, returning its stdout.
///
/// On timeout the child is killed and reaped before the error is returned,
/// so no zombie survives the call. Stdout is drained on a helper thread to
/// keep the kill path from deadlocking against a full pipe.
pub fn run<S: AsRef<str>>(command: &[S], timeout: Duration) -> Result<String, RunError> {
    let rendered = command
        .iter()
        .map(|part| part.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let (program, args) = command.split_first().ok_or_else(|| {
        RunError::Os(io::Error::new(io::ErrorKind::InvalidInput, "empty command"))
    })?;

    let mut child = Command::new(program.as_ref())
        .args(args.iter().map(|arg| arg.as_ref()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(RunError::Os)?;

    let stdout = child.stdout.take().ok_or_else(|| {
        RunError::Os(io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))
    })?;
    let reader = thread::spawn(move || {
        let mut stdout = stdout;
        let mut buffer = String::new();
        let _ = stdout.read_to_string(&mut buffer);
        buffer
    });

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = reader.join().unwrap_or_default();
                if status.success() {
                    return Ok(output);
                }
                log::debug!("command {rendered:?} exited with {status}");
                return Err(RunError::ReturnValue {
                    command: rendered,
                    code: status.code(),
                });
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = reader.join();
                    return Err(RunError::Timeout {
                        command: rendered,
                        timeout,
                    });
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return Err(RunError::Os(error));
            }
        }
    }
}
