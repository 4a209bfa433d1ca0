//! Disposable worker processes: one call, validation or instantiation each.

use super::SessionError;
use crate::config::{LinkMap, WorkerConfig};
use crate::protocol::{ProtocolError, Response};
use crate::value::WireArg;
use log::{debug, warn};
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What a finished one-shot process left behind.
#[derive(Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Call `function` in a fresh instance of `module`.
///
/// Stdout carries the result words; a non-zero exit is a trap whose message
/// is on stderr.
pub fn invoke(
    worker: &WorkerConfig,
    module: &Path,
    links: &LinkMap,
    function: &str,
    args: &[WireArg],
    timeout: Duration,
) -> Result<Response, SessionError> {
    let out = run(worker.invoke_command(module, links, function, args), timeout)?;
    if !out.status.success() {
        let message = out.stderr.trim();
        return Ok(Response::Error(if message.is_empty() {
            out.status.to_string()
        } else {
            message.to_string()
        }));
    }
    let words = out
        .stdout
        .split_whitespace()
        .map(|w| {
            w.parse::<u64>()
                .map_err(|_| ProtocolError::BadWord(w.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Response::Ok(words))
}

/// Whether the worker accepts `module` as valid.
pub fn validate(worker: &WorkerConfig, module: &Path, timeout: Duration) -> Result<bool, SessionError> {
    Ok(run(worker.validate_command(module), timeout)?.status.success())
}

/// Whether `module` links and instantiates, start function included.
pub fn instantiate(
    worker: &WorkerConfig,
    module: &Path,
    links: &LinkMap,
    timeout: Duration,
) -> Result<bool, SessionError> {
    Ok(run(worker.instantiate_command(module, links), timeout)?.status.success())
}

/// Run `cmd` to completion, killing it once `timeout` has passed.
pub fn run(mut cmd: Command, timeout: Duration) -> Result<Output, SessionError> {
    debug!("one-shot: {cmd:?}");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SessionError::Spawn {
            path: Path::new(cmd.get_program()).to_path_buf(),
            source,
        })?;

    // drain both pipes so a chatty child cannot block on a full buffer
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if started.elapsed() >= timeout => {
                warn!("one-shot worker timed out after {timeout:?}, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::Timeout(timeout));
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let collect = |h: Option<thread::JoinHandle<String>>| h.and_then(|h| h.join().ok()).unwrap_or_default();
    Ok(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}
