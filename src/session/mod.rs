//! Worker process lifecycle.
//!
//! A [`WorkerSession`] owns at most one long-lived worker process started in
//! batch mode for one module and a fixed set of links. Requests are written
//! to the worker's stdin one line at a time and each is answered by one line
//! on stdout, read through a channel so that every wait is bounded.
//!
//! While no state-mutating call has been made the session prefers disposable
//! one-shot processes (see [`oneshot`]); [`WorkerSession::mark_stateful`]
//! turns that off for good.

pub mod oneshot;

use crate::config::{LinkMap, WorkerConfig};
use crate::protocol::{ProtocolError, Request, Response, ThreadLine, MAIN_MODULE};
use crate::value::WireArg;
use log::{debug, trace, warn};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Index of a session inside a run.
pub type SessionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Running,
    /// The process exited or was killed; the next call starts a new one.
    Dead,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("session is closed")]
    NotRunning,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to start worker {path}: {source}")]
    Spawn { path: PathBuf, source: io::Error },
    #[error("worker i/o: {0}")]
    Io(#[from] io::Error),
    #[error("worker exited mid-request")]
    Died,
}

struct LiveWorker {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
}

pub struct WorkerSession {
    worker: WorkerConfig,
    module_path: PathBuf,
    links: LinkMap,
    state: SessionState,
    needs_persistent_state: bool,
    /// Resident currently acting as main module; `None` is the session's own.
    main: Option<String>,
    live: Option<LiveWorker>,
}

impl WorkerSession {
    pub fn new(worker: WorkerConfig, module_path: impl Into<PathBuf>, links: LinkMap) -> WorkerSession {
        WorkerSession {
            worker,
            module_path: module_path.into(),
            links,
            state: SessionState::Unstarted,
            needs_persistent_state: false,
            main: None,
            live: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session can still serve calls (it may need a start).
    pub fn is_alive(&self) -> bool {
        matches!(self.state, SessionState::Unstarted | SessionState::Running)
    }

    pub fn main(&self) -> Option<&str> {
        self.main.as_deref()
    }

    pub fn needs_persistent_state(&self) -> bool {
        self.needs_persistent_state
    }

    /// From now on every call goes through the persistent process.
    pub fn mark_stateful(&mut self) {
        if !self.needs_persistent_state {
            debug!("{}: session is now stateful", self.module_path.display());
            self.needs_persistent_state = true;
        }
    }

    /// Call `function` on the main module.
    ///
    /// Until the session is stateful, and when no vector argument is present,
    /// the call runs in a one-shot process unless a persistent process is
    /// already up. A persistent process that dies during such a call is
    /// replaced by a one-shot retry.
    pub fn invoke(&mut self, function: &str, args: &[WireArg], timeout: Duration) -> Result<Response, SessionError> {
        let oneshot_ok = !self.needs_persistent_state
            && !args.iter().any(WireArg::is_vector)
            && !function.contains('\0');
        if oneshot_ok && self.state != SessionState::Running {
            return oneshot::invoke(&self.worker, &self.module_path, &self.links, function, args, timeout);
        }
        let request = Request::Invoke {
            name: function.to_string(),
            args: args.to_vec(),
        };
        match self.request(&request, timeout) {
            Err(SessionError::Died) if oneshot_ok => {
                debug!("{}: worker died, retrying {function:?} one-shot", self.module_path.display());
                oneshot::invoke(&self.worker, &self.module_path, &self.links, function, args, timeout)
            }
            other => other,
        }
    }

    /// Call `function` on a module loaded into this session's store.
    pub fn invoke_on(
        &mut self,
        module: &str,
        function: &str,
        args: &[WireArg],
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        let request = Request::InvokeOn {
            module: module.to_string(),
            name: function.to_string(),
            args: args.to_vec(),
        };
        self.request(&request, timeout)
    }

    pub fn get(&mut self, global: &str, timeout: Duration) -> Result<Response, SessionError> {
        self.request(&Request::Get { name: global.to_string() }, timeout)
    }

    pub fn get_on(&mut self, module: &str, global: &str, timeout: Duration) -> Result<Response, SessionError> {
        let request = Request::GetOn {
            module: module.to_string(),
            name: global.to_string(),
        };
        self.request(&request, timeout)
    }

    /// Instantiate another module into this session's store under `name`.
    pub fn load_module(&mut self, name: &str, path: &Path, timeout: Duration) -> Result<Response, SessionError> {
        self.mark_stateful();
        let request = Request::Load {
            name: name.to_string(),
            path: path.to_path_buf(),
        };
        self.request(&request, timeout)
    }

    /// Make the current main module's exports importable as `name`.
    pub fn register_module(&mut self, name: &str, timeout: Duration) -> Result<Response, SessionError> {
        self.mark_stateful();
        self.request(&Request::Register { name: name.to_string() }, timeout)
    }

    /// Direct unqualified calls to the resident `name`, or back to the
    /// session's own module for `None`.
    pub fn set_main(&mut self, name: Option<&str>, timeout: Duration) -> Result<Response, SessionError> {
        self.mark_stateful();
        let request = Request::SetMain {
            name: name.unwrap_or(MAIN_MODULE).to_string(),
        };
        let response = self.request(&request, timeout)?;
        if response.is_ok() {
            self.main = name.map(str::to_string);
        }
        Ok(response)
    }

    /// Open a thread buffer on the worker. Not acknowledged.
    pub fn thread_begin(&mut self, name: &str, module: Option<&str>) -> Result<(), SessionError> {
        self.mark_stateful();
        self.send(&Request::ThreadBegin {
            name: name.to_string(),
            module: module.map(str::to_string),
        })
    }

    /// Append a call to the open thread buffer. Not acknowledged.
    pub fn thread_invoke(&mut self, function: &str, args: &[WireArg]) -> Result<(), SessionError> {
        self.send(&Request::ThreadInvoke {
            name: function.to_string(),
            args: args.to_vec(),
        })
    }

    /// Close the buffer and start the thread; the worker answers `ok`.
    pub fn thread_end(&mut self, timeout: Duration) -> Result<Response, SessionError> {
        self.request(&Request::ThreadEnd, timeout)
    }

    /// Join thread `name`, returning one response per buffered call.
    pub fn thread_wait(&mut self, name: &str, timeout: Duration) -> Result<Vec<Response>, SessionError> {
        self.send(&Request::ThreadWait { name: name.to_string() })?;
        let deadline = Instant::now() + timeout;
        let mut results = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = self.read_line(remaining, timeout)?;
            match ThreadLine::parse(&line)? {
                ThreadLine::Result(response) => results.push(response),
                ThreadLine::Done => return Ok(results),
            }
        }
    }

    /// Kill and reap the process. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut live) = self.live.take() {
            debug!("{}: closing worker", self.module_path.display());
            drop(live.stdin);
            let _ = live.child.kill();
            let _ = live.child.wait();
        }
        self.state = SessionState::Closed;
    }

    fn ensure_running(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Running => return Ok(()),
            SessionState::Closed => return Err(SessionError::NotRunning),
            SessionState::Dead => warn!(
                "{}: restarting dead worker, module state is lost",
                self.module_path.display()
            ),
            SessionState::Unstarted => {}
        }
        let cmd = self.worker.batch_command(&self.module_path, &self.links);
        self.live = Some(spawn_worker(cmd)?);
        self.state = SessionState::Running;
        self.main = None;
        debug!("{}: worker started", self.module_path.display());
        Ok(())
    }

    fn send(&mut self, request: &Request) -> Result<(), SessionError> {
        self.ensure_running()?;
        let line = request.to_string();
        trace!("> {line}");
        let Some(live) = self.live.as_mut() else {
            return Err(SessionError::NotRunning);
        };
        let written = writeln!(live.stdin, "{line}").and_then(|_| live.stdin.flush());
        if let Err(e) = written {
            debug!("{}: write failed: {e}", self.module_path.display());
            self.bury();
            return Err(SessionError::Died);
        }
        Ok(())
    }

    fn request(&mut self, request: &Request, timeout: Duration) -> Result<Response, SessionError> {
        self.send(request)?;
        let line = self.read_line(timeout, timeout)?;
        Ok(Response::parse(&line)?)
    }

    /// Wait up to `wait` for one line. `reported` is the bound named in the
    /// timeout error.
    fn read_line(&mut self, wait: Duration, reported: Duration) -> Result<String, SessionError> {
        let Some(live) = self.live.as_mut() else {
            return Err(SessionError::NotRunning);
        };
        match live.lines.recv_timeout(wait) {
            Ok(line) => {
                trace!("< {line}");
                Ok(line)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{}: no answer within {reported:?}, killing worker",
                    self.module_path.display()
                );
                self.bury();
                Err(SessionError::Timeout(reported))
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("{}: worker exited", self.module_path.display());
                self.bury();
                Err(SessionError::Died)
            }
        }
    }

    /// Kill what is left of the process and mark the session dead.
    fn bury(&mut self) {
        if let Some(mut live) = self.live.take() {
            let _ = live.child.kill();
            let _ = live.child.wait();
        }
        self.state = SessionState::Dead;
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_worker(mut cmd: Command) -> Result<LiveWorker, SessionError> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SessionError::Spawn {
            path: Path::new(cmd.get_program()).to_path_buf(),
            source,
        })?;

    let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(SessionError::NotRunning);
    };

    let (tx, lines) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            debug!("worker stderr: {line}");
        }
    });

    Ok(LiveWorker { child, stdin, lines })
}
