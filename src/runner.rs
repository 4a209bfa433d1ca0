//! The command interpreter.
//!
//! A [`RunContext`] replays one script against the worker: it owns every
//! session the script opens, the module registry and the thread
//! orchestrator, and tallies each assertion into a [`FileReport`]. Problems
//! with a single command never abort the run; the command is failed or
//! skipped and the next one runs.

use crate::binary::import_modules;
use crate::config::{HarnessConfig, LinkMap};
use crate::error::Error;
use crate::matcher::{judge, Expectation, Verdict};
use crate::protocol::Response;
use crate::registry::{Hosting, ModuleIdentity, ModuleRegistry, Target};
use crate::report::FileReport;
use crate::script::{self, Action, ActionKind, Command, RawValue};
use crate::session::{oneshot, SessionError, SessionId, WorkerSession};
use crate::threads::{self, BufferedCall, ThreadError, ThreadOrchestrator, ThreadRecord};
use crate::value::{encode_arg, Expected, WireArg};
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Kinds of module rejection a script can assert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Invalid,
    Malformed,
    Unlinkable,
    Uninstantiable,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rejection::Invalid => "assert_invalid",
            Rejection::Malformed => "assert_malformed",
            Rejection::Unlinkable => "assert_unlinkable",
            Rejection::Uninstantiable => "assert_uninstantiable",
        };
        f.write_str(name)
    }
}

/// A thread block whose calls are being collected.
struct OpenThread {
    name: String,
    /// Session and module the first call resolved to.
    target: Option<(SessionId, Option<String>)>,
    calls: Vec<BufferedCall>,
}

/// State of one script run.
pub struct RunContext {
    config: HarnessConfig,
    base_dir: PathBuf,
    sessions: Vec<Option<WorkerSession>>,
    registry: ModuleRegistry,
    threads: ThreadOrchestrator,
    open_thread: Option<OpenThread>,
    report: FileReport,
}

fn alive(sessions: &[Option<WorkerSession>], id: SessionId) -> bool {
    sessions.get(id).and_then(Option::as_ref).map_or(false, WorkerSession::is_alive)
}

impl RunContext {
    /// `base_dir` is where module files named by the script are found.
    pub fn new(config: HarnessConfig, base_dir: impl Into<PathBuf>, name: impl Into<String>) -> RunContext {
        RunContext {
            config,
            base_dir: base_dir.into(),
            sessions: Vec::new(),
            registry: ModuleRegistry::new(),
            threads: ThreadOrchestrator::new(),
            open_thread: None,
            report: FileReport::new(name),
        }
    }

    pub fn report(&self) -> &FileReport {
        &self.report
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn session(&self, id: SessionId) -> Option<&WorkerSession> {
        self.sessions.get(id).and_then(Option::as_ref)
    }

    /// Number of sessions that have not been closed.
    pub fn open_sessions(&self) -> usize {
        self.sessions.iter().flatten().filter(|s| s.is_alive()).count()
    }

    pub fn run_commands(&mut self, commands: &[Command]) {
        for command in commands {
            self.run_command(command);
        }
    }

    /// Close every session and hand back the tally. Threads that were
    /// never joined have their checks skipped.
    pub fn finish(mut self) -> FileReport {
        for record in self.threads.clear() {
            for call in record.calls.iter().filter(|c| c.expectation != Expectation::None) {
                self.report.skip(call.line, format!("thread {} was never joined", record.name));
            }
        }
        for session in self.sessions.iter_mut().flatten() {
            session.close();
        }
        self.report
    }

    pub fn run_command(&mut self, command: &Command) {
        let line = command.line();
        if self.open_thread.is_some() && self.buffer_in_thread(command) {
            return;
        }
        match command {
            Command::Module {
                name,
                filename,
                binary_filename,
                ..
            } => match binary_filename.as_ref().or(filename.as_ref()) {
                Some(file) => {
                    let path = self.base_dir.join(file);
                    self.instantiate(name.as_deref(), path);
                }
                None => self.report.skip(line, "module without a binary"),
            },
            Command::ModuleDefinition {
                name,
                filename,
                binary_filename,
                ..
            } => {
                if let (Some(name), Some(file)) = (name, binary_filename.as_ref().or(filename.as_ref())) {
                    let path = self.base_dir.join(file);
                    self.registry.define(name, path);
                }
            }
            Command::ModuleInstance { instance, module, .. } => {
                let definition = module.as_deref().and_then(|m| self.registry.definition(m)).cloned();
                match definition {
                    Some(path) => self.instantiate(instance.as_deref(), path),
                    None => self.report.skip(line, format!("unknown module definition {module:?}")),
                }
            }
            Command::Register { as_name, name, .. } => self.register(name.as_deref(), as_name, line),
            Command::Action { action, .. } => self.action(action, line),
            Command::AssertReturn {
                action,
                expected,
                either,
                ..
            } => self.assert_return(action, expected, either, line),
            Command::AssertTrap {
                action: Some(action),
                text,
                ..
            }
            | Command::AssertExhaustion { action, text, .. } => self.assert_trap(action, text, line),
            Command::AssertTrap {
                action: None,
                filename: Some(file),
                text,
                ..
            } => self.assert_rejected(Rejection::Uninstantiable, file, text, None, line),
            Command::AssertTrap { .. } => self.report.skip(line, "assert_trap without action or module"),
            Command::AssertInvalid {
                filename,
                text,
                module_type,
                ..
            } => self.assert_rejected(Rejection::Invalid, filename, text, module_type.as_deref(), line),
            Command::AssertMalformed {
                filename,
                text,
                module_type,
                ..
            } => self.assert_rejected(Rejection::Malformed, filename, text, module_type.as_deref(), line),
            Command::AssertUnlinkable {
                filename,
                text,
                module_type,
                ..
            } => self.assert_rejected(Rejection::Unlinkable, filename, text, module_type.as_deref(), line),
            Command::AssertUninstantiable {
                filename,
                text,
                module_type,
                ..
            } => self.assert_rejected(Rejection::Uninstantiable, filename, text, module_type.as_deref(), line),
            Command::Thread { name, commands, .. } => self.thread_block(name, commands),
            Command::Wait { thread, line } => self.wait(thread, *line),
            Command::Unknown => self.report.skip(line, "unknown command"),
        }
    }

    // ---------------------------------------------------------------
    // Modules
    // ---------------------------------------------------------------

    fn instantiate(&mut self, name: Option<&str>, path: PathBuf) {
        let imports = self.imports_of(&path);
        let sessions = &self.sessions;
        let hosting = self.registry.hosting_for(&imports, |id| alive(sessions, id));
        let identity = match hosting {
            Hosting::Shared { session } => match self.load_resident(session, name, &path) {
                Some(identity) => identity,
                None => {
                    let links = self.registry.links_for(&imports);
                    self.dedicated(name, path, links)
                }
            },
            Hosting::Dedicated { links } => self.dedicated(name, path, links),
        };
        self.registry.set_current(identity);
        // modules created inside a thread block must outlive it
        if self.open_thread.is_none() {
            self.close_unreferenced();
        }
    }

    fn imports_of(&self, path: &Path) -> Vec<String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: {e}", path.display());
                return Vec::new();
            }
        };
        import_modules(&bytes).unwrap_or_else(|e| {
            warn!("{}: cannot read imports: {e}", path.display());
            Vec::new()
        })
    }

    fn dedicated(&mut self, name: Option<&str>, path: PathBuf, links: LinkMap) -> ModuleIdentity {
        let id = self.sessions.len();
        debug!("session {id}: {} with {} links", path.display(), links.len());
        self.sessions
            .push(Some(WorkerSession::new(self.config.worker.clone(), path.clone(), links)));
        ModuleIdentity {
            internal_name: name.map(str::to_string),
            session: id,
            resident: None,
            path,
        }
    }

    /// Load a module into a live session's store and make it that session's
    /// main module. `None` if the worker refuses.
    fn load_resident(&mut self, id: SessionId, name: Option<&str>, path: &Path) -> Option<ModuleIdentity> {
        let resident = self.registry.resident_name(name);
        let timeout = self.config.call_timeout;
        let session = self.sessions.get_mut(id)?.as_mut()?;
        let loaded = session
            .load_module(&resident, path, timeout)
            .and_then(|r| match r {
                Response::Ok(_) => session.set_main(Some(resident.as_str()), timeout),
                refused => Ok(refused),
            });
        match loaded {
            Ok(Response::Ok(_)) => {
                debug!("session {id}: {} loaded as {resident}", path.display());
                Some(ModuleIdentity {
                    internal_name: name.map(str::to_string),
                    session: id,
                    resident: Some(resident),
                    path: path.to_path_buf(),
                })
            }
            Ok(Response::Error(msg)) => {
                debug!("session {id} refused {}: {msg}", path.display());
                None
            }
            Err(e) => {
                warn!("session {id}: loading {} failed: {e}", path.display());
                None
            }
        }
    }

    /// Point session `id`'s unqualified calls at `want`.
    fn ensure_main(&mut self, id: SessionId, want: Option<&str>) -> Result<(), SessionError> {
        let timeout = self.config.call_timeout;
        let Some(session) = self.sessions.get_mut(id).and_then(Option::as_mut) else {
            return Err(SessionError::NotRunning);
        };
        if session.main() == want {
            return Ok(());
        }
        match session.set_main(want, timeout)? {
            Response::Ok(_) => Ok(()),
            Response::Error(msg) => {
                warn!("session {id}: set_main {want:?} refused: {msg}");
                Ok(())
            }
        }
    }

    fn register(&mut self, name: Option<&str>, as_name: &str, line: u64) {
        let Some(identity) = self.registry.locate(name).cloned() else {
            self.report.skip(line, format!("register of unknown module {name:?}"));
            return;
        };
        if alive(&self.sessions, identity.session) {
            let restore = self.registry.main_for(identity.session).map(str::to_string);
            let timeout = self.config.call_timeout;
            let id = identity.session;
            let registered = self.ensure_main(id, identity.resident.as_deref()).and_then(|()| {
                let session = self.sessions.get_mut(id).and_then(Option::as_mut).ok_or(SessionError::NotRunning)?;
                session.register_module(as_name, timeout)
            });
            match registered {
                Ok(Response::Ok(_)) => {}
                Ok(Response::Error(msg)) => warn!("line {line}: register {as_name} refused: {msg}"),
                Err(e) => warn!("line {line}: register {as_name} failed: {e}"),
            }
            if let Err(e) = self.ensure_main(id, restore.as_deref()) {
                debug!("session {id}: restoring main failed: {e}");
            }
        }
        self.registry.record_registration(&identity, as_name);
    }

    /// Close sessions no module, registration or thread refers to.
    fn close_unreferenced(&mut self) {
        let mut used = self.registry.sessions_in_use();
        used.extend(self.threads.sessions());
        for (id, slot) in self.sessions.iter_mut().enumerate() {
            if used.contains(&id) {
                continue;
            }
            if let Some(mut session) = slot.take() {
                debug!("session {id}: no longer referenced");
                session.close();
            }
        }
    }

    // ---------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------

    /// Resolve the target and encode the arguments, or say why not.
    fn prepare(&self, action: &Action) -> Result<(Target, Vec<WireArg>), String> {
        let sessions = &self.sessions;
        let target = self.registry.resolve(action.module.as_deref(), |id| alive(sessions, id));
        if target == Target::Unresolvable {
            return Err(format!("cannot resolve module {:?}", action.module));
        }
        let args = action
            .args
            .iter()
            .map(|a| a.to_value().and_then(|v| encode_arg(&v)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("{}: {e}", action.field))?;
        Ok((target, args))
    }

    fn perform(&mut self, target: &Target, action: &Action, args: &[WireArg]) -> Result<Response, SessionError> {
        let timeout = self.config.call_timeout;
        let id = target.session().ok_or(SessionError::NotRunning)?;
        if let Target::Direct(_) = target {
            let want = self.direct_main(action.module.as_deref(), id);
            self.ensure_main(id, want.as_deref())?;
        }
        let session = self.sessions.get_mut(id).and_then(Option::as_mut).ok_or(SessionError::NotRunning)?;
        match (action.kind, target.module()) {
            (ActionKind::Invoke, None) => session.invoke(&action.field, args, timeout),
            (ActionKind::Invoke, Some(module)) => session.invoke_on(module, &action.field, args, timeout),
            (ActionKind::Get, None) => session.get(&action.field, timeout),
            (ActionKind::Get, Some(module)) => session.get_on(module, &action.field, timeout),
        }
    }

    /// The resident a direct call naming `name` must reach in `session`;
    /// `None` for the session's own module.
    fn direct_main(&self, name: Option<&str>, session: SessionId) -> Option<String> {
        self.registry
            .locate(name)
            .filter(|identity| identity.session == session)
            .and_then(|identity| identity.resident.clone())
    }

    fn mark_stateful(&mut self, target: &Target) {
        let Some(id) = target.session() else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(id).and_then(Option::as_mut) {
            session.mark_stateful();
        }
    }

    fn action(&mut self, action: &Action, line: u64) {
        let (target, args) = match self.prepare(action) {
            Ok(prepared) => prepared,
            Err(reason) => {
                debug!("line {line}: action not run: {reason}");
                return;
            }
        };
        if action.kind == ActionKind::Invoke {
            self.mark_stateful(&target);
        }
        match self.perform(&target, action, &args) {
            Ok(Response::Ok(_)) => {}
            Ok(Response::Error(msg)) => debug!("line {line}: action {} trapped: {msg}", action.field),
            Err(e) => debug!("line {line}: action {} failed: {e}", action.field),
        }
    }

    fn assert_return(&mut self, action: &Action, expected: &[RawValue], either: &[RawValue], line: u64) {
        let (target, args) = match self.prepare(action) {
            Ok(prepared) => prepared,
            Err(reason) => return self.report.skip(line, reason),
        };
        let expected = match expectations(expected, either) {
            Ok(expected) => expected,
            Err(reason) => return self.report.skip(line, reason),
        };
        // any successful call may have changed module state
        if action.kind == ActionKind::Invoke {
            self.mark_stateful(&target);
        }
        let outcome = self.perform(&target, action, &args);
        self.tally(line, &action.field, outcome, &Expectation::Return(expected));
    }

    fn assert_trap(&mut self, action: &Action, text: &str, line: u64) {
        let (target, args) = match self.prepare(action) {
            Ok(prepared) => prepared,
            Err(reason) => return self.report.skip(line, reason),
        };
        // a call can write memory, tables or globals before it traps
        if action.kind == ActionKind::Invoke {
            self.mark_stateful(&target);
        }
        let outcome = self.perform(&target, action, &args);
        self.tally(line, &action.field, outcome, &Expectation::Trap(text.to_string()));
    }

    fn tally(
        &mut self,
        line: u64,
        field: &str,
        outcome: Result<Response, SessionError>,
        expectation: &Expectation,
    ) {
        match outcome {
            Ok(response) => match judge(&response, expectation) {
                Verdict::Pass => self.report.pass(),
                Verdict::Fail(msg) => self.report.fail(line, format!("{field}: {msg}")),
                Verdict::Unchecked => {}
            },
            Err(e) => self.report.fail(line, format!("{field}: {e}")),
        }
    }

    fn assert_rejected(&mut self, kind: Rejection, filename: &str, text: &str, module_type: Option<&str>, line: u64) {
        if module_type == Some("text") {
            return self.report.skip(line, format!("{kind}: text module"));
        }
        let path = self.base_dir.join(filename);
        let accepted = match kind {
            Rejection::Invalid | Rejection::Malformed => {
                oneshot::validate(&self.config.worker, &path, self.config.call_timeout)
            }
            Rejection::Unlinkable | Rejection::Uninstantiable => self.try_instantiate(&path),
        };
        match accepted {
            Ok(false) => self.report.pass(),
            // a gap in the worker's checks, not a wrong answer
            Ok(true) => self.report.skip(line, format!("{kind}: module accepted, expected \"{text}\"")),
            Err(e) => self.report.fail(line, format!("{kind}: {e}")),
        }
    }

    /// Instantiate a module that is expected to fail. A module importing
    /// from a live session is loaded into that session, so whatever its
    /// start function writes into the shared instances stays visible.
    fn try_instantiate(&mut self, path: &Path) -> Result<bool, SessionError> {
        let imports = self.imports_of(path);
        let timeout = self.config.call_timeout;
        let sessions = &self.sessions;
        match self.registry.hosting_for(&imports, |id| alive(sessions, id)) {
            Hosting::Shared { session: id } => {
                let resident = self.registry.resident_name(None);
                let session = self.sessions.get_mut(id).and_then(Option::as_mut).ok_or(SessionError::NotRunning)?;
                match session.load_module(&resident, path, timeout)? {
                    Response::Ok(_) => Ok(true),
                    Response::Error(msg) => {
                        debug!("session {id} refused {}: {msg}", path.display());
                        Ok(false)
                    }
                }
            }
            Hosting::Dedicated { links } => oneshot::instantiate(&self.config.worker, path, &links, timeout),
        }
    }

    // ---------------------------------------------------------------
    // Threads
    // ---------------------------------------------------------------

    fn thread_block(&mut self, name: &str, commands: &[Command]) {
        if let Some(open) = &self.open_thread {
            debug!("thread {name} runs inside thread {}", open.name);
            return self.run_commands(commands);
        }
        let saved = self.registry.current().cloned();
        self.open_thread = Some(OpenThread {
            name: name.to_string(),
            target: None,
            calls: Vec::new(),
        });
        self.run_commands(commands);

        if let Some(open) = self.open_thread.take() {
            match open.target {
                Some((session, module)) => {
                    let mut record = ThreadRecord::new(open.name, session, module);
                    record.calls = open.calls;
                    self.threads.buffer(record);
                }
                None => debug!("thread {name} has no calls"),
            }
        }

        self.registry.restore_current(saved.clone());
        if let Some(identity) = saved.filter(|i| alive(&self.sessions, i.session)) {
            if let Err(e) = self.ensure_main(identity.session, identity.resident.as_deref()) {
                debug!("session {}: restoring main failed: {e}", identity.session);
            }
        }
    }

    /// Queue a call command inside an open thread block. Returns false for
    /// commands that run immediately.
    fn buffer_in_thread(&mut self, command: &Command) -> bool {
        let line = command.line();
        let (action, expectation) = match command {
            Command::Action { action, .. } => (action, Ok(Expectation::None)),
            Command::AssertReturn {
                action,
                expected,
                either,
                ..
            } => (action, expectations(expected, either).map(Expectation::Return)),
            Command::AssertTrap {
                action: Some(action),
                text,
                ..
            }
            | Command::AssertExhaustion { action, text, .. } => (action, Ok(Expectation::Trap(text.clone()))),
            Command::Wait { thread, .. } => {
                debug!("line {line}: wait for {thread} inside a thread block ignored");
                return true;
            }
            _ => return false,
        };

        let checked = !matches!(expectation, Ok(Expectation::None));
        let skip = |ctx: &mut RunContext, reason: String| {
            if checked {
                ctx.report.skip(line, reason);
            } else {
                debug!("line {line}: {reason}");
            }
        };
        if action.kind != ActionKind::Invoke {
            skip(self, format!("{}: get inside a thread", action.field));
            return true;
        }
        let expectation = match expectation {
            Ok(e) => e,
            Err(reason) => {
                skip(self, reason);
                return true;
            }
        };
        let (target, args) = match self.prepare(action) {
            Ok(prepared) => prepared,
            Err(reason) => {
                skip(self, reason);
                return true;
            }
        };
        let Some(session) = target.session() else {
            return true;
        };
        let module = match target.module() {
            Some(m) => Some(m.to_string()),
            None => self.direct_main(action.module.as_deref(), session),
        };
        let key = (session, module);

        let Some(open) = self.open_thread.as_mut() else {
            return false;
        };
        if open.target.is_none() {
            open.target = Some(key.clone());
        }
        if open.target.as_ref() != Some(&key) {
            let reason = format!("{}: thread {} calls a second module", action.field, open.name);
            skip(self, reason);
            return true;
        }
        open.calls.push(BufferedCall {
            function: action.field.clone(),
            args,
            expectation,
            line,
        });
        true
    }

    fn wait(&mut self, thread: &str, line: u64) {
        let timeout = self.config.call_timeout;
        for record in self.threads.take_pending() {
            // `-` in thread_begin means whatever the worker's main is now
            if record.module.is_none() {
                if let Err(e) = self.ensure_main(record.session, None) {
                    debug!("thread {}: resetting main failed: {e}", record.name);
                }
            }
            let spawned = match self.sessions.get_mut(record.session).and_then(Option::as_mut) {
                Some(session) => threads::spawn(session, &record, timeout),
                None => Err(ThreadError::Session(SessionError::NotRunning)),
            };
            match spawned {
                Ok(()) => {
                    info!("thread {} started with {} calls", record.name, record.calls.len());
                    self.threads.mark_spawned(record);
                }
                Err(e) => {
                    self.fail_thread(&record, &e);
                    self.threads.mark_failed(&record);
                }
            }
        }

        let Some(record) = self.threads.take_spawned(thread) else {
            if !self.threads.take_failed(thread) {
                self.report.skip(line, format!("wait for unknown thread {thread}"));
            }
            return;
        };
        let thread_timeout = self.config.thread_timeout;
        let collected = match self.sessions.get_mut(record.session).and_then(Option::as_mut) {
            Some(session) => threads::collect(session, &record, thread_timeout),
            None => Err(ThreadError::Session(SessionError::NotRunning)),
        };
        match collected {
            Ok(verdicts) => {
                for (call, verdict) in record.calls.iter().zip(verdicts) {
                    match verdict {
                        Verdict::Pass => self.report.pass(),
                        Verdict::Fail(msg) => self.report.fail(call.line, format!("{}: {msg}", call.function)),
                        Verdict::Unchecked => {}
                    }
                }
            }
            Err(e) => self.fail_thread(&record, &e),
        }
        self.close_unreferenced();
    }

    fn fail_thread(&mut self, record: &ThreadRecord, error: &ThreadError) {
        warn!("thread {}: {error}", record.name);
        for call in record.calls.iter().filter(|c| c.expectation != Expectation::None) {
            self.report.fail(call.line, format!("thread {}: {error}", record.name));
        }
    }
}

/// Expected results of an `assert_return`; `either` lists alternatives for
/// the single result.
fn expectations(expected: &[RawValue], either: &[RawValue]) -> Result<Vec<Expected>, String> {
    if expected.is_empty() && !either.is_empty() {
        return either
            .iter()
            .map(RawValue::to_expected)
            .collect::<Result<Vec<_>, _>>()
            .map(|alts| vec![Expected::Either(alts)])
            .map_err(|e| e.to_string());
    }
    expected
        .iter()
        .map(RawValue::to_expected)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

/// Run one script file.
pub fn run_script(config: &HarnessConfig, path: &Path) -> Result<FileReport, Error> {
    let loaded = script::load(path)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    info!("running {name} ({} commands)", loaded.script.commands.len());
    let mut ctx = RunContext::new(config.clone(), loaded.base_dir.clone(), name);
    ctx.run_commands(&loaded.script.commands);
    Ok(ctx.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FloatWidth;

    fn raw(json: &str) -> RawValue {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn either_field_wraps_alternatives() {
        let either = [raw(r#"{"type":"i32","value":"1"}"#), raw(r#"{"type":"i32","value":"2"}"#)];
        assert_eq!(
            expectations(&[], &either).unwrap(),
            vec![Expected::Either(vec![Expected::Scalar(1), Expected::Scalar(2)])]
        );
        let nan = [raw(r#"{"type":"f64","value":"nan:arithmetic"}"#)];
        assert_eq!(expectations(&nan, &[]).unwrap(), vec![Expected::NanWildcard(FloatWidth::F64)]);
        assert!(expectations(&[raw(r#"{"type":"bogus"}"#)], &[]).is_err());
    }

    #[test]
    fn nothing_to_run_against() {
        let mut ctx = RunContext::new(HarnessConfig::default(), ".", "empty");
        let action: Action = serde_json::from_str(r#"{"type":"invoke","field":"f","args":[]}"#).unwrap();
        assert!(ctx.prepare(&action).is_err());
        ctx.run_command(&Command::Register {
            line: 1,
            as_name: "M".into(),
            name: None,
        });
        ctx.run_command(&Command::Wait {
            line: 2,
            thread: "T".into(),
        });
        assert_eq!(ctx.open_sessions(), 0);
        let report = ctx.finish();
        assert_eq!(report.tally.skipped, 2);
        assert_eq!(Rejection::Unlinkable.to_string(), "assert_unlinkable");
    }
}
