//! Harness settings and the worker's command-line conventions.

use crate::value::WireArg;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

pub const DEFAULT_WORKER: &str = "./zig-out/bin/zwasm";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_THREAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Registration name → module binary, passed to the worker as `--link`.
pub type LinkMap = BTreeMap<String, PathBuf>;

/// How to start the runtime under test.
///
/// | purpose | argv |
/// |---|---|
/// | session | `run --batch [--link n=p]… <module>` |
/// | one-shot call | `run [--link n=p]… --invoke <func> <module> <arg>…` |
/// | validate | `validate <module>` |
/// | instantiate | `run [--link n=p]… --instantiate <module>` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub binary: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig::new(DEFAULT_WORKER)
    }
}

impl WorkerConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        WorkerConfig { binary: binary.into() }
    }

    fn run_with_links(&self, links: &LinkMap) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run");
        push_links(&mut cmd, links);
        cmd
    }

    /// A long-lived worker reading requests on stdin.
    pub fn batch_command(&self, module: &Path, links: &LinkMap) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run").arg("--batch");
        push_links(&mut cmd, links);
        cmd.arg(module);
        cmd
    }

    pub fn invoke_command(&self, module: &Path, links: &LinkMap, function: &str, args: &[WireArg]) -> Command {
        let mut cmd = self.run_with_links(links);
        cmd.arg("--invoke").arg(function).arg(module);
        cmd.args(args.iter().map(WireArg::to_string));
        cmd
    }

    pub fn validate_command(&self, module: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("validate").arg(module);
        cmd
    }

    pub fn instantiate_command(&self, module: &Path, links: &LinkMap) -> Command {
        let mut cmd = self.run_with_links(links);
        cmd.arg("--instantiate").arg(module);
        cmd
    }
}

fn push_links(cmd: &mut Command, links: &LinkMap) {
    for (name, path) in links {
        cmd.arg("--link").arg(format!("{name}={}", path.display()));
    }
}

/// Settings for a harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub worker: WorkerConfig,
    /// Bound on a single call, validation or instantiation.
    pub call_timeout: Duration,
    /// Bound on collecting one thread's results at `wait`.
    pub thread_timeout: Duration,
    /// Failures tolerated before the run counts as failed.
    pub allowed_failures: usize,
    pub verbose: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            worker: WorkerConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            thread_timeout: DEFAULT_THREAD_TIMEOUT,
            allowed_failures: 0,
            verbose: false,
        }
    }
}

impl HarnessConfig {
    pub fn with_worker(mut self, binary: impl Into<PathBuf>) -> Self {
        self.worker = WorkerConfig::new(binary);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_thread_timeout(mut self, timeout: Duration) -> Self {
        self.thread_timeout = timeout;
        self
    }

    pub fn with_allowed_failures(mut self, n: usize) -> Self {
        self.allowed_failures = n;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn argv(cmd: &Command) -> Vec<&OsStr> {
        cmd.get_args().collect()
    }

    #[test]
    fn batch_and_invoke_argv() {
        let worker = WorkerConfig::new("/bin/w");
        let mut links = LinkMap::new();
        links.insert("M".to_string(), PathBuf::from("m.wasm"));

        let cmd = worker.batch_command(Path::new("a.wasm"), &links);
        assert_eq!(cmd.get_program(), "/bin/w");
        assert_eq!(argv(&cmd), ["run", "--batch", "--link", "M=m.wasm", "a.wasm"]);

        let cmd = worker.invoke_command(Path::new("a.wasm"), &links, "add", &[WireArg::Word(2), WireArg::Word(3)]);
        assert_eq!(argv(&cmd), ["run", "--link", "M=m.wasm", "--invoke", "add", "a.wasm", "2", "3"]);
    }

    #[test]
    fn validate_and_instantiate_argv() {
        let worker = WorkerConfig::new("w");
        assert_eq!(argv(&worker.validate_command(Path::new("x.wasm"))), ["validate", "x.wasm"]);
        assert_eq!(
            argv(&worker.instantiate_command(Path::new("x.wasm"), &LinkMap::new())),
            ["run", "--instantiate", "x.wasm"]
        );
    }

    #[test]
    fn builder_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.worker.binary, PathBuf::from(DEFAULT_WORKER));
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.thread_timeout, Duration::from_secs(60));

        let config = config.with_worker("w").with_allowed_failures(3).with_verbose(true);
        assert_eq!(config.worker, WorkerConfig::new("w"));
        assert_eq!(config.allowed_failures, 3);
        assert!(config.verbose);
    }
}
