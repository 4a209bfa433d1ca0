//! Common test utilities shared between integration tests

#![allow(dead_code)]

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wastrun::config::{HarnessConfig, WorkerConfig};
use wastrun::script::ScratchDir;

pub fn mock_worker() -> WorkerConfig {
    WorkerConfig::new(env!("CARGO_BIN_EXE_mock-worker"))
}

pub fn mock_config() -> HarnessConfig {
    HarnessConfig::default()
        .with_worker(env!("CARGO_BIN_EXE_mock-worker"))
        .with_call_timeout(Duration::from_secs(5))
        .with_thread_timeout(Duration::from_secs(10))
}

fn leb(mut n: usize, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn name(s: &str, out: &mut Vec<u8>) {
    leb(s.len(), out);
    out.extend_from_slice(s.as_bytes());
}

fn section(id: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.push(id);
    leb(payload.len(), out);
    out.extend_from_slice(payload);
}

/// A module the mock worker understands: function imports from `imports`
/// and a `mock` custom section holding `directives`.
pub fn mock_module(imports: &[&str], directives: &[&str]) -> Vec<u8> {
    let mut out = b"\0asm\x01\0\0\0".to_vec();
    if !imports.is_empty() {
        let mut payload = Vec::new();
        leb(imports.len(), &mut payload);
        for module in imports {
            name(module, &mut payload);
            name("f", &mut payload);
            payload.extend_from_slice(&[0x00, 0x00]);
        }
        section(2, &payload, &mut out);
    }
    let mut payload = Vec::new();
    name("mock", &mut payload);
    payload.extend_from_slice(directives.join("\n").as_bytes());
    section(0, &payload, &mut out);
    out
}

/// A scratch directory holding modules and scripts for one test.
pub struct Workspace {
    scratch: ScratchDir,
}

impl Workspace {
    pub fn new() -> Workspace {
        Workspace {
            scratch: ScratchDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    pub fn module(&self, file: &str, imports: &[&str], directives: &[&str]) -> PathBuf {
        let path = self.path().join(file);
        fs::write(&path, mock_module(imports, directives)).unwrap();
        path
    }

    pub fn script(&self, file: &str, commands: Value) -> PathBuf {
        let path = self.path().join(file);
        let script = serde_json::json!({
            "source_filename": file.replace(".json", ".wast"),
            "commands": commands,
        });
        fs::write(&path, serde_json::to_vec_pretty(&script).unwrap()).unwrap();
        path
    }
}
