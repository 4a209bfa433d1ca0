//! The JSON command-script model and its loader.
//!
//! Scripts are the output of `wast2json`: a `source_filename` and a flat list
//! of commands, each tagged with its `type` and source `line`, referring to
//! module binaries that sit next to the script. A bundled form,
//! `{"bin": {name: base64}, "spec": {...}}`, carries the binaries inline;
//! they are written out to a scratch directory for the duration of the run.

use crate::value::{
    expect, CodecError, Expected, FloatLit, Lane, LaneType, RefHandle, RefKind, TestValue,
};
use base64::{engine::general_purpose, Engine as _};
use log::debug;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("failed to unpack bundled binaries: {0}")]
    Scratch(#[from] io::Error),
    #[error("bad bundled binary name {0:?}")]
    BadBinaryName(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub source_filename: Option<String>,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Invoke,
    Get,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub module: Option<String>,
    pub field: String,
    #[serde(default)]
    pub args: Vec<RawValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Module {
        line: u64,
        name: Option<String>,
        filename: Option<String>,
        binary_filename: Option<String>,
    },
    ModuleDefinition {
        line: u64,
        name: Option<String>,
        filename: Option<String>,
        binary_filename: Option<String>,
    },
    ModuleInstance {
        line: u64,
        instance: Option<String>,
        module: Option<String>,
    },
    Register {
        line: u64,
        #[serde(rename = "as")]
        as_name: String,
        name: Option<String>,
    },
    Action {
        line: u64,
        action: Action,
    },
    AssertReturn {
        line: u64,
        action: Action,
        #[serde(default)]
        expected: Vec<RawValue>,
        /// Older scripts list `either` alternatives here instead.
        #[serde(default)]
        either: Vec<RawValue>,
    },
    AssertTrap {
        line: u64,
        action: Option<Action>,
        /// Set instead of `action` for a module whose start function traps.
        filename: Option<String>,
        #[serde(default)]
        text: String,
    },
    AssertExhaustion {
        line: u64,
        action: Action,
        #[serde(default)]
        text: String,
    },
    AssertInvalid {
        line: u64,
        filename: String,
        #[serde(default)]
        text: String,
        module_type: Option<String>,
    },
    AssertMalformed {
        line: u64,
        filename: String,
        #[serde(default)]
        text: String,
        module_type: Option<String>,
    },
    AssertUnlinkable {
        line: u64,
        filename: String,
        #[serde(default)]
        text: String,
        module_type: Option<String>,
    },
    AssertUninstantiable {
        line: u64,
        filename: String,
        #[serde(default)]
        text: String,
        module_type: Option<String>,
    },
    Thread {
        line: u64,
        name: String,
        #[serde(default)]
        shared_module: Option<serde_json::Value>,
        #[serde(default)]
        commands: Vec<Command>,
    },
    Wait {
        line: u64,
        thread: String,
    },
    #[serde(other)]
    Unknown,
}

impl Command {
    pub fn line(&self) -> u64 {
        match self {
            Command::Module { line, .. }
            | Command::ModuleDefinition { line, .. }
            | Command::ModuleInstance { line, .. }
            | Command::Register { line, .. }
            | Command::Action { line, .. }
            | Command::AssertReturn { line, .. }
            | Command::AssertTrap { line, .. }
            | Command::AssertExhaustion { line, .. }
            | Command::AssertInvalid { line, .. }
            | Command::AssertMalformed { line, .. }
            | Command::AssertUnlinkable { line, .. }
            | Command::AssertUninstantiable { line, .. }
            | Command::Thread { line, .. }
            | Command::Wait { line, .. } => *line,
            Command::Unknown => 0,
        }
    }
}

/// A typed value as written in a script.
#[derive(Debug, Clone, Deserialize)]
pub struct RawValue {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub value: Option<RawPayload>,
    #[serde(default)]
    pub lane_type: Option<String>,
    /// Alternatives of an `either`.
    #[serde(default)]
    pub values: Vec<RawValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPayload {
    Scalar(String),
    Lanes(Vec<String>),
}

impl RawValue {
    pub fn to_value(&self) -> Result<TestValue, CodecError> {
        let scalar = || match &self.value {
            Some(RawPayload::Scalar(s)) => Ok(s.as_str()),
            _ => Err(self.bad_literal()),
        };
        match self.ty.as_str() {
            "i32" => Ok(TestValue::I32(parse_int(scalar()?, 32).ok_or_else(|| self.bad_literal())? as u32)),
            "i64" => Ok(TestValue::I64(parse_int(scalar()?, 64).ok_or_else(|| self.bad_literal())?)),
            "f32" => parse_f32(scalar()?).map(TestValue::F32).ok_or_else(|| self.bad_literal()),
            "f64" => parse_f64(scalar()?).map(TestValue::F64).ok_or_else(|| self.bad_literal()),
            "v128" => {
                let lane_type = self
                    .lane_type
                    .as_deref()
                    .and_then(LaneType::parse)
                    .ok_or_else(|| CodecError::UnknownType(format!("v128 lane {:?}", self.lane_type)))?;
                let Some(RawPayload::Lanes(raw)) = &self.value else {
                    return Err(self.bad_literal());
                };
                let lanes = raw
                    .iter()
                    .map(|s| parse_lane(lane_type, s))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| self.bad_literal())?;
                TestValue::v128(lane_type, lanes)
            }
            ty => {
                let kind = RefKind::parse(ty).ok_or_else(|| CodecError::UnknownType(ty.to_string()))?;
                let handle = match &self.value {
                    None => RefHandle::Any,
                    Some(RawPayload::Scalar(s)) if s == "null" => RefHandle::Null,
                    Some(RawPayload::Scalar(s)) => RefHandle::Handle(s.parse().map_err(|_| self.bad_literal())?),
                    Some(RawPayload::Lanes(_)) => return Err(self.bad_literal()),
                };
                Ok(TestValue::Ref { kind, handle })
            }
        }
    }

    pub fn to_expected(&self) -> Result<Expected, CodecError> {
        if self.ty == "either" {
            return self
                .values
                .iter()
                .map(RawValue::to_expected)
                .collect::<Result<Vec<_>, _>>()
                .map(Expected::Either);
        }
        expect(&self.to_value()?)
    }

    fn bad_literal(&self) -> CodecError {
        CodecError::BadLiteral {
            ty: self.ty.clone(),
            value: format!("{:?}", self.value),
        }
    }
}

/// Parse an integer literal of `bits` width, signed or unsigned, to its
/// wrapping bit pattern.
fn parse_int(s: &str, bits: u32) -> Option<u64> {
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    if let Ok(v) = s.parse::<u64>() {
        return (v <= mask).then_some(v);
    }
    let v = s.parse::<i64>().ok()?;
    let min = if bits == 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
    (v >= min).then_some(v as u64 & mask)
}

fn parse_f32(s: &str) -> Option<FloatLit<u32>> {
    match s {
        "nan:canonical" => Some(FloatLit::NanCanonical),
        "nan:arithmetic" => Some(FloatLit::NanArithmetic),
        _ => parse_int(s, 32).map(|b| FloatLit::Bits(b as u32)),
    }
}

fn parse_f64(s: &str) -> Option<FloatLit<u64>> {
    match s {
        "nan:canonical" => Some(FloatLit::NanCanonical),
        "nan:arithmetic" => Some(FloatLit::NanArithmetic),
        _ => parse_int(s, 64).map(FloatLit::Bits),
    }
}

fn parse_lane(lane_type: LaneType, s: &str) -> Option<Lane> {
    match lane_type {
        LaneType::F32 => parse_f32(s).map(Lane::F32),
        LaneType::F64 => parse_f64(s).map(Lane::F64),
        _ => parse_int(s, (lane_type.lane_bytes() * 8) as u32).map(Lane::Int),
    }
}

#[derive(Debug)]
struct Base64DecodedBytes(Vec<u8>);

impl<'de> Deserialize<'de> for Base64DecodedBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD.decode(s).map_err(de::Error::custom)?;
        Ok(Base64DecodedBytes(decoded))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Input {
    Bundle {
        bin: HashMap<String, Base64DecodedBytes>,
        spec: Script,
    },
    Plain(Script),
}

/// A directory that is removed when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new() -> io::Result<ScratchDir> {
        let path = std::env::temp_dir().join(format!("wastrun-{:016x}", rand::random::<u64>()));
        fs::create_dir_all(&path)?;
        Ok(ScratchDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            debug!("failed to remove {}: {e}", self.path.display());
        }
    }
}

/// A script ready to run, with the directory its binaries are found in.
#[derive(Debug)]
pub struct LoadedScript {
    pub script: Script,
    pub base_dir: PathBuf,
    _scratch: Option<ScratchDir>,
}

impl LoadedScript {
    /// Where a module file named in the script lives.
    pub fn module_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }
}

pub fn load(path: &Path) -> Result<LoadedScript, ScriptError> {
    let text = fs::read_to_string(path).map_err(|source| ScriptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let input: Input = serde_json::from_str(&text).map_err(|source| ScriptError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    match input {
        Input::Plain(script) => Ok(LoadedScript {
            script,
            base_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            _scratch: None,
        }),
        Input::Bundle { bin, spec } => {
            let scratch = ScratchDir::new()?;
            for (name, bytes) in bin {
                let file = Path::new(&name)
                    .file_name()
                    .ok_or_else(|| ScriptError::BadBinaryName(name.clone()))?;
                fs::write(scratch.path().join(file), bytes.0)?;
            }
            debug!("unpacked {} into {}", path.display(), scratch.path().display());
            Ok(LoadedScript {
                script: spec,
                base_dir: scratch.path().to_path_buf(),
                _scratch: Some(scratch),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FloatWidth;

    fn raw(json: &str) -> RawValue {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn integer_literals() {
        assert_eq!(parse_int("4294967295", 32), Some(0xFFFF_FFFF));
        assert_eq!(parse_int("-1", 32), Some(0xFFFF_FFFF));
        assert_eq!(parse_int("4294967296", 32), None);
        assert_eq!(parse_int("-2147483649", 32), None);
        assert_eq!(parse_int("-1", 64), Some(u64::MAX));
        assert_eq!(parse_int("x", 8), None);
    }

    #[test]
    fn scalar_and_nan_values() {
        assert_eq!(raw(r#"{"type":"i32","value":"7"}"#).to_value().unwrap(), TestValue::I32(7));
        assert_eq!(
            raw(r#"{"type":"f32","value":"nan:canonical"}"#).to_expected().unwrap(),
            Expected::NanWildcard(FloatWidth::F32)
        );
        assert!(raw(r#"{"type":"i32"}"#).to_value().is_err());
        assert!(matches!(
            raw(r#"{"type":"exotic","value":"1"}"#).to_value(),
            Err(CodecError::UnknownType(_))
        ));
    }

    #[test]
    fn vectors_and_references() {
        let v = raw(r#"{"type":"v128","lane_type":"i64","value":["1","-1"]}"#).to_value().unwrap();
        assert_eq!(
            v,
            TestValue::V128 {
                lane_type: LaneType::I64,
                lanes: vec![Lane::Int(1), Lane::Int(u64::MAX)]
            }
        );
        assert!(raw(r#"{"type":"v128","lane_type":"i64","value":["1"]}"#).to_value().is_err());

        assert_eq!(raw(r#"{"type":"externref","value":"null"}"#).to_expected().unwrap(), Expected::Scalar(0));
        assert_eq!(raw(r#"{"type":"externref","value":"3"}"#).to_expected().unwrap(), Expected::Scalar(4));
        assert_eq!(raw(r#"{"type":"funcref"}"#).to_expected().unwrap(), Expected::RefWildcard);
    }

    #[test]
    fn either_values() {
        let e = raw(r#"{"type":"either","values":[{"type":"i32","value":"1"},{"type":"i32","value":"2"}]}"#);
        assert_eq!(
            e.to_expected().unwrap(),
            Expected::Either(vec![Expected::Scalar(1), Expected::Scalar(2)])
        );
    }

    #[test]
    fn commands_parse() {
        let script: Script = serde_json::from_str(
            r#"{"source_filename": "x.wast", "commands": [
                {"type": "module", "line": 1, "name": "$M", "filename": "x.0.wasm"},
                {"type": "register", "line": 2, "as": "M"},
                {"type": "assert_return", "line": 3,
                 "action": {"type": "invoke", "field": "add", "args": [{"type": "i32", "value": "1"}]},
                 "expected": [{"type": "i32", "value": "1"}]},
                {"type": "assert_invalid", "line": 4, "filename": "x.1.wasm", "text": "type mismatch", "module_type": "binary"},
                {"type": "thread", "line": 5, "name": "$T", "shared_module": "$M", "commands": [
                    {"type": "action", "line": 6, "action": {"type": "invoke", "field": "inc"}}
                ]},
                {"type": "wait", "line": 7, "thread": "$T"},
                {"type": "assert_nonsense", "line": 8}
            ]}"#,
        )
        .unwrap();
        assert_eq!(script.commands.len(), 7);
        assert!(matches!(&script.commands[0], Command::Module { name: Some(n), .. } if n == "$M"));
        assert!(matches!(&script.commands[1], Command::Register { as_name, name: None, .. } if as_name == "M"));
        assert!(matches!(&script.commands[4], Command::Thread { commands, .. } if commands.len() == 1));
        assert!(matches!(script.commands[6], Command::Unknown));
        assert_eq!(script.commands[5].line(), 7);
    }
}
