//! Request and response lines of the worker protocol.
//!
//! Every request is one line of text written to the worker's stdin, every
//! response one line read from its stdout. Every name (function, global,
//! module, registration, resident or thread) is length-prefixed (`5:hello`)
//! so that it may contain spaces; a name with control characters is sent as
//! `hex:<bytes>` instead. The bare token `-` stands for the worker's own
//! module. Arguments follow the name as decimal words, vectors as
//! `v128:<lo>:<hi>`.

use crate::value::WireArg;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Token naming a worker's own module in `thread_begin` and `set_main`.
pub const MAIN_MODULE: &str = "-";

static RESPONSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(ok|error)(?:[ \t]+(.*))?$").expect("response regex"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed response: {0:?}")]
    MalformedResponse(String),
    #[error("bad result word {0:?}")]
    BadWord(String),
    #[error("bad name encoding {0:?}")]
    BadName(String),
    #[error("bad argument {0:?}")]
    BadArgument(String),
    #[error("unknown request {0:?}")]
    UnknownRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Invoke { name: String, args: Vec<WireArg> },
    InvokeOn { module: String, name: String, args: Vec<WireArg> },
    Get { name: String },
    GetOn { module: String, name: String },
    Load { name: String, path: PathBuf },
    Register { name: String },
    SetMain { name: String },
    /// `module` of `None` targets the main module.
    ThreadBegin { name: String, module: Option<String> },
    ThreadInvoke { name: String, args: Vec<WireArg> },
    ThreadEnd,
    ThreadWait { name: String },
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Invoke { name, args } => {
                write!(f, "invoke {}", encode_name(name))?;
                write_args(f, args)
            }
            Request::InvokeOn { module, name, args } => {
                write!(f, "invoke_on {} {}", encode_name(module), encode_name(name))?;
                write_args(f, args)
            }
            Request::Get { name } => write!(f, "get {}", encode_name(name)),
            Request::GetOn { module, name } => {
                write!(f, "get_on {} {}", encode_name(module), encode_name(name))
            }
            Request::Load { name, path } => write!(f, "load {} {}", encode_name(name), path.display()),
            Request::Register { name } => write!(f, "register {}", encode_name(name)),
            Request::SetMain { name } => write!(f, "set_main {}", encode_module(Some(name))),
            Request::ThreadBegin { name, module } => {
                write!(f, "thread_begin {} {}", encode_name(name), encode_module(module.as_deref()))
            }
            Request::ThreadInvoke { name, args } => {
                write!(f, "thread_invoke {}", encode_name(name))?;
                write_args(f, args)
            }
            Request::ThreadEnd => write!(f, "thread_end"),
            Request::ThreadWait { name } => write!(f, "thread_wait {}", encode_name(name)),
        }
    }
}

/// `-` for the main module, otherwise the encoded name.
fn encode_module(module: Option<&str>) -> String {
    match module {
        None | Some(MAIN_MODULE) => MAIN_MODULE.to_string(),
        Some(name) => encode_name(name),
    }
}

fn decode_module(s: &str) -> Result<(Option<String>, &str), ProtocolError> {
    match s.strip_prefix(MAIN_MODULE) {
        Some(rest) if rest.is_empty() || rest.starts_with(' ') => Ok((None, rest.trim_start_matches(' '))),
        _ => decode_name(s).map(|(name, rest)| (Some(name), rest)),
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[WireArg]) -> fmt::Result {
    for arg in args {
        write!(f, " {arg}")?;
    }
    Ok(())
}

impl Request {
    /// Parse a request line, as a worker does.
    pub fn parse(line: &str) -> Result<Request, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let unknown = || ProtocolError::UnknownRequest(line.to_string());
        match verb {
            "invoke" => {
                let (name, rest) = decode_name(rest)?;
                Ok(Request::Invoke {
                    name,
                    args: parse_args(rest)?,
                })
            }
            "invoke_on" => {
                let (module, rest) = decode_name(rest)?;
                let (name, rest) = decode_name(rest)?;
                Ok(Request::InvokeOn {
                    module,
                    name,
                    args: parse_args(rest)?,
                })
            }
            "get" => Ok(Request::Get {
                name: decode_name(rest)?.0,
            }),
            "get_on" => {
                let (module, rest) = decode_name(rest)?;
                Ok(Request::GetOn {
                    module,
                    name: decode_name(rest)?.0,
                })
            }
            "load" => {
                let (name, path) = decode_name(rest)?;
                if path.is_empty() {
                    return Err(unknown());
                }
                Ok(Request::Load {
                    name,
                    path: PathBuf::from(path),
                })
            }
            "register" => Ok(Request::Register {
                name: decode_name(rest)?.0,
            }),
            "set_main" => {
                let (module, _) = decode_module(rest)?;
                Ok(Request::SetMain {
                    name: module.unwrap_or_else(|| MAIN_MODULE.to_string()),
                })
            }
            "thread_begin" => {
                let (name, rest) = decode_name(rest)?;
                let (module, _) = decode_module(rest)?;
                Ok(Request::ThreadBegin { name, module })
            }
            "thread_invoke" => {
                let (name, rest) = decode_name(rest)?;
                Ok(Request::ThreadInvoke {
                    name,
                    args: parse_args(rest)?,
                })
            }
            "thread_end" => Ok(Request::ThreadEnd),
            "thread_wait" => Ok(Request::ThreadWait {
                name: decode_name(rest)?.0,
            }),
            _ => Err(unknown()),
        }
    }
}

fn parse_args(rest: &str) -> Result<Vec<WireArg>, ProtocolError> {
    rest.split_whitespace()
        .map(|tok| tok.parse().map_err(|_| ProtocolError::BadArgument(tok.to_string())))
        .collect()
}

/// Encode a name as `<len>:<name>`, or `hex:<hex>` when it contains control
/// characters.
pub fn encode_name(name: &str) -> String {
    if name.chars().any(char::is_control) {
        format!("hex:{}", hex::encode(name.as_bytes()))
    } else {
        format!("{}:{name}", name.len())
    }
}

/// Decode an encoded name at the start of `s`, returning the name and the
/// remainder of the line after it.
pub fn decode_name(s: &str) -> Result<(String, &str), ProtocolError> {
    let bad = || ProtocolError::BadName(s.to_string());
    if let Some(rest) = s.strip_prefix("hex:") {
        let (encoded, rest) = rest.split_once(' ').unwrap_or((rest, ""));
        let bytes = hex::decode(encoded).map_err(|_| bad())?;
        let name = String::from_utf8(bytes).map_err(|_| bad())?;
        return Ok((name, rest));
    }
    let (len, rest) = s.split_once(':').ok_or_else(bad)?;
    let len: usize = len.parse().map_err(|_| bad())?;
    let name = rest.get(..len).ok_or_else(bad)?;
    let rest = &rest[len..];
    let rest = match rest.strip_prefix(' ') {
        Some(r) => r,
        None if rest.is_empty() => rest,
        None => return Err(bad()),
    };
    Ok((name.to_string(), rest))
}

/// A worker's answer to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Successful return with its result words.
    Ok(Vec<u64>),
    /// Trap or other runtime error, with the worker's message.
    Error(String),
}

impl Response {
    pub fn parse(line: &str) -> Result<Response, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let caps = RESPONSE_RE
            .captures(line)
            .ok_or_else(|| ProtocolError::MalformedResponse(line.to_string()))?;
        let rest = caps.get(2).map_or("", |m| m.as_str());
        match &caps[1] {
            "ok" => rest
                .split_whitespace()
                .map(|w| w.parse::<u64>().map_err(|_| ProtocolError::BadWord(w.to_string())))
                .collect::<Result<Vec<_>, _>>()
                .map(Response::Ok),
            _ => Ok(Response::Error(rest.to_string())),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(words) => {
                write!(f, "ok")?;
                for w in words {
                    write!(f, " {w}")?;
                }
                Ok(())
            }
            Response::Error(msg) => write!(f, "error {msg}"),
        }
    }
}

/// One line of a `thread_wait` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadLine {
    Result(Response),
    Done,
}

impl ThreadLine {
    pub fn parse(line: &str) -> Result<ThreadLine, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "thread_done" {
            return Ok(ThreadLine::Done);
        }
        match line.strip_prefix("thread_result ") {
            Some(rest) => Response::parse(rest).map(ThreadLine::Result),
            None => Err(ProtocolError::MalformedResponse(line.to_string())),
        }
    }
}

impl fmt::Display for ThreadLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadLine::Result(r) => write!(f, "thread_result {r}"),
            ThreadLine::Done => write!(f, "thread_done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_line() {
        let req = Request::Invoke {
            name: "add".into(),
            args: vec![WireArg::Word(2), WireArg::Word(3)],
        };
        assert_eq!(req.to_string(), "invoke 3:add 2 3");
        assert_eq!(Request::parse("invoke 3:add 2 3").unwrap(), req);
    }

    #[test]
    fn names_with_spaces_and_control_characters() {
        assert_eq!(encode_name("a b"), "3:a b");
        assert_eq!(decode_name("3:a b 7").unwrap(), ("a b".to_string(), "7"));
        assert_eq!(encode_name("\n"), "hex:0a");
        assert_eq!(decode_name("hex:0a 1 2").unwrap(), ("\n".to_string(), "1 2"));
        assert_eq!(encode_name(""), "0:");
        assert_eq!(decode_name("0:").unwrap(), (String::new(), ""));
        assert!(decode_name("9:short").is_err());
        assert!(decode_name("2:abc").is_err());
    }

    #[test]
    fn vector_args_and_modules() {
        let req = Request::InvokeOn {
            module: "M".into(),
            name: "f".into(),
            args: vec![WireArg::Vector(1, 2)],
        };
        assert_eq!(req.to_string(), "invoke_on 1:M 1:f v128:1:2");
        assert_eq!(Request::parse(&req.to_string()).unwrap(), req);

        let begin = Request::ThreadBegin {
            name: "T".into(),
            module: None,
        };
        assert_eq!(begin.to_string(), "thread_begin 1:T -");
        assert_eq!(Request::parse("thread_begin 1:T -").unwrap(), begin);
        assert!(Request::parse("frobnicate").is_err());
    }

    #[test]
    fn module_names_with_spaces() {
        let cases = [
            Request::Register { name: "my module".into() },
            Request::Load {
                name: "$a b".into(),
                path: PathBuf::from("/tmp/dir with space/m.wasm"),
            },
            Request::GetOn {
                module: "my module".into(),
                name: "g".into(),
            },
            Request::SetMain { name: "$a b".into() },
            Request::SetMain {
                name: MAIN_MODULE.into(),
            },
            Request::ThreadBegin {
                name: "T 1".into(),
                module: Some("$a b".into()),
            },
            Request::ThreadWait { name: "T 1".into() },
        ];
        for req in cases {
            assert_eq!(Request::parse(&req.to_string()).unwrap(), req);
        }
        assert_eq!(
            Request::Register { name: "my module".into() }.to_string(),
            "register 9:my module"
        );
        assert_eq!(Request::SetMain { name: "-".into() }.to_string(), "set_main -");
        assert!(Request::parse("register my module").is_err());
        assert!(Request::parse("load 2:$M").is_err());
    }

    #[test]
    fn responses() {
        assert_eq!(Response::parse("ok").unwrap(), Response::Ok(vec![]));
        assert_eq!(Response::parse("ok 1 18446744073709551615").unwrap(), Response::Ok(vec![1, u64::MAX]));
        assert_eq!(
            Response::parse("error integer divide by zero").unwrap(),
            Response::Error("integer divide by zero".into())
        );
        assert!(matches!(Response::parse("ok x"), Err(ProtocolError::BadWord(_))));
        assert!(matches!(Response::parse("okay"), Err(ProtocolError::MalformedResponse(_))));
        assert!(matches!(Response::parse(""), Err(ProtocolError::MalformedResponse(_))));
    }

    #[test]
    fn thread_lines() {
        assert_eq!(
            ThreadLine::parse("thread_result ok 4").unwrap(),
            ThreadLine::Result(Response::Ok(vec![4]))
        );
        assert_eq!(ThreadLine::parse("thread_done").unwrap(), ThreadLine::Done);
        assert!(ThreadLine::parse("ok 4").is_err());
    }
}
