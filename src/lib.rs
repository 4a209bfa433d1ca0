//! A conformance-test orchestration engine for WebAssembly runtimes.
//!
//! wastrun replays the command scripts produced by `wast2json` (module,
//! register, invoke, get, the `assert_*` family, `thread` and `wait`) against
//! an external runtime binary, the *worker*, and checks what it reports.
//! The worker is driven over a line protocol; one worker process is kept
//! alive per module so that memories, tables and mutable globals persist
//! between calls.
//!
//! # Modules
//!
//! - [`value`] -- Typed test values and their 64-bit wire encoding.
//! - [`matcher`] -- Width-aware comparison of result words against expectations.
//! - [`protocol`] -- Request and response lines of the worker protocol.
//! - [`session`] -- Worker process lifecycle, persistent and one-shot.
//! - [`binary`] -- Import-section scanner for module binaries.
//! - [`registry`] -- Module identities, registrations and action targets.
//! - [`threads`] -- Deferred spawning and collection of `thread` blocks.
//! - [`script`] -- The JSON command-script model and loader.
//! - [`runner`] -- The command interpreter.
//! - [`report`] -- Pass/fail/skip accounting across files.
//! - [`config`] -- Harness settings and the worker command line.
//!
//! # Example
//!
//! Encode an argument and check a worker response against an expectation:
//!
//! ```
//! use wastrun::matcher::match_results;
//! use wastrun::protocol::Response;
//! use wastrun::value::{encode_arg, expect, TestValue};
//!
//! let arg = encode_arg(&TestValue::I32(2)).unwrap();
//! assert_eq!(arg.to_string(), "2");
//!
//! let response = Response::parse("ok 5").unwrap();
//! let expected = vec![expect(&TestValue::I32(5)).unwrap()];
//! if let Response::Ok(words) = response {
//!     assert!(match_results(&words, &expected).is_ok());
//! }
//! ```

pub mod binary;
pub mod config;
pub mod error;
pub mod matcher;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod runner;
pub mod script;
pub mod session;
pub mod threads;
pub mod value;

pub use config::{HarnessConfig, WorkerConfig};
pub use error::Error;
pub use runner::{run_script, RunContext};
