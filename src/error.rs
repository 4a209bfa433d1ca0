use crate::binary::BinaryError;
use crate::matcher::Mismatch;
use crate::protocol::ProtocolError;
use crate::script::ScriptError;
use crate::session::SessionError;
use crate::threads::ThreadError;
use crate::value::CodecError;
use thiserror::Error;

/// Any error surfaced by the harness.
///
/// Inside a script run most of these are turned into a failed or skipped
/// command; only script loading errors end a run early.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Mismatch(#[from] Mismatch),
    #[error(transparent)]
    Binary(#[from] BinaryError),
}
