//! The host-level failure taxonomy. Every failed transaction surfaces exactly
//! one of these kinds and leaves the [`Universe`](crate::Universe) unchanged.

use crate::code::ProgramId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Module bytes failed to parse or validate.
    #[error("invalid contract module: {0}")]
    BadModule(String),

    /// Program id not present in the registry and not resolvable.
    #[error("unknown program id {0}")]
    UnknownCode(ProgramId),

    /// An import was invoked from a role that forbids it.
    #[error("{0}")]
    WrongContext(String),

    /// Coordination-side handle not found in the transaction's table.
    #[error("unknown handle {0:#x}")]
    UnknownHandle(u32),

    /// A lifecycle operation hit a UTXO in the wrong state.
    #[error("cannot {op} a UTXO that is {state}")]
    BadState { op: &'static str, state: &'static str },

    /// Resume-argument byte length differs from the suspended frame's size.
    #[error("resume argument is {got} bytes, expected {expected}")]
    SizeMismatch { expected: u32, got: u32 },

    /// A query/mutate/consume call left the instance suspended.
    #[error("{0} suspended instead of returning")]
    NotQuiescent(String),

    /// Burn-function suffix does not match the one recorded at mint.
    #[error("burn function {got} does not match {expected}")]
    BurnFnMismatch { expected: String, got: String },

    /// The coordination returned while token intermediates were still pending.
    #[error("{0} token intermediate(s) left unresolved at commit")]
    UnresolvedIntermediate(usize),

    /// An effect was raised with no handler installed for it.
    #[error("no handler installed for effect {0:?}")]
    UnhandledEffect(String),

    /// The WebAssembly sandbox trapped.
    #[error("wasm trap: {0}")]
    Trap(String),

    /// An import whose prefix the router does not recognize.
    #[error("unrecognized import {0}")]
    UnknownImport(String),
}

impl wasmi::core::HostError for Error {}

pub type Result<T, E = Error> = std::result::Result<T, E>;
