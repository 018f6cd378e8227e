//! Transactional coroutine scheduler and UTXO ledger host.
//!
//! Contracts are WebAssembly modules; UTXOs are persistent coroutine
//! instances of them that suspend at `starstream_yield` and survive between
//! transactions as archived memory images in the [`Universe`]. A transaction
//! is one invocation of a coordination entry point that creates, queries,
//! mutates, resumes, or consumes UTXOs through numeric handles and moves
//! tokens between them under linearity rules. Commit is all-or-nothing.

pub use code::{CodeCache, CodeProvider, ContractCode, ProgramId};
pub use error::{Error, Result};
pub use token::Token;
pub use trace::{ExchangeTag, LogEntry};
pub use transaction::CallValue;
pub use universe::{HostConfig, TransactionReceipt, Universe, UtxoRecord};
pub use utxo::{SuspendedFrame, SuspensionKind, UtxoId};

mod code;
mod error;
mod imports;
mod mermaid;
pub mod test_support;
mod token;
mod trace;
mod transaction;
mod universe;
mod utxo;
