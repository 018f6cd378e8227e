//! The Universe: ledger-side authority for live UTXOs and their tokens.
//!
//! Transactions stage every mutation in their own instances; the Universe is
//! only touched here, after a coordination script returns cleanly. On any
//! failure the prior state is kept byte for byte.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use log::info;

use crate::{
    code::{CodeCache, CodeProvider, ContractCode, ProgramId},
    error::{Error, Result},
    trace::LogEntry,
    token::Token,
    transaction::{self, CallValue},
    utxo::{SuspendedFrame, UtxoId},
};

/// Recognized host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// The asyncify unwind/rewind save region, `[start, end)` in linear
    /// memory. Contracts must not claim this range for their own data.
    pub stack_region: (u32, u32),
    /// Inclusive range that random handles are drawn from.
    pub handle_range: (u32, u32),
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            stack_region: (16, 1024),
            handle_range: (1, 1 << 30),
        }
    }
}

impl HostConfig {
    fn validate(&self) -> Result<()> {
        let (start, end) = self.stack_region;
        if start.checked_add(8).map_or(true, |base| base >= end) {
            return Err(Error::Trap(format!(
                "stack save region [{start}, {end}) leaves no room for the unwind buffer"
            )));
        }
        let (lo, hi) = self.handle_range;
        if lo < 1 || lo > hi {
            return Err(Error::Trap(format!("empty handle range [{lo}, {hi}]")));
        }
        Ok(())
    }
}

/// The persisted form of a live UTXO: enough to reinstantiate and resume it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UtxoRecord {
    pub program: ProgramId,
    pub entry_point: String,
    /// Archived linear memory, including the asyncify save buffer.
    pub memory: Vec<u8>,
    pub frame: SuspendedFrame,
    pub tokens: Vec<Token>,
}

/// The observable result of a successful transaction.
#[derive(Debug)]
pub struct TransactionReceipt {
    pub value: CallValue,
    /// Every host-mediated exchange, in program order.
    pub log: Vec<LogEntry>,
}

/// Global ledger-side state: the code registry, the set of live UTXOs, and
/// their token relations.
pub struct Universe {
    registry: Arc<CodeCache>,
    utxos: BTreeMap<UtxoId, UtxoRecord>,
    config: HostConfig,
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl Universe {
    pub fn new() -> Universe {
        Universe {
            registry: Arc::new(CodeCache::new()),
            utxos: BTreeMap::new(),
            config: HostConfig::default(),
        }
    }

    pub fn with_provider(provider: Box<dyn CodeProvider>) -> Universe {
        Universe {
            registry: Arc::new(CodeCache::with_provider(provider)),
            utxos: BTreeMap::new(),
            config: HostConfig::default(),
        }
    }

    pub fn with_config(config: HostConfig) -> Result<Universe> {
        config.validate()?;
        Ok(Universe {
            registry: Arc::new(CodeCache::new()),
            utxos: BTreeMap::new(),
            config,
        })
    }

    pub fn code_cache(&self) -> &Arc<CodeCache> {
        &self.registry
    }

    /// The live UTXO set. Records only change at transaction commit.
    pub fn utxos(&self) -> &BTreeMap<UtxoId, UtxoRecord> {
        &self.utxos
    }

    pub fn utxo(&self, id: UtxoId) -> Option<&UtxoRecord> {
        self.utxos.get(&id)
    }

    /// Run one coordination entry point as a transaction: commit the staged
    /// UTXO set on clean return, discard everything otherwise. Host panics
    /// are caught at this boundary and roll back like any other failure.
    pub fn run_transaction(
        &mut self,
        coordination: &Arc<ContractCode>,
        entry_point: &str,
        inputs: &[CallValue],
    ) -> Result<TransactionReceipt> {
        let run = catch_unwind(AssertUnwindSafe(|| {
            transaction::run(
                &self.utxos,
                &self.registry,
                &self.config,
                coordination,
                entry_point,
                inputs,
            )
        }));
        let (value, log, delta) = match run {
            Ok(result) => result?,
            Err(_) => return Err(Error::Trap("host panic during transaction".into())),
        };

        for (id, record) in delta {
            match record {
                Some(record) => {
                    self.utxos.insert(id, record);
                }
                None => {
                    self.utxos.remove(&id);
                }
            }
        }
        info!(
            "transaction {entry_point:?} committed; {} live UTXO(s)",
            self.utxos.len()
        );
        Ok(TransactionReceipt { value, log })
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe").field("utxos", &self.utxos).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_accepted() {
        assert!(Universe::with_config(HostConfig::default()).is_ok());
    }

    #[test]
    fn degenerate_configs_are_rejected() {
        let config = HostConfig {
            stack_region: (16, 20),
            ..HostConfig::default()
        };
        assert!(Universe::with_config(config).is_err());

        let config = HostConfig {
            handle_range: (0, 10),
            ..HostConfig::default()
        };
        assert!(Universe::with_config(config).is_err());
    }
}
