//! The ordered transaction log: one entry per host-mediated exchange, appended
//! in program order. This trace is what an external prover binds to.

use wasmi::Value;

use crate::code::ProgramId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExchangeTag {
    New,
    Resume,
    Yield,
    Query,
    Mutate,
    Consume,
    Mint,
    Burn,
    Event,
    Effect,
}

/// A single resume/yield-style exchange between the scheduler and a program.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub tag: ExchangeTag,
    /// The program on the far side of the exchange.
    pub program: ProgramId,
    pub operation: String,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

/// Little-endian byte encoding of scalar values, for log entries. Reference
/// values have no stable byte form and encode as empty.
pub(crate) fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::FuncRef(_) | Value::ExternRef(_) => {}
        }
    }
    out
}
