use core::fmt::Write;
use std::collections::BTreeSet;

use crate::{trace::ExchangeTag, universe::TransactionReceipt};

impl TransactionReceipt {
    /// Generate a Mermaid-syntax sequence diagram of the transaction.
    pub fn to_mermaid_diagram(&self) -> String {
        let mut output = String::new();

        // https://mermaid.js.org/syntax/sequenceDiagram
        let _ = writeln!(output, "sequenceDiagram");
        let _ = writeln!(output, "participant Root");

        let mut seen = BTreeSet::new();
        for entry in &self.log {
            let short: String = entry.program.raw()[..4]
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect();
            if seen.insert(short.clone()) {
                let _ = writeln!(output, "participant p{short} as {short}");
            }
            match entry.tag {
                ExchangeTag::Yield | ExchangeTag::Effect => {
                    let _ = writeln!(output, "p{short}->>Root: {}", entry.operation);
                }
                _ => {
                    let _ = writeln!(output, "Root->>p{short}: {}", entry.operation);
                }
            }
        }

        output
    }
}
