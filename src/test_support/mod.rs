//! Hand-built WebAssembly contracts for exercising the host without a guest
//! toolchain. The modules are pre-asyncified: they export the `asyncify_*`
//! family themselves and keep all coroutine state in their own linear memory,
//! which keeps the suspend/resume protocol observable and deterministic.

pub mod contracts;
pub mod wasm_dsl;
