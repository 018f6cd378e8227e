//! UTXO identities and activations.
//!
//! A [`UtxoInstance`] is the in-memory activation of a UTXO: a store and
//! instance of the asyncified contract module, plus the lifecycle state
//! machine. Suspension runs through the asyncify protocol: the suspension
//! imports record in-memory views and unwind the guest stack, and the host
//! later rewinds it after filling the resume-argument view.

use std::sync::Arc;

use log::trace;
use rand::RngCore;
use wasmi::{
    core::{Trap, ValueType, F32, F64},
    AsContextMut, Caller, Engine, ExternRef, Func, FuncRef, Instance, Module, Store, Value,
};

use crate::{
    code::{ContractCode, ProgramId},
    error::{Error, Result},
    imports::{self, HostCtx},
    transaction::{host_trap, take_failure, Shared},
};

/// Durable identity of a UTXO, independent of any activation.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct UtxoId([u8; 16]);

impl UtxoId {
    pub(crate) fn random() -> UtxoId {
        let mut bytes = [0; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        UtxoId(bytes)
    }

    pub fn raw(&self) -> [u8; 16] {
        self.0
    }
}

impl std::fmt::Debug for UtxoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UtxoId(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SuspensionKind {
    /// Ordinary yield back to the coordination.
    Yield,
    /// Effect raise, dispatched to an installed handler.
    Effect,
}

/// The views captured by a suspension import. Pointers index the UTXO's own
/// linear memory; they are views, not copies.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SuspendedFrame {
    pub kind: SuspensionKind,
    pub name: String,
    pub data: u32,
    pub data_len: u32,
    pub resume_arg: u32,
    pub resume_arg_len: u32,
}

/// Asyncify runtime states, as reported by `asyncify_get_state`.
const ASYNCIFY_NORMAL: i32 = 0;
const ASYNCIFY_UNWIND: i32 = 1;
const ASYNCIFY_REWIND: i32 = 2;

const ASYNCIFY_EXPORTS: [&str; 5] = [
    "asyncify_get_state",
    "asyncify_start_unwind",
    "asyncify_stop_unwind",
    "asyncify_start_rewind",
    "asyncify_stop_rewind",
];

#[derive(Debug)]
enum Lifecycle {
    NotStarted,
    Yielded(SuspendedFrame),
    Returned,
    Consumed,
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::NotStarted => "not started",
            Lifecycle::Yielded(_) => "yielded",
            Lifecycle::Returned => "returned",
            Lifecycle::Consumed => "consumed",
        }
    }
}

/// Outcome of driving one call into a UTXO instance.
pub(crate) enum Step {
    /// The call ran to completion with these results.
    Done(Vec<Value>),
    /// The call unwound at a suspension import.
    Suspended(SuspendedFrame),
}

/// Store data for a UTXO-role instance.
pub(crate) struct UtxoHost {
    pub shared: Shared,
    pub this_code: ProgramId,
    pub utxo: UtxoId,
    pub stack_region: (u32, u32),
    /// Frame captured by the most recent unwind, taken by the driver.
    pub pending: Option<SuspendedFrame>,
}

impl HostCtx for UtxoHost {
    fn shared(&self) -> &Shared {
        &self.shared
    }

    fn this_code(&self) -> ProgramId {
        self.this_code
    }
}

/// The suspension imports (`starstream_yield`, `starstream_raise`). On first
/// entry the asyncify state is NORMAL: capture the views and start unwinding.
/// On re-entry during a rewind, stop the rewind and return into the guest.
pub(crate) fn suspension_import(
    caller: &mut Caller<UtxoHost>,
    kind: SuspensionKind,
    name: (u32, u32),
    data: (u32, u32),
    resume_arg: (u32, u32),
) -> Result<(), Trap> {
    let shared = caller.data().shared.clone();
    suspension_import_inner(caller, kind, name, data, resume_arg)
        .map_err(|e| host_trap(&shared, e))
}

fn suspension_import_inner(
    caller: &mut Caller<UtxoHost>,
    kind: SuspensionKind,
    (name, name_len): (u32, u32),
    (data, data_len): (u32, u32),
    (resume_arg, resume_arg_len): (u32, u32),
) -> Result<()> {
    match caller_asyncify_state(caller)? {
        ASYNCIFY_REWIND => {
            caller_asyncify_call(caller, "asyncify_stop_rewind", &[])?;
            Ok(())
        }
        ASYNCIFY_NORMAL => {
            let name = String::from_utf8_lossy(&imports::read_bytes(caller, name, name_len)?)
                .into_owned();
            let frame = SuspendedFrame {
                kind,
                name,
                data,
                data_len,
                resume_arg,
                resume_arg_len,
            };
            trace!("suspend {frame:?}");
            let stack_start = caller.data().stack_region.0;
            caller.data_mut().pending = Some(frame);
            caller_asyncify_call(
                caller,
                "asyncify_start_unwind",
                &[Value::I32(stack_start as i32)],
            )?;
            Ok(())
        }
        other => Err(Error::NotQuiescent(format!(
            "suspension import in asyncify state {other}"
        ))),
    }
}

fn caller_asyncify_call(
    caller: &mut Caller<UtxoHost>,
    name: &str,
    args: &[Value],
) -> Result<Option<i32>> {
    let func = caller
        .get_export(name)
        .and_then(|e| e.into_func())
        .ok_or_else(|| Error::BadModule(format!("missing export {name}")))?;
    let n = func.ty(caller.as_context_mut()).results().len();
    let mut outputs = [Value::I32(0)];
    func.call(caller.as_context_mut(), args, &mut outputs[..n])
        .map_err(|e| Error::Trap(format!("{name}: {e}")))?;
    Ok(match outputs[..n].first() {
        Some(Value::I32(v)) => Some(*v),
        _ => None,
    })
}

fn caller_asyncify_state(caller: &mut Caller<UtxoHost>) -> Result<i32> {
    caller_asyncify_call(caller, "asyncify_get_state", &[])?
        .ok_or_else(|| Error::BadModule("asyncify_get_state has the wrong type".into()))
}

fn zero_value(ty: &ValueType) -> Value {
    match ty {
        ValueType::I32 => Value::I32(0),
        ValueType::I64 => Value::I64(0),
        ValueType::F32 => Value::F32(F32::from_bits(0)),
        ValueType::F64 => Value::F64(F64::from_bits(0)),
        ValueType::FuncRef => Value::FuncRef(FuncRef::null()),
        ValueType::ExternRef => Value::ExternRef(ExternRef::null()),
    }
}

/// A live activation of a UTXO. At most one exists per UTXO at any moment.
pub(crate) struct UtxoInstance {
    code: Arc<ContractCode>,
    entry_point: String,
    store: Store<UtxoHost>,
    instance: Instance,
    state: Lifecycle,
    /// Export to re-invoke when rewinding out of the most recent unwind.
    rewind_target: Option<String>,
}

impl UtxoInstance {
    /// Instantiate the asyncified module for a UTXO, without running anything.
    pub(crate) fn new(
        shared: &Shared,
        utxo: UtxoId,
        code: Arc<ContractCode>,
        entry_point: &str,
        stack_region: (u32, u32),
    ) -> Result<UtxoInstance> {
        let asyncified = code.asyncified()?;
        let engine = Engine::default();
        let module = Module::new(&engine, &asyncified[..])
            .map_err(|e| Error::BadModule(e.to_string()))?;
        let mut store = Store::new(
            &engine,
            UtxoHost {
                shared: shared.clone(),
                this_code: code.id(),
                utxo,
                stack_region,
                pending: None,
            },
        );
        let linker = imports::utxo_linker(&engine, &module);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| Error::BadModule(format!("instantiation: {e}")))?
            .ensure_no_start(&mut store)
            .map_err(|e| Error::BadModule(format!("instantiation: {e}")))?;

        let mut this = UtxoInstance {
            code,
            entry_point: entry_point.to_owned(),
            store,
            instance,
            state: Lifecycle::NotStarted,
            rewind_target: None,
        };
        for name in ASYNCIFY_EXPORTS {
            if this.instance.get_func(&mut this.store, name).is_none() {
                return Err(Error::BadModule(format!("UTXO module missing export {name}")));
            }
        }
        // Initialize the unwind/rewind buffer header: the save-data pair
        // [STACK_START+8, STACK_END] lives in the first two words at
        // STACK_START. Asyncify maintains the current pointer from there, so
        // nested effect unwinds append after a suspended stack instead of
        // clobbering it.
        let (start, end) = stack_region;
        let mut header = [0; 8];
        header[..4].copy_from_slice(&(start + 8).to_le_bytes());
        header[4..].copy_from_slice(&end.to_le_bytes());
        this.write_memory(start, &header)?;
        Ok(this)
    }

    /// Reinstantiate an archived UTXO: fresh asyncified module, then the
    /// archived memory image copied over the fresh linear memory.
    pub(crate) fn load(
        shared: &Shared,
        utxo: UtxoId,
        code: Arc<ContractCode>,
        entry_point: &str,
        frame: SuspendedFrame,
        memory: &[u8],
        stack_region: (u32, u32),
    ) -> Result<UtxoInstance> {
        let mut this = UtxoInstance::new(shared, utxo, code, entry_point, stack_region)?;
        this.restore_memory(memory)?;
        this.state = Lifecycle::Yielded(frame);
        Ok(this)
    }

    /// Archive the activation: the suspended frame plus the full memory image.
    pub(crate) fn unload(mut self) -> Result<(SuspendedFrame, Vec<u8>)> {
        let frame = match &self.state {
            Lifecycle::Yielded(frame) => frame.clone(),
            other => {
                return Err(Error::BadState {
                    op: "unload",
                    state: other.name(),
                })
            }
        };
        let memory = self.memory()?;
        Ok((frame, memory.data(&self.store).to_vec()))
    }

    pub(crate) fn code_id(&self) -> ProgramId {
        self.code.id()
    }

    pub(crate) fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub(crate) fn is_alive(&self) -> bool {
        !matches!(self.state, Lifecycle::Returned | Lifecycle::Consumed)
    }

    /// Run the entry point until its first yield (or return).
    pub(crate) fn start(&mut self, inputs: &[Value]) -> Result<Step> {
        if !matches!(self.state, Lifecycle::NotStarted) {
            return Err(Error::BadState {
                op: "start",
                state: self.state.name(),
            });
        }
        let entry = self.entry_point.clone();
        let step = self.invoke(&entry, inputs)?;
        self.note_entry_step(&step);
        Ok(step)
    }

    /// Drive the UTXO past its current yield with the caller-supplied bytes.
    pub(crate) fn resume(&mut self, bytes: &[u8]) -> Result<Step> {
        let frame = match &self.state {
            Lifecycle::Yielded(frame) => frame.clone(),
            other => {
                return Err(Error::BadState {
                    op: "resume",
                    state: other.name(),
                })
            }
        };
        if bytes.len() as u32 != frame.resume_arg_len {
            return Err(Error::SizeMismatch {
                expected: frame.resume_arg_len,
                got: bytes.len() as u32,
            });
        }
        self.write_memory(frame.resume_arg, bytes)?;
        // A yield only ever suspends the entry point.
        self.rewind_target = Some(self.entry_point.clone());
        let step = self.rewind()?;
        self.note_entry_step(&step);
        Ok(step)
    }

    /// Resume a pending effect suspension with the handler's result bytes.
    pub(crate) fn resume_effect(&mut self, frame: &SuspendedFrame, bytes: &[u8]) -> Result<Step> {
        if bytes.len() as u32 != frame.resume_arg_len {
            return Err(Error::SizeMismatch {
                expected: frame.resume_arg_len,
                got: bytes.len() as u32,
            });
        }
        self.write_memory(frame.resume_arg, bytes)?;
        let step = self.rewind()?;
        if self.rewound_into_entry() {
            self.note_entry_step(&step);
        }
        Ok(step)
    }

    /// Direct call of a named export with the yielded data view as the first
    /// argument. No yield suspension is allowed inside it.
    pub(crate) fn call_method(&mut self, method: &str, args: &[Value]) -> Result<Step> {
        let frame = match &self.state {
            Lifecycle::Yielded(frame) => frame.clone(),
            other => {
                return Err(Error::BadState {
                    op: "call",
                    state: other.name(),
                })
            }
        };
        let inputs: Vec<Value> = std::iter::once(Value::I32(frame.data as i32))
            .chain(args.iter().cloned())
            .collect();
        self.invoke(method, &inputs)
    }

    pub(crate) fn mark_consumed(&mut self) {
        self.state = Lifecycle::Consumed;
    }

    pub(crate) fn read_memory(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        let memory = self.memory()?;
        memory
            .data(&self.store)
            .get(addr as usize..addr as usize + len as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Trap(format!("read {addr:#x}+{len} out of bounds")))
    }

    pub(crate) fn write_memory(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        let memory = self.memory()?;
        memory
            .data_mut(&mut self.store)
            .get_mut(addr as usize..addr as usize + bytes.len())
            .ok_or_else(|| Error::Trap(format!("write {addr:#x}+{} out of bounds", bytes.len())))?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn memory(&mut self) -> Result<wasmi::Memory> {
        self.instance
            .get_export(&self.store, "memory")
            .and_then(|e| e.into_memory())
            .ok_or_else(|| Error::BadModule("UTXO module missing export memory".into()))
    }

    fn restore_memory(&mut self, bytes: &[u8]) -> Result<()> {
        let memory = self.memory()?;
        let current = memory.data(&self.store).len();
        if bytes.len() > current {
            let deficit = bytes.len() - current;
            let pages = (deficit + 65535) / 65536;
            let pages = wasmi::core::Pages::new(pages as u32)
                .ok_or_else(|| Error::Trap("archived memory too large".into()))?;
            memory
                .grow(&mut self.store, pages)
                .map_err(|e| Error::Trap(e.to_string()))?;
        }
        self.write_memory(0, bytes)
    }

    fn export_func(&mut self, name: &str) -> Result<Func> {
        self.instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| Error::Trap(format!("no such export {name}")))
    }

    fn asyncify_call(&mut self, name: &str, args: &[Value]) -> Result<Option<i32>> {
        let func = self.export_func(name)?;
        let n = func.ty(&self.store).results().len();
        let mut outputs = [Value::I32(0)];
        func.call(&mut self.store, args, &mut outputs[..n])
            .map_err(|e| Error::Trap(format!("{name}: {e}")))?;
        Ok(match outputs[..n].first() {
            Some(Value::I32(v)) => Some(*v),
            _ => None,
        })
    }

    fn asyncify_state(&mut self) -> Result<i32> {
        self.asyncify_call("asyncify_get_state", &[])?
            .ok_or_else(|| Error::BadModule("asyncify_get_state has the wrong type".into()))
    }

    /// Call an export and classify the result by the post-call asyncify state.
    fn invoke(&mut self, func_name: &str, inputs: &[Value]) -> Result<Step> {
        let func = self.export_func(func_name)?;
        let num_outputs = func.ty(&self.store).results().len();
        let mut outputs = vec![Value::I32(0); num_outputs];
        trace!("{:?} call {func_name}{inputs:?}", self.store.data().utxo);
        let shared = self.store.data().shared.clone();
        func.call(&mut self.store, inputs, &mut outputs)
            .map_err(|e| take_failure(&shared, e))?;
        match self.asyncify_state()? {
            ASYNCIFY_UNWIND => {
                self.asyncify_call("asyncify_stop_unwind", &[])?;
                let frame = self.store.data_mut().pending.take().ok_or_else(|| {
                    Error::Trap("unwind without a recorded suspension".into())
                })?;
                self.rewind_target = Some(func_name.to_owned());
                Ok(Step::Suspended(frame))
            }
            ASYNCIFY_NORMAL => Ok(Step::Done(outputs)),
            other => Err(Error::Trap(format!("unexpected asyncify state {other}"))),
        }
    }

    /// Rewind into the export that most recently unwound.
    fn rewind(&mut self) -> Result<Step> {
        let start = self.store.data().stack_region.0;
        self.asyncify_call("asyncify_start_rewind", &[Value::I32(start as i32)])?;
        let target = self
            .rewind_target
            .clone()
            .unwrap_or_else(|| self.entry_point.clone());
        // Argument values are restored from the save buffer during the rewind;
        // only the signature matters here.
        let func = self.export_func(&target)?;
        let zeros: Vec<Value> = func.ty(&self.store).params().iter().map(zero_value).collect();
        self.invoke(&target, &zeros)
    }

    fn rewound_into_entry(&self) -> bool {
        match &self.rewind_target {
            Some(target) => *target == self.entry_point,
            None => true,
        }
    }

    fn note_entry_step(&mut self, step: &Step) {
        match step {
            Step::Done(_) => self.state = Lifecycle::Returned,
            Step::Suspended(frame) if frame.kind == SuspensionKind::Yield => {
                self.state = Lifecycle::Yielded(frame.clone());
            }
            Step::Suspended(_) => {}
        }
    }
}

impl std::fmt::Debug for UtxoInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtxoInstance")
            .field("code", &self.code.id())
            .field("entry_point", &self.entry_point)
            .field("state", &self.state)
            .finish()
    }
}
