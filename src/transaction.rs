//! The per-transaction scheduler: handle tables, the coordination instance,
//! dispatch of every UTXO operation, effect-handler routing, and the staging
//! area that the Universe commits on success.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use log::debug;
use rand::RngCore;
use wasmi::{core::Trap, AsContext, AsContextMut, Caller, Engine, Store, Value};

use crate::{
    code::{CodeCache, ContractCode, ProgramId},
    error::{Error, Result},
    imports::{self, HostCtx},
    trace::{encode_values, ExchangeTag, LogEntry},
    token::{self, Token, TokenSlot},
    universe::{HostConfig, UtxoRecord},
    utxo::{Step, SuspendedFrame, SuspensionKind, UtxoId, UtxoInstance},
};

/// Transaction-wide state shared by every instance the transaction runs.
pub(crate) struct TxShared {
    pub registry: Arc<CodeCache>,
    /// The active coordination program id, bound to this transaction.
    pub coordination: ProgramId,
    pub config: HostConfig,
    pub log: Vec<LogEntry>,
    /// Token and intermediate handles, transaction scoped.
    pub tokens: HashMap<u32, TokenSlot>,
    /// First structured failure raised by a host import.
    pub failure: Option<Error>,
}

pub(crate) type Shared = Arc<Mutex<TxShared>>;

impl TxShared {
    pub(crate) fn push_log(
        &mut self,
        tag: ExchangeTag,
        program: ProgramId,
        operation: &str,
        input: Vec<u8>,
        output: Vec<u8>,
    ) -> usize {
        self.log.push(LogEntry {
            tag,
            program,
            operation: operation.to_owned(),
            input,
            output,
        });
        self.log.len() - 1
    }

    pub(crate) fn set_log_output(&mut self, index: usize, output: Vec<u8>) {
        if let Some(entry) = self.log.get_mut(index) {
            entry.output = output;
        }
    }

    pub(crate) fn alloc_token_handle(&mut self) -> u32 {
        let range = self.config.handle_range;
        alloc_handle(range, |h| self.tokens.contains_key(&h))
    }

    pub(crate) fn pending_intermediates(&self) -> usize {
        self.tokens
            .values()
            .filter(|slot| matches!(slot, TokenSlot::Pending(_)))
            .count()
    }

    pub(crate) fn attached_tokens_of(&self, utxo: UtxoId) -> Vec<Token> {
        let mut handles: Vec<(u32, Token)> = self
            .tokens
            .iter()
            .filter_map(|(handle, slot)| match slot {
                TokenSlot::Attached { utxo: owner, token } if *owner == utxo => {
                    Some((*handle, token.clone()))
                }
                _ => None,
            })
            .collect();
        handles.sort_unstable_by_key(|(handle, _)| *handle);
        handles.into_iter().map(|(_, token)| token).collect()
    }
}

/// Pick an unused random handle from the configured range.
pub(crate) fn alloc_handle(range: (u32, u32), taken: impl Fn(u32) -> bool) -> u32 {
    let (lo, hi) = range;
    let span = hi - lo + 1;
    loop {
        let handle = lo + rand::thread_rng().next_u32() % span;
        if !taken(handle) {
            return handle;
        }
    }
}

/// Record a structured failure (first one wins) and trap out of the sandbox.
pub(crate) fn host_trap(shared: &Shared, error: Error) -> Trap {
    let mut s = shared.lock().unwrap();
    if s.failure.is_none() {
        s.failure = Some(error.clone());
    }
    Trap::from(error)
}

/// Recover the structured failure behind a wasmi error, if one was recorded.
pub(crate) fn take_failure(shared: &Shared, err: wasmi::Error) -> Error {
    let taken = shared.lock().unwrap().failure.take();
    taken.unwrap_or_else(|| Error::Trap(err.to_string()))
}

pub(crate) fn resolve_module_ref(
    shared: &Shared,
    module_ref: &str,
    this_code: ProgramId,
) -> Result<Arc<ContractCode>> {
    let registry = shared.lock().unwrap().registry.clone();
    if module_ref == "this" {
        return registry.resolve(this_code);
    }
    let id = ProgramId::from_hex(module_ref)
        .ok_or_else(|| Error::UnknownImport(format!("bad program reference {module_ref:?}")))?;
    registry.resolve(id)
}

pub(crate) fn as_handle(value: &Value) -> Option<u32> {
    match value {
        Value::I32(v) => u32::try_from(*v).ok(),
        Value::I64(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

fn value_u32(value: &Value) -> Result<u32> {
    as_handle(value).ok_or_else(|| Error::Trap(format!("expected a small integer, got {value:?}")))
}

/// Either a Universe-style scalar or a UTXO reference, on both the input and
/// the return side of a transaction.
#[derive(Debug, Clone)]
pub enum CallValue {
    Value(Value),
    Utxo(UtxoId),
}

impl CallValue {
    pub fn as_utxo(&self) -> Option<UtxoId> {
        match self {
            CallValue::Utxo(id) => Some(*id),
            CallValue::Value(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CallValue::Value(Value::I64(v)) => Some(*v),
            CallValue::Value(Value::I32(v)) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

impl From<Value> for CallValue {
    fn from(value: Value) -> Self {
        CallValue::Value(value)
    }
}

impl From<UtxoId> for CallValue {
    fn from(value: UtxoId) -> Self {
        CallValue::Utxo(value)
    }
}

/// A UTXO visible to the transaction.
pub(crate) enum UtxoSlot {
    Live(UtxoInstance),
    Archived {
        code: ProgramId,
        entry_point: String,
        frame: SuspendedFrame,
        memory: Vec<u8>,
    },
    /// Temporarily taken out for dispatch; re-entrant use is an error.
    Busy,
}

/// Store data of the coordination instance: the staging area of a transaction.
pub(crate) struct TxState {
    pub shared: Shared,
    pub coordination: ProgramId,
    pub utxos: HashMap<UtxoId, UtxoSlot>,
    /// Coordination-scoped handle table plus its dedup reverse mapping.
    pub handles: HashMap<u32, UtxoId>,
    pub reverse: HashMap<UtxoId, u32>,
    /// Effect name to function-table index in the coordination instance.
    pub effect_handlers: HashMap<String, u32>,
}

impl HostCtx for TxState {
    fn shared(&self) -> &Shared {
        &self.shared
    }

    fn this_code(&self) -> ProgramId {
        self.coordination
    }
}

impl TxState {
    fn alloc_utxo_handle(&mut self, utxo: UtxoId) -> u32 {
        if let Some(handle) = self.reverse.get(&utxo) {
            return *handle;
        }
        let range = self.shared.lock().unwrap().config.handle_range;
        let handle = alloc_handle(range, |h| self.handles.contains_key(&h));
        self.handles.insert(handle, utxo);
        self.reverse.insert(utxo, handle);
        handle
    }

    /// Stage a Universe UTXO as a transaction input: archived slot, fresh
    /// handle, and its token set seeded into the transaction's token table.
    fn stage_input(&mut self, utxo: UtxoId, record: UtxoRecord) -> u32 {
        let mut shared = self.shared.lock().unwrap();
        for token in &record.tokens {
            let handle = shared.alloc_token_handle();
            shared.tokens.insert(
                handle,
                TokenSlot::Attached {
                    utxo,
                    token: token.clone(),
                },
            );
        }
        drop(shared);
        self.utxos.insert(
            utxo,
            UtxoSlot::Archived {
                code: record.program,
                entry_point: record.entry_point,
                frame: record.frame,
                memory: record.memory,
            },
        );
        self.alloc_utxo_handle(utxo)
    }
}

fn resolve_handle(caller: &Caller<TxState>, value: Option<&Value>) -> Result<UtxoId> {
    let handle = value.and_then(as_handle).ok_or(Error::UnknownHandle(0))?;
    caller
        .data()
        .handles
        .get(&handle)
        .copied()
        .ok_or(Error::UnknownHandle(handle))
}

/// Page an archived UTXO in before dispatching to it.
fn ensure_loaded(caller: &mut Caller<TxState>, utxo_id: UtxoId) -> Result<()> {
    if !matches!(
        caller.data().utxos.get(&utxo_id),
        Some(UtxoSlot::Archived { .. })
    ) {
        return Ok(());
    }
    let Some(UtxoSlot::Archived {
        code,
        entry_point,
        frame,
        memory,
    }) = caller.data_mut().utxos.remove(&utxo_id)
    else {
        return Err(Error::Trap("archived slot vanished".into()));
    };
    let shared = caller.data().shared.clone();
    let (registry, stack_region) = {
        let s = shared.lock().unwrap();
        (s.registry.clone(), s.config.stack_region)
    };
    let contract = registry.resolve(code)?;
    let instance = UtxoInstance::load(
        &shared,
        utxo_id,
        contract,
        &entry_point,
        frame,
        &memory,
        stack_region,
    )?;
    caller.data_mut().utxos.insert(utxo_id, UtxoSlot::Live(instance));
    Ok(())
}

/// Take the (unique) activation out of the table for the duration of a
/// dispatch, so the coordination's effect handlers can run re-entrantly.
fn with_instance<R>(
    caller: &mut Caller<TxState>,
    utxo_id: UtxoId,
    f: impl FnOnce(&mut Caller<TxState>, &mut UtxoInstance) -> Result<R>,
) -> Result<R> {
    ensure_loaded(caller, utxo_id)?;
    let slot = caller
        .data_mut()
        .utxos
        .insert(utxo_id, UtxoSlot::Busy)
        .ok_or(Error::UnknownHandle(0))?;
    let UtxoSlot::Live(mut utxo) = slot else {
        caller.data_mut().utxos.remove(&utxo_id);
        return Err(Error::BadState {
            op: "dispatch to",
            state: "busy",
        });
    };
    let result = f(caller, &mut utxo);
    caller.data_mut().utxos.insert(utxo_id, UtxoSlot::Live(utxo));
    result
}

/// Call a function out of the coordination's indirect table with an effect
/// payload chunked into 64-bit words.
fn call_table_function(
    caller: &mut Caller<TxState>,
    index: u32,
    payload: &[u8],
) -> Result<Vec<Value>> {
    let shared = caller.data().shared.clone();
    let table = caller
        .get_export("__indirect_function_table")
        .and_then(|e| e.into_table())
        .ok_or_else(|| {
            Error::BadModule("coordination module missing __indirect_function_table".into())
        })?;
    let value = table
        .get(caller.as_context(), index)
        .ok_or_else(|| Error::Trap(format!("handler index {index} out of table bounds")))?;
    let func = match value {
        Value::FuncRef(func) => func
            .func()
            .cloned()
            .ok_or_else(|| Error::Trap(format!("handler index {index} is null")))?,
        other => return Err(Error::Trap(format!("handler index {index} is {other:?}"))),
    };

    let ty = func.ty(caller.as_context());
    let params = ty.params().to_vec();
    if payload.len() != params.len() * 8 {
        return Err(Error::SizeMismatch {
            expected: (params.len() * 8) as u32,
            got: payload.len() as u32,
        });
    }
    let mut args = Vec::with_capacity(params.len());
    for (chunk, param) in payload.chunks(8).zip(&params) {
        let word = i64::from_le_bytes(chunk.try_into().unwrap());
        args.push(match param {
            wasmi::core::ValueType::I64 => Value::I64(word),
            wasmi::core::ValueType::I32 => Value::I32(word as i32),
            other => {
                return Err(Error::Trap(format!(
                    "unsupported handler parameter type {other:?}"
                )))
            }
        });
    }
    let num_outputs = ty.results().len();
    let mut outputs = vec![Value::I32(0); num_outputs];
    func.call(caller.as_context_mut(), &args, &mut outputs)
        .map_err(|e| take_failure(&shared, e))?;
    Ok(outputs)
}

/// Dispatch one raised effect to its installed handler and rewind the UTXO
/// with the handler's result.
fn handle_effect(
    caller: &mut Caller<TxState>,
    utxo: &mut UtxoInstance,
    frame: SuspendedFrame,
) -> Result<Step> {
    let shared = caller.data().shared.clone();
    let payload = utxo.read_memory(frame.data, frame.data_len)?;
    let index = caller
        .data()
        .effect_handlers
        .get(&frame.name)
        .copied()
        .ok_or_else(|| Error::UnhandledEffect(frame.name.clone()))?;
    let results = call_table_function(caller, index, &payload)?;
    let bytes = encode_values(&results);
    shared.lock().unwrap().push_log(
        ExchangeTag::Effect,
        utxo.code_id(),
        &frame.name,
        payload,
        bytes.clone(),
    );
    utxo.resume_effect(&frame, &bytes)
}

/// Loop a start/resume until the UTXO is actually yielded or returned,
/// resolving effect suspensions along the way.
fn drive_entry(
    caller: &mut Caller<TxState>,
    utxo: &mut UtxoInstance,
    mut step: Step,
) -> Result<Step> {
    loop {
        match step {
            Step::Suspended(frame) if frame.kind == SuspensionKind::Effect => {
                step = handle_effect(caller, utxo, frame)?;
            }
            other => return Ok(other),
        }
    }
}

fn log_yield(shared: &Shared, utxo: &mut UtxoInstance, step: &Step) -> Result<()> {
    if let Step::Suspended(frame) = step {
        let data = utxo.read_memory(frame.data, frame.data_len)?;
        shared.lock().unwrap().push_log(
            ExchangeTag::Yield,
            utxo.code_id(),
            &frame.name,
            Vec::new(),
            data,
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Coordination import adapters

pub(crate) fn op_new(
    caller: &mut Caller<TxState>,
    module_ref: &str,
    entry_point: &str,
    inputs: &[Value],
    outputs: &mut [Value],
    ret: Option<wasmi::core::ValueType>,
) -> Result<(), Trap> {
    let shared = caller.data().shared.clone();
    op_new_inner(caller, module_ref, entry_point, inputs, outputs, ret)
        .map_err(|e| host_trap(&shared, e))
}

fn op_new_inner(
    caller: &mut Caller<TxState>,
    module_ref: &str,
    entry_point: &str,
    inputs: &[Value],
    outputs: &mut [Value],
    ret: Option<wasmi::core::ValueType>,
) -> Result<()> {
    let shared = caller.data().shared.clone();
    let code = resolve_module_ref(&shared, module_ref, caller.data().coordination)?;
    let utxo_id = UtxoId::random();
    let stack_region = shared.lock().unwrap().config.stack_region;
    let mut utxo = UtxoInstance::new(&shared, utxo_id, code.clone(), entry_point, stack_region)?;

    let entry = shared.lock().unwrap().push_log(
        ExchangeTag::New,
        code.id(),
        entry_point,
        encode_values(inputs),
        Vec::new(),
    );
    let step = utxo.start(inputs)?;
    let step = drive_entry(caller, &mut utxo, step)?;
    log_yield(&shared, &mut utxo, &step)?;

    let handle = caller.data_mut().alloc_utxo_handle(utxo_id);
    caller
        .data_mut()
        .utxos
        .insert(utxo_id, UtxoSlot::Live(utxo));
    shared
        .lock()
        .unwrap()
        .set_log_output(entry, handle.to_le_bytes().to_vec());
    if let Some(slot) = outputs.first_mut() {
        *slot = imports::result_value(ret, u64::from(handle));
    }
    Ok(())
}

pub(crate) fn op_resume(
    caller: &mut Caller<TxState>,
    name: &str,
    inputs: &[Value],
) -> Result<(), Trap> {
    let shared = caller.data().shared.clone();
    op_resume_inner(caller, name, inputs).map_err(|e| host_trap(&shared, e))
}

fn op_resume_inner(caller: &mut Caller<TxState>, name: &str, inputs: &[Value]) -> Result<()> {
    let shared = caller.data().shared.clone();
    let utxo_id = resolve_handle(caller, inputs.first())?;
    let (ptr, len) = match (inputs.get(1), inputs.get(2)) {
        (Some(ptr), Some(len)) => (value_u32(ptr)?, value_u32(len)?),
        _ => {
            return Err(Error::Trap(format!(
                "{name} needs (handle, resume_arg_ptr, resume_arg_len)"
            )))
        }
    };
    let bytes = imports::read_bytes(caller, ptr, len)?;
    with_instance(caller, utxo_id, |caller, utxo| {
        shared.lock().unwrap().push_log(
            ExchangeTag::Resume,
            utxo.code_id(),
            name,
            bytes.clone(),
            Vec::new(),
        );
        let step = utxo.resume(&bytes)?;
        let step = drive_entry(caller, utxo, step)?;
        log_yield(&shared, utxo, &step)
    })
}

pub(crate) fn op_method(
    caller: &mut Caller<TxState>,
    tag: ExchangeTag,
    name: &str,
    inputs: &[Value],
    outputs: &mut [Value],
) -> Result<(), Trap> {
    let shared = caller.data().shared.clone();
    op_method_inner(caller, tag, name, inputs, outputs).map_err(|e| host_trap(&shared, e))
}

fn op_method_inner(
    caller: &mut Caller<TxState>,
    tag: ExchangeTag,
    name: &str,
    inputs: &[Value],
    outputs: &mut [Value],
) -> Result<()> {
    let shared = caller.data().shared.clone();
    let utxo_id = resolve_handle(caller, inputs.first())?;
    let args = inputs[1..].to_vec();
    with_instance(caller, utxo_id, |caller, utxo| {
        let entry = shared.lock().unwrap().push_log(
            tag,
            utxo.code_id(),
            name,
            encode_values(&args),
            Vec::new(),
        );
        let mut step = utxo.call_method(name, &args)?;
        let results = loop {
            match step {
                Step::Done(results) => break results,
                Step::Suspended(frame) if frame.kind == SuspensionKind::Effect => {
                    step = handle_effect(caller, utxo, frame)?;
                }
                Step::Suspended(_) => return Err(Error::NotQuiescent(name.to_owned())),
            }
        };
        if results.len() != outputs.len() {
            return Err(Error::Trap(format!("{name}: result arity mismatch")));
        }
        for (slot, value) in outputs.iter_mut().zip(&results) {
            *slot = value.clone();
        }
        shared
            .lock()
            .unwrap()
            .set_log_output(entry, encode_values(&results));
        if tag == ExchangeTag::Consume {
            utxo.mark_consumed();
            token::pool_tokens_of(&shared, utxo_id);
        }
        Ok(())
    })
}

pub(crate) fn op_status(
    caller: &mut Caller<TxState>,
    inputs: &[Value],
    outputs: &mut [Value],
    ret: Option<wasmi::core::ValueType>,
) -> Result<(), Trap> {
    let shared = caller.data().shared.clone();
    let result = (|| -> Result<bool> {
        let utxo_id = resolve_handle(caller, inputs.first())?;
        Ok(match caller.data().utxos.get(&utxo_id) {
            Some(UtxoSlot::Live(instance)) => instance.is_alive(),
            Some(UtxoSlot::Archived { .. }) | Some(UtxoSlot::Busy) => true,
            None => return Err(Error::UnknownHandle(0)),
        })
    })();
    let alive = result.map_err(|e| host_trap(&shared, e))?;
    if let Some(slot) = outputs.first_mut() {
        *slot = imports::result_value(ret, u64::from(alive));
    }
    Ok(())
}

pub(crate) fn op_event(
    caller: &mut Caller<TxState>,
    name: &str,
    inputs: &[Value],
) -> Result<(), Trap> {
    let coordination = caller.data().coordination;
    let shared = caller.data().shared.clone();
    shared.lock().unwrap().push_log(
        ExchangeTag::Event,
        coordination,
        name,
        encode_values(inputs),
        Vec::new(),
    );
    Ok(())
}

pub(crate) fn op_handle(
    caller: &mut Caller<TxState>,
    effect: &str,
    inputs: &[Value],
) -> Result<(), Trap> {
    let shared = caller.data().shared.clone();
    let index = inputs
        .first()
        .and_then(as_handle)
        .ok_or_else(|| host_trap(&shared, Error::Trap("handler install needs an index".into())))?;
    if index == 0 {
        caller.data_mut().effect_handlers.remove(effect);
    } else {
        caller
            .data_mut()
            .effect_handlers
            .insert(effect.to_owned(), index);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Whole-transaction entry

type TxDelta = BTreeMap<UtxoId, Option<UtxoRecord>>;

/// Execute one coordination entry point over a staged view of the Universe.
/// Nothing outside the returned delta may be applied by the caller.
pub(crate) fn run(
    utxo_records: &BTreeMap<UtxoId, UtxoRecord>,
    registry: &Arc<CodeCache>,
    config: &HostConfig,
    coordination: &Arc<ContractCode>,
    entry_point: &str,
    inputs: &[CallValue],
) -> Result<(CallValue, Vec<LogEntry>, TxDelta)> {
    let shared: Shared = Arc::new(Mutex::new(TxShared {
        registry: registry.clone(),
        coordination: coordination.id(),
        config: config.clone(),
        log: Vec::new(),
        tokens: HashMap::new(),
        failure: None,
    }));
    let mut state = TxState {
        shared: shared.clone(),
        coordination: coordination.id(),
        utxos: HashMap::new(),
        handles: HashMap::new(),
        reverse: HashMap::new(),
        effect_handlers: HashMap::new(),
    };

    // Coordination code sees handles, not objects: rewrite UTXO inputs.
    let mut wasm_inputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        wasm_inputs.push(match input {
            CallValue::Value(value) => value.clone(),
            CallValue::Utxo(id) => {
                // An unknown input UTXO has no handle yet, so unlike the
                // other UnknownHandle sites the 0 here stands for the whole
                // input, not a failed handle decode.
                let record = utxo_records
                    .get(id)
                    .cloned()
                    .ok_or(Error::UnknownHandle(0))?;
                let handle = state.stage_input(*id, record);
                Value::I64(i64::from(handle))
            }
        });
    }

    debug!("run_transaction({entry_point:?}, {inputs:?})");
    let engine = Engine::default();
    let module = coordination.module(&engine)?;
    let linker = imports::coordination_linker(&engine, &module);
    let mut store = Store::new(&engine, state);
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| Error::BadModule(format!("instantiation: {e}")))?
        .ensure_no_start(&mut store)
        .map_err(|e| Error::BadModule(format!("instantiation: {e}")))?;
    let main = instance
        .get_func(&mut store, entry_point)
        .ok_or_else(|| Error::Trap(format!("no such entry point {entry_point:?}")))?;
    let num_outputs = main.ty(&store).results().len();
    let mut outputs = vec![Value::I32(0); num_outputs];
    main.call(&mut store, &wasm_inputs, &mut outputs)
        .map_err(|e| take_failure(&shared, e))?;

    let pending = shared.lock().unwrap().pending_intermediates();
    if pending > 0 {
        return Err(Error::UnresolvedIntermediate(pending));
    }

    let state = store.into_data();

    // If the scalar return names a live handle, surface the UTXO itself.
    let value = match outputs.first() {
        Some(value) => match as_handle(value).and_then(|h| state.handles.get(&h)) {
            Some(id) => CallValue::Utxo(*id),
            None => CallValue::Value(value.clone()),
        },
        None => CallValue::Value(Value::I32(0)),
    };

    let mut delta = TxDelta::new();
    for (id, slot) in state.utxos {
        match slot {
            UtxoSlot::Live(instance) => {
                if instance.is_alive() {
                    let program = instance.code_id();
                    let entry_point = instance.entry_point().to_owned();
                    let (frame, memory) = instance.unload()?;
                    let tokens = shared.lock().unwrap().attached_tokens_of(id);
                    delta.insert(
                        id,
                        Some(UtxoRecord {
                            program,
                            entry_point,
                            memory,
                            frame,
                            tokens,
                        }),
                    );
                } else {
                    delta.insert(id, None);
                }
            }
            UtxoSlot::Archived {
                code,
                entry_point,
                frame,
                memory,
            } => {
                let tokens = shared.lock().unwrap().attached_tokens_of(id);
                delta.insert(
                    id,
                    Some(UtxoRecord {
                        program: code,
                        entry_point,
                        memory,
                        frame,
                        tokens,
                    }),
                );
            }
            UtxoSlot::Busy => {
                return Err(Error::Trap("UTXO instance left busy at commit".into()))
            }
        }
    }

    let log = std::mem::take(&mut shared.lock().unwrap().log);
    Ok((value, log, delta))
}
