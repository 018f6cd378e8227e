//! Tokens and the linear intermediates that move them between UTXOs.
//!
//! Mint and burn each instantiate a fresh token-mint instance; tokens persist
//! only as `(id, amount)` records attached to a UTXO, so nothing of the token
//! instance's memory needs to survive the call.

use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use log::trace;
use wasmi::{Caller, Engine, Instance, Store, Value};

use crate::{
    code::{ContractCode, ProgramId},
    error::{Error, Result},
    imports::{self, HostCtx},
    trace::{encode_values, ExchangeTag},
    transaction::{resolve_module_ref, take_failure, Shared},
    utxo::{UtxoHost, UtxoId},
};

/// A token record: which program minted it, how to burn it, and its canonical
/// `(id, amount)` storage pair.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub program: ProgramId,
    pub burn_fn: String,
    pub id: u64,
    pub amount: u64,
}

/// What a token handle currently names within a transaction.
#[derive(Debug, Clone)]
pub(crate) enum TokenSlot {
    /// Attached to a UTXO's token set.
    Attached { utxo: UtxoId, token: Token },
    /// A detached linear intermediate; must be re-minted or burned before the
    /// coordination returns.
    Pending(Token),
}

/// Store data for a token-mint instance.
pub(crate) struct TokenHost {
    pub shared: Shared,
    pub this_code: ProgramId,
}

impl HostCtx for TokenHost {
    fn shared(&self) -> &Shared {
        &self.shared
    }

    fn this_code(&self) -> ProgramId {
        self.this_code
    }
}

/// Fixed linear-memory offset where mint functions write their storage pair.
pub(crate) const TOKEN_RETURN_SLOT: u32 = 16;

fn fresh_instance(
    shared: &Shared,
    code: &Arc<ContractCode>,
) -> Result<(Store<TokenHost>, Instance)> {
    let engine = Engine::default();
    let module = code.module(&engine)?;
    let mut store = Store::new(
        &engine,
        TokenHost {
            shared: shared.clone(),
            this_code: code.id(),
        },
    );
    let linker = imports::token_linker(&engine, &module);
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| Error::BadModule(format!("instantiation: {e}")))?
        .ensure_no_start(&mut store)
        .map_err(|e| Error::BadModule(format!("instantiation: {e}")))?;
    Ok((store, instance))
}

fn call_export(
    shared: &Shared,
    store: &mut Store<TokenHost>,
    instance: Instance,
    name: &str,
    inputs: &[Value],
) -> Result<()> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| Error::Trap(format!("no such export {name}")))?;
    let num_outputs = func.ty(&*store).results().len();
    let mut outputs = vec![Value::I32(0); num_outputs];
    func.call(&mut *store, inputs, &mut outputs)
        .map_err(|e| take_failure(shared, e))
}

/// Run a mint function in a fresh instance and read the storage pair back
/// from the fixed return slot.
fn run_mint(
    shared: &Shared,
    code: &Arc<ContractCode>,
    mint_fn: &str,
    args: &[Value],
) -> Result<(u64, u64)> {
    let (mut store, instance) = fresh_instance(shared, code)?;
    let inputs: Vec<Value> = std::iter::once(Value::I32(TOKEN_RETURN_SLOT as i32))
        .chain(args.iter().cloned())
        .collect();
    call_export(shared, &mut store, instance, mint_fn, &inputs)?;

    let memory = instance
        .get_export(&store, "memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| Error::BadModule("token module missing export memory".into()))?;
    let data = memory.data(&store);
    let mut cursor = data
        .get(TOKEN_RETURN_SLOT as usize..)
        .ok_or_else(|| Error::Trap("token return slot out of bounds".into()))?;
    let id = cursor
        .read_u64::<LittleEndian>()
        .map_err(|e| Error::Trap(e.to_string()))?;
    let amount = cursor
        .read_u64::<LittleEndian>()
        .map_err(|e| Error::Trap(e.to_string()))?;
    Ok((id, amount))
}

fn run_burn(shared: &Shared, code: &Arc<ContractCode>, token: &Token) -> Result<()> {
    let (mut store, instance) = fresh_instance(shared, code)?;
    call_export(
        shared,
        &mut store,
        instance,
        &token.burn_fn,
        &[Value::I64(token.id as i64), Value::I64(token.amount as i64)],
    )
}

fn as_handle(value: &Value) -> Option<u32> {
    match value {
        Value::I32(v) => u32::try_from(*v).ok(),
        Value::I64(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

/// `starstream_token:{id}.starstream_mint_*` from a UTXO context.
///
/// A first argument naming a pending intermediate of the same token type is a
/// reattachment and consumes the intermediate; anything else is a fresh mint.
/// Either way the mint function runs in a fresh instance and the resulting
/// token attaches to the enclosing UTXO.
pub(crate) fn mint_import(
    caller: &mut Caller<UtxoHost>,
    module_ref: &str,
    mint_fn: &str,
    inputs: &[Value],
) -> Result<u32> {
    let shared = caller.data().shared.clone();
    let this_code = caller.data().this_code;
    let utxo = caller.data().utxo;
    let code = resolve_module_ref(&shared, module_ref, this_code)?;
    let burn_fn = mint_fn.replacen("starstream_mint_", "starstream_burn_", 1);

    let reattach = inputs.first().and_then(as_handle).and_then(|handle| {
        let s = shared.lock().unwrap();
        match s.tokens.get(&handle) {
            Some(TokenSlot::Pending(t)) if t.program == code.id() && t.burn_fn == burn_fn => {
                Some((handle, t.clone()))
            }
            _ => None,
        }
    });

    let (id, amount) = match &reattach {
        Some((_, t)) => run_mint(
            &shared,
            &code,
            mint_fn,
            &[Value::I64(t.id as i64), Value::I64(t.amount as i64)],
        )?,
        None => run_mint(&shared, &code, mint_fn, inputs)?,
    };

    let mut s = shared.lock().unwrap();
    if let Some((handle, _)) = reattach {
        s.tokens.remove(&handle);
    }
    let token = Token {
        program: code.id(),
        burn_fn,
        id,
        amount,
    };
    trace!("mint {token:?} -> {utxo:?}");
    let handle = s.alloc_token_handle();
    s.tokens.insert(handle, TokenSlot::Attached { utxo, token });
    s.push_log(
        ExchangeTag::Mint,
        code.id(),
        mint_fn,
        encode_values(inputs),
        handle.to_le_bytes().to_vec(),
    );
    Ok(handle)
}

/// `starstream_token:{id}.starstream_burn_*` from a UTXO context.
///
/// On a token attached to the enclosing UTXO: run the burn function, detach
/// the token into the pending-intermediate pool, and return its handle. On a
/// pending intermediate: destroy it.
pub(crate) fn burn_import(
    caller: &mut Caller<UtxoHost>,
    module_ref: &str,
    burn_fn: &str,
    inputs: &[Value],
) -> Result<u64> {
    let shared = caller.data().shared.clone();
    let this_code = caller.data().this_code;
    let this_utxo = caller.data().utxo;
    let code = resolve_module_ref(&shared, module_ref, this_code)?;

    let handle = inputs
        .first()
        .and_then(as_handle)
        .ok_or(Error::UnknownHandle(0))?;
    let slot = shared
        .lock()
        .unwrap()
        .tokens
        .get(&handle)
        .cloned()
        .ok_or(Error::UnknownHandle(handle))?;

    match slot {
        TokenSlot::Attached { utxo, token } => {
            if utxo != this_utxo || token.program != code.id() {
                return Err(Error::UnknownHandle(handle));
            }
            if token.burn_fn != burn_fn {
                return Err(Error::BurnFnMismatch {
                    expected: token.burn_fn,
                    got: burn_fn.to_owned(),
                });
            }
            run_burn(&shared, &code, &token)?;
            trace!("burn {token:?} -> pending");
            let mut s = shared.lock().unwrap();
            s.tokens.insert(handle, TokenSlot::Pending(token));
            s.push_log(
                ExchangeTag::Burn,
                code.id(),
                burn_fn,
                handle.to_le_bytes().to_vec(),
                handle.to_le_bytes().to_vec(),
            );
            Ok(u64::from(handle))
        }
        TokenSlot::Pending(token) => {
            if token.burn_fn != burn_fn {
                return Err(Error::BurnFnMismatch {
                    expected: token.burn_fn,
                    got: burn_fn.to_owned(),
                });
            }
            trace!("burn pending {token:?}");
            let mut s = shared.lock().unwrap();
            s.tokens.remove(&handle);
            s.push_log(
                ExchangeTag::Burn,
                code.id(),
                burn_fn,
                handle.to_le_bytes().to_vec(),
                Vec::new(),
            );
            Ok(0)
        }
    }
}

/// `starstream_utxo_env.starstream_get_tokens`: write the enclosing UTXO's
/// attached token handles into memory as little-endian u32 words.
pub(crate) fn get_tokens_import(
    caller: &mut Caller<UtxoHost>,
    data: u32,
    max: u32,
    skip: u32,
) -> Result<u32> {
    let shared = caller.data().shared.clone();
    let this_utxo = caller.data().utxo;
    let handles = {
        let s = shared.lock().unwrap();
        let mut handles: Vec<u32> = s
            .tokens
            .iter()
            .filter(|(_, slot)| {
                matches!(slot, TokenSlot::Attached { utxo, .. } if *utxo == this_utxo)
            })
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();
        handles
    };
    let mut raw = Vec::new();
    let mut count = 0;
    for handle in handles.iter().skip(skip as usize).take(max as usize) {
        raw.extend_from_slice(&handle.to_le_bytes());
        count += 1;
    }
    imports::write_bytes(caller, data, &raw)?;
    Ok(count)
}

/// Detach every token still attached to a consumed UTXO into the pending pool.
pub(crate) fn pool_tokens_of(shared: &Shared, utxo: UtxoId) -> usize {
    let mut s = shared.lock().unwrap();
    let mut moved = 0;
    for slot in s.tokens.values_mut() {
        let detached = match &*slot {
            TokenSlot::Attached { utxo: owner, token } if *owner == utxo => token.clone(),
            _ => continue,
        };
        *slot = TokenSlot::Pending(detached);
        moved += 1;
    }
    moved
}
