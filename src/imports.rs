//! Import routing: each contract role gets a linker whose host imports match
//! the role's allowed surface. Imports outside the role are installed as trap
//! stubs so that a single .wasm module can carry code for several roles and
//! only fail when a forbidden import is actually invoked.

use log::{info, trace};
use wasmi::{
    core::Trap, AsContextMut, Caller, Engine, ExternType, FuncType, ImportType, Linker, Module,
    Value,
};

use crate::{
    code::ProgramId,
    error::Error,
    token,
    transaction::{host_trap, Shared, TxState},
    utxo::{self, SuspensionKind, UtxoHost},
};

/// Store data that every role shares: the transaction-wide state plus the
/// identity of the code the instance is running.
pub(crate) trait HostCtx: Send + 'static {
    fn shared(&self) -> &Shared;
    fn this_code(&self) -> ProgramId;
}

pub(crate) fn memory<'a, T>(caller: &'a mut Caller<T>) -> Option<(&'a mut [u8], &'a mut T)> {
    Some(
        caller
            .get_export("memory")?
            .into_memory()?
            .data_and_store_mut(caller.as_context_mut()),
    )
}

pub(crate) fn read_bytes<T: HostCtx>(
    caller: &mut Caller<T>,
    addr: u32,
    len: u32,
) -> Result<Vec<u8>, Error> {
    let Some((memory, _)) = memory(caller) else {
        return Err(Error::BadModule("no memory export".into()));
    };
    memory
        .get(addr as usize..addr as usize + len as usize)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::Trap(format!("read {addr:#x}+{len} out of bounds")))
}

pub(crate) fn write_bytes<T: HostCtx>(
    caller: &mut Caller<T>,
    addr: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    let Some((memory, _)) = memory(caller) else {
        return Err(Error::BadModule("no memory export".into()));
    };
    match memory.get_mut(addr as usize..addr as usize + bytes.len()) {
        Some(slice) => {
            slice.copy_from_slice(bytes);
            Ok(())
        }
        None => Err(Error::Trap(format!(
            "write {addr:#x}+{} out of bounds",
            bytes.len()
        ))),
    }
}

/// Install an import that fails with the given error when invoked.
fn stub_import<T: HostCtx>(linker: &mut Linker<T>, import: &ImportType, error: Error) {
    if let ExternType::Func(func) = import.ty() {
        let r = linker.func_new(
            import.module(),
            import.name(),
            func.clone(),
            move |caller: Caller<T>, _inputs, _outputs| {
                Err(host_trap(caller.data().shared(), error.clone()))
            },
        );
        if !matches!(
            r,
            Err(wasmi::errors::LinkerError::DuplicateDefinition { .. })
        ) {
            r.unwrap();
        }
    }
}

fn wrong_context(import: &ImportType, role: &str) -> Error {
    Error::WrongContext(format!(
        "{}:{} is not available in {role} context",
        import.module(),
        import.name()
    ))
}

fn unknown_import(import: &ImportType) -> Error {
    Error::UnknownImport(format!("{}:{}", import.module(), import.name()))
}

/// Fulfiller of imports from `env`, common to all roles.
fn install_env<T: HostCtx>(linker: &mut Linker<T>) {
    linker
        .func_wrap("env", "abort", |caller: Caller<T>| -> Result<(), Trap> {
            Err(host_trap(
                caller.data().shared(),
                Error::Trap("contract called abort()".to_owned()),
            ))
        })
        .unwrap();
    linker
        .func_wrap(
            "env",
            "starstream_this_code",
            |mut caller: Caller<T>, return_addr: u32| -> Result<(), Trap> {
                trace!("starstream_this_code({return_addr:#x})");
                let hash = caller.data().this_code().raw();
                write_bytes(&mut caller, return_addr, &hash)
                    .map_err(|e| host_trap(caller.data().shared(), e))
            },
        )
        .unwrap();
    linker
        .func_wrap(
            "env",
            "starstream_coordination_code",
            |mut caller: Caller<T>, return_addr: u32| -> Result<(), Trap> {
                trace!("starstream_coordination_code({return_addr:#x})");
                let hash = caller.data().shared().lock().unwrap().coordination.raw();
                write_bytes(&mut caller, return_addr, &hash)
                    .map_err(|e| host_trap(caller.data().shared(), e))
            },
        )
        .unwrap();
}

/// `env.starstream_log` is diagnostic-only and untyped; install it against
/// whatever signature the module declares.
fn install_log<T: HostCtx>(linker: &mut Linker<T>, ty: FuncType) {
    let r = linker.func_new(
        "env",
        "starstream_log",
        ty,
        |_caller: Caller<T>, inputs, _outputs| {
            info!(target: "program", "starstream_log{inputs:?}");
            Ok(())
        },
    );
    if !matches!(
        r,
        Err(wasmi::errors::LinkerError::DuplicateDefinition { .. })
    ) {
        r.unwrap();
    }
}

/// First result type of an import, for writing handles back to the guest.
fn scalar_result(ty: &FuncType) -> Option<wasmi::core::ValueType> {
    ty.results().first().copied()
}

pub(crate) fn result_value(ty: Option<wasmi::core::ValueType>, raw: u64) -> Value {
    match ty {
        Some(wasmi::core::ValueType::I32) => Value::I32(raw as i32),
        _ => Value::I64(raw as i64),
    }
}

/// Linker for UTXO-role instances: `env`, `starstream_utxo_env`, and
/// `starstream_token:*` adapters; everything else is a stub.
pub(crate) fn utxo_linker(engine: &Engine, module: &Module) -> Linker<UtxoHost> {
    let mut linker = Linker::<UtxoHost>::new(engine);

    install_env(&mut linker);

    linker
        .func_wrap(
            "starstream_utxo_env",
            "starstream_yield",
            |mut caller: Caller<UtxoHost>,
             name: u32,
             name_len: u32,
             data: u32,
             data_len: u32,
             resume_arg: u32,
             resume_arg_len: u32|
             -> Result<(), Trap> {
                trace!("starstream_yield()");
                utxo::suspension_import(
                    &mut caller,
                    SuspensionKind::Yield,
                    (name, name_len),
                    (data, data_len),
                    (resume_arg, resume_arg_len),
                )
            },
        )
        .unwrap();

    linker
        .func_wrap(
            "starstream_utxo_env",
            "starstream_raise",
            |mut caller: Caller<UtxoHost>,
             name: u32,
             name_len: u32,
             data: u32,
             data_len: u32,
             resume_arg: u32,
             resume_arg_len: u32|
             -> Result<(), Trap> {
                trace!("starstream_raise()");
                utxo::suspension_import(
                    &mut caller,
                    SuspensionKind::Effect,
                    (name, name_len),
                    (data, data_len),
                    (resume_arg, resume_arg_len),
                )
            },
        )
        .unwrap();

    linker
        .func_wrap(
            "starstream_utxo_env",
            "starstream_get_tokens",
            |mut caller: Caller<UtxoHost>, data: u32, max: u32, skip: u32| -> Result<u32, Trap> {
                trace!("starstream_get_tokens({data:#x}, {max}, {skip})");
                token::get_tokens_import(&mut caller, data, max, skip)
                    .map_err(|e| host_trap(caller.data().shared(), e))
            },
        )
        .unwrap();

    for import in module.imports() {
        let ExternType::Func(func_ty) = import.ty() else {
            continue;
        };
        if import.module() == "env" {
            if import.name() == "starstream_log" {
                install_log(&mut linker, func_ty.clone());
            }
        } else if import.module() == "starstream_utxo_env" {
            match import.name() {
                "starstream_yield" | "starstream_raise" | "starstream_get_tokens" => {}
                _ => stub_import(&mut linker, &import, unknown_import(&import)),
            }
        } else if let Some(rest) = import.module().strip_prefix("starstream_token:") {
            let rest = rest.to_owned();
            let name = import.name().to_owned();
            let ret = scalar_result(func_ty);
            if name.starts_with("starstream_mint_") {
                linker
                    .func_new(
                        import.module(),
                        import.name(),
                        func_ty.clone(),
                        move |mut caller: Caller<UtxoHost>, inputs, outputs| {
                            trace!("{rest}::{name}{inputs:?}");
                            let handle = token::mint_import(&mut caller, &rest, &name, inputs)
                                .map_err(|e| host_trap(caller.data().shared(), e))?;
                            if let Some(slot) = outputs.first_mut() {
                                *slot = result_value(ret, u64::from(handle));
                            }
                            Ok(())
                        },
                    )
                    .unwrap();
            } else if name.starts_with("starstream_burn_") {
                linker
                    .func_new(
                        import.module(),
                        import.name(),
                        func_ty.clone(),
                        move |mut caller: Caller<UtxoHost>, inputs, outputs| {
                            trace!("{rest}::{name}{inputs:?}");
                            let payload = token::burn_import(&mut caller, &rest, &name, inputs)
                                .map_err(|e| host_trap(caller.data().shared(), e))?;
                            if let Some(slot) = outputs.first_mut() {
                                *slot = result_value(ret, payload);
                            }
                            Ok(())
                        },
                    )
                    .unwrap();
            } else {
                stub_import(&mut linker, &import, unknown_import(&import));
            }
        } else if import.module().starts_with("starstream_utxo:") {
            stub_import(&mut linker, &import, wrong_context(&import, "UTXO"));
        } else {
            stub_import(&mut linker, &import, unknown_import(&import));
        }
    }

    linker
}

/// Linker for token-mint instances: `env` only.
pub(crate) fn token_linker(engine: &Engine, module: &Module) -> Linker<token::TokenHost> {
    let mut linker = Linker::<token::TokenHost>::new(engine);

    install_env(&mut linker);

    for import in module.imports() {
        let ExternType::Func(func_ty) = import.ty() else {
            continue;
        };
        if import.module() == "env" {
            if import.name() == "starstream_log" {
                install_log(&mut linker, func_ty.clone());
            }
        } else if import.module() == "starstream_utxo_env"
            || import.module().starts_with("starstream_utxo:")
            || import.module().starts_with("starstream_token:")
        {
            stub_import(&mut linker, &import, wrong_context(&import, "token"));
        } else {
            stub_import(&mut linker, &import, unknown_import(&import));
        }
    }

    linker
}

/// Linker for the coordination script: `env` plus the `starstream_utxo:*`
/// operation adapters, pattern-matched on export-name prefixes.
pub(crate) fn coordination_linker(engine: &Engine, module: &Module) -> Linker<TxState> {
    let mut linker = Linker::<TxState>::new(engine);

    install_env(&mut linker);

    for import in module.imports() {
        let ExternType::Func(func_ty) = import.ty() else {
            continue;
        };
        if import.module() == "env" {
            if import.name() == "starstream_log" {
                install_log(&mut linker, func_ty.clone());
            }
            continue;
        }
        let Some(rest) = import.module().strip_prefix("starstream_utxo:") else {
            if import.module() == "starstream_utxo_env"
                || import.module().starts_with("starstream_token:")
            {
                stub_import(&mut linker, &import, wrong_context(&import, "coordination"));
            } else {
                stub_import(&mut linker, &import, unknown_import(&import));
            }
            continue;
        };
        let rest = rest.to_owned();
        let name = import.name().to_owned();
        let ret = scalar_result(func_ty);
        macro_rules! adapter {
            ($body:expr) => {
                linker
                    .func_new(import.module(), import.name(), func_ty.clone(), $body)
                    .unwrap()
            };
        }
        if name.starts_with("starstream_new_") {
            adapter!(move |mut caller: Caller<TxState>, inputs, outputs| {
                trace!("{rest}::{name}{inputs:?}");
                crate::transaction::op_new(&mut caller, &rest, &name, inputs, outputs, ret)
            });
        } else if name.starts_with("starstream_resume_") {
            adapter!(move |mut caller: Caller<TxState>, inputs, _outputs| {
                trace!("{name}{inputs:?}");
                crate::transaction::op_resume(&mut caller, &name, inputs)
            });
        } else if name.starts_with("starstream_query_") {
            adapter!(move |mut caller: Caller<TxState>, inputs, outputs| {
                trace!("{rest}::{name}{inputs:?}");
                crate::transaction::op_method(
                    &mut caller,
                    crate::trace::ExchangeTag::Query,
                    &name,
                    inputs,
                    outputs,
                )
            });
        } else if name.starts_with("starstream_mutate_") {
            adapter!(move |mut caller: Caller<TxState>, inputs, outputs| {
                trace!("{rest}::{name}{inputs:?}");
                crate::transaction::op_method(
                    &mut caller,
                    crate::trace::ExchangeTag::Mutate,
                    &name,
                    inputs,
                    outputs,
                )
            });
        } else if name.starts_with("starstream_consume_") {
            adapter!(move |mut caller: Caller<TxState>, inputs, outputs| {
                trace!("{rest}::{name}{inputs:?}");
                crate::transaction::op_method(
                    &mut caller,
                    crate::trace::ExchangeTag::Consume,
                    &name,
                    inputs,
                    outputs,
                )
            });
        } else if name.starts_with("starstream_status_") {
            adapter!(move |mut caller: Caller<TxState>, inputs, outputs| {
                trace!("{name}{inputs:?}");
                crate::transaction::op_status(&mut caller, inputs, outputs, ret)
            });
        } else if name.starts_with("starstream_event_") {
            adapter!(move |mut caller: Caller<TxState>, inputs, _outputs| {
                trace!("{name}{inputs:?}");
                crate::transaction::op_event(&mut caller, &name, inputs)
            });
        } else if name.starts_with("starstream_handle_") {
            let effect = name
                .strip_prefix("starstream_handle_")
                .unwrap_or_default()
                .to_owned();
            adapter!(move |mut caller: Caller<TxState>, inputs, _outputs| {
                trace!("{name}{inputs:?}");
                crate::transaction::op_handle(&mut caller, &effect, inputs)
            });
        } else {
            stub_import(&mut linker, &import, unknown_import(&import));
        }
    }

    linker
}
