//! Effect handlers and role isolation.

use std::sync::Arc;

use starstream_host::{test_support::contracts, CallValue, ContractCode, Error, ExchangeTag, Universe};
use wasmi::Value;

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

fn i64_arg(v: i64) -> CallValue {
    CallValue::from(Value::I64(v))
}

fn oracle_world() -> (Universe, Arc<ContractCode>) {
    init_logging();
    let universe = Universe::new();
    let oracle = universe.code_cache().load(contracts::oracle()).unwrap();
    let coord = universe
        .code_cache()
        .load(contracts::coord_oracle(&oracle.id().to_string()))
        .unwrap();
    (universe, coord)
}

#[test]
fn handled_effect_uses_the_handler_result() {
    let (mut universe, coord) = oracle_world();
    let oracle = universe
        .run_transaction(&coord, "oracle_new", &[i64_arg(41)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();

    let receipt = universe
        .run_transaction(&coord, "ask_handled", &[CallValue::Utxo(oracle)])
        .unwrap();
    // The handler answers payload + 1.
    assert_eq!(receipt.value.as_i64(), Some(42));
    let effect = receipt
        .log
        .iter()
        .find(|e| e.tag == ExchangeTag::Effect)
        .expect("effect exchange logged");
    assert_eq!(effect.operation, "oracle_guard");
    assert_eq!(effect.input, 41i64.to_le_bytes().to_vec());
    assert_eq!(effect.output, 42i64.to_le_bytes().to_vec());
}

#[test]
fn unhandled_effect_fails_the_transaction() {
    let (mut universe, coord) = oracle_world();
    let oracle = universe
        .run_transaction(&coord, "oracle_new", &[i64_arg(41)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let snapshot = universe.utxos().clone();

    let err = universe
        .run_transaction(&coord, "ask_unhandled", &[CallValue::Utxo(oracle)])
        .unwrap_err();
    match err {
        Error::UnhandledEffect(name) => assert_eq!(name, "oracle_guard"),
        other => panic!("expected UnhandledEffect, got {other:?}"),
    }
    assert_eq!(universe.utxos(), &snapshot);
}

#[test]
fn handlers_do_not_leak_across_transactions() {
    let (mut universe, coord) = oracle_world();
    let oracle = universe
        .run_transaction(&coord, "oracle_new", &[i64_arg(7)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();

    universe
        .run_transaction(&coord, "ask_handled", &[CallValue::Utxo(oracle)])
        .unwrap();
    // The install from the previous transaction must be gone.
    let err = universe
        .run_transaction(&coord, "ask_unhandled", &[CallValue::Utxo(oracle)])
        .unwrap_err();
    assert!(matches!(err, Error::UnhandledEffect(_)), "got {err:?}");
}

#[test]
fn coordination_imports_are_refused_in_utxo_context() {
    init_logging();
    let mut universe = Universe::new();
    let bad = universe
        .code_cache()
        .load(contracts::context_violator())
        .unwrap();
    let coord = universe
        .code_cache()
        .load(contracts::coord_violator(&bad.id().to_string()))
        .unwrap();

    let err = universe.run_transaction(&coord, "go", &[]).unwrap_err();
    assert!(matches!(err, Error::WrongContext(_)), "got {err:?}");
    assert!(universe.utxos().is_empty());
}
