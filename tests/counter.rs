//! Lifecycle, persistence, and boundary behavior of a plain counter UTXO.

use std::sync::Arc;

use starstream_host::{test_support::contracts, CallValue, ContractCode, Error, ExchangeTag, Universe};
use wasmi::Value;

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

fn setup() -> (Universe, Arc<ContractCode>) {
    init_logging();
    let universe = Universe::new();
    let counter = universe.code_cache().load(contracts::counter()).unwrap();
    let coord = universe
        .code_cache()
        .load(contracts::coord_counter(&counter.id().to_string()))
        .unwrap();
    (universe, coord)
}

fn i64_arg(v: i64) -> CallValue {
    CallValue::from(Value::I64(v))
}

#[test]
fn lifecycle_across_transactions() {
    let (mut universe, coord) = setup();

    let receipt = universe
        .run_transaction(&coord, "make", &[i64_arg(5)])
        .unwrap();
    let id = receipt.value.as_utxo().expect("constructor returns the UTXO");
    assert_eq!(universe.utxos().len(), 1);
    let record = universe.utxo(id).unwrap();
    assert_eq!(record.entry_point, "starstream_new_counter_new");
    assert_eq!(record.frame.name, "Counter");
    assert_eq!(record.frame.resume_arg_len, 8);

    // A read-only transaction must leave the archived memory bit-identical.
    let before = record.memory.clone();
    let receipt = universe
        .run_transaction(&coord, "peek", &[CallValue::Utxo(id)])
        .unwrap();
    assert_eq!(receipt.value.as_i64(), Some(5));
    assert_eq!(universe.utxo(id).unwrap().memory, before);

    // Resume feeds the payload back into the counter.
    let receipt = universe
        .run_transaction(&coord, "bump", &[CallValue::Utxo(id), i64_arg(3)])
        .unwrap();
    assert_eq!(receipt.value.as_i64(), Some(8));

    // Mutate without a suspension.
    let receipt = universe
        .run_transaction(&coord, "add", &[CallValue::Utxo(id), i64_arg(2)])
        .unwrap();
    assert_eq!(receipt.value.as_i64(), Some(10));

    let receipt = universe
        .run_transaction(&coord, "check", &[CallValue::Utxo(id)])
        .unwrap();
    assert_eq!(receipt.value.as_i64(), Some(1));

    // Consume removes the UTXO from the Universe.
    let receipt = universe
        .run_transaction(&coord, "finish", &[CallValue::Utxo(id)])
        .unwrap();
    assert_eq!(receipt.value.as_i64(), Some(10));
    assert!(universe.utxos().is_empty());
}

#[test]
fn scalar_returns_stay_scalars() {
    let (mut universe, coord) = setup();
    let receipt = universe
        .run_transaction(&coord, "make_and_seven", &[i64_arg(1)])
        .unwrap();
    assert_eq!(receipt.value.as_i64(), Some(7));
    assert!(receipt.value.as_utxo().is_none());
    // The created UTXO still committed.
    assert_eq!(universe.utxos().len(), 1);
}

#[test]
fn terminal_on_creation() {
    let (mut universe, coord) = setup();
    universe
        .run_transaction(&coord, "make_dead", &[i64_arg(1)])
        .unwrap();
    assert!(universe.utxos().is_empty());

    // Resuming it in the same transaction is a lifecycle error.
    let err = universe
        .run_transaction(&coord, "make_dead_and_poke", &[i64_arg(1)])
        .unwrap_err();
    assert!(matches!(err, Error::BadState { .. }), "got {err:?}");
    assert!(universe.utxos().is_empty());
}

#[test]
fn wrong_size_resume_rolls_back() {
    let (mut universe, coord) = setup();
    let id = universe
        .run_transaction(&coord, "make", &[i64_arg(5)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let snapshot = universe.utxos().clone();

    let err = universe
        .run_transaction(&coord, "bad_resume", &[CallValue::Utxo(id)])
        .unwrap_err();
    assert!(
        matches!(err, Error::SizeMismatch { expected: 8, got: 4 }),
        "got {err:?}"
    );
    assert_eq!(universe.utxos(), &snapshot);
}

#[test]
fn yield_inside_query_is_rejected() {
    let (mut universe, coord) = setup();
    let id = universe
        .run_transaction(&coord, "make", &[i64_arg(5)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let snapshot = universe.utxos().clone();

    let err = universe
        .run_transaction(&coord, "sneak", &[CallValue::Utxo(id)])
        .unwrap_err();
    assert!(matches!(err, Error::NotQuiescent(_)), "got {err:?}");
    assert_eq!(universe.utxos(), &snapshot);
}

#[test]
fn handles_do_not_survive_transactions() {
    let (mut universe, coord) = setup();
    universe
        .run_transaction(&coord, "make", &[i64_arg(5)])
        .unwrap();

    // A raw integer that was never handed out this transaction.
    let err = universe
        .run_transaction(&coord, "peek", &[i64_arg(123_456)])
        .unwrap_err();
    assert!(matches!(err, Error::UnknownHandle(_)), "got {err:?}");
}

#[test]
fn missing_entry_point_fails_cleanly() {
    let (mut universe, coord) = setup();
    let err = universe
        .run_transaction(&coord, "no_such_export", &[])
        .unwrap_err();
    assert!(matches!(err, Error::Trap(_)), "got {err:?}");
    assert!(universe.utxos().is_empty());
}

#[test]
fn trace_records_exchanges_in_program_order() {
    let (mut universe, coord) = setup();
    let receipt = universe
        .run_transaction(&coord, "make", &[i64_arg(5)])
        .unwrap();
    let tags: Vec<ExchangeTag> = receipt.log.iter().map(|e| e.tag).collect();
    assert_eq!(tags, vec![ExchangeTag::New, ExchangeTag::Yield]);
    assert_eq!(receipt.log[0].operation, "starstream_new_counter_new");
    assert_eq!(receipt.log[0].input, 5i64.to_le_bytes().to_vec());
    assert_eq!(receipt.log[1].operation, "Counter");
    assert_eq!(receipt.log[1].output, 5i64.to_le_bytes().to_vec());

    let id = receipt.value.as_utxo().unwrap();
    let receipt = universe
        .run_transaction(&coord, "bump", &[CallValue::Utxo(id), i64_arg(3)])
        .unwrap();
    let tags: Vec<ExchangeTag> = receipt.log.iter().map(|e| e.tag).collect();
    assert_eq!(
        tags,
        vec![ExchangeTag::Resume, ExchangeTag::Yield, ExchangeTag::Query]
    );
    assert_eq!(receipt.log[0].input, 3i64.to_le_bytes().to_vec());
    assert_eq!(receipt.log[1].output, 8i64.to_le_bytes().to_vec());

    let diagram = receipt.to_mermaid_diagram();
    assert!(diagram.starts_with("sequenceDiagram"));
    assert!(diagram.contains("Root"));
}
