//! Token attachment, linear intermediates, and the NFT mint scenarios.

use std::sync::Arc;

use starstream_host::{test_support::contracts, CallValue, ContractCode, Error, Universe, UtxoId};
use wasmi::Value;

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

fn i64_arg(v: i64) -> CallValue {
    CallValue::from(Value::I64(v))
}

struct VaultWorld {
    universe: Universe,
    coord: Arc<ContractCode>,
}

fn vault_world() -> VaultWorld {
    init_logging();
    let universe = Universe::new();
    let token = universe.code_cache().load(contracts::star_token()).unwrap();
    let vault = universe
        .code_cache()
        .load(contracts::vault(&token.id().to_string()))
        .unwrap();
    let coord = universe
        .code_cache()
        .load(contracts::coord_vault(&vault.id().to_string()))
        .unwrap();
    VaultWorld { universe, coord }
}

fn total_attached_tokens(universe: &Universe) -> usize {
    universe.utxos().values().map(|r| r.tokens.len()).sum()
}

#[test]
fn mint_attaches_to_the_enclosing_utxo() {
    let VaultWorld { mut universe, coord } = vault_world();

    let receipt = universe
        .run_transaction(&coord, "vault_new", &[i64_arg(77)])
        .unwrap();
    let id = receipt.value.as_utxo().unwrap();
    let record = universe.utxo(id).unwrap();
    assert_eq!(record.tokens.len(), 1);
    assert_eq!(record.tokens[0].id, 77);
    assert_eq!(record.tokens[0].amount, 1);
    assert_eq!(record.tokens[0].burn_fn, "starstream_burn_star");

    // The contract can enumerate its attachments.
    let receipt = universe
        .run_transaction(&coord, "count", &[CallValue::Utxo(id)])
        .unwrap();
    assert_eq!(receipt.value.as_i64(), Some(1));
}

#[test]
fn consume_transfers_tokens() {
    let VaultWorld { mut universe, coord } = vault_world();

    let a = universe
        .run_transaction(&coord, "vault_new", &[i64_arg(42)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();

    let b = universe
        .run_transaction(&coord, "move_token", &[CallValue::Utxo(a)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    assert_ne!(a, b);
    assert!(universe.utxo(a).is_none(), "consumed vault must be gone");
    let record = universe.utxo(b).unwrap();
    assert_eq!(record.tokens.len(), 1);
    assert_eq!(record.tokens[0].id, 42);
    assert_eq!(record.tokens[0].amount, 1);
    assert_eq!(total_attached_tokens(&universe), 1);
}

#[test]
fn unresolved_intermediate_fails_the_transaction() {
    let VaultWorld { mut universe, coord } = vault_world();

    let a = universe
        .run_transaction(&coord, "vault_new", &[i64_arg(1)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let snapshot = universe.utxos().clone();

    let err = universe
        .run_transaction(&coord, "abandon", &[CallValue::Utxo(a)])
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedIntermediate(1)), "got {err:?}");
    assert_eq!(universe.utxos(), &snapshot);
}

#[test]
fn pending_intermediates_can_be_burned() {
    let VaultWorld { mut universe, coord } = vault_world();

    let a = universe
        .run_transaction(&coord, "vault_new", &[i64_arg(1)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let helper = universe
        .run_transaction(&coord, "vault_new", &[i64_arg(2)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();

    universe
        .run_transaction(&coord, "discard", &[CallValue::Utxo(a), CallValue::Utxo(helper)])
        .unwrap();
    assert!(universe.utxo(a).is_none());
    assert_eq!(universe.utxo(helper).unwrap().tokens.len(), 1);
    assert_eq!(total_attached_tokens(&universe), 1);
}

#[test]
fn burn_function_must_match_the_mint() {
    let VaultWorld { mut universe, coord } = vault_world();

    let a = universe
        .run_transaction(&coord, "vault_new", &[i64_arg(9)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let snapshot = universe.utxos().clone();

    let err = universe
        .run_transaction(&coord, "bad_release", &[CallValue::Utxo(a)])
        .unwrap_err();
    assert!(matches!(err, Error::BurnFnMismatch { .. }), "got {err:?}");
    assert_eq!(universe.utxos(), &snapshot);
}

struct NftWorld {
    universe: Universe,
    coord: Arc<ContractCode>,
}

fn nft_world() -> NftWorld {
    init_logging();
    let universe = Universe::new();
    let token = universe.code_cache().load(contracts::star_token()).unwrap();
    let nft = universe
        .code_cache()
        .load(contracts::nft_mint(&token.id().to_string()))
        .unwrap();
    let p2pkh = universe
        .code_cache()
        .load(contracts::pay_to_key(&token.id().to_string()))
        .unwrap();
    let coord = universe
        .code_cache()
        .load(contracts::coord_nft(
            &nft.id().to_string(),
            &p2pkh.id().to_string(),
        ))
        .unwrap();
    NftWorld { universe, coord }
}

fn pay_to_key_ids(universe: &Universe) -> Vec<UtxoId> {
    universe
        .utxos()
        .iter()
        .filter(|(_, r)| r.entry_point == "starstream_new_p2pkh_new")
        .map(|(id, _)| *id)
        .collect()
}

#[test]
fn mint_nfts_up_to_supply() {
    let NftWorld { mut universe, coord } = nft_world();
    let contract = universe
        .run_transaction(&coord, "nft_new", &[i64_arg(10)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();

    universe
        .run_transaction(
            &coord,
            "mint_up_to",
            &[CallValue::Utxo(contract), i64_arg(3), i64_arg(900)],
        )
        .unwrap();

    let outputs = pay_to_key_ids(&universe);
    assert_eq!(outputs.len(), 3);
    let mut nft_ids: Vec<u64> = outputs
        .iter()
        .map(|id| {
            let record = universe.utxo(*id).unwrap();
            assert_eq!(record.tokens.len(), 1);
            record.tokens[0].id
        })
        .collect();
    nft_ids.sort_unstable();
    assert_eq!(nft_ids, vec![1, 2, 3]);
    for id in &outputs {
        let owner = universe
            .run_transaction(&coord, "owner_of", &[CallValue::Utxo(*id)])
            .unwrap();
        assert_eq!(owner.value.as_i64(), Some(900));
    }

    let supply = universe
        .run_transaction(&coord, "supply", &[CallValue::Utxo(contract)])
        .unwrap();
    assert_eq!(supply.value.as_i64(), Some(3));
    assert!(universe.utxo(contract).is_some(), "mint contract stays alive");
}

#[test]
fn mint_single_nft_after_batch() {
    let NftWorld { mut universe, coord } = nft_world();
    let contract = universe
        .run_transaction(&coord, "nft_new", &[i64_arg(10)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    universe
        .run_transaction(
            &coord,
            "mint_up_to",
            &[CallValue::Utxo(contract), i64_arg(3), i64_arg(900)],
        )
        .unwrap();

    let fresh = universe
        .run_transaction(
            &coord,
            "mint_to",
            &[CallValue::Utxo(contract), i64_arg(901)],
        )
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    assert_eq!(universe.utxo(fresh).unwrap().tokens[0].id, 4);
    let supply = universe
        .run_transaction(&coord, "supply", &[CallValue::Utxo(contract)])
        .unwrap();
    assert_eq!(supply.value.as_i64(), Some(4));
}

#[test]
fn transfer_preserves_the_token_multiset() {
    let NftWorld { mut universe, coord } = nft_world();
    let contract = universe
        .run_transaction(&coord, "nft_new", &[i64_arg(10)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let original = universe
        .run_transaction(&coord, "mint_to", &[CallValue::Utxo(contract), i64_arg(900)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let tokens_before = universe.utxo(original).unwrap().tokens.clone();

    let moved = universe
        .run_transaction(
            &coord,
            "transfer",
            &[CallValue::Utxo(original), i64_arg(902)],
        )
        .unwrap()
        .value
        .as_utxo()
        .unwrap();

    assert!(universe.utxo(original).is_none());
    assert_eq!(universe.utxo(moved).unwrap().tokens, tokens_before);
    let owner = universe
        .run_transaction(&coord, "owner_of", &[CallValue::Utxo(moved)])
        .unwrap();
    assert_eq!(owner.value.as_i64(), Some(902));
    assert_eq!(total_attached_tokens(&universe), 1);
}

#[test]
fn leaked_prepare_rolls_everything_back() {
    let NftWorld { mut universe, coord } = nft_world();
    let contract = universe
        .run_transaction(&coord, "nft_new", &[i64_arg(10)])
        .unwrap()
        .value
        .as_utxo()
        .unwrap();
    let snapshot = universe.utxos().clone();

    let err = universe
        .run_transaction(&coord, "leak", &[CallValue::Utxo(contract)])
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedIntermediate(1)), "got {err:?}");
    assert_eq!(universe.utxos(), &snapshot);

    let supply = universe
        .run_transaction(&coord, "supply", &[CallValue::Utxo(contract)])
        .unwrap();
    assert_eq!(supply.value.as_i64(), Some(0));
}
