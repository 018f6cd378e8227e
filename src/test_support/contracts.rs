#![allow(dead_code)]

//! Canned contracts used by the integration tests. Memory layout shared by
//! all of them: state cells from 2048, type-name strings from 3072, effect
//! views around 4096, the resume-argument view at 4224, scratch space at 8192.
//! Everything below 1024 is left to the host's asyncify save region.

use wasm_encoder::{BlockType, Instruction, ValType};

use super::wasm_dsl::{
    add_asyncify_exports, memarg32, memarg64, memarg64_at, FuncBuilder, FuncId, Local,
    ModuleBuilder,
};

pub const STATE: u32 = 2048;
pub const STATE2: u32 = 2056;
pub const NAME_PTR: u32 = 3072;
pub const EFFECT_NAME_PTR: u32 = 3100;
pub const EFFECT_DATA: u32 = 4096;
pub const EFFECT_RESUME: u32 = 4104;
pub const RESUME_PTR: u32 = 4224;
pub const SCRATCH: u32 = 8192;

const YIELD_PARAMS: [ValType; 6] = [ValType::I32; 6];

fn utxo_module(token_hex: Option<&str>) -> (ModuleBuilder, YieldImports) {
    let mut b = ModuleBuilder::new();
    let yield_fn = b.import_func("starstream_utxo_env", "starstream_yield", &YIELD_PARAMS, &[]);
    let raise_fn = b.import_func("starstream_utxo_env", "starstream_raise", &YIELD_PARAMS, &[]);
    let get_tokens = b.import_func(
        "starstream_utxo_env",
        "starstream_get_tokens",
        &[ValType::I32, ValType::I32, ValType::I32],
        &[ValType::I32],
    );
    let token = token_hex.map(|hex| {
        let module = format!("starstream_token:{hex}");
        TokenImports {
            mint_star: b.import_func(
                &module,
                "starstream_mint_star",
                &[ValType::I64, ValType::I64],
                &[ValType::I64],
            ),
            burn_star: b.import_func(&module, "starstream_burn_star", &[ValType::I64], &[ValType::I64]),
            burn_other: b.import_func(&module, "starstream_burn_other", &[ValType::I64], &[ValType::I64]),
        }
    });
    (
        b,
        YieldImports {
            yield_fn,
            raise_fn,
            get_tokens,
            token,
        },
    )
}

struct YieldImports {
    yield_fn: FuncId,
    raise_fn: FuncId,
    get_tokens: FuncId,
    token: Option<TokenImports>,
}

struct TokenImports {
    mint_star: FuncId,
    burn_star: FuncId,
    burn_other: FuncId,
}

/// Rediscover the UTXO's first attached token handle. Handles are
/// transaction-scoped, so anything stored across a yield is stale by the time
/// a later transaction consumes the UTXO.
fn push_first_token_handle(f: &mut FuncBuilder, get_tokens: FuncId) {
    f.i(Instruction::I32Const(SCRATCH as i32));
    f.i(Instruction::I32Const(1));
    f.i(Instruction::I32Const(0));
    f.call(get_tokens);
    f.i(Instruction::Drop);
    f.i(Instruction::I32Const(SCRATCH as i32));
    f.i(Instruction::I64Load32U(memarg32()));
}

/// A counter UTXO: yields its supply cell, adds each resume payload to it.
pub fn counter() -> Vec<u8> {
    let (mut b, im) = utxo_module(None);
    let state = add_asyncify_exports(&mut b);
    b.data(NAME_PTR, b"Counter");

    let mut f = FuncBuilder::new(1);
    f.unless_rewinding(state, |f| {
        f.store_i64(STATE, |f| {
            f.get(Local(0));
        });
    });
    f.yield_loop(
        im.yield_fn,
        state,
        (NAME_PTR, 7),
        (STATE, 8),
        (RESUME_PTR, 8),
        |f| {
            f.i(Instruction::I32Const(STATE as i32));
            f.load_i64(STATE);
            f.load_i64(RESUME_PTR);
            f.i(Instruction::I64Add);
            f.i(Instruction::I64Store(memarg64()));
        },
    );
    b.define(Some("starstream_new_counter_new"), &[ValType::I64], &[], f);

    // Returns without ever yielding: terminal on creation.
    let f = FuncBuilder::new(1);
    b.define(Some("starstream_new_counter_dead"), &[ValType::I64], &[], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.i(Instruction::I64Load(memarg64()));
    b.define(
        Some("starstream_query_counter_get_supply"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    let mut f = FuncBuilder::new(2);
    f.get(Local(0));
    f.get(Local(0));
    f.i(Instruction::I64Load(memarg64()));
    f.get(Local(1));
    f.i(Instruction::I64Add);
    f.i(Instruction::I64Store(memarg64()));
    b.define(
        Some("starstream_mutate_counter_add"),
        &[ValType::I32, ValType::I64],
        &[],
        f,
    );

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.i(Instruction::I64Load(memarg64()));
    b.define(
        Some("starstream_consume_counter_next"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    // A query that tries to yield.
    let mut f = FuncBuilder::new(1);
    for word in [NAME_PTR, 7, STATE, 8, RESUME_PTR, 8] {
        f.i(Instruction::I32Const(word as i32));
    }
    f.call(im.yield_fn);
    f.i(Instruction::I64Const(0));
    b.define(
        Some("starstream_query_counter_sneaky"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    b.finish()
}

/// The star token program: mint writes the storage pair to the return slot,
/// burn hands the amount back.
pub fn star_token() -> Vec<u8> {
    let mut b = ModuleBuilder::new();

    let mut f = FuncBuilder::new(3);
    f.get(Local(0));
    f.get(Local(1));
    f.i(Instruction::I64Store(memarg64()));
    f.get(Local(0));
    f.get(Local(2));
    f.i(Instruction::I64Store(memarg64_at(8)));
    b.define(
        Some("starstream_mint_star"),
        &[ValType::I32, ValType::I64, ValType::I64],
        &[],
        f,
    );

    let mut f = FuncBuilder::new(2);
    f.get(Local(1));
    b.define(
        Some("starstream_burn_star"),
        &[ValType::I64, ValType::I64],
        &[ValType::I64],
        f,
    );

    let mut f = FuncBuilder::new(2);
    f.i(Instruction::I64Const(0));
    b.define(
        Some("starstream_burn_other"),
        &[ValType::I64, ValType::I64],
        &[ValType::I64],
        f,
    );

    b.finish()
}

/// A vault UTXO holding one star token; exercises mint, burn, enumeration,
/// reattachment, and the consume-time intermediate pool.
pub fn vault(token_hex: &str) -> Vec<u8> {
    let (mut b, im) = utxo_module(Some(token_hex));
    let tok = im.token.as_ref().unwrap();
    let (mint_star, burn_star, burn_other) = (tok.mint_star, tok.burn_star, tok.burn_other);
    let state = add_asyncify_exports(&mut b);
    b.data(NAME_PTR, b"Vault");

    // entry: mint one token {id, amount: 1} and park on a yield loop
    let mut f = FuncBuilder::new(1);
    f.unless_rewinding(state, |f| {
        f.store_i64(STATE, |f| {
            f.get(Local(0));
            f.i(Instruction::I64Const(1));
            f.call(mint_star);
        });
    });
    f.yield_loop(
        im.yield_fn,
        state,
        (NAME_PTR, 5),
        (STATE, 8),
        (RESUME_PTR, 8),
        |_| {},
    );
    b.define(Some("starstream_new_vault_new"), &[ValType::I64], &[], f);

    // entry: adopt a pending intermediate instead of minting fresh
    let mut f = FuncBuilder::new(1);
    f.unless_rewinding(state, |f| {
        f.store_i64(STATE, |f| {
            f.get(Local(0));
            f.i(Instruction::I64Const(0));
            f.call(mint_star);
        });
    });
    f.yield_loop(
        im.yield_fn,
        state,
        (NAME_PTR, 5),
        (STATE, 8),
        (RESUME_PTR, 8),
        |_| {},
    );
    b.define(Some("starstream_new_vault_adopt_new"), &[ValType::I64], &[], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.i(Instruction::I64Load(memarg64()));
    b.define(
        Some("starstream_query_vault_token"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    let mut f = FuncBuilder::new(1);
    f.i(Instruction::I32Const(SCRATCH as i32));
    f.i(Instruction::I32Const(16));
    f.i(Instruction::I32Const(0));
    f.call(im.get_tokens);
    f.i(Instruction::I64ExtendI32U);
    b.define(
        Some("starstream_query_vault_count"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    // consume: burn the held token, handing the intermediate handle out
    let mut f = FuncBuilder::new(1);
    push_first_token_handle(&mut f, im.get_tokens);
    f.call(burn_star);
    b.define(
        Some("starstream_consume_vault_release"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    // consume without touching the token: the host pools it
    let f = FuncBuilder::new(1);
    b.define(Some("starstream_consume_vault_abandon"), &[ValType::I32], &[], f);

    let mut f = FuncBuilder::new(1);
    push_first_token_handle(&mut f, im.get_tokens);
    f.call(burn_other);
    b.define(
        Some("starstream_consume_vault_bad_release"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    // mutate: re-mint a pending intermediate into this vault
    let mut f = FuncBuilder::new(2);
    let t = f.local_i64();
    f.get(Local(1));
    f.i(Instruction::I64Const(0));
    f.call(mint_star);
    f.set(t);
    f.get(Local(0));
    f.get(t);
    f.i(Instruction::I64Store(memarg64()));
    f.get(t);
    b.define(
        Some("starstream_mutate_vault_adopt"),
        &[ValType::I32, ValType::I64],
        &[ValType::I64],
        f,
    );

    // mutate: destroy a pending intermediate outright
    let mut f = FuncBuilder::new(2);
    f.get(Local(1));
    f.call(burn_star);
    b.define(
        Some("starstream_mutate_vault_discard"),
        &[ValType::I32, ValType::I64],
        &[ValType::I64],
        f,
    );

    b.finish()
}

/// The NFT mint contract: tracks (supply, max_supply), and prepares one
/// intermediate per mint by minting to itself and burning loose.
pub fn nft_mint(token_hex: &str) -> Vec<u8> {
    let (mut b, im) = utxo_module(Some(token_hex));
    let tok = im.token.as_ref().unwrap();
    let (mint_star, burn_star) = (tok.mint_star, tok.burn_star);
    let state = add_asyncify_exports(&mut b);
    b.data(NAME_PTR, b"StarNftMint");

    let mut f = FuncBuilder::new(1);
    f.unless_rewinding(state, |f| {
        f.store_i64(STATE, |f| {
            f.i(Instruction::I64Const(0));
        });
        f.store_i64(STATE2, |f| {
            f.get(Local(0));
        });
    });
    f.yield_loop(
        im.yield_fn,
        state,
        (NAME_PTR, 11),
        (STATE, 16),
        (RESUME_PTR, 8),
        |_| {},
    );
    b.define(Some("starstream_new_nft_mint_new"), &[ValType::I64], &[], f);

    let mut f = FuncBuilder::new(1);
    let th = f.local_i64();
    f.load_i64(STATE);
    f.load_i64(STATE2);
    f.i(Instruction::I64GeS);
    f.i(Instruction::If(BlockType::Empty));
    f.i(Instruction::Unreachable);
    f.i(Instruction::End);
    f.store_i64(STATE, |f| {
        f.load_i64(STATE);
        f.i(Instruction::I64Const(1));
        f.i(Instruction::I64Add);
    });
    f.load_i64(STATE);
    f.i(Instruction::I64Const(1));
    f.call(mint_star);
    f.set(th);
    f.get(th);
    f.call(burn_star);
    b.define(
        Some("starstream_mutate_nft_prepare_to_mint"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.i(Instruction::I64Load(memarg64()));
    b.define(
        Some("starstream_query_nft_supply"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    b.finish()
}

/// Pay-to-key UTXO: owner plus one adopted token.
pub fn pay_to_key(token_hex: &str) -> Vec<u8> {
    let (mut b, im) = utxo_module(Some(token_hex));
    let mint_star = im.token.as_ref().unwrap().mint_star;
    let state = add_asyncify_exports(&mut b);
    b.data(NAME_PTR, b"PayToPublicKeyHash");

    let mut f = FuncBuilder::new(2);
    f.unless_rewinding(state, |f| {
        f.store_i64(STATE, |f| {
            f.get(Local(0));
        });
        f.store_i64(STATE2, |f| {
            f.get(Local(1));
            f.i(Instruction::I64Const(0));
            f.call(mint_star);
        });
    });
    f.yield_loop(
        im.yield_fn,
        state,
        (NAME_PTR, 18),
        (STATE, 16),
        (RESUME_PTR, 8),
        |_| {},
    );
    b.define(
        Some("starstream_new_p2pkh_new"),
        &[ValType::I64, ValType::I64],
        &[],
        f,
    );

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.i(Instruction::I64Load(memarg64()));
    b.define(
        Some("starstream_query_p2pkh_owner"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.i(Instruction::I64Load(memarg64_at(8)));
    b.define(
        Some("starstream_query_p2pkh_token"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    let mut f = FuncBuilder::new(1);
    push_first_token_handle(&mut f, im.get_tokens);
    b.define(
        Some("starstream_consume_p2pkh_spend"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    b.finish()
}

/// Oracle UTXO whose query raises a `oracle_guard` effect and returns the
/// handler's answer.
pub fn oracle() -> Vec<u8> {
    let (mut b, im) = utxo_module(None);
    let state = add_asyncify_exports(&mut b);
    b.data(NAME_PTR, b"Oracle");
    b.data(EFFECT_NAME_PTR, b"oracle_guard");

    let mut f = FuncBuilder::new(1);
    f.unless_rewinding(state, |f| {
        f.store_i64(STATE, |f| {
            f.get(Local(0));
        });
    });
    f.yield_loop(
        im.yield_fn,
        state,
        (NAME_PTR, 6),
        (STATE, 8),
        (RESUME_PTR, 8),
        |_| {},
    );
    b.define(Some("starstream_new_oracle_new"), &[ValType::I64], &[], f);

    let mut f = FuncBuilder::new(1);
    f.store_i64(EFFECT_DATA, |f| {
        f.get(Local(0));
        f.i(Instruction::I64Load(memarg64()));
    });
    for word in [EFFECT_NAME_PTR, 12, EFFECT_DATA, 8, EFFECT_RESUME, 8] {
        f.i(Instruction::I32Const(word as i32));
    }
    f.call(im.raise_fn);
    f.i(Instruction::GlobalGet(state));
    f.i(Instruction::I32Const(1));
    f.i(Instruction::I32Eq);
    f.i(Instruction::If(BlockType::Empty));
    f.i(Instruction::I64Const(0));
    f.i(Instruction::Return);
    f.i(Instruction::End);
    f.load_i64(EFFECT_RESUME);
    b.define(
        Some("starstream_query_oracle_get_data"),
        &[ValType::I32],
        &[ValType::I64],
        f,
    );

    b.finish()
}

/// A UTXO that calls a coordination-only import from its entry point.
pub fn context_violator() -> Vec<u8> {
    let (mut b, _im) = utxo_module(None);
    let new_sub = b.import_func("starstream_utxo:this", "starstream_new_bad_new", &[], &[ValType::I64]);
    let _state = add_asyncify_exports(&mut b);

    let mut f = FuncBuilder::new(0);
    f.call(new_sub);
    f.i(Instruction::Drop);
    b.define(Some("starstream_new_bad_new"), &[], &[], f);

    b.finish()
}

// ---------------------------------------------------------------------------
// Coordination scripts

/// Coordination over the counter UTXO.
pub fn coord_counter(counter_hex: &str) -> Vec<u8> {
    let module = format!("starstream_utxo:{counter_hex}");
    let mut b = ModuleBuilder::new();
    let new = b.import_func(&module, "starstream_new_counter_new", &[ValType::I64], &[ValType::I64]);
    let new_dead = b.import_func(&module, "starstream_new_counter_dead", &[ValType::I64], &[ValType::I64]);
    let resume = b.import_func(
        &module,
        "starstream_resume_counter",
        &[ValType::I64, ValType::I32, ValType::I32],
        &[],
    );
    let query = b.import_func(&module, "starstream_query_counter_get_supply", &[ValType::I64], &[ValType::I64]);
    let sneaky = b.import_func(&module, "starstream_query_counter_sneaky", &[ValType::I64], &[ValType::I64]);
    let mutate = b.import_func(
        &module,
        "starstream_mutate_counter_add",
        &[ValType::I64, ValType::I64],
        &[],
    );
    let consume = b.import_func(&module, "starstream_consume_counter_next", &[ValType::I64], &[ValType::I64]);
    let status = b.import_func(&module, "starstream_status_counter", &[ValType::I64], &[ValType::I32]);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(new);
    b.define(Some("make"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(new_dead);
    b.define(Some("make_dead"), &[ValType::I64], &[ValType::I64], f);

    // resume with an 8-byte payload spelled into scratch memory, then query
    let mut f = FuncBuilder::new(2);
    f.store_i64(64, |f| {
        f.get(Local(1));
    });
    f.get(Local(0));
    f.i(Instruction::I32Const(64));
    f.i(Instruction::I32Const(8));
    f.call(resume);
    f.get(Local(0));
    f.call(query);
    b.define(Some("bump"), &[ValType::I64, ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(2);
    f.get(Local(0));
    f.get(Local(1));
    f.call(mutate);
    f.get(Local(0));
    f.call(query);
    b.define(Some("add"), &[ValType::I64, ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(query);
    b.define(Some("peek"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(sneaky);
    b.define(Some("sneak"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(consume);
    b.define(Some("finish"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(status);
    b.define(Some("check"), &[ValType::I64], &[ValType::I32], f);

    // resume with a 4-byte payload against an 8-byte view
    let mut f = FuncBuilder::new(1);
    f.store_i64(64, |f| {
        f.i(Instruction::I64Const(1));
    });
    f.get(Local(0));
    f.i(Instruction::I32Const(64));
    f.i(Instruction::I32Const(4));
    f.call(resume);
    b.define(Some("bad_resume"), &[ValType::I64], &[], f);

    let mut f = FuncBuilder::new(1);
    f.store_i64(64, |f| {
        f.i(Instruction::I64Const(0));
    });
    f.get(Local(0));
    f.i(Instruction::I32Const(64));
    f.i(Instruction::I32Const(8));
    f.call(resume);
    b.define(Some("resume_dead"), &[ValType::I64], &[], f);

    // creates a UTXO but returns a plain scalar
    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(new);
    f.i(Instruction::Drop);
    f.i(Instruction::I64Const(7));
    b.define(Some("make_and_seven"), &[ValType::I64], &[ValType::I64], f);

    // resume a UTXO that returned on creation
    let mut f = FuncBuilder::new(1);
    let h = f.local_i64();
    f.get(Local(0));
    f.call(new_dead);
    f.set(h);
    f.store_i64(64, |f| {
        f.i(Instruction::I64Const(0));
    });
    f.get(h);
    f.i(Instruction::I32Const(64));
    f.i(Instruction::I32Const(8));
    f.call(resume);
    b.define(Some("make_dead_and_poke"), &[ValType::I64], &[], f);

    b.finish()
}

/// Coordination over the NFT mint and pay-to-key contracts.
pub fn coord_nft(nft_hex: &str, p2pkh_hex: &str) -> Vec<u8> {
    let nft = format!("starstream_utxo:{nft_hex}");
    let p2pkh = format!("starstream_utxo:{p2pkh_hex}");
    let mut b = ModuleBuilder::new();
    let nft_new = b.import_func(&nft, "starstream_new_nft_mint_new", &[ValType::I64], &[ValType::I64]);
    let prepare = b.import_func(&nft, "starstream_mutate_nft_prepare_to_mint", &[ValType::I64], &[ValType::I64]);
    let supply = b.import_func(&nft, "starstream_query_nft_supply", &[ValType::I64], &[ValType::I64]);
    let p2pkh_new = b.import_func(
        &p2pkh,
        "starstream_new_p2pkh_new",
        &[ValType::I64, ValType::I64],
        &[ValType::I64],
    );
    let owner_of = b.import_func(&p2pkh, "starstream_query_p2pkh_owner", &[ValType::I64], &[ValType::I64]);
    let token_of = b.import_func(&p2pkh, "starstream_query_p2pkh_token", &[ValType::I64], &[ValType::I64]);
    let spend = b.import_func(&p2pkh, "starstream_consume_p2pkh_spend", &[ValType::I64], &[ValType::I64]);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(nft_new);
    b.define(Some("nft_new"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(2);
    let ih = f.local_i64();
    f.get(Local(0));
    f.call(prepare);
    f.set(ih);
    f.get(Local(1));
    f.get(ih);
    f.call(p2pkh_new);
    b.define(Some("mint_to"), &[ValType::I64, ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(3);
    let i = f.local_i64();
    let ih = f.local_i64();
    f.i(Instruction::I64Const(0));
    f.set(i);
    f.i(Instruction::Block(BlockType::Empty));
    f.i(Instruction::Loop(BlockType::Empty));
    f.get(i);
    f.get(Local(1));
    f.i(Instruction::I64GeS);
    f.i(Instruction::BrIf(1));
    f.get(Local(0));
    f.call(prepare);
    f.set(ih);
    f.get(Local(2));
    f.get(ih);
    f.call(p2pkh_new);
    f.i(Instruction::Drop);
    f.get(i);
    f.i(Instruction::I64Const(1));
    f.i(Instruction::I64Add);
    f.set(i);
    f.i(Instruction::Br(0));
    f.i(Instruction::End);
    f.i(Instruction::End);
    b.define(
        Some("mint_up_to"),
        &[ValType::I64, ValType::I64, ValType::I64],
        &[],
        f,
    );

    // prepares an intermediate and walks away from it
    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(prepare);
    b.define(Some("leak"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(supply);
    b.define(Some("supply"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(2);
    let th = f.local_i64();
    f.get(Local(0));
    f.call(spend);
    f.set(th);
    f.get(Local(1));
    f.get(th);
    f.call(p2pkh_new);
    b.define(Some("transfer"), &[ValType::I64, ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(owner_of);
    b.define(Some("owner_of"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(token_of);
    b.define(Some("token_of"), &[ValType::I64], &[ValType::I64], f);

    b.finish()
}

/// Coordination over the vault contract.
pub fn coord_vault(vault_hex: &str) -> Vec<u8> {
    let module = format!("starstream_utxo:{vault_hex}");
    let mut b = ModuleBuilder::new();
    let vault_new = b.import_func(&module, "starstream_new_vault_new", &[ValType::I64], &[ValType::I64]);
    let adopt_new = b.import_func(&module, "starstream_new_vault_adopt_new", &[ValType::I64], &[ValType::I64]);
    let token_of = b.import_func(&module, "starstream_query_vault_token", &[ValType::I64], &[ValType::I64]);
    let count = b.import_func(&module, "starstream_query_vault_count", &[ValType::I64], &[ValType::I64]);
    let release = b.import_func(&module, "starstream_consume_vault_release", &[ValType::I64], &[ValType::I64]);
    let abandon = b.import_func(&module, "starstream_consume_vault_abandon", &[ValType::I64], &[]);
    let bad_release = b.import_func(&module, "starstream_consume_vault_bad_release", &[ValType::I64], &[ValType::I64]);
    let adopt = b.import_func(
        &module,
        "starstream_mutate_vault_adopt",
        &[ValType::I64, ValType::I64],
        &[ValType::I64],
    );
    let discard = b.import_func(
        &module,
        "starstream_mutate_vault_discard",
        &[ValType::I64, ValType::I64],
        &[ValType::I64],
    );

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(vault_new);
    b.define(Some("vault_new"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(count);
    b.define(Some("count"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(token_of);
    b.define(Some("token_of"), &[ValType::I64], &[ValType::I64], f);

    // consume one vault, re-mint its token in a fresh one
    let mut f = FuncBuilder::new(1);
    let ih = f.local_i64();
    f.get(Local(0));
    f.call(release);
    f.set(ih);
    f.get(ih);
    f.call(adopt_new);
    b.define(Some("move_token"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(abandon);
    b.define(Some("abandon"), &[ValType::I64], &[], f);

    // consume one vault, destroy the intermediate inside another
    let mut f = FuncBuilder::new(2);
    let ih = f.local_i64();
    f.get(Local(0));
    f.call(release);
    f.set(ih);
    f.get(Local(1));
    f.get(ih);
    f.call(discard);
    b.define(Some("discard"), &[ValType::I64, ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(bad_release);
    b.define(Some("bad_release"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(2);
    f.get(Local(0));
    f.get(Local(1));
    f.call(adopt);
    b.define(Some("adopt_into"), &[ValType::I64, ValType::I64], &[ValType::I64], f);

    b.finish()
}

/// Coordination over the oracle contract, with a table-installed handler.
pub fn coord_oracle(oracle_hex: &str) -> Vec<u8> {
    let module = format!("starstream_utxo:{oracle_hex}");
    let mut b = ModuleBuilder::new();
    let oracle_new = b.import_func(&module, "starstream_new_oracle_new", &[ValType::I64], &[ValType::I64]);
    let get_data = b.import_func(&module, "starstream_query_oracle_get_data", &[ValType::I64], &[ValType::I64]);
    let handle = b.import_func(&module, "starstream_handle_oracle_guard", &[ValType::I32], &[]);

    // the handler itself: answer payload + 1
    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.i(Instruction::I64Const(1));
    f.i(Instruction::I64Add);
    let guard = b.define(None, &[ValType::I64], &[ValType::I64], f);
    b.handler_table(&[guard]);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(oracle_new);
    b.define(Some("oracle_new"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    f.get(Local(0));
    f.call(get_data);
    b.define(Some("ask_unhandled"), &[ValType::I64], &[ValType::I64], f);

    let mut f = FuncBuilder::new(1);
    let v = f.local_i64();
    f.i(Instruction::I32Const(1));
    f.call(handle);
    f.get(Local(0));
    f.call(get_data);
    f.set(v);
    f.i(Instruction::I32Const(0));
    f.call(handle);
    f.get(v);
    b.define(Some("ask_handled"), &[ValType::I64], &[ValType::I64], f);

    b.finish()
}

/// Coordination that instantiates the context-violating UTXO.
pub fn coord_violator(bad_hex: &str) -> Vec<u8> {
    let module = format!("starstream_utxo:{bad_hex}");
    let mut b = ModuleBuilder::new();
    let new_bad = b.import_func(&module, "starstream_new_bad_new", &[], &[ValType::I64]);

    let mut f = FuncBuilder::new(0);
    f.call(new_bad);
    b.define(Some("go"), &[], &[ValType::I64], f);

    b.finish()
}
