//! Loading, caching, and transforming contract code WASM files.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};

use sha2::{digest::DynDigest, Sha256};
use wasmi::{Engine, ExternType, Module};

use crate::error::{Error, Result};

/// A raw ID describing a contract in a content-addressable way: the SHA-256
/// digest of the module bytes. Serves as both verification key and storage key.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ProgramId([u8; 32]);

impl ProgramId {
    pub fn from_wasm(code: &[u8]) -> ProgramId {
        // Currently this is just sha256 of the whole WASM file. There might
        // be stuff in the WASM file that we don't want to count or that isn't
        // reproducible and should exclude here, but that seems tricky.
        let mut hash = [0; 32];
        let mut hasher = Sha256::default();
        hasher.update(code);
        hasher.finalize_into(&mut hash[..]).unwrap();
        ProgramId(hash)
    }

    pub fn raw(&self) -> [u8; 32] {
        self.0
    }

    /// Parse the 64-character lowercase hex form used in import module names.
    pub fn from_hex(text: &str) -> Option<ProgramId> {
        if text.len() != 64 {
            return None;
        }
        let mut bytes = [0; 32];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(ProgramId(bytes))
    }
}

impl std::fmt::Display for ProgramId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProgramId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProgramId({self})")
    }
}

/// Injected capability that can fetch module bytes for a program id, used to
/// populate the registry lazily (file system, ledger blob store, ...).
pub trait CodeProvider: Send + Sync {
    fn fetch(&self, id: ProgramId) -> Result<Vec<u8>>;
}

/// A loaded and validated but not instantiated WASM blob.
pub struct ContractCode {
    id: ProgramId,
    wasm: Vec<u8>,
    /// Cached result of the asyncify pass, filled on first UTXO use.
    asyncified: RwLock<Option<Arc<Vec<u8>>>>,
}

impl ContractCode {
    fn load(wasm: Vec<u8>) -> Result<ContractCode> {
        // Validation pass; instantiation later re-parses against the store's
        // own engine.
        Module::new(&Engine::default(), &wasm[..])
            .map_err(|e| Error::BadModule(e.to_string()))?;
        Ok(ContractCode {
            id: ProgramId::from_wasm(&wasm),
            wasm,
            asyncified: RwLock::new(None),
        })
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn wasm(&self) -> &[u8] {
        &self.wasm
    }

    pub fn module(&self, engine: &Engine) -> Result<Module> {
        Module::new(engine, &self.wasm[..]).map_err(|e| Error::BadModule(e.to_string()))
    }

    /// The asyncified variant of this module, able to unwind and rewind its
    /// stack at the suspension imports. Computed once and cached.
    ///
    /// Modules that already export the `asyncify_*` family (transformed by the
    /// contract toolchain) are returned unchanged.
    pub fn asyncified(&self) -> Result<Arc<Vec<u8>>> {
        if let Some(cached) = self.asyncified.read().unwrap().clone() {
            return Ok(cached);
        }
        let bytes = if module_has_asyncify_exports(&self.wasm)? {
            Arc::new(self.wasm.clone())
        } else {
            Arc::new(run_asyncify_pass(&self.wasm)?)
        };
        let mut slot = self.asyncified.write().unwrap();
        if slot.is_none() {
            *slot = Some(bytes.clone());
        }
        Ok(slot.clone().unwrap())
    }
}

impl std::fmt::Debug for ContractCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractCode").field("id", &self.id).finish()
    }
}

fn module_has_asyncify_exports(wasm: &[u8]) -> Result<bool> {
    let engine = Engine::default();
    let module = Module::new(&engine, wasm).map_err(|e| Error::BadModule(e.to_string()))?;
    Ok(module.exports().any(|export| {
        export.name() == "asyncify_get_state" && matches!(export.ty(), ExternType::Func(_))
    }))
}

/// Imports at which the asyncify pass must be able to unwind the stack.
const SUSPENSION_IMPORTS: &str =
    "starstream_utxo_env.starstream_yield,starstream_utxo_env.starstream_raise";

/// Run binaryen's asyncify pass over the module. wasm-opt works on files, so
/// round-trip through a temporary directory.
fn run_asyncify_pass(wasm: &[u8]) -> Result<Vec<u8>> {
    let io = |e: std::io::Error| Error::BadModule(format!("asyncify i/o: {e}"));

    let dir = tempfile::tempdir().map_err(io)?;
    let input = dir.path().join("contract.wasm");
    let output = dir.path().join("contract.asyncified.wasm");
    std::fs::write(&input, wasm).map_err(io)?;

    let mut options = wasm_opt::OptimizationOptions::new_opt_level_0();
    options.passes.add_default_passes = false;
    options.passes.more_passes.push(wasm_opt::Pass::Asyncify);
    options.set_pass_arg("asyncify-imports", SUSPENSION_IMPORTS);
    options
        .run(&input, &output)
        .map_err(|e| Error::BadModule(format!("asyncify pass: {e}")))?;

    std::fs::read(&output).map_err(io)
}

/// A content-addressed cache of WASM blobs.
#[derive(Default)]
pub struct CodeCache {
    contract_code: RwLock<HashMap<ProgramId, Arc<ContractCode>>>,
    provider: Option<Box<dyn CodeProvider>>,
}

impl CodeCache {
    pub fn new() -> CodeCache {
        CodeCache::default()
    }

    pub fn with_provider(provider: Box<dyn CodeProvider>) -> CodeCache {
        CodeCache {
            contract_code: RwLock::new(HashMap::new()),
            provider: Some(provider),
        }
    }

    /// Parse, validate, and cache a module; returns the cached record if the
    /// same bytes were already loaded.
    pub fn load(&self, wasm: Vec<u8>) -> Result<Arc<ContractCode>> {
        let id = ProgramId::from_wasm(&wasm);
        if let Some(code) = self.contract_code.read().unwrap().get(&id) {
            return Ok(code.clone());
        }
        let code = Arc::new(ContractCode::load(wasm)?);
        self.contract_code
            .write()
            .unwrap()
            .entry(id)
            .or_insert(code.clone());
        Ok(code)
    }

    pub fn load_file(&self, path: &Path) -> Result<Arc<ContractCode>> {
        let wasm =
            std::fs::read(path).map_err(|e| Error::BadModule(format!("{}: {e}", path.display())))?;
        self.load(wasm)
    }

    /// Look up an already-loaded record.
    pub fn get(&self, id: ProgramId) -> Result<Arc<ContractCode>> {
        self.contract_code
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownCode(id))
    }

    /// Look up a record, falling back to the injected byte provider.
    pub fn resolve(&self, id: ProgramId) -> Result<Arc<ContractCode>> {
        if let Ok(code) = self.get(id) {
            return Ok(code);
        }
        let Some(provider) = &self.provider else {
            return Err(Error::UnknownCode(id));
        };
        let code = self.load(provider.fetch(id)?)?;
        if code.id() != id {
            return Err(Error::UnknownCode(id));
        }
        Ok(code)
    }

    /// The asyncified bytes for a program, cached per id.
    pub fn asyncified(&self, id: ProgramId) -> Result<Arc<Vec<u8>>> {
        self.resolve(id)?.asyncified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::contracts;

    #[test]
    fn ids_are_content_addressed() {
        let wasm = contracts::star_token();
        let code = CodeCache::new().load(wasm.clone()).unwrap();
        assert_eq!(code.id(), ProgramId::from_wasm(&wasm));
        let hex = code.id().to_string();
        assert_eq!(ProgramId::from_hex(&hex), Some(code.id()));
        assert_eq!(ProgramId::from_hex("this"), None);
    }

    #[test]
    fn loading_the_same_bytes_returns_the_cached_record() {
        let cache = CodeCache::new();
        let a = cache.load(contracts::star_token()).unwrap();
        let b = cache.load(contracts::star_token()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = CodeCache::new().load(b"not wasm".to_vec()).unwrap_err();
        assert!(matches!(err, Error::BadModule(_)), "got {err:?}");
    }

    #[test]
    fn unknown_ids_are_reported() {
        let cache = CodeCache::new();
        let id = ProgramId::from_wasm(b"absent");
        assert!(matches!(cache.get(id), Err(Error::UnknownCode(_))));
        assert!(matches!(cache.resolve(id), Err(Error::UnknownCode(_))));
    }

    struct MapProvider(std::collections::HashMap<ProgramId, Vec<u8>>);

    impl CodeProvider for MapProvider {
        fn fetch(&self, id: ProgramId) -> Result<Vec<u8>> {
            self.0.get(&id).cloned().ok_or(Error::UnknownCode(id))
        }
    }

    #[test]
    fn provider_populates_the_registry_lazily() {
        let wasm = contracts::star_token();
        let id = ProgramId::from_wasm(&wasm);
        let cache = CodeCache::with_provider(Box::new(MapProvider(
            std::collections::HashMap::from([(id, wasm)]),
        )));
        assert!(cache.get(id).is_err());
        assert_eq!(cache.resolve(id).unwrap().id(), id);
        assert!(cache.get(id).is_ok());
    }

    #[test]
    fn asyncified_modules_are_cached() {
        let cache = CodeCache::new();
        let code = cache.load(contracts::counter()).unwrap();
        let a = code.asyncified().unwrap();
        let b = cache.asyncified(code.id()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // Pre-asyncified modules pass through unchanged.
        assert_eq!(&**a, code.wasm());
    }
}
