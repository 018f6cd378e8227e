#![allow(dead_code)]

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, ElementSection, Elements, EntityType,
    ExportKind, ExportSection, Function, FunctionSection, GlobalSection, GlobalType,
    ImportSection, Instruction, MemArg, MemorySection, MemoryType, Module, RefType, TableSection,
    TableType, TypeSection, ValType,
};

#[derive(Clone, Copy, Debug)]
pub struct Local(pub u32);

#[derive(Clone, Copy, Debug)]
pub struct FuncId(pub u32);

pub fn memarg64() -> MemArg {
    MemArg {
        offset: 0,
        align: 3,
        memory_index: 0,
    }
}

pub fn memarg64_at(offset: u64) -> MemArg {
    MemArg {
        offset,
        align: 3,
        memory_index: 0,
    }
}

pub fn memarg32() -> MemArg {
    MemArg {
        offset: 0,
        align: 2,
        memory_index: 0,
    }
}

pub struct FuncBuilder {
    params: u32,
    locals: Vec<ValType>,
    instrs: Vec<Instruction<'static>>,
}

impl FuncBuilder {
    pub fn new(params: u32) -> Self {
        Self {
            params,
            locals: Vec::new(),
            instrs: Vec::new(),
        }
    }

    pub fn param(&self, index: u32) -> Local {
        Local(index)
    }

    pub fn local_i64(&mut self) -> Local {
        let idx = self.params + self.locals.len() as u32;
        self.locals.push(ValType::I64);
        Local(idx)
    }

    pub fn i(&mut self, instr: Instruction<'static>) -> &mut Self {
        self.instrs.push(instr);
        self
    }

    pub fn get(&mut self, local: Local) -> &mut Self {
        self.i(Instruction::LocalGet(local.0))
    }

    pub fn set(&mut self, local: Local) -> &mut Self {
        self.i(Instruction::LocalSet(local.0))
    }

    pub fn call(&mut self, func: FuncId) -> &mut Self {
        self.i(Instruction::Call(func.0))
    }

    /// Push the i64 at a fixed address.
    pub fn load_i64(&mut self, addr: u32) -> &mut Self {
        self.i(Instruction::I32Const(addr as i32));
        self.i(Instruction::I64Load(memarg64()))
    }

    /// Store an i64 (pushed by `value`) at a fixed address.
    pub fn store_i64(&mut self, addr: u32, value: impl FnOnce(&mut Self)) -> &mut Self {
        self.i(Instruction::I32Const(addr as i32));
        value(self);
        self.i(Instruction::I64Store(memarg64()))
    }

    /// `if asyncify_state != REWIND { body }` — skip first-run initialization
    /// when the entry point is re-entered to rewind.
    pub fn unless_rewinding(&mut self, state_global: u32, body: impl FnOnce(&mut Self)) {
        self.i(Instruction::GlobalGet(state_global));
        self.i(Instruction::I32Const(2));
        self.i(Instruction::I32Ne);
        self.i(Instruction::If(BlockType::Empty));
        body(self);
        self.i(Instruction::End);
    }

    /// The canonical UTXO body: yield in a loop, bailing out of the function
    /// whenever the yield import started an unwind, and running `per_resume`
    /// after every successful resume.
    pub fn yield_loop(
        &mut self,
        yield_fn: FuncId,
        state_global: u32,
        name: (u32, u32),
        data: (u32, u32),
        resume: (u32, u32),
        per_resume: impl Fn(&mut Self),
    ) {
        self.i(Instruction::Block(BlockType::Empty));
        self.i(Instruction::Loop(BlockType::Empty));
        for word in [name.0, name.1, data.0, data.1, resume.0, resume.1] {
            self.i(Instruction::I32Const(word as i32));
        }
        self.call(yield_fn);
        // Unwinding: return through every frame.
        self.i(Instruction::GlobalGet(state_global));
        self.i(Instruction::I32Const(1));
        self.i(Instruction::I32Eq);
        self.i(Instruction::If(BlockType::Empty));
        self.i(Instruction::Return);
        self.i(Instruction::End);
        per_resume(self);
        self.i(Instruction::Br(0));
        self.i(Instruction::End);
        self.i(Instruction::End);
    }

    fn finish(self) -> Function {
        let mut groups: Vec<(u32, ValType)> = Vec::new();
        for ty in self.locals {
            if let Some((count, last_ty)) = groups.last_mut() {
                if *last_ty == ty {
                    *count += 1;
                    continue;
                }
            }
            groups.push((1, ty));
        }
        let mut func = Function::new(groups);
        for instr in self.instrs {
            func.instruction(&instr);
        }
        func.instruction(&Instruction::End);
        func
    }
}

pub struct ModuleBuilder {
    types: TypeSection,
    imports: ImportSection,
    functions: FunctionSection,
    codes: CodeSection,
    exports: ExportSection,
    globals: GlobalSection,
    datas: DataSection,
    table: Option<Vec<FuncId>>,
    type_count: u32,
    import_count: u32,
    defined_count: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            types: TypeSection::new(),
            imports: ImportSection::new(),
            functions: FunctionSection::new(),
            codes: CodeSection::new(),
            exports: ExportSection::new(),
            globals: GlobalSection::new(),
            datas: DataSection::new(),
            table: None,
            type_count: 0,
            import_count: 0,
            defined_count: 0,
        }
    }

    /// Imports must all be declared before the first `define`, because they
    /// occupy the low function indices.
    pub fn import_func(
        &mut self,
        module: &str,
        name: &str,
        params: &[ValType],
        results: &[ValType],
    ) -> FuncId {
        debug_assert_eq!(self.defined_count, 0, "declare imports before functions");
        let type_idx = self.type_count;
        self.type_count += 1;
        self.types
            .ty()
            .function(params.iter().copied(), results.iter().copied());
        self.imports
            .import(module, name, EntityType::Function(type_idx));
        let idx = self.import_count;
        self.import_count += 1;
        FuncId(idx)
    }

    pub fn define(
        &mut self,
        export: Option<&str>,
        params: &[ValType],
        results: &[ValType],
        body: FuncBuilder,
    ) -> FuncId {
        let type_idx = self.type_count;
        self.type_count += 1;
        self.types
            .ty()
            .function(params.iter().copied(), results.iter().copied());
        self.functions.function(type_idx);
        self.codes.function(&body.finish());
        let idx = self.import_count + self.defined_count;
        self.defined_count += 1;
        if let Some(name) = export {
            self.exports.export(name, ExportKind::Func, idx);
        }
        FuncId(idx)
    }

    pub fn add_global_i32(&mut self, initial: i32, mutable: bool) -> u32 {
        let global_type = GlobalType {
            val_type: ValType::I32,
            mutable,
            shared: false,
        };
        self.globals
            .global(global_type, &ConstExpr::i32_const(initial));
        self.globals.len() - 1
    }

    pub fn data(&mut self, offset: u32, bytes: &[u8]) {
        self.datas.active(
            0,
            &ConstExpr::i32_const(offset as i32),
            bytes.iter().copied(),
        );
    }

    /// Install a funcref table exported as `__indirect_function_table`, with
    /// the given functions at indices 1.. (index 0 stays null).
    pub fn handler_table(&mut self, entries: &[FuncId]) {
        self.table = Some(entries.to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let mut module = Module::new();
        module.section(&self.types);
        module.section(&self.imports);
        module.section(&self.functions);

        let mut tables = TableSection::new();
        let mut elements = ElementSection::new();
        if let Some(entries) = &self.table {
            tables.table(TableType {
                element_type: RefType::FUNCREF,
                table64: false,
                minimum: entries.len() as u64 + 1,
                maximum: None,
                shared: false,
            });
            let ids: Vec<u32> = entries.iter().map(|f| f.0).collect();
            elements.active(
                None,
                &ConstExpr::i32_const(1),
                Elements::Functions(ids.into()),
            );
        }
        if self.table.is_some() {
            module.section(&tables);
        }

        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: 1,
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memories);

        if !self.globals.is_empty() {
            module.section(&self.globals);
        }

        let mut exports = self.exports;
        exports.export("memory", ExportKind::Memory, 0);
        if self.table.is_some() {
            exports.export("__indirect_function_table", ExportKind::Table, 0);
        }
        module.section(&exports);

        if self.table.is_some() {
            module.section(&elements);
        }
        module.section(&self.codes);
        if !self.datas.is_empty() {
            module.section(&self.datas);
        }
        module.finish()
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Add the `asyncify_*` export family backed by a single state global, for
/// modules that implement the unwind/rewind protocol themselves. Returns the
/// state global index.
pub fn add_asyncify_exports(builder: &mut ModuleBuilder) -> u32 {
    let state = builder.add_global_i32(0, true);

    let mut get_state = FuncBuilder::new(0);
    get_state.i(Instruction::GlobalGet(state));
    builder.define(Some("asyncify_get_state"), &[], &[ValType::I32], get_state);

    for (name, value) in [
        ("asyncify_start_unwind", 1),
        ("asyncify_stop_unwind", 0),
        ("asyncify_start_rewind", 2),
        ("asyncify_stop_rewind", 0),
    ] {
        let takes_addr = name.ends_with("start_unwind") || name.ends_with("start_rewind");
        let params: &[ValType] = if takes_addr { &[ValType::I32] } else { &[] };
        let mut body = FuncBuilder::new(params.len() as u32);
        body.i(Instruction::I32Const(value));
        body.i(Instruction::GlobalSet(state));
        builder.define(Some(name), params, &[], body);
    }

    state
}
