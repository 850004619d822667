//! Backend: lowers the typed AST onto the JIT assembler.
//!
//! Cranelift is the low-level IR: frontend `Variable`s are the typed
//! registers, `FuncId`/`Signature` pairs are the item/proto handles,
//! data items hold interned strings and globals, and imports resolve to
//! the native runtime helpers. After lowering, the module is finalized
//! and code generation yields the `<start>` entry point.

mod expr;
mod stmt;
mod support;

use std::collections::HashMap;

use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Signature, Type};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};

use crate::ast::{Ast, ClassId, FnId, VarId};
use crate::error::Diagnostics;
use crate::intern::Interner;
use crate::runtime;
use crate::token::Token;
use crate::types::{canonical_name, DataType, TypeIds};

/// Paired handles of a callable: the item and its signature.
#[derive(Clone)]
pub struct FuncItem {
    pub id: FuncId,
    pub sig: Signature,
}

/// Per-function lowering state.
pub(crate) struct FnCtx {
    pub vars: HashMap<VarId, Variable>,
    pub this: Option<Variable>,
    /// Stack of (continue target, break target) label pairs.
    pub loops: Vec<(cranelift_codegen::ir::Block, cranelift_codegen::ir::Block)>,
    pub terminated: bool,
}

impl FnCtx {
    fn new() -> Self {
        FnCtx { vars: HashMap::new(), this: None, loops: Vec::new(), terminated: false }
    }
}

pub struct Backend<'a> {
    pub(crate) ast: &'a Ast,
    pub(crate) interner: &'a Interner,
    pub(crate) typeids: TypeIds,
    pub(crate) module: JITModule,
    logging: bool,
    vm_id: u64,
    func_items: HashMap<FnId, FuncItem>,
    ctor_items: HashMap<FnId, FuncItem>,
    default_ctors: HashMap<ClassId, FuncItem>,
    globals: HashMap<VarId, DataId>,
    strings: HashMap<Vec<u8>, DataId>,
    /// Generated and imported runtime routines, keyed by canonical name.
    pub(crate) support: HashMap<String, FuncItem>,
    /// Function name and code size per item, for the stack-trace ranges.
    ranges: Vec<(FuncId, String, usize)>,
    start: Option<FuncId>,
    /// `name.signature` lookups for the embedding API.
    function_names: HashMap<String, FuncId>,
    global_names: HashMap<String, DataId>,
}

impl<'a> Backend<'a> {
    pub fn new(
        ast: &'a Ast,
        interner: &'a Interner,
        logging: bool,
        vm_id: u64,
        externals: &[(String, *const u8)],
    ) -> Result<Self, String> {
        let mut flags = settings::builder();
        flags.set("use_colocated_libcalls", "false").map_err(|e| e.to_string())?;
        flags.set("is_pic", "false").map_err(|e| e.to_string())?;
        flags.set("opt_level", "speed").map_err(|e| e.to_string())?;
        flags.set("preserve_frame_pointers", "true").map_err(|e| e.to_string())?;

        let isa = cranelift_native::builder()
            .map_err(|e| e.to_string())?
            .finish(settings::Flags::new(flags))
            .map_err(|e| e.to_string())?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        install_runtime_symbols(&mut builder);
        for (name, address) in externals {
            builder.symbol(name.as_str(), *address);
        }

        let module = JITModule::new(builder);

        Ok(Backend {
            ast,
            interner,
            typeids: TypeIds::new(),
            module,
            logging,
            vm_id,
            func_items: HashMap::new(),
            ctor_items: HashMap::new(),
            default_ctors: HashMap::new(),
            globals: HashMap::new(),
            strings: HashMap::new(),
            support: HashMap::new(),
            ranges: Vec::new(),
            start: None,
            function_names: HashMap::new(),
            global_names: HashMap::new(),
        })
    }

    // ------------------------------------------------------------------
    // Type mapping
    // ------------------------------------------------------------------

    /// Register type of a value: 32-bit for integers, booleans and
    /// characters, single-precision float, machine word for everything
    /// pointer-shaped.
    pub(crate) fn val_type(ty: &DataType) -> Type {
        match ty {
            DataType::Int | DataType::Bool | DataType::Char => types::I32,
            DataType::Float => types::F32,
            _ => types::I64,
        }
    }

    /// Storage type inside arrays, fields and globals.
    pub(crate) fn mem_type(ty: &DataType) -> Type {
        match ty {
            DataType::Bool | DataType::Char => types::I8,
            DataType::Int => types::I32,
            DataType::Float => types::F32,
            _ => types::I64,
        }
    }

    pub(crate) fn make_sig(&self, params: &[DataType], ret: &DataType) -> Signature {
        let mut sig = self.module.make_signature();
        for param in params {
            sig.params.push(AbiParam::new(Self::val_type(param)));
        }
        if *ret != DataType::Void {
            sig.returns.push(AbiParam::new(Self::val_type(ret)));
        }
        sig
    }

    pub(crate) fn canonical(&mut self, ty: &DataType) -> String {
        canonical_name(ty, self.ast, self.interner)
    }

    pub(crate) fn typeid(&mut self, ty: &DataType) -> u16 {
        let name = canonical_name(ty, self.ast, self.interner);
        self.typeids.id(&name)
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    pub(crate) fn func_item(&self, func: FnId) -> FuncItem {
        self.func_items[&func].clone()
    }

    pub(crate) fn ctor_item(&self, init: Option<FnId>, class: ClassId) -> FuncItem {
        match init {
            Some(init) => self.ctor_items[&init].clone(),
            None => self.default_ctors[&class].clone(),
        }
    }

    fn declare_function_item(
        &mut self,
        name: &str,
        linkage: Linkage,
        sig: Signature,
    ) -> Result<FuncItem, String> {
        let id = self.module.declare_function(name, linkage, &sig).map_err(|e| e.to_string())?;
        Ok(FuncItem { id, sig })
    }

    /// Declares an import that resolves to a native symbol.
    pub(crate) fn import(
        &mut self,
        symbol: &str,
        params: &[Type],
        ret: Option<Type>,
    ) -> Result<FuncItem, String> {
        if let Some(item) = self.support.get(symbol) {
            return Ok(item.clone());
        }
        let mut sig = self.module.make_signature();
        for &param in params {
            sig.params.push(AbiParam::new(param));
        }
        if let Some(ret) = ret {
            sig.returns.push(AbiParam::new(ret));
        }
        let item = self.declare_function_item(symbol, Linkage::Import, sig)?;
        self.support.insert(symbol.to_string(), item.clone());
        Ok(item)
    }

    // ------------------------------------------------------------------
    // Interned literal strings
    // ------------------------------------------------------------------

    /// Interns a literal into a module-wide length-prefixed data item;
    /// repeated identical literals share the item.
    pub(crate) fn string_data(&mut self, bytes: &[u8]) -> Result<DataId, String> {
        if let Some(&id) = self.strings.get(bytes) {
            return Ok(id);
        }

        let name = format!("string.{}", self.strings.len());
        let id = self
            .module
            .declare_data(&name, Linkage::Local, false, false)
            .map_err(|e| e.to_string())?;

        let mut contents = Vec::with_capacity(4 + bytes.len());
        contents.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
        contents.extend_from_slice(bytes);

        let mut description = DataDescription::new();
        description.define(contents.into_boxed_slice());
        description.set_align(8);
        self.module.define_data(id, &description).map_err(|e| e.to_string())?;

        self.strings.insert(bytes.to_vec(), id);
        Ok(id)
    }

    pub(crate) fn string_addr(
        &mut self,
        b: &mut FunctionBuilder,
        bytes: &[u8],
    ) -> Result<cranelift_codegen::ir::Value, String> {
        let data = self.string_data(bytes)?;
        let gv = self.module.declare_data_in_func(data, b.func);
        Ok(b.ins().global_value(types::I64, gv))
    }

    // ------------------------------------------------------------------
    // Panic calls
    // ------------------------------------------------------------------

    /// Emits a call to the runtime panic with a static reason and the
    /// token's span.
    pub(crate) fn emit_panic(
        &mut self,
        b: &mut FunctionBuilder,
        reason: &'static [u8],
        token: Token,
    ) -> Result<(), String> {
        let item = self.import("panic", &[types::I64, types::I64, types::I64], None)?;
        let fref = self.module.declare_func_in_func(item.id, b.func);
        let reason = b.ins().iconst(types::I64, reason.as_ptr() as i64);
        let line = b.ins().iconst(types::I64, token.span.start_line as i64);
        let column = b.ins().iconst(types::I64, token.span.start_col as i64);
        b.ins().call(fref, &[reason, line, column]);
        Ok(())
    }

    /// Branches to a panic when `value` is zero (null).
    pub(crate) fn emit_null_check(
        &mut self,
        b: &mut FunctionBuilder,
        reason: &'static [u8],
        value: cranelift_codegen::ir::Value,
        token: Token,
    ) -> Result<(), String> {
        let ok = b.create_block();
        let bad = b.create_block();
        b.ins().brif(value, ok, &[], bad, &[]);
        b.switch_to_block(bad);
        self.emit_panic(b, reason, token)?;
        b.ins().jump(ok, &[]);
        b.switch_to_block(ok);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Compilation driver
    // ------------------------------------------------------------------

    /// Declares every function and global item, lowers all bodies plus
    /// the `<start>` entry, links and generates native code.
    pub fn compile(
        &mut self,
        statements: &[crate::ast::StmtId],
        globals: &[VarId],
        start_locals: &[VarId],
        diagnostics: &mut Diagnostics,
    ) -> bool {
        match self.compile_inner(statements, globals, start_locals) {
            Ok(()) => true,
            Err(message) => {
                diagnostics.report(crate::token::Span::default(), message);
                false
            }
        }
    }

    fn compile_inner(
        &mut self,
        statements: &[crate::ast::StmtId],
        globals: &[VarId],
        start_locals: &[VarId],
    ) -> Result<(), String> {
        // Item declaration pass: every concrete function gets its
        // (item, proto) pair up front so forward references resolve.
        for index in 0..self.ast.func_count() {
            let func = FnId(index as u32);
            let decl = self.ast.func(func);
            if decl.is_template || (!decl.checked && !decl.imported) {
                continue;
            }
            let params: Vec<DataType> =
                decl.params.iter().map(|&p| self.ast.var(p).ty.clone()).collect();
            let sig = self.make_sig(&params, &decl.ret.clone());
            let name = decl.mangled.clone();
            let linkage = if decl.imported { Linkage::Import } else { Linkage::Local };
            let item = self.declare_function_item(&name, linkage, sig)?;
            if !decl.imported {
                self.function_names.insert(name, item.id);
            }
            self.func_items.insert(func, item);
        }

        // Constructor-style entries returning the object pointer.
        for index in 0..self.ast.class_count() {
            let class = ClassId(index as u32);
            let decl = self.ast.class(class);
            if decl.is_template {
                continue;
            }
            let class_name = if decl.mangled.is_empty() {
                self.interner.resolve(decl.name.lexeme).to_string()
            } else {
                decl.mangled.clone()
            };
            let initializers = decl.initializers.clone();
            if initializers.is_empty() {
                let sig = self.make_sig(&[], &DataType::Object(class));
                let item = self.declare_function_item(&class_name, Linkage::Local, sig)?;
                self.function_names.insert(class_name.clone(), item.id);
                self.default_ctors.insert(class, item);
            } else {
                for init in initializers {
                    let params: Vec<DataType> = self
                        .ast
                        .func(init)
                        .params
                        .get(1..)
                        .unwrap_or(&[])
                        .iter()
                        .map(|&p| self.ast.var(p).ty.clone())
                        .collect();
                    let sig = self.make_sig(&params, &DataType::Object(class));
                    let name = if self.ast.class(class).initializers.len() > 1 {
                        let mangled = self.ast.func(init).mangled.clone();
                        format!("{}.{}", class_name, mangled)
                    } else {
                        class_name.clone()
                    };
                    let item = self.declare_function_item(&name, Linkage::Local, sig)?;
                    self.function_names.insert(name, item.id);
                    self.ctor_items.insert(init, item);
                }
            }
        }

        // Global variables become zero-initialized data items.
        for &global in globals {
            let decl = self.ast.var(global);
            let name = format!(
                "{}.{}",
                self.interner.resolve(decl.name.lexeme),
                canonical_name(&decl.ty, self.ast, self.interner)
            );
            let id = self
                .module
                .declare_data(&name, Linkage::Local, true, false)
                .map_err(|e| e.to_string())?;
            let mut description = DataDescription::new();
            description.define_zeroinit(8);
            description.set_align(8);
            self.module.define_data(id, &description).map_err(|e| e.to_string())?;
            self.globals.insert(global, id);
            self.global_names.insert(name, id);
        }

        // Function bodies.
        for index in 0..self.ast.func_count() {
            let func = FnId(index as u32);
            let decl = self.ast.func(func);
            if decl.is_template || decl.imported || !decl.checked {
                continue;
            }
            self.define_function(func)?;
        }

        // Constructors.
        for index in 0..self.ast.class_count() {
            let class = ClassId(index as u32);
            if self.ast.class(class).is_template {
                continue;
            }
            self.define_constructors(class)?;
        }

        // The `<start>` function runs global initializers and top-level
        // statements.
        self.define_start(statements, start_locals)?;

        self.module.finalize_definitions().map_err(|e| e.to_string())?;

        for (id, name, size) in std::mem::take(&mut self.ranges) {
            let base = self.module.get_finalized_function(id);
            runtime::register_code_range(self.vm_id, &name, base, size);
        }

        Ok(())
    }

    /// Defines a finished function body, recording its name and code
    /// size for the stack-trace ranges.
    pub(crate) fn finish_definition(
        &mut self,
        id: FuncId,
        name: &str,
        ctx: &mut cranelift_codegen::Context,
    ) -> Result<(), String> {
        if self.logging {
            println!("{}", ctx.func.display());
        }
        self.module.define_function(id, ctx).map_err(|e| e.to_string())?;
        let size = ctx.compiled_code().map(|code| code.code_buffer().len()).unwrap_or(0);
        self.ranges.push((id, name.to_string(), size));
        self.module.clear_context(ctx);
        Ok(())
    }

    pub(crate) fn set_start_item(&mut self, id: FuncId) {
        self.start = Some(id);
    }

    pub(crate) fn global_data(&self, var: VarId) -> DataId {
        self.globals[&var]
    }

    /// Consumes the backend, resolving every name to its generated
    /// address. The returned module owns the native code.
    pub fn into_compiled(self) -> Compiled {
        let functions = self
            .function_names
            .iter()
            .map(|(name, &id)| (name.clone(), self.module.get_finalized_function(id)))
            .collect();
        let globals = self
            .global_names
            .iter()
            .map(|(name, &id)| (name.clone(), self.module.get_finalized_data(id).0))
            .collect();
        let start = self.start.map(|id| self.module.get_finalized_function(id));

        Compiled { module: self.module, vm_id: self.vm_id, start, functions, globals }
    }
}

/// A linked module with generated native code. The code pointers stay
/// valid until `destroy`.
pub struct Compiled {
    module: JITModule,
    vm_id: u64,
    start: Option<*const u8>,
    functions: HashMap<String, *const u8>,
    globals: HashMap<String, *const u8>,
}

impl Compiled {
    /// Address of the generated `<start>` function.
    pub fn start_address(&self) -> Option<*const u8> {
        self.start
    }

    /// Resolves a compiled function by `name.signature`.
    pub fn function_address(&self, name: &str) -> Option<*const u8> {
        self.functions.get(name).copied()
    }

    /// Resolves a global variable's storage by `name.signature`.
    pub fn variable_address(&self, name: &str) -> Option<*const u8> {
        self.globals.get(name).copied()
    }

    /// Releases the executable memory. Callers must not run generated
    /// code afterwards.
    pub unsafe fn destroy(self) {
        runtime::unregister_code_ranges(self.vm_id);
        self.module.free_memory();
    }
}

fn install_runtime_symbols(builder: &mut JITBuilder) {
    use crate::runtime as rt;

    builder.symbol("panic", rt::panic as *const u8);
    builder.symbol("malloc", libc::malloc as *const u8);
    builder.symbol("memcpy", libc::memcpy as *const u8);
    builder.symbol("realloc", libc::realloc as *const u8);

    builder.symbol("string.equals", rt::string_equals as *const u8);
    builder.symbol("string.bool_cast", rt::string_bool_cast as *const u8);
    builder.symbol("string.int_cast", rt::string_int_cast as *const u8);
    builder.symbol("string.float_cast", rt::string_float_cast as *const u8);
    builder.symbol("string.char_cast", rt::string_char_cast as *const u8);

    builder.symbol("log", rt::log_int as *const u8);
    builder.symbol("log(int)", rt::log_int as *const u8);
    builder.symbol("log(bool)", rt::log_int as *const u8);
    builder.symbol("log(float)", rt::log_float as *const u8);
    builder.symbol("log(char)", rt::log_char as *const u8);
    builder.symbol("log(string)", rt::log_string as *const u8);

    builder.symbol("string.pad", rt::string_pad as *const u8);
    builder.symbol("string.hash", rt::string_hash as *const u8);
    builder.symbol("string.index_of", rt::string_index_of as *const u8);
    builder.symbol("string.count", rt::string_count as *const u8);
    builder.symbol("string.replace", rt::string_replace as *const u8);
    builder.symbol("string.trim", rt::string_trim as *const u8);
    builder.symbol("string.starts_with", rt::string_starts_with as *const u8);
    builder.symbol("string.ends_with", rt::string_ends_with as *const u8);
    builder.symbol("string.contains", rt::string_contains as *const u8);
    builder.symbol("string.split", rt::string_split as *const u8);
    builder.symbol("string.join", rt::string_join as *const u8);
    builder.symbol("string.to_array", rt::string_to_array as *const u8);

    builder.symbol("int.hash", rt::int_hash as *const u8);
    builder.symbol("float.hash", rt::float_hash as *const u8);
    builder.symbol("float.sqrt", rt::float_sqrt as *const u8);

    builder.symbol("alloc", rt::pool_alloc as *const u8);
    builder.symbol("allocReset", rt::pool_reset as *const u8);
    builder.symbol("memory", rt::pool_used as *const u8);
    builder.symbol("writeInt", rt::pool_write_int as *const u8);
    builder.symbol("writeFloat", rt::pool_write_float as *const u8);
    builder.symbol("writeChar", rt::pool_write_char as *const u8);
    builder.symbol("writeBool", rt::pool_write_bool as *const u8);
    builder.symbol("readInt", rt::pool_read_int as *const u8);
    builder.symbol("readFloat", rt::pool_read_float as *const u8);
    builder.symbol("readChar", rt::pool_read_char as *const u8);
    builder.symbol("readBool", rt::pool_read_bool as *const u8);
}

// Static panic reasons baked into generated code as addresses.
pub(crate) const PANIC_OUT_OF_BOUNDS: &[u8] = b"Out of bounds access\0";
pub(crate) const PANIC_NULL_ACCESS: &[u8] = b"Null pointer access\0";
pub(crate) const PANIC_NULL_CALL: &[u8] = b"Null pointer call\0";
pub(crate) const PANIC_INVALID_CAST: &[u8] = b"Invalid type cast\0";
pub(crate) const PANIC_INVALID_RESERVE: &[u8] = b"Invalid reservation amount\0";
pub(crate) const PANIC_DIVISION_BY_ZERO: &[u8] = b"Division by zero\0";
