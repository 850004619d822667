//! Runtime support routines generated on demand.
//!
//! Each routine is generated once per (name, type-argument signature)
//! and its item/proto pair cached; native byte-wise helpers are
//! installed as imports instead.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{Linkage, Module};

use super::{Backend, FuncItem, PANIC_INVALID_RESERVE, PANIC_OUT_OF_BOUNDS};
use crate::ast::Member;
use crate::intern::Symbol;
use crate::token::{Span, Token, TokenKind};
use crate::types::DataType;

fn zero_token() -> Token {
    Token::new(TokenKind::Eof, Symbol::EMPTY, Span::default())
}

impl<'a> Backend<'a> {
    /// Resolves an internal routine to its item/proto pair, generating
    /// or importing it on first use.
    pub(crate) fn internal_item(
        &mut self,
        name: &str,
        params: &[DataType],
        ret: &DataType,
    ) -> Result<FuncItem, String> {
        match name {
            "array.push" => self.array_push_item(&params[0]),
            "array.push_string" => self.array_push_string_item(),
            "array.pop" => self.array_pop_item(&params[0]),
            "array.clear" => self.array_clear_item(),
            "array.reserve" => self.array_reserve_item(&params[0]),
            "array.to_string" => self.array_to_string_item(),

            "string.hash" => self.import("string.hash", &[types::I64], Some(types::I32)),
            "string.index_of" => {
                self.import("string.index_of", &[types::I64, types::I64], Some(types::I32))
            }
            "string.count" => {
                self.import("string.count", &[types::I64, types::I64], Some(types::I32))
            }
            "string.replace" => self.import(
                "string.replace",
                &[types::I64, types::I64, types::I64],
                Some(types::I64),
            ),
            "string.trim" => self.import("string.trim", &[types::I64], Some(types::I64)),
            "string.starts_with" => {
                self.import("string.starts_with", &[types::I64, types::I64], Some(types::I32))
            }
            "string.ends_with" => {
                self.import("string.ends_with", &[types::I64, types::I64], Some(types::I32))
            }
            "string.contains" => {
                self.import("string.contains", &[types::I64, types::I64], Some(types::I32))
            }
            "string.split" => {
                self.import("string.split", &[types::I64, types::I64], Some(types::I64))
            }
            "string.join" => {
                self.import("string.join", &[types::I64, types::I64], Some(types::I64))
            }
            "string.to_array" => self.import("string.to_array", &[types::I64], Some(types::I64)),
            "string.pad" => self.import("string.pad", &[types::I64, types::I32], Some(types::I64)),

            "int.hash" => self.import("int.hash", &[types::I32], Some(types::I32)),
            "float.hash" => self.import("float.hash", &[types::F32], Some(types::I32)),
            "float.sqrt" => self.import("float.sqrt", &[types::F32], Some(types::F32)),

            "alloc" => self.import("alloc", &[types::I32], Some(types::I32)),
            "allocReset" => self.import("allocReset", &[], None),
            "memory" => self.import("memory", &[], Some(types::I32)),
            "writeInt" => self.import("writeInt", &[types::I32, types::I32], None),
            "writeFloat" => self.import("writeFloat", &[types::I32, types::F32], None),
            "writeChar" => self.import("writeChar", &[types::I32, types::I32], None),
            "writeBool" => self.import("writeBool", &[types::I32, types::I32], None),
            "readInt" => self.import("readInt", &[types::I32], Some(types::I32)),
            "readFloat" => self.import("readFloat", &[types::I32], Some(types::F32)),
            "readChar" => self.import("readChar", &[types::I32], Some(types::I32)),
            "readBool" => self.import("readBool", &[types::I32], Some(types::I32)),

            _ => {
                let _ = ret;
                Err(format!("unknown internal function '{}'", name))
            }
        }
    }

    fn declare_support(
        &mut self,
        key: &str,
        params: &[cranelift_codegen::ir::Type],
        ret: Option<cranelift_codegen::ir::Type>,
    ) -> Result<FuncItem, String> {
        let mut sig = self.module.make_signature();
        for &param in params {
            sig.params.push(cranelift_codegen::ir::AbiParam::new(param));
        }
        if let Some(ret) = ret {
            sig.returns.push(cranelift_codegen::ir::AbiParam::new(ret));
        }
        let id = self.module.declare_function(key, Linkage::Local, &sig).map_err(|e| e.to_string())?;
        let item = FuncItem { id, sig };
        self.support.insert(key.to_string(), item.clone());
        Ok(item)
    }

    // ------------------------------------------------------------------
    // array.push
    // ------------------------------------------------------------------

    pub(crate) fn array_push_item(&mut self, array_ty: &DataType) -> Result<FuncItem, String> {
        let key = format!("array.push.{}", self.canonical(array_ty));
        if let Some(item) = self.support.get(&key) {
            return Ok(item.clone());
        }

        let element = array_ty.element();
        let item = self.declare_support(&key, &[types::I64, Self::val_type(&element)], None)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let array = b.block_params(entry)[0];
        let value = b.block_params(entry)[1];

        let length = b.ins().load(types::I32, MemFlags::trusted(), array, 0);
        let capacity = b.ins().load(types::I32, MemFlags::trusted(), array, 4);

        let resize = b.create_block();
        let push = b.create_block();
        let full = b.ins().icmp(IntCC::Equal, length, capacity);
        b.ins().brif(full, resize, &[], push, &[]);

        // Double the capacity, plus one.
        b.switch_to_block(resize);
        let doubled = b.ins().imul_imm(capacity, 2);
        let grown = b.ins().iadd_imm(doubled, 1);
        b.ins().store(MemFlags::trusted(), grown, array, 4);
        let grown64 = b.ins().uextend(types::I64, grown);
        let bytes = b.ins().imul_imm(grown64, element.size() as i64);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);
        let new_data = self.call_realloc(&mut b, data, bytes)?;
        b.ins().store(MemFlags::trusted(), new_data, array, 8);
        b.ins().jump(push, &[]);

        b.switch_to_block(push);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);
        let addr = self.element_addr(&mut b, data, length, element.size());
        self.store_mem(&mut b, &element, addr, 0, value);
        let bumped = b.ins().iadd_imm(length, 1);
        b.ins().store(MemFlags::trusted(), bumped, array, 0);
        b.ins().return_(&[]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &key, &mut ctx)?;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // array.pushString: append the bytes of a string to a char array
    // ------------------------------------------------------------------

    pub(crate) fn array_push_string_item(&mut self) -> Result<FuncItem, String> {
        let key = "array.pushString";
        if let Some(item) = self.support.get(key) {
            return Ok(item.clone());
        }

        let item = self.declare_support(key, &[types::I64, types::I64], None)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let array = b.block_params(entry)[0];
        let string = b.block_params(entry)[1];

        let length = b.ins().load(types::I32, MemFlags::trusted(), array, 0);
        let capacity = b.ins().load(types::I32, MemFlags::trusted(), array, 4);
        let string_length = b.ins().load(types::I32, MemFlags::trusted(), string, 0);
        let needed = b.ins().iadd(length, string_length);

        let resize = b.create_block();
        let copy = b.create_block();
        let full = b.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, needed, capacity);
        b.ins().brif(full, resize, &[], copy, &[]);

        b.switch_to_block(resize);
        let grown = b.ins().imul_imm(needed, 2);
        b.ins().store(MemFlags::trusted(), grown, array, 4);
        let grown64 = b.ins().uextend(types::I64, grown);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);
        let new_data = self.call_realloc(&mut b, data, grown64)?;
        b.ins().store(MemFlags::trusted(), new_data, array, 8);
        b.ins().jump(copy, &[]);

        b.switch_to_block(copy);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);
        let length64 = b.ins().uextend(types::I64, length);
        let dest = b.ins().iadd(data, length64);
        let source = b.ins().iadd_imm(string, crate::runtime::STRING_HEADER);
        let count = b.ins().uextend(types::I64, string_length);
        self.call_memcpy(&mut b, dest, source, count)?;
        b.ins().store(MemFlags::trusted(), needed, array, 0);
        b.ins().return_(&[]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, key, &mut ctx)?;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // array.pop
    // ------------------------------------------------------------------

    pub(crate) fn array_pop_item(&mut self, array_ty: &DataType) -> Result<FuncItem, String> {
        let key = format!("array.pop.{}", self.canonical(array_ty));
        if let Some(item) = self.support.get(&key) {
            return Ok(item.clone());
        }

        let element = array_ty.element();
        let item = self.declare_support(&key, &[types::I64], Some(Self::val_type(&element)))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let array = b.block_params(entry)[0];

        let length = b.ins().load(types::I32, MemFlags::trusted(), array, 0);

        let ok = b.create_block();
        let empty = b.create_block();
        b.ins().brif(length, ok, &[], empty, &[]);

        b.switch_to_block(empty);
        self.emit_panic(&mut b, PANIC_OUT_OF_BOUNDS, zero_token())?;
        b.ins().jump(ok, &[]);

        b.switch_to_block(ok);
        let last = b.ins().iadd_imm(length, -1);
        b.ins().store(MemFlags::trusted(), last, array, 0);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);
        let addr = self.element_addr(&mut b, data, last, element.size());
        let value = self.load_mem(&mut b, &element, addr, 0);
        b.ins().return_(&[value]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &key, &mut ctx)?;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // array.clear: length to zero, capacity preserved
    // ------------------------------------------------------------------

    pub(crate) fn array_clear_item(&mut self) -> Result<FuncItem, String> {
        let key = "array.clear";
        if let Some(item) = self.support.get(key) {
            return Ok(item.clone());
        }

        let item = self.declare_support(key, &[types::I64], None)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let array = b.block_params(entry)[0];
        let zero = b.ins().iconst(types::I32, 0);
        b.ins().store(MemFlags::trusted(), zero, array, 0);
        b.ins().return_(&[]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, key, &mut ctx)?;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // array.reserve: size to n, default-initializing every slot
    // ------------------------------------------------------------------

    pub(crate) fn array_reserve_item(&mut self, array_ty: &DataType) -> Result<FuncItem, String> {
        let key = format!("array.reserve.{}", self.canonical(array_ty));
        if let Some(item) = self.support.get(&key) {
            return Ok(item.clone());
        }

        let dims = match array_ty {
            DataType::Array { dims, .. } => *dims as usize,
            _ => 1,
        };
        let element = array_ty.element();

        let mut params = vec![types::I64];
        params.extend(std::iter::repeat(types::I32).take(dims));
        let item = self.declare_support(&key, &params, None)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let array = b.block_params(entry)[0];
        let count = b.block_params(entry)[1];
        let rest: Vec<Value> = b.block_params(entry)[2..].to_vec();

        let ok = b.create_block();
        let bad = b.create_block();
        let negative = b.ins().icmp_imm(IntCC::SignedLessThan, count, 0);
        b.ins().brif(negative, bad, &[], ok, &[]);

        b.switch_to_block(bad);
        self.emit_panic(&mut b, PANIC_INVALID_RESERVE, zero_token())?;
        b.ins().jump(ok, &[]);

        b.switch_to_block(ok);
        let count64 = b.ins().uextend(types::I64, count);
        let bytes = b.ins().imul_imm(count64, element.size() as i64);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);
        let new_data = self.call_realloc(&mut b, data, bytes)?;
        b.ins().store(MemFlags::trusted(), new_data, array, 8);
        b.ins().store(MemFlags::trusted(), count, array, 0);
        b.ins().store(MemFlags::trusted(), count, array, 4);

        let index = b.declare_var(types::I32);
        let zero = b.ins().iconst(types::I32, 0);
        b.def_var(index, zero);

        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.ins().jump(header, &[]);

        b.switch_to_block(header);
        let i = b.use_var(index);
        let done = b.ins().icmp(IntCC::SignedGreaterThanOrEqual, i, count);
        b.ins().brif(done, exit, &[], body, &[]);

        b.switch_to_block(body);
        let slot = self.default_value(&mut b, &element)?;
        if let DataType::Array { .. } = element {
            // Nested arrays reserve recursively with the remaining
            // dimension counts.
            let nested = self.array_reserve_item(&element)?;
            let mut args = vec![slot];
            args.extend_from_slice(&rest);
            self.call_item(&mut b, &nested, &args)?;
        }
        let i = b.use_var(index);
        let addr = self.element_addr(&mut b, new_data, i, element.size());
        self.store_mem(&mut b, &element, addr, 0, slot);
        let next = b.ins().iadd_imm(i, 1);
        b.def_var(index, next);
        b.ins().jump(header, &[]);

        b.switch_to_block(exit);
        b.ins().return_(&[]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &key, &mut ctx)?;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // array.toString: copy char-array bytes into a fresh string
    // ------------------------------------------------------------------

    pub(crate) fn array_to_string_item(&mut self) -> Result<FuncItem, String> {
        let key = "array.toString";
        if let Some(item) = self.support.get(key) {
            return Ok(item.clone());
        }

        let item = self.declare_support(key, &[types::I64], Some(types::I64))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let array = b.block_params(entry)[0];

        let length = b.ins().load(types::I32, MemFlags::trusted(), array, 0);
        let length64 = b.ins().uextend(types::I64, length);
        let size = b.ins().iadd_imm(length64, crate::runtime::STRING_HEADER);
        let string = self.call_malloc(&mut b, size)?;
        b.ins().store(MemFlags::trusted(), length, string, 0);
        let dest = b.ins().iadd_imm(string, crate::runtime::STRING_HEADER);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);
        self.call_memcpy(&mut b, dest, data, length64)?;
        b.ins().return_(&[string]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, key, &mut ctx)?;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // string.concat.N: one allocation sized by the sum of the inputs
    // ------------------------------------------------------------------

    pub(crate) fn concat_item(&mut self, count: usize) -> Result<FuncItem, String> {
        let key = if count == 2 {
            "string.concat".to_string()
        } else {
            format!("string.concat.{}", count)
        };
        if let Some(item) = self.support.get(&key) {
            return Ok(item.clone());
        }

        let params = vec![types::I64; count];
        let item = self.declare_support(&key, &params, Some(types::I64))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let parts: Vec<Value> = b.block_params(entry).to_vec();

        let mut lengths = Vec::with_capacity(count);
        let mut total = b.ins().iconst(types::I64, crate::runtime::STRING_HEADER);
        for &part in &parts {
            let length = b.ins().load(types::I32, MemFlags::trusted(), part, 0);
            let length64 = b.ins().uextend(types::I64, length);
            total = b.ins().iadd(total, length64);
            lengths.push(length64);
        }

        let string = self.call_malloc(&mut b, total)?;
        let content = b.ins().iadd_imm(total, -crate::runtime::STRING_HEADER);
        let content32 = b.ins().ireduce(types::I32, content);
        b.ins().store(MemFlags::trusted(), content32, string, 0);

        let mut dest = b.ins().iadd_imm(string, crate::runtime::STRING_HEADER);
        for (position, &part) in parts.iter().enumerate() {
            let source = b.ins().iadd_imm(part, crate::runtime::STRING_HEADER);
            self.call_memcpy(&mut b, dest, source, lengths[position])?;
            if position + 1 != count {
                dest = b.ins().iadd(dest, lengths[position]);
            }
        }

        b.ins().return_(&[string]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &key, &mut ctx)?;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // Polymorphic stringification
    // ------------------------------------------------------------------

    /// Stringifies `value` at a cast site, routing primitives through
    /// the native helpers and structural values through generated
    /// helpers with depth and cycle tracking.
    pub(crate) fn lower_to_string(
        &mut self,
        b: &mut FunctionBuilder,
        value: Value,
        from: &DataType,
        token: Token,
    ) -> Result<Value, String> {
        let _ = token;
        match from {
            DataType::Array { .. } | DataType::Object(_) => {
                let dest = self.string_addr(b, b"")?;
                let depth = b.ins().iconst(types::I32, 0);
                let list = self.default_array(b)?;
                self.emit_string_cast(b, value, from, dest, depth, list)
            }
            _ => {
                let dest = self.string_addr(b, b"")?;
                let depth = b.ins().iconst(types::I32, 0);
                let list = b.ins().iconst(types::I64, 0);
                self.emit_string_cast(b, value, from, dest, depth, list)
            }
        }
    }

    /// One stringification step: primitives replace `dest`, structural
    /// values append to it. Returns the new destination string.
    fn emit_string_cast(
        &mut self,
        b: &mut FunctionBuilder,
        value: Value,
        ty: &DataType,
        dest: Value,
        depth: Value,
        list: Value,
    ) -> Result<Value, String> {
        match ty {
            DataType::Bool => {
                let item = self.import("string.bool_cast", &[types::I32], Some(types::I64))?;
                self.call_value(b, &item, &[value])
            }
            DataType::Int => {
                let item = self.import("string.int_cast", &[types::I32], Some(types::I64))?;
                self.call_value(b, &item, &[value])
            }
            DataType::Float => {
                let item = self.import("string.float_cast", &[types::F32], Some(types::I64))?;
                self.call_value(b, &item, &[value])
            }
            DataType::Char => {
                let item = self.import("string.char_cast", &[types::I32], Some(types::I64))?;
                self.call_value(b, &item, &[value])
            }
            DataType::Str => Ok(value),
            DataType::Array { .. } => {
                let helper = self.string_array_cast_item(ty)?;
                self.call_value(b, &helper, &[value, dest, depth, list])
            }
            DataType::Object(class) => {
                let str_member = self.interner.lookup("__str__").and_then(|name| {
                    match self.ast.class(*class).members.get(&name) {
                        Some(Member::Method(method)) => Some(*method),
                        _ => None,
                    }
                });
                if let Some(method) = str_member {
                    let item = self.func_item(method);
                    let text = self.call_value(b, &item, &[value])?;
                    let concat = self.concat_item(2)?;
                    self.call_value(b, &concat, &[dest, text])
                } else {
                    let helper = self.string_object_cast_item(*class)?;
                    self.call_value(b, &helper, &[value, dest, depth, list])
                }
            }
            _ => {
                // Remaining shapes print their canonical name, or null.
                let name = self.canonical(ty);
                let named = self.string_addr(b, name.as_bytes())?;
                Ok(named)
            }
        }
    }

    /// Generated array stringification: brackets, recursion over the
    /// elements with depth padding, newlines for structural elements.
    fn string_array_cast_item(&mut self, array_ty: &DataType) -> Result<FuncItem, String> {
        let key = format!("string.array_cast.{}", self.canonical(array_ty));
        if let Some(item) = self.support.get(&key) {
            return Ok(item.clone());
        }

        let element = array_ty.element();
        let multiline = matches!(element, DataType::Array { .. } | DataType::Object(_));

        let item = self.declare_support(
            &key,
            &[types::I64, types::I64, types::I32, types::I64],
            Some(types::I64),
        )?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let concat = self.concat_item(2)?;
        let pad = self.import("string.pad", &[types::I64, types::I32], Some(types::I64))?;

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let array = b.block_params(entry)[0];
        let dest_param = b.block_params(entry)[1];
        let depth_param = b.block_params(entry)[2];
        let list = b.block_params(entry)[3];

        let dest = b.declare_var(types::I64);
        b.def_var(dest, dest_param);

        let length = b.ins().load(types::I32, MemFlags::trusted(), array, 0);
        let data = b.ins().load(types::I64, MemFlags::trusted(), array, 8);

        // Opening bracket; a newline follows when the elements are
        // themselves structural and present.
        let open = b.declare_var(types::I64);
        if multiline {
            let empty_open = b.create_block();
            let full_open = b.create_block();
            let after = b.create_block();
            b.ins().brif(length, full_open, &[], empty_open, &[]);
            b.switch_to_block(full_open);
            let text = self.string_addr(&mut b, b"[\n")?;
            b.def_var(open, text);
            b.ins().jump(after, &[]);
            b.switch_to_block(empty_open);
            let text = self.string_addr(&mut b, b"[")?;
            b.def_var(open, text);
            b.ins().jump(after, &[]);
            b.switch_to_block(after);
        } else {
            let text = self.string_addr(&mut b, b"[")?;
            b.def_var(open, text);
        }
        let open_value = b.use_var(open);
        let current = b.use_var(dest);
        let appended = self.call_value(&mut b, &concat, &[current, open_value])?;
        b.def_var(dest, appended);

        let depth = b.ins().iadd_imm(depth_param, 1);

        let index = b.declare_var(types::I32);
        let zero = b.ins().iconst(types::I32, 0);
        b.def_var(index, zero);

        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.ins().jump(header, &[]);

        b.switch_to_block(header);
        let i = b.use_var(index);
        let done = b.ins().icmp(IntCC::SignedGreaterThanOrEqual, i, length);
        b.ins().brif(done, exit, &[], body, &[]);

        b.switch_to_block(body);
        let i = b.use_var(index);
        let addr = self.element_addr(&mut b, data, i, element.size());
        let elem = self.load_mem(&mut b, &element, addr, 0);

        let blank = self.string_addr(&mut b, b"")?;
        let padded = self.call_value(&mut b, &pad, &[blank, depth])?;
        let text = self.emit_string_cast(&mut b, elem, &element, padded, depth, list)?;
        let current = b.use_var(dest);
        let appended = self.call_value(&mut b, &concat, &[current, text])?;
        b.def_var(dest, appended);

        let i = b.use_var(index);
        let next = b.ins().iadd_imm(i, 1);
        b.def_var(index, next);

        // Separator between elements, closing newline after the last.
        let separate = b.create_block();
        let last = b.create_block();
        let after = b.create_block();
        let more = b.ins().icmp(IntCC::SignedLessThan, next, length);
        b.ins().brif(more, separate, &[], last, &[]);

        b.switch_to_block(separate);
        let text = self.string_addr(&mut b, if multiline { b",\n" } else { b", " })?;
        let current = b.use_var(dest);
        let appended = self.call_value(&mut b, &concat, &[current, text])?;
        b.def_var(dest, appended);
        b.ins().jump(after, &[]);

        b.switch_to_block(last);
        if multiline {
            let text = self.string_addr(&mut b, b"\n")?;
            let current = b.use_var(dest);
            let appended = self.call_value(&mut b, &concat, &[current, text])?;
            b.def_var(dest, appended);
        }
        b.ins().jump(after, &[]);

        b.switch_to_block(after);
        b.ins().jump(header, &[]);

        b.switch_to_block(exit);
        let mut close = self.string_addr(&mut b, b"]")?;
        if multiline {
            close = self.call_value(&mut b, &pad, &[close, depth_param])?;
        }
        let current = b.use_var(dest);
        let result = self.call_value(&mut b, &concat, &[current, close])?;
        b.ins().return_(&[result]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &key, &mut ctx)?;
        Ok(item)
    }

    /// Generated object stringification: `ClassName(field = value, …)`
    /// with cycle detection over the in-progress pointer list.
    fn string_object_cast_item(&mut self, class: crate::ast::ClassId) -> Result<FuncItem, String> {
        let class_ty = DataType::Object(class);
        let key = format!("string.object_cast.{}", self.canonical(&class_ty));
        if let Some(item) = self.support.get(&key) {
            return Ok(item.clone());
        }

        let item = self.declare_support(
            &key,
            &[types::I64, types::I64, types::I32, types::I64],
            Some(types::I64),
        )?;

        let class_name = {
            let decl = self.ast.class(class);
            if decl.mangled.is_empty() {
                self.interner.resolve(decl.name.lexeme).to_string()
            } else {
                decl.mangled.clone()
            }
        };
        let fields = self.ast.class(class).fields.clone();

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let concat = self.concat_item(2)?;
        let concat4 = self.concat_item(4)?;
        let pad = self.import("string.pad", &[types::I64, types::I32], Some(types::I64))?;
        let int_cast = self.import("string.int_cast", &[types::I32], Some(types::I64))?;
        let any_array = DataType::array(DataType::Any);
        let push = self.array_push_item(&any_array)?;

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let object = b.block_params(entry)[0];
        let dest_param = b.block_params(entry)[1];
        let depth_param = b.block_params(entry)[2];
        let list = b.block_params(entry)[3];

        let dest = b.declare_var(types::I64);
        b.def_var(dest, dest_param);

        // Null objects print as null.
        let alive = b.create_block();
        let null_block = b.create_block();
        b.ins().brif(object, alive, &[], null_block, &[]);

        b.switch_to_block(null_block);
        let null_text = self.string_addr(&mut b, b"null")?;
        let current = b.use_var(dest);
        let result = self.call_value(&mut b, &concat, &[current, null_text])?;
        b.ins().return_(&[result]);

        b.switch_to_block(alive);

        // Cycle detection: a pointer already on the visiting list prints
        // its class name, its list index, and elides the fields.
        let list_length = b.ins().load(types::I32, MemFlags::trusted(), list, 0);
        let list_data = b.ins().load(types::I64, MemFlags::trusted(), list, 8);

        let index = b.declare_var(types::I32);
        let zero = b.ins().iconst(types::I32, 0);
        b.def_var(index, zero);

        let header = b.create_block();
        let check = b.create_block();
        let cycle = b.create_block();
        let advance = b.create_block();
        let fresh = b.create_block();

        b.ins().jump(header, &[]);
        b.switch_to_block(header);
        let i = b.use_var(index);
        let done = b.ins().icmp(IntCC::SignedGreaterThanOrEqual, i, list_length);
        b.ins().brif(done, fresh, &[], check, &[]);

        b.switch_to_block(check);
        let i = b.use_var(index);
        let addr = self.element_addr(&mut b, list_data, i, 8);
        let visiting = b.ins().load(types::I64, MemFlags::trusted(), addr, 0);
        let same = b.ins().icmp(IntCC::Equal, visiting, object);
        b.ins().brif(same, cycle, &[], advance, &[]);

        b.switch_to_block(advance);
        let i = b.use_var(index);
        let next = b.ins().iadd_imm(i, 1);
        b.def_var(index, next);
        b.ins().jump(header, &[]);

        b.switch_to_block(cycle);
        {
            let plain = b.create_block();
            let numbered = b.create_block();
            let after = b.create_block();
            let i = b.use_var(index);
            b.ins().brif(i, numbered, &[], plain, &[]);

            b.switch_to_block(plain);
            let name_text = self.string_addr(&mut b, class_name.as_bytes())?;
            let current = b.use_var(dest);
            let appended = self.call_value(&mut b, &concat, &[current, name_text])?;
            b.def_var(dest, appended);
            b.ins().jump(after, &[]);

            b.switch_to_block(numbered);
            let dollar = format!("{}$", class_name);
            let name_text = self.string_addr(&mut b, dollar.as_bytes())?;
            let current = b.use_var(dest);
            let appended = self.call_value(&mut b, &concat, &[current, name_text])?;
            b.def_var(dest, appended);
            let i = b.use_var(index);
            let number = self.call_value(&mut b, &int_cast, &[i])?;
            let current = b.use_var(dest);
            let appended = self.call_value(&mut b, &concat, &[current, number])?;
            b.def_var(dest, appended);
            b.ins().jump(after, &[]);

            b.switch_to_block(after);
            let elided = self.string_addr(&mut b, b"(...)")?;
            let current = b.use_var(dest);
            let result = self.call_value(&mut b, &concat, &[current, elided])?;
            b.ins().return_(&[result]);
        }

        b.switch_to_block(fresh);
        {
            // Top-level objects print the bare class name; nested ones
            // carry their visiting-list position.
            let plain = b.create_block();
            let numbered = b.create_block();
            let after = b.create_block();
            b.ins().brif(list_length, numbered, &[], plain, &[]);

            b.switch_to_block(plain);
            let name_text = self.string_addr(&mut b, class_name.as_bytes())?;
            let current = b.use_var(dest);
            let appended = self.call_value(&mut b, &concat, &[current, name_text])?;
            b.def_var(dest, appended);
            b.ins().jump(after, &[]);

            b.switch_to_block(numbered);
            let dollar = format!("{}$", class_name);
            let name_text = self.string_addr(&mut b, dollar.as_bytes())?;
            let current = b.use_var(dest);
            let appended = self.call_value(&mut b, &concat, &[current, name_text])?;
            b.def_var(dest, appended);
            let number = self.call_value(&mut b, &int_cast, &[list_length])?;
            let current = b.use_var(dest);
            let appended = self.call_value(&mut b, &concat, &[current, number])?;
            b.def_var(dest, appended);
            b.ins().jump(after, &[]);

            b.switch_to_block(after);
        }

        let open = self.string_addr(&mut b, if fields.is_empty() { b"(" } else { b"(\n" })?;
        let current = b.use_var(dest);
        let appended = self.call_value(&mut b, &concat, &[current, open])?;
        b.def_var(dest, appended);

        let depth = b.ins().iadd_imm(depth_param, 1);

        self.call_item(&mut b, &push, &[list, object])?;

        for (position, field) in fields.iter().enumerate() {
            let field_ty = self.ast.var(*field).ty.clone();
            let offset = self.ast.var(*field).offset as i32;
            let field_name = self.interner.resolve(self.ast.var(*field).name.lexeme).to_string();

            let value = self.load_mem(&mut b, &field_ty, object, offset);

            let label = format!("{} = ", field_name);
            let label_text = self.string_addr(&mut b, label.as_bytes())?;
            let label_text = self.call_value(&mut b, &pad, &[label_text, depth])?;

            let blank = self.string_addr(&mut b, b"")?;
            let value_text = self.emit_string_cast(&mut b, value, &field_ty, blank, depth, list)?;

            let tail = if position + 1 == fields.len() { &b"\n"[..] } else { &b",\n"[..] };
            let tail_text = self.string_addr(&mut b, tail)?;

            let current = b.use_var(dest);
            let appended = self
                .call_value(&mut b, &concat4, &[current, label_text, value_text, tail_text])?;
            b.def_var(dest, appended);
        }

        let mut close = self.string_addr(&mut b, b")")?;
        if !fields.is_empty() {
            close = self.call_value(&mut b, &pad, &[close, depth_param])?;
        }
        let current = b.use_var(dest);
        let result = self.call_value(&mut b, &concat, &[current, close])?;
        b.ins().return_(&[result]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &key, &mut ctx)?;
        Ok(item)
    }
}
