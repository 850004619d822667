use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};
use cranelift_frontend::FunctionBuilder;
use cranelift_module::Module;

use super::{Backend, FnCtx, FuncItem};
use super::{PANIC_DIVISION_BY_ZERO, PANIC_INVALID_CAST, PANIC_NULL_ACCESS, PANIC_NULL_CALL,
    PANIC_OUT_OF_BOUNDS};
use crate::ast::{ExprId, ExprKind, FnId, Literal, Scope};
use crate::token::{Token, TokenKind};
use crate::types::DataType;

impl<'a> Backend<'a> {
    pub(crate) fn lower_expr(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        expr: ExprId,
    ) -> Result<Option<Value>, String> {
        let kind = self.ast.expr(expr).kind.clone();
        let token = self.ast.expr(expr).token;
        let ty = self.ast.expr(expr).ty.clone();

        match kind {
            ExprKind::Literal(literal) => self.lower_literal(b, &literal),
            ExprKind::Group(inner) => self.lower_expr(b, fx, inner),
            ExprKind::Unary { op, expr: inner } => {
                let value = self.expect_value(b, fx, inner)?;
                let result = match op.kind {
                    TokenKind::Tilde => {
                        // xor with 0xFFFFFFFF
                        let ones = b.ins().iconst(types::I32, -1);
                        b.ins().bxor(value, ones)
                    }
                    TokenKind::Minus => {
                        if ty == DataType::Float {
                            b.ins().fneg(value)
                        } else {
                            b.ins().ineg(value)
                        }
                    }
                    TokenKind::Bang | TokenKind::Not => {
                        let flag = b.ins().icmp_imm(IntCC::Equal, value, 0);
                        b.ins().uextend(types::I32, flag)
                    }
                    _ => return Err("unhandled unary operator".to_string()),
                };
                Ok(Some(result))
            }
            ExprKind::Binary { op, left, right, operand_ty, method } => {
                self.lower_binary(b, fx, expr, op, left, right, &operand_ty, method)
            }
            ExprKind::Var { var, .. } => {
                if ty.is_callable_decl() {
                    return Ok(Some(self.function_pointer(b, &ty)?));
                }
                let var = var.ok_or("unresolved variable")?;
                match self.ast.var(var).scope {
                    Scope::Local => Ok(Some(b.use_var(fx.vars[&var]))),
                    Scope::Global => {
                        let data = self.global_data(var);
                        let gv = self.module.declare_data_in_func(data, b.func);
                        let addr = b.ins().global_value(types::I64, gv);
                        Ok(Some(b.ins().load(
                            Self::val_type(&ty),
                            MemFlags::trusted(),
                            addr,
                            0,
                        )))
                    }
                    Scope::Class => Err("class fields read through this".to_string()),
                }
            }
            ExprKind::This => {
                let this = fx.this.ok_or("'this' outside a method")?;
                Ok(Some(b.use_var(this)))
            }
            ExprKind::Assign { target, value, var, method, value_ty } => {
                self.lower_assignment(b, fx, target, value, var, method, &value_ty)
            }
            ExprKind::Call { callee, args, func, callee_ty, ret_ty } => {
                self.lower_call(b, fx, token, callee, &args, func, &callee_ty, &ret_ty)
            }
            ExprKind::Cast { expr: inner, from, .. } => {
                self.lower_cast(b, fx, token, inner, &from, &ty)
            }
            ExprKind::Access { expr: object, name, var, object_ty } => {
                self.lower_access(b, fx, &ty, object, name, var, &object_ty)
            }
            ExprKind::Index { expr: target, index, expr_ty, method } => {
                self.lower_index(b, fx, token, &ty, target, index, &expr_ty, method)
            }
            ExprKind::ArrayLit { elems } => self.lower_array_literal(b, fx, &ty, &elems),
            ExprKind::Cond { cond, then, other } => {
                let result = b.declare_var(Self::val_type(&ty));
                let cond_value = self.expect_value(b, fx, cond)?;

                let then_block = b.create_block();
                let other_block = b.create_block();
                let merge = b.create_block();

                b.ins().brif(cond_value, then_block, &[], other_block, &[]);

                b.switch_to_block(then_block);
                let then_value = self.expect_value(b, fx, then)?;
                b.def_var(result, then_value);
                b.ins().jump(merge, &[]);

                b.switch_to_block(other_block);
                let other_value = self.expect_value(b, fx, other)?;
                b.def_var(result, other_value);
                b.ins().jump(merge, &[]);

                b.switch_to_block(merge);
                Ok(Some(b.use_var(result)))
            }
            ExprKind::IsTest { expr: inner, target, .. } => {
                let value = self.expect_value(b, fx, inner)?;
                let flag = if target == DataType::Any {
                    b.ins().icmp_imm(IntCC::NotEqual, value, 0)
                } else {
                    let id = self.typeid(&target);
                    let tag = b.ins().ushr_imm(value, 48);
                    b.ins().icmp_imm(IntCC::Equal, tag, id as i64)
                };
                Ok(Some(b.ins().uextend(types::I32, flag)))
            }
        }
    }

    pub(crate) fn expect_value(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        expr: ExprId,
    ) -> Result<Value, String> {
        self.lower_expr(b, fx, expr)?.ok_or_else(|| "expected a value".to_string())
    }

    fn lower_literal(
        &mut self,
        b: &mut FunctionBuilder,
        literal: &Literal,
    ) -> Result<Option<Value>, String> {
        let value = match literal {
            Literal::Int(value) => b.ins().iconst(types::I32, *value as i64),
            Literal::Bool(value) => b.ins().iconst(types::I32, *value as i64),
            Literal::Float(value) => b.ins().f32const(*value),
            Literal::Null => b.ins().iconst(types::I64, 0),
            Literal::Str(symbol) => {
                let bytes = self.interner.resolve(*symbol).as_bytes().to_vec();
                self.string_addr(b, &bytes)?
            }
        };
        Ok(Some(value))
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_binary(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        expr: ExprId,
        op: Token,
        left: ExprId,
        right: ExprId,
        operand_ty: &DataType,
        method: Option<FnId>,
    ) -> Result<Option<Value>, String> {
        // Logical operators short-circuit: the right side only runs when
        // the left side does not decide the result.
        if op.kind == TokenKind::And || op.kind == TokenKind::Or {
            let result = b.declare_var(types::I32);
            let left_value = self.expect_value(b, fx, left)?;

            let right_block = b.create_block();
            let short_block = b.create_block();
            let merge = b.create_block();

            if op.kind == TokenKind::And {
                b.ins().brif(left_value, right_block, &[], short_block, &[]);
            } else {
                b.ins().brif(left_value, short_block, &[], right_block, &[]);
            }

            b.switch_to_block(short_block);
            let short_value =
                b.ins().iconst(types::I32, (op.kind == TokenKind::Or) as i64);
            b.def_var(result, short_value);
            b.ins().jump(merge, &[]);

            b.switch_to_block(right_block);
            let right_value = self.expect_value(b, fx, right)?;
            b.def_var(result, right_value);
            b.ins().jump(merge, &[]);

            b.switch_to_block(merge);
            return Ok(Some(b.use_var(result)));
        }

        // String concatenation collects the whole plus chain and calls a
        // single n-ary concat sized once.
        if op.kind == TokenKind::Plus && *operand_ty == DataType::Str {
            let mut parts = Vec::new();
            self.flatten_concat(expr, &mut parts);

            let item = self.concat_item(parts.len())?;
            let mut args = Vec::with_capacity(parts.len());
            for part in parts {
                args.push(self.expect_value(b, fx, part)?);
            }
            return self.call_item(b, &item, &args);
        }

        // Object operators dispatch through the class's member.
        if let Some(method) = method {
            let left_value = self.expect_value(b, fx, left)?;
            let right_value = self.expect_value(b, fx, right)?;
            let item = self.func_item(method);
            return self.call_item(b, &item, &[left_value, right_value]);
        }

        if let DataType::Object(_) | DataType::Any | DataType::Null = operand_ty {
            // Pointer equality.
            let left_value = self.expect_value(b, fx, left)?;
            let right_value = self.expect_value(b, fx, right)?;
            let cc = if op.kind == TokenKind::EqualEqual { IntCC::Equal } else { IntCC::NotEqual };
            let flag = b.ins().icmp(cc, left_value, right_value);
            return Ok(Some(b.ins().uextend(types::I32, flag)));
        }

        if *operand_ty == DataType::Str {
            // Content equality through the runtime helper.
            let left_value = self.expect_value(b, fx, left)?;
            let right_value = self.expect_value(b, fx, right)?;
            let item =
                self.import("string.equals", &[types::I64, types::I64], Some(types::I32))?;
            let equal = self.call_value(b, &item, &[left_value, right_value])?;
            let result = match op.kind {
                TokenKind::EqualEqual => equal,
                TokenKind::BangEqual => {
                    let flag = b.ins().icmp_imm(IntCC::Equal, equal, 0);
                    b.ins().uextend(types::I32, flag)
                }
                _ => return Err("unhandled string operator".to_string()),
            };
            return Ok(Some(result));
        }

        let left_value = self.expect_value(b, fx, left)?;
        let right_value = self.expect_value(b, fx, right)?;

        if *operand_ty == DataType::Float {
            let result = match op.kind {
                TokenKind::Plus => b.ins().fadd(left_value, right_value),
                TokenKind::Minus => b.ins().fsub(left_value, right_value),
                TokenKind::Star => b.ins().fmul(left_value, right_value),
                TokenKind::Slash => b.ins().fdiv(left_value, right_value),
                TokenKind::EqualEqual
                | TokenKind::BangEqual
                | TokenKind::Less
                | TokenKind::LessEqual
                | TokenKind::Greater
                | TokenKind::GreaterEqual => {
                    let cc = match op.kind {
                        TokenKind::EqualEqual => FloatCC::Equal,
                        TokenKind::BangEqual => FloatCC::NotEqual,
                        TokenKind::Less => FloatCC::LessThan,
                        TokenKind::LessEqual => FloatCC::LessThanOrEqual,
                        TokenKind::Greater => FloatCC::GreaterThan,
                        _ => FloatCC::GreaterThanOrEqual,
                    };
                    let flag = b.ins().fcmp(cc, left_value, right_value);
                    b.ins().uextend(types::I32, flag)
                }
                _ => return Err("unhandled float operator".to_string()),
            };
            return Ok(Some(result));
        }

        let result = match op.kind {
            TokenKind::Plus => b.ins().iadd(left_value, right_value),
            TokenKind::Minus => b.ins().isub(left_value, right_value),
            TokenKind::Star => b.ins().imul(left_value, right_value),
            TokenKind::Slash => {
                self.emit_zero_check(b, right_value, op)?;
                b.ins().sdiv(left_value, right_value)
            }
            TokenKind::Percent => {
                self.emit_zero_check(b, right_value, op)?;
                b.ins().srem(left_value, right_value)
            }
            TokenKind::Ampersand => b.ins().band(left_value, right_value),
            TokenKind::Pipe => b.ins().bor(left_value, right_value),
            TokenKind::Caret => b.ins().bxor(left_value, right_value),
            TokenKind::LessLess => b.ins().ishl(left_value, right_value),
            TokenKind::GreaterGreater => b.ins().ushr(left_value, right_value),
            TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => {
                let cc = match op.kind {
                    TokenKind::EqualEqual => IntCC::Equal,
                    TokenKind::BangEqual => IntCC::NotEqual,
                    TokenKind::Less => IntCC::SignedLessThan,
                    TokenKind::LessEqual => IntCC::SignedLessThanOrEqual,
                    TokenKind::Greater => IntCC::SignedGreaterThan,
                    _ => IntCC::SignedGreaterThanOrEqual,
                };
                let flag = b.ins().icmp(cc, left_value, right_value);
                b.ins().uextend(types::I32, flag)
            }
            _ => return Err("unhandled integer operator".to_string()),
        };
        Ok(Some(result))
    }

    fn emit_zero_check(
        &mut self,
        b: &mut FunctionBuilder,
        divisor: Value,
        token: Token,
    ) -> Result<(), String> {
        let ok = b.create_block();
        let bad = b.create_block();
        b.ins().brif(divisor, ok, &[], bad, &[]);
        b.switch_to_block(bad);
        self.emit_panic(b, PANIC_DIVISION_BY_ZERO, token)?;
        b.ins().jump(ok, &[]);
        b.switch_to_block(ok);
        Ok(())
    }

    fn flatten_concat(&self, expr: ExprId, out: &mut Vec<ExprId>) {
        match &self.ast.expr(expr).kind {
            ExprKind::Binary { op, left, right, operand_ty, .. }
                if op.kind == TokenKind::Plus && *operand_ty == DataType::Str =>
            {
                self.flatten_concat(*left, out);
                self.flatten_concat(*right, out);
            }
            ExprKind::Group(inner) => self.flatten_concat(*inner, out),
            _ => out.push(expr),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_assignment(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        target: ExprId,
        value: ExprId,
        var: Option<crate::ast::VarId>,
        method: Option<FnId>,
        value_ty: &DataType,
    ) -> Result<Option<Value>, String> {
        let target_kind = self.ast.expr(target).kind.clone();

        match target_kind {
            ExprKind::Var { .. } => {
                let value_value = self.expect_value(b, fx, value)?;
                let var = var.ok_or("unresolved assignment target")?;
                match self.ast.var(var).scope {
                    Scope::Local => {
                        b.def_var(fx.vars[&var], value_value);
                    }
                    Scope::Global => {
                        let data = self.global_data(var);
                        let gv = self.module.declare_data_in_func(data, b.func);
                        let addr = b.ins().global_value(types::I64, gv);
                        b.ins().store(MemFlags::trusted(), value_value, addr, 0);
                    }
                    Scope::Class => return Err("unlowered field assignment".to_string()),
                }
                Ok(Some(value_value))
            }
            ExprKind::Access { expr: object, name, .. } => {
                let value_value = self.expect_value(b, fx, value)?;
                let field = var.ok_or("unresolved field assignment")?;
                let object_value = self.expect_value(b, fx, object)?;
                self.emit_null_check(b, PANIC_NULL_ACCESS, object_value, name)?;
                let offset = self.ast.var(field).offset as i32;
                self.store_mem(b, value_ty, object_value, offset, value_value);
                Ok(Some(value_value))
            }
            ExprKind::Index { expr: array, index, expr_ty, .. } => match &expr_ty {
                DataType::Object(_) => {
                    let setter = method.ok_or("unresolved index setter")?;
                    let object_value = self.expect_value(b, fx, array)?;
                    let index_value = self.expect_value(b, fx, index)?;
                    let value_value = self.expect_value(b, fx, value)?;
                    let item = self.func_item(setter);
                    self.call_item(b, &item, &[object_value, index_value, value_value])?;
                    Ok(Some(value_value))
                }
                DataType::Array { .. } => {
                    let array_value = self.expect_value(b, fx, array)?;
                    let index_value = self.expect_value(b, fx, index)?;
                    let value_value = self.expect_value(b, fx, value)?;

                    let index_token = self.ast.expr(index).token;
                    let length =
                        b.ins().load(types::I32, MemFlags::trusted(), array_value, 0);
                    self.emit_bounds_check(b, index_value, length, index_token)?;

                    let element = expr_ty.element();
                    let data =
                        b.ins().load(types::I64, MemFlags::trusted(), array_value, 8);
                    let addr = self.element_addr(b, data, index_value, element.size());
                    self.store_mem(b, &element, addr, 0, value_value);
                    Ok(Some(value_value))
                }
                _ => Err("unhandled indexed assignment".to_string()),
            },
            _ => Err("unhandled assignment target".to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_call(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        token: Token,
        callee: ExprId,
        args: &[ExprId],
        func: Option<FnId>,
        callee_ty: &DataType,
        ret_ty: &DataType,
    ) -> Result<Option<Value>, String> {
        match callee_ty {
            DataType::FunctionInternal { name, params, ret } => {
                let receiver = self.call_receiver(b, fx, callee)?;
                let item = self.internal_item(name, params, ret)?;
                let mut values = Vec::with_capacity(args.len() + 1);
                if let Some(receiver) = receiver {
                    values.push(receiver);
                }
                for &arg in args {
                    values.push(self.expect_value(b, fx, arg)?);
                }
                self.call_item(b, &item, &values)
            }
            DataType::FunctionMember(_) => {
                let func = func.ok_or("unresolved method call")?;
                let receiver = self
                    .call_receiver(b, fx, callee)?
                    .ok_or("method call without a receiver")?;
                let mut values = Vec::with_capacity(args.len() + 1);
                values.push(receiver);
                for &arg in args {
                    values.push(self.expect_value(b, fx, arg)?);
                }
                let item = self.func_item(func);
                self.call_item(b, &item, &values)
            }
            DataType::Function(_) => {
                let func = func.ok_or("unresolved call")?;
                let mut values = Vec::with_capacity(args.len());
                for &arg in args {
                    values.push(self.expect_value(b, fx, arg)?);
                }
                let item = self.func_item(func);
                self.call_item(b, &item, &values)
            }
            DataType::Prototype(class) => {
                let mut values = Vec::with_capacity(args.len());
                for &arg in args {
                    values.push(self.expect_value(b, fx, arg)?);
                }
                let item = self.ctor_item(func, *class);
                self.call_item(b, &item, &values)
            }
            DataType::FunctionPointer { params, ret } => {
                let pointer = self.expect_value(b, fx, callee)?;
                self.emit_null_check(b, PANIC_NULL_CALL, pointer, token)?;

                let mut values = Vec::with_capacity(args.len());
                for &arg in args {
                    values.push(self.expect_value(b, fx, arg)?);
                }

                let sig = self.make_sig(params, ret);
                let sig_ref = b.import_signature(sig);
                let call = b.ins().call_indirect(sig_ref, pointer, &values);
                let results = b.inst_results(call);
                if **ret == DataType::Void || results.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(results[0]))
                }
            }
            _ => {
                let _ = ret_ty;
                Err("unhandled callee".to_string())
            }
        }
    }

    /// Receiver of a member or internal call: the accessed object.
    fn call_receiver(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        callee: ExprId,
    ) -> Result<Option<Value>, String> {
        let kind = self.ast.expr(callee).kind.clone();
        match kind {
            ExprKind::Access { expr: object, .. } => Ok(Some(self.expect_value(b, fx, object)?)),
            _ => Ok(None),
        }
    }

    pub(crate) fn call_item(
        &mut self,
        b: &mut FunctionBuilder,
        item: &FuncItem,
        args: &[Value],
    ) -> Result<Option<Value>, String> {
        let fref = self.module.declare_func_in_func(item.id, b.func);
        let call = b.ins().call(fref, args);
        let results = b.inst_results(call);
        if results.is_empty() {
            Ok(None)
        } else {
            Ok(Some(results[0]))
        }
    }

    /// Calls a routine that returns a value.
    pub(crate) fn call_value(
        &mut self,
        b: &mut FunctionBuilder,
        item: &FuncItem,
        args: &[Value],
    ) -> Result<Value, String> {
        self.call_item(b, item, args)?.ok_or_else(|| "missing call result".to_string())
    }

    fn function_pointer(
        &mut self,
        b: &mut FunctionBuilder,
        ty: &DataType,
    ) -> Result<Value, String> {
        let item = match ty {
            DataType::Function(func) | DataType::FunctionMember(func) => self.func_item(*func),
            DataType::FunctionInternal { name, params, ret } => {
                self.internal_item(name, params, ret)?
            }
            _ => return Err("unhandled function reference".to_string()),
        };
        let fref = self.module.declare_func_in_func(item.id, b.func);
        Ok(b.ins().func_addr(types::I64, fref))
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_access(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        ty: &DataType,
        object: ExprId,
        name: Token,
        var: Option<crate::ast::VarId>,
        object_ty: &DataType,
    ) -> Result<Option<Value>, String> {
        if ty.is_callable_decl() {
            // Method references lower at the call or cast site; reads
            // produce the raw function address.
            return Ok(Some(self.function_pointer(b, ty)?));
        }

        let object_value = self.expect_value(b, fx, object)?;
        let member = self.interner.resolve(name.lexeme);

        match object_ty {
            DataType::Str => {
                // length
                Ok(Some(b.ins().load(types::I32, MemFlags::trusted(), object_value, 0)))
            }
            DataType::Array { .. } => {
                let offset = if member == "capacity" { 4 } else { 0 };
                Ok(Some(b.ins().load(types::I32, MemFlags::trusted(), object_value, offset)))
            }
            DataType::Object(_) => {
                let field = var.ok_or("unresolved field access")?;
                self.emit_null_check(b, PANIC_NULL_ACCESS, object_value, name)?;
                let offset = self.ast.var(field).offset as i32;
                Ok(Some(self.load_mem(b, ty, object_value, offset)))
            }
            _ => Err("unhandled member access".to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_index(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        token: Token,
        ty: &DataType,
        target: ExprId,
        index: ExprId,
        expr_ty: &DataType,
        method: Option<FnId>,
    ) -> Result<Option<Value>, String> {
        let target_value = self.expect_value(b, fx, target)?;
        let index_value = self.expect_value(b, fx, index)?;
        let index_token = self.ast.expr(index).token;

        match expr_ty {
            DataType::Str => {
                let length = b.ins().load(types::I32, MemFlags::trusted(), target_value, 0);
                self.emit_bounds_check(b, index_value, length, index_token)?;
                let index64 = b.ins().uextend(types::I64, index_value);
                let addr = b.ins().iadd(target_value, index64);
                Ok(Some(b.ins().uload8(types::I32, MemFlags::trusted(), addr, 4)))
            }
            DataType::Array { .. } => {
                let length = b.ins().load(types::I32, MemFlags::trusted(), target_value, 0);
                self.emit_bounds_check(b, index_value, length, index_token)?;
                let element = expr_ty.element();
                let data = b.ins().load(types::I64, MemFlags::trusted(), target_value, 8);
                let addr = self.element_addr(b, data, index_value, element.size());
                Ok(Some(self.load_mem(b, &element, addr, 0)))
            }
            DataType::Object(_) => {
                let getter = method.ok_or("unresolved index member")?;
                let item = self.func_item(getter);
                let _ = (token, ty);
                self.call_item(b, &item, &[target_value, index_value])
            }
            _ => Err("unhandled index target".to_string()),
        }
    }

    fn lower_array_literal(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        ty: &DataType,
        elems: &[ExprId],
    ) -> Result<Option<Value>, String> {
        if elems.is_empty() {
            return Ok(Some(self.default_array(b)?));
        }

        let element = ty.element();
        let size = element.size();

        let array = self.call_malloc_imm(b, crate::runtime::ARRAY_HEADER_SIZE)?;
        let data = self.call_malloc_imm(b, size as i64 * elems.len() as i64)?;

        let count = b.ins().iconst(types::I32, elems.len() as i64);
        b.ins().store(MemFlags::trusted(), count, array, 0);
        b.ins().store(MemFlags::trusted(), count, array, 4);
        b.ins().store(MemFlags::trusted(), data, array, 8);

        for (position, &elem) in elems.iter().enumerate() {
            let value = self.expect_value(b, fx, elem)?;
            self.store_mem(b, &element, data, (position as u32 * size) as i32, value);
        }

        Ok(Some(array))
    }

    // ------------------------------------------------------------------
    // Memory helpers
    // ------------------------------------------------------------------

    // Fields may land unaligned under the sequential layout, so element
    // and field accesses never claim alignment.
    pub(crate) fn load_mem(
        &mut self,
        b: &mut FunctionBuilder,
        ty: &DataType,
        addr: Value,
        offset: i32,
    ) -> Value {
        match ty {
            DataType::Bool | DataType::Char => {
                b.ins().uload8(types::I32, MemFlags::new(), addr, offset)
            }
            DataType::Int => b.ins().load(types::I32, MemFlags::new(), addr, offset),
            DataType::Float => b.ins().load(types::F32, MemFlags::new(), addr, offset),
            _ => b.ins().load(types::I64, MemFlags::new(), addr, offset),
        }
    }

    pub(crate) fn store_mem(
        &mut self,
        b: &mut FunctionBuilder,
        ty: &DataType,
        addr: Value,
        offset: i32,
        value: Value,
    ) {
        match ty {
            DataType::Bool | DataType::Char => {
                b.ins().istore8(MemFlags::new(), value, addr, offset);
            }
            _ => {
                b.ins().store(MemFlags::new(), value, addr, offset);
            }
        }
    }

    pub(crate) fn element_addr(
        &mut self,
        b: &mut FunctionBuilder,
        data: Value,
        index: Value,
        size: u32,
    ) -> Value {
        let index64 = b.ins().uextend(types::I64, index);
        let scaled = b.ins().imul_imm(index64, size as i64);
        b.ins().iadd(data, scaled)
    }

    pub(crate) fn emit_bounds_check(
        &mut self,
        b: &mut FunctionBuilder,
        index: Value,
        length: Value,
        token: Token,
    ) -> Result<(), String> {
        let ok = b.create_block();
        let bad = b.create_block();
        let out = b.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, index, length);
        b.ins().brif(out, bad, &[], ok, &[]);
        b.switch_to_block(bad);
        self.emit_panic(b, PANIC_OUT_OF_BOUNDS, token)?;
        b.ins().jump(ok, &[]);
        b.switch_to_block(ok);
        Ok(())
    }

    pub(crate) fn call_malloc_imm(
        &mut self,
        b: &mut FunctionBuilder,
        size: i64,
    ) -> Result<Value, String> {
        let size_value = b.ins().iconst(types::I64, size);
        self.call_malloc(b, size_value)
    }

    pub(crate) fn call_malloc(
        &mut self,
        b: &mut FunctionBuilder,
        size: Value,
    ) -> Result<Value, String> {
        let item = self.import("malloc", &[types::I64], Some(types::I64))?;
        self.call_value(b, &item, &[size])
    }

    pub(crate) fn call_realloc(
        &mut self,
        b: &mut FunctionBuilder,
        pointer: Value,
        size: Value,
    ) -> Result<Value, String> {
        let item = self.import("realloc", &[types::I64, types::I64], Some(types::I64))?;
        self.call_value(b, &item, &[pointer, size])
    }

    pub(crate) fn call_memcpy(
        &mut self,
        b: &mut FunctionBuilder,
        dest: Value,
        source: Value,
        size: Value,
    ) -> Result<(), String> {
        let item = self.import("memcpy", &[types::I64, types::I64, types::I64], None)?;
        self.call_item(b, &item, &[dest, source, size])?;
        Ok(())
    }

    /// Freshly allocated empty array header: zero length, zero capacity,
    /// null data.
    pub(crate) fn default_array(&mut self, b: &mut FunctionBuilder) -> Result<Value, String> {
        let array = self.call_malloc_imm(b, crate::runtime::ARRAY_HEADER_SIZE)?;
        let zero32 = b.ins().iconst(types::I32, 0);
        let zero64 = b.ins().iconst(types::I64, 0);
        b.ins().store(MemFlags::trusted(), zero32, array, 0);
        b.ins().store(MemFlags::trusted(), zero32, array, 4);
        b.ins().store(MemFlags::trusted(), zero64, array, 8);
        Ok(array)
    }

    /// Default value of a type: zero for numbers, booleans and
    /// references, the interned empty string, a fresh empty array.
    pub(crate) fn default_value(
        &mut self,
        b: &mut FunctionBuilder,
        ty: &DataType,
    ) -> Result<Value, String> {
        Ok(match ty {
            DataType::Int | DataType::Bool | DataType::Char => b.ins().iconst(types::I32, 0),
            DataType::Float => b.ins().f32const(0.0),
            DataType::Str => self.string_addr(b, b"")?,
            DataType::Array { .. } => self.default_array(b)?,
            _ => b.ins().iconst(types::I64, 0),
        })
    }

    // ------------------------------------------------------------------
    // Casts
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn lower_cast(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        token: Token,
        inner: ExprId,
        from: &DataType,
        to: &DataType,
    ) -> Result<Option<Value>, String> {
        let value = self.expect_value(b, fx, inner)?;

        if from == to {
            return Ok(Some(value));
        }

        // any -> concrete: dynamic type check against the expected id,
        // panic on mismatch, then strip the tag.
        if *from == DataType::Any {
            if *to == DataType::Bool {
                let flag = b.ins().icmp_imm(IntCC::NotEqual, value, 0);
                return Ok(Some(b.ins().uextend(types::I32, flag)));
            }

            let id = self.typeid(to);
            let tag = b.ins().ushr_imm(value, 48);

            let ok = b.create_block();
            let bad = b.create_block();
            let matches = b.ins().icmp_imm(IntCC::Equal, tag, id as i64);
            b.ins().brif(matches, ok, &[], bad, &[]);
            b.switch_to_block(bad);
            self.emit_panic(b, PANIC_INVALID_CAST, token)?;
            b.ins().jump(ok, &[]);
            b.switch_to_block(ok);

            let payload = b.ins().band_imm(value, 0xFFFF_FFFF_FFFFi64);
            let result = match to {
                DataType::Int | DataType::Char => b.ins().ireduce(types::I32, payload),
                DataType::Bool => unreachable!(),
                DataType::Float => {
                    let bits = b.ins().ireduce(types::I32, payload);
                    b.ins().bitcast(types::F32, MemFlags::new(), bits)
                }
                _ => payload,
            };
            return Ok(Some(result));
        }

        // concrete -> any: widen and tag with the type id.
        if *to == DataType::Any {
            if *from == DataType::Null {
                return Ok(Some(value));
            }
            let id = self.typeid(from) as i64;
            let wide = match from {
                DataType::Int | DataType::Bool | DataType::Char => {
                    b.ins().uextend(types::I64, value)
                }
                DataType::Float => {
                    let bits = b.ins().bitcast(types::I32, MemFlags::new(), value);
                    b.ins().uextend(types::I64, bits)
                }
                _ => value,
            };
            return Ok(Some(b.ins().bor_imm(wide, id << 48)));
        }

        if *to == DataType::Str {
            return Ok(Some(self.lower_to_string(b, value, from, token)?));
        }

        let result = match (from, to) {
            (DataType::Int | DataType::Bool, DataType::Float) => {
                b.ins().fcvt_from_sint(types::F32, value)
            }
            (DataType::Float, DataType::Int) => b.ins().fcvt_to_sint_sat(types::I32, value),
            (DataType::Char | DataType::Bool, DataType::Int) => value,
            (DataType::Int, DataType::Char) => b.ins().band_imm(value, 0xFF),
            (DataType::Float, DataType::Bool) => {
                let zero = b.ins().f32const(0.0);
                let flag = b.ins().fcmp(FloatCC::NotEqual, value, zero);
                b.ins().uextend(types::I32, flag)
            }
            (DataType::Int, DataType::Bool) => {
                let flag = b.ins().icmp_imm(IntCC::NotEqual, value, 0);
                b.ins().uextend(types::I32, flag)
            }
            (DataType::Str, DataType::Bool) => {
                let length = b.ins().load(types::I32, MemFlags::trusted(), value, 0);
                let flag = b.ins().icmp_imm(IntCC::NotEqual, length, 0);
                b.ins().uextend(types::I32, flag)
            }
            (DataType::Null | DataType::Object(_) | DataType::FunctionPointer { .. },
                DataType::Bool) => {
                let flag = b.ins().icmp_imm(IntCC::NotEqual, value, 0);
                b.ins().uextend(types::I32, flag)
            }
            (DataType::Null, _) => value,
            (
                DataType::Function(_)
                | DataType::FunctionMember(_)
                | DataType::FunctionInternal { .. },
                DataType::FunctionPointer { .. },
            ) => self.function_pointer(b, from)?,
            _ => return Err("unhandled cast".to_string()),
        };
        Ok(Some(result))
    }
}
