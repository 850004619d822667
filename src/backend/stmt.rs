use cranelift_codegen::ir::{types, InstBuilder, MemFlags};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{Linkage, Module};

use super::{Backend, FnCtx};
use crate::ast::{ClassId, FnId, Scope, StmtId, StmtKind, VarId};
use crate::types::DataType;

impl<'a> Backend<'a> {
    pub(crate) fn lower_stmts(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        statements: &[StmtId],
    ) -> Result<(), String> {
        for &statement in statements {
            if fx.terminated {
                // Code after a terminator lands in a fresh unreachable
                // block so the current one keeps a single terminator.
                let dead = b.create_block();
                b.switch_to_block(dead);
                fx.terminated = false;
            }
            self.lower_stmt(b, fx, statement)?;
        }
        Ok(())
    }

    fn lower_stmt(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        statement: StmtId,
    ) -> Result<(), String> {
        let kind = self.ast.stmt(statement).kind.clone();

        match kind {
            StmtKind::Expr { expr, .. } => {
                self.lower_expr(b, fx, expr)?;
                Ok(())
            }
            StmtKind::If { condition, then_branch, else_branch } => {
                let condition = self.expect_value(b, fx, condition)?;

                let then_block = b.create_block();
                let else_block = b.create_block();
                let merge = b.create_block();

                b.ins().brif(condition, then_block, &[], else_block, &[]);

                b.switch_to_block(then_block);
                self.lower_stmts(b, fx, &then_branch)?;
                if fx.terminated {
                    fx.terminated = false;
                } else {
                    b.ins().jump(merge, &[]);
                }

                b.switch_to_block(else_block);
                self.lower_stmts(b, fx, &else_branch)?;
                if fx.terminated {
                    fx.terminated = false;
                } else {
                    b.ins().jump(merge, &[]);
                }

                b.switch_to_block(merge);
                Ok(())
            }
            StmtKind::While { initializer, condition, incrementer, body } => {
                self.lower_stmts(b, fx, &initializer)?;

                let header = b.create_block();
                let body_block = b.create_block();
                let incr_block = b.create_block();
                let exit = b.create_block();

                b.ins().jump(header, &[]);

                b.switch_to_block(header);
                let condition = self.expect_value(b, fx, condition)?;
                b.ins().brif(condition, body_block, &[], exit, &[]);

                b.switch_to_block(body_block);
                fx.loops.push((incr_block, exit));
                self.lower_stmts(b, fx, &body)?;
                fx.loops.pop();
                if fx.terminated {
                    fx.terminated = false;
                } else {
                    b.ins().jump(incr_block, &[]);
                }

                b.switch_to_block(incr_block);
                self.lower_stmts(b, fx, &incrementer)?;
                b.ins().jump(header, &[]);

                b.switch_to_block(exit);
                Ok(())
            }
            StmtKind::Return { expr } => {
                match expr {
                    Some(expr) => {
                        let value = self.expect_value(b, fx, expr)?;
                        b.ins().return_(&[value]);
                    }
                    None => {
                        b.ins().return_(&[]);
                    }
                }
                fx.terminated = true;
                Ok(())
            }
            StmtKind::Continue => {
                let target = fx.loops.last().ok_or("'continue' outside a loop")?.0;
                b.ins().jump(target, &[]);
                fx.terminated = true;
                Ok(())
            }
            StmtKind::Break => {
                let target = fx.loops.last().ok_or("'break' outside a loop")?.1;
                b.ins().jump(target, &[]);
                fx.terminated = true;
                Ok(())
            }
            StmtKind::Var(var) => self.lower_var_decl(b, fx, var),
            StmtKind::Func(_) | StmtKind::Class(_) => Ok(()),
            StmtKind::Import { body, .. } => self.lower_stmts(b, fx, &body),
        }
    }

    fn lower_var_decl(
        &mut self,
        b: &mut FunctionBuilder,
        fx: &mut FnCtx,
        var: VarId,
    ) -> Result<(), String> {
        let decl = self.ast.var(var).clone();

        match decl.scope {
            Scope::Local => {
                let value = match decl.initializer {
                    Some(init) => self.expect_value(b, fx, init)?,
                    None => self.default_value(b, &decl.ty)?,
                };
                b.def_var(fx.vars[&var], value);
                Ok(())
            }
            Scope::Global => {
                let value = match decl.initializer {
                    Some(init) => self.expect_value(b, fx, init)?,
                    None => self.default_value(b, &decl.ty)?,
                };
                let data = self.global_data(var);
                let gv = self.module.declare_data_in_func(data, b.func);
                let addr = b.ins().global_value(types::I64, gv);
                b.ins().store(MemFlags::trusted(), value, addr, 0);
                Ok(())
            }
            Scope::Class => Err("field declarations lower inside constructors".to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Function bodies
    // ------------------------------------------------------------------

    pub(crate) fn define_function(&mut self, func: FnId) -> Result<(), String> {
        let item = self.func_item(func);
        let decl = self.ast.func(func);
        let name = decl.mangled.clone();
        let ret = decl.ret.clone();
        let params = decl.params.clone();
        let locals = decl.locals.clone();
        let body = decl.body.clone();
        let is_method = decl.class.is_some();

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);

        let mut fx = FnCtx::new();

        // Registers for parameters and body-declared locals are created
        // up front; locals start from their type's zero value.
        for &local in &locals {
            let ty = self.ast.var(local).ty.clone();
            let variable = b.declare_var(Self::val_type(&ty));
            fx.vars.insert(local, variable);
            let zero = Self::zero_value(&mut b, &ty);
            b.def_var(variable, zero);
        }

        for (position, &param) in params.iter().enumerate() {
            let value = b.block_params(entry)[position];
            b.def_var(fx.vars[&param], value);
        }

        if is_method {
            if let Some(&this) = params.first() {
                fx.this = Some(fx.vars[&this]);
            }
        }

        self.lower_stmts(&mut b, &mut fx, &body)?;

        if !fx.terminated {
            if ret == DataType::Void {
                b.ins().return_(&[]);
            } else {
                let zero = Self::zero_value(&mut b, &ret);
                b.ins().return_(&[zero]);
            }
        }

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &name, &mut ctx)
    }

    fn zero_value(
        b: &mut FunctionBuilder,
        ty: &DataType,
    ) -> cranelift_codegen::ir::Value {
        match ty {
            DataType::Int | DataType::Bool | DataType::Char => b.ins().iconst(types::I32, 0),
            DataType::Float => b.ins().f32const(0.0),
            _ => b.ins().iconst(types::I64, 0),
        }
    }

    // ------------------------------------------------------------------
    // Constructor entries
    // ------------------------------------------------------------------

    /// Defines the constructor-style entry for each initializer (or the
    /// generated default): allocate the object, default-initialize the
    /// fields, run field initializers, then the `__init__` body.
    pub(crate) fn define_constructors(&mut self, class: ClassId) -> Result<(), String> {
        let initializers = self.ast.class(class).initializers.clone();

        if initializers.is_empty() {
            return self.define_constructor(class, None);
        }
        for init in initializers {
            self.define_constructor(class, Some(init))?;
        }
        Ok(())
    }

    fn define_constructor(&mut self, class: ClassId, init: Option<FnId>) -> Result<(), String> {
        let item = self.ctor_item(init, class);
        let class_decl = self.ast.class(class);
        let size = class_decl.size;
        let fields = class_decl.fields.clone();
        let name = if class_decl.mangled.is_empty() {
            self.interner.resolve(class_decl.name.lexeme).to_string()
        } else {
            class_decl.mangled.clone()
        };

        let init_params: Vec<VarId> = match init {
            Some(init) => self.ast.func(init).params.get(1..).unwrap_or(&[]).to_vec(),
            None => Vec::new(),
        };

        let mut ctx = self.module.make_context();
        ctx.func.signature = item.sig.clone();
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);

        let mut fx = FnCtx::new();

        let object = self.call_malloc_imm(&mut b, size as i64)?;
        let this = b.declare_var(types::I64);
        b.def_var(this, object);
        fx.this = Some(this);

        for (position, &param) in init_params.iter().enumerate() {
            let ty = self.ast.var(param).ty.clone();
            let variable = b.declare_var(Self::val_type(&ty));
            let value = b.block_params(entry)[position];
            b.def_var(variable, value);
            fx.vars.insert(param, variable);
        }

        // Every field starts from its default before initializers run.
        for &field in &fields {
            let ty = self.ast.var(field).ty.clone();
            let offset = self.ast.var(field).offset as i32;
            let value = self.default_value(&mut b, &ty)?;
            self.store_mem(&mut b, &ty, object, offset, value);
        }

        for &field in &fields {
            if let Some(initializer) = self.ast.var(field).initializer {
                let ty = self.ast.var(field).ty.clone();
                let offset = self.ast.var(field).offset as i32;
                let value = self.expect_value(&mut b, &mut fx, initializer)?;
                self.store_mem(&mut b, &ty, object, offset, value);
            }
        }

        if let Some(init) = init {
            let body_item = self.func_item(init);
            let mut args = vec![object];
            for &param in &init_params {
                args.push(b.use_var(fx.vars[&param]));
            }
            self.call_item(&mut b, &body_item, &args)?;
        }

        b.ins().return_(&[object]);

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(item.id, &name, &mut ctx)
    }

    // ------------------------------------------------------------------
    // <start>
    // ------------------------------------------------------------------

    /// The auto-generated zero-argument entry point: initializes globals
    /// and executes top-level statements.
    pub(crate) fn define_start(
        &mut self,
        statements: &[StmtId],
        start_locals: &[VarId],
    ) -> Result<(), String> {
        let sig = self.make_sig(&[], &DataType::Void);
        let id = self
            .module
            .declare_function("<start>", Linkage::Local, &sig)
            .map_err(|e| e.to_string())?;
        self.set_start_item(id);

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);

        let mut fx = FnCtx::new();

        for &local in start_locals {
            let ty = self.ast.var(local).ty.clone();
            let variable = b.declare_var(Self::val_type(&ty));
            fx.vars.insert(local, variable);
            let zero = Self::zero_value(&mut b, &ty);
            b.def_var(variable, zero);
        }

        self.lower_stmts(&mut b, &mut fx, statements)?;

        if !fx.terminated {
            b.ins().return_(&[]);
        }

        b.seal_all_blocks();
        b.finalize();
        self.finish_definition(id, "<start>", &mut ctx)
    }
}
