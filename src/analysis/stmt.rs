use super::Analyzer;
use crate::ast::{ClassId, FnId, Scope, StmtId, StmtKind};
use crate::types::DataType;

impl<'a> Analyzer<'a> {
    /// Checks one statement. `top_level` marks the module scope, where
    /// variable declarations become globals.
    pub(crate) fn check_statement(&mut self, statement: StmtId, top_level: bool) {
        let kind = self.ast.stmt(statement).kind.clone();
        let token = self.ast.stmt(statement).token;

        match kind {
            StmtKind::Expr { expr, .. } => {
                let ty = self.check_expression(expr, None);
                if let StmtKind::Expr { ty: slot, .. } = &mut self.ast.stmt_mut(statement).kind {
                    *slot = ty;
                }
            }
            StmtKind::If { condition, then_branch, else_branch } => {
                let ty = self.check_expression(condition, Some(&DataType::Bool));
                if ty != DataType::Bool {
                    self.error_type_mismatch(self.ast.expr(condition).token);
                }
                self.push_scope();
                self.check_block(&then_branch);
                self.pop_scope();
                self.push_scope();
                self.check_block(&else_branch);
                self.pop_scope();
            }
            StmtKind::While { initializer, condition, incrementer, body } => {
                self.push_scope();
                self.check_block(&initializer);
                let ty = self.check_expression(condition, Some(&DataType::Bool));
                if ty != DataType::Bool {
                    self.error_type_mismatch(self.ast.expr(condition).token);
                }
                self.loop_enter();
                self.push_scope();
                self.check_block(&body);
                self.pop_scope();
                self.loop_leave();
                self.check_block(&incrementer);
                self.pop_scope();
            }
            StmtKind::Return { expr } => {
                let ret = match self.current_func {
                    Some(func) => self.ast.func(func).ret.clone(),
                    None => DataType::Void,
                };
                match (expr, ret == DataType::Void) {
                    (Some(expr), false) => {
                        self.check_expression(expr, Some(&ret));
                        let coerced = self.coerce(expr, &ret);
                        if let StmtKind::Return { expr: slot } =
                            &mut self.ast.stmt_mut(statement).kind
                        {
                            *slot = Some(coerced);
                        }
                    }
                    (Some(expr), true) => {
                        self.check_expression(expr, None);
                        self.error(self.ast.expr(expr).token, "Type mismatch.");
                    }
                    (None, false) => {
                        self.error(token, "Type mismatch.");
                    }
                    (None, true) => {}
                }
            }
            StmtKind::Continue => {
                if self.loop_depth() == 0 {
                    self.error(token, "'continue' is only allowed inside a loop.");
                }
            }
            StmtKind::Break => {
                if self.loop_depth() == 0 {
                    self.error(token, "'break' is only allowed inside a loop.");
                }
            }
            StmtKind::Var(var) => {
                let ty_expr = self.ast.var(var).ty_expr.clone();
                let ty = match ty_expr {
                    Some(ty_expr) => self.resolve_type(&ty_expr),
                    None => DataType::Void,
                };
                self.ast.var_mut(var).ty = ty.clone();

                if let Some(init) = self.ast.var(var).initializer {
                    self.check_expression(init, Some(&ty));
                    let coerced = self.coerce(init, &ty);
                    self.ast.var_mut(var).initializer = Some(coerced);
                }

                let name = self.ast.var(var).name;
                if top_level {
                    self.ast.var_mut(var).scope = Scope::Global;
                    self.globals_push(var);
                } else {
                    self.register_local(var);
                }
                self.declare_var(name.lexeme, var, name);
            }
            StmtKind::Func(func) => {
                if !self.ast.func(func).is_template {
                    if self.ast.func(func).mangled.is_empty() {
                        // Nested declarations missed the signature pass.
                        self.resolve_function_signature(func);
                    }
                    if !top_level {
                        self.declare_func(func);
                    }
                    self.check_function_body(func);
                }
            }
            StmtKind::Class(class) => {
                if !self.ast.class(class).is_template {
                    self.check_class_bodies(class);
                }
            }
            StmtKind::Import { body, .. } => {
                for statement in body {
                    self.reset_stmt_error();
                    self.check_statement(statement, top_level);
                }
            }
        }
    }

    pub(crate) fn check_block(&mut self, statements: &[StmtId]) {
        let mut returned = false;
        for &statement in statements {
            self.reset_stmt_error();
            if returned {
                let token = self.ast.stmt(statement).token;
                self.error(token, "Unreachable code.");
            }
            self.check_statement(statement, false);
            returned = returned || self.definitely_returns(statement);
        }
    }

    pub(crate) fn check_function_body(&mut self, func: FnId) {
        if self.ast.func(func).checked || self.ast.func(func).imported {
            return;
        }
        self.ast.func_mut(func).checked = true;

        let previous = self.enter_function(func);
        let previous_class = self.current_class;
        self.current_class = self.ast.func(func).class;

        self.push_scope();

        let params = self.ast.func(func).params.clone();
        for param in params {
            self.register_local(param);
            let name = self.ast.var(param).name;
            self.declare_var(name.lexeme, param, name);
        }

        let body = self.ast.func(func).body.clone();
        self.check_block(&body);

        self.pop_scope();

        let ret = self.ast.func(func).ret.clone();
        if ret != DataType::Void && !self.block_returns(&body) {
            let token = self.ast.func(func).name;
            self.reset_stmt_error();
            self.error(token, "Function does not return on all paths.");
        }

        self.current_class = previous_class;
        self.leave_function(previous);
    }

    pub(crate) fn check_class_bodies(&mut self, class: ClassId) {
        let previous_class = self.current_class;
        self.current_class = Some(class);

        // Field initializers run inside the constructor, with this bound.
        let fields = self.ast.class(class).fields.clone();
        for field in fields {
            if let Some(init) = self.ast.var(field).initializer {
                self.reset_stmt_error();
                let ty = self.ast.var(field).ty.clone();
                self.check_expression(init, Some(&ty));
                let coerced = self.coerce(init, &ty);
                self.ast.var_mut(field).initializer = Some(coerced);
            }
        }

        let methods = self.ast.class(class).methods.clone();
        for method in methods {
            if !self.ast.func(method).is_template {
                self.reset_stmt_error();
                self.check_function_body(method);
            }
        }

        self.current_class = previous_class;
    }

    fn definitely_returns(&self, statement: StmtId) -> bool {
        match &self.ast.stmt(statement).kind {
            StmtKind::Return { .. } => true,
            StmtKind::If { then_branch, else_branch, .. } => {
                !else_branch.is_empty()
                    && self.block_returns(then_branch)
                    && self.block_returns(else_branch)
            }
            _ => false,
        }
    }

    pub(crate) fn block_returns(&self, statements: &[StmtId]) -> bool {
        statements.iter().any(|&s| self.definitely_returns(s))
    }

    fn loop_enter(&mut self) {
        self.set_loop_depth(self.loop_depth() + 1);
    }

    fn loop_leave(&mut self) {
        self.set_loop_depth(self.loop_depth() - 1);
    }
}
