//! Semantic analyzer.
//!
//! A single pass over the AST assigns data types, resolves identifiers to
//! their declarations, instantiates templates, inserts implicit casts and
//! verifies operator applicability. Errors are reported with spans and a
//! fatal flag; the first error wins per statement to reduce cascades.

mod expr;
mod stmt;

use std::collections::HashMap;

use crate::ast::{
    Ast, ClassId, ExprId, FnId, FuncDecl, Member, Scope, StmtId, StmtKind, TypeExpr, VarDecl, VarId,
};
use crate::error::Diagnostics;
use crate::intern::{Interner, Symbol};
use crate::token::{Token, TokenKind};
use crate::types::{canonical_name, DataType};

pub struct Analysis {
    /// Locals of the generated `<start>` function (top-level variables
    /// declared inside nested blocks).
    pub start_locals: Vec<VarId>,
    /// Top-level variables promoted to module data items.
    pub globals: Vec<VarId>,
}

#[derive(Default)]
struct ScopeFrame {
    vars: HashMap<Symbol, VarId>,
    funcs: HashMap<Symbol, Vec<FnId>>,
    classes: HashMap<Symbol, ClassId>,
    /// Template parameter bindings active while an instantiation is
    /// being checked.
    types: HashMap<Symbol, DataType>,
}

pub struct Analyzer<'a> {
    pub(crate) ast: &'a mut Ast,
    pub(crate) interner: &'a mut Interner,
    diagnostics: &'a mut Diagnostics,
    scopes: Vec<ScopeFrame>,
    pub(crate) current_func: Option<FnId>,
    pub(crate) current_class: Option<ClassId>,
    loop_depth: u32,
    local_count: u32,
    start_locals: Vec<VarId>,
    globals: Vec<VarId>,
    stmt_error: bool,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        ast: &'a mut Ast,
        interner: &'a mut Interner,
        diagnostics: &'a mut Diagnostics,
    ) -> Self {
        Analyzer {
            ast,
            interner,
            diagnostics,
            scopes: vec![ScopeFrame::default()],
            current_func: None,
            current_class: None,
            loop_depth: 0,
            local_count: 0,
            start_locals: Vec::new(),
            globals: Vec::new(),
            stmt_error: false,
        }
    }

    /// Runs the pass. `externals` are imported declarations (the built-in
    /// `log` sinks plus host-registered functions) made visible under
    /// their bare names before user code is resolved.
    pub fn run(mut self, statements: &[StmtId], externals: &[FnId]) -> Analysis {
        for &func in externals {
            let name = self.ast.func(func).name.lexeme;
            self.scopes[0].funcs.entry(name).or_default().push(func);
        }

        self.declare_statements(statements);

        for &statement in statements {
            self.resolve_signatures(statement);
        }

        for &statement in statements {
            self.stmt_error = false;
            self.check_statement(statement, true);
        }

        Analysis { start_locals: self.start_locals, globals: self.globals }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub(crate) fn error(&mut self, token: Token, message: impl Into<String>) {
        if self.stmt_error {
            return;
        }
        self.stmt_error = true;
        self.diagnostics.report(token.span, message.into());
    }

    pub(crate) fn error_type_mismatch(&mut self, token: Token) {
        self.error(token, "Type mismatch.");
    }

    pub(crate) fn reset_stmt_error(&mut self) {
        self.stmt_error = false;
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(ScopeFrame::default());
    }

    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub(crate) fn bind_type(&mut self, name: Symbol, ty: DataType) {
        self.scopes.last_mut().unwrap().types.insert(name, ty);
    }

    pub(crate) fn declare_var(&mut self, name: Symbol, var: VarId, token: Token) {
        let duplicate = self.scopes.last_mut().unwrap().vars.insert(name, var).is_some();
        if duplicate {
            let text = self.interner.resolve(name).to_string();
            self.error(token, format!("Variable '{}' is already declared.", text));
        }
    }

    pub(crate) fn declare_func(&mut self, func: FnId) {
        let name = self.ast.func(func).name.lexeme;
        let frame = self.scopes.last_mut().unwrap();
        let entry = frame.funcs.entry(name).or_default();
        if !entry.contains(&func) {
            entry.push(func);
        }
    }

    pub(crate) fn lookup_var(&self, name: Symbol) -> Option<VarId> {
        self.scopes.iter().rev().find_map(|frame| frame.vars.get(&name).copied())
    }

    pub(crate) fn lookup_funcs(&self, name: Symbol) -> Vec<FnId> {
        let mut found = Vec::new();
        for frame in self.scopes.iter().rev() {
            if let Some(funcs) = frame.funcs.get(&name) {
                found.extend_from_slice(funcs);
            }
        }
        found
    }

    pub(crate) fn lookup_class(&self, name: Symbol) -> Option<ClassId> {
        self.scopes.iter().rev().find_map(|frame| frame.classes.get(&name).copied())
    }

    fn lookup_type_binding(&self, name: Symbol) -> Option<DataType> {
        self.scopes.iter().rev().find_map(|frame| frame.types.get(&name).cloned())
    }

    // ------------------------------------------------------------------
    // Declaration passes
    // ------------------------------------------------------------------

    fn declare_statements(&mut self, statements: &[StmtId]) {
        for &statement in statements {
            match self.ast.stmt(statement).kind.clone() {
                StmtKind::Class(class) => {
                    let name = self.ast.class(class).name.lexeme;
                    self.scopes[0].classes.insert(name, class);
                }
                StmtKind::Func(func) => {
                    let name = self.ast.func(func).name.lexeme;
                    self.scopes[0].funcs.entry(name).or_default().push(func);
                }
                StmtKind::Import { body, .. } => self.declare_statements(&body),
                _ => {}
            }
        }
    }

    fn resolve_signatures(&mut self, statement: StmtId) {
        match self.ast.stmt(statement).kind.clone() {
            StmtKind::Class(class) => {
                if !self.ast.class(class).is_template {
                    self.resolve_class(class);
                }
            }
            StmtKind::Func(func) => {
                if !self.ast.func(func).is_template {
                    self.resolve_function_signature(func);
                }
            }
            StmtKind::Import { body, .. } => {
                for statement in body {
                    self.resolve_signatures(statement);
                }
            }
            _ => {}
        }
    }

    /// Resolves field types, lays out offsets, resolves method
    /// signatures and builds the member lookup.
    pub(crate) fn resolve_class(&mut self, class: ClassId) {
        let fields = self.ast.class(class).fields.clone();
        let mut offset: u32 = 0;

        for field in fields {
            let ty_expr = self.ast.var(field).ty_expr.clone();
            let ty = match ty_expr {
                Some(ty_expr) => self.resolve_type(&ty_expr),
                None => DataType::Void,
            };

            let align = ty.align();
            offset = (offset + align - 1) / align * align;

            let decl = self.ast.var_mut(field);
            decl.ty = ty.clone();
            decl.scope = Scope::Class;
            decl.offset = offset;
            offset += ty.size();

            let name = self.ast.var(field).name.lexeme;
            self.ast.class_mut(class).members.insert(name, Member::Field(field));
        }

        self.ast.class_mut(class).size = offset.max(1);

        let methods = self.ast.class(class).methods.clone();
        let init_name = self.interner.intern("__init__");
        for method in methods {
            self.ast.func_mut(method).class = Some(class);
            if !self.ast.func(method).is_template {
                self.resolve_function_signature(method);
            }
            let name = self.ast.func(method).name.lexeme;
            if name == init_name {
                self.ast.class_mut(class).initializers.push(method);
            } else {
                self.ast.class_mut(class).members.insert(name, Member::Method(method));
            }
        }
    }

    pub(crate) fn resolve_function_signature(&mut self, func: FnId) {
        let params = self.ast.func(func).params.clone();
        let class = self.ast.func(func).class;

        for param in params {
            let ty_expr = self.ast.var(param).ty_expr.clone();
            let ty = match ty_expr {
                Some(ty_expr) => self.resolve_type(&ty_expr),
                // A bare `this` parameter takes its enclosing class type.
                None => match class {
                    Some(class) => DataType::Object(class),
                    None => {
                        let token = self.ast.var(param).name;
                        self.error(token, "'this' is only allowed in class methods.");
                        DataType::Void
                    }
                },
            };
            self.ast.var_mut(param).ty = ty;
        }

        let ret = match self.ast.func(func).ret_ty_expr.clone() {
            Some(ty_expr) => self.resolve_type(&ty_expr),
            None => DataType::Void,
        };
        self.ast.func_mut(func).ret = ret;

        self.mangle_function(func);
    }

    fn mangle_function(&mut self, func: FnId) {
        let decl = self.ast.func(func);

        if decl.imported {
            // Imported externals keep their registered symbol names.
            if decl.mangled.is_empty() {
                let name = self.interner.resolve(decl.name.lexeme).to_string();
                self.ast.func_mut(func).mangled = name;
            }
            return;
        }

        let base = match (decl.class, decl.mangled.is_empty()) {
            (_, false) => return,
            (Some(class), true) => {
                let class_name = self.class_display_name(class);
                let name = self.interner.resolve(decl.name.lexeme);
                format!("{}.{}", class_name, name)
            }
            (None, true) => self.interner.resolve(decl.name.lexeme).to_string(),
        };

        let params: Vec<String> = self
            .ast
            .func(func)
            .params
            .iter()
            .map(|&p| canonical_name(&self.ast.var(p).ty, self.ast, self.interner))
            .collect();
        let ret = canonical_name(&self.ast.func(func).ret, self.ast, self.interner);
        self.ast.func_mut(func).mangled = format!("{}.{}({})", base, ret, params.join(", "));
    }

    pub(crate) fn class_display_name(&self, class: ClassId) -> String {
        let decl = self.ast.class(class);
        if decl.mangled.is_empty() {
            self.interner.resolve(decl.name.lexeme).to_string()
        } else {
            decl.mangled.clone()
        }
    }

    // ------------------------------------------------------------------
    // Type resolution
    // ------------------------------------------------------------------

    pub(crate) fn resolve_type(&mut self, ty_expr: &TypeExpr) -> DataType {
        let token = ty_expr.name;
        match token.kind {
            TokenKind::IdentifierInt => DataType::Int,
            TokenKind::IdentifierFloat => DataType::Float,
            TokenKind::IdentifierBool => DataType::Bool,
            TokenKind::IdentifierString => DataType::Str,
            TokenKind::IdentifierVoid => DataType::Void,
            TokenKind::Identifier => {
                let name = self.interner.resolve(token.lexeme);
                match name {
                    "any" => DataType::Any,
                    "char" => DataType::Char,
                    "array" => {
                        if ty_expr.args.len() != 1 {
                            self.error(token, "'array' takes exactly one type argument.");
                            return DataType::array(DataType::Int);
                        }
                        let elem = self.resolve_type(&ty_expr.args[0]);
                        DataType::array(elem)
                    }
                    // Function pointer types: func<ret, p1, p2, ...>.
                    "func" => {
                        if ty_expr.args.is_empty() {
                            self.error(token, "'func' takes the return type first.");
                            return DataType::Void;
                        }
                        let ret = self.resolve_type(&ty_expr.args[0]);
                        let params: Vec<DataType> =
                            ty_expr.args[1..].iter().map(|a| self.resolve_type(a)).collect();
                        DataType::FunctionPointer { params, ret: Box::new(ret) }
                    }
                    _ => {
                        if let Some(bound) = self.lookup_type_binding(token.lexeme) {
                            return bound;
                        }
                        if let Some(class) = self.lookup_class(token.lexeme) {
                            if self.ast.class(class).is_template {
                                let targs: Vec<DataType> =
                                    ty_expr.args.iter().map(|a| self.resolve_type(a)).collect();
                                if let Some(instance) =
                                    self.instantiate_class(class, &targs, token)
                                {
                                    return DataType::Object(instance);
                                }
                                return DataType::Void;
                            }
                            return DataType::Object(class);
                        }
                        let text = name.to_string();
                        self.error(token, format!("Undefined name '{}'.", text));
                        DataType::Void
                    }
                }
            }
            _ => {
                self.error(token, "Expected a type.");
                DataType::Void
            }
        }
    }

    // ------------------------------------------------------------------
    // Locals
    // ------------------------------------------------------------------

    /// Registers a local with the enclosing function (or `<start>`),
    /// assigning its unique-within-function slot.
    pub(crate) fn register_local(&mut self, var: VarId) {
        let index = self.local_count;
        self.local_count += 1;
        self.ast.var_mut(var).index = index;
        self.ast.var_mut(var).scope = Scope::Local;
        match self.current_func {
            Some(func) => self.ast.func_mut(func).locals.push(var),
            None => self.start_locals.push(var),
        }
    }

    pub(crate) fn enter_function(&mut self, func: FnId) -> (Option<FnId>, u32) {
        let previous = (self.current_func, self.local_count);
        self.current_func = Some(func);
        self.local_count = 0;
        previous
    }

    pub(crate) fn leave_function(&mut self, previous: (Option<FnId>, u32)) {
        self.current_func = previous.0;
        self.local_count = previous.1;
    }

    pub(crate) fn loop_depth(&self) -> u32 {
        self.loop_depth
    }

    pub(crate) fn set_loop_depth(&mut self, depth: u32) {
        self.loop_depth = depth;
    }

    pub(crate) fn globals_push(&mut self, var: VarId) {
        self.globals.push(var);
    }

    // ------------------------------------------------------------------
    // Template instantiation
    // ------------------------------------------------------------------

    /// Instantiates a function template for concrete type arguments.
    /// Instantiations are cached by canonical signature so repeated uses
    /// share one generated function.
    pub(crate) fn instantiate_function(
        &mut self,
        template: FnId,
        targs: &[DataType],
        token: Token,
    ) -> Option<FnId> {
        let tparams = self.ast.func(template).tparams.clone();
        if targs.len() != tparams.len() {
            self.error(token, "Wrong number of type arguments.");
            return None;
        }

        let key = self.instance_key(self.ast.func(template).name.lexeme, targs);
        if let Some(&instance) = self.ast.func(template).instance_cache.get(&key) {
            return Some(instance);
        }

        let mut decl = FuncDecl::new(self.ast.func(template).name);
        decl.class = self.ast.func(template).class;
        decl.ret_ty_expr = self.ast.func(template).ret_ty_expr.clone();
        decl.mangled = String::new();

        let params = self.ast.func(template).params.clone();
        for param in params {
            let source = self.ast.var(param).clone();
            let clone = self.ast.alloc_var(VarDecl { initializer: None, ..source });
            decl.params.push(clone);
        }

        let body = self.ast.func(template).body.clone();
        let mut var_map = HashMap::new();
        decl.body = self.clone_stmts(&body, &mut var_map);

        let instance = self.ast.alloc_func(decl);
        self.ast.func_mut(template).instance_cache.insert(key.clone(), instance);
        self.ast.func_mut(template).instances.push(instance);

        self.push_scope();
        for (tparam, targ) in tparams.iter().zip(targs) {
            self.bind_type(*tparam, targ.clone());
        }
        self.resolve_function_signature(instance);

        // Instance names carry their type arguments so distinct
        // instantiations never collide in the item maps.
        let mangled = self.ast.func(instance).mangled.clone();
        let bare = self.interner.resolve(self.ast.func(instance).name.lexeme).to_string();
        let with_args = mangled.replacen(&bare, &key, 1);
        self.ast.func_mut(instance).mangled = with_args;

        self.check_function_body(instance);
        self.pop_scope();

        Some(instance)
    }

    pub(crate) fn instantiate_class(
        &mut self,
        template: ClassId,
        targs: &[DataType],
        token: Token,
    ) -> Option<ClassId> {
        let tparams = self.ast.class(template).tparams.clone();
        if targs.len() != tparams.len() {
            self.error(token, "Wrong number of type arguments.");
            return None;
        }

        let key = self.instance_key(self.ast.class(template).name.lexeme, targs);
        if let Some(&instance) = self.ast.class(template).instance_cache.get(&key) {
            return Some(instance);
        }

        let mut decl = crate::ast::ClassDecl::new(self.ast.class(template).name);
        decl.mangled = key.clone();

        let instance = self.ast.alloc_class(decl);
        self.ast.class_mut(template).instance_cache.insert(key, instance);
        self.ast.class_mut(template).instances.push(instance);

        let fields = self.ast.class(template).fields.clone();
        for field in fields {
            let source = self.ast.var(field).clone();
            let initializer = source.initializer.map(|init| self.clone_expr(init, &HashMap::new()));
            let clone = self.ast.alloc_var(VarDecl { initializer, ..source });
            self.ast.class_mut(instance).fields.push(clone);
        }

        let methods = self.ast.class(template).methods.clone();
        for method in methods {
            let mut clone = FuncDecl::new(self.ast.func(method).name);
            clone.class = Some(instance);
            clone.ret_ty_expr = self.ast.func(method).ret_ty_expr.clone();
            clone.is_template = self.ast.func(method).is_template;
            clone.tparams = self.ast.func(method).tparams.clone();

            let params = self.ast.func(method).params.clone();
            for param in params {
                let source = self.ast.var(param).clone();
                let fresh = self.ast.alloc_var(VarDecl { initializer: None, ..source });
                clone.params.push(fresh);
            }

            let body = self.ast.func(method).body.clone();
            let mut var_map = HashMap::new();
            clone.body = self.clone_stmts(&body, &mut var_map);

            let clone = self.ast.alloc_func(clone);
            self.ast.class_mut(instance).methods.push(clone);
        }

        self.push_scope();
        for (tparam, targ) in tparams.iter().zip(targs) {
            self.bind_type(*tparam, targ.clone());
        }
        self.resolve_class(instance);
        self.check_class_bodies(instance);
        self.pop_scope();

        Some(instance)
    }

    fn instance_key(&self, name: Symbol, targs: &[DataType]) -> String {
        let names: Vec<String> =
            targs.iter().map(|t| canonical_name(t, self.ast, self.interner)).collect();
        format!("{}<{}>", self.interner.resolve(name), names.join(", "))
    }

    // ------------------------------------------------------------------
    // Deep cloning for template bodies
    // ------------------------------------------------------------------

    fn clone_stmts(
        &mut self,
        statements: &[StmtId],
        var_map: &mut HashMap<VarId, VarId>,
    ) -> Vec<StmtId> {
        statements.iter().map(|&s| self.clone_stmt(s, var_map)).collect()
    }

    fn clone_stmt(&mut self, statement: StmtId, var_map: &mut HashMap<VarId, VarId>) -> StmtId {
        let token = self.ast.stmt(statement).token;
        let kind = self.ast.stmt(statement).kind.clone();

        let kind = match kind {
            StmtKind::Expr { expr, .. } => StmtKind::Expr {
                expr: self.clone_expr(expr, var_map),
                ty: DataType::Void,
            },
            StmtKind::If { condition, then_branch, else_branch } => StmtKind::If {
                condition: self.clone_expr(condition, var_map),
                then_branch: self.clone_stmts(&then_branch, var_map),
                else_branch: self.clone_stmts(&else_branch, var_map),
            },
            StmtKind::While { initializer, condition, incrementer, body } => StmtKind::While {
                initializer: self.clone_stmts(&initializer, var_map),
                condition: self.clone_expr(condition, var_map),
                incrementer: self.clone_stmts(&incrementer, var_map),
                body: self.clone_stmts(&body, var_map),
            },
            StmtKind::Return { expr } => StmtKind::Return {
                expr: expr.map(|e| self.clone_expr(e, var_map)),
            },
            StmtKind::Var(var) => {
                let source = self.ast.var(var).clone();
                let initializer =
                    source.initializer.map(|init| self.clone_expr(init, var_map));
                let fresh = self.ast.alloc_var(VarDecl {
                    initializer,
                    ty: DataType::Void,
                    index: 0,
                    offset: 0,
                    ..source
                });
                var_map.insert(var, fresh);
                StmtKind::Var(fresh)
            }
            StmtKind::Continue => StmtKind::Continue,
            StmtKind::Break => StmtKind::Break,
            other => other,
        };

        self.ast.alloc_stmt(kind, token)
    }

    fn clone_expr(&mut self, expr: ExprId, var_map: &HashMap<VarId, VarId>) -> ExprId {
        use crate::ast::ExprKind;

        let token = self.ast.expr(expr).token;
        let kind = self.ast.expr(expr).kind.clone();

        let kind = match kind {
            ExprKind::Literal(literal) => ExprKind::Literal(literal),
            ExprKind::Group(inner) => ExprKind::Group(self.clone_expr(inner, var_map)),
            ExprKind::Unary { op, expr } => {
                ExprKind::Unary { op, expr: self.clone_expr(expr, var_map) }
            }
            ExprKind::Binary { op, left, right, .. } => ExprKind::Binary {
                op,
                left: self.clone_expr(left, var_map),
                right: self.clone_expr(right, var_map),
                operand_ty: DataType::Void,
                method: None,
            },
            ExprKind::Var { name, targs, .. } => ExprKind::Var { name, targs, var: None },
            ExprKind::This => ExprKind::This,
            ExprKind::Assign { target, value, .. } => ExprKind::Assign {
                target: self.clone_expr(target, var_map),
                value: self.clone_expr(value, var_map),
                var: None,
                method: None,
                value_ty: DataType::Void,
            },
            ExprKind::Call { callee, args, .. } => ExprKind::Call {
                callee: self.clone_expr(callee, var_map),
                args: args.iter().map(|&a| self.clone_expr(a, var_map)).collect(),
                func: None,
                callee_ty: DataType::Void,
                ret_ty: DataType::Void,
            },
            ExprKind::Cast { expr, ty_expr, .. } => ExprKind::Cast {
                expr: self.clone_expr(expr, var_map),
                ty_expr,
                from: DataType::Void,
            },
            ExprKind::Access { expr, name, .. } => ExprKind::Access {
                expr: self.clone_expr(expr, var_map),
                name,
                var: None,
                object_ty: DataType::Void,
            },
            ExprKind::Index { expr, index, .. } => ExprKind::Index {
                expr: self.clone_expr(expr, var_map),
                index: self.clone_expr(index, var_map),
                expr_ty: DataType::Void,
                method: None,
            },
            ExprKind::ArrayLit { elems } => ExprKind::ArrayLit {
                elems: elems.iter().map(|&e| self.clone_expr(e, var_map)).collect(),
            },
            ExprKind::Cond { cond, then, other } => ExprKind::Cond {
                cond: self.clone_expr(cond, var_map),
                then: self.clone_expr(then, var_map),
                other: self.clone_expr(other, var_map),
            },
            ExprKind::IsTest { expr, ty_expr, .. } => ExprKind::IsTest {
                expr: self.clone_expr(expr, var_map),
                ty_expr,
                target: DataType::Void,
            },
        };

        self.ast.alloc_expr(kind, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn analyze(source: &str) -> (Ast, Diagnostics) {
        let mut interner = Interner::new();
        let mut diagnostics = Diagnostics::new();
        let tokens = Lexer::new(source, &mut interner).scan(&mut diagnostics);
        let mut ast = Ast::new();
        let statements =
            Parser::new(tokens, &mut ast, &mut interner, &mut diagnostics).parse();
        Analyzer::new(&mut ast, &mut interner, &mut diagnostics).run(&statements, &[]);
        (ast, diagnostics)
    }

    fn first_message(diagnostics: &Diagnostics) -> &str {
        &diagnostics.diagnostics()[0].message
    }

    #[test]
    fn undefined_name_is_reported_with_span() {
        let (_, diagnostics) = analyze("x: int = missing\n");
        assert!(first_message(&diagnostics).contains("Undefined name 'missing'"));
        assert_eq!(diagnostics.diagnostics()[0].span.start_line, 1);
    }

    #[test]
    fn operator_applicability_is_checked() {
        let (_, diagnostics) = analyze("x: int = 1 + true\n");
        assert!(first_message(&diagnostics).contains("Type mismatch"));

        let (_, diagnostics) = analyze("x: float = 1.5 % 2.0\n");
        assert!(first_message(&diagnostics).contains("Operator"));
    }

    #[test]
    fn continue_outside_loop_is_reported() {
        let (_, diagnostics) = analyze("continue\n");
        assert!(first_message(&diagnostics).contains("inside a loop"));
    }

    #[test]
    fn unreachable_code_is_reported() {
        let source = "\
f() -> int:
    return 1
    2 + 2
";
        let (_, diagnostics) = analyze(source);
        assert!(diagnostics.diagnostics().iter().any(|d| d.message.contains("Unreachable")));
    }

    #[test]
    fn class_layout_is_sequential() {
        let source = "\
class Pair:
    a: int
    b: int
";
        let (ast, diagnostics) = analyze(source);
        assert!(!diagnostics.has_errors());
        let class = ast.class(ClassId(0));
        assert_eq!(ast.var(class.fields[0]).offset, 0);
        assert_eq!(ast.var(class.fields[1]).offset, 4);
        assert_eq!(class.size, 8);
    }

    #[test]
    fn class_size_is_the_sum_of_field_sizes() {
        let source = "\
class Mixed:
    flag: bool
    count: int
";
        let (ast, diagnostics) = analyze(source);
        assert!(!diagnostics.has_errors());
        let class = ast.class(ClassId(0));
        assert_eq!(ast.var(class.fields[1]).offset, 1);
        assert_eq!(class.size, 5);
    }

    #[test]
    fn implicit_widening_inserts_a_cast() {
        let (_, diagnostics) = analyze("x: float = 1 + 0.5\n");
        assert!(!diagnostics.has_errors());
    }

    #[test]
    fn first_error_wins_per_statement() {
        let (_, diagnostics) = analyze("x: int = missing + also_missing\n");
        assert_eq!(diagnostics.diagnostics().len(), 1);
    }
}
