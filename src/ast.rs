//! AST storage.
//!
//! All nodes live in a typed slab owned by [`Ast`]; `ExprId`/`StmtId` and
//! the declaration ids are non-owning handles, so cross-references
//! (variable read to its declaration, call to its function) never own
//! their target. `reset` invalidates the whole tree at once.

use std::collections::HashMap;

use crate::intern::Symbol;
use crate::token::Token;
use crate::types::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone)]
pub enum Literal {
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(Symbol),
    Null,
}

/// Syntactic type annotation; resolved to a [`DataType`] by the analyzer.
#[derive(Debug, Clone)]
pub struct TypeExpr {
    pub name: Token,
    pub args: Vec<TypeExpr>,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub token: Token,
    /// Resolved data type; `Void` until the analyzer pass.
    pub ty: DataType,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Group(ExprId),
    Unary {
        op: Token,
        expr: ExprId,
    },
    Binary {
        op: Token,
        left: ExprId,
        right: ExprId,
        /// Common operand type after implicit widening.
        operand_ty: DataType,
        /// Operator member dispatched for object operands.
        method: Option<FnId>,
    },
    Var {
        name: Symbol,
        targs: Vec<TypeExpr>,
        var: Option<VarId>,
    },
    This,
    Assign {
        target: ExprId,
        value: ExprId,
        var: Option<VarId>,
        /// Index-set member for object targets.
        method: Option<FnId>,
        value_ty: DataType,
    },
    Call {
        callee: ExprId,
        args: Vec<ExprId>,
        func: Option<FnId>,
        callee_ty: DataType,
        ret_ty: DataType,
    },
    Cast {
        expr: ExprId,
        /// Present for source-level `as`; analyzer-inserted casts carry none.
        ty_expr: Option<TypeExpr>,
        from: DataType,
    },
    Access {
        expr: ExprId,
        name: Token,
        var: Option<VarId>,
        object_ty: DataType,
    },
    Index {
        expr: ExprId,
        index: ExprId,
        expr_ty: DataType,
        method: Option<FnId>,
    },
    ArrayLit {
        elems: Vec<ExprId>,
    },
    Cond {
        cond: ExprId,
        then: ExprId,
        other: ExprId,
    },
    IsTest {
        expr: ExprId,
        ty_expr: TypeExpr,
        target: DataType,
    },
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub token: Token,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr {
        expr: ExprId,
        ty: DataType,
    },
    If {
        condition: ExprId,
        then_branch: Vec<StmtId>,
        else_branch: Vec<StmtId>,
    },
    /// `for` desugars onto the initializer and incrementer sections.
    While {
        initializer: Vec<StmtId>,
        condition: ExprId,
        incrementer: Vec<StmtId>,
        body: Vec<StmtId>,
    },
    Return {
        expr: Option<ExprId>,
    },
    Continue,
    Break,
    Var(VarId),
    Func(FnId),
    Class(ClassId),
    Import {
        path: Symbol,
        body: Vec<StmtId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Global,
    Class,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Token,
    pub ty_expr: Option<TypeExpr>,
    pub ty: DataType,
    pub initializer: Option<ExprId>,
    pub scope: Scope,
    /// Unique-within-function slot for locals and parameters.
    pub index: u32,
    /// Byte offset within the object layout for class fields.
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: Token,
    /// `name.ret(params)` once analyzed; the item lookup key.
    pub mangled: String,
    pub tparams: Vec<Symbol>,
    /// Parameter 0 is `this` for members.
    pub params: Vec<VarId>,
    pub ret_ty_expr: Option<TypeExpr>,
    pub ret: DataType,
    pub body: Vec<StmtId>,
    /// Parameters plus every body-declared variable, in slot order.
    pub locals: Vec<VarId>,
    pub class: Option<ClassId>,
    pub imported: bool,
    pub is_template: bool,
    pub instances: Vec<FnId>,
    pub instance_cache: HashMap<String, FnId>,
    pub checked: bool,
}

#[derive(Debug, Clone)]
pub enum Member {
    Field(VarId),
    Method(FnId),
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: Token,
    pub mangled: String,
    pub tparams: Vec<Symbol>,
    pub fields: Vec<VarId>,
    pub methods: Vec<FnId>,
    pub initializers: Vec<FnId>,
    pub members: HashMap<Symbol, Member>,
    /// Total instance size in bytes after field layout.
    pub size: u32,
    pub is_template: bool,
    pub instances: Vec<ClassId>,
    pub instance_cache: HashMap<String, ClassId>,
}

/// Slab arena owning every AST node for one VM.
#[derive(Default)]
pub struct Ast {
    exprs: Vec<Expr>,
    stmts: Vec<Stmt>,
    vars: Vec<VarDecl>,
    funcs: Vec<FuncDecl>,
    classes: Vec<ClassDecl>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_expr(&mut self, kind: ExprKind, token: Token) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr { kind, token, ty: DataType::Void });
        id
    }

    pub fn alloc_stmt(&mut self, kind: StmtKind, token: Token) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(Stmt { kind, token });
        id
    }

    pub fn alloc_var(&mut self, var: VarDecl) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(var);
        id
    }

    pub fn alloc_func(&mut self, func: FuncDecl) -> FnId {
        let id = FnId(self.funcs.len() as u32);
        self.funcs.push(func);
        id
    }

    pub fn alloc_class(&mut self, class: ClassDecl) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(class);
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id.0 as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    pub fn stmt_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id.0 as usize]
    }

    pub fn var(&self, id: VarId) -> &VarDecl {
        &self.vars[id.0 as usize]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut VarDecl {
        &mut self.vars[id.0 as usize]
    }

    pub fn func(&self, id: FnId) -> &FuncDecl {
        &self.funcs[id.0 as usize]
    }

    pub fn func_mut(&mut self, id: FnId) -> &mut FuncDecl {
        &mut self.funcs[id.0 as usize]
    }

    pub fn class(&self, id: ClassId) -> &ClassDecl {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut ClassDecl {
        &mut self.classes[id.0 as usize]
    }

    pub fn func_count(&self) -> usize {
        self.funcs.len()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Invalidates every node without releasing the backing storage.
    pub fn reset(&mut self) {
        self.exprs.clear();
        self.stmts.clear();
        self.vars.clear();
        self.funcs.clear();
        self.classes.clear();
    }
}

impl FuncDecl {
    pub fn new(name: Token) -> Self {
        FuncDecl {
            name,
            mangled: String::new(),
            tparams: Vec::new(),
            params: Vec::new(),
            ret_ty_expr: None,
            ret: DataType::Void,
            body: Vec::new(),
            locals: Vec::new(),
            class: None,
            imported: false,
            is_template: false,
            instances: Vec::new(),
            instance_cache: HashMap::new(),
            checked: false,
        }
    }
}

impl ClassDecl {
    pub fn new(name: Token) -> Self {
        ClassDecl {
            name,
            mangled: String::new(),
            tparams: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            initializers: Vec::new(),
            members: HashMap::new(),
            size: 0,
            is_template: false,
            instances: Vec::new(),
            instance_cache: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Span, TokenKind};

    fn token() -> Token {
        Token::new(TokenKind::Identifier, Symbol::EMPTY, Span::default())
    }

    #[test]
    fn alloc_expr_starts_void_typed() {
        let mut ast = Ast::new();
        let id = ast.alloc_expr(ExprKind::Literal(Literal::Int(1)), token());
        assert_eq!(ast.expr(id).ty, DataType::Void);
    }

    #[test]
    fn ids_are_stable_across_allocations() {
        let mut ast = Ast::new();
        let a = ast.alloc_expr(ExprKind::Literal(Literal::Int(1)), token());
        let b = ast.alloc_expr(ExprKind::Literal(Literal::Int(2)), token());
        assert_ne!(a, b);
        assert!(matches!(ast.expr(a).kind, ExprKind::Literal(Literal::Int(1))));
        assert!(matches!(ast.expr(b).kind, ExprKind::Literal(Literal::Int(2))));
    }

    #[test]
    fn reset_clears_all_nodes() {
        let mut ast = Ast::new();
        ast.alloc_expr(ExprKind::Literal(Literal::Null), token());
        ast.alloc_stmt(StmtKind::Continue, token());
        ast.reset();
        assert_eq!(ast.func_count(), 0);
        let id = ast.alloc_expr(ExprKind::Literal(Literal::Bool(true)), token());
        assert_eq!(id, ExprId(0));
    }
}
