mod expr;

use crate::ast::{
    Ast, ClassDecl, ExprKind, FuncDecl, Literal, Scope, StmtId, StmtKind, TypeExpr, VarDecl,
};
use crate::error::Diagnostics;
use crate::intern::Interner;
use crate::token::{Token, TokenKind};

/// Recursive-descent parser. Reports syntax errors with source spans and
/// recovers at the next statement boundary; it never assigns types.
pub struct Parser<'ast, 'int, 'diag> {
    tokens: Vec<Token>,
    current: usize,
    pub(super) ast: &'ast mut Ast,
    pub(super) interner: &'int mut Interner,
    diagnostics: &'diag mut Diagnostics,
    panicking: bool,
}

impl<'ast, 'int, 'diag> Parser<'ast, 'int, 'diag> {
    pub fn new(
        tokens: Vec<Token>,
        ast: &'ast mut Ast,
        interner: &'int mut Interner,
        diagnostics: &'diag mut Diagnostics,
    ) -> Self {
        Parser { tokens, current: 0, ast, interner, diagnostics, panicking: false }
    }

    pub fn parse(mut self) -> Vec<StmtId> {
        let mut statements = Vec::new();

        while !self.eof() {
            if self.matches(TokenKind::Newline) {
                continue;
            }
            statements.push(self.statement());
        }

        statements
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    pub(super) fn peek(&self) -> Token {
        self.tokens[self.current]
    }

    pub(super) fn peek_kind(&self) -> TokenKind {
        self.tokens[self.current].kind
    }

    pub(super) fn peek_at(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.current + offset)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    pub(super) fn previous(&self) -> Token {
        self.tokens[self.current - 1]
    }

    pub(super) fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    pub(super) fn eof(&self) -> bool {
        self.peek_kind() == TokenKind::Eof
    }

    pub(super) fn advance(&mut self) -> Token {
        if !self.eof() {
            self.current += 1;
        }
        self.previous()
    }

    pub(super) fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        false
    }

    pub(super) fn consume(&mut self, kind: TokenKind, message: &str) -> Token {
        if self.check(kind) {
            return self.advance();
        }
        self.error(self.peek(), message);
        self.peek()
    }

    pub(super) fn error(&mut self, token: Token, message: &str) {
        if self.panicking {
            return;
        }
        self.diagnostics.report(token.span, message);
        self.panicking = true;
    }

    /// Skips to the next statement boundary after a syntax error.
    fn synchronize(&mut self) {
        while !self.eof() {
            match self.advance().kind {
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::Dedent => return,
                _ => {}
            }
        }
    }

    pub(super) fn mark(&self) -> usize {
        self.current
    }

    pub(super) fn rewind(&mut self, mark: usize) {
        self.current = mark;
    }

    /// Consumes the closing `>` of a type-argument list, splitting a `>>`
    /// token in place when two lists close together.
    pub(super) fn consume_type_close(&mut self) {
        if self.check(TokenKind::Greater) {
            self.advance();
        } else if self.check(TokenKind::GreaterGreater) {
            self.tokens[self.current].kind = TokenKind::Greater;
        } else {
            self.error(self.peek(), "Expected '>' after type arguments.");
        }
    }

    fn terminator(&mut self, message: &str) {
        if self.matches(TokenKind::Newline) || self.matches(TokenKind::Semicolon) {
            return;
        }
        if self.check(TokenKind::Dedent) || self.eof() {
            return;
        }
        self.error(self.peek(), message);
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    pub(super) fn type_expr(&mut self) -> TypeExpr {
        let token = self.peek();
        match token.kind {
            TokenKind::IdentifierInt
            | TokenKind::IdentifierFloat
            | TokenKind::IdentifierBool
            | TokenKind::IdentifierString
            | TokenKind::IdentifierVoid => {
                self.advance();
                TypeExpr { name: token, args: Vec::new() }
            }
            TokenKind::Identifier => {
                self.advance();
                let mut args = Vec::new();
                if self.matches(TokenKind::Less) {
                    loop {
                        args.push(self.type_expr());
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.consume_type_close();
                }
                TypeExpr { name: token, args }
            }
            _ => {
                self.error(token, "Expected a type.");
                TypeExpr { name: token, args: Vec::new() }
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub(super) fn statement(&mut self) -> StmtId {
        let statement = self.parse_statement();
        if self.panicking {
            self.panicking = false;
            self.synchronize();
        }
        statement
    }

    fn parse_statement(&mut self) -> StmtId {
        let token = self.peek();

        match token.kind {
            TokenKind::Class => self.class_declaration(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Return => {
                self.advance();
                let expr = if self.check(TokenKind::Newline)
                    || self.check(TokenKind::Semicolon)
                    || self.check(TokenKind::Dedent)
                {
                    None
                } else {
                    Some(self.expression())
                };
                self.terminator("Expected a newline after a return statement.");
                self.ast.alloc_stmt(StmtKind::Return { expr }, token)
            }
            TokenKind::Continue => {
                self.advance();
                self.terminator("Expected a newline after 'continue'.");
                self.ast.alloc_stmt(StmtKind::Continue, token)
            }
            TokenKind::Break => {
                self.advance();
                self.terminator("Expected a newline after 'break'.");
                self.ast.alloc_stmt(StmtKind::Break, token)
            }
            TokenKind::Import => {
                self.advance();
                let path = self.consume(TokenKind::String, "Expected a file path after 'import'.");
                self.terminator("Expected a newline after an import.");
                self.ast
                    .alloc_stmt(StmtKind::Import { path: path.lexeme, body: Vec::new() }, token)
            }
            TokenKind::Identifier if self.peek_at(1) == TokenKind::Colon => {
                let statement = self.variable_declaration();
                self.terminator("Expected a newline after a variable declaration.");
                statement
            }
            TokenKind::Identifier if self.looks_like_function_declaration() => {
                self.function_declaration(None)
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> StmtId {
        let token = self.peek();
        let expr = self.expression();
        self.terminator("Expected a newline after an expression.");
        self.ast.alloc_stmt(StmtKind::Expr { expr, ty: crate::types::DataType::Void }, token)
    }

    /// `name ';' ...`-free simple statement used by for-loop headers.
    fn simple_unterminated(&mut self) -> StmtId {
        let token = self.peek();
        if token.kind == TokenKind::Identifier && self.peek_at(1) == TokenKind::Colon {
            return self.variable_declaration();
        }
        let expr = self.expression();
        self.ast.alloc_stmt(StmtKind::Expr { expr, ty: crate::types::DataType::Void }, token)
    }

    fn variable_declaration(&mut self) -> StmtId {
        let name = self.consume(TokenKind::Identifier, "Expected a variable name.");
        self.consume(TokenKind::Colon, "Expected ':' after a variable name.");
        let ty_expr = self.type_expr();

        let initializer = if self.matches(TokenKind::Equal) { Some(self.expression()) } else { None };

        let var = self.ast.alloc_var(VarDecl {
            name,
            ty_expr: Some(ty_expr),
            ty: crate::types::DataType::Void,
            initializer,
            scope: Scope::Local,
            index: 0,
            offset: 0,
        });

        self.ast.alloc_stmt(StmtKind::Var(var), name)
    }

    /// Distinguishes `name(params) [-> type] : …` (and the template form)
    /// from a call expression at statement position.
    fn looks_like_function_declaration(&self) -> bool {
        let mut j = 1;

        if self.peek_at(j) == TokenKind::Less {
            j += 1;
            while matches!(self.peek_at(j), TokenKind::Identifier | TokenKind::Comma) {
                j += 1;
            }
            if self.peek_at(j) != TokenKind::Greater {
                return false;
            }
            j += 1;
        }

        if self.peek_at(j) != TokenKind::LeftParen {
            return false;
        }

        let mut depth = 0;
        loop {
            match self.peek_at(j) {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                TokenKind::Newline | TokenKind::Eof => return false,
                _ => {}
            }
            j += 1;
        }

        matches!(self.peek_at(j + 1), TokenKind::Arrow | TokenKind::Colon)
    }

    fn function_declaration(&mut self, class: Option<crate::ast::ClassId>) -> StmtId {
        let name = self.consume(TokenKind::Identifier, "Expected a function name.");
        let mut decl = FuncDecl::new(name);
        decl.class = class;

        if self.matches(TokenKind::Less) {
            decl.is_template = true;
            loop {
                let tparam = self.consume(TokenKind::Identifier, "Expected a type parameter name.");
                decl.tparams.push(tparam.lexeme);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume_type_close();
        }

        self.consume(TokenKind::LeftParen, "Expected '(' after a function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.check(TokenKind::This) {
                    let this = self.advance();
                    let var = self.ast.alloc_var(VarDecl {
                        name: this,
                        ty_expr: None,
                        ty: crate::types::DataType::Void,
                        initializer: None,
                        scope: Scope::Local,
                        index: 0,
                        offset: 0,
                    });
                    decl.params.push(var);
                } else {
                    let param = self.consume(TokenKind::Identifier, "Expected a parameter name.");
                    self.consume(TokenKind::Colon, "Expected ':' after a parameter name.");
                    let ty_expr = self.type_expr();
                    let var = self.ast.alloc_var(VarDecl {
                        name: param,
                        ty_expr: Some(ty_expr),
                        ty: crate::types::DataType::Void,
                        initializer: None,
                        scope: Scope::Local,
                        index: 0,
                        offset: 0,
                    });
                    decl.params.push(var);
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.");

        if self.matches(TokenKind::Arrow) {
            decl.ret_ty_expr = Some(self.type_expr());
        }

        self.consume(TokenKind::Colon, "Expected ':' before a function body.");
        decl.body = self.block();

        let func = self.ast.alloc_func(decl);
        self.ast.alloc_stmt(StmtKind::Func(func), name)
    }

    fn class_declaration(&mut self) -> StmtId {
        let keyword = self.advance();
        let name = self.consume(TokenKind::Identifier, "Expected a class name.");
        let mut decl = ClassDecl::new(name);

        if self.matches(TokenKind::Less) {
            decl.is_template = true;
            loop {
                let tparam = self.consume(TokenKind::Identifier, "Expected a type parameter name.");
                decl.tparams.push(tparam.lexeme);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume_type_close();
        }

        let class = self.ast.alloc_class(decl);

        self.consume(TokenKind::Colon, "Expected ':' after a class name.");
        self.consume(TokenKind::Newline, "Expected a newline after ':'.");
        self.consume(TokenKind::Indent, "Expected an indented class body.");

        while !self.check(TokenKind::Dedent) && !self.eof() {
            if self.matches(TokenKind::Newline) {
                continue;
            }

            if self.check(TokenKind::Identifier) && self.peek_at(1) == TokenKind::Colon {
                let statement = self.variable_declaration();
                self.terminator("Expected a newline after a field declaration.");
                if let StmtKind::Var(var) = self.ast.stmt(statement).kind {
                    self.ast.var_mut(var).scope = Scope::Class;
                    self.ast.class_mut(class).fields.push(var);
                }
            } else if self.check(TokenKind::Identifier) {
                let statement = self.function_declaration(Some(class));
                if let StmtKind::Func(func) = self.ast.stmt(statement).kind {
                    self.ast.class_mut(class).methods.push(func);
                }
            } else {
                self.error(self.peek(), "Expected a class member.");
                self.synchronize();
            }

            if self.panicking {
                self.panicking = false;
                self.synchronize();
            }
        }

        self.consume(TokenKind::Dedent, "Expected a deindent after a class body.");
        self.ast.alloc_stmt(StmtKind::Class(class), keyword)
    }

    fn if_statement(&mut self) -> StmtId {
        let keyword = self.advance();
        let condition = self.expression();
        self.consume(TokenKind::Colon, "Expected ':' after an if condition.");
        let then_branch = self.block();

        let mut else_branch = Vec::new();
        if self.matches(TokenKind::Else) {
            if self.check(TokenKind::If) {
                else_branch.push(self.if_statement());
            } else {
                self.consume(TokenKind::Colon, "Expected ':' after 'else'.");
                else_branch = self.block();
            }
        }

        self.ast.alloc_stmt(StmtKind::If { condition, then_branch, else_branch }, keyword)
    }

    fn while_statement(&mut self) -> StmtId {
        let keyword = self.advance();
        let condition = self.expression();
        self.consume(TokenKind::Colon, "Expected ':' after a while condition.");
        let body = self.block();

        self.ast.alloc_stmt(
            StmtKind::While {
                initializer: Vec::new(),
                condition,
                incrementer: Vec::new(),
                body,
            },
            keyword,
        )
    }

    fn for_statement(&mut self) -> StmtId {
        let keyword = self.advance();
        let initializer = vec![self.simple_unterminated()];
        self.consume(TokenKind::Semicolon, "Expected ';' after the for initializer.");
        let condition = self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after the for condition.");
        let incrementer = vec![self.simple_unterminated()];
        self.consume(TokenKind::Colon, "Expected ':' after a for header.");
        let body = self.block();

        self.ast.alloc_stmt(
            StmtKind::While { initializer, condition, incrementer, body },
            keyword,
        )
    }

    fn block(&mut self) -> Vec<StmtId> {
        if self.matches(TokenKind::Newline) {
            self.consume(TokenKind::Indent, "Expected an indented block.");
            let mut statements = Vec::new();
            while !self.check(TokenKind::Dedent) && !self.eof() {
                if self.matches(TokenKind::Newline) {
                    continue;
                }
                statements.push(self.statement());
            }
            self.consume(TokenKind::Dedent, "Expected a deindent after a block.");
            statements
        } else {
            vec![self.statement()]
        }
    }

    pub(super) fn null_expr(&mut self, token: Token) -> crate::ast::ExprId {
        self.ast.alloc_expr(ExprKind::Literal(Literal::Null), token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(source: &str) -> (Ast, Vec<StmtId>, Diagnostics) {
        let mut interner = Interner::new();
        let mut diagnostics = Diagnostics::new();
        let tokens = Lexer::new(source, &mut interner).scan(&mut diagnostics);
        let mut ast = Ast::new();
        let stmts =
            Parser::new(tokens, &mut ast, &mut interner, &mut diagnostics).parse();
        (ast, stmts, diagnostics)
    }

    #[test]
    fn parses_expression_statement() {
        let (ast, stmts, diagnostics) = parse("1 + 2 * 3\n");
        assert!(!diagnostics.has_errors());
        assert_eq!(stmts.len(), 1);
        assert!(matches!(ast.stmt(stmts[0]).kind, StmtKind::Expr { .. }));
    }

    #[test]
    fn parses_variable_declaration_with_initializer() {
        let (ast, stmts, diagnostics) = parse("a: array<int> = []\n");
        assert!(!diagnostics.has_errors());
        let StmtKind::Var(var) = ast.stmt(stmts[0]).kind else {
            panic!("expected a variable declaration");
        };
        assert!(ast.var(var).initializer.is_some());
        assert!(ast.var(var).ty_expr.is_some());
    }

    #[test]
    fn semicolons_separate_simple_statements() {
        let (_, stmts, diagnostics) = parse("a: int = 1; b: int = 2; a + b\n");
        assert!(!diagnostics.has_errors());
        assert_eq!(stmts.len(), 3);
    }

    #[test]
    fn parses_function_declaration() {
        let (ast, stmts, diagnostics) = parse("adder(a: int, b: int) -> int:\n    return a + b\n");
        assert!(!diagnostics.has_errors());
        let StmtKind::Func(func) = ast.stmt(stmts[0]).kind else {
            panic!("expected a function declaration");
        };
        let func = ast.func(func);
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.body.len(), 1);
        assert!(func.ret_ty_expr.is_some());
    }

    #[test]
    fn parses_inline_function_body() {
        let (ast, stmts, diagnostics) = parse("zero() -> int: return 0\n");
        assert!(!diagnostics.has_errors());
        let StmtKind::Func(func) = ast.stmt(stmts[0]).kind else {
            panic!("expected a function declaration");
        };
        assert_eq!(ast.func(func).body.len(), 1);
    }

    #[test]
    fn parses_class_with_fields_and_method() {
        let source = "\
class Point:
    x: int
    y: int
    sum(this) -> int:
        return this.x + this.y
";
        let (ast, stmts, diagnostics) = parse(source);
        assert!(!diagnostics.has_errors());
        let StmtKind::Class(class) = ast.stmt(stmts[0]).kind else {
            panic!("expected a class declaration");
        };
        let class = ast.class(class);
        assert_eq!(class.fields.len(), 2);
        assert_eq!(class.methods.len(), 1);
    }

    #[test]
    fn for_desugars_to_while_sections() {
        let source = "for i: int = 0; i < 10; i += 1:\n    log(i)\n";
        let (ast, stmts, diagnostics) = parse(source);
        assert!(!diagnostics.has_errors());
        let StmtKind::While { initializer, incrementer, body, .. } = &ast.stmt(stmts[0]).kind
        else {
            panic!("expected the desugared while");
        };
        assert_eq!(initializer.len(), 1);
        assert_eq!(incrementer.len(), 1);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn missing_separator_is_reported_with_recovery() {
        let (_, stmts, diagnostics) = parse("1 + 2 3\n4 + 5\n");
        assert!(diagnostics.has_errors());
        assert!(stmts.len() >= 2);
    }

    #[test]
    fn parses_if_else_chain() {
        let source = "\
if a:
    b
else if c:
    d
else:
    e
";
        let (ast, stmts, diagnostics) = parse(source);
        assert!(!diagnostics.has_errors());
        let StmtKind::If { else_branch, .. } = &ast.stmt(stmts[0]).kind else {
            panic!("expected if");
        };
        assert_eq!(else_branch.len(), 1);
        assert!(matches!(ast.stmt(else_branch[0]).kind, StmtKind::If { .. }));
    }

    #[test]
    fn parses_template_function() {
        let source = "first<T>(values: array<T>) -> T:\n    return values[0]\n";
        let (ast, stmts, diagnostics) = parse(source);
        assert!(!diagnostics.has_errors());
        let StmtKind::Func(func) = ast.stmt(stmts[0]).kind else {
            panic!("expected a function declaration");
        };
        let func = ast.func(func);
        assert!(func.is_template);
        assert_eq!(func.tparams.len(), 1);
    }

    #[test]
    fn splits_shift_token_closing_nested_generics() {
        let (_, _, diagnostics) = parse("m: array<array<int>> = []\n");
        assert!(!diagnostics.has_errors());
    }
}
