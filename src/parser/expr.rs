use super::Parser;
use crate::ast::{ExprId, ExprKind, Literal};
use crate::token::{Token, TokenKind};
use crate::types::DataType;

impl<'ast, 'int, 'diag> Parser<'ast, 'int, 'diag> {
    pub(super) fn expression(&mut self) -> ExprId {
        self.assignment()
    }

    fn assignment(&mut self) -> ExprId {
        let target = self.conditional();

        if self.matches(TokenKind::Equal) {
            let op = self.previous();
            let value = self.assignment();
            return self.ast.alloc_expr(
                ExprKind::Assign { target, value, var: None, method: None, value_ty: DataType::Void },
                op,
            );
        }

        // Compound assignment desugars to read-modify-write.
        for (compound, simple) in [
            (TokenKind::PlusEqual, TokenKind::Plus),
            (TokenKind::MinusEqual, TokenKind::Minus),
            (TokenKind::StarEqual, TokenKind::Star),
            (TokenKind::SlashEqual, TokenKind::Slash),
            (TokenKind::PercentEqual, TokenKind::Percent),
        ] {
            if self.matches(compound) {
                let op = Token { kind: simple, ..self.previous() };
                let right = self.assignment();
                let value = self.ast.alloc_expr(
                    ExprKind::Binary {
                        op,
                        left: target,
                        right,
                        operand_ty: DataType::Void,
                        method: None,
                    },
                    op,
                );
                return self.ast.alloc_expr(
                    ExprKind::Assign {
                        target,
                        value,
                        var: None,
                        method: None,
                        value_ty: DataType::Void,
                    },
                    op,
                );
            }
        }

        target
    }

    fn conditional(&mut self) -> ExprId {
        let then = self.logical_or();

        if self.matches(TokenKind::If) {
            let keyword = self.previous();
            let cond = self.logical_or();
            self.consume(TokenKind::Else, "Expected 'else' in a conditional expression.");
            let other = self.conditional();
            return self.ast.alloc_expr(ExprKind::Cond { cond, then, other }, keyword);
        }

        then
    }

    fn logical_or(&mut self) -> ExprId {
        let mut expr = self.logical_and();
        while self.matches(TokenKind::Or) {
            let op = self.previous();
            let right = self.logical_and();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn logical_and(&mut self) -> ExprId {
        let mut expr = self.bitwise_or();
        while self.matches(TokenKind::And) {
            let op = self.previous();
            let right = self.bitwise_or();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn bitwise_or(&mut self) -> ExprId {
        let mut expr = self.bitwise_xor();
        while self.matches(TokenKind::Pipe) {
            let op = self.previous();
            let right = self.bitwise_xor();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn bitwise_xor(&mut self) -> ExprId {
        let mut expr = self.bitwise_and();
        while self.matches(TokenKind::Caret) {
            let op = self.previous();
            let right = self.bitwise_and();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn bitwise_and(&mut self) -> ExprId {
        let mut expr = self.equality();
        while self.matches(TokenKind::Ampersand) {
            let op = self.previous();
            let right = self.equality();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn equality(&mut self) -> ExprId {
        let mut expr = self.comparison();
        while self.matches(TokenKind::EqualEqual) || self.matches(TokenKind::BangEqual) {
            let op = self.previous();
            let right = self.comparison();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn comparison(&mut self) -> ExprId {
        let mut expr = self.cast();
        while self.matches(TokenKind::Greater)
            || self.matches(TokenKind::GreaterEqual)
            || self.matches(TokenKind::Less)
            || self.matches(TokenKind::LessEqual)
        {
            let op = self.previous();
            let right = self.cast();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn cast(&mut self) -> ExprId {
        let mut expr = self.shift();
        loop {
            if self.matches(TokenKind::As) {
                let op = self.previous();
                let ty_expr = self.type_expr();
                expr = self.ast.alloc_expr(
                    ExprKind::Cast { expr, ty_expr: Some(ty_expr), from: DataType::Void },
                    op,
                );
            } else if self.matches(TokenKind::Is) {
                let op = self.previous();
                let ty_expr = self.type_expr();
                expr = self.ast.alloc_expr(
                    ExprKind::IsTest { expr, ty_expr, target: DataType::Void },
                    op,
                );
            } else {
                break;
            }
        }
        expr
    }

    fn shift(&mut self) -> ExprId {
        let mut expr = self.term();
        while self.matches(TokenKind::LessLess) || self.matches(TokenKind::GreaterGreater) {
            let op = self.previous();
            let right = self.term();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn term(&mut self) -> ExprId {
        let mut expr = self.factor();
        while self.matches(TokenKind::Minus) || self.matches(TokenKind::Plus) {
            let op = self.previous();
            let right = self.factor();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn factor(&mut self) -> ExprId {
        let mut expr = self.prefix_unary();
        while self.matches(TokenKind::Slash)
            || self.matches(TokenKind::Star)
            || self.matches(TokenKind::Percent)
        {
            let op = self.previous();
            let right = self.prefix_unary();
            expr = self.binary(op, expr, right);
        }
        expr
    }

    fn prefix_unary(&mut self) -> ExprId {
        if self.matches(TokenKind::Bang)
            || self.matches(TokenKind::Not)
            || self.matches(TokenKind::Minus)
            || self.matches(TokenKind::Tilde)
        {
            let op = self.previous();
            let expr = self.prefix_unary();
            return self.ast.alloc_expr(ExprKind::Unary { op, expr }, op);
        }

        self.postfix()
    }

    fn postfix(&mut self) -> ExprId {
        let mut expr = self.primary();

        loop {
            if self.matches(TokenKind::LeftParen) {
                let op = self.previous();
                let mut args = Vec::new();
                if !self.check(TokenKind::RightParen) {
                    loop {
                        args.push(self.expression());
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightParen, "Expected ')' after arguments.");
                expr = self.ast.alloc_expr(
                    ExprKind::Call {
                        callee: expr,
                        args,
                        func: None,
                        callee_ty: DataType::Void,
                        ret_ty: DataType::Void,
                    },
                    op,
                );
            } else if self.matches(TokenKind::LeftBracket) {
                let op = self.previous();
                let index = self.expression();
                self.consume(TokenKind::RightBracket, "Expected ']' after an index.");
                expr = self.ast.alloc_expr(
                    ExprKind::Index { expr, index, expr_ty: DataType::Void, method: None },
                    op,
                );
            } else if self.matches(TokenKind::Dot) {
                let name = self.consume(TokenKind::Identifier, "Expected a member name after '.'.");
                expr = self.ast.alloc_expr(
                    ExprKind::Access { expr, name, var: None, object_ty: DataType::Void },
                    name,
                );
            } else if self.matches(TokenKind::PlusPlus) || self.matches(TokenKind::MinusMinus) {
                let token = self.previous();
                let op = Token {
                    kind: if token.kind == TokenKind::PlusPlus {
                        TokenKind::Plus
                    } else {
                        TokenKind::Minus
                    },
                    ..token
                };
                let one = self.ast.alloc_expr(ExprKind::Literal(Literal::Int(1)), token);
                let value = self.ast.alloc_expr(
                    ExprKind::Binary {
                        op,
                        left: expr,
                        right: one,
                        operand_ty: DataType::Void,
                        method: None,
                    },
                    op,
                );
                expr = self.ast.alloc_expr(
                    ExprKind::Assign {
                        target: expr,
                        value,
                        var: None,
                        method: None,
                        value_ty: DataType::Void,
                    },
                    op,
                );
            } else {
                break;
            }
        }

        expr
    }

    fn primary(&mut self) -> ExprId {
        let token = self.peek();

        match token.kind {
            TokenKind::True => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Literal(Literal::Bool(true)), token)
            }
            TokenKind::False => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Literal(Literal::Bool(false)), token)
            }
            TokenKind::Null => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Literal(Literal::Null), token)
            }
            TokenKind::Integer => {
                self.advance();
                let value = self.interner.resolve(token.lexeme).parse::<i64>().unwrap_or(0);
                self.ast.alloc_expr(ExprKind::Literal(Literal::Int(value as i32)), token)
            }
            TokenKind::Float => {
                self.advance();
                let value = self.interner.resolve(token.lexeme).parse::<f32>().unwrap_or(0.0);
                self.ast.alloc_expr(ExprKind::Literal(Literal::Float(value)), token)
            }
            TokenKind::String => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Literal(Literal::Str(token.lexeme)), token)
            }
            TokenKind::This => {
                self.advance();
                self.ast.alloc_expr(ExprKind::This, token)
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression();
                self.consume(TokenKind::RightParen, "Expected ')' after expression.");
                self.ast.alloc_expr(ExprKind::Group(expr), token)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut elems = Vec::new();
                if !self.check(TokenKind::RightBracket) {
                    loop {
                        elems.push(self.expression());
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightBracket, "Expected ']' after array elements.");
                self.ast.alloc_expr(ExprKind::ArrayLit { elems }, token)
            }
            TokenKind::Identifier => {
                self.advance();
                let targs = self.try_type_arguments();
                self.ast.alloc_expr(
                    ExprKind::Var { name: token.lexeme, targs, var: None },
                    token,
                )
            }
            TokenKind::Super => {
                self.advance();
                self.error(token, "Classes have no base class; 'super' is reserved.");
                self.null_expr(token)
            }
            _ => {
                self.error(token, "Expected an expression.");
                self.null_expr(token)
            }
        }
    }

    /// Attempts to parse `<type, …>` immediately followed by `(`, for
    /// explicit template instantiation; rewinds if it is a comparison.
    fn try_type_arguments(&mut self) -> Vec<crate::ast::TypeExpr> {
        if !self.check(TokenKind::Less) {
            return Vec::new();
        }

        let mark = self.mark();
        self.advance();

        let mut args = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Identifier
                | TokenKind::IdentifierInt
                | TokenKind::IdentifierFloat
                | TokenKind::IdentifierBool
                | TokenKind::IdentifierString
                | TokenKind::IdentifierVoid => args.push(self.type_expr()),
                _ => {
                    self.rewind(mark);
                    return Vec::new();
                }
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }

        if self.check(TokenKind::Greater) && self.peek_at(1) == TokenKind::LeftParen {
            self.advance();
            args
        } else {
            self.rewind(mark);
            Vec::new()
        }
    }

    fn binary(&mut self, op: Token, left: ExprId, right: ExprId) -> ExprId {
        self.ast.alloc_expr(
            ExprKind::Binary { op, left, right, operand_ty: DataType::Void, method: None },
            op,
        )
    }
}
