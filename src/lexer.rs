use crate::error::Diagnostics;
use crate::intern::{Interner, Symbol};
use crate::token::{Span, Token, TokenKind};

const INDENT_SPACE: u8 = 1;
const INDENT_TAB: u8 = 2;

/// Converts source text to a token stream under the off-side rule.
///
/// A stack of indentation widths (initially `[0]`) turns indentation
/// changes into explicit `Indent`/`Dedent` tokens. Inside brackets a
/// multi-line counter suppresses `Newline` and indentation handling.
pub struct Lexer<'src, 'int> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    pos: usize,
    start_line: i32,
    start_col: i32,
    line: i32,
    col: i32,
    multi_line: i32,
    indentation: Vec<i32>,
    indent_kind: u8,
    tokens: Vec<Token>,
    interner: &'int mut Interner,
}

impl<'src, 'int> Lexer<'src, 'int> {
    pub fn new(source: &'src str, interner: &'int mut Interner) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            start: 0,
            pos: 0,
            start_line: 1,
            start_col: 1,
            line: 1,
            col: 1,
            multi_line: 0,
            indentation: vec![0],
            indent_kind: 0,
            tokens: Vec::new(),
            interner,
        }
    }

    pub fn scan(mut self, diagnostics: &mut Diagnostics) -> Vec<Token> {
        loop {
            self.scan_indentation(diagnostics);

            if self.eof() {
                break;
            }

            self.start = self.pos;
            self.start_line = self.line;
            self.start_col = self.col;

            self.scan_token(diagnostics);
        }

        if self.multi_line > 0 {
            diagnostics.report(self.span(), "Reached end-of-file in multi-line mode");
        }

        if !matches!(self.tokens.last().map(|t| t.kind), None | Some(TokenKind::Newline)) {
            self.add_token_lexeme(TokenKind::Newline, "\\n");
        }

        while *self.indentation.last().unwrap() > 0 {
            self.indentation.pop();
            self.add_token_lexeme(TokenKind::Dedent, "");
        }

        self.add_token_lexeme(TokenKind::Eof, "");

        self.tokens
    }

    fn span(&self) -> Span {
        Span::new(self.start_line, self.start_col, self.line, self.col)
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme = self.interner.intern(&self.source[self.start..self.pos]);
        self.tokens.push(Token::new(kind, lexeme, self.span()));
    }

    fn add_token_lexeme(&mut self, kind: TokenKind, lexeme: &str) {
        let lexeme = self.interner.intern(lexeme);
        self.tokens.push(Token::new(kind, lexeme, self.span()));
    }

    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn newline(&mut self) {
        self.col = 1;
        self.line += 1;
    }

    fn advance(&mut self) -> u8 {
        let c = self.bytes[self.pos];
        self.pos += 1;
        self.col += 1;
        c
    }

    fn peek(&self) -> u8 {
        if self.eof() {
            0
        } else {
            self.bytes[self.pos]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.pos + 1 >= self.bytes.len() {
            0
        } else {
            self.bytes[self.pos + 1]
        }
    }

    fn matches(&mut self, c: u8) -> bool {
        if self.peek() == c {
            self.advance();
            return true;
        }
        false
    }

    fn string(&mut self, diagnostics: &mut Diagnostics) {
        while self.peek() != b'"' {
            if self.peek() == b'\n' {
                self.advance();
                self.newline();
                continue;
            }

            if self.eof() {
                diagnostics.report(self.span(), "Unterminated string");
                return;
            }

            self.advance();
        }

        let lexeme = self.interner.intern(&self.source[self.start + 1..self.pos]);
        let span = self.span();
        self.advance();
        self.tokens.push(Token::new(TokenKind::String, lexeme, span));
    }

    fn number(&mut self) {
        let mut kind = TokenKind::Integer;

        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
            kind = TokenKind::Float;
        }

        self.add_token(kind);
    }

    fn literal(&mut self) {
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.advance();
        }

        let text = &self.source[self.start..self.pos];

        // Dispatch on the first character, then the full word.
        let kind = match text.as_bytes()[0] {
            b'a' => match text {
                "and" => TokenKind::And,
                "as" => TokenKind::As,
                _ => TokenKind::Identifier,
            },
            b'b' => match text {
                "bool" => TokenKind::IdentifierBool,
                "break" => TokenKind::Break,
                _ => TokenKind::Identifier,
            },
            b'c' => match text {
                "class" => TokenKind::Class,
                "continue" => TokenKind::Continue,
                _ => TokenKind::Identifier,
            },
            b'e' => match text {
                "else" => TokenKind::Else,
                _ => TokenKind::Identifier,
            },
            b'f' => match text {
                "false" => TokenKind::False,
                "for" => TokenKind::For,
                "float" => TokenKind::IdentifierFloat,
                _ => TokenKind::Identifier,
            },
            b'i' => match text {
                "if" => TokenKind::If,
                "in" => TokenKind::In,
                "int" => TokenKind::IdentifierInt,
                "is" => TokenKind::Is,
                "import" => TokenKind::Import,
                _ => TokenKind::Identifier,
            },
            b'n' => match text {
                "null" => TokenKind::Null,
                "not" => TokenKind::Not,
                _ => TokenKind::Identifier,
            },
            b'o' => match text {
                "or" => TokenKind::Or,
                _ => TokenKind::Identifier,
            },
            b'r' => match text {
                "return" => TokenKind::Return,
                _ => TokenKind::Identifier,
            },
            b's' => match text {
                "super" => TokenKind::Super,
                "string" => TokenKind::IdentifierString,
                _ => TokenKind::Identifier,
            },
            b't' => match text {
                "this" => TokenKind::This,
                "true" => TokenKind::True,
                _ => TokenKind::Identifier,
            },
            b'v' => match text {
                "void" => TokenKind::IdentifierVoid,
                _ => TokenKind::Identifier,
            },
            b'w' => match text {
                "while" => TokenKind::While,
                _ => TokenKind::Identifier,
            },
            _ => TokenKind::Identifier,
        };

        self.add_token(kind);
    }

    fn comment(&mut self) {
        while self.peek() != b'\n' && !self.eof() {
            self.advance();
        }
    }

    fn scan_token(&mut self, diagnostics: &mut Diagnostics) {
        let c = self.advance();

        match c {
            b'(' => {
                self.multi_line += 1;
                self.add_token(TokenKind::LeftParen);
            }
            b')' => {
                self.multi_line -= 1;
                self.add_token(TokenKind::RightParen);
            }
            b'{' => {
                self.multi_line += 1;
                self.add_token(TokenKind::LeftBrace);
            }
            b'}' => {
                self.multi_line -= 1;
                self.add_token(TokenKind::RightBrace);
            }
            b'[' => {
                self.multi_line += 1;
                self.add_token(TokenKind::LeftBracket);
            }
            b']' => {
                self.multi_line -= 1;
                self.add_token(TokenKind::RightBracket);
            }

            b',' => self.add_token(TokenKind::Comma),
            b'.' => self.add_token(TokenKind::Dot),
            b':' => self.add_token(TokenKind::Colon),
            b';' => self.add_token(TokenKind::Semicolon),

            b'+' => {
                if self.matches(b'+') {
                    self.add_token(TokenKind::PlusPlus);
                } else if self.matches(b'=') {
                    self.add_token(TokenKind::PlusEqual);
                } else {
                    self.add_token(TokenKind::Plus);
                }
            }
            b'-' => {
                if self.matches(b'-') {
                    self.add_token(TokenKind::MinusMinus);
                } else if self.matches(b'=') {
                    self.add_token(TokenKind::MinusEqual);
                } else if self.matches(b'>') {
                    self.add_token(TokenKind::Arrow);
                } else {
                    self.add_token(TokenKind::Minus);
                }
            }
            b'/' => {
                let kind = if self.matches(b'=') { TokenKind::SlashEqual } else { TokenKind::Slash };
                self.add_token(kind);
            }
            b'%' => {
                let kind =
                    if self.matches(b'=') { TokenKind::PercentEqual } else { TokenKind::Percent };
                self.add_token(kind);
            }
            b'*' => {
                let kind = if self.matches(b'=') { TokenKind::StarEqual } else { TokenKind::Star };
                self.add_token(kind);
            }
            b'!' => {
                let kind = if self.matches(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.add_token(kind);
            }
            b'=' => {
                let kind = if self.matches(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.add_token(kind);
            }
            b'<' => {
                if self.matches(b'=') {
                    self.add_token(TokenKind::LessEqual);
                } else if self.matches(b'<') {
                    self.add_token(TokenKind::LessLess);
                } else {
                    self.add_token(TokenKind::Less);
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    self.add_token(TokenKind::GreaterEqual);
                } else if self.matches(b'>') {
                    self.add_token(TokenKind::GreaterGreater);
                } else {
                    self.add_token(TokenKind::Greater);
                }
            }

            b'&' => self.add_token(TokenKind::Ampersand),
            b'|' => self.add_token(TokenKind::Pipe),
            b'^' => self.add_token(TokenKind::Caret),
            b'~' => self.add_token(TokenKind::Tilde),

            b'#' => self.comment(),

            b'"' => self.string(diagnostics),

            b' ' | b'\t' | b'\r' => {}

            b'\n' => {
                if self.multi_line == 0 {
                    self.add_token_lexeme(TokenKind::Newline, "\\n");
                }
                self.newline();
            }

            _ => {
                if c.is_ascii_digit() {
                    self.number();
                } else if c.is_ascii_alphabetic() || c == b'_' {
                    self.literal();
                } else {
                    diagnostics.report(self.span(), "Unexpected character");
                }
            }
        }
    }

    fn scan_indentation(&mut self, diagnostics: &mut Diagnostics) {
        if self.multi_line > 0 || self.col != 1 {
            return;
        }

        self.start = self.pos;
        self.start_line = self.line;
        self.start_col = self.col;

        let mut indentation = 0;

        loop {
            match self.peek() {
                b'#' => {
                    self.advance();
                    self.comment();
                }
                b'\n' => {
                    indentation = 0;
                    self.advance();
                    self.newline();
                }
                b' ' => {
                    indentation += 1;
                    self.indent_kind |= INDENT_SPACE;
                    self.advance();
                }
                b'\t' => {
                    indentation += 4;
                    self.indent_kind |= INDENT_TAB;
                    self.advance();
                }
                b'\r' => {
                    self.advance();
                }
                _ => break,
            }

            if self.eof() {
                return;
            }
        }

        if self.eof() {
            return;
        }

        if self.indent_kind & INDENT_SPACE != 0 && self.indent_kind & INDENT_TAB != 0 {
            diagnostics.report(self.span(), "Mixing of tabs and spaces");
            self.indent_kind = 0;
        }

        let current = *self.indentation.last().unwrap();
        if indentation > current {
            self.indentation.push(indentation);
            self.add_token_lexeme(TokenKind::Indent, "");
        } else if indentation < current {
            while *self.indentation.last().unwrap() > indentation {
                self.indentation.pop();
                self.add_token_lexeme(TokenKind::Dedent, "");
            }

            if *self.indentation.last().unwrap() != indentation {
                diagnostics.report(self.span(), "Unexpected deindent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> (Vec<Token>, Diagnostics, Interner) {
        let mut interner = Interner::new();
        let mut diagnostics = Diagnostics::new();
        let tokens = Lexer::new(source, &mut interner).scan(&mut diagnostics);
        (tokens, diagnostics, interner)
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_arithmetic_expression() {
        let (tokens, diagnostics, _) = scan("1 + 2 * 3\n");
        assert!(!diagnostics.has_errors());
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Integer,
                TokenKind::Plus,
                TokenKind::Integer,
                TokenKind::Star,
                TokenKind::Integer,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn indent_and_dedent_are_balanced() {
        let source = "if a:\n    b\n    if c:\n        d\ne\n";
        let (tokens, diagnostics, _) = scan(source);
        assert!(!diagnostics.has_errors());
        let indents = tokens.iter().filter(|t| t.kind == TokenKind::Indent).count();
        let dedents = tokens.iter().filter(|t| t.kind == TokenKind::Dedent).count();
        assert_eq!(indents, 2);
        assert_eq!(indents, dedents);
    }

    #[test]
    fn dedents_drain_at_eof() {
        let (tokens, diagnostics, _) = scan("if a:\n    b");
        assert!(!diagnostics.has_errors());
        let dedents = tokens.iter().filter(|t| t.kind == TokenKind::Dedent).count();
        assert_eq!(dedents, 1);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn mixing_tabs_and_spaces_reports_error() {
        let (_, diagnostics, _) = scan("if a:\n\tb\nif c:\n    d\n");
        assert!(diagnostics.has_errors());
        assert!(diagnostics.diagnostics()[0].message.contains("Mixing of tabs and spaces"));
    }

    #[test]
    fn unexpected_deindent_reports_error() {
        let (_, diagnostics, _) = scan("if a:\n        b\n    c\n");
        assert!(diagnostics.has_errors());
        assert!(diagnostics.diagnostics()[0].message.contains("Unexpected deindent"));
    }

    #[test]
    fn newlines_are_suppressed_inside_brackets() {
        let (tokens, diagnostics, _) = scan("f(1,\n  2)\n");
        assert!(!diagnostics.has_errors());
        let newlines = tokens.iter().filter(|t| t.kind == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn unterminated_bracket_reports_error_at_eof() {
        let (_, diagnostics, _) = scan("f(1, 2\n");
        assert!(diagnostics.has_errors());
        assert!(diagnostics.diagnostics()[0]
            .message
            .contains("Reached end-of-file in multi-line mode"));
    }

    #[test]
    fn string_lexeme_excludes_quotes() {
        let (tokens, diagnostics, interner) = scan("\"hello\"\n");
        assert!(!diagnostics.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(interner.resolve(tokens[0].lexeme), "hello");
    }

    #[test]
    fn unterminated_string_reports_error() {
        let (_, diagnostics, _) = scan("\"hello");
        assert!(diagnostics.has_errors());
        assert!(diagnostics.diagnostics()[0].message.contains("Unterminated string"));
    }

    #[test]
    fn type_names_lex_as_identifier_kinds() {
        let (tokens, _, _) = scan("int float bool string void\n");
        assert_eq!(
            kinds(&tokens)[..5],
            [
                TokenKind::IdentifierInt,
                TokenKind::IdentifierFloat,
                TokenKind::IdentifierBool,
                TokenKind::IdentifierString,
                TokenKind::IdentifierVoid,
            ]
        );
    }

    #[test]
    fn float_and_integer_literals() {
        let (tokens, _, interner) = scan("3.25 10\n");
        assert_eq!(tokens[0].kind, TokenKind::Float);
        assert_eq!(interner.resolve(tokens[0].lexeme), "3.25");
        assert_eq!(tokens[1].kind, TokenKind::Integer);
    }

    #[test]
    fn comments_are_skipped() {
        let (tokens, diagnostics, _) = scan("# leading comment\nx = 1 # trailing\n");
        assert!(!diagnostics.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
    }

    #[test]
    fn spans_are_one_based() {
        let (tokens, _, _) = scan("x\n");
        assert_eq!(tokens[0].span.start_line, 1);
        assert_eq!(tokens[0].span.start_col, 1);
        assert_eq!(tokens[0].span.end_col, 2);
    }

    #[test]
    fn compound_operators() {
        let (tokens, _, _) = scan("a += 1; a -> b; a >> 2\n");
        let kinds = kinds(&tokens);
        assert!(kinds.contains(&TokenKind::PlusEqual));
        assert!(kinds.contains(&TokenKind::Arrow));
        assert!(kinds.contains(&TokenKind::GreaterGreater));
    }
}
