//! Recursive descent parser for module script source.
//!
//! Statement terminators follow a simplified automatic semicolon insertion
//! rule: a missing `;` is accepted before `}`, at end of input, or when a
//! line break separates the statement from the next token.

use std::rc::Rc;

use thiserror::Error;

use crate::ast::*;
use crate::lexer::{tokenize, LexError, LineIndex, Span, Token};

/// Maximum nesting of statements and expressions
const MAX_NESTING_DEPTH: usize = 64;

/// Parse failure with a byte span into the source
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("Unexpected {found}, expected {expected}")]
    Unexpected {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("Unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String, span: Span },

    #[error("Invalid assignment target")]
    InvalidAssignmentTarget { span: Span },

    #[error("Missing initializer in const declaration '{name}'")]
    MissingInitializer { name: String, span: Span },

    #[error("'{0}' declarations are only allowed at the top level of a module")]
    NotTopLevel(&'static str, Span),

    #[error("Nesting is too deep")]
    TooDeep { span: Span },
}

impl ParseError {
    /// Span of the error location
    pub fn span(&self) -> Span {
        match self {
            ParseError::Lex(err) => err.span(),
            ParseError::Unexpected { span, .. }
            | ParseError::UnexpectedEof { span, .. }
            | ParseError::InvalidAssignmentTarget { span }
            | ParseError::TooDeep { span }
            | ParseError::MissingInitializer { span, .. }
            | ParseError::NotTopLevel(_, span) => *span,
        }
    }

    /// Render as `line:column: message` for the given source
    pub fn render(&self, source: &str) -> String {
        let (line, column) = LineIndex::new(source).line_col(self.span().start);
        format!("{}:{}: {}", line, column, self)
    }
}

/// Parse module source text into a [`Program`]
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.parse_program()
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, Span)>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    // ---------------------------------------------------------------------
    // Token helpers
    // ---------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn current_span(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some((_, span)) => *span,
            None => Span::new(self.source.len(), self.source.len()),
        }
    }

    /// `import(` or `import.` opens an expression, not a declaration
    fn import_starts_expression(&self) -> bool {
        matches!(
            self.tokens.get(self.pos + 1),
            Some((Token::LeftParen | Token::Dot, _))
        )
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(found) => ParseError::Unexpected {
                expected: expected.to_string(),
                found: found.describe(),
                span: self.current_span(),
            },
            None => ParseError::UnexpectedEof {
                expected: expected.to_string(),
                span: self.current_span(),
            },
        }
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ParseError::TooDeep {
                span: self.current_span(),
            });
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<(), ParseError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(expected))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Identifier(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("identifier")),
        }
    }

    /// Identifier or keyword (property names, export/import aliases)
    fn expect_identifier_name(&mut self) -> Result<String, ParseError> {
        match self.peek().and_then(Token::identifier_name) {
            Some(name) => {
                self.pos += 1;
                Ok(name)
            }
            None => Err(self.error("name")),
        }
    }

    fn expect_string(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::String(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.error("module specifier string")),
        }
    }

    fn newline_before_current(&self) -> bool {
        if self.pos == 0 {
            return false;
        }
        let prev_end = self.tokens[self.pos - 1].1.end;
        let start = self.current_span().start;
        self.source[prev_end..start].contains('\n')
    }

    fn consume_semicolon(&mut self) -> Result<(), ParseError> {
        if self.eat(&Token::Semicolon) {
            return Ok(());
        }
        if self.peek().is_none() || self.at(&Token::RightBrace) || self.newline_before_current() {
            return Ok(());
        }
        Err(self.error("';'"))
    }

    // ---------------------------------------------------------------------
    // Module level
    // ---------------------------------------------------------------------

    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut items = Vec::new();
        while self.peek().is_some() {
            items.push(self.parse_module_item()?);
        }
        Ok(Program { items })
    }

    fn parse_module_item(&mut self) -> Result<ModuleItem, ParseError> {
        match self.peek() {
            Some(Token::Import) if !self.import_starts_expression() => {
                Ok(ModuleItem::Import(self.parse_import()?))
            }
            Some(Token::Export) => Ok(ModuleItem::Export(self.parse_export()?)),
            _ => Ok(ModuleItem::Stmt(self.parse_statement()?)),
        }
    }

    fn parse_import(&mut self) -> Result<ImportDecl, ParseError> {
        let start = self.current_span().start;
        self.expect(Token::Import, "'import'")?;

        let mut decl = ImportDecl {
            specifier: String::new(),
            default: None,
            namespace: None,
            named: Vec::new(),
            span: Span::default(),
        };

        // Side-effect import
        if let Some(Token::String(_)) = self.peek() {
            decl.specifier = self.expect_string()?;
            self.consume_semicolon()?;
            decl.span = Span::new(start, self.previous_end());
            return Ok(decl);
        }

        if let Some(Token::Identifier(_)) = self.peek() {
            decl.default = Some(self.expect_identifier()?);
            if !self.eat(&Token::Comma) {
                return self.finish_import(decl, start);
            }
        }

        if self.eat(&Token::Star) {
            self.expect(Token::As, "'as'")?;
            decl.namespace = Some(self.expect_identifier()?);
        } else if self.eat(&Token::LeftBrace) {
            while !self.at(&Token::RightBrace) {
                let plain = matches!(self.peek(), Some(Token::Identifier(_)));
                let imported = self.expect_identifier_name()?;
                let local = if self.eat(&Token::As) {
                    self.expect_identifier()?
                } else if plain {
                    imported.clone()
                } else {
                    return Err(self.error("'as'"));
                };
                decl.named.push(ImportSpecifier { imported, local });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RightBrace, "'}'")?;
        } else {
            return Err(self.error("import clause"));
        }

        self.finish_import(decl, start)
    }

    fn finish_import(&mut self, mut decl: ImportDecl, start: usize) -> Result<ImportDecl, ParseError> {
        self.expect(Token::From, "'from'")?;
        decl.specifier = self.expect_string()?;
        self.consume_semicolon()?;
        decl.span = Span::new(start, self.previous_end());
        Ok(decl)
    }

    fn previous_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, span)| span.end)
            .unwrap_or(0)
    }

    fn parse_export(&mut self) -> Result<ExportDecl, ParseError> {
        let start = self.current_span().start;
        self.expect(Token::Export, "'export'")?;

        match self.peek() {
            Some(Token::Const) | Some(Token::Let) => {
                Ok(ExportDecl::Declaration(self.parse_var_decl()?))
            }
            Some(Token::Function) => {
                let func = self.parse_function(true)?;
                Ok(ExportDecl::Declaration(Stmt::Function(func)))
            }
            Some(Token::Default) => {
                self.advance();
                if self.at(&Token::Function) {
                    let func = self.parse_function(false)?;
                    Ok(ExportDecl::DefaultFunction(func))
                } else {
                    let expr = self.parse_assignment()?;
                    self.consume_semicolon()?;
                    Ok(ExportDecl::DefaultExpr(expr))
                }
            }
            Some(Token::LeftBrace) => {
                self.advance();
                let mut specifiers = Vec::new();
                while !self.at(&Token::RightBrace) {
                    let local = self.expect_identifier_name()?;
                    let exported = if self.eat(&Token::As) {
                        self.expect_identifier_name()?
                    } else {
                        local.clone()
                    };
                    specifiers.push(ExportSpecifier { local, exported });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RightBrace, "'}'")?;
                let from = if self.eat(&Token::From) {
                    Some(self.expect_string()?)
                } else {
                    None
                };
                self.consume_semicolon()?;
                Ok(ExportDecl::Named {
                    specifiers,
                    from,
                    span: Span::new(start, self.previous_end()),
                })
            }
            _ => Err(self.error("export declaration")),
        }
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        self.nested(Self::parse_statement_kind)
    }

    fn parse_statement_kind(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            Some(Token::Import) if !self.import_starts_expression() => {
                Err(ParseError::NotTopLevel("import", self.current_span()))
            }
            Some(Token::Export) => Err(ParseError::NotTopLevel("export", self.current_span())),
            Some(Token::Const) | Some(Token::Let) => self.parse_var_decl(),
            Some(Token::Function) => Ok(Stmt::Function(self.parse_function(true)?)),
            Some(Token::If) => self.parse_if(),
            Some(Token::While) => {
                self.advance();
                self.expect(Token::LeftParen, "'('")?;
                let test = self.parse_expression()?;
                self.expect(Token::RightParen, "')'")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While { test, body })
            }
            Some(Token::LeftBrace) => Ok(Stmt::Block(self.parse_block()?)),
            Some(Token::Return) => {
                self.advance();
                let value = if self.at(&Token::Semicolon)
                    || self.at(&Token::RightBrace)
                    || self.peek().is_none()
                    || self.newline_before_current()
                {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.consume_semicolon()?;
                Ok(Stmt::Return(value))
            }
            Some(Token::Throw) => {
                self.advance();
                let value = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Throw(value))
            }
            Some(Token::Semicolon) => {
                self.advance();
                Ok(Stmt::Empty)
            }
            _ => {
                let expr = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_var_decl(&mut self) -> Result<Stmt, ParseError> {
        let kind = match self.advance() {
            Some(Token::Const) => VarKind::Const,
            _ => VarKind::Let,
        };
        let mut declarations = Vec::new();
        loop {
            let span = self.current_span();
            let name = self.expect_identifier()?;
            let init = if self.eat(&Token::Equal) {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            if kind == VarKind::Const && init.is_none() {
                return Err(ParseError::MissingInitializer { name, span });
            }
            declarations.push((name, init));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.consume_semicolon()?;
        Ok(Stmt::VarDecl { kind, declarations })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.expect(Token::If, "'if'")?;
        self.expect(Token::LeftParen, "'('")?;
        let test = self.parse_expression()?;
        self.expect(Token::RightParen, "')'")?;
        let consequent = Box::new(self.parse_statement()?);
        let alternate = if self.eat(&Token::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            test,
            consequent,
            alternate,
        })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(Token::LeftBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.at(&Token::RightBrace) {
            if self.peek().is_none() {
                return Err(self.error("'}'"));
            }
            body.push(self.parse_statement()?);
        }
        self.expect(Token::RightBrace, "'}'")?;
        Ok(body)
    }

    fn parse_function(&mut self, require_name: bool) -> Result<Rc<FunctionDecl>, ParseError> {
        let start = self.current_span().start;
        self.expect(Token::Function, "'function'")?;
        let name = match self.peek() {
            Some(Token::Identifier(_)) => Some(self.expect_identifier()?),
            _ if require_name => return Err(self.error("function name")),
            _ => None,
        };
        self.expect(Token::LeftParen, "'('")?;
        let mut params = Vec::new();
        while !self.at(&Token::RightParen) {
            params.push(self.expect_identifier()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RightParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Rc::new(FunctionDecl {
            name,
            params,
            body,
            span: Span::new(start, self.previous_end()),
        }))
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_assignment_kind)
    }

    fn parse_assignment_kind(&mut self) -> Result<Expr, ParseError> {
        let span = self.current_span();
        let target = self.parse_or()?;
        if self.eat(&Token::Equal) {
            if !matches!(
                target,
                Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }
            ) {
                return Err(ParseError::InvalidAssignmentTarget { span });
            }
            let value = self.parse_assignment()?;
            return Ok(Expr::Assign {
                target: Box::new(target),
                value: Box::new(value),
            });
        }
        Ok(target)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::PipePipe) {
            let right = self.parse_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_binary(0)?;
        while self.eat(&Token::AmpAmp) {
            let right = self.parse_binary(0)?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// Precedence climbing over equality, relational, additive and
    /// multiplicative operators
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        while let Some((op, prec)) = self.peek().and_then(binary_op) {
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Plus,
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Typeof) => UnaryOp::Typeof,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = if self.at(&Token::New) {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let property = self.expect_identifier_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
                Some(Token::LeftBracket) => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(Token::RightBracket, "']'")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::LeftParen) => {
                    let args = self.parse_arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_new(&mut self) -> Result<Expr, ParseError> {
        self.expect(Token::New, "'new'")?;
        let mut callee = if self.at(&Token::New) {
            self.nested(Self::parse_new)?
        } else {
            self.parse_primary()?
        };
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let property = self.expect_identifier_name()?;
                    callee = Expr::Member {
                        object: Box::new(callee),
                        property,
                    };
                }
                Some(Token::LeftBracket) => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(Token::RightBracket, "']'")?;
                    callee = Expr::Index {
                        object: Box::new(callee),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        let args = if self.at(&Token::LeftParen) {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
        })
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(Token::LeftParen, "'('")?;
        let mut args = Vec::new();
        while !self.at(&Token::RightParen) {
            args.push(self.parse_assignment()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RightParen, "')'")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Number(n)) => {
                let n = *n;
                self.advance();
                Ok(Expr::Number(n))
            }
            Some(Token::String(s)) => {
                let s: Rc<str> = Rc::from(s.as_str());
                self.advance();
                Ok(Expr::String(s))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Some(Token::Null) => {
                self.advance();
                Ok(Expr::Null)
            }
            Some(Token::Undefined) => {
                self.advance();
                Ok(Expr::Undefined)
            }
            Some(Token::Identifier(name)) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Ident(name))
            }
            Some(Token::LeftParen) => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(Token::RightParen, "')'")?;
                Ok(expr)
            }
            Some(Token::LeftBracket) => {
                self.advance();
                let mut elements = Vec::new();
                while !self.at(&Token::RightBracket) {
                    elements.push(self.parse_assignment()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RightBracket, "']'")?;
                Ok(Expr::Array(elements))
            }
            Some(Token::LeftBrace) => self.parse_object(),
            Some(Token::Function) => Ok(Expr::Function(self.parse_function(false)?)),
            Some(Token::Import) => self.parse_import_expression(),
            _ => Err(self.error("expression")),
        }
    }

    fn parse_import_expression(&mut self) -> Result<Expr, ParseError> {
        self.expect(Token::Import, "'import'")?;
        if self.eat(&Token::Dot) {
            return match self.peek() {
                Some(Token::Identifier(name)) if name == "meta" => {
                    self.advance();
                    Ok(Expr::ImportMeta)
                }
                _ => Err(self.error("'meta'")),
            };
        }
        self.expect(Token::LeftParen, "'('")?;
        let specifier = self.parse_assignment()?;
        self.expect(Token::RightParen, "')'")?;
        Ok(Expr::DynamicImport(Box::new(specifier)))
    }

    fn parse_object(&mut self) -> Result<Expr, ParseError> {
        self.expect(Token::LeftBrace, "'{'")?;
        let mut properties = Vec::new();
        while !self.at(&Token::RightBrace) {
            let (key, shorthand) = match self.peek() {
                Some(Token::String(s)) => {
                    let s = s.clone();
                    self.advance();
                    (s, false)
                }
                Some(Token::Number(n)) => {
                    let key = crate::value::number_to_string(*n);
                    self.advance();
                    (key, false)
                }
                Some(Token::Identifier(_)) => (self.expect_identifier_name()?, true),
                _ => (self.expect_identifier_name()?, false),
            };
            let value = if self.eat(&Token::Colon) {
                self.parse_assignment()?
            } else if shorthand {
                Expr::Ident(key.clone())
            } else {
                return Err(self.error("':'"));
            };
            properties.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RightBrace, "'}'")?;
        Ok(Expr::Object(properties))
    }
}

fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
    let op = match token {
        Token::EqualEqual => (BinaryOp::Equal, 1),
        Token::BangEqual => (BinaryOp::NotEqual, 1),
        Token::EqualEqualEqual => (BinaryOp::StrictEqual, 1),
        Token::BangEqualEqual => (BinaryOp::StrictNotEqual, 1),
        Token::Less => (BinaryOp::Less, 2),
        Token::Greater => (BinaryOp::Greater, 2),
        Token::LessEqual => (BinaryOp::LessEqual, 2),
        Token::GreaterEqual => (BinaryOp::GreaterEqual, 2),
        Token::Plus => (BinaryOp::Add, 3),
        Token::Minus => (BinaryOp::Sub, 3),
        Token::Star => (BinaryOp::Mul, 4),
        Token::Slash => (BinaryOp::Div, 4),
        Token::Percent => (BinaryOp::Mod, 4),
        _ => return None,
    };
    Some(op)
}
