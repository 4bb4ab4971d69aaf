//! Recursive-descent parser for the script subset.
//!
//! Precedence, lowest first:
//!
//! ```text
//! assignment  = <- += -= *= /=   (right associative)
//! ternary     ?:
//! or          ||
//! and         &&
//! equality    == !=
//! comparison  < <= > >=
//! additive    + -
//! multiply    * / %
//! unary       - ! typeof ++ --
//! postfix     . [] () ++ --
//! ```
//!
//! Semicolons are optional after simple statements.

use std::rc::Rc;

use crate::ast::{AssignOp, BinaryOp, Expr, FunctionProto, Stmt, StmtKind, UnaryOp};
use crate::error::CompileError;
use crate::lexer::{Token, TokenKind, tokenize};

/// Deepest nesting of expressions and statements a buffer may use.
const MAX_NESTING: usize = 128;

/// Compile a whole buffer into the prototype of its top-level function.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn parse(source: &str, source_name: &str) -> Result<Rc<FunctionProto>, CompileError> {
    let tokens = tokenize(source)
        .map_err(|e| CompileError::new(e.message, source_name, e.line, e.column))?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source_name: Rc::from(source_name),
        loop_depth: 0,
        nesting: 0,
    };
    let mut body = Vec::new();
    while !parser.check(&TokenKind::Eof) {
        body.push(parser.statement()?);
    }
    Ok(Rc::new(FunctionProto {
        name: Rc::from("main"),
        params: Vec::new(),
        body,
        source: parser.source_name.clone(),
        line: 1,
    }))
}

type ParseResult<T> = Result<T, CompileError>;

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    source_name: Rc<str>,
    /// Number of enclosing loops in the current function.
    loop_depth: usize,
    /// Number of enclosing expressions and statements.
    nesting: usize,
}

impl<'src> Parser<'src> {
    // =========================================
    // Token access
    // =========================================

    fn peek(&self) -> &Token<'src> {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn previous_line(&self) -> u32 {
        self.tokens[self.pos.saturating_sub(1)].line
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token<'src> {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> ParseResult<Token<'src>> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("expected '{}'", kind)))
        }
    }

    fn expect_identifier(&mut self) -> ParseResult<Rc<str>> {
        if self.check(&TokenKind::Identifier) {
            Ok(Rc::from(self.advance().lexeme))
        } else {
            Err(self.error_here("expected 'IDENTIFIER'"))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> CompileError {
        let token = self.peek();
        CompileError::new(message, &self.source_name, token.line, token.column)
    }

    /// Optional statement terminator.
    fn end_of_statement(&mut self) -> ParseResult<()> {
        if self.eat(&TokenKind::Semicolon) {
            return Ok(());
        }
        let token = self.peek();
        if matches!(token.kind, TokenKind::RightBrace | TokenKind::Eof)
            || token.line > self.previous_line()
        {
            Ok(())
        } else {
            Err(self.error_here("end of statement expected (; or lf)"))
        }
    }

    fn nested<T>(
        &mut self,
        message: &str,
        parse: fn(&mut Self) -> ParseResult<T>,
    ) -> ParseResult<T> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error_here(message));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    // =========================================
    // Statements
    // =========================================

    fn statement(&mut self) -> ParseResult<Stmt> {
        self.nested("statement too deeply nested", Self::statement_inner)
    }

    fn statement_inner(&mut self) -> ParseResult<Stmt> {
        let line = self.peek().line;
        let kind = match self.peek().kind {
            TokenKind::Semicolon => {
                self.advance();
                StmtKind::Empty
            }
            TokenKind::LeftBrace => StmtKind::Block(self.block()?),
            TokenKind::Local => {
                let kind = self.local_declaration()?;
                self.end_of_statement()?;
                kind
            }
            TokenKind::Function => self.function_declaration()?,
            TokenKind::If => {
                self.advance();
                self.expect(&TokenKind::LeftParen)?;
                let condition = self.expression()?;
                self.expect(&TokenKind::RightParen)?;
                let then_branch = Box::new(self.statement()?);
                let else_branch = if self.eat(&TokenKind::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                StmtKind::If {
                    condition,
                    then_branch,
                    else_branch,
                }
            }
            TokenKind::While => {
                self.advance();
                self.expect(&TokenKind::LeftParen)?;
                let condition = self.expression()?;
                self.expect(&TokenKind::RightParen)?;
                let body = Box::new(self.loop_body()?);
                StmtKind::While { condition, body }
            }
            TokenKind::For => self.for_statement()?,
            TokenKind::Break => {
                if self.loop_depth == 0 {
                    return Err(self.error_here("'break' has to be in a loop block"));
                }
                self.advance();
                self.end_of_statement()?;
                StmtKind::Break
            }
            TokenKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.error_here("'continue' has to be in a loop block"));
                }
                self.advance();
                self.end_of_statement()?;
                StmtKind::Continue
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.end_of_statement()?;
                StmtKind::Return(value)
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.expression()?;
                self.end_of_statement()?;
                StmtKind::Throw(value)
            }
            TokenKind::Try => {
                self.advance();
                let body = Box::new(self.statement()?);
                self.expect(&TokenKind::Catch)?;
                self.expect(&TokenKind::LeftParen)?;
                let binding = self.expect_identifier()?;
                self.expect(&TokenKind::RightParen)?;
                let handler = Box::new(self.statement()?);
                StmtKind::Try {
                    body,
                    binding,
                    handler,
                }
            }
            _ => {
                let expr = self.expression()?;
                self.end_of_statement()?;
                StmtKind::Expr(expr)
            }
        };
        Ok(Stmt { line, kind })
    }

    fn at_statement_end(&self) -> bool {
        let token = self.peek();
        matches!(
            token.kind,
            TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
        ) || token.line > self.previous_line()
    }

    fn loop_body(&mut self) -> ParseResult<Stmt> {
        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        body
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(&TokenKind::LeftBrace)?;
        let mut body = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.error_here("expected '}'"));
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn local_declaration(&mut self) -> ParseResult<StmtKind> {
        self.expect(&TokenKind::Local)?;
        if self.eat(&TokenKind::Function) {
            let name = self.expect_identifier()?;
            let proto = self.function_body(name.clone())?;
            return Ok(StmtKind::Local(vec![(name, Some(Expr::Function(proto)))]));
        }
        let mut bindings = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let init = if self.eat(&TokenKind::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            bindings.push((name, init));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(StmtKind::Local(bindings))
    }

    /// `function a.b::c(params) { ... }` becomes `a.b.c <- function ...`.
    fn function_declaration(&mut self) -> ParseResult<StmtKind> {
        self.expect(&TokenKind::Function)?;
        let first = self.expect_identifier()?;
        let mut target = Expr::Ident(first.clone());
        let mut name = first;
        while self.eat(&TokenKind::Dot) || self.eat(&TokenKind::ColonColon) {
            name = self.expect_identifier()?;
            target = Expr::Member {
                object: Box::new(target),
                name: name.clone(),
            };
        }
        let proto = self.function_body(name)?;
        Ok(StmtKind::Expr(Expr::Assign {
            target: Box::new(target),
            op: AssignOp::NewSlot,
            value: Box::new(Expr::Function(proto)),
        }))
    }

    fn function_body(&mut self, name: Rc<str>) -> ParseResult<Rc<FunctionProto>> {
        let line = self.peek().line;
        self.expect(&TokenKind::LeftParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let param = self.expect_identifier()?;
                if params.contains(&param) {
                    return Err(self.error_here(format!("duplicate parameter '{}'", param)));
                }
                params.push(param);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen)?;
        let enclosing_loops = std::mem::take(&mut self.loop_depth);
        let body = self.block();
        self.loop_depth = enclosing_loops;
        Ok(Rc::new(FunctionProto {
            name,
            params,
            body: body?,
            source: self.source_name.clone(),
            line,
        }))
    }

    fn for_statement(&mut self) -> ParseResult<StmtKind> {
        self.expect(&TokenKind::For)?;
        self.expect(&TokenKind::LeftParen)?;
        let init = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            let line = self.peek().line;
            let kind = if self.check(&TokenKind::Local) {
                self.local_declaration()?
            } else {
                StmtKind::Expr(self.expression()?)
            };
            Some(Box::new(Stmt { line, kind }))
        };
        self.expect(&TokenKind::Semicolon)?;
        let condition = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semicolon)?;
        let step = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::RightParen)?;
        let body = Box::new(self.loop_body()?);
        Ok(StmtKind::For {
            init,
            condition,
            step,
            body,
        })
    }

    // =========================================
    // Expressions
    // =========================================

    fn expression(&mut self) -> ParseResult<Expr> {
        self.nested("expression too deeply nested", Self::assignment)
    }

    fn assignment(&mut self) -> ParseResult<Expr> {
        let target = self.ternary()?;
        let op = match self.peek().kind {
            TokenKind::Assign => AssignOp::Set,
            TokenKind::NewSlot => AssignOp::NewSlot,
            TokenKind::PlusAssign => AssignOp::Compound(BinaryOp::Add),
            TokenKind::MinusAssign => AssignOp::Compound(BinaryOp::Sub),
            TokenKind::StarAssign => AssignOp::Compound(BinaryOp::Mul),
            TokenKind::SlashAssign => AssignOp::Compound(BinaryOp::Div),
            _ => return Ok(target),
        };
        if !target.is_assignable() {
            return Err(self.error_here("can't assign expression"));
        }
        self.advance();
        let value = self.expression()?;
        Ok(Expr::Assign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        })
    }

    fn ternary(&mut self) -> ParseResult<Expr> {
        let condition = self.or()?;
        if !self.eat(&TokenKind::Question) {
            return Ok(condition);
        }
        let then_value = self.expression()?;
        self.expect(&TokenKind::Colon)?;
        let else_value = self.expression()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
        })
    }

    fn or(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let rhs = self.equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Expr>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> ParseResult<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.eat(kind) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            Self::comparison,
            &[
                (TokenKind::Equal, BinaryOp::Equal),
                (TokenKind::NotEqual, BinaryOp::NotEqual),
            ],
        )
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            Self::additive,
            &[
                (TokenKind::Less, BinaryOp::Less),
                (TokenKind::LessEqual, BinaryOp::LessEqual),
                (TokenKind::Greater, BinaryOp::Greater),
                (TokenKind::GreaterEqual, BinaryOp::GreaterEqual),
            ],
        )
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            Self::multiplicative,
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
        )
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            Self::unary,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
        )
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Typeof => UnaryOp::Typeof,
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let delta = if self.advance().kind == TokenKind::PlusPlus { 1 } else { -1 };
                let target = self.nested_unary()?;
                if !target.is_assignable() {
                    return Err(self.error_here("can't '++' or '--' an expression"));
                }
                return Ok(Expr::Increment {
                    target: Box::new(target),
                    delta,
                    prefix: true,
                });
            }
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.nested_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn nested_unary(&mut self) -> ParseResult<Expr> {
        self.nested("expression too deeply nested", Self::unary)
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek().kind {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        name,
                    };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&TokenKind::RightBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                // A call must start on the line of its callee.
                TokenKind::LeftParen if self.peek().line == self.previous_line() => {
                    self.advance();
                    let args = self.arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus
                    if self.peek().line == self.previous_line() =>
                {
                    if !expr.is_assignable() {
                        return Err(self.error_here("can't '++' or '--' an expression"));
                    }
                    let delta = if self.advance().kind == TokenKind::PlusPlus { 1 } else { -1 };
                    expr = Expr::Increment {
                        target: Box::new(expr),
                        delta,
                        prefix: false,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RightParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&TokenKind::RightParen) {
                return Ok(args);
            }
            self.expect(&TokenKind::Comma)?;
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.advance();
        let expr = match token.kind {
            TokenKind::Integer(v) => Expr::Integer(v),
            TokenKind::Float(v) => Expr::Float(v),
            TokenKind::String(s) => Expr::String(s),
            TokenKind::Null => Expr::Null,
            TokenKind::True => Expr::Bool(true),
            TokenKind::False => Expr::Bool(false),
            TokenKind::This => Expr::This,
            TokenKind::Identifier => Expr::Ident(Rc::from(token.lexeme)),
            TokenKind::ColonColon => Expr::Root(self.expect_identifier()?),
            TokenKind::LeftParen => {
                let inner = self.expression()?;
                self.expect(&TokenKind::RightParen)?;
                inner
            }
            TokenKind::LeftBrace => self.table_literal()?,
            TokenKind::Function => Expr::Function(self.function_body(Rc::from("unknown"))?),
            other => {
                return Err(CompileError::new(
                    format!("expression expected, found '{}'", other),
                    &self.source_name,
                    token.line,
                    token.column,
                ));
            }
        };
        Ok(expr)
    }

    /// The opening brace is already consumed.
    fn table_literal(&mut self) -> ParseResult<Expr> {
        let mut fields = Vec::new();
        loop {
            if self.eat(&TokenKind::RightBrace) {
                return Ok(Expr::Table(fields));
            }
            let field = match self.peek().kind.clone() {
                TokenKind::Function => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    let proto = self.function_body(name.clone())?;
                    (Expr::String(name), Expr::Function(proto))
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&TokenKind::RightBracket)?;
                    self.expect(&TokenKind::Assign)?;
                    (key, self.expression()?)
                }
                TokenKind::String(key) => {
                    self.advance();
                    self.expect(&TokenKind::Colon)?;
                    (Expr::String(key), self.expression()?)
                }
                TokenKind::Identifier => {
                    let name = self.expect_identifier()?;
                    self.expect(&TokenKind::Assign)?;
                    (Expr::String(name), self.expression()?)
                }
                _ => return Err(self.error_here("expected table slot")),
            };
            fields.push(field);
            self.eat(&TokenKind::Comma);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Rc<FunctionProto> {
        parse(source, "test").unwrap()
    }

    #[test]
    fn parses_locals_and_calls() {
        let proto = parse_ok("local a = 1, b\nprint(a + b);");
        assert_eq!(proto.body.len(), 2);
        assert!(matches!(&proto.body[0].kind, StmtKind::Local(b) if b.len() == 2));
        assert!(matches!(
            &proto.body[1].kind,
            StmtKind::Expr(Expr::Call { args, .. }) if args.len() == 1
        ));
    }

    #[test]
    fn function_declaration_becomes_new_slot() {
        let proto = parse_ok("function a.b(x, y) { return x }");
        let StmtKind::Expr(Expr::Assign { target, op, value }) = &proto.body[0].kind else {
            panic!("expected assignment");
        };
        assert_eq!(*op, AssignOp::NewSlot);
        assert!(matches!(&**target, Expr::Member { name, .. } if &**name == "b"));
        assert!(matches!(&**value, Expr::Function(p) if p.params.len() == 2));
    }

    #[test]
    fn precedence_multiplication_binds_tighter() {
        let proto = parse_ok("x = 1 + 2 * 3");
        let StmtKind::Expr(Expr::Assign { value, .. }) = &proto.body[0].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            &**value,
            Expr::Binary { op: BinaryOp::Add, rhs, .. }
                if matches!(&**rhs, Expr::Binary { op: BinaryOp::Mul, .. })
        ));
    }

    #[test]
    fn table_literal_fields() {
        let proto = parse_ok("t <- { a = 1, [2] = 3, \"c\": 4, function d() {} }");
        let StmtKind::Expr(Expr::Assign { value, .. }) = &proto.body[0].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(&**value, Expr::Table(fields) if fields.len() == 4));
    }

    #[test]
    fn statements_on_one_line_need_separator() {
        let err = parse("a = 1 b = 2", "buf").unwrap_err();
        assert_eq!(err.source_name, "buf");
        assert_eq!((err.line, err.column), (1, 7));
    }

    #[test]
    fn cannot_assign_to_call() {
        let err = parse("f() = 3", "buf").unwrap_err();
        assert_eq!(err.message, "can't assign expression");
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = parse("break", "buf").unwrap_err();
        assert_eq!(err.message, "'break' has to be in a loop block");
        let err = parse("while (1) { function f() { continue } }", "buf").unwrap_err();
        assert_eq!(err.message, "'continue' has to be in a loop block");
    }

    #[test]
    fn lexer_errors_carry_source_name() {
        let err = parse("local s = \"open", "script.nut").unwrap_err();
        assert_eq!(err.source_name, "script.nut");
        assert_eq!(err.line, 1);
    }

    #[test]
    fn try_catch_and_loops() {
        let proto = parse_ok(
            "try { throw 1 } catch (e) { print(e) }\nfor (local i = 0; i < 3; i++) { if (i) continue; else break }\nwhile (false) {}",
        );
        assert!(matches!(proto.body[0].kind, StmtKind::Try { .. }));
        assert!(matches!(proto.body[1].kind, StmtKind::For { .. }));
        assert!(matches!(proto.body[2].kind, StmtKind::While { .. }));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let depth = 100_000;
        let source = format!("local x = {}1{}", "(".repeat(depth), ")".repeat(depth));
        let err = parse(&source, "nested").unwrap_err();
        assert_eq!(err.message, "expression too deeply nested");
        assert_eq!(err.line, 1);

        let negations = format!("local x = {}1", "-".repeat(depth));
        let err = parse(&negations, "nested").unwrap_err();
        assert_eq!(err.message, "expression too deeply nested");

        let blocks = format!("{}{}", "{".repeat(depth), "}".repeat(depth));
        let err = parse(&blocks, "nested").unwrap_err();
        assert_eq!(err.message, "statement too deeply nested");
    }

    #[test]
    fn moderate_nesting_parses() {
        let source = format!("local x = {}1{}", "(".repeat(64), ")".repeat(64));
        assert!(parse(&source, "nested").is_ok());
    }
}
