//! Recursive-descent parser for the script subset
//!
//! Grammar (roughly, lowest to highest precedence):
//! assignment > equality > relational > additive > multiplicative >
//! unary > postfix (call/member/index) > primary. Statements are
//! expression statements, `return`, `throw`, and blocks. The value of a
//! program is the value of its last expression statement.

use crate::error::{VmError, VmResult};
use crate::lexer::{Token, tokenize};

/// Binary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
}

/// Unary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// Expressions
#[derive(Clone, Debug)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    New(Box<Expr>, Vec<Expr>),
    Assign(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Arrow(Vec<String>, Body),
    ObjectLit(Vec<(String, Expr)>),
    ArrayLit(Vec<Expr>),
}

/// Statements
#[derive(Clone, Debug)]
pub enum Stmt {
    Expr(Expr),
    Return(Option<Expr>),
    Throw(Expr),
}

/// An arrow-function body
#[derive(Clone, Debug)]
pub enum Body {
    /// `x => expr`
    Expr(Box<Expr>),
    /// `x => { ...stmts }`
    Block(Vec<Stmt>),
}

/// Parse a whole program
pub fn parse_program(src: &str) -> VmResult<Vec<Stmt>> {
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, pos: 0 };
    let mut stmts = Vec::new();
    while !p.at(&Token::Eof) {
        stmts.push(p.statement()?);
    }
    Ok(stmts)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn at(&self, t: &Token) -> bool {
        self.peek() == t
    }

    fn bump(&mut self) -> Token {
        let t = self.peek().clone();
        self.pos += 1;
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.at(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Token) -> VmResult<()> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(VmError::syntax_error(format!(
                "expected {:?}, found {:?}",
                t,
                self.peek()
            )))
        }
    }

    fn statement(&mut self) -> VmResult<Stmt> {
        let stmt = match self.peek() {
            Token::Return => {
                self.bump();
                if self.at(&Token::Semi) || self.at(&Token::RBrace) || self.at(&Token::Eof) {
                    Stmt::Return(None)
                } else {
                    Stmt::Return(Some(self.expression()?))
                }
            }
            Token::Throw => {
                self.bump();
                Stmt::Throw(self.expression()?)
            }
            _ => Stmt::Expr(self.expression()?),
        };
        self.eat(&Token::Semi);
        Ok(stmt)
    }

    fn expression(&mut self) -> VmResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> VmResult<Expr> {
        let lhs = self.equality()?;
        if self.eat(&Token::Assign) {
            match lhs {
                Expr::Ident(_) | Expr::Member(..) | Expr::Index(..) => {
                    let rhs = self.assignment()?;
                    Ok(Expr::Assign(Box::new(lhs), Box::new(rhs)))
                }
                _ => Err(VmError::syntax_error("invalid assignment target")),
            }
        } else {
            Ok(lhs)
        }
    }

    fn equality(&mut self) -> VmResult<Expr> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Token::EqEqEq => BinOp::StrictEq,
                Token::NotEqEq => BinOp::StrictNotEq,
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::NotEq,
                _ => break,
            };
            self.bump();
            let rhs = self.relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> VmResult<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Gt => BinOp::Gt,
                Token::Le => BinOp::Le,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> VmResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> VmResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> VmResult<Expr> {
        match self.peek() {
            Token::Bang => {
                self.bump();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.unary()?)))
            }
            Token::Minus => {
                self.bump();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.unary()?)))
            }
            Token::New => {
                self.bump();
                let callee = self.postfix_no_call()?;
                let args = if self.eat(&Token::LParen) {
                    self.arguments()?
                } else {
                    Vec::new()
                };
                let new_expr = Expr::New(Box::new(callee), args);
                self.postfix_tail(new_expr)
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> VmResult<Expr> {
        let base = self.primary()?;
        self.postfix_tail(base)
    }

    /// Postfix chain without call, for `new Foo.Bar(args)` callee parsing
    fn postfix_no_call(&mut self) -> VmResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident_name()?;
                expr = Expr::Member(Box::new(expr), name);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn postfix_tail(&mut self, mut expr: Expr) -> VmResult<Expr> {
        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident_name()?;
                expr = Expr::Member(Box::new(expr), name);
            } else if self.eat(&Token::LBracket) {
                let idx = self.expression()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(idx));
            } else if self.eat(&Token::LParen) {
                let args = self.arguments()?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> VmResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            return Ok(args);
        }
    }

    fn ident_name(&mut self) -> VmResult<String> {
        match self.bump() {
            Token::Ident(name) => Ok(name),
            other => Err(VmError::syntax_error(format!(
                "expected property name, found {other:?}"
            ))),
        }
    }

    fn primary(&mut self) -> VmResult<Expr> {
        // `ident =>` arrow shorthand
        if let Token::Ident(name) = self.peek() {
            if self.peek_at(1) == &Token::Arrow {
                let param = name.clone();
                self.bump();
                self.bump();
                let body = self.arrow_body()?;
                return Ok(Expr::Arrow(vec![param], body));
            }
        }
        // `( params ) =>` arrow
        if self.at(&Token::LParen) {
            if let Some(end) = self.arrow_params_end() {
                if self.tokens.get(end + 1) == Some(&Token::Arrow) {
                    self.bump(); // (
                    let mut params = Vec::new();
                    while !self.eat(&Token::RParen) {
                        match self.bump() {
                            Token::Ident(name) => params.push(name),
                            other => {
                                return Err(VmError::syntax_error(format!(
                                    "expected parameter name, found {other:?}"
                                )));
                            }
                        }
                        self.eat(&Token::Comma);
                    }
                    self.expect(&Token::Arrow)?;
                    let body = self.arrow_body()?;
                    return Ok(Expr::Arrow(params, body));
                }
            }
        }

        match self.bump() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::Undefined => Ok(Expr::Undefined),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBrace => self.object_literal(),
            Token::LBracket => {
                let mut items = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::ArrayLit(items));
                }
                loop {
                    items.push(self.expression()?);
                    if self.eat(&Token::Comma) {
                        if self.eat(&Token::RBracket) {
                            return Ok(Expr::ArrayLit(items));
                        }
                        continue;
                    }
                    self.expect(&Token::RBracket)?;
                    return Ok(Expr::ArrayLit(items));
                }
            }
            other => Err(VmError::syntax_error(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }

    /// If the tokens from `pos` form `( ident, ident, ... )`, return the
    /// index of the closing paren.
    fn arrow_params_end(&self) -> Option<usize> {
        let mut i = self.pos + 1;
        loop {
            match self.tokens.get(i)? {
                Token::RParen => return Some(i),
                Token::Ident(_) => {
                    i += 1;
                    match self.tokens.get(i)? {
                        Token::Comma => i += 1,
                        Token::RParen => return Some(i),
                        _ => return None,
                    }
                }
                _ => return None,
            }
        }
    }

    fn arrow_body(&mut self) -> VmResult<Body> {
        if self.eat(&Token::LBrace) {
            let mut stmts = Vec::new();
            while !self.eat(&Token::RBrace) {
                if self.at(&Token::Eof) {
                    return Err(VmError::syntax_error("unterminated block"));
                }
                stmts.push(self.statement()?);
            }
            Ok(Body::Block(stmts))
        } else {
            Ok(Body::Expr(Box::new(self.assignment()?)))
        }
    }

    fn object_literal(&mut self) -> VmResult<Expr> {
        let mut entries = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::ObjectLit(entries));
        }
        loop {
            let key = match self.bump() {
                Token::Ident(name) => name,
                Token::Str(s) => s,
                Token::Number(n) => crate::value::format_number(n),
                other => {
                    return Err(VmError::syntax_error(format!(
                        "expected object key, found {other:?}"
                    )));
                }
            };
            self.expect(&Token::Colon)?;
            let value = self.expression()?;
            entries.push((key, value));
            if self.eat(&Token::Comma) {
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::ObjectLit(entries));
                }
                continue;
            }
            self.expect(&Token::RBrace)?;
            return Ok(Expr::ObjectLit(entries));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_member_call() {
        let prog = parse_program("obj.b(1.1)").unwrap();
        assert_eq!(prog.len(), 1);
        match &prog[0] {
            Stmt::Expr(Expr::Call(callee, args)) => {
                assert!(matches!(**callee, Expr::Member(..)));
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_arrow() {
        let prog = parse_program("x => x + 1").unwrap();
        match &prog[0] {
            Stmt::Expr(Expr::Arrow(params, Body::Expr(_))) => {
                assert_eq!(params, &vec!["x".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_multi_param_arrow_block() {
        let prog = parse_program("(a, b) => { return a + b; }").unwrap();
        match &prog[0] {
            Stmt::Expr(Expr::Arrow(params, Body::Block(stmts))) => {
                assert_eq!(params.len(), 2);
                assert_eq!(stmts.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_new() {
        let prog = parse_program("new Cls(100)").unwrap();
        assert!(matches!(&prog[0], Stmt::Expr(Expr::New(..))));
    }

    #[test]
    fn test_parse_object_literal() {
        let prog = parse_program("({ a: 1, b: x => x })").unwrap();
        match &prog[0] {
            Stmt::Expr(Expr::ObjectLit(entries)) => assert_eq!(entries.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_assignment_chain() {
        let prog = parse_program("globalThis.x = obj.a = 2").unwrap();
        assert!(matches!(&prog[0], Stmt::Expr(Expr::Assign(..))));
    }

    #[test]
    fn test_reject_bad_assignment_target() {
        assert!(parse_program("1 = 2").is_err());
    }
}
