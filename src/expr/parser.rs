//! Recursive-descent parser for the arithmetic expression language.
//!
//! Grammar, bottom-up by precedence:
//!
//! ```text
//! list   = expr ("," expr)*
//! expr   = term (("+"|"-") term)*
//! term   = factor (("*"|"/"|"%") factor)*
//! factor = power ("^" power)*            // left-associative
//! power  = ("+"|"-")* base
//! base   = NUMBER | ident | ident "(" ")" | ident power
//!        | ident "(" expr ("," expr)* ")" | "(" list ")"
//! ```
//!
//! `**` is an alias for `^`. Identifier lookup order: bound variables,
//! builtins, user-defined functions. Errors carry a 1-based byte offset of
//! the cursor at the point of failure.

use super::ast::{find_builtin, ExprNode, FuncKind, UdfRegistry};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Tok {
    Num(f64),
    Var(usize),
    /// A function with a fixed arity: builtin or user-defined.
    Fun(FuncKind, usize),
    Infix(FuncKind),
    Open,
    Close,
    Sep,
    End,
}

struct Parser<'s> {
    src: &'s [u8],
    pos: usize,
    tok: Tok,
    vars: &'s [String],
    udfs: &'s UdfRegistry,
}

pub(crate) fn parse(src: &str, vars: &[String], udfs: &UdfRegistry) -> Result<ExprNode> {
    let mut p = Parser {
        src: src.as_bytes(),
        pos: 0,
        tok: Tok::End,
        vars,
        udfs,
    };
    p.next_token()?;
    let root = p.list()?;
    if p.tok != Tok::End {
        return Err(p.err("trailing input"));
    }
    Ok(root)
}

impl<'s> Parser<'s> {
    fn offset(&self) -> usize {
        self.pos.max(1)
    }

    fn err<S: Into<String>>(&self, reason: S) -> Error {
        Error::Parse {
            offset: self.offset(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn next_token(&mut self) -> Result<()> {
        loop {
            let Some(c) = self.peek() else {
                self.tok = Tok::End;
                return Ok(());
            };
            match c {
                b' ' | b'\t' | b'\n' | b'\r' => {
                    self.pos += 1;
                }
                b'0'..=b'9' | b'.' => {
                    self.tok = Tok::Num(self.lex_number()?);
                    return Ok(());
                }
                b'a'..=b'z' => {
                    self.tok = self.lex_identifier()?;
                    return Ok(());
                }
                _ => {
                    self.pos += 1;
                    self.tok = match c {
                        b'+' => Tok::Infix(FuncKind::Add),
                        b'-' => Tok::Infix(FuncKind::Sub),
                        b'*' => {
                            if self.peek() == Some(b'*') {
                                // pow can also be spelled '**'
                                self.pos += 1;
                                Tok::Infix(FuncKind::Pow)
                            } else {
                                Tok::Infix(FuncKind::Mul)
                            }
                        }
                        b'/' => Tok::Infix(FuncKind::Div),
                        b'%' => Tok::Infix(FuncKind::Mod),
                        b'^' => Tok::Infix(FuncKind::Pow),
                        b'(' => Tok::Open,
                        b')' => Tok::Close,
                        b',' => Tok::Sep,
                        other => {
                            return Err(self.err(format!(
                                "unexpected character `{}`",
                                other as char
                            )))
                        }
                    };
                    return Ok(());
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<f64> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mark = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            if matches!(self.peek(), Some(b'0'..=b'9')) {
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos += 1;
                }
            } else {
                // not an exponent after all
                self.pos = mark;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("ascii digits");
        text.parse::<f64>()
            .map_err(|_| self.err(format!("malformed number `{text}`")))
    }

    fn lex_identifier(&mut self) -> Result<Tok> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'a'..=b'z') | Some(b'0'..=b'9') | Some(b'_')) {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.src[start..self.pos]).expect("ascii identifier");
        if let Some(idx) = self.vars.iter().position(|v| v == name) {
            return Ok(Tok::Var(idx));
        }
        if let Some(builtin) = find_builtin(name) {
            return Ok(Tok::Fun(builtin.kind, builtin.arity));
        }
        if let Some(id) = self.udfs.lookup(name) {
            let arity = self.udfs.get(id).expect("registered udf").arity;
            return Ok(Tok::Fun(FuncKind::Custom(id), arity));
        }
        Err(self.err(format!("unknown identifier `{name}`")))
    }

    fn list(&mut self) -> Result<ExprNode> {
        let mut ret = self.expr()?;
        while self.tok == Tok::Sep {
            self.next_token()?;
            ret = ExprNode::func(FuncKind::Comma, vec![ret, self.expr()?]);
        }
        Ok(ret)
    }

    fn expr(&mut self) -> Result<ExprNode> {
        let mut ret = self.term()?;
        while let Tok::Infix(op @ (FuncKind::Add | FuncKind::Sub)) = self.tok {
            self.next_token()?;
            ret = ExprNode::func(op, vec![ret, self.term()?]);
        }
        Ok(ret)
    }

    fn term(&mut self) -> Result<ExprNode> {
        let mut ret = self.factor()?;
        while let Tok::Infix(op @ (FuncKind::Mul | FuncKind::Div | FuncKind::Mod)) = self.tok {
            self.next_token()?;
            ret = ExprNode::func(op, vec![ret, self.factor()?]);
        }
        Ok(ret)
    }

    fn factor(&mut self) -> Result<ExprNode> {
        let mut ret = self.power()?;
        while self.tok == Tok::Infix(FuncKind::Pow) {
            self.next_token()?;
            ret = ExprNode::func(FuncKind::Pow, vec![ret, self.power()?]);
        }
        Ok(ret)
    }

    fn power(&mut self) -> Result<ExprNode> {
        let mut sign = 1;
        while let Tok::Infix(op @ (FuncKind::Add | FuncKind::Sub)) = self.tok {
            if op == FuncKind::Sub {
                sign = -sign;
            }
            self.next_token()?;
        }
        let base = self.base()?;
        if sign < 0 {
            Ok(ExprNode::func(FuncKind::Neg, vec![base]))
        } else {
            Ok(base)
        }
    }

    fn base(&mut self) -> Result<ExprNode> {
        match self.tok {
            Tok::Num(v) => {
                self.next_token()?;
                Ok(ExprNode::Const(v))
            }
            Tok::Var(idx) => {
                self.next_token()?;
                Ok(ExprNode::Var(idx))
            }
            Tok::Fun(kind, 0) => {
                self.next_token()?;
                // parentheses are optional on 0-arity calls
                if self.tok == Tok::Open {
                    self.next_token()?;
                    if self.tok != Tok::Close {
                        return Err(self.err("expected `)`"));
                    }
                    self.next_token()?;
                }
                Ok(ExprNode::func(kind, vec![]))
            }
            Tok::Fun(kind, 1) => {
                self.next_token()?;
                let arg = self.power()?;
                Ok(ExprNode::func(kind, vec![arg]))
            }
            Tok::Fun(kind, arity) => {
                self.next_token()?;
                if self.tok != Tok::Open {
                    return Err(self.err("expected `(` after function name"));
                }
                let mut args = Vec::with_capacity(arity);
                for i in 0..arity {
                    self.next_token()?;
                    args.push(self.expr()?);
                    if self.tok != Tok::Sep {
                        if i != arity - 1 {
                            return Err(self.err("too few arguments"));
                        }
                        break;
                    }
                }
                if self.tok != Tok::Close {
                    return Err(self.err("wrong number of arguments"));
                }
                self.next_token()?;
                Ok(ExprNode::func(kind, args))
            }
            Tok::Open => {
                self.next_token()?;
                let inner = self.list()?;
                if self.tok != Tok::Close {
                    return Err(self.err("expected `)`"));
                }
                self.next_token()?;
                Ok(inner)
            }
            _ => Err(self.err("expected a value")),
        }
    }
}
