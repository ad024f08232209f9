//! Lexer and parser for the JavaScript expression subset embedded in
//! templates.
//!
//! This is not a JS engine front end; it accepts exactly the
//! expression and statement forms the transpiler can lower. Two entry
//! points mirror the two template contexts: [`parse_expression`]
//! treats `{ ... }` as an object literal (value position),
//! [`parse_statements`] treats it as a block (code position).

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    LogAnd,
    LogOr,
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    BitNot,
    Neg,
    Pos,
    Inc,
    Dec,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Regex { pattern: String, flags: String },
    Dot { left: Box<Expr>, name: String },
    Index { left: Box<Expr>, member: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    New { callee: Box<Expr>, args: Vec<Expr> },
    Unary { op: UnOp, operand: Box<Expr>, postfix: bool },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Cond { test: Box<Expr>, cons: Box<Expr>, alt: Box<Expr> },
    // `op` is None for plain `=`, the compound operator otherwise
    Assign { op: Option<BinOp>, left: Box<Expr>, right: Box<Expr> },
    VarDecl { name: String, init: Option<Box<Expr>> },
    Seq(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Var(Vec<Expr>),
    Return(Option<Expr>),
    If { test: Expr, cons: Box<Stmt>, alt: Option<Box<Stmt>> },
    Block(Vec<Stmt>),
    ForIn { into: Expr, source: Expr, body: Box<Stmt> },
    Try { body: Box<Stmt>, param: String, catch: Box<Stmt> },
    Throw(Expr),
    Empty,
}

/// Parse a value expression; the whole input must be consumed.
pub fn parse_expression(src: &str) -> Result<Expr, ParseError> {
    let mut p = Parser::new(src);
    p.advance(true)?;
    let expr = p.expression()?;
    p.expect_eof()?;
    Ok(expr)
}

/// Parse a statement list (raw code blocks).
pub fn parse_statements(src: &str) -> Result<Vec<Stmt>, ParseError> {
    let mut p = Parser::new(src);
    p.advance(true)?;
    let mut stmts = Vec::new();
    while p.tok != Tok::Eof {
        stmts.push(p.statement()?);
    }
    Ok(stmts)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    Str(String),
    Regex { pattern: String, flags: String },
    Punct(&'static str),
    Eof,
}

impl Tok {
    fn is(&self, p: &str) -> bool {
        matches!(self, Tok::Punct(s) if *s == p)
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Tok::Ident(s) if s == kw)
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    tok: Tok,
}

const PUNCTS: &[&str] = &[
    ">>>=", "===", "!==", ">>>", "<<=", ">>=", "&&", "||", "==", "!=", "<=", ">=",
    "++", "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "<<", ">>", "+",
    "-", "*", "/", "%", "&", "|", "^", "~", "!", "<", ">", "=", "(", ")", "[",
    "]", "{", "}", ",", ";", ":", "?", ".",
];

impl Parser {
    fn new(src: &str) -> Self {
        Parser {
            chars: src.chars().collect(),
            pos: 0,
            tok: Tok::Eof,
        }
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message)
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '/' && self.chars.get(self.pos + 1) == Some(&'/') {
                while let Some(c) = self.peek_char() {
                    self.pos += 1;
                    if c == '\n' {
                        break;
                    }
                }
            } else if c == '/' && self.chars.get(self.pos + 1) == Some(&'*') {
                self.pos += 2;
                while self.pos < self.chars.len() {
                    if self.peek_char() == Some('*')
                        && self.chars.get(self.pos + 1) == Some(&'/')
                    {
                        self.pos += 2;
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    /// Read the next token. `regex_ok` tells the lexer whether a `/`
    /// may start a regex literal (value position) or must be the
    /// division operator.
    fn advance(&mut self, regex_ok: bool) -> Result<(), ParseError> {
        self.skip_ws();
        let Some(c) = self.peek_char() else {
            self.tok = Tok::Eof;
            return Ok(());
        };

        if c == '/' && regex_ok && !self.chars.get(self.pos + 1).map_or(false, |&n| n == '/' || n == '*') {
            self.tok = self.lex_regex()?;
            return Ok(());
        }
        if c.is_ascii_digit() || (c == '.' && self.chars.get(self.pos + 1).map_or(false, |n| n.is_ascii_digit())) {
            self.tok = self.lex_number()?;
            return Ok(());
        }
        if c == '"' || c == '\'' || c == '`' {
            self.tok = self.lex_string(c)?;
            return Ok(());
        }
        if c == '_' || c == '$' || c.is_alphabetic() {
            let start = self.pos;
            while let Some(c) = self.peek_char() {
                if c == '_' || c == '$' || c.is_alphanumeric() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            self.tok = Tok::Ident(self.chars[start..self.pos].iter().collect());
            return Ok(());
        }
        for p in PUNCTS {
            if self.chars[self.pos..]
                .iter()
                .take(p.len())
                .collect::<String>()
                == **p
            {
                self.pos += p.len();
                self.tok = Tok::Punct(p);
                return Ok(());
            }
        }
        Err(self.err(format!("unexpected character {c:?}")))
    }

    fn lex_number(&mut self) -> Result<Tok, ParseError> {
        let start = self.pos;
        if self.peek_char() == Some('0')
            && matches!(self.chars.get(self.pos + 1), Some('x' | 'X'))
        {
            self.pos += 2;
            let hex_start = self.pos;
            while self.peek_char().map_or(false, |c| c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let digits: String = self.chars[hex_start..self.pos].iter().collect();
            let n = u64::from_str_radix(&digits, 16)
                .map_err(|_| self.err("invalid hex literal"))?;
            return Ok(Tok::Num(n as f64));
        }
        while self
            .peek_char()
            .map_or(false, |c| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E')
        {
            if matches!(self.peek_char(), Some('e' | 'E'))
                && matches!(self.chars.get(self.pos + 1), Some('+' | '-'))
            {
                self.pos += 1;
            }
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Tok::Num)
            .map_err(|_| self.err(format!("invalid number literal {text:?}")))
    }

    fn lex_string(&mut self, quote: char) -> Result<Tok, ParseError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek_char() else {
                return Err(self.err("unterminated string literal"));
            };
            self.pos += 1;
            if c == quote {
                return Ok(Tok::Str(out));
            }
            if c == '\\' {
                let Some(e) = self.peek_char() else {
                    return Err(self.err("unterminated string literal"));
                };
                self.pos += 1;
                match e {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    other => out.push(other),
                }
            } else {
                out.push(c);
            }
        }
    }

    fn lex_regex(&mut self) -> Result<Tok, ParseError> {
        self.pos += 1;
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            let Some(c) = self.peek_char() else {
                return Err(self.err("unterminated regex literal"));
            };
            self.pos += 1;
            match c {
                '\\' => {
                    pattern.push('\\');
                    if let Some(e) = self.peek_char() {
                        pattern.push(e);
                        self.pos += 1;
                    }
                }
                '[' => {
                    in_class = true;
                    pattern.push(c);
                }
                ']' => {
                    in_class = false;
                    pattern.push(c);
                }
                '/' if !in_class => break,
                c => pattern.push(c),
            }
        }
        let mut flags = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_alphabetic() {
                flags.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(Tok::Regex { pattern, flags })
    }

    fn expect_eof(&mut self) -> Result<(), ParseError> {
        // trailing semicolons are harmless
        while self.tok.is(";") {
            self.advance(true)?;
        }
        if self.tok != Tok::Eof {
            return Err(self.err(format!("unexpected trailing input at {:?}", self.tok)));
        }
        Ok(())
    }

    fn eat(&mut self, p: &str, regex_ok: bool) -> Result<bool, ParseError> {
        if self.tok.is(p) {
            self.advance(regex_ok)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn expect(&mut self, p: &str, regex_ok: bool) -> Result<(), ParseError> {
        if !self.eat(p, regex_ok)? {
            return Err(self.err(format!("expected {p:?}, found {:?}", self.tok)));
        }
        Ok(())
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match std::mem::replace(&mut self.tok, Tok::Eof) {
            Tok::Ident(name) => {
                self.advance(false)?;
                Ok(name)
            }
            other => {
                self.tok = other;
                Err(self.err(format!("expected identifier, found {:?}", self.tok)))
            }
        }
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        if self.tok.is(";") {
            self.advance(true)?;
            return Ok(Stmt::Empty);
        }
        if self.tok.is("{") {
            self.advance(true)?;
            let mut list = Vec::new();
            while !self.tok.is("}") {
                if self.tok == Tok::Eof {
                    return Err(self.err("unterminated block"));
                }
                list.push(self.statement()?);
            }
            self.advance(false)?;
            return Ok(Stmt::Block(list));
        }
        if self.tok.is_kw("var") || self.tok.is_kw("let") || self.tok.is_kw("const") {
            self.advance(true)?;
            let mut decls = Vec::new();
            loop {
                let name = self.ident()?;
                let init = if self.eat("=", true)? {
                    Some(Box::new(self.assignment()?))
                } else {
                    None
                };
                decls.push(Expr::VarDecl { name, init });
                if !self.eat(",", true)? {
                    break;
                }
            }
            self.eat(";", true)?;
            return Ok(Stmt::Var(decls));
        }
        if self.tok.is_kw("return") {
            self.advance(true)?;
            if self.tok == Tok::Eof || self.tok.is(";") {
                self.eat(";", true)?;
                return Ok(Stmt::Return(None));
            }
            let e = self.expression()?;
            self.eat(";", true)?;
            return Ok(Stmt::Return(Some(e)));
        }
        if self.tok.is_kw("if") {
            self.advance(false)?;
            self.expect("(", true)?;
            let test = self.expression()?;
            self.expect(")", false)?;
            let cons = Box::new(self.statement()?);
            let alt = if self.tok.is_kw("else") {
                self.advance(true)?;
                Some(Box::new(self.statement()?))
            } else {
                None
            };
            return Ok(Stmt::If { test, cons, alt });
        }
        if self.tok.is_kw("for") {
            self.advance(false)?;
            self.expect("(", true)?;
            let into = if self.tok.is_kw("var") || self.tok.is_kw("let") {
                self.advance(true)?;
                Expr::Ident(self.ident()?)
            } else {
                Expr::Ident(self.ident()?)
            };
            if !self.tok.is_kw("in") {
                return Err(self.err("only for..in loops are supported"));
            }
            self.advance(true)?;
            let source = self.expression()?;
            self.expect(")", false)?;
            let body = Box::new(self.statement()?);
            return Ok(Stmt::ForIn { into, source, body });
        }
        if self.tok.is_kw("try") {
            self.advance(false)?;
            let body = Box::new(self.statement()?);
            if !self.tok.is_kw("catch") {
                return Err(self.err("try requires a catch clause"));
            }
            self.advance(false)?;
            self.expect("(", false)?;
            let param = self.ident()?;
            self.expect(")", false)?;
            let catch = Box::new(self.statement()?);
            return Ok(Stmt::Try { body, param, catch });
        }
        if self.tok.is_kw("throw") {
            self.advance(true)?;
            let e = self.expression()?;
            self.eat(";", true)?;
            return Ok(Stmt::Throw(e));
        }
        let e = self.expression()?;
        self.eat(";", true)?;
        Ok(Stmt::Expr(e))
    }

    // ---- expressions, precedence climbing ----

    fn expression(&mut self) -> Result<Expr, ParseError> {
        let first = self.assignment()?;
        if !self.tok.is(",") {
            return Ok(first);
        }
        let mut seq = vec![first];
        while self.eat(",", true)? {
            seq.push(self.assignment()?);
        }
        Ok(Expr::Seq(seq))
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        let left = self.conditional()?;
        let op = match &self.tok {
            Tok::Punct("=") => None,
            Tok::Punct("+=") => Some(BinOp::Add),
            Tok::Punct("-=") => Some(BinOp::Sub),
            Tok::Punct("*=") => Some(BinOp::Mul),
            Tok::Punct("/=") => Some(BinOp::Div),
            Tok::Punct("%=") => Some(BinOp::Rem),
            Tok::Punct("&=") => Some(BinOp::BitAnd),
            Tok::Punct("|=") => Some(BinOp::BitOr),
            Tok::Punct("^=") => Some(BinOp::BitXor),
            Tok::Punct("<<=") => Some(BinOp::Shl),
            Tok::Punct(">>=") => Some(BinOp::Shr),
            Tok::Punct(">>>=") => Some(BinOp::UShr),
            _ => return Ok(left),
        };
        if !matches!(
            left,
            Expr::Ident(_) | Expr::Dot { .. } | Expr::Index { .. }
        ) {
            return Err(self.err("invalid assignment target"));
        }
        self.advance(true)?;
        let right = self.assignment()?;
        Ok(Expr::Assign {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        let test = self.binary(0)?;
        if !self.eat("?", true)? {
            return Ok(test);
        }
        let cons = self.assignment()?;
        self.expect(":", true)?;
        let alt = self.assignment()?;
        Ok(Expr::Cond {
            test: Box::new(test),
            cons: Box::new(cons),
            alt: Box::new(alt),
        })
    }

    fn binop_for(&self) -> Option<(BinOp, u8)> {
        let (op, prec) = match &self.tok {
            Tok::Punct("||") => (BinOp::LogOr, 1),
            Tok::Punct("&&") => (BinOp::LogAnd, 2),
            Tok::Punct("|") => (BinOp::BitOr, 3),
            Tok::Punct("^") => (BinOp::BitXor, 4),
            Tok::Punct("&") => (BinOp::BitAnd, 5),
            Tok::Punct("==") | Tok::Punct("===") => (BinOp::Eq, 6),
            Tok::Punct("!=") | Tok::Punct("!==") => (BinOp::Neq, 6),
            Tok::Punct("<") => (BinOp::Lt, 7),
            Tok::Punct(">") => (BinOp::Gt, 7),
            Tok::Punct("<=") => (BinOp::Lte, 7),
            Tok::Punct(">=") => (BinOp::Gte, 7),
            Tok::Punct("<<") => (BinOp::Shl, 8),
            Tok::Punct(">>") => (BinOp::Shr, 8),
            Tok::Punct(">>>") => (BinOp::UShr, 8),
            Tok::Punct("+") => (BinOp::Add, 9),
            Tok::Punct("-") => (BinOp::Sub, 9),
            Tok::Punct("*") => (BinOp::Mul, 10),
            Tok::Punct("/") => (BinOp::Div, 10),
            Tok::Punct("%") => (BinOp::Rem, 10),
            _ => return None,
        };
        Some((op, prec))
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        while let Some((op, prec)) = self.binop_for() {
            if prec < min_prec {
                break;
            }
            self.advance(true)?;
            let right = self.binary(prec + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match &self.tok {
            Tok::Punct("!") => Some(UnOp::Not),
            Tok::Punct("~") => Some(UnOp::BitNot),
            Tok::Punct("-") => Some(UnOp::Neg),
            Tok::Punct("+") => Some(UnOp::Pos),
            Tok::Punct("++") => Some(UnOp::Inc),
            Tok::Punct("--") => Some(UnOp::Dec),
            Tok::Ident(s) if s == "delete" => Some(UnOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.advance(true)?;
            let operand = self.unary()?;
            // fold numeric negation into the literal
            if op == UnOp::Neg {
                if let Expr::Num(n) = operand {
                    return Ok(Expr::Num(-n));
                }
            }
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                postfix: false,
            });
        }
        let expr = self.postfix()?;
        match &self.tok {
            Tok::Punct("++") => {
                self.advance(false)?;
                Ok(Expr::Unary {
                    op: UnOp::Inc,
                    operand: Box::new(expr),
                    postfix: true,
                })
            }
            Tok::Punct("--") => {
                self.advance(false)?;
                Ok(Expr::Unary {
                    op: UnOp::Dec,
                    operand: Box::new(expr),
                    postfix: true,
                })
            }
            _ => Ok(expr),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.tok.is(".") {
                self.advance(false)?;
                let name = self.ident()?;
                expr = Expr::Dot {
                    left: Box::new(expr),
                    name,
                };
            } else if self.tok.is("[") {
                self.advance(true)?;
                let member = self.expression()?;
                self.expect("]", false)?;
                expr = Expr::Index {
                    left: Box::new(expr),
                    member: Box::new(member),
                };
            } else if self.tok.is("(") {
                self.advance(true)?;
                let args = self.arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(")", false)? {
            return Ok(args);
        }
        loop {
            args.push(self.assignment()?);
            if !self.eat(",", true)? {
                break;
            }
        }
        self.expect(")", false)?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match std::mem::replace(&mut self.tok, Tok::Eof) {
            Tok::Num(n) => {
                self.advance(false)?;
                Ok(Expr::Num(n))
            }
            Tok::Str(s) => {
                self.advance(false)?;
                Ok(Expr::Str(s))
            }
            Tok::Regex { pattern, flags } => {
                self.advance(false)?;
                Ok(Expr::Regex { pattern, flags })
            }
            Tok::Ident(name) => match name.as_str() {
                "true" => {
                    self.advance(false)?;
                    Ok(Expr::Bool(true))
                }
                "false" => {
                    self.advance(false)?;
                    Ok(Expr::Bool(false))
                }
                "null" | "undefined" => {
                    self.advance(false)?;
                    Ok(Expr::Null)
                }
                "new" => {
                    self.advance(true)?;
                    let callee = self.postfix()?;
                    match callee {
                        Expr::Call { callee, args } => Ok(Expr::New { callee, args }),
                        other => Ok(Expr::New {
                            callee: Box::new(other),
                            args: Vec::new(),
                        }),
                    }
                }
                "var" => {
                    // single inline declaration in expression position
                    self.advance(false)?;
                    let name = self.ident()?;
                    let init = if self.eat("=", true)? {
                        Some(Box::new(self.assignment()?))
                    } else {
                        None
                    };
                    Ok(Expr::VarDecl { name, init })
                }
                _ => {
                    self.advance(false)?;
                    Ok(Expr::Ident(name))
                }
            },
            tok @ Tok::Punct("(") => {
                self.tok = tok;
                self.advance(true)?;
                let e = self.expression()?;
                self.expect(")", false)?;
                Ok(e)
            }
            tok @ Tok::Punct("[") => {
                self.tok = tok;
                self.advance(true)?;
                let mut items = Vec::new();
                if !self.tok.is("]") {
                    loop {
                        if self.tok.is(",") {
                            // elision
                            items.push(Expr::Null);
                            self.advance(true)?;
                            continue;
                        }
                        items.push(self.assignment()?);
                        if !self.eat(",", true)? {
                            break;
                        }
                        if self.tok.is("]") {
                            break;
                        }
                    }
                }
                self.expect("]", false)?;
                Ok(Expr::Array(items))
            }
            tok @ Tok::Punct("{") => {
                self.tok = tok;
                self.advance(true)?;
                let mut props = Vec::new();
                if !self.tok.is("}") {
                    loop {
                        let key = match std::mem::replace(&mut self.tok, Tok::Eof) {
                            Tok::Ident(name) => name,
                            Tok::Str(s) => s,
                            Tok::Num(n) => crate::value::format_f64(n),
                            other => {
                                self.tok = other;
                                return Err(
                                    self.err(format!("bad object key {:?}", self.tok))
                                );
                            }
                        };
                        self.advance(false)?;
                        self.expect(":", true)?;
                        let value = self.assignment()?;
                        props.push((key, value));
                        if !self.eat(",", true)? {
                            break;
                        }
                        if self.tok.is("}") {
                            break;
                        }
                    }
                }
                self.expect("}", false)?;
                Ok(Expr::Object(props))
            }
            other => {
                let msg = format!("unexpected token {other:?}");
                self.tok = other;
                Err(self.err(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn literals() {
        assert_eq!(parse_expression("42").expect("parse"), Expr::Num(42.0));
        assert_eq!(parse_expression("0x10").expect("parse"), Expr::Num(16.0));
        assert_eq!(
            parse_expression("'hi'").expect("parse"),
            Expr::Str("hi".to_string())
        );
        assert_eq!(parse_expression("true").expect("parse"), Expr::Bool(true));
        assert_eq!(parse_expression("null").expect("parse"), Expr::Null);
    }

    #[test]
    fn object_literal_in_value_position() {
        let e = parse_expression("{a: 1, \"b\": 2}").expect("parse");
        assert_eq!(
            e,
            Expr::Object(vec![
                ("a".to_string(), Expr::Num(1.0)),
                ("b".to_string(), Expr::Num(2.0)),
            ])
        );
    }

    #[test]
    fn block_in_statement_position() {
        let stmts = parse_statements("{ var a = 1; }").expect("parse");
        assert_eq!(stmts.len(), 1);
        assert!(matches!(&stmts[0], Stmt::Block(inner) if inner.len() == 1));
    }

    #[test]
    fn precedence() {
        let e = parse_expression("1 + 2 * 3").expect("parse");
        let Expr::Binary { op: BinOp::Add, right, .. } = e else {
            panic!("expected add at the top");
        };
        assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn member_call_chain() {
        let e = parse_expression("items.slice(1).join(', ')").expect("parse");
        let Expr::Call { callee, args } = e else { panic!("expected call") };
        assert_eq!(args, vec![Expr::Str(", ".to_string())]);
        assert!(matches!(*callee, Expr::Dot { name, .. } if name == "join"));
    }

    #[test]
    fn ternary_and_logical() {
        let e = parse_expression("a && b ? c : d").expect("parse");
        assert!(matches!(e, Expr::Cond { .. }));
    }

    #[test]
    fn regex_literal_only_in_value_position() {
        let e = parse_expression("/a+/i").expect("parse");
        assert_eq!(
            e,
            Expr::Regex {
                pattern: "a+".to_string(),
                flags: "i".to_string()
            }
        );
        let e = parse_expression("a / b / c").expect("parse");
        assert!(matches!(e, Expr::Binary { op: BinOp::Div, .. }));
    }

    #[test]
    fn for_in_and_try() {
        let stmts =
            parse_statements("for (var k in obj) { total += obj[k] }").expect("parse");
        assert!(matches!(&stmts[0], Stmt::ForIn { .. }));
        let stmts =
            parse_statements("try { risky() } catch (e) { handle(e) }").expect("parse");
        let Stmt::Try { param, .. } = &stmts[0] else { panic!("expected try") };
        assert_eq!(param, "e");
    }

    #[test]
    fn assignment_forms() {
        let e = parse_expression("a = 1").expect("parse");
        assert!(matches!(e, Expr::Assign { op: None, .. }));
        let e = parse_expression("a += 1").expect("parse");
        assert!(matches!(e, Expr::Assign { op: Some(BinOp::Add), .. }));
        let e = parse_expression("m['k'] = v").expect("parse");
        let Expr::Assign { left, .. } = e else { panic!("expected assign") };
        assert!(matches!(*left, Expr::Index { .. }));
    }

    #[test]
    fn postfix_increment() {
        let e = parse_expression("i++").expect("parse");
        assert!(matches!(
            e,
            Expr::Unary { op: UnOp::Inc, postfix: true, .. }
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_expression("1 +").is_err());
        assert!(parse_expression("foo(").is_err());
        assert!(parse_statements("for (a of b) {}").is_err());
    }
}
