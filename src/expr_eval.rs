//! Breakpoint condition expressions.
//!
//! A small integer expression language evaluated when a breakpoint is hit:
//! `rax == 0x10 && *(rsp + 8) != 0`. Values are 64-bit words with wrapping
//! arithmetic and unsigned comparisons; identifiers name registers and
//! `*expr` reads the word at an address. A non-zero result is true.
//!
//! Precedence, lowest first: `||`, `&&`, comparisons, `+ -`, `* / %`,
//! unary `! - *`.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    IntLit(u64),
    Register(String),
    /// Word at the address the operand evaluates to.
    Deref(Box<Expr>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// Target state a condition is evaluated against.
pub trait EvalContext {
    fn register(&self, name: &str) -> Result<u64>;
    fn read_word(&self, addr: u64) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(u64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    LParen,
    RParen,
    Eof,
}

fn syntax(message: String) -> Error {
    Error::InvalidRequest(format!("condition: {}", message))
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Lexer {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump_if(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        while self.peek_char().map_or(false, char::is_whitespace) {
            self.pos += 1;
        }
        let Some(ch) = self.peek_char() else {
            return Ok(Token::Eof);
        };
        if ch.is_ascii_digit() {
            return self.lex_number();
        }
        if ch.is_ascii_alphabetic() || ch == '_' || ch == '$' {
            return Ok(self.lex_ident());
        }
        self.pos += 1;
        let tok = match ch {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '!' if self.bump_if('=') => Token::NotEq,
            '!' => Token::Bang,
            '=' if self.bump_if('=') => Token::EqEq,
            '<' if self.bump_if('=') => Token::Le,
            '<' => Token::Lt,
            '>' if self.bump_if('=') => Token::Ge,
            '>' => Token::Gt,
            '&' if self.bump_if('&') => Token::AndAnd,
            '|' if self.bump_if('|') => Token::OrOr,
            other => return Err(syntax(format!("unexpected character '{}'", other))),
        };
        Ok(tok)
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.pos;
        while self.peek_char().map_or(false, |c| c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => text.parse(),
        };
        value
            .map(Token::Int)
            .map_err(|_| syntax(format!("invalid number '{}'", text)))
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek_char()
            .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        Token::Ident(text.trim_start_matches('$').to_string())
    }
}

/// Recursive descent parser.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self> {
        let mut lexer = Lexer::new(input);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let is_eof = tok == Token::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(Parser { tokens, pos: 0 })
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        tok
    }

    /// One left-associative precedence level.
    fn binary_level(
        &mut self,
        ops: &[(Token, BinOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut lhs = next(self)?;
        while let Some(op) = ops.iter().find(|(t, _)| t == self.peek()).map(|(_, op)| *op) {
            self.advance();
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.binary_level(&[(Token::OrOr, BinOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.binary_level(&[(Token::AndAnd, BinOp::And)], Self::parse_comparison)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                (Token::EqEq, BinOp::Eq),
                (Token::NotEq, BinOp::Ne),
                (Token::Lt, BinOp::Lt),
                (Token::Le, BinOp::Le),
                (Token::Gt, BinOp::Gt),
                (Token::Ge, BinOp::Ge),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.binary_level(
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                (Token::Star, BinOp::Mul),
                (Token::Slash, BinOp::Div),
                (Token::Percent, BinOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let wrap: fn(Box<Expr>) -> Expr = match self.peek().clone() {
            Token::Star => Expr::Deref,
            Token::Bang => Expr::Not,
            Token::Minus => Expr::Negate,
            _ => return self.parse_primary(),
        };
        self.advance();
        Ok(wrap(Box::new(self.parse_unary()?)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Int(val) => Ok(Expr::IntLit(val)),
            Token::Ident(name) => Ok(Expr::Register(name)),
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    tok => Err(syntax(format!("expected ')', got {:?}", tok))),
                }
            }
            tok => Err(syntax(format!("unexpected token {:?}", tok))),
        }
    }
}

pub fn parse(input: &str) -> Result<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse_or()?;
    if parser.peek() != &Token::Eof {
        return Err(syntax(format!(
            "unexpected token after expression: {:?}",
            parser.peek()
        )));
    }
    Ok(expr)
}

pub fn evaluate(expr: &Expr, ctx: &dyn EvalContext) -> Result<u64> {
    Ok(match expr {
        Expr::IntLit(v) => *v,
        Expr::Register(name) => ctx.register(name)?,
        Expr::Deref(inner) => ctx.read_word(evaluate(inner, ctx)?)?,
        Expr::Not(inner) => (evaluate(inner, ctx)? == 0) as u64,
        Expr::Negate(inner) => evaluate(inner, ctx)?.wrapping_neg(),
        Expr::Binary(BinOp::And, l, r) => {
            (evaluate(l, ctx)? != 0 && evaluate(r, ctx)? != 0) as u64
        }
        Expr::Binary(BinOp::Or, l, r) => {
            (evaluate(l, ctx)? != 0 || evaluate(r, ctx)? != 0) as u64
        }
        Expr::Binary(op, l, r) => {
            let (a, b) = (evaluate(l, ctx)?, evaluate(r, ctx)?);
            match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div | BinOp::Rem if b == 0 => {
                    return Err(Error::InvalidRequest("condition: division by zero".into()))
                }
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                BinOp::Eq => (a == b) as u64,
                BinOp::Ne => (a != b) as u64,
                BinOp::Lt => (a < b) as u64,
                BinOp::Le => (a <= b) as u64,
                BinOp::Gt => (a > b) as u64,
                BinOp::Ge => (a >= b) as u64,
                BinOp::And => (a != 0 && b != 0) as u64,
                BinOp::Or => (a != 0 || b != 0) as u64,
            }
        }
    })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntLit(v) if *v > 0xffff => write!(f, "{:#x}", v),
            Expr::IntLit(v) => write!(f, "{}", v),
            Expr::Register(name) => f.write_str(name),
            Expr::Deref(inner) => write!(f, "*{}", inner),
            Expr::Not(inner) => write!(f, "!{}", inner),
            Expr::Negate(inner) => write!(f, "-{}", inner),
            Expr::Binary(op, l, r) => write!(f, "({} {} {})", l, op.symbol(), r),
        }
    }
}

/// A parsed condition together with the text it was written as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(Condition {
            source: source.trim().to_string(),
            expr: parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_true(&self, ctx: &dyn EvalContext) -> Result<bool> {
        Ok(evaluate(&self.expr, ctx)? != 0)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Ctx {
        regs: HashMap<&'static str, u64>,
        mem: HashMap<u64, u64>,
    }

    impl EvalContext for Ctx {
        fn register(&self, name: &str) -> Result<u64> {
            self.regs
                .get(name)
                .copied()
                .ok_or_else(|| Error::Register(format!("unknown register: {}", name)))
        }

        fn read_word(&self, addr: u64) -> Result<u64> {
            self.mem.get(&addr).copied().ok_or(Error::UnreadableMemory {
                addr: crate::types::VirtAddr(addr),
                len: 8,
            })
        }
    }

    fn ctx() -> Ctx {
        Ctx {
            regs: [("rax", 5), ("rsp", 0x1000)].into_iter().collect(),
            mem: [(0x1008, 42)].into_iter().collect(),
        }
    }

    fn eval(text: &str) -> Result<u64> {
        evaluate(&parse(text)?, &ctx())
    }

    #[test]
    fn precedence() {
        assert_eq!(parse("a + b * c").unwrap().to_string(), "(a + (b * c))");
        assert_eq!(parse("(a + b) * c").unwrap().to_string(), "((a + b) * c)");
        assert_eq!(
            parse("a == 1 || b < 2 && !c").unwrap().to_string(),
            "((a == 1) || ((b < 2) && !c))"
        );
        assert_eq!(parse("**pp").unwrap().to_string(), "**pp");
    }

    #[test]
    fn literals() {
        assert_eq!(parse("0x1000").unwrap(), Expr::IntLit(0x1000));
        assert_eq!(parse("$rax").unwrap(), Expr::Register("rax".into()));
        assert!(parse("0xzz").is_err());
    }

    #[test]
    fn evaluates_registers_and_memory() {
        assert_eq!(eval("rax + 1").unwrap(), 6);
        assert_eq!(eval("*(rsp + 8)").unwrap(), 42);
        assert_eq!(eval("*(rsp + 8) == 42 && rax > 4").unwrap(), 1);
        assert_eq!(eval("rax % 3 != 2").unwrap(), 0);
        assert_eq!(eval("-1").unwrap(), u64::MAX);
    }

    #[test]
    fn short_circuit_skips_bad_reads() {
        assert_eq!(eval("rax == 0 && *0 == 1").unwrap(), 0);
        assert_eq!(eval("rax == 5 || *0 == 1").unwrap(), 1);
        assert!(eval("*0 == 1").unwrap_err().is_unreadable());
    }

    #[test]
    fn errors() {
        assert!(eval("rax / 0").is_err());
        assert!(eval("xmm0 == 1").is_err());
        assert!(parse("rax ==").is_err());
        assert!(parse("rax = 1").is_err());
        assert!(parse("(rax").is_err());
        assert!(parse("rax 1").is_err());
    }

    #[test]
    fn condition_keeps_source() {
        let cond = Condition::parse("  rax == 5 ").unwrap();
        assert_eq!(cond.source(), "rax == 5");
        assert!(cond.is_true(&ctx()).unwrap());
    }
}
