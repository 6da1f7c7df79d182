//! 条件式とフックロジックの評価
//!
//! フックに付ける条件とロジックは、レジスタと引数だけを参照できる小さな式言語で書きます。
//!
//! ```text
//! rdi == 0x10 && args[1] > 3
//! rax = rax + 1; -1
//! ```
//!
//! 値はすべて `u64` で、算術はラップアラウンドします。比較と論理演算は 0 / 1 を返します。
//! ロジックは `;` で区切った文の並びで、`reg = expr` はコンテキストプロキシ経由で
//! レジスタを書き換えます。最後の式の値が `-1` のときはスレッドを停止しません。
//! 演算子の優先順位はRustと同じです。

use crate::context::ContextProxy;
use std::fmt;
use std::sync::Arc;

/// 式の評価に失敗した理由
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected '{found}' at offset {offset}")]
    UnexpectedToken { offset: usize, found: String },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unknown register '{0}'")]
    UnknownRegister(String),
    #[error("argument {0} is not available")]
    ArgumentUnavailable(usize),
    #[error("division by zero")]
    DivisionByZero,
    #[error("failed to write register '{register}': {reason}")]
    WriteFailed { register: String, reason: String },
    #[error("expression has more than {0} tokens")]
    TooLong(usize),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

/// 式から見えるトラップ時の状態
pub trait ExprScope {
    fn register(&self, name: &str) -> Option<u64>;
    fn set_register(&mut self, name: &str, value: u64) -> Result<(), ExprError>;
    fn arg(&self, index: usize) -> Option<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(u64),
    Ident(String),
    Op(&'static str),
}

/// 1つの条件またはロジックのトークン数の上限
const MAX_TOKENS: usize = 1024;
/// 括弧と単項演算子の入れ子の上限
const MAX_DEPTH: usize = 32;

const OPERATORS: &[&str] = &[
    "||", "&&", "==", "!=", "<=", ">=", "<<", ">>", "<", ">", "+", "-", "*", "/", "%", "&", "|",
    "^", "!", "(", ")", "[", "]", "=", ";",
];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if tokens.len() >= MAX_TOKENS {
            return Err(ExprError::TooLong(MAX_TOKENS));
        }
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_alphanumeric() {
                pos += 1;
            }
            let text = &source[start..pos];
            let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => text.parse::<u64>(),
            }
            .map_err(|_| ExprError::InvalidNumber(text.to_string()))?;
            tokens.push((start, Token::Number(value)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = pos;
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            tokens.push((start, Token::Ident(source[start..pos].to_string())));
            continue;
        }

        let op = OPERATORS
            .iter()
            .find(|op| source[pos..].starts_with(**op))
            .ok_or_else(|| ExprError::UnexpectedToken {
                offset: pos,
                found: source[pos..].chars().next().map(String::from).unwrap_or_default(),
            })?;
        tokens.push((pos, Token::Op(op)));
        pos += op.len();
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Literal(u64),
    Register(String),
    Arg(usize),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

/// 優先順位の低い順の二項演算子
const PRECEDENCE: &[&[(&str, BinOp)]] = &[
    &[("||", BinOp::Or)],
    &[("&&", BinOp::And)],
    &[
        ("==", BinOp::Eq),
        ("!=", BinOp::Ne),
        ("<=", BinOp::Le),
        (">=", BinOp::Ge),
        ("<", BinOp::Lt),
        (">", BinOp::Gt),
    ],
    &[("|", BinOp::BitOr)],
    &[("^", BinOp::BitXor)],
    &[("&", BinOp::BitAnd)],
    &[("<<", BinOp::Shl), (">>", BinOp::Shr)],
    &[("+", BinOp::Add), ("-", BinOp::Sub)],
    &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
];

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ExprError>) -> Result<T, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<(usize, Token), ExprError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<(), ExprError> {
        let (offset, token) = self.next()?;
        match token {
            Token::Op(o) if o == op => Ok(()),
            other => Err(unexpected(offset, &other)),
        }
    }

    fn statements(&mut self) -> Result<Vec<Stmt>, ExprError> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            if self.eat(";") {
                continue;
            }
            stmts.push(self.statement()?);
            if self.peek().is_some() {
                self.expect(";")?;
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, ExprError> {
        if let (Some(Token::Ident(name)), Some(Token::Op("="))) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            self.pos += 2;
            return Ok(Stmt::Assign(name, self.binary(0)?));
        }
        Ok(Stmt::Expr(self.binary(0)?))
    }

    fn binary(&mut self, level: usize) -> Result<Expr, ExprError> {
        let Some(ops) = PRECEDENCE.get(level) else {
            return self.unary();
        };

        let mut lhs = self.binary(level + 1)?;
        'outer: loop {
            for (text, op) in ops.iter() {
                if self.eat(text) {
                    let rhs = self.binary(level + 1)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat("!") {
            return Ok(Expr::Not(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat("-") {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let (offset, token) = self.next()?;
        match token {
            Token::Number(n) => Ok(Expr::Literal(n)),
            Token::Ident(name) if name == "true" => Ok(Expr::Literal(1)),
            Token::Ident(name) if name == "false" => Ok(Expr::Literal(0)),
            Token::Ident(name) if name == "args" => {
                self.expect("[")?;
                let (offset, index) = self.next()?;
                let Token::Number(index) = index else {
                    return Err(unexpected(offset, &index));
                };
                self.expect("]")?;
                Ok(Expr::Arg(index as usize))
            }
            Token::Ident(name) => Ok(Expr::Register(name)),
            Token::Op("(") => {
                let inner = self.nested(|p| p.binary(0))?;
                self.expect(")")?;
                Ok(inner)
            }
            other => Err(unexpected(offset, &other)),
        }
    }
}

fn unexpected(offset: usize, token: &Token) -> ExprError {
    let found = match token {
        Token::Number(n) => n.to_string(),
        Token::Ident(s) => s.clone(),
        Token::Op(o) => o.to_string(),
    };
    ExprError::UnexpectedToken { offset, found }
}

fn eval(expr: &Expr, scope: &dyn ExprScope) -> Result<u64, ExprError> {
    Ok(match expr {
        Expr::Literal(n) => *n,
        Expr::Register(name) => scope
            .register(name)
            .ok_or_else(|| ExprError::UnknownRegister(name.clone()))?,
        Expr::Arg(i) => scope.arg(*i).ok_or(ExprError::ArgumentUnavailable(*i))?,
        Expr::Not(inner) => (eval(inner, scope)? == 0) as u64,
        Expr::Neg(inner) => eval(inner, scope)?.wrapping_neg(),
        Expr::Binary(BinOp::Or, l, r) => (eval(l, scope)? != 0 || eval(r, scope)? != 0) as u64,
        Expr::Binary(BinOp::And, l, r) => (eval(l, scope)? != 0 && eval(r, scope)? != 0) as u64,
        Expr::Binary(op, l, r) => {
            let (l, r) = (eval(l, scope)?, eval(r, scope)?);
            match op {
                BinOp::Eq => (l == r) as u64,
                BinOp::Ne => (l != r) as u64,
                BinOp::Lt => (l < r) as u64,
                BinOp::Le => (l <= r) as u64,
                BinOp::Gt => (l > r) as u64,
                BinOp::Ge => (l >= r) as u64,
                BinOp::BitOr => l | r,
                BinOp::BitXor => l ^ r,
                BinOp::BitAnd => l & r,
                BinOp::Shl => l.wrapping_shl(r as u32),
                BinOp::Shr => l.wrapping_shr(r as u32),
                BinOp::Add => l.wrapping_add(r),
                BinOp::Sub => l.wrapping_sub(r),
                BinOp::Mul => l.wrapping_mul(r),
                BinOp::Div => l.checked_div(r).ok_or(ExprError::DivisionByZero)?,
                BinOp::Rem => l.checked_rem(r).ok_or(ExprError::DivisionByZero)?,
                BinOp::Or | BinOp::And => unreachable!("short-circuit operators handled above"),
            }
        }
    })
}

/// パース済みの文の並び
#[derive(Clone, PartialEq, Eq)]
pub struct Program {
    source: String,
    stmts: Vec<Stmt>,
}

impl Program {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
        };
        let stmts = parser.statements()?;
        Ok(Self {
            source: source.to_string(),
            stmts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 文を順に実行し、最後の式の値を返す
    pub fn run(&self, scope: &mut dyn ExprScope) -> Result<Option<u64>, ExprError> {
        let mut last = None;
        for stmt in &self.stmts {
            match stmt {
                Stmt::Assign(register, expr) => {
                    let value = eval(expr, scope)?;
                    scope.set_register(register, value)?;
                }
                Stmt::Expr(expr) => last = Some(eval(expr, scope)?),
            }
        }
        Ok(last)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Program({:?})", self.source)
    }
}

pub type PredicateFn = dyn Fn(&dyn ExprScope) -> bool + Send + Sync;
pub type LogicFn = dyn Fn(&mut ContextProxy<'_>) -> LogicOutcome + Send + Sync;

/// フックの条件
#[derive(Clone)]
pub enum Condition {
    Source(Program),
    /// 事前に登録された述語
    Predicate(Arc<PredicateFn>),
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        Program::parse(source).map(Condition::Source)
    }

    pub fn predicate(f: impl Fn(&dyn ExprScope) -> bool + Send + Sync + 'static) -> Self {
        Condition::Predicate(Arc::new(f))
    }

    /// 条件を評価する。値のない条件は成立とみなす
    pub fn evaluate(&self, scope: &mut dyn ExprScope) -> Result<bool, ExprError> {
        match self {
            Condition::Source(program) => Ok(program.run(scope)?.map_or(true, |v| v != 0)),
            Condition::Predicate(f) => Ok(f(scope)),
        }
    }

    /// コントローラに表示するソース
    pub fn describe(&self) -> String {
        match self {
            Condition::Source(program) => program.source().to_string(),
            Condition::Predicate(_) => "<predicate>".to_string(),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self.describe())
    }
}

/// ロジック実行後にスレッドを停止するかどうか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOutcome {
    Suspend,
    /// 停止せずに実行を続ける（ソースでは `-1`）
    Continue,
}

/// フックのロジック
///
/// コールバックはプロキシ全体を受け取り、`request_step` でステップ実行を開始できます。
#[derive(Clone)]
pub enum HookLogic {
    Source(Program),
    Callback(Arc<LogicFn>),
}

impl HookLogic {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        Program::parse(source).map(HookLogic::Source)
    }

    pub fn callback(
        f: impl Fn(&mut ContextProxy<'_>) -> LogicOutcome + Send + Sync + 'static,
    ) -> Self {
        HookLogic::Callback(Arc::new(f))
    }

    pub fn run(&self, proxy: &mut ContextProxy<'_>) -> Result<LogicOutcome, ExprError> {
        match self {
            HookLogic::Source(program) => Ok(match program.run(proxy)? {
                Some(v) if v == u64::MAX => LogicOutcome::Continue,
                _ => LogicOutcome::Suspend,
            }),
            HookLogic::Callback(f) => Ok(f(proxy)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            HookLogic::Source(program) => program.source().to_string(),
            HookLogic::Callback(_) => "<callback>".to_string(),
        }
    }
}

impl fmt::Debug for HookLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HookLogic({})", self.describe())
    }
}
