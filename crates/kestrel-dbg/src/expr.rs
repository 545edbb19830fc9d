//! Mixed-base expression evaluator for the monitor.
//!
//! Values are registers, variables, numeric literals (in the session's
//! default base unless overridden), packed ASCII/SIXBIT literals, and grouped
//! subexpressions. Two precedence tables exist: the default one, and a
//! DEC-style table selected by the `<  >` grouping style, where the bitwise
//! operators collapse onto one level and `,,` packs two 18-bit halves.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("malformed number {text:?} for base {base}")]
    BadNumber { text: String, base: u32 },

    #[error("string literal {0:?} does not fit one word")]
    LiteralTooLong(String),

    #[error("unterminated string literal")]
    UnterminatedLiteral,

    #[error("unbalanced grouping")]
    Unbalanced,

    #[error("operator {0:?} is missing an operand")]
    MissingOperand(String),

    #[error("division by zero")]
    DivideByZero,

    #[error("unknown symbol {0:?}")]
    UnknownSymbol(String),
}

/// Where register and variable names come from.
pub trait SymbolSource {
    /// Resolves an (uppercased) name to a value.
    fn resolve(&self, name: &str) -> Option<i64>;
}

/// No registers, no variables; literals only.
pub struct NoSymbols;

impl SymbolSource for NoSymbols {
    fn resolve(&self, _name: &str) -> Option<i64> {
        None
    }
}

/// Grouping delimiter style. `Angle` selects the DEC precedence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStyle {
    #[default]
    Brace,
    Bracket,
    Angle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unary {
    Negate,
    Complement,
    LeadingZeros,
    Base(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Value(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    ",,", "||", "&&", "^!", "^-", "^_", "^B", "^O", "^D", "^L", "<<", ">>", "<=", ">=", "==",
    "!=", "{", "}", "|", "&", "<", ">", "+", "-", "*", "/", "%", "_", "~",
];

static OP_RE: Lazy<Regex> = Lazy::new(|| {
    // Longest first so "<<" wins over "<" and "^!" over nothing.
    let alternation = OPERATORS
        .iter()
        .map(|op| regex::escape(op))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&alternation).expect("operator alternation compiles")
});

fn precedence(op: &str, dec: bool) -> u32 {
    match op {
        ",," => 1,
        "||" => 5,
        "&&" => 6,
        "|" => {
            if dec {
                15
            } else {
                7
            }
        }
        "^!" => {
            if dec {
                15
            } else {
                8
            }
        }
        "&" => {
            if dec {
                15
            } else {
                9
            }
        }
        "==" | "!=" => 10,
        "<" | "<=" | ">" | ">=" => 11,
        "<<" | ">>" => 12,
        "+" | "-" => 13,
        "*" | "/" | "%" => 14,
        "_" | "^_" => 19,
        _ => 0,
    }
}

/// Truncates `value` to `bits`, with modular (unsigned) or sign-extending
/// semantics.
pub fn truncate(value: i64, bits: u32, unsigned: bool) -> i64 {
    let bits = bits.clamp(1, 64);
    if bits == 64 {
        return value;
    }
    let modulus = 1i128 << bits;
    let v = (value as i128).rem_euclid(modulus);
    if unsigned || v < modulus / 2 {
        v as i64
    } else {
        (v - modulus) as i64
    }
}

/// Renders `value` in `base` without prefix, the way the monitor prints
/// addresses and dump cells.
pub fn to_base_str(value: i64, base: u32, bits: u32) -> String {
    let v = truncate(value, bits, true) as u64;
    match base {
        2 => format!("{v:b}"),
        8 => format!("{v:o}"),
        10 => format!("{v}"),
        _ => format!("{v:x}"),
    }
}

/// One evaluation context. Cheap to build per call; the long-lived state
/// (default base/bits, grouping style) lives in the debugger.
pub struct ExprEval<'a> {
    pub symbols: &'a dyn SymbolSource,
    pub default_base: u32,
    pub default_bits: u32,
    pub group: GroupStyle,
}

impl<'a> ExprEval<'a> {
    pub fn new(symbols: &'a dyn SymbolSource, default_base: u32, default_bits: u32) -> Self {
        Self {
            symbols,
            default_base,
            default_bits,
            group: GroupStyle::Brace,
        }
    }

    /// Evaluates `expr` and truncates the result to the default width with
    /// unsigned semantics.
    pub fn parse(&self, expr: &str) -> Result<i64, ExprError> {
        self.parse_with(expr, true)
    }

    pub fn parse_with(&self, expr: &str, unsigned: bool) -> Result<i64, ExprError> {
        let text = self.textualize_literals(expr)?;
        let text = self.normalize_grouping(&text);
        let text = text.to_ascii_uppercase();
        let tokens = tokenize(&text);

        let mut pos = 0;
        let value = self.eval_seq(&tokens, &mut pos, false)?;
        if pos != tokens.len() {
            return Err(ExprError::Unbalanced);
        }
        Ok(truncate(value, self.default_bits, unsigned))
    }

    fn dec(&self) -> bool {
        self.group == GroupStyle::Angle
    }

    fn normalize_grouping(&self, s: &str) -> String {
        match self.group {
            GroupStyle::Brace => s.to_owned(),
            GroupStyle::Bracket => s.replace('[', "{").replace(']', "}"),
            GroupStyle::Angle => {
                // MACRO-10 style: angle grouping, and nB<m> binary-shift
                // suffixes rewritten as the `^_` shift operator (shift count
                // always base 10).
                static BSHIFT: Lazy<Regex> =
                    Lazy::new(|| Regex::new(r"([0-9]+)[Bb]([0-9]+)").expect("regex compiles"));
                let s = BSHIFT.replace_all(s, "{$1^_ ${2}.}");
                s.replace('<', "{").replace('>', "}")
            }
        }
    }

    /// Replaces `"…"` (7-bit ASCII, up to 5 chars) and `'…'` (SIXBIT, up to
    /// 6 chars) literals with plain numbers.
    fn textualize_literals(&self, s: &str) -> Result<String, ExprError> {
        if !s.contains('"') && !s.contains('\'') {
            return Ok(s.to_owned());
        }
        let mut out = String::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(ch) = chars.next() {
            if ch != '"' && ch != '\'' {
                out.push(ch);
                continue;
            }
            let mut lit = String::new();
            loop {
                match chars.next() {
                    None => return Err(ExprError::UnterminatedLiteral),
                    Some(c) if c == ch => break,
                    Some(c) => lit.push(c),
                }
            }
            let (max, packer): (usize, fn(u64, char) -> u64) = if ch == '"' {
                (5, |v, c| (v << 7) | u64::from(c as u8 & 0x7F))
            } else {
                (6, |v, c| (v << 6) | (u64::from(c as u8).wrapping_sub(0x20) & 0x3F))
            };
            if lit.len() > max {
                return Err(ExprError::LiteralTooLong(lit));
            }
            let packed = lit.chars().fold(0u64, packer);
            out.push_str(&format!("0x{packed:x}"));
        }
        Ok(out)
    }

    fn eval_seq(&self, tokens: &[Token], pos: &mut usize, in_group: bool) -> Result<i64, ExprError> {
        let mut values: Vec<i64> = Vec::new();
        let mut ops: Vec<&'static str> = Vec::new();
        let mut pending: Vec<Unary> = Vec::new();
        let mut expect_value = true;

        loop {
            let Some(token) = tokens.get(*pos) else {
                if in_group {
                    return Err(ExprError::Unbalanced);
                }
                break;
            };
            match token {
                Token::Op("{") if expect_value => {
                    *pos += 1;
                    let inner = self.eval_seq(tokens, pos, true)?;
                    values.push(self.apply_unaries(&mut pending, inner));
                    expect_value = false;
                }
                Token::Op("}") => {
                    if !in_group {
                        return Err(ExprError::Unbalanced);
                    }
                    if expect_value {
                        return Err(ExprError::MissingOperand("}".into()));
                    }
                    *pos += 1;
                    break;
                }
                Token::Op(op) if expect_value => {
                    let unary = match *op {
                        "-" | "^-" => Unary::Negate,
                        "~" => Unary::Complement,
                        "^L" => Unary::LeadingZeros,
                        "^B" => Unary::Base(2),
                        "^O" => Unary::Base(8),
                        "^D" => Unary::Base(10),
                        other => return Err(ExprError::MissingOperand(other.to_owned())),
                    };
                    pending.push(unary);
                    *pos += 1;
                }
                Token::Op(op) => {
                    let op: &'static str = op;
                    let prec = precedence(op, self.dec());
                    if prec == 0 {
                        return Err(ExprError::MissingOperand(op.to_owned()));
                    }
                    while let Some(&top) = ops.last() {
                        if precedence(top, self.dec()) < prec {
                            break;
                        }
                        ops.pop();
                        apply_binary(top, &mut values)?;
                    }
                    ops.push(op);
                    expect_value = true;
                    *pos += 1;
                }
                Token::Value(text) => {
                    let base = pending
                        .iter()
                        .rev()
                        .find_map(|u| match u {
                            Unary::Base(b) => Some(*b),
                            _ => None,
                        })
                        .unwrap_or(self.default_base);
                    let v = self.parse_value(text, base)?;
                    values.push(self.apply_unaries(&mut pending, v));
                    expect_value = false;
                    *pos += 1;
                }
            }
        }

        if expect_value && (!values.is_empty() || !ops.is_empty()) {
            return Err(ExprError::MissingOperand(
                ops.last().copied().unwrap_or("?").to_owned(),
            ));
        }
        while let Some(op) = ops.pop() {
            apply_binary(op, &mut values)?;
        }
        match values.as_slice() {
            [v] => Ok(*v),
            [] => Err(ExprError::MissingOperand("".into())),
            _ => Err(ExprError::Unbalanced),
        }
    }

    fn apply_unaries(&self, pending: &mut Vec<Unary>, mut value: i64) -> i64 {
        // Innermost prefix applies first.
        while let Some(u) = pending.pop() {
            value = match u {
                Unary::Negate => value.wrapping_neg(),
                Unary::Complement => !value,
                Unary::LeadingZeros => {
                    let bits = self.default_bits.clamp(1, 64);
                    let v = truncate(value, bits, true) as u64;
                    i64::from(v.leading_zeros()) - i64::from(64 - bits)
                }
                Unary::Base(_) => value,
            };
        }
        value
    }

    fn parse_value(&self, text: &str, base: u32) -> Result<i64, ExprError> {
        let text = text.trim();
        if let Some(v) = self.symbols.resolve(text) {
            return Ok(v);
        }

        let (digits, base) = if let Some(hex) = text.strip_prefix("0X") {
            (hex, 16)
        } else if let Some(oct) = text.strip_prefix("0O") {
            (oct, 8)
        } else if let Some(dec) = text.strip_suffix('.') {
            // Trailing dot forces decimal regardless of the session base.
            (dec, 10)
        } else {
            (text, base)
        };

        if digits.is_empty() {
            return Err(ExprError::UnknownSymbol(text.to_owned()));
        }
        let mut value = 0u64;
        for ch in digits.chars() {
            let Some(d) = ch.to_digit(base) else {
                // Not a number in this base; an unknown name reads better
                // than "bad digit" when it contains letters beyond the base.
                return Err(if ch.is_ascii_alphabetic() && base <= 10 {
                    ExprError::UnknownSymbol(text.to_owned())
                } else {
                    ExprError::BadNumber {
                        text: text.to_owned(),
                        base,
                    }
                });
            };
            value = value.wrapping_mul(u64::from(base)).wrapping_add(u64::from(d));
        }
        Ok(value as i64)
    }
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for m in OP_RE.find_iter(text) {
        let chunk = text[last..m.start()].trim();
        if !chunk.is_empty() {
            tokens.push(Token::Value(chunk.to_owned()));
        }
        let op = OPERATORS
            .iter()
            .copied()
            .find(|op| *op == m.as_str())
            .expect("regex only matches known operators");
        tokens.push(Token::Op(op));
        last = m.end();
    }
    let chunk = text[last..].trim();
    if !chunk.is_empty() {
        tokens.push(Token::Value(chunk.to_owned()));
    }
    tokens
}

fn apply_binary(op: &str, values: &mut Vec<i64>) -> Result<(), ExprError> {
    let b = values.pop().ok_or_else(|| ExprError::MissingOperand(op.to_owned()))?;
    let a = values.pop().ok_or_else(|| ExprError::MissingOperand(op.to_owned()))?;
    let v = match op {
        "||" => i64::from(a != 0 || b != 0),
        "&&" => i64::from(a != 0 && b != 0),
        "|" => a | b,
        "^!" => a ^ b,
        "&" => a & b,
        "==" => i64::from(a == b),
        "!=" => i64::from(a != b),
        "<" => i64::from(a < b),
        "<=" => i64::from(a <= b),
        ">" => i64::from(a > b),
        ">=" => i64::from(a >= b),
        "<<" => a.wrapping_shl(b as u32 & 63),
        ">>" => a.wrapping_shr(b as u32 & 63),
        "+" => a.wrapping_add(b),
        "-" => a.wrapping_sub(b),
        "*" => a.wrapping_mul(b),
        "/" => {
            if b == 0 {
                return Err(ExprError::DivideByZero);
            }
            a.wrapping_div(b)
        }
        "%" => {
            if b == 0 {
                return Err(ExprError::DivideByZero);
            }
            a.wrapping_rem(b)
        }
        // MACRO-10 shift: positive count shifts left, negative right.
        "_" | "^_" => {
            if b >= 0 {
                a.wrapping_shl(b as u32 & 63)
            } else {
                a.wrapping_shr((-b) as u32 & 63)
            }
        }
        ",," => ((a & 0o777777) << 18) | (b & 0o777777),
        other => return Err(ExprError::MissingOperand(other.to_owned())),
    };
    values.push(v);
    Ok(())
}
