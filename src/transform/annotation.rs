//! Parses the two leading string-literal annotations every transformable
//! function opens with (§3): the adjacency kind, and a `;`-separated list
//! of per-parameter aligned/shadow distance pairs
//! (`name:aligned_expr:shadow_expr`, or `name:*` for a parameter whose
//! distance starts at `*`).
//!
//! Parameter distances are parsed with the small bounded arithmetic
//! grammar (`+ - * /`, identifiers, numbers, parens, the bare `*` star
//! sentinel). The sampling annotation carried by each `Lap` call
//! (`"<selector>; <eta_distance>"`, §4.7) needs more: selectors are full
//! boolean-and-ternary expressions over the program's own comparison and
//! logical operators (`q[i]+eta > best ? ... : ...`), so [`parse_full_expr`]
//! extends the grammar with ternary, `&&`/`||`, equality/relational
//! operators and array indexing. `ALIGNED`/`SHADOW` are parsed as ordinary
//! identifiers — substitution against them happens structurally afterwards
//! via [`crate::expr::substitute`], not by string surgery the way
//! `original_source/shadowdp/core.py` does it.

use crate::cast::{BinOp, Expr, UnOp};
use crate::error::{AnnotationError, SourceLocation};
use crate::smt::precondition::Adjacency;
use crate::typeenv::Distance;

pub fn parse_adjacency(text: &str, location: &SourceLocation) -> Result<Adjacency, AnnotationError> {
    match text.trim() {
        "ALL_DIFFER" => Ok(Adjacency::AllDiffer),
        "ONE_DIFFER" => Ok(Adjacency::OneDiffer),
        other => Err(AnnotationError::InvalidAdjacency {
            found: other.to_string(),
            location: location.clone(),
        }),
    }
}

pub struct ParameterAnnotation {
    pub name: String,
    pub aligned: Distance,
    pub shadow: Distance,
}

pub fn parse_parameter_annotations(
    text: &str,
    location: &SourceLocation,
) -> Result<Vec<ParameterAnnotation>, AnnotationError> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| parse_one(entry, location))
        .collect()
}

fn parse_one(entry: &str, location: &SourceLocation) -> Result<ParameterAnnotation, AnnotationError> {
    let mut parts = entry.splitn(3, ':');
    let name = parts.next().unwrap_or("").trim();
    if name.is_empty() {
        return Err(AnnotationError::IllegalParameterAnnotation {
            text: entry.to_string(),
            location: location.clone(),
        });
    }

    let aligned_text = parts.next().ok_or_else(|| AnnotationError::IllegalParameterAnnotation {
        text: entry.to_string(),
        location: location.clone(),
    })?;

    let shadow_text = parts.next().unwrap_or(aligned_text);

    let aligned = parse_distance(aligned_text, entry, location)?;
    let shadow = parse_distance(shadow_text, entry, location)?;

    Ok(ParameterAnnotation {
        name: name.to_string(),
        aligned,
        shadow,
    })
}

fn parse_distance(text: &str, entry: &str, location: &SourceLocation) -> Result<Distance, AnnotationError> {
    let trimmed = text.trim();
    if trimmed == "*" {
        return Ok(Distance::Star);
    }
    let expr = parse_expr(trimmed).ok_or_else(|| AnnotationError::IllegalParameterAnnotation {
        text: entry.to_string(),
        location: location.clone(),
    })?;
    Ok(Distance::Value(expr))
}

/// Parses a tiny arithmetic expression: `term (('+' | '-') term)*`.
pub fn parse_expr(text: &str) -> Option<Expr> {
    let tokens = tokenize(text)?;
    let mut pos = 0;
    let expr = parse_additive(&tokens, &mut pos)?;
    if pos == tokens.len() {
        Some(expr)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let num: f64 = chars[start..i].iter().collect::<String>().parse().ok()?;
            tokens.push(Token::Num(num));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            match c {
                '+' => tokens.push(Token::Plus),
                '-' => tokens.push(Token::Minus),
                '*' => tokens.push(Token::Star),
                '/' => tokens.push(Token::Slash),
                '(' => tokens.push(Token::LParen),
                ')' => tokens.push(Token::RParen),
                _ => return None,
            }
            i += 1;
        }
    }
    Some(tokens)
}

fn parse_additive(tokens: &[Token], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_multiplicative(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Plus) => {
                *pos += 1;
                let right = parse_multiplicative(tokens, pos)?;
                left = Expr::bin(BinOp::Add, left, right);
            }
            Some(Token::Minus) => {
                *pos += 1;
                let right = parse_multiplicative(tokens, pos)?;
                left = Expr::bin(BinOp::Sub, left, right);
            }
            _ => break,
        }
    }
    Some(left)
}

fn parse_multiplicative(tokens: &[Token], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_unary(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Star) => {
                *pos += 1;
                let right = parse_unary(tokens, pos)?;
                left = Expr::bin(BinOp::Mul, left, right);
            }
            Some(Token::Slash) => {
                *pos += 1;
                let right = parse_unary(tokens, pos)?;
                left = Expr::bin(BinOp::Div, left, right);
            }
            _ => break,
        }
    }
    Some(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Option<Expr> {
    if let Some(Token::Minus) = tokens.get(*pos) {
        *pos += 1;
        let inner = parse_unary(tokens, pos)?;
        return Some(Expr::un(crate::cast::UnOp::Neg, inner));
    }
    parse_primary(tokens, pos)
}

fn parse_primary(tokens: &[Token], pos: &mut usize) -> Option<Expr> {
    match tokens.get(*pos)?.clone() {
        Token::Num(v) => {
            *pos += 1;
            Some(Expr::num(v))
        }
        Token::Ident(name) => {
            *pos += 1;
            Some(Expr::id(name))
        }
        Token::LParen => {
            *pos += 1;
            let inner = parse_additive(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Some(inner)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Parsed sampling annotation carried by a `Lap` call: `"<selector>; <eta_distance>"`
/// (§4.7). `selector` is the ternary/boolean expression later substituted with
/// `ALIGNED`/`SHADOW` bound to each side's current value (structurally, not by
/// string surgery); `eta_distance` is the aligned-side distance `Lap`'s result
/// carries forward; `extra_assumes` holds any further `;`-separated segments of
/// the form `assume(<cond>)` the annotation carries ahead of its own selector.
pub struct SamplingAnnotation {
    pub selector: Expr,
    pub eta_distance: Expr,
    pub extra_assumes: Vec<Expr>,
}

pub fn parse_sampling_annotation(text: &str, location: &SourceLocation) -> Result<SamplingAnnotation, AnnotationError> {
    let mut segments = text.split(';').map(str::trim);
    let selector_text = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| {
        AnnotationError::IllegalSamplingAnnotation {
            text: text.to_string(),
            location: location.clone(),
        }
    })?;
    let eta_text = segments.next().unwrap_or("0");

    let mut extra_assumes = Vec::new();
    for segment in segments {
        if let Some(inner) = extract_assume_expr(segment) {
            if let Some(expr) = parse_full_expr(&inner) {
                extra_assumes.push(expr);
            }
        }
    }

    let selector = parse_full_expr(selector_text).ok_or_else(|| AnnotationError::IllegalSamplingAnnotation {
        text: text.to_string(),
        location: location.clone(),
    })?;
    let eta_distance = parse_full_expr(eta_text).ok_or_else(|| AnnotationError::IllegalSamplingAnnotation {
        text: text.to_string(),
        location: location.clone(),
    })?;

    Ok(SamplingAnnotation {
        selector,
        eta_distance,
        extra_assumes,
    })
}

/// Extracts the inner text of a leading `assume(...)` call, if `segment` is
/// (modulo whitespace) shaped like one. Mirrors the original's
/// `assume\(([\sa-zA-Z+\-*\\0-9_><=&|]+)\)` regex without needing a regex
/// crate for this one bounded shape.
fn extract_assume_expr(segment: &str) -> Option<String> {
    let trimmed = segment.trim();
    let rest = trimmed.strip_prefix("assume(")?;
    let inner = rest.strip_suffix(')')?;
    Some(inner.to_string())
}

/// Parses the fuller expression grammar sampling selectors and eta-distances
/// are written in: ternary `?:`, `&&`/`||`, equality/relational comparisons,
/// the arithmetic sublanguage [`parse_expr`] already handles, and array
/// indexing (`name[expr]`). `ALIGNED`/`SHADOW` parse as ordinary identifiers.
pub fn parse_full_expr(text: &str) -> Option<Expr> {
    let tokens = tokenize_full(text)?;
    let mut pos = 0;
    let expr = parse_ternary(&tokens, &mut pos)?;
    if pos == tokens.len() {
        Some(expr)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FullToken {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    Comma,
}

fn tokenize_full(text: &str) -> Option<Vec<FullToken>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let num: f64 = chars[start..i].iter().collect::<String>().parse().ok()?;
            tokens.push(FullToken::Num(num));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(FullToken::Ident(chars[start..i].iter().collect()));
        } else {
            match (c, next) {
                ('&', Some('&')) => {
                    tokens.push(FullToken::AndAnd);
                    i += 2;
                    continue;
                }
                ('|', Some('|')) => {
                    tokens.push(FullToken::OrOr);
                    i += 2;
                    continue;
                }
                ('=', Some('=')) => {
                    tokens.push(FullToken::EqEq);
                    i += 2;
                    continue;
                }
                ('!', Some('=')) => {
                    tokens.push(FullToken::NotEq);
                    i += 2;
                    continue;
                }
                ('<', Some('=')) => {
                    tokens.push(FullToken::Le);
                    i += 2;
                    continue;
                }
                ('>', Some('=')) => {
                    tokens.push(FullToken::Ge);
                    i += 2;
                    continue;
                }
                _ => {}
            }
            match c {
                '+' => tokens.push(FullToken::Plus),
                '-' => tokens.push(FullToken::Minus),
                '*' => tokens.push(FullToken::Star),
                '/' => tokens.push(FullToken::Slash),
                '(' => tokens.push(FullToken::LParen),
                ')' => tokens.push(FullToken::RParen),
                '[' => tokens.push(FullToken::LBracket),
                ']' => tokens.push(FullToken::RBracket),
                '?' => tokens.push(FullToken::Question),
                ':' => tokens.push(FullToken::Colon),
                '<' => tokens.push(FullToken::Lt),
                '>' => tokens.push(FullToken::Gt),
                '!' => tokens.push(FullToken::Not),
                ',' => tokens.push(FullToken::Comma),
                _ => return None,
            }
            i += 1;
        }
    }
    Some(tokens)
}

fn parse_ternary(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let cond = parse_logical_or(tokens, pos)?;
    if let Some(FullToken::Question) = tokens.get(*pos) {
        *pos += 1;
        let iftrue = parse_ternary(tokens, pos)?;
        match tokens.get(*pos) {
            Some(FullToken::Colon) => *pos += 1,
            _ => return None,
        }
        let iffalse = parse_ternary(tokens, pos)?;
        Some(Expr::ternary(cond, iftrue, iffalse))
    } else {
        Some(cond)
    }
}

fn parse_logical_or(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_logical_and(tokens, pos)?;
    while let Some(FullToken::OrOr) = tokens.get(*pos) {
        *pos += 1;
        let right = parse_logical_and(tokens, pos)?;
        left = Expr::bin(BinOp::Or, left, right);
    }
    Some(left)
}

fn parse_logical_and(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_equality(tokens, pos)?;
    while let Some(FullToken::AndAnd) = tokens.get(*pos) {
        *pos += 1;
        let right = parse_equality(tokens, pos)?;
        left = Expr::bin(BinOp::And, left, right);
    }
    Some(left)
}

fn parse_equality(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_relational(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(FullToken::EqEq) => {
                *pos += 1;
                left = Expr::bin(BinOp::Eq, left, parse_relational(tokens, pos)?);
            }
            Some(FullToken::NotEq) => {
                *pos += 1;
                left = Expr::bin(BinOp::Ne, left, parse_relational(tokens, pos)?);
            }
            _ => break,
        }
    }
    Some(left)
}

fn parse_relational(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_additive_full(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(FullToken::Lt) => {
                *pos += 1;
                left = Expr::bin(BinOp::Lt, left, parse_additive_full(tokens, pos)?);
            }
            Some(FullToken::Le) => {
                *pos += 1;
                left = Expr::bin(BinOp::Le, left, parse_additive_full(tokens, pos)?);
            }
            Some(FullToken::Gt) => {
                *pos += 1;
                left = Expr::bin(BinOp::Gt, left, parse_additive_full(tokens, pos)?);
            }
            Some(FullToken::Ge) => {
                *pos += 1;
                left = Expr::bin(BinOp::Ge, left, parse_additive_full(tokens, pos)?);
            }
            _ => break,
        }
    }
    Some(left)
}

fn parse_additive_full(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_multiplicative_full(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(FullToken::Plus) => {
                *pos += 1;
                left = Expr::bin(BinOp::Add, left, parse_multiplicative_full(tokens, pos)?);
            }
            Some(FullToken::Minus) => {
                *pos += 1;
                left = Expr::bin(BinOp::Sub, left, parse_multiplicative_full(tokens, pos)?);
            }
            _ => break,
        }
    }
    Some(left)
}

fn parse_multiplicative_full(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_unary_full(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(FullToken::Star) => {
                *pos += 1;
                left = Expr::bin(BinOp::Mul, left, parse_unary_full(tokens, pos)?);
            }
            Some(FullToken::Slash) => {
                *pos += 1;
                left = Expr::bin(BinOp::Div, left, parse_unary_full(tokens, pos)?);
            }
            _ => break,
        }
    }
    Some(left)
}

fn parse_unary_full(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    match tokens.get(*pos) {
        Some(FullToken::Minus) => {
            *pos += 1;
            Some(Expr::un(UnOp::Neg, parse_unary_full(tokens, pos)?))
        }
        Some(FullToken::Not) => {
            *pos += 1;
            Some(Expr::un(UnOp::Not, parse_unary_full(tokens, pos)?))
        }
        _ => parse_postfix_full(tokens, pos),
    }
}

fn parse_postfix_full(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    let mut expr = parse_primary_full(tokens, pos)?;
    while let Some(FullToken::LBracket) = tokens.get(*pos) {
        let name = expr.base_name()?.to_string();
        *pos += 1;
        let subscript = parse_ternary(tokens, pos)?;
        match tokens.get(*pos) {
            Some(FullToken::RBracket) => *pos += 1,
            _ => return None,
        }
        expr = Expr::array_ref(name, subscript);
    }
    Some(expr)
}

fn parse_primary_full(tokens: &[FullToken], pos: &mut usize) -> Option<Expr> {
    match tokens.get(*pos)?.clone() {
        FullToken::Num(v) => {
            *pos += 1;
            Some(Expr::num(v))
        }
        FullToken::Ident(name) => {
            *pos += 1;
            if let Some(FullToken::LParen) = tokens.get(*pos) {
                *pos += 1;
                let mut args = Vec::new();
                if !matches!(tokens.get(*pos), Some(FullToken::RParen)) {
                    loop {
                        args.push(parse_ternary(tokens, pos)?);
                        match tokens.get(*pos) {
                            Some(FullToken::Comma) => {
                                *pos += 1;
                            }
                            _ => break,
                        }
                    }
                }
                match tokens.get(*pos) {
                    Some(FullToken::RParen) => *pos += 1,
                    _ => return None,
                }
                Some(Expr::Call { name, args })
            } else {
                Some(Expr::id(name))
            }
        }
        FullToken::LParen => {
            *pos += 1;
            let inner = parse_ternary(tokens, pos)?;
            match tokens.get(*pos) {
                Some(FullToken::RParen) => {
                    *pos += 1;
                    Some(inner)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_differ() {
        let loc = SourceLocation::unknown();
        assert_eq!(parse_adjacency("ALL_DIFFER", &loc).unwrap(), Adjacency::AllDiffer);
    }

    #[test]
    fn rejects_unknown_adjacency() {
        let loc = SourceLocation::unknown();
        assert!(parse_adjacency("SOMETHING_ELSE", &loc).is_err());
    }

    #[test]
    fn parses_parameter_list_with_star() {
        let loc = SourceLocation::unknown();
        let parsed = parse_parameter_annotations("q:*;epsilon:0:0", &loc).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "q");
        assert!(matches!(parsed[0].aligned, Distance::Star));
        assert_eq!(parsed[1].name, "epsilon");
    }

    #[test]
    fn parses_arithmetic_expression() {
        let expr = parse_expr("q0 - q1 + 2").unwrap();
        assert_eq!(
            expr,
            Expr::bin(
                BinOp::Add,
                Expr::bin(BinOp::Sub, Expr::id("q0"), Expr::id("q1")),
                Expr::num(2.0)
            )
        );
    }

    #[test]
    fn parses_ternary_selector_with_array_index() {
        let expr = parse_full_expr("q[i] > best ? 1 : -1").unwrap();
        assert_eq!(
            expr,
            Expr::ternary(
                Expr::bin(BinOp::Gt, Expr::array_ref("q", Expr::id("i")), Expr::id("best")),
                Expr::num(1.0),
                Expr::un(UnOp::Neg, Expr::num(1.0))
            )
        );
    }

    #[test]
    fn parses_logical_and_with_equality() {
        let expr = parse_full_expr("i == __SHADOWDP_index && ALIGNED > SHADOW").unwrap();
        assert_eq!(
            expr,
            Expr::bin(
                BinOp::And,
                Expr::bin(BinOp::Eq, Expr::id("i"), Expr::id("__SHADOWDP_index")),
                Expr::bin(BinOp::Gt, Expr::id("ALIGNED"), Expr::id("SHADOW"))
            )
        );
    }

    #[test]
    fn parses_sampling_annotation_with_selector_and_eta() {
        let loc = SourceLocation::unknown();
        let parsed = parse_sampling_annotation("q[i] > best ? 1 : -1; eta", &loc).unwrap();
        assert_eq!(parsed.eta_distance, Expr::id("eta"));
        assert!(parsed.extra_assumes.is_empty());
    }

    #[test]
    fn parses_sampling_annotation_with_extra_assume() {
        let loc = SourceLocation::unknown();
        let parsed = parse_sampling_annotation("1; eta; assume(eta > 0)", &loc).unwrap();
        assert_eq!(parsed.extra_assumes.len(), 1);
        assert_eq!(
            parsed.extra_assumes[0],
            Expr::bin(BinOp::Gt, Expr::id("eta"), Expr::num(0.0))
        );
    }
}
