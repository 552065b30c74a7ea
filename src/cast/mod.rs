//! The restricted C abstract syntax tree (§3).
//!
//! Scalar `int`/`float` declarations, one-dimensional array parameters,
//! assignments, `if`/`else`, `while`, `return`, and expressions built from
//! identifiers, constants, array references, unary/binary/ternary operators
//! and calls limited to `Lap`, `assume`, `assert`, `havoc`. Blocks are plain
//! `Vec<Statement>` rather than nodes with parent back-pointers — "insert
//! before/after current" is modeled as an index into the enclosing block's
//! `Vec`, which the transformer receives explicitly during traversal
//! instead of discovering via a parents map.

pub mod render;

use crate::error::SourceLocation;
use serde::{Deserialize, Serialize};

/// Scalar or one-dimensional-array type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Int,
    Float,
    Array(Box<Type>),
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Array(inner) => write!(f, "{}[]", inner),
        }
    }
}

/// Binary operators supported by the restricted expression language.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators supported by the restricted expression language.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    Abs,
}

impl std::fmt::Display for UnOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnOp::Neg => write!(f, "-"),
            UnOp::Not => write!(f, "!"),
            UnOp::Abs => write!(f, "Abs"),
        }
    }
}

/// An expression node. Structural equality (§4.1) is plain `PartialEq`
/// derived over this tree: two expressions are equal iff they have
/// identical shape and leaf values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Num(OrderedFloat),
    Str(String),
    Id(String),
    ArrayRef {
        name: String,
        subscript: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        iftrue: Box<Expr>,
        iffalse: Box<Expr>,
    },
    /// Calls restricted to `Lap(scale, annotation)`, `assume(cond)`,
    /// `assert(cond)`, `havoc()`.
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

/// Thin newtype giving `f64` the `PartialEq`/`Eq`/`Hash` structural AST nodes
/// need; NaN is never produced by this language's constant folding so
/// bitwise equality is adequate here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Expr {
    pub fn num(v: f64) -> Expr {
        Expr::Num(OrderedFloat(v))
    }

    pub fn id(name: impl Into<String>) -> Expr {
        Expr::Id(name.into())
    }

    pub fn bin(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn un(op: UnOp, expr: Expr) -> Expr {
        Expr::Unary {
            op,
            expr: Box::new(expr),
        }
    }

    pub fn ternary(cond: Expr, iftrue: Expr, iffalse: Expr) -> Expr {
        Expr::Ternary {
            cond: Box::new(cond),
            iftrue: Box::new(iftrue),
            iffalse: Box::new(iffalse),
        }
    }

    pub fn array_ref(name: impl Into<String>, subscript: Expr) -> Expr {
        Expr::ArrayRef {
            name: name.into(),
            subscript: Box::new(subscript),
        }
    }

    /// The variable name this expression reads, if it is a bare identifier
    /// or array reference (used by the distance-dependence checker, §4.7).
    pub fn base_name(&self) -> Option<&str> {
        match self {
            Expr::Id(name) => Some(name),
            Expr::ArrayRef { name, .. } => Some(name),
            _ => None,
        }
    }

    /// True iff this expression is the literal constant zero.
    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Num(OrderedFloat(v)) if *v == 0.0)
    }
}

/// An lvalue: a scalar variable or an array element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LValue {
    Id(String),
    ArrayRef { name: String, subscript: Box<Expr> },
}

impl LValue {
    pub fn name(&self) -> &str {
        match self {
            LValue::Id(name) => name,
            LValue::ArrayRef { name, .. } => name,
        }
    }
}

/// A single statement. Bodies of `if`/`while` are plain `Vec<Statement>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// One of the two leading string-literal annotations, or a stub
    /// annotation reinserted on an idempotent re-transform (§8).
    StringAnnotation { text: String, location: SourceLocation },

    Decl {
        name: String,
        ty: Type,
        init: Option<Expr>,
        location: SourceLocation,
    },

    Assign {
        lvalue: LValue,
        rvalue: Expr,
        location: SourceLocation,
    },

    If {
        cond: Expr,
        then_branch: Vec<Statement>,
        else_branch: Option<Vec<Statement>>,
        location: SourceLocation,
    },

    While {
        cond: Expr,
        body: Vec<Statement>,
        location: SourceLocation,
    },

    Return { expr: Expr, location: SourceLocation },

    /// A standalone call statement: `assume(...)`, `assert(...)`, `havoc();`.
    Expr { expr: Expr, location: SourceLocation },
}

impl Statement {
    pub fn location(&self) -> &SourceLocation {
        match self {
            Statement::StringAnnotation { location, .. }
            | Statement::Decl { location, .. }
            | Statement::Assign { location, .. }
            | Statement::If { location, .. }
            | Statement::While { location, .. }
            | Statement::Return { location, .. }
            | Statement::Expr { location, .. } => location,
        }
    }
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub location: SourceLocation,
}

/// The single transformable function definition (§6.1: exactly one per
/// translation unit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Type,
    pub body: Vec<Statement>,
    pub location: SourceLocation,
}

/// A translation unit: exactly one transformable function (§6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub function: Function,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_ignores_boxing() {
        let a = Expr::bin(BinOp::Add, Expr::id("x"), Expr::num(1.0));
        let b = Expr::bin(BinOp::Add, Expr::id("x"), Expr::num(1.0));
        assert_eq!(a, b);
    }

    #[test]
    fn structural_equality_is_sensitive_to_shape() {
        let a = Expr::bin(BinOp::Add, Expr::id("x"), Expr::num(1.0));
        let b = Expr::bin(BinOp::Add, Expr::num(1.0), Expr::id("x"));
        assert_ne!(a, b);
    }

    #[test]
    fn base_name_of_array_ref() {
        let e = Expr::array_ref("q", Expr::id("i"));
        assert_eq!(e.base_name(), Some("q"));
    }
}
