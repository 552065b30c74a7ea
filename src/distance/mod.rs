//! The distance generator (§4.3): computes the `(aligned, shadow)` distance
//! of an expression from the distances of its free variables in Γ.
//!
//! Grounded on `original_source/shadowdp/core.py`'s `_DistanceGenerator`,
//! which visits `Constant`/`ID`/`ArrayRef`/`BinaryOp`/`UnaryOp`/`TernaryOp`
//! nodes and combines child distances componentwise, simplifying with
//! sympy after each step. This port uses [`crate::expr::simplify`] in place
//! of sympy (§9: "a from-scratch port has no sympy; reimplement only the
//! simplification rules the generator actually exercises").

use crate::cast::{BinOp, Expr, UnOp};
use crate::expr::simplify;
use crate::typeenv::{Distance, TypeEnv};

/// Computes the `(aligned, shadow)` distance of `expr` under `env`.
/// Variables not present in `env` are treated as having zero distance
/// (true of loop/array index variables and other invariants introduced
/// purely for bookkeeping, which never diverge between the aligned and
/// shadow runs).
pub fn distance_of(expr: &Expr, env: &TypeEnv) -> (Distance, Distance) {
    match expr {
        Expr::Num(_) | Expr::Str(_) => (Distance::zero(), Distance::zero()),

        Expr::Id(name) => env
            .get(name)
            .cloned()
            .unwrap_or((Distance::zero(), Distance::zero())),

        Expr::ArrayRef { name, .. } => env
            .get(name)
            .cloned()
            .unwrap_or((Distance::zero(), Distance::zero())),

        Expr::Unary { op, expr } => {
            let (aligned, shadow) = distance_of(expr, env);
            (unary_distance(*op, aligned), unary_distance(*op, shadow))
        }

        Expr::Binary { op, left, right } => {
            let (la, ls) = distance_of(left, env);
            let (ra, rs) = distance_of(right, env);
            (combine(*op, la, ra), combine(*op, ls, rs))
        }

        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => {
            let (ta, ts) = distance_of(iftrue, env);
            let (fa, fs) = distance_of(iffalse, env);
            (
                ternary_distance(cond, ta, fa),
                ternary_distance(cond, ts, fs),
            )
        }

        // Calls (Lap/assume/assert/havoc) are statement-level; a bare
        // distance query against one means the caller asked about
        // something the type system doesn't assign a distance to.
        Expr::Call { .. } => (Distance::Star, Distance::Star),
    }
}

fn unary_distance(op: UnOp, d: Distance) -> Distance {
    match (op, d) {
        (UnOp::Neg, Distance::Value(e)) => Distance::Value(simplify(&Expr::un(UnOp::Neg, e))),
        (UnOp::Abs, Distance::Value(e)) if e.is_zero() => Distance::Value(Expr::num(0.0)),
        (UnOp::Neg, Distance::Star) => Distance::Star,
        _ => Distance::Star,
    }
}

/// Only affine combination is distance-preserving: addition and
/// subtraction of distances track exactly; anything else (multiplication,
/// division, comparisons) loses a computable bound unless both sides are
/// already known to be unaffected (zero distance on both).
fn combine(op: BinOp, left: Distance, right: Distance) -> Distance {
    match (op, left, right) {
        (BinOp::Add, Distance::Value(l), Distance::Value(r)) => {
            Distance::Value(simplify(&Expr::bin(BinOp::Add, l, r)))
        }
        (BinOp::Sub, Distance::Value(l), Distance::Value(r)) => {
            Distance::Value(simplify(&Expr::bin(BinOp::Sub, l, r)))
        }
        (BinOp::Mul, Distance::Value(l), Distance::Value(r)) if l.is_zero() && r.is_zero() => {
            Distance::Value(Expr::num(0.0))
        }
        (BinOp::Div, Distance::Value(l), Distance::Value(r)) if l.is_zero() && r.is_zero() => {
            Distance::Value(Expr::num(0.0))
        }
        _ => Distance::Star,
    }
}

fn ternary_distance(cond: &Expr, iftrue: Distance, iffalse: Distance) -> Distance {
    match (iftrue, iffalse) {
        (Distance::Value(t), Distance::Value(f)) if t == f => Distance::Value(t),
        (Distance::Value(t), Distance::Value(f)) => {
            Distance::Value(simplify(&Expr::ternary(cond.clone(), t, f)))
        }
        _ => Distance::Star,
    }
}
