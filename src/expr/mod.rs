//! Expression utilities (§4.1): structural equality, ternary-factoring
//! simplification, and an algebraic simplifier used to keep distance
//! expressions small enough for the solver and for human inspection of
//! transformed output.
//!
//! Grounded on `constant_folding.rs`'s exhaustive match over constant
//! operator pairs, generalized here from MIR operands to the tree-shaped
//! `cast::Expr` and extended with the ternary-factoring rule the original
//! Python `_ExpressionSimplifier` applies (`core.py`, `visit_BinaryOp`)
//! since distance expressions are built by adding/subtracting the
//! branches of two distinct ternary distances.

use crate::cast::{BinOp, Expr, UnOp};

/// Structural equality, exposed as a free function so it reads as an
/// explicit operation rather than relying on callers to remember that
/// `==` on `Expr` happens to do the right thing.
pub fn structurally_equal(a: &Expr, b: &Expr) -> bool {
    a == b
}

/// Simplifies an expression to a semantically equivalent, shorter form:
/// constant folding, additive/multiplicative identities, and ternary
/// factoring. Sound (never changes the value of the expression for any
/// environment) and total (always terminates; the tree only shrinks).
pub fn simplify(expr: &Expr) -> Expr {
    match expr {
        Expr::Num(_) | Expr::Str(_) | Expr::Id(_) => expr.clone(),
        Expr::ArrayRef { name, subscript } => Expr::array_ref(name.clone(), simplify(subscript)),
        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(simplify).collect(),
        },
        Expr::Unary { op, expr } => simplify_unary(*op, simplify(expr)),
        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => Expr::ternary(simplify(cond), simplify(iftrue), simplify(iffalse)),
        Expr::Binary { op, left, right } => {
            let left = simplify(left);
            let right = simplify(right);
            simplify_binary(*op, left, right)
        }
    }
}

fn simplify_unary(op: UnOp, operand: Expr) -> Expr {
    if let Expr::Num(v) = &operand {
        let folded = match op {
            UnOp::Neg => Some(-v.0),
            UnOp::Abs => Some(v.0.abs()),
            UnOp::Not => None,
        };
        if let Some(v) = folded {
            return Expr::num(v);
        }
    }
    if op == UnOp::Neg {
        if let Expr::Unary {
            op: UnOp::Neg,
            expr,
        } = &operand
        {
            return (**expr).clone();
        }
    }
    Expr::un(op, operand)
}

fn as_const(e: &Expr) -> Option<f64> {
    match e {
        Expr::Num(v) => Some(v.0),
        _ => None,
    }
}

fn simplify_binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    if let (Some(l), Some(r)) = (as_const(&left), as_const(&right)) {
        if let Some(folded) = fold_constants(op, l, r) {
            return Expr::num(folded);
        }
    }

    if let Some(identity) = apply_identities(op, &left, &right) {
        return identity;
    }

    if matches!(op, BinOp::Add | BinOp::Sub) {
        if let Some(factored) = factor_ternary(op, &left, &right) {
            return factored;
        }
    }

    Expr::bin(op, left, right)
}

fn fold_constants(op: BinOp, l: f64, r: f64) -> Option<f64> {
    match op {
        BinOp::Add => Some(l + r),
        BinOp::Sub => Some(l - r),
        BinOp::Mul => Some(l * r),
        BinOp::Div if r != 0.0 => Some(l / r),
        _ => None,
    }
}

fn apply_identities(op: BinOp, left: &Expr, right: &Expr) -> Option<Expr> {
    match op {
        BinOp::Add => {
            if left.is_zero() {
                return Some(right.clone());
            }
            if right.is_zero() {
                return Some(left.clone());
            }
        }
        BinOp::Sub => {
            if right.is_zero() {
                return Some(left.clone());
            }
            if structurally_equal(left, right) {
                return Some(Expr::num(0.0));
            }
        }
        BinOp::Mul => {
            if left.is_zero() || right.is_zero() {
                return Some(Expr::num(0.0));
            }
            if let Some(1.0) = as_const(left) {
                return Some(right.clone());
            }
            if let Some(1.0) = as_const(right) {
                return Some(left.clone());
            }
        }
        _ => {}
    }
    None
}

/// `(c ? a : b) + k  ->  c ? (a + k) : (b + k)`, and the symmetric/two-sided
/// forms, so that distance sums over ternary-shaped distances collapse back
/// into a single ternary instead of growing with every statement.
fn factor_ternary(op: BinOp, left: &Expr, right: &Expr) -> Option<Expr> {
    match (left, right) {
        (
            Expr::Ternary {
                cond: c1,
                iftrue: a,
                iffalse: b,
            },
            Expr::Ternary {
                cond: c2,
                iftrue: c,
                iffalse: d,
            },
        ) if structurally_equal(c1, c2) => Some(Expr::ternary(
            (**c1).clone(),
            simplify_binary(op, (**a).clone(), (**c).clone()),
            simplify_binary(op, (**b).clone(), (**d).clone()),
        )),
        (
            Expr::Ternary {
                cond,
                iftrue: a,
                iffalse: b,
            },
            other,
        ) => Some(Expr::ternary(
            (**cond).clone(),
            simplify_binary(op, (**a).clone(), other.clone()),
            simplify_binary(op, (**b).clone(), other.clone()),
        )),
        (
            other,
            Expr::Ternary {
                cond,
                iftrue: a,
                iffalse: b,
            },
        ) if op == BinOp::Add => Some(Expr::ternary(
            (**cond).clone(),
            simplify_binary(op, other.clone(), (**a).clone()),
            simplify_binary(op, other.clone(), (**b).clone()),
        )),
        _ => None,
    }
}

/// Substitutes every free occurrence of `name` with `replacement`. Used by
/// the distance generator and the replacer to specialize distance
/// expressions against concrete index variables.
pub fn substitute(expr: &Expr, name: &str, replacement: &Expr) -> Expr {
    match expr {
        Expr::Id(id) if id == name => replacement.clone(),
        Expr::Id(_) | Expr::Num(_) | Expr::Str(_) => expr.clone(),
        Expr::ArrayRef { name: arr, subscript } => {
            let new_name = if arr == name {
                match replacement.base_name() {
                    Some(replaced) => replaced.to_string(),
                    None => arr.clone(),
                }
            } else {
                arr.clone()
            };
            Expr::array_ref(new_name, substitute(subscript, name, replacement))
        }
        Expr::Binary { op, left, right } => Expr::bin(
            *op,
            substitute(left, name, replacement),
            substitute(right, name, replacement),
        ),
        Expr::Unary { op, expr } => Expr::un(*op, substitute(expr, name, replacement)),
        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => Expr::ternary(
            substitute(cond, name, replacement),
            substitute(iftrue, name, replacement),
            substitute(iffalse, name, replacement),
        ),
        Expr::Call { name: fname, args } => Expr::Call {
            name: fname.clone(),
            args: args.iter().map(|a| substitute(a, name, replacement)).collect(),
        },
    }
}

/// True iff `name` occurs free anywhere in `expr` (used by the
/// distance-dependence check in §4.7: a variable's distance must not refer
/// to any identifier besides parameters and the loop/array index).
pub fn occurs_free(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Id(id) => id == name,
        Expr::Num(_) | Expr::Str(_) => false,
        Expr::ArrayRef { name: arr, subscript } => arr == name || occurs_free(subscript, name),
        Expr::Binary { left, right, .. } => occurs_free(left, name) || occurs_free(right, name),
        Expr::Unary { expr, .. } => occurs_free(expr, name),
        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => occurs_free(cond, name) || occurs_free(iftrue, name) || occurs_free(iffalse, name),
        Expr::Call { args, .. } => args.iter().any(|a| occurs_free(a, name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_constant_arithmetic() {
        let e = Expr::bin(BinOp::Add, Expr::num(2.0), Expr::num(3.0));
        assert_eq!(simplify(&e), Expr::num(5.0));
    }

    #[test]
    fn drops_additive_zero() {
        let e = Expr::bin(BinOp::Add, Expr::id("x"), Expr::num(0.0));
        assert_eq!(simplify(&e), Expr::id("x"));
    }

    #[test]
    fn self_subtraction_is_zero() {
        let e = Expr::bin(BinOp::Sub, Expr::id("x"), Expr::id("x"));
        assert_eq!(simplify(&e), Expr::num(0.0));
    }

    #[test]
    fn factors_matching_ternary_condition() {
        let cond = Expr::bin(BinOp::Gt, Expr::id("q0"), Expr::id("q1"));
        let left = Expr::ternary(cond.clone(), Expr::num(1.0), Expr::num(0.0));
        let right = Expr::ternary(cond.clone(), Expr::num(2.0), Expr::num(3.0));
        let combined = Expr::bin(BinOp::Add, left, right);
        let simplified = simplify(&combined);
        assert_eq!(
            simplified,
            Expr::ternary(cond, Expr::num(3.0), Expr::num(3.0))
        );
    }

    #[test]
    fn substitutes_free_identifier() {
        let e = Expr::bin(BinOp::Add, Expr::id("eta"), Expr::num(1.0));
        let replaced = substitute(&e, "eta", &Expr::id("eta1"));
        assert_eq!(replaced, Expr::bin(BinOp::Add, Expr::id("eta1"), Expr::num(1.0)));
    }

    #[test]
    fn occurs_free_detects_array_base() {
        let e = Expr::array_ref("q", Expr::id("i"));
        assert!(occurs_free(&e, "q"));
        assert!(occurs_free(&e, "i"));
        assert!(!occurs_free(&e, "j"));
    }
}
