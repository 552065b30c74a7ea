//! The expression replacer (§4.4): builds the aligned or shadow instance of
//! an expression by substituting every free variable `v` with `v + d(v)`,
//! where `d(v)` is its distance in Γ. When a variable's distance is `*`,
//! the replacer references a materialized auxiliary tracking variable
//! instead of an inline expression (§4.6, §4.7: the transformer declares
//! `__SHADOWDP_SHADOW_DISTANCE_<name>` the first time a variable is
//! promoted to `*`, and every later read goes through that variable).
//!
//! Grounded on `original_source/shadowdp/core.py`'s `_ExpressionReplacer`,
//! which substitutes `ID`/`ArrayRef` nodes with `BinaryOp('+', node, dist)`
//! and falls back to the tracking variable's name when `dist` is the `*`
//! sentinel.

use crate::cast::{BinOp, Expr};
use crate::typeenv::{Distance, TypeEnv};

/// Which of the two parallel executions an expression is being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Aligned,
    Shadow,
}

/// The name of the auxiliary variable that materializes `name`'s distance
/// on `branch` once it has been promoted to `*`. Pure naming function so
/// the transformer (which declares the variable) and the replacer (which
/// reads it) agree on the identifier without passing strings around.
pub fn aux_distance_var(name: &str, branch: Branch) -> String {
    match branch {
        Branch::Aligned => format!("__SHADOWDP_ALIGNED_DISTANCE_{}", name),
        Branch::Shadow => format!("__SHADOWDP_SHADOW_DISTANCE_{}", name),
    }
}

/// Builds the `branch` instance of `expr` under distance environment
/// `env`: every free `Id`/`ArrayRef` naming a tracked variable is replaced
/// by `name + distance`.
pub fn replace(expr: &Expr, env: &TypeEnv, branch: Branch) -> Expr {
    match expr {
        Expr::Num(_) | Expr::Str(_) => expr.clone(),

        Expr::Id(name) => match env.get(name) {
            Some(pair) => add_distance(Expr::id(name.clone()), select(pair, branch), branch),
            None => expr.clone(),
        },

        Expr::ArrayRef { name, subscript } => {
            let subscript = replace(subscript, env, branch);
            let base = Expr::array_ref(name.clone(), subscript);
            match env.get(name) {
                Some(pair) => add_distance(base, select(pair, branch), branch),
                None => base,
            }
        }

        Expr::Binary { op, left, right } => Expr::bin(
            *op,
            replace(left, env, branch),
            replace(right, env, branch),
        ),

        Expr::Unary { op, expr } => Expr::un(*op, replace(expr, env, branch)),

        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => Expr::ternary(
            replace(cond, env, branch),
            replace(iftrue, env, branch),
            replace(iffalse, env, branch),
        ),

        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| replace(a, env, branch)).collect(),
        },
    }
}

fn select(pair: &(Distance, Distance), branch: Branch) -> &Distance {
    match branch {
        Branch::Aligned => &pair.0,
        Branch::Shadow => &pair.1,
    }
}

fn add_distance(base: Expr, distance: &Distance, branch: Branch) -> Expr {
    match distance {
        Distance::Value(d) if d.is_zero() => base,
        Distance::Value(d) => Expr::bin(BinOp::Add, base, d.clone()),
        Distance::Star => {
            let name = base
                .base_name()
                .expect("replacer only adds distances to Id/ArrayRef bases")
                .to_string();
            let tracking = match &base {
                // An array's `*` distance is itself per-index: the tracking
                // variable is an array read at the same subscript, not a bare
                // scalar (§6.2 — a `*`-tracked array parameter's distance is
                // materialized one tracking array per side, not one scalar).
                Expr::ArrayRef { subscript, .. } => {
                    Expr::array_ref(aux_distance_var(&name, branch), (**subscript).clone())
                }
                _ => Expr::id(aux_distance_var(&name, branch)),
            };
            Expr::bin(BinOp::Add, base, tracking)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::BinOp;

    #[test]
    fn replaces_identifier_with_zero_distance_unchanged() {
        let mut env = TypeEnv::new();
        env.set("x", Distance::zero(), Distance::zero());
        let replaced = replace(&Expr::id("x"), &env, Branch::Aligned);
        assert_eq!(replaced, Expr::id("x"));
    }

    #[test]
    fn replaces_identifier_with_value_distance() {
        let mut env = TypeEnv::new();
        env.set("x", Distance::Value(Expr::num(1.0)), Distance::zero());
        let replaced = replace(&Expr::id("x"), &env, Branch::Aligned);
        assert_eq!(replaced, Expr::bin(BinOp::Add, Expr::id("x"), Expr::num(1.0)));
    }

    #[test]
    fn replaces_star_distance_with_tracking_variable() {
        let mut env = TypeEnv::new();
        env.set("x", Distance::zero(), Distance::Star);
        let replaced = replace(&Expr::id("x"), &env, Branch::Shadow);
        assert_eq!(
            replaced,
            Expr::bin(
                BinOp::Add,
                Expr::id("x"),
                Expr::id("__SHADOWDP_SHADOW_DISTANCE_x")
            )
        );
    }

    #[test]
    fn replaces_star_distance_on_aligned_branch_with_aligned_tracking_variable() {
        let mut env = TypeEnv::new();
        env.set("x", Distance::Star, Distance::zero());
        let replaced = replace(&Expr::id("x"), &env, Branch::Aligned);
        assert_eq!(
            replaced,
            Expr::bin(
                BinOp::Add,
                Expr::id("x"),
                Expr::id("__SHADOWDP_ALIGNED_DISTANCE_x")
            )
        );
    }
}
