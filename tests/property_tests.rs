//! Property-based coverage for the algebraic simplifier (§4.1) and the
//! distance environment's merge operation (§4.2). Grounded on the shape
//! `proptest` usage takes in the pack's other compiler example
//! (recursive strategies over an AST, plain `proptest!` blocks) rather
//! than mechanical round-trip grids.

use proptest::prelude::*;
use shadow_dp::cast::{BinOp, Expr, UnOp};
use shadow_dp::expr::simplify;
use shadow_dp::typeenv::{Distance, TypeEnv};

fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (-1000.0f64..1000.0).prop_map(Expr::num),
        "[a-z][a-z0-9]{0,3}".prop_map(Expr::id),
    ];
    leaf.prop_recursive(4, 32, 3, |inner| {
        prop_oneof![
            (unary_op(), inner.clone()).prop_map(|(op, e)| Expr::un(op, e)),
            (binary_op(), inner.clone(), inner.clone()).prop_map(|(op, l, r)| Expr::bin(op, l, r)),
            (inner.clone(), inner.clone(), inner).prop_map(|(c, t, f)| Expr::ternary(c, t, f)),
        ]
    })
}

fn unary_op() -> impl Strategy<Value = UnOp> {
    prop_oneof![Just(UnOp::Neg), Just(UnOp::Abs)]
}

fn binary_op() -> impl Strategy<Value = BinOp> {
    prop_oneof![Just(BinOp::Add), Just(BinOp::Sub), Just(BinOp::Mul)]
}

proptest! {
    /// `simplify` terminates and never panics on any tree the generator
    /// can build.
    #[test]
    fn simplify_is_total(e in arb_expr()) {
        let _ = simplify(&e);
    }

    /// `simplify` has reached a fixed point after one pass: simplifying
    /// its own output changes nothing further.
    #[test]
    fn simplify_is_idempotent(e in arb_expr()) {
        let once = simplify(&e);
        let twice = simplify(&once);
        prop_assert_eq!(once, twice);
    }
}

proptest! {
    /// Merging an environment with itself is a no-op: every entry already
    /// agrees structurally, so nothing is promoted to `*`.
    #[test]
    fn merge_with_self_is_identity(value in (-1000.0f64..1000.0)) {
        let mut env = TypeEnv::new();
        env.set("x", Distance::Value(Expr::num(value)), Distance::zero());
        let merged = env.merge(&env);
        prop_assert_eq!(merged.get("x").cloned(), env.get("x").cloned());
    }

    /// `merge` is commutative: which side is `self` and which is `other`
    /// does not affect the joined result (the join only checks structural
    /// agreement, not argument order).
    #[test]
    fn merge_is_commutative(a in (-1000.0f64..1000.0), b in (-1000.0f64..1000.0)) {
        let mut left = TypeEnv::new();
        left.set("x", Distance::Value(Expr::num(a)), Distance::zero());
        let mut right = TypeEnv::new();
        right.set("x", Distance::Value(Expr::num(b)), Distance::zero());

        let lr = left.merge(&right);
        let rl = right.merge(&left);
        prop_assert_eq!(lr.get("x").cloned(), rl.get("x").cloned());
    }
}
