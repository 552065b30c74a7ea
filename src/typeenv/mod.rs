//! The distance type environment Γ (§4.2): an ordered map from variable
//! name to a pair of distances `(aligned, shadow)`, where a distance is
//! either a concrete expression or the unbounded marker `*`.
//!
//! Grounded on `original_source/shadowdp/typesystem.py`'s `TypeSystem`
//! class, which keeps an `OrderedDict` so that re-emission and
//! `assume`-insertion order match the order parameters and locals were
//! declared in. Rust has no ordered-map analogue of `OrderedDict` in std,
//! so insertion order is tracked explicitly with a parallel `Vec<String>`
//! alongside the lookup table, the same index-map-keyed-by-insertion trick
//! used elsewhere in this codebase to keep basic blocks in declaration
//! order.

use crate::expr::{simplify, structurally_equal};
use crate::cast::Expr;
use std::collections::HashMap;

/// A single distance: either a concrete expression or the `*` (star)
/// marker meaning "no useful bound is tracked".
#[derive(Debug, Clone, PartialEq)]
pub enum Distance {
    Star,
    Value(Expr),
}

impl Distance {
    pub fn zero() -> Distance {
        Distance::Value(Expr::num(0.0))
    }

    pub fn is_star(&self) -> bool {
        matches!(self, Distance::Star)
    }
}

/// `(aligned, shadow)` distance pair tracked for one variable.
pub type DistancePair = (Distance, Distance);

/// The ordered distance environment.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    order: Vec<String>,
    table: HashMap<String, DistancePair>,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            table: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&DistancePair> {
        self.table.get(name)
    }

    /// Same as `get`, kept distinct to mirror `get_raw_distance` /
    /// `get_distance` in the original: `get_raw` never simplifies, plain
    /// `get` callers are expected to `simplify` the result themselves.
    pub fn get_raw(&self, name: &str) -> Option<&DistancePair> {
        self.table.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, aligned: Distance, shadow: Distance) {
        let name = name.into();
        if !self.table.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.table.insert(name, (aligned, shadow));
    }

    pub fn remove(&mut self, name: &str) {
        if self.table.remove(name).is_some() {
            self.order.retain(|n| n != name);
        }
    }

    /// Replaces only the aligned component of `name`'s distance pair,
    /// leaving the shadow component untouched. Used by the
    /// distance-dependence check (§4.7, assignment rule step 2) to
    /// promote a single side to `*` without disturbing the other.
    pub fn set_aligned(&mut self, name: &str, aligned: Distance) {
        if let Some((_, shadow)) = self.table.get(name).cloned() {
            self.table.insert(name.to_string(), (aligned, shadow));
        }
    }

    /// Replaces only the shadow component; see [`TypeEnv::set_aligned`].
    pub fn set_shadow(&mut self, name: &str, shadow: Distance) {
        if let Some((aligned, _)) = self.table.get(name).cloned() {
            self.table.insert(name.to_string(), (aligned, shadow));
        }
    }

    /// Iterates entries in the order variables were first declared.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DistancePair)> {
        self.order.iter().map(move |name| (name, &self.table[name]))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Specializes every stored distance expression under a branch
    /// condition: any ternary `cond ? a : b` nested inside a distance is
    /// rewritten to `a` (if `is_true`) or `b`, structurally matching the
    /// branch's own condition. This is how Γ is refined on entry to an
    /// `if`'s two arms before the post-branch merge (§4.6).
    pub fn apply(&self, cond: &Expr, is_true: bool) -> TypeEnv {
        let mut result = TypeEnv::new();
        for name in &self.order {
            let (aligned, shadow) = &self.table[name];
            let aligned = specialize(aligned, cond, is_true);
            let shadow = specialize(shadow, cond, is_true);
            result.set(name.clone(), aligned, shadow);
        }
        result
    }

    /// Joins two environments produced by the two arms of a branch (or two
    /// consecutive loop-fixed-point iterations): a variable's distance
    /// survives only if both sides agree; otherwise it is promoted to `*`.
    pub fn merge(&self, other: &TypeEnv) -> TypeEnv {
        let mut result = TypeEnv::new();
        for name in &self.order {
            let (a1, s1) = &self.table[name];
            match other.table.get(name) {
                Some((a2, s2)) => {
                    let aligned = merge_one(a1, a2);
                    let shadow = merge_one(s1, s2);
                    result.set(name.clone(), aligned, shadow);
                }
                None => result.set(name.clone(), Distance::Star, Distance::Star),
            }
        }
        result
    }

    /// Names whose distance pair differs between `self` and `other`, used
    /// by the while-loop fixed-point iteration to detect convergence
    /// (§4.7: iterate `merge` until `diff` is empty, or bail out after a
    /// bounded number of rounds since the lattice of `*`-vs-concrete has
    /// finite height).
    pub fn diff(&self, other: &TypeEnv) -> Vec<String> {
        let mut changed = Vec::new();
        for name in &self.order {
            let mine = &self.table[name];
            match other.table.get(name) {
                Some(theirs) if distance_pair_eq(mine, theirs) => {}
                _ => changed.push(name.clone()),
            }
        }
        changed
    }
}

fn distance_pair_eq(a: &DistancePair, b: &DistancePair) -> bool {
    distance_eq(&a.0, &b.0) && distance_eq(&a.1, &b.1)
}

fn distance_eq(a: &Distance, b: &Distance) -> bool {
    match (a, b) {
        (Distance::Star, Distance::Star) => true,
        (Distance::Value(x), Distance::Value(y)) => structurally_equal(x, y),
        _ => false,
    }
}

fn merge_one(a: &Distance, b: &Distance) -> Distance {
    match (a, b) {
        (Distance::Value(x), Distance::Value(y)) if structurally_equal(x, y) => {
            Distance::Value(x.clone())
        }
        _ => Distance::Star,
    }
}

fn specialize(distance: &Distance, cond: &Expr, is_true: bool) -> Distance {
    match distance {
        Distance::Star => Distance::Star,
        Distance::Value(e) => Distance::Value(simplify(&specialize_expr(e, cond, is_true))),
    }
}

fn specialize_expr(expr: &Expr, cond: &Expr, is_true: bool) -> Expr {
    match expr {
        Expr::Ternary {
            cond: inner_cond,
            iftrue,
            iffalse,
        } if structurally_equal(inner_cond, cond) => {
            if is_true {
                specialize_expr(iftrue, cond, is_true)
            } else {
                specialize_expr(iffalse, cond, is_true)
            }
        }
        Expr::Ternary {
            cond: inner_cond,
            iftrue,
            iffalse,
        } => Expr::ternary(
            specialize_expr(inner_cond, cond, is_true),
            specialize_expr(iftrue, cond, is_true),
            specialize_expr(iffalse, cond, is_true),
        ),
        Expr::Binary { op, left, right } => Expr::bin(
            *op,
            specialize_expr(left, cond, is_true),
            specialize_expr(right, cond, is_true),
        ),
        Expr::Unary { op, expr } => Expr::un(*op, specialize_expr(expr, cond, is_true)),
        Expr::ArrayRef { name, subscript } => {
            Expr::array_ref(name.clone(), specialize_expr(subscript, cond, is_true))
        }
        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args
                .iter()
                .map(|a| specialize_expr(a, cond, is_true))
                .collect(),
        },
        Expr::Id(_) | Expr::Num(_) | Expr::Str(_) => expr.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::BinOp;

    #[test]
    fn preserves_insertion_order() {
        let mut env = TypeEnv::new();
        env.set("b", Distance::zero(), Distance::zero());
        env.set("a", Distance::zero(), Distance::zero());
        let names: Vec<&String> = env.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn merge_promotes_disagreement_to_star() {
        let mut left = TypeEnv::new();
        left.set("x", Distance::zero(), Distance::zero());
        let mut right = TypeEnv::new();
        right.set("x", Distance::Value(Expr::num(1.0)), Distance::zero());

        let merged = left.merge(&right);
        let (aligned, shadow) = merged.get("x").unwrap();
        assert!(aligned.is_star());
        assert_eq!(*shadow, Distance::zero());
    }

    #[test]
    fn apply_specializes_matching_ternary() {
        let cond = Expr::bin(BinOp::Gt, Expr::id("q0"), Expr::id("q1"));
        let mut env = TypeEnv::new();
        env.set(
            "d",
            Distance::Value(Expr::ternary(cond.clone(), Expr::num(1.0), Expr::num(-1.0))),
            Distance::zero(),
        );
        let specialized = env.apply(&cond, true);
        assert_eq!(specialized.get("d").unwrap().0, Distance::Value(Expr::num(1.0)));
    }

    #[test]
    fn diff_reports_only_changed_names() {
        let mut left = TypeEnv::new();
        left.set("x", Distance::zero(), Distance::zero());
        left.set("y", Distance::zero(), Distance::zero());
        let mut right = left.clone();
        right.set("x", Distance::Star, Distance::zero());

        assert_eq!(left.diff(&right), vec!["x".to_string()]);
    }
}
