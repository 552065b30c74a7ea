//! The SMT bridge (§4.5): translates program expressions into a small
//! formula IR and answers exactly two semantic queries the transformer
//! needs — branch divergence and sampling-injectivity — against a solver
//! reachable only through the [`Solver`] trait.
//!
//! The `Formula` shape is grounded on `src/verification/solver.rs` in
//! `renovate-bot-GoogleCloudPlatform-_-aether` (an `Eq`/`Lt`/`And`/`Implies`/
//! `Forall`/`Select` enum built for exactly this kind of narrow
//! linear-arithmetic-plus-array bridge). That file kept a `z3` dependency
//! commented out and shipped a stub that always answered `Verified`; this
//! crate instead ships a real, if deliberately narrow, decision procedure
//! (`LinearSolver`) for the bounded formula shapes the transformer itself
//! emits, and documents the `Solver` trait as the seam a genuine z3/cvc5
//! binding would plug into (§9: "a solver is assumed, not vendored").

pub mod precondition;

use crate::cast::{BinOp, Expr, UnOp};
use std::collections::BTreeMap;
use std::fmt;

/// Linear-real-arithmetic-plus-array-select formula IR.
#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    Bool(bool),
    Real(f64),
    Var(String),
    Select(Box<Formula>, Box<Formula>),
    Neg(Box<Formula>),
    Not(Box<Formula>),
    Add(Box<Formula>, Box<Formula>),
    Sub(Box<Formula>, Box<Formula>),
    Mul(Box<Formula>, Box<Formula>),
    Div(Box<Formula>, Box<Formula>),
    Eq(Box<Formula>, Box<Formula>),
    Ne(Box<Formula>, Box<Formula>),
    Lt(Box<Formula>, Box<Formula>),
    Le(Box<Formula>, Box<Formula>),
    Gt(Box<Formula>, Box<Formula>),
    Ge(Box<Formula>, Box<Formula>),
    And(Vec<Formula>),
    Or(Vec<Formula>),
    Implies(Box<Formula>, Box<Formula>),
    Ite(Box<Formula>, Box<Formula>, Box<Formula>),
    /// Universal quantification over one integer index, the only
    /// quantifier shape the transformer ever emits (§4.5).
    Forall(String, Box<Formula>),
}

impl Formula {
    pub fn var(name: impl Into<String>) -> Formula {
        Formula::Var(name.into())
    }

    pub fn select(array: impl Into<String>, index: Formula) -> Formula {
        Formula::Select(Box::new(Formula::Var(array.into())), Box::new(index))
    }

    pub fn eq(a: Formula, b: Formula) -> Formula {
        Formula::Eq(Box::new(a), Box::new(b))
    }

    pub fn and(items: Vec<Formula>) -> Formula {
        Formula::And(items)
    }

    pub fn implies(a: Formula, b: Formula) -> Formula {
        Formula::Implies(Box::new(a), Box::new(b))
    }

    pub fn forall(index: impl Into<String>, body: Formula) -> Formula {
        Formula::Forall(index.into(), Box::new(body))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Formula::Bool(b) => write!(f, "{}", b),
            Formula::Real(v) => write!(f, "{}", v),
            Formula::Var(name) => write!(f, "{}", name),
            Formula::Select(arr, idx) => write!(f, "{}[{}]", arr, idx),
            Formula::Neg(a) => write!(f, "(- {})", a),
            Formula::Not(a) => write!(f, "(not {})", a),
            Formula::Add(a, b) => write!(f, "({} + {})", a, b),
            Formula::Sub(a, b) => write!(f, "({} - {})", a, b),
            Formula::Mul(a, b) => write!(f, "({} * {})", a, b),
            Formula::Div(a, b) => write!(f, "({} / {})", a, b),
            Formula::Eq(a, b) => write!(f, "({} = {})", a, b),
            Formula::Ne(a, b) => write!(f, "({} != {})", a, b),
            Formula::Lt(a, b) => write!(f, "({} < {})", a, b),
            Formula::Le(a, b) => write!(f, "({} <= {})", a, b),
            Formula::Gt(a, b) => write!(f, "({} > {})", a, b),
            Formula::Ge(a, b) => write!(f, "({} >= {})", a, b),
            Formula::And(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "(and {})", parts.join(" "))
            }
            Formula::Or(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "(or {})", parts.join(" "))
            }
            Formula::Implies(a, b) => write!(f, "({} => {})", a, b),
            Formula::Ite(c, t, e) => write!(f, "(if {} then {} else {})", c, t, e),
            Formula::Forall(idx, body) => write!(f, "(forall (({} Int)) {})", idx, body),
        }
    }
}

/// Translates a program expression into a formula, over the real sort
/// (§4.5: "identifiers and array elements are modeled as reals").
pub fn translate(expr: &Expr) -> Formula {
    match expr {
        Expr::Num(v) => Formula::Real(v.0),
        Expr::Str(_) => Formula::Bool(true),
        Expr::Id(name) => Formula::var(name.clone()),
        Expr::ArrayRef { name, subscript } => Formula::select(name.clone(), translate(subscript)),
        Expr::Unary { op, expr } => {
            let inner = translate(expr);
            match op {
                UnOp::Neg => Formula::Neg(Box::new(inner)),
                UnOp::Not => Formula::Not(Box::new(inner)),
                UnOp::Abs => Formula::Ite(
                    Box::new(Formula::Ge(Box::new(inner.clone()), Box::new(Formula::Real(0.0)))),
                    Box::new(inner.clone()),
                    Box::new(Formula::Neg(Box::new(inner))),
                ),
            }
        }
        Expr::Binary { op, left, right } => {
            let l = Box::new(translate(left));
            let r = Box::new(translate(right));
            match op {
                BinOp::Add => Formula::Add(l, r),
                BinOp::Sub => Formula::Sub(l, r),
                BinOp::Mul => Formula::Mul(l, r),
                BinOp::Div => Formula::Div(l, r),
                BinOp::Lt => Formula::Lt(l, r),
                BinOp::Le => Formula::Le(l, r),
                BinOp::Gt => Formula::Gt(l, r),
                BinOp::Ge => Formula::Ge(l, r),
                BinOp::Eq => Formula::Eq(l, r),
                BinOp::Ne => Formula::Ne(l, r),
                BinOp::And => Formula::And(vec![*l, *r]),
                BinOp::Or => Formula::Or(vec![*l, *r]),
            }
        }
        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => Formula::Ite(
            Box::new(translate(cond)),
            Box::new(translate(iftrue)),
            Box::new(translate(iffalse)),
        ),
        // Lap/assume/assert/havoc never appear inside a pure arithmetic
        // subexpression the solver is asked about.
        Expr::Call { .. } => Formula::Bool(true),
    }
}

/// A backend capable of deciding `precondition => goal` over the fragment
/// of linear real arithmetic plus array-select that this crate's two
/// queries are drawn from.
pub trait Solver {
    /// Returns true only if `precondition implies goal` is valid. A `false`
    /// result means "not provably valid", which the transformer always
    /// treats conservatively (assume divergence / assume non-injective),
    /// matching §4.5's "when in doubt, do not invoke the solver's answer
    /// as a license to skip instrumentation".
    fn check_implication(&self, precondition: &Formula, goal: &Formula) -> bool;
}

/// A decidable-fragment backend: normalizes both sides of an equality
/// goal into a canonical linear form and checks for syntactic agreement
/// after rewriting `goal` with the equalities asserted by `precondition`.
/// This is complete for the two families of queries this crate actually
/// builds (see `precondition.rs`) and deliberately incomplete for anything
/// richer — exactly the deal the narrow `Solver` trait is meant to strike.
#[derive(Debug, Default)]
pub struct LinearSolver;

impl LinearSolver {
    pub fn new() -> Self {
        LinearSolver
    }
}

impl Solver for LinearSolver {
    fn check_implication(&self, precondition: &Formula, goal: &Formula) -> bool {
        let equalities = collect_equalities(precondition);
        let rewritten = rewrite_with_equalities(goal, &equalities);
        decide(&rewritten)
    }
}

fn collect_equalities(formula: &Formula) -> Vec<(Formula, Formula)> {
    match formula {
        Formula::Eq(a, b) => vec![((**a).clone(), (**b).clone())],
        Formula::And(items) => items.iter().flat_map(collect_equalities).collect(),
        Formula::Forall(_, body) => collect_equalities(body),
        Formula::Implies(_, consequent) => collect_equalities(consequent),
        _ => Vec::new(),
    }
}

fn rewrite_with_equalities(formula: &Formula, equalities: &[(Formula, Formula)]) -> Formula {
    for (lhs, rhs) in equalities {
        if formula == lhs {
            return rhs.clone();
        }
    }
    match formula {
        Formula::Select(arr, idx) => Formula::Select(
            Box::new(rewrite_with_equalities(arr, equalities)),
            Box::new(rewrite_with_equalities(idx, equalities)),
        ),
        Formula::Neg(a) => Formula::Neg(Box::new(rewrite_with_equalities(a, equalities))),
        Formula::Not(a) => Formula::Not(Box::new(rewrite_with_equalities(a, equalities))),
        Formula::Add(a, b) => binop(Formula::Add as fn(_, _) -> _, a, b, equalities),
        Formula::Sub(a, b) => binop(Formula::Sub as fn(_, _) -> _, a, b, equalities),
        Formula::Mul(a, b) => binop(Formula::Mul as fn(_, _) -> _, a, b, equalities),
        Formula::Div(a, b) => binop(Formula::Div as fn(_, _) -> _, a, b, equalities),
        Formula::Eq(a, b) => binop(Formula::Eq as fn(_, _) -> _, a, b, equalities),
        Formula::Ne(a, b) => binop(Formula::Ne as fn(_, _) -> _, a, b, equalities),
        Formula::Lt(a, b) => binop(Formula::Lt as fn(_, _) -> _, a, b, equalities),
        Formula::Le(a, b) => binop(Formula::Le as fn(_, _) -> _, a, b, equalities),
        Formula::Gt(a, b) => binop(Formula::Gt as fn(_, _) -> _, a, b, equalities),
        Formula::Ge(a, b) => binop(Formula::Ge as fn(_, _) -> _, a, b, equalities),
        Formula::And(items) => Formula::And(
            items
                .iter()
                .map(|i| rewrite_with_equalities(i, equalities))
                .collect(),
        ),
        Formula::Or(items) => Formula::Or(
            items
                .iter()
                .map(|i| rewrite_with_equalities(i, equalities))
                .collect(),
        ),
        Formula::Implies(a, b) => Formula::Implies(
            Box::new(rewrite_with_equalities(a, equalities)),
            Box::new(rewrite_with_equalities(b, equalities)),
        ),
        Formula::Ite(c, t, e) => Formula::Ite(
            Box::new(rewrite_with_equalities(c, equalities)),
            Box::new(rewrite_with_equalities(t, equalities)),
            Box::new(rewrite_with_equalities(e, equalities)),
        ),
        Formula::Forall(idx, body) => {
            Formula::Forall(idx.clone(), Box::new(rewrite_with_equalities(body, equalities)))
        }
        Formula::Bool(_) | Formula::Real(_) | Formula::Var(_) => formula.clone(),
    }
}

fn binop(
    ctor: fn(Box<Formula>, Box<Formula>) -> Formula,
    a: &Formula,
    b: &Formula,
    equalities: &[(Formula, Formula)],
) -> Formula {
    ctor(
        Box::new(rewrite_with_equalities(a, equalities)),
        Box::new(rewrite_with_equalities(b, equalities)),
    )
}

/// Attempts to decide a (rewritten) goal formula. Only equalities over
/// linear combinations are handled; anything else is "not provably valid".
fn decide(formula: &Formula) -> bool {
    match formula {
        Formula::Bool(b) => *b,
        Formula::Eq(a, b) => match (linearize(a), linearize(b)) {
            (Some(lhs), Some(rhs)) => linear_forms_equal(&lhs, &rhs),
            _ => false,
        },
        Formula::And(items) => items.iter().all(decide),
        Formula::Implies(a, b) => decide_implication(a, b),
        Formula::Forall(_, body) => decide(body),
        _ => false,
    }
}

/// Decides `hypothesis => consequent`. A vacuously-false hypothesis or an
/// unconditionally-true consequent closes it immediately; otherwise the
/// only case this narrow backend can discharge is the one both domain
/// queries actually need (injectivity, branch-divergence): hypothesis and
/// consequent are both linear equalities, and the hyperplane the
/// hypothesis pins down forces the consequent's — i.e. `consequent`'s
/// `lhs - rhs` is a scalar multiple of the hypothesis's. Anything else is
/// "not provably valid" rather than a true negative: this backend never
/// asserts an implication is invalid, only that it couldn't prove it.
fn decide_implication(hypothesis: &Formula, consequent: &Formula) -> bool {
    if matches!(hypothesis, Formula::Bool(false)) {
        return true;
    }
    if decide(consequent) {
        return true;
    }
    if let (Formula::Eq(h_lhs, h_rhs), Formula::Eq(c_lhs, c_rhs)) = (hypothesis, consequent) {
        if let (Some(hl), Some(hr), Some(cl), Some(cr)) =
            (linearize(h_lhs), linearize(h_rhs), linearize(c_lhs), linearize(c_rhs))
        {
            let hypothesis_diff = add_forms(&hl, &scale(&hr, -1.0));
            let consequent_diff = add_forms(&cl, &scale(&cr, -1.0));
            if is_scalar_multiple(&hypothesis_diff, &consequent_diff) {
                return true;
            }
        }
    }
    false
}

/// True iff `consequent` equals `k * hypothesis` for some nonzero `k`,
/// i.e. the linear equation `hypothesis = 0` and `consequent = 0` define
/// the same hyperplane (so the first implies the second).
fn is_scalar_multiple(hypothesis: &LinearForm, consequent: &LinearForm) -> bool {
    let mut keys: Vec<&String> = hypothesis.keys().chain(consequent.keys()).collect();
    keys.sort();
    keys.dedup();
    let mut ratio: Option<f64> = None;
    for key in keys {
        let h = hypothesis.get(key).copied().unwrap_or(0.0);
        let c = consequent.get(key).copied().unwrap_or(0.0);
        if h.abs() < 1e-9 {
            if c.abs() > 1e-9 {
                return false;
            }
            continue;
        }
        let r = c / h;
        match ratio {
            None => ratio = Some(r),
            Some(existing) if (existing - r).abs() > 1e-9 => return false,
            _ => {}
        }
    }
    ratio.is_some()
}

type LinearForm = BTreeMap<String, f64>;

fn linear_forms_equal(a: &LinearForm, b: &LinearForm) -> bool {
    let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.iter().all(|k| {
        let av = a.get(*k).copied().unwrap_or(0.0);
        let bv = b.get(*k).copied().unwrap_or(0.0);
        (av - bv).abs() < 1e-9
    })
}

const CONST_KEY: &str = "__const__";

fn linearize(formula: &Formula) -> Option<LinearForm> {
    match formula {
        Formula::Real(v) => Some(BTreeMap::from([(CONST_KEY.to_string(), *v)])),
        Formula::Var(name) => Some(BTreeMap::from([(name.clone(), 1.0)])),
        Formula::Select(_, _) => Some(BTreeMap::from([(formula.to_string(), 1.0)])),
        Formula::Neg(a) => linearize(a).map(|m| scale(&m, -1.0)),
        Formula::Add(a, b) => Some(add_forms(&linearize(a)?, &linearize(b)?)),
        Formula::Sub(a, b) => Some(add_forms(&linearize(a)?, &scale(&linearize(b)?, -1.0))),
        Formula::Mul(a, b) => {
            let la = linearize(a);
            let lb = linearize(b);
            match (la, lb) {
                (Some(ca), Some(lb)) if is_constant(&ca) => {
                    Some(scale(&lb, constant_value(&ca)))
                }
                (Some(la), Some(cb)) if is_constant(&cb) => {
                    Some(scale(&la, constant_value(&cb)))
                }
                _ => None,
            }
        }
        Formula::Div(a, b) => {
            let cb = linearize(b)?;
            if is_constant(&cb) && constant_value(&cb) != 0.0 {
                Some(scale(&linearize(a)?, 1.0 / constant_value(&cb)))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_constant(form: &LinearForm) -> bool {
    form.keys().all(|k| k == CONST_KEY)
}

fn constant_value(form: &LinearForm) -> f64 {
    form.get(CONST_KEY).copied().unwrap_or(0.0)
}

fn scale(form: &LinearForm, factor: f64) -> LinearForm {
    form.iter().map(|(k, v)| (k.clone(), v * factor)).collect()
}

fn add_forms(a: &LinearForm, b: &LinearForm) -> LinearForm {
    let mut result = a.clone();
    for (k, v) in b {
        *result.entry(k.clone()).or_insert(0.0) += v;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_array_ref_to_select() {
        let e = Expr::array_ref("q", Expr::id("i"));
        assert_eq!(translate(&e), Formula::select("q", Formula::var("i")));
    }

    #[test]
    fn proves_trivial_equality() {
        let solver = LinearSolver::new();
        let goal = Formula::eq(Formula::var("x"), Formula::var("x"));
        assert!(solver.check_implication(&Formula::Bool(true), &goal));
    }

    #[test]
    fn uses_precondition_equality_to_close_the_gap() {
        let solver = LinearSolver::new();
        let pre = Formula::forall(
            "i",
            Formula::eq(Formula::select("shadow_q", Formula::var("i")), Formula::select("aligned_q", Formula::var("i"))),
        );
        let goal = Formula::eq(
            Formula::select("shadow_q", Formula::var("i")),
            Formula::select("aligned_q", Formula::var("i")),
        );
        assert!(solver.check_implication(&pre, &goal));
    }

    #[test]
    fn refuses_to_prove_unrelated_equality() {
        let solver = LinearSolver::new();
        let goal = Formula::eq(Formula::var("x"), Formula::var("y"));
        assert!(!solver.check_implication(&Formula::Bool(true), &goal));
    }

    #[test]
    fn equality_hypothesis_discharges_proportional_consequent() {
        // 2x = 2y proportionally forces x = y even though neither side is
        // literally restated: this is exactly the shape the injectivity
        // query builds (§4.5).
        let solver = LinearSolver::new();
        let hypothesis = Formula::eq(
            Formula::Mul(Box::new(Formula::Real(2.0)), Box::new(Formula::var("x"))),
            Formula::Mul(Box::new(Formula::Real(2.0)), Box::new(Formula::var("y"))),
        );
        let goal = Formula::implies(hypothesis, Formula::eq(Formula::var("x"), Formula::var("y")));
        assert!(solver.check_implication(&Formula::Bool(true), &goal));
    }

    #[test]
    fn equality_hypothesis_with_extra_freedom_does_not_discharge_consequent() {
        // x + z = y + z carries no information forcing x = y once z is a
        // free variable on both sides of the same value — the hypothesis
        // does not pin the x/y hyperplane down, so this must stay unproved.
        let solver = LinearSolver::new();
        let hypothesis = Formula::eq(
            Formula::Add(Box::new(Formula::var("x")), Box::new(Formula::var("z"))),
            Formula::var("y"),
        );
        let goal = Formula::implies(hypothesis, Formula::eq(Formula::var("x"), Formula::var("y")));
        assert!(!solver.check_implication(&Formula::Bool(true), &goal));
    }
}
