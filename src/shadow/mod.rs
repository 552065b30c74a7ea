//! The shadow-branch synthesizer (§4.6): when a branch condition might
//! diverge between the aligned and shadow runs, the transformer needs a
//! second copy of the branch body that updates only the shadow-distance
//! tracking variables, so the shadow run can "catch up" without actually
//! taking the aligned branch.
//!
//! Grounded on `original_source/shadowdp/core.py`'s
//! `_ShadowBranchGenerator`, which walks a branch body keeping only
//! assignments to variables whose shadow distance is `*`, and rewrites
//! each surviving `v = e;` into
//! `__SHADOWDP_SHADOW_DISTANCE_v = (v + __SHADOWDP_SHADOW_DISTANCE_v) - e^shadow;`
//! — the new value `v` would have taken on the shadow run, expressed
//! relative to the value it actually has on the aligned run that's
//! executing.

use crate::cast::{BinOp, Expr, LValue, Statement};
use crate::error::SourceLocation;
use crate::replacer::{aux_distance_var, replace, Branch};
use crate::typeenv::{Distance, TypeEnv};

/// Synthesizes the shadow-only counterpart of `body` under `env`. Only
/// assignments to variables whose shadow distance is currently `*`
/// survive; everything else (declarations, returns, plain calls) is
/// dropped since it cannot affect a tracking variable.
pub fn synthesize(body: &[Statement], env: &TypeEnv) -> Vec<Statement> {
    body.iter().filter_map(|stmt| synthesize_statement(stmt, env)).collect()
}

fn synthesize_statement(stmt: &Statement, env: &TypeEnv) -> Option<Statement> {
    match stmt {
        Statement::Assign {
            lvalue,
            rvalue,
            location,
        } => synthesize_assign(lvalue, rvalue, location, env),

        Statement::If {
            cond,
            then_branch,
            else_branch,
            location,
        } => {
            let then_branch = synthesize(then_branch, env);
            let else_branch = else_branch.as_ref().map(|b| synthesize(b, env));
            if then_branch.is_empty() && else_branch.as_ref().map_or(true, |b| b.is_empty()) {
                None
            } else {
                Some(Statement::If {
                    cond: cond.clone(),
                    then_branch,
                    else_branch,
                    location: location.clone(),
                })
            }
        }

        Statement::While { cond, body, location } => {
            let body = synthesize(body, env);
            if body.is_empty() {
                None
            } else {
                Some(Statement::While {
                    cond: cond.clone(),
                    body,
                    location: location.clone(),
                })
            }
        }

        Statement::StringAnnotation { .. }
        | Statement::Decl { .. }
        | Statement::Return { .. }
        | Statement::Expr { .. } => None,
    }
}

/// Builds the single shadow-distance-catchup update for one assignment
/// `lvalue = rvalue`, if `lvalue`'s shadow distance is currently `*`
/// (§4.7, assignment rule step 1: emitted inline, ahead of the assignment
/// itself, whenever the path condition `pc` is set — as opposed to
/// [`synthesize`], which collects the same updates for an entire branch
/// body when the branch itself is what diverges).
pub fn shadow_catchup_for_assign(
    lvalue: &LValue,
    rvalue: &Expr,
    location: &SourceLocation,
    env: &TypeEnv,
) -> Option<Statement> {
    synthesize_assign(lvalue, rvalue, location, env)
}

fn synthesize_assign(
    lvalue: &LValue,
    rvalue: &Expr,
    location: &SourceLocation,
    env: &TypeEnv,
) -> Option<Statement> {
    let name = lvalue.name();
    let (_, shadow) = env.get(name)?;
    if !shadow.is_star() {
        return None;
    }

    let tracking_var = aux_distance_var(name, Branch::Shadow);
    let current_value = Expr::bin(BinOp::Add, Expr::id(name.to_string()), Expr::id(tracking_var.clone()));
    let shadow_rvalue = replace(rvalue, env, Branch::Shadow);
    let new_distance = Expr::bin(BinOp::Sub, current_value, shadow_rvalue);

    Some(Statement::Assign {
        lvalue: LValue::Id(tracking_var),
        rvalue: crate::expr::simplify(&new_distance),
        location: location.clone(),
    })
}

/// True iff any variable read by `cond` currently has a `*` shadow
/// distance — when this holds the transformer must assume divergence
/// without consulting the solver at all (§4.6: "if any variable in e has
/// distance `*` in shadow, divergence is assumed without invoking the
/// solver").
pub fn forces_assumed_divergence(cond: &Expr, env: &TypeEnv) -> bool {
    free_names(cond).into_iter().any(|name| match env.get(&name) {
        Some((_, shadow)) => matches!(shadow, Distance::Star),
        None => false,
    })
}

fn free_names(expr: &Expr) -> Vec<String> {
    let mut names = Vec::new();
    collect_free_names(expr, &mut names);
    names
}

fn collect_free_names(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Id(name) => out.push(name.clone()),
        Expr::ArrayRef { name, subscript } => {
            out.push(name.clone());
            collect_free_names(subscript, out);
        }
        Expr::Binary { left, right, .. } => {
            collect_free_names(left, out);
            collect_free_names(right, out);
        }
        Expr::Unary { expr, .. } => collect_free_names(expr, out),
        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => {
            collect_free_names(cond, out);
            collect_free_names(iftrue, out);
            collect_free_names(iffalse, out);
        }
        Expr::Call { args, .. } => args.iter().for_each(|a| collect_free_names(a, out)),
        Expr::Num(_) | Expr::Str(_) => {}
    }
}
