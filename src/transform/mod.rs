//! The transformer core driver (§4.7): the syntax-directed visitor that
//! turns a plain function into its shadow-execution-instrumented form,
//! threading the distance environment Γ through declarations,
//! assignments, branches and loops, and emitting the `assume`/`assert`
//! statements and privacy-cost bookkeeping the external verifier checks.
//!
//! Grounded on `original_source/shadowdp/core.py`'s `ShadowDPTransformer`
//! (`visit_FuncDef`/`visit_Decl`/`visit_Assignment`/`visit_If`/
//! `visit_While`/`visit_Return`), reshaped around explicit `Vec<Statement>`
//! blocks instead of parent pointers (§9) and a `Result`-returning visitor
//! instead of the original's exception-raising one, in the style
//! `renovate-bot-GoogleCloudPlatform-_-aether`'s own MIR-building passes
//! thread a build context through a tree and bail out with `?`.

pub mod annotation;

use crate::cast::{BinOp, Expr, Function, LValue, Param, Program, Statement, Type, UnOp};
use crate::distance::distance_of;
use crate::error::{AnnotationError, CapabilityError, SemanticError, SourceLocation, TransformError};
use crate::expr::{occurs_free, structurally_equal};
use crate::replacer::{aux_distance_var, replace, Branch};
use crate::shadow;
use crate::smt::precondition::{adjacency_precondition, branch_diverges, eta_distance_injective, Adjacency};
use crate::smt::{Formula, Solver};
use crate::typeenv::{Distance, TypeEnv};
use log::{debug, trace};
use std::collections::HashSet;

pub const V_EPSILON: &str = "__SHADOWDP_v_epsilon";
pub const INDEX_PARAM: &str = "__SHADOWDP_index";
const MAX_FIXED_POINT_ITERATIONS: usize = 64;

/// Summary of what the transformer did, returned alongside the
/// instrumented program for the CLI/report surface (§6.4).
#[derive(Debug, Clone)]
pub struct TransformReport {
    pub adjacency: Adjacency,
    pub auxiliary_params_added: Vec<String>,
    pub auxiliary_locals_added: Vec<String>,
    pub lap_calls_instrumented: usize,
    pub no_shadow: bool,
}

struct Transformer<'a> {
    solver: &'a dyn Solver,
    adjacency: Adjacency,
    query_param: Option<String>,
    size_param: Option<String>,
    epsilon_param: Option<String>,
    index_param: Option<String>,
    no_shadow: bool,
    /// True on paths where the aligned and shadow executions may have
    /// already taken different branches (§4.7, `pc`). Disables sampling
    /// and forces newly-computed shadow distances to `*`.
    pc: bool,
    lap_calls: usize,
    random_variables: HashSet<String>,
    /// Every `(name, side)` ever promoted to `*` during the pass, in
    /// first-promoted order, so the function epilogue can declare one
    /// auxiliary scalar per entry regardless of which branch the
    /// promotion happened on (§4.7: "a local's `*` distance is
    /// materialized as a scalar auxiliary variable declared at function
    /// entry" — emitted once traversal has finished, per §9's design
    /// note that parameter/local emission order follows Γ's insertion
    /// order, not discovery order within a single branch).
    starred_locals: Vec<(String, Branch)>,
    seen_starred: HashSet<(String, Branch)>,
    /// The goal multiplier `k` in the final `v_epsilon <= k * epsilon`
    /// assertion (§6.4).
    goal: f64,
    /// True iff the query parameter itself carries a `*` distance, i.e. it
    /// has materialized distance-array auxiliaries to read from (§4.7,
    /// `inserted_query_assumes`'s precondition — asking for an adjacency
    /// assume on an index into `q` is only meaningful once those arrays
    /// exist).
    query_is_star: bool,
    /// Per-scope stack of query subscripts an adjacency `assume` has already
    /// been emitted for, so the same index isn't asserted twice within one
    /// block (§4.7, `inserted_query_assumes`). One scope is pushed per `if`
    /// arm and popped when that arm's body finishes.
    inserted_query_assumes: Vec<Vec<Expr>>,
}

impl<'a> Transformer<'a> {
    fn mark_starred(&mut self, name: &str, branch: Branch) {
        let key = (name.to_string(), branch);
        if self.seen_starred.insert(key.clone()) {
            self.starred_locals.push(key);
        }
    }
}

/// Transforms `program`'s single function into its instrumented form,
/// with the default goal multiplier `k = 1` (§6.4: final assertion is
/// `v_epsilon <= k * epsilon`).
pub fn transform_program(program: &Program, solver: &dyn Solver) -> Result<(Program, TransformReport), TransformError> {
    transform_program_with_goal(program, solver, 1.0)
}

/// Same as [`transform_program`] but with an explicit goal multiplier `k`,
/// as exposed on the CLI's `transform`/`verify`/`check` subcommands.
pub fn transform_program_with_goal(
    program: &Program,
    solver: &dyn Solver,
    goal: f64,
) -> Result<(Program, TransformReport), TransformError> {
    let function = &program.function;
    let (adjacency, param_annotations, rest) = parse_leading_annotations(&function.body)?;
    let no_shadow = !any_lap_mentions_shadow(rest);

    let mut env = TypeEnv::new();
    for annotation in &param_annotations {
        env.set(annotation.name.clone(), annotation.aligned.clone(), annotation.shadow.clone());
    }
    for annotation in &param_annotations {
        if annotation.aligned != annotation.shadow {
            return Err(AnnotationError::AsymmetricParameterDistance {
                name: annotation.name.clone(),
                aligned: format!("{:?}", annotation.aligned),
                shadow: format!("{:?}", annotation.shadow),
                location: function.location.clone(),
            }
            .into());
        }
    }
    for param in &function.params {
        if !env.contains(&param.name) {
            return Err(AnnotationError::UnannotatedParameter {
                name: param.name.clone(),
                location: param.location.clone(),
            }
            .into());
        }
    }

    let query_param = function
        .params
        .iter()
        .find(|p| matches!(p.ty, Type::Array(_)))
        .map(|p| p.name.clone());
    let size_param = function
        .params
        .iter()
        .find(|p| matches!(p.ty, Type::Int) && Some(&p.name) != query_param.as_ref() && p.name != "epsilon")
        .map(|p| p.name.clone());
    let epsilon_param = function
        .params
        .iter()
        .find(|p| p.name == "epsilon")
        .map(|p| p.name.clone());

    debug!(
        "transforming '{}': adjacency={:?} query={:?} size={:?} epsilon={:?}",
        function.name, adjacency, query_param, size_param, epsilon_param
    );

    let query_is_star = query_param
        .as_ref()
        .and_then(|q| param_annotations.iter().find(|a| &a.name == q))
        .is_some_and(|a| matches!(a.aligned, Distance::Star));

    let mut transformer = Transformer {
        solver,
        adjacency,
        query_param: query_param.clone(),
        size_param: size_param.clone(),
        epsilon_param: epsilon_param.clone(),
        index_param: if adjacency == Adjacency::OneDiffer {
            Some(INDEX_PARAM.to_string())
        } else {
            None
        },
        no_shadow,
        pc: false,
        lap_calls: 0,
        random_variables: HashSet::new(),
        starred_locals: Vec::new(),
        seen_starred: HashSet::new(),
        goal,
        query_is_star,
        inserted_query_assumes: vec![Vec::new()],
    };

    let mut params = function.params.clone();
    if let Some(index_param) = transformer.index_param.clone() {
        params.push(Param {
            name: index_param.clone(),
            ty: Type::Int,
            location: function.location.clone(),
        });
    }

    let mut auxiliary_params_added = Vec::new();
    let mut param_star_names: HashSet<String> = HashSet::new();
    for annotation in &param_annotations {
        if matches!(annotation.aligned, Distance::Star) {
            param_star_names.insert(annotation.name.clone());
            // A `*`-tracked array parameter (the query `q`) needs a
            // distance-array parameter, not a scalar, one per index (§6.2).
            let aux_ty = match function.params.iter().find(|p| p.name == annotation.name) {
                Some(p) if matches!(p.ty, Type::Array(_)) => Type::Array(Box::new(Type::Float)),
                _ => Type::Float,
            };
            for branch in [Branch::Aligned, Branch::Shadow] {
                let aux_name = aux_distance_var(&annotation.name, branch);
                params.push(Param {
                    name: aux_name.clone(),
                    ty: aux_ty.clone(),
                    location: function.location.clone(),
                });
                auxiliary_params_added.push(aux_name);
            }
        }
    }

    let instrumented_body = transformer.visit_block(rest, &mut env)?;

    let mut prologue = Vec::new();
    if let Some(epsilon) = &epsilon_param {
        prologue.push(assume(gt_zero(epsilon), &function.location));
    }
    if let Some(size) = &size_param {
        prologue.push(assume(gt_zero(size), &function.location));
    }
    if let Some(index_param) = &transformer.index_param {
        if let Some(size) = &size_param {
            prologue.push(assume(
                Expr::bin(BinOp::Ge, Expr::id(index_param.clone()), Expr::num(0.0)),
                &function.location,
            ));
            prologue.push(assume(
                Expr::bin(BinOp::Lt, Expr::id(index_param.clone()), Expr::id(size.clone())),
                &function.location,
            ));
        }
    }
    prologue.push(Statement::Decl {
        name: V_EPSILON.to_string(),
        ty: Type::Float,
        init: Some(Expr::num(0.0)),
        location: function.location.clone(),
    });

    let mut auxiliary_locals_added = Vec::new();
    for (name, branch) in &transformer.starred_locals {
        if param_star_names.contains(name) {
            // Already materialized as an extra array/scalar parameter above.
            continue;
        }
        let aux_name = aux_distance_var(name, *branch);
        prologue.push(Statement::Decl {
            name: aux_name.clone(),
            ty: Type::Float,
            init: Some(Expr::num(0.0)),
            location: function.location.clone(),
        });
        auxiliary_locals_added.push(aux_name);
    }

    let mut body = prologue;
    body.extend(instrumented_body);

    let report = TransformReport {
        adjacency,
        auxiliary_params_added,
        auxiliary_locals_added,
        lap_calls_instrumented: transformer.lap_calls,
        no_shadow,
    };

    let transformed = Function {
        name: function.name.clone(),
        params,
        return_type: function.return_type.clone(),
        body,
        location: function.location.clone(),
    };

    Ok((Program { function: transformed }, report))
}

struct ParsedParamAnnotation {
    name: String,
    aligned: Distance,
    shadow: Distance,
}

fn parse_leading_annotations(
    body: &[Statement],
) -> Result<(Adjacency, Vec<ParsedParamAnnotation>, &[Statement]), TransformError> {
    if body.len() < 2 {
        return Err(AnnotationError::MissingParameterAnnotation {
            location: SourceLocation::unknown(),
        }
        .into());
    }
    let adjacency_text = match &body[0] {
        Statement::StringAnnotation { text, .. } => text.clone(),
        other => {
            return Err(AnnotationError::MissingParameterAnnotation {
                location: other.location().clone(),
            }
            .into())
        }
    };
    let params_text = match &body[1] {
        Statement::StringAnnotation { text, .. } => text.clone(),
        other => {
            return Err(AnnotationError::MissingParameterAnnotation {
                location: other.location().clone(),
            }
            .into())
        }
    };

    let location = body[0].location().clone();
    let adjacency = annotation::parse_adjacency(&adjacency_text, &location)?;
    let parsed = annotation::parse_parameter_annotations(&params_text, &location)?
        .into_iter()
        .map(|p| ParsedParamAnnotation {
            name: p.name,
            aligned: p.aligned,
            shadow: p.shadow,
        })
        .collect();

    Ok((adjacency, parsed, &body[2..]))
}

/// True iff some `Lap` call reachable from `body` carries a selector
/// mentioning the literal word `SHADOW` (§4.7: `no_shadow` is set true iff
/// no such annotation exists, which then disables all shadow-side work).
/// `Lap` only ever appears as a declaration initializer in this AST (§3),
/// so the walk only needs to look there, recursing into `if`/`while`
/// bodies for nested declarations.
fn any_lap_mentions_shadow(body: &[Statement]) -> bool {
    body.iter().any(|stmt| match stmt {
        Statement::Decl { init: Some(init), .. } => expr_is_shadow_lap(init),
        Statement::If {
            then_branch,
            else_branch,
            ..
        } => any_lap_mentions_shadow(then_branch) || else_branch.as_deref().is_some_and(any_lap_mentions_shadow),
        Statement::While { body, .. } => any_lap_mentions_shadow(body),
        _ => false,
    })
}

fn expr_is_shadow_lap(expr: &Expr) -> bool {
    match expr {
        Expr::Call { name, args } if name == "Lap" => {
            matches!(args.get(1), Some(Expr::Str(text)) if text.contains("SHADOW"))
        }
        _ => false,
    }
}

fn gt_zero(name: &str) -> Expr {
    Expr::bin(BinOp::Gt, Expr::id(name.to_string()), Expr::num(0.0))
}

fn assume(cond: Expr, location: &SourceLocation) -> Statement {
    Statement::Expr {
        expr: Expr::Call {
            name: "assume".to_string(),
            args: vec![cond],
        },
        location: location.clone(),
    }
}

fn assert_stmt(cond: Expr, location: &SourceLocation) -> Statement {
    Statement::Expr {
        expr: Expr::Call {
            name: "assert".to_string(),
            args: vec![cond],
        },
        location: location.clone(),
    }
}

/// Renders `name`'s distance on `branch` as an expression usable in a
/// substitution: the concrete tree if known, otherwise a read of its
/// already-materialized auxiliary tracking variable (§4.3, unwrapping `*`
/// the same way the distance generator does for identifiers).
fn distance_expr(name: &str, distance: &Distance, branch: Branch) -> Expr {
    match distance {
        Distance::Value(e) => e.clone(),
        Distance::Star => Expr::id(aux_distance_var(name, branch)),
    }
}

/// Builds the materializing assignment `__<SIDE>_DIST_w = <previous distance>`
/// that freezes a variable's about-to-be-stale distance into its auxiliary
/// tracking variable just before the dependency that invalidates it takes
/// effect (§4.7, assignment rule step 2).
fn materialize(name: &str, branch: Branch, previous: &Expr, location: &SourceLocation) -> Statement {
    Statement::Assign {
        lvalue: LValue::Id(aux_distance_var(name, branch)),
        rvalue: previous.clone(),
        location: location.clone(),
    }
}

/// Walks `expr` collecting the distinct subscripts of any `ArrayRef` naming
/// `query`, `aligned_aux`, or `shadow_aux` (§4.7: a reference to the query
/// array by value or by either side's materialized distance array both
/// require the same adjacency hypothesis at that index).
fn collect_query_array_refs(expr: &Expr, query: &str, aligned_aux: &str, shadow_aux: &str, out: &mut Vec<Expr>) {
    match expr {
        Expr::ArrayRef { name, subscript } => {
            if name == query || name == aligned_aux || name == shadow_aux {
                if !out.iter().any(|seen| structurally_equal(seen, subscript)) {
                    out.push((**subscript).clone());
                }
            }
            collect_query_array_refs(subscript, query, aligned_aux, shadow_aux, out);
        }
        Expr::Binary { left, right, .. } => {
            collect_query_array_refs(left, query, aligned_aux, shadow_aux, out);
            collect_query_array_refs(right, query, aligned_aux, shadow_aux, out);
        }
        Expr::Unary { expr, .. } => collect_query_array_refs(expr, query, aligned_aux, shadow_aux, out),
        Expr::Ternary { cond, iftrue, iffalse } => {
            collect_query_array_refs(cond, query, aligned_aux, shadow_aux, out);
            collect_query_array_refs(iftrue, query, aligned_aux, shadow_aux, out);
            collect_query_array_refs(iffalse, query, aligned_aux, shadow_aux, out);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_query_array_refs(arg, query, aligned_aux, shadow_aux, out);
            }
        }
        Expr::Id(_) | Expr::Num(_) | Expr::Str(_) => {}
    }
}

/// Builds the adjacency-hypothesis `assume` statement(s) for one query
/// subscript (§4.7/§8, grounded on `original_source/shadowdp/core.py`'s
/// `_assume_query`): under `ALL_DIFFER` every index may move by at most 1
/// between the aligned and shadow databases, so the bound applies
/// unconditionally; under `ONE_DIFFER` only the distinguished index may
/// move at all, every other index is exactly equal between runs.
fn query_assume_statements(
    adjacency: Adjacency,
    query: &str,
    index_param: Option<&str>,
    subscript: &Expr,
    location: &SourceLocation,
) -> Vec<Statement> {
    let aligned = Expr::array_ref(aux_distance_var(query, Branch::Aligned), subscript.clone());
    let shadow = Expr::array_ref(aux_distance_var(query, Branch::Shadow), subscript.clone());
    let bounded = vec![
        assume(Expr::bin(BinOp::Le, aligned.clone(), Expr::num(1.0)), location),
        assume(Expr::bin(BinOp::Ge, aligned.clone(), Expr::num(-1.0)), location),
        assume(Expr::bin(BinOp::Eq, shadow.clone(), aligned.clone()), location),
    ];
    match adjacency {
        Adjacency::AllDiffer => bounded,
        Adjacency::OneDiffer => {
            let Some(index_param) = index_param else { return bounded };
            let at_index = Expr::bin(BinOp::Eq, subscript.clone(), Expr::id(index_param.to_string()));
            let elsewhere = vec![
                assume(Expr::bin(BinOp::Eq, shadow, aligned.clone()), location),
                assume(Expr::bin(BinOp::Eq, aligned, Expr::num(0.0)), location),
            ];
            vec![Statement::If {
                cond: at_index,
                then_branch: bounded,
                else_branch: Some(elsewhere),
                location: location.clone(),
            }]
        }
    }
}

impl<'a> Transformer<'a> {
    fn current_precondition(&self) -> Formula {
        match (&self.query_param, &self.size_param) {
            (Some(query), Some(size)) => adjacency_precondition(
                self.adjacency,
                query,
                query,
                &Expr::id(size.clone()),
                self.index_param.as_deref(),
            ),
            _ => Formula::Bool(true),
        }
    }

    /// Collects the distinct subscripts `expr` reads the query parameter
    /// (or one of its `*`-materialized distance arrays) at, in the order
    /// encountered. These are the indices a runtime adjacency hypothesis is
    /// needed for before `expr` can be verified (§4.7, `_assume_query`'s
    /// scan of the instrumented cost/condition/materialized-distance
    /// expression for query-array reads).
    fn query_array_refs(&self, expr: &Expr) -> Vec<Expr> {
        let mut out = Vec::new();
        let Some(query) = self.query_param.clone() else {
            return out;
        };
        if !self.query_is_star {
            return out;
        }
        let aligned_aux = aux_distance_var(&query, Branch::Aligned);
        let shadow_aux = aux_distance_var(&query, Branch::Shadow);
        collect_query_array_refs(expr, &query, &aligned_aux, &shadow_aux, &mut out);
        out
    }

    /// Emits the `assume` statements backing each subscript in `subscripts`,
    /// skipping any already emitted in the current scope (top of
    /// `inserted_query_assumes`).
    fn emit_query_assumes(&mut self, subscripts: Vec<Expr>, location: &SourceLocation) -> Vec<Statement> {
        if subscripts.is_empty() {
            return Vec::new();
        }
        let Some(query) = self.query_param.clone() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for subscript in subscripts {
            let scope = self.inserted_query_assumes.last_mut().expect("scope stack is never empty");
            if scope.iter().any(|seen| structurally_equal(seen, &subscript)) {
                continue;
            }
            scope.push(subscript.clone());
            out.extend(query_assume_statements(self.adjacency, &query, self.index_param.as_deref(), &subscript, location));
        }
        out
    }

    /// Scans `expr` for query-array reads and emits their adjacency assumes
    /// in one step; the common case at every call site listed in §4.7.
    fn query_index_assumes(&mut self, expr: &Expr, location: &SourceLocation) -> Vec<Statement> {
        let subscripts = self.query_array_refs(expr);
        self.emit_query_assumes(subscripts, location)
    }

    fn visit_block(&mut self, stmts: &[Statement], env: &mut TypeEnv) -> Result<Vec<Statement>, TransformError> {
        let mut out = Vec::new();
        for stmt in stmts {
            out.extend(self.visit_statement(stmt, env)?);
        }
        Ok(out)
    }

    fn visit_statement(&mut self, stmt: &Statement, env: &mut TypeEnv) -> Result<Vec<Statement>, TransformError> {
        match stmt {
            Statement::StringAnnotation { .. } => Ok(vec![stmt.clone()]),
            Statement::Decl {
                name,
                ty,
                init,
                location,
            } => self.visit_decl(name, ty, init.as_ref(), location, env),
            Statement::Assign {
                lvalue,
                rvalue,
                location,
            } => self.visit_assign(lvalue, rvalue, location, env),
            Statement::If {
                cond,
                then_branch,
                else_branch,
                location,
            } => self.visit_if(cond, then_branch, else_branch.as_deref(), location, env),
            Statement::While { cond, body, location } => self.visit_while(cond, body, location, env),
            Statement::Return { expr, location } => self.visit_return(expr, location, env),
            Statement::Expr { expr, location } => Ok(vec![Statement::Expr {
                expr: expr.clone(),
                location: location.clone(),
            }]),
        }
    }

    fn visit_decl(
        &mut self,
        name: &str,
        ty: &Type,
        init: Option<&Expr>,
        location: &SourceLocation,
        env: &mut TypeEnv,
    ) -> Result<Vec<Statement>, TransformError> {
        let Some(init) = init else {
            env.set(name.to_string(), Distance::zero(), Distance::zero());
            return Ok(vec![Statement::Decl {
                name: name.to_string(),
                ty: ty.clone(),
                init: None,
                location: location.clone(),
            }]);
        };

        if let Expr::Call { name: callee, args } = init {
            if callee == "Lap" {
                return self.visit_sampling(name, ty, args, location, env);
            }
        }

        let (aligned, mut shadow) = distance_of(init, env);
        if self.pc {
            // Under a diverging path condition the shadow run may not be
            // taking this declaration at all; its distance can no longer
            // be expressed symbolically (§4.7, declaration rule).
            if shadow != Distance::Star {
                self.mark_starred(name, Branch::Shadow);
            }
            shadow = Distance::Star;
        }
        env.set(name.to_string(), aligned, shadow);
        Ok(vec![Statement::Decl {
            name: name.to_string(),
            ty: ty.clone(),
            init: Some(init.clone()),
            location: location.clone(),
        }])
    }

    fn visit_sampling(
        &mut self,
        name: &str,
        ty: &Type,
        args: &[Expr],
        location: &SourceLocation,
        env: &mut TypeEnv,
    ) -> Result<Vec<Statement>, TransformError> {
        if self.pc && !self.no_shadow {
            return Err(SemanticError::SamplingMisplaced {
                location: location.clone(),
            }
            .into());
        }

        let scale = args.first().cloned().ok_or_else(|| AnnotationError::MissingSamplingAnnotation {
            location: location.clone(),
        })?;
        let annotation_text = match args.get(1) {
            Some(Expr::Str(text)) => text.clone(),
            _ => {
                return Err(AnnotationError::MissingSamplingAnnotation {
                    location: location.clone(),
                }
                .into())
            }
        };
        let annotation = annotation::parse_sampling_annotation(&annotation_text, location)?;
        let selector = annotation.selector;
        let eta_distance = annotation.eta_distance;

        let precondition = self.current_precondition();
        let injective = eta_distance_injective(&precondition, name, &eta_distance, self.solver);
        if !injective {
            return Err(SemanticError::NonInjectiveAnnotation {
                eta_distance: format!("{:?}", eta_distance),
                location: location.clone(),
            }
            .into());
        }

        trace!("Lap sampling '{}' scale={:?} eta_distance={:?}", name, scale, eta_distance);

        self.random_variables.insert(name.to_string());
        // (d) the sampled variable's aligned distance is the eta-distance
        // itself; its shadow distance is always 0 (§4.7/§8, the alignment
        // shifts only the aligned run's random choice).
        env.set(name.to_string(), Distance::Value(eta_distance.clone()), Distance::zero());

        // (e) every other non-random, non-parameter variable whose aligned
        // and shadow distances currently differ gets its aligned distance
        // rewritten through the selector, substituting the literal
        // identifiers ALIGNED/SHADOW with that variable's own current
        // aligned/shadow distance (structurally, per §9 — not the
        // original's string `.replace`).
        let protected: HashSet<String> = [
            self.query_param.clone(),
            self.size_param.clone(),
            self.epsilon_param.clone(),
            self.index_param.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        let names: Vec<String> = env.names().to_vec();
        for other in names {
            if other == name || self.random_variables.contains(&other) || protected.contains(&other) {
                continue;
            }
            let Some((aligned, shadow)) = env.get(&other).cloned() else {
                continue;
            };
            if aligned == shadow {
                continue;
            }
            let aligned_expr = distance_expr(&other, &aligned, Branch::Aligned);
            let shadow_expr = distance_expr(&other, &shadow, Branch::Shadow);
            let substituted = crate::expr::substitute(&selector, "ALIGNED", &aligned_expr);
            let substituted = crate::expr::substitute(&substituted, "SHADOW", &shadow_expr);
            env.set_aligned(&other, Distance::Value(crate::expr::simplify(&substituted)));
        }

        self.lap_calls += 1;

        let mut out: Vec<Statement> = annotation
            .extra_assumes
            .into_iter()
            .map(|cond| assume(cond, location))
            .collect();

        out.push(Statement::Decl {
            name: name.to_string(),
            ty: ty.clone(),
            init: Some(Expr::Call {
                name: "havoc".to_string(),
                args: vec![],
            }),
            location: location.clone(),
        });

        // (f) combine the running cost with the selector's own
        // ALIGNED/SHADOW-substituted contribution, mirroring the
        // original's `selector[ALIGNED->v_epsilon, SHADOW->0] + cost`.
        let cost = cost_expression(&eta_distance, &scale);
        let selector_term = crate::expr::substitute(&selector, "SHADOW", &Expr::num(0.0));
        let selector_term = crate::expr::substitute(&selector_term, "ALIGNED", &Expr::id(V_EPSILON.to_string()));
        let new_v_epsilon = crate::expr::simplify(&Expr::bin(BinOp::Add, selector_term, cost));

        // Any query subscript the cost update reads needs its adjacency
        // hypothesis in scope before the final bound on `v_epsilon` can be
        // verified (§4.7 declaration rule, step f).
        let query_assumes = self.query_index_assumes(&new_v_epsilon, location);
        out.splice(0..0, query_assumes);

        out.push(Statement::Assign {
            lvalue: LValue::Id(V_EPSILON.to_string()),
            rvalue: new_v_epsilon,
            location: location.clone(),
        });
        Ok(out)
    }

    fn visit_assign(
        &mut self,
        lvalue: &LValue,
        rvalue: &Expr,
        location: &SourceLocation,
        env: &mut TypeEnv,
    ) -> Result<Vec<Statement>, TransformError> {
        let name = lvalue.name().to_string();
        let mut out = Vec::new();

        // Step 1 (§4.7): under a diverging path condition, snapshot what
        // the shadow run's copy of this variable would have become,
        // before the aligned assignment below overwrites `name`.
        if self.pc {
            if let Some(shadow_update) = shadow::shadow_catchup_for_assign(lvalue, rvalue, location, env) {
                out.push(shadow_update);
            }
        }

        // Step 2: distance-dependence check. Any other tracked variable
        // whose current distance expression mentions the variable being
        // reassigned has just gone stale — freeze its value into a fresh
        // auxiliary before promoting that side to `*`.
        let other_names: Vec<String> = env.names().iter().filter(|n| *n != &name).cloned().collect();
        let mut query_assume_prefix = Vec::new();
        for other in other_names {
            let Some((aligned, shadow)) = env.get(&other).cloned() else {
                continue;
            };
            if let Distance::Value(expr) = &aligned {
                if occurs_free(expr, &name) {
                    query_assume_prefix.extend(self.query_index_assumes(expr, location));
                    self.mark_starred(&other, Branch::Aligned);
                    out.push(materialize(&other, Branch::Aligned, expr, location));
                    env.set_aligned(&other, Distance::Star);
                }
            }
            if let Distance::Value(expr) = &shadow {
                if occurs_free(expr, &name) {
                    query_assume_prefix.extend(self.query_index_assumes(expr, location));
                    self.mark_starred(&other, Branch::Shadow);
                    out.push(materialize(&other, Branch::Shadow, expr, location));
                    env.set_shadow(&other, Distance::Star);
                }
            }
        }
        out.splice(0..0, query_assume_prefix);

        // Step 3: compute the freshly assigned distance.
        let (aligned, mut shadow) = distance_of(rvalue, env);
        if self.pc && shadow != Distance::Star {
            self.mark_starred(&name, Branch::Shadow);
            shadow = Distance::Star;
        }
        env.set(name.clone(), aligned, shadow);

        out.push(Statement::Assign {
            lvalue: lvalue.clone(),
            rvalue: rvalue.clone(),
            location: location.clone(),
        });
        Ok(out)
    }

    fn visit_if(
        &mut self,
        cond: &Expr,
        then_branch: &[Statement],
        else_branch: Option<&[Statement]>,
        location: &SourceLocation,
        env: &mut TypeEnv,
    ) -> Result<Vec<Statement>, TransformError> {
        let cond_aligned = replace(cond, env, Branch::Aligned);

        let diverges = !self.no_shadow
            && (shadow::forces_assumed_divergence(cond, env) || {
                let precondition = self.current_precondition();
                let cond_shadow = replace(cond, env, Branch::Shadow);
                branch_diverges(&precondition, &cond_aligned, &cond_shadow, self.solver)
            });

        if diverges {
            trace!("branch at {} may diverge between aligned and shadow runs", location);
        }

        let mut then_env = env.apply(cond, true);
        let mut else_env = env.apply(cond, false);

        let outer_pc = self.pc;
        self.pc = outer_pc || diverges;
        self.inserted_query_assumes.push(Vec::new());
        let mut then_out = self.visit_block(then_branch, &mut then_env)?;
        let then_scope = self.inserted_query_assumes.pop().expect("scope just pushed");
        self.inserted_query_assumes.push(Vec::new());
        let mut else_out = match else_branch {
            Some(stmts) => self.visit_block(stmts, &mut else_env)?,
            None => Vec::new(),
        };
        let else_scope = self.inserted_query_assumes.pop().expect("scope just pushed");
        self.pc = outer_pc;

        let merged = then_env.merge(&else_env);

        // Insert `assert(e^A)`/`assert(¬e^A)` at the *top* of each arm, not
        // the tail — the branch body has already run by the time the tail
        // is reached, so a trailing assert would be asserting a
        // post-mutation condition instead of the guard the branch was
        // actually taken under (§4.7 If rule, first bullet). Any
        // query-index assumes the guard or the end-of-branch
        // materialization depends on are collected into the same prefix,
        // ahead of the assert, using that arm's own dedup scope throughout
        // (§4.7, last bullet; same pattern `visit_while` applies to its own
        // loop-entry materialization).
        self.inserted_query_assumes.push(then_scope);
        let mut then_prefix = self.query_index_assumes(&cond_aligned, location);
        self.instrument_branch_tail(&then_env, &merged, &mut then_prefix, &mut then_out, location);
        then_prefix.push(assert_stmt(cond_aligned.clone(), location));
        self.inserted_query_assumes.pop();

        self.inserted_query_assumes.push(else_scope);
        let cond_not_aligned = Expr::un(UnOp::Not, cond_aligned.clone());
        let mut else_prefix = self.query_index_assumes(&cond_not_aligned, location);
        self.instrument_branch_tail(&else_env, &merged, &mut else_prefix, &mut else_out, location);
        else_prefix.push(assert_stmt(cond_not_aligned, location));
        self.inserted_query_assumes.pop();

        then_out.splice(0..0, then_prefix);
        else_out.splice(0..0, else_prefix);

        let mut result = Vec::new();

        let else_result = if else_branch.is_some() || !else_out.is_empty() {
            Some(else_out)
        } else {
            None
        };

        result.push(Statement::If {
            cond: cond.clone(),
            then_branch: then_out,
            else_branch: else_result,
            location: location.clone(),
        });

        // Synthesize a separate shadow branch immediately after the
        // original, gated on `pc' ∧ ¬pc` — the outer path condition must
        // still be aligned-deterministic, otherwise the enclosing branch
        // already emitted (or will emit) this arm's shadow catch-up itself
        // (§4.7 If rule, second bullet; `core.py`'s `visit_If` builds this
        // from a single `_ShadowBranchGenerator` over the *merged* Γ,
        // applied to both original arms unchanged).
        if diverges && !outer_pc {
            let cond_shadow = replace(cond, &merged, Branch::Shadow);
            let shadow_prefix = self.query_index_assumes(&cond_shadow, location);

            let shadow_then = shadow::synthesize(then_branch, &merged);
            let shadow_else = shadow::synthesize(else_branch.unwrap_or(&[]), &merged);

            if !shadow_prefix.is_empty() {
                result.splice(0..0, shadow_prefix);
            }
            result.push(Statement::If {
                cond: cond_shadow,
                then_branch: shadow_then,
                else_branch: Some(shadow_else),
                location: location.clone(),
            });
        }

        *env = merged;

        Ok(result)
    }

    /// For every variable whose distance is concrete in `before` but `*` in
    /// `after`, appends its query-index assumes to `prefix` and its
    /// materializing assignment to `tail` — the shared instrumentation step
    /// behind both the If and while-loop rules (§4.7; `core.py`'s
    /// `_instrument`). `prefix`/`tail` are separate because the assumes
    /// belong at the *start* of the enclosing block (ahead of the branch's
    /// own assert) while the materializing assignment belongs at the *end*
    /// of the branch body.
    fn instrument_branch_tail(
        &mut self,
        before: &TypeEnv,
        after: &TypeEnv,
        prefix: &mut Vec<Statement>,
        tail: &mut Vec<Statement>,
        location: &SourceLocation,
    ) {
        let names: Vec<String> = before.names().to_vec();
        for name in names {
            let Some((old_aligned, old_shadow)) = before.get(&name) else {
                continue;
            };
            let Some((new_aligned, new_shadow)) = after.get(&name) else {
                continue;
            };
            if let (Distance::Value(prev), true) = (old_aligned, new_aligned.is_star()) {
                prefix.extend(self.query_index_assumes(prev, location));
                self.mark_starred(&name, Branch::Aligned);
                tail.push(materialize(&name, Branch::Aligned, prev, location));
            }
            if let (Distance::Value(prev), true) = (old_shadow, new_shadow.is_star()) {
                prefix.extend(self.query_index_assumes(prev, location));
                self.mark_starred(&name, Branch::Shadow);
                tail.push(materialize(&name, Branch::Shadow, prev, location));
            }
        }
    }

    fn visit_while(
        &mut self,
        cond: &Expr,
        body: &[Statement],
        location: &SourceLocation,
        env: &mut TypeEnv,
    ) -> Result<Vec<Statement>, TransformError> {
        let mut candidate = env.clone();
        let lap_calls_before_fixed_point = self.lap_calls;
        for round in 0..MAX_FIXED_POINT_ITERATIONS {
            let mut body_env = candidate.apply(cond, true);
            let _ = self.visit_block(body, &mut body_env)?;
            let merged = candidate.merge(&body_env);
            let converged = merged.diff(&candidate).is_empty();
            candidate = merged;
            if converged {
                trace!("while-loop distance fixed point reached after {} round(s)", round + 1);
                break;
            }
        }
        self.lap_calls = lap_calls_before_fixed_point;

        let cond_aligned = replace(cond, &candidate, Branch::Aligned);
        let diverges = !self.no_shadow
            && (shadow::forces_assumed_divergence(cond, &candidate) || {
                let precondition = self.current_precondition();
                let cond_shadow = replace(cond, &candidate, Branch::Shadow);
                branch_diverges(&precondition, &cond_aligned, &cond_shadow, self.solver)
            });
        if diverges {
            return Err(CapabilityError::UnsupportedConstruct {
                construct: "while-loop condition that may diverge between aligned and shadow execution".to_string(),
                location: location.clone(),
            }
            .into());
        }

        // Any variable the fixed point promoted to `*` entered the loop with a
        // concrete distance; the final pass assumes `*` from the very first
        // iteration (`final_body_env` below), so nothing inside the loop ever
        // triggers the step-2 materialization for it. Freeze its last concrete
        // value into the tracking variable here, right before the loop starts.
        let mut out = Vec::new();
        for name in env.names() {
            let Some((old_aligned, old_shadow)) = env.get(name) else {
                continue;
            };
            if let Some((new_aligned, new_shadow)) = candidate.get(name) {
                if let (Distance::Value(prev), true) = (old_aligned, new_aligned.is_star()) {
                    self.mark_starred(name, Branch::Aligned);
                    out.push(materialize(name, Branch::Aligned, prev, location));
                }
                if let (Distance::Value(prev), true) = (old_shadow, new_shadow.is_star()) {
                    self.mark_starred(name, Branch::Shadow);
                    out.push(materialize(name, Branch::Shadow, prev, location));
                }
            }
        }

        let mut final_body_env = candidate.apply(cond, true);
        let mut instrumented_body = vec![assert_stmt(replace(cond, &final_body_env, Branch::Aligned), location)];
        instrumented_body.extend(self.visit_block(body, &mut final_body_env)?);

        *env = candidate.apply(cond, false);

        out.push(Statement::While {
            cond: cond.clone(),
            body: instrumented_body,
            location: location.clone(),
        });
        Ok(out)
    }

    fn visit_return(
        &mut self,
        expr: &Expr,
        location: &SourceLocation,
        env: &mut TypeEnv,
    ) -> Result<Vec<Statement>, TransformError> {
        let (aligned, _shadow) = distance_of(expr, env);
        match &aligned {
            Distance::Value(e) if e.is_zero() => {}
            _ => {
                return Err(SemanticError::ReturnDistanceNotZero {
                    expr: format!("{:?}", expr),
                    distance: format!("{:?}", aligned),
                    location: location.clone(),
                }
                .into())
            }
        }

        let mut out = Vec::new();
        if let Some(epsilon) = &self.epsilon_param {
            let bound = if (self.goal - 1.0).abs() < f64::EPSILON {
                Expr::id(epsilon.clone())
            } else {
                Expr::bin(BinOp::Mul, Expr::num(self.goal), Expr::id(epsilon.clone()))
            };
            out.push(assert_stmt(
                Expr::bin(BinOp::Le, Expr::id(V_EPSILON.to_string()), bound),
                location,
            ));
        }
        out.push(Statement::Return {
            expr: expr.clone(),
            location: location.clone(),
        });
        Ok(out)
    }
}

/// Replaces every read of `epsilon_name` in `program`'s body with `value`,
/// mirroring the original's `set_epsilon` flag: the `epsilon` parameter
/// stays in the signature, but a fixed value is substituted into the Lap
/// scale expressions and the final bound so the solver never has to reason
/// about a symbolic epsilon dividing the scale (§6.4's `--epsilon` flag).
pub fn linearize_epsilon(program: &Program, epsilon_name: &str, value: &Expr) -> Program {
    let function = &program.function;
    let body = function
        .body
        .iter()
        .map(|s| substitute_statement(s, epsilon_name, value))
        .collect();
    Program {
        function: Function {
            body,
            ..function.clone()
        },
    }
}

fn substitute_statement(stmt: &Statement, name: &str, value: &Expr) -> Statement {
    use crate::expr::substitute;
    match stmt {
        Statement::StringAnnotation { .. } => stmt.clone(),
        Statement::Decl {
            name: decl_name,
            ty,
            init,
            location,
        } => Statement::Decl {
            name: decl_name.clone(),
            ty: ty.clone(),
            init: init.as_ref().map(|e| substitute(e, name, value)),
            location: location.clone(),
        },
        Statement::Assign {
            lvalue,
            rvalue,
            location,
        } => Statement::Assign {
            lvalue: lvalue.clone(),
            rvalue: substitute(rvalue, name, value),
            location: location.clone(),
        },
        Statement::If {
            cond,
            then_branch,
            else_branch,
            location,
        } => Statement::If {
            cond: substitute(cond, name, value),
            then_branch: then_branch.iter().map(|s| substitute_statement(s, name, value)).collect(),
            else_branch: else_branch
                .as_ref()
                .map(|b| b.iter().map(|s| substitute_statement(s, name, value)).collect()),
            location: location.clone(),
        },
        Statement::While { cond, body, location } => Statement::While {
            cond: substitute(cond, name, value),
            body: body.iter().map(|s| substitute_statement(s, name, value)).collect(),
            location: location.clone(),
        },
        Statement::Return { expr, location } => Statement::Return {
            expr: substitute(expr, name, value),
            location: location.clone(),
        },
        Statement::Expr { expr, location } => Statement::Expr {
            expr: substitute(expr, name, value),
            location: location.clone(),
        },
    }
}

/// Builds the runtime privacy-cost expression for one `Lap` call: each leaf
/// of a ternary-shaped eta-distance contributes `Abs(leaf) / scale`, and
/// leaves are combined through the same ternary shape so the cost tracks
/// whichever branch the sampling annotation actually took (§4.7, grounded
/// on `core.py`'s regex-based `?`/`:` split doing the analogous rewrite
/// over raw text).
fn cost_expression(eta_distance: &Expr, scale: &Expr) -> Expr {
    match eta_distance {
        Expr::Ternary {
            cond,
            iftrue,
            iffalse,
        } => Expr::ternary(
            (**cond).clone(),
            cost_expression(iftrue, scale),
            cost_expression(iffalse, scale),
        ),
        leaf => Expr::bin(
            BinOp::Div,
            Expr::un(UnOp::Abs, leaf.clone()),
            scale.clone(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::{Param, Type};
    use crate::smt::LinearSolver;

    fn string_stmt(text: &str) -> Statement {
        Statement::StringAnnotation {
            text: text.to_string(),
            location: SourceLocation::unknown(),
        }
    }

    #[test]
    fn rejects_missing_annotations() {
        let program = Program {
            function: Function {
                name: "f".to_string(),
                params: vec![],
                return_type: Type::Float,
                body: vec![],
                location: SourceLocation::unknown(),
            },
        };
        let solver = LinearSolver::new();
        assert!(transform_program(&program, &solver).is_err());
    }

    #[test]
    fn transforms_noop_function_with_zero_return() {
        let program = Program {
            function: Function {
                name: "f".to_string(),
                params: vec![Param {
                    name: "epsilon".to_string(),
                    ty: Type::Float,
                    location: SourceLocation::unknown(),
                }],
                return_type: Type::Float,
                body: vec![
                    string_stmt("ALL_DIFFER"),
                    string_stmt("epsilon:0:0"),
                    Statement::Return {
                        expr: Expr::num(0.0),
                        location: SourceLocation::unknown(),
                    },
                ],
                location: SourceLocation::unknown(),
            },
        };
        let solver = LinearSolver::new();
        let (transformed, report) = transform_program(&program, &solver).unwrap();
        assert_eq!(report.adjacency, Adjacency::AllDiffer);
        assert!(transformed
            .function
            .body
            .iter()
            .any(|s| matches!(s, Statement::Decl { name, .. } if name == V_EPSILON)));
    }

    #[test]
    fn rejects_nonzero_return_distance() {
        let program = Program {
            function: Function {
                name: "f".to_string(),
                params: vec![Param {
                    name: "x".to_string(),
                    ty: Type::Float,
                    location: SourceLocation::unknown(),
                }],
                return_type: Type::Float,
                body: vec![
                    string_stmt("ALL_DIFFER"),
                    string_stmt("x:*"),
                    Statement::Return {
                        expr: Expr::id("x"),
                        location: SourceLocation::unknown(),
                    },
                ],
                location: SourceLocation::unknown(),
            },
        };
        let solver = LinearSolver::new();
        assert!(transform_program(&program, &solver).is_err());
    }

    fn trivial_program() -> Program {
        Program {
            function: Function {
                name: "f".to_string(),
                params: vec![Param {
                    name: "epsilon".to_string(),
                    ty: Type::Float,
                    location: SourceLocation::unknown(),
                }],
                return_type: Type::Float,
                body: vec![
                    string_stmt("ALL_DIFFER"),
                    string_stmt("epsilon:0:0"),
                    Statement::Return {
                        expr: Expr::num(0.0),
                        location: SourceLocation::unknown(),
                    },
                ],
                location: SourceLocation::unknown(),
            },
        }
    }

    #[test]
    fn goal_multiplier_scales_final_assertion() {
        let solver = LinearSolver::new();
        let (transformed, _) = transform_program_with_goal(&trivial_program(), &solver, 2.0).unwrap();
        let found = transformed.function.body.iter().any(|s| match s {
            Statement::Expr {
                expr: Expr::Call { name, args },
                ..
            } if name == "assert" => args[0]
                == Expr::bin(
                    BinOp::Le,
                    Expr::id(V_EPSILON.to_string()),
                    Expr::bin(BinOp::Mul, Expr::num(2.0), Expr::id("epsilon".to_string())),
                ),
            _ => false,
        });
        assert!(found, "expected assert(v_epsilon <= 2 * epsilon) in {:?}", transformed.function.body);
    }

    #[test]
    fn default_goal_leaves_bound_unscaled() {
        let solver = LinearSolver::new();
        let (transformed, _) = transform_program(&trivial_program(), &solver).unwrap();
        let found = transformed.function.body.iter().any(|s| match s {
            Statement::Expr {
                expr: Expr::Call { name, args },
                ..
            } if name == "assert" => {
                args[0] == Expr::bin(BinOp::Le, Expr::id(V_EPSILON.to_string()), Expr::id("epsilon".to_string()))
            }
            _ => false,
        });
        assert!(found);
    }

    #[test]
    fn assignment_promotes_dependent_variable_to_star() {
        // x's own distance is the identifier `i`; y inherits that distance
        // by reading x. Once `i` itself is reassigned, y's distance
        // expression (which mentions `i`) has gone stale and must be
        // materialized and promoted to `*`.
        let program = Program {
            function: Function {
                name: "f".to_string(),
                params: vec![
                    Param {
                        name: "x".to_string(),
                        ty: Type::Float,
                        location: SourceLocation::unknown(),
                    },
                    Param {
                        name: "i".to_string(),
                        ty: Type::Float,
                        location: SourceLocation::unknown(),
                    },
                ],
                return_type: Type::Float,
                body: vec![
                    string_stmt("ALL_DIFFER"),
                    string_stmt("x:i:i; i:0:0"),
                    Statement::Decl {
                        name: "y".to_string(),
                        ty: Type::Float,
                        init: Some(Expr::id("x")),
                        location: SourceLocation::unknown(),
                    },
                    Statement::Assign {
                        lvalue: LValue::Id("i".to_string()),
                        rvalue: Expr::num(5.0),
                        location: SourceLocation::unknown(),
                    },
                    Statement::Return {
                        expr: Expr::num(0.0),
                        location: SourceLocation::unknown(),
                    },
                ],
                location: SourceLocation::unknown(),
            },
        };
        let solver = LinearSolver::new();
        let (transformed, report) = transform_program(&program, &solver).unwrap();
        assert!(!report.auxiliary_locals_added.is_empty());
        let materializes = transformed.function.body.iter().any(|s| {
            matches!(s, Statement::Assign { lvalue: LValue::Id(name), .. } if name.contains("DISTANCE_y"))
        });
        assert!(materializes, "expected a materializing assignment for y in {:?}", transformed.function.body);
    }

    fn contains_num(expr: &Expr, value: f64) -> bool {
        match expr {
            Expr::Num(n) => (n.0 - value).abs() < 1e-9,
            Expr::Binary { left, right, .. } => contains_num(left, value) || contains_num(right, value),
            Expr::Unary { expr, .. } => contains_num(expr, value),
            Expr::Ternary { cond, iftrue, iffalse } => {
                contains_num(cond, value) || contains_num(iftrue, value) || contains_num(iffalse, value)
            }
            Expr::Call { args, .. } => args.iter().any(|a| contains_num(a, value)),
            Expr::ArrayRef { subscript, .. } => contains_num(subscript, value),
            Expr::Id(_) | Expr::Str(_) => false,
        }
    }

    #[test]
    fn shadow_branch_pairs_then_and_else_arms_without_swapping() {
        // `x` forces divergence outright (its shadow distance is already
        // `*`); `count` is another already-`*` variable the two arms update
        // with distinct constants, so the synthesized shadow copy's catch-up
        // for each arm must carry that arm's own constant, not the other
        // arm's.
        let program = Program {
            function: Function {
                name: "f".to_string(),
                params: vec![Param {
                    name: "epsilon".to_string(),
                    ty: Type::Float,
                    location: SourceLocation::unknown(),
                }],
                return_type: Type::Float,
                body: vec![
                    string_stmt("ALL_DIFFER"),
                    string_stmt("epsilon:0:0; x:*; count:*"),
                    Statement::If {
                        cond: Expr::bin(BinOp::Gt, Expr::id("x"), Expr::num(0.0)),
                        then_branch: vec![Statement::Assign {
                            lvalue: LValue::Id("count".to_string()),
                            rvalue: Expr::num(1.0),
                            location: SourceLocation::unknown(),
                        }],
                        else_branch: Some(vec![Statement::Assign {
                            lvalue: LValue::Id("count".to_string()),
                            rvalue: Expr::num(2.0),
                            location: SourceLocation::unknown(),
                        }]),
                        location: SourceLocation::unknown(),
                    },
                    Statement::Return {
                        expr: Expr::num(0.0),
                        location: SourceLocation::unknown(),
                    },
                ],
                location: SourceLocation::unknown(),
            },
        };
        let solver = LinearSolver::new();
        let (transformed, _) = transform_program(&program, &solver).unwrap();

        let ifs: Vec<&Statement> = transformed
            .function
            .body
            .iter()
            .filter(|s| matches!(s, Statement::If { .. }))
            .collect();
        assert_eq!(
            ifs.len(),
            2,
            "expected the original if plus one separately synthesized shadow if, got {:?}",
            transformed.function.body
        );

        let (shadow_then, shadow_else) = match ifs[1] {
            Statement::If {
                then_branch,
                else_branch,
                ..
            } => (then_branch, else_branch.as_ref().expect("shadow if must carry both arms")),
            _ => unreachable!(),
        };

        let tracking_var = "__SHADOWDP_SHADOW_DISTANCE_count";
        let then_rvalue = shadow_then
            .iter()
            .find_map(|s| match s {
                Statement::Assign { lvalue: LValue::Id(n), rvalue, .. } if n == tracking_var => Some(rvalue.clone()),
                _ => None,
            })
            .expect("then arm must catch up count's shadow distance");
        let else_rvalue = shadow_else
            .iter()
            .find_map(|s| match s {
                Statement::Assign { lvalue: LValue::Id(n), rvalue, .. } if n == tracking_var => Some(rvalue.clone()),
                _ => None,
            })
            .expect("else arm must catch up count's shadow distance");

        assert!(
            contains_num(&then_rvalue, 1.0) && !contains_num(&then_rvalue, 2.0),
            "then arm's catch-up must subtract its own rvalue (1.0), got {:?}",
            then_rvalue
        );
        assert!(
            contains_num(&else_rvalue, 2.0) && !contains_num(&else_rvalue, 1.0),
            "else arm's catch-up must subtract its own rvalue (2.0), got {:?}",
            else_rvalue
        );
    }

    fn query_transformer(solver: &dyn Solver) -> Transformer<'_> {
        Transformer {
            solver,
            adjacency: Adjacency::AllDiffer,
            query_param: Some("q".to_string()),
            size_param: Some("size".to_string()),
            epsilon_param: Some("epsilon".to_string()),
            index_param: None,
            no_shadow: false,
            pc: false,
            lap_calls: 0,
            random_variables: HashSet::new(),
            starred_locals: Vec::new(),
            seen_starred: HashSet::new(),
            goal: 1.0,
            query_is_star: true,
            inserted_query_assumes: vec![Vec::new()],
        }
    }

    #[test]
    fn query_index_assumes_emits_three_flat_assumes_under_all_differ() {
        let solver = LinearSolver::new();
        let mut transformer = query_transformer(&solver);
        let subscript_read = Expr::array_ref("q", Expr::num(0.0));
        let emitted = transformer.query_index_assumes(&subscript_read, &SourceLocation::unknown());
        assert_eq!(
            emitted.len(),
            3,
            "ALL_DIFFER's adjacency hypothesis is three flat assumes (<=1, >=-1, shadow==aligned), got {:?}",
            emitted
        );
        assert!(emitted.iter().all(|s| matches!(
            s,
            Statement::Expr { expr: Expr::Call { name, .. }, .. } if name == "assume"
        )));
    }

    #[test]
    fn query_index_assumes_dedups_the_same_subscript_within_one_scope() {
        // The branch guard and the assigned value both read `q[0]`; the
        // second scan must find the scope already carries that subscript
        // and emit nothing (§4.7, `inserted_query_assumes`).
        let solver = LinearSolver::new();
        let mut transformer = query_transformer(&solver);
        let location = SourceLocation::unknown();
        let guard = Expr::array_ref("q", Expr::num(0.0));
        let body_read = Expr::bin(BinOp::Add, Expr::id("total"), Expr::array_ref("q", Expr::num(0.0)));

        let first = transformer.query_index_assumes(&guard, &location);
        assert_eq!(first.len(), 3);
        let second = transformer.query_index_assumes(&body_read, &location);
        assert!(
            second.is_empty(),
            "expected the repeated read of q[0] within the same scope to be deduplicated, got {:?}",
            second
        );
    }

    #[test]
    fn query_index_assumes_reemits_in_a_fresh_scope() {
        // Popping the scope (as `visit_if` does when an arm finishes) and
        // pushing a new one must not remember the old arm's subscripts —
        // each arm gets its own dedup scope.
        let solver = LinearSolver::new();
        let mut transformer = query_transformer(&solver);
        let location = SourceLocation::unknown();
        let read = Expr::array_ref("q", Expr::num(0.0));

        let first = transformer.query_index_assumes(&read, &location);
        assert_eq!(first.len(), 3);

        transformer.inserted_query_assumes.push(Vec::new());
        let in_fresh_scope = transformer.query_index_assumes(&read, &location);
        assert_eq!(
            in_fresh_scope.len(),
            3,
            "a fresh scope must not inherit the previous scope's dedup state, got {:?}",
            in_fresh_scope
        );
    }

    #[test]
    fn query_index_assumes_under_one_differ_guards_on_the_distinguished_index() {
        let solver = LinearSolver::new();
        let mut transformer = query_transformer(&solver);
        transformer.adjacency = Adjacency::OneDiffer;
        transformer.index_param = Some(INDEX_PARAM.to_string());

        let read = Expr::array_ref("q", Expr::id("i"));
        let emitted = transformer.query_index_assumes(&read, &SourceLocation::unknown());
        assert_eq!(emitted.len(), 1, "ONE_DIFFER's hypothesis is a single if/else, got {:?}", emitted);
        match &emitted[0] {
            Statement::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                assert_eq!(
                    *cond,
                    Expr::bin(BinOp::Eq, Expr::id("i".to_string()), Expr::id(INDEX_PARAM.to_string()))
                );
                assert_eq!(then_branch.len(), 3, "at the distinguished index, all three bounded assumes apply");
                assert_eq!(
                    else_branch.as_ref().map(|b| b.len()),
                    Some(2),
                    "elsewhere, shadow==aligned and aligned==0 pin the index to unchanged"
                );
            }
            other => panic!("expected a single If statement, got {:?}", other),
        }
    }

    fn param_float(name: &str) -> Param {
        Param {
            name: name.to_string(),
            ty: Type::Float,
            location: SourceLocation::unknown(),
        }
    }

    fn decl_init(name: &str, ty: Type, init: Expr) -> Statement {
        Statement::Decl {
            name: name.to_string(),
            ty,
            init: Some(init),
            location: SourceLocation::unknown(),
        }
    }

    #[test]
    fn if_arm_materializes_variable_promoted_to_star_on_only_one_branch() {
        // `y` starts with a concrete, shared distance (`0`). The `then` arm
        // reassigns `y` to `d` (distance `1`) while the `else` arm leaves it
        // untouched (distance stays `0`); neither arm invalidates anything
        // by name; the two arms simply disagree once merged, so Γ's merge
        // alone promotes `y` to `*`. The If rule's end-of-branch
        // instrumentation must still materialize each arm's own pre-merge
        // concrete distance into `y`'s tracking variable, mirroring
        // `visit_while`'s loop-entry materialization for variables the
        // fixed point promotes.
        let program = Program {
            function: Function {
                name: "f".to_string(),
                params: vec![param_float("flag"), param_float("d")],
                return_type: Type::Float,
                body: vec![
                    string_stmt("ALL_DIFFER"),
                    string_stmt("flag:0:0; d:1:1"),
                    decl_init("y", Type::Float, Expr::num(0.0)),
                    Statement::If {
                        cond: Expr::bin(BinOp::Gt, Expr::id("flag"), Expr::num(0.0)),
                        then_branch: vec![Statement::Assign {
                            lvalue: LValue::Id("y".to_string()),
                            rvalue: Expr::id("d"),
                            location: SourceLocation::unknown(),
                        }],
                        else_branch: Some(vec![]),
                        location: SourceLocation::unknown(),
                    },
                    Statement::Return {
                        expr: Expr::num(0.0),
                        location: SourceLocation::unknown(),
                    },
                ],
                location: SourceLocation::unknown(),
            },
        };
        let solver = LinearSolver::new();
        let (transformed, report) = transform_program(&program, &solver).unwrap();
        assert!(!report.auxiliary_locals_added.is_empty());

        let (then_branch, else_branch) = transformed
            .function
            .body
            .iter()
            .find_map(|s| match s {
                Statement::If {
                    then_branch,
                    else_branch,
                    ..
                } => Some((then_branch, else_branch.as_ref())),
                _ => None,
            })
            .expect("expected the instrumented if");

        let materializes_y = |branch: &[Statement]| {
            branch.iter().any(|s| {
                matches!(s, Statement::Assign { lvalue: LValue::Id(name), .. } if name.contains("DISTANCE_y"))
            })
        };
        assert!(
            materializes_y(then_branch),
            "expected a materializing assignment for y at the end of the then arm, got {:?}",
            then_branch
        );
        assert!(
            else_branch.is_some_and(|b| materializes_y(b)),
            "expected a materializing assignment for y at the end of the else arm, got {:?}",
            else_branch
        );
    }

    #[test]
    fn sampling_under_path_condition_is_rejected() {
        // if (x > 0) { y = Lap(1.0, "SHADOW; 0"); } with x's shadow
        // distance already `*` forces pc, and the SHADOW-bearing selector
        // keeps no_shadow false, so the Lap call must be rejected.
        let program = Program {
            function: Function {
                name: "f".to_string(),
                params: vec![Param {
                    name: "epsilon".to_string(),
                    ty: Type::Float,
                    location: SourceLocation::unknown(),
                }],
                return_type: Type::Float,
                body: vec![
                    string_stmt("ALL_DIFFER"),
                    string_stmt("epsilon:0:0; x:*"),
                    Statement::If {
                        cond: Expr::bin(BinOp::Gt, Expr::id("x"), Expr::num(0.0)),
                        then_branch: vec![Statement::Decl {
                            name: "y".to_string(),
                            ty: Type::Float,
                            init: Some(Expr::Call {
                                name: "Lap".to_string(),
                                args: vec![Expr::num(1.0), Expr::Str("SHADOW; 0".to_string())],
                            }),
                            location: SourceLocation::unknown(),
                        }],
                        else_branch: None,
                        location: SourceLocation::unknown(),
                    },
                    Statement::Return {
                        expr: Expr::num(0.0),
                        location: SourceLocation::unknown(),
                    },
                ],
                location: SourceLocation::unknown(),
            },
        };
        let solver = LinearSolver::new();
        assert!(transform_program(&program, &solver).is_err());
    }
}
