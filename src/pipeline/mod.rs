//! End-to-end transformation pipeline (§6.4): loads a program AST, runs
//! the transformer, renders the result, and optionally races it against
//! the external verifier.
//!
//! Grounded on the orchestration shape of `pipeline/mod.rs` in
//! `renovate-bot-GoogleCloudPlatform-_-aether` (a `CompileOptions`
//! struct plus a driver function stringing the phases together with `?`),
//! narrowed to this crate's three phases: load, transform, verify.

use crate::cast::render::render_program;
use crate::cast::Program;
use crate::error::TransformError;
use crate::smt::{LinearSolver, Solver};
use crate::transform::{transform_program_with_goal, TransformReport};
use crate::verifier::{race_backends, VerificationOutcome, VerifierBackend};
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::info;

/// Options controlling one end-to-end run.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub output: Option<PathBuf>,
    pub verify: bool,
    pub verifier_timeout: Duration,
    /// The goal multiplier `k` in the final `v_epsilon <= k * epsilon`
    /// assertion (§6.4's `--goal`/`-k` flag).
    pub goal: f64,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            output: None,
            verify: false,
            verifier_timeout: Duration::from_secs(30),
            goal: 1.0,
        }
    }
}

/// The result of one pipeline run: the transformed program, its rendered
/// C text, the transformer's report, and (if requested) the verifier's
/// verdict.
pub struct PipelineResult {
    pub program: Program,
    pub rendered: String,
    pub report: TransformReport,
    pub verification: Option<VerificationOutcome>,
}

/// Parses `program` (already an AST — this crate does not parse C text
/// itself, §3/§9) through the transformer, using the default in-process
/// solver backend.
pub fn run(program: &Program, options: &TransformOptions) -> Result<PipelineResult, TransformError> {
    let solver = LinearSolver::new();
    run_with_solver(program, options, &solver, &[])
}

/// Same as [`run`] but with an explicit solver and verifier backend list,
/// so callers (and tests) can substitute fakes.
pub fn run_with_solver(
    program: &Program,
    options: &TransformOptions,
    solver: &dyn Solver,
    verifier_backends: &[Box<dyn VerifierBackend>],
) -> Result<PipelineResult, TransformError> {
    info!("transforming function '{}'", program.function.name);
    let (transformed, report) = transform_program_with_goal(program, solver, options.goal)?;
    let rendered = render_program(&transformed);

    if let Some(path) = &options.output {
        std::fs::write(path, &rendered)?;
    }

    let verification = if options.verify {
        let source_path = options
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from("shadow_dp_transformed.c"));
        if options.output.is_none() {
            std::fs::write(&source_path, &rendered)?;
        }
        Some(verify_path(&source_path, verifier_backends, options.verifier_timeout)?)
    } else {
        None
    };

    Ok(PipelineResult {
        program: transformed,
        rendered,
        report,
        verification,
    })
}

fn verify_path(
    path: &Path,
    backends: &[Box<dyn VerifierBackend>],
    timeout: Duration,
) -> Result<VerificationOutcome, TransformError> {
    let path_str = path.to_string_lossy().to_string();
    race_backends(backends, &path_str, timeout).map_err(TransformError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::{Function, Statement, Type};
    use crate::error::SourceLocation;

    #[test]
    fn renders_transformed_program_without_verification() {
        let function = Function {
            name: "f".to_string(),
            params: vec![crate::cast::Param {
                name: "epsilon".to_string(),
                ty: Type::Float,
                location: SourceLocation::unknown(),
            }],
            return_type: Type::Float,
            body: vec![
                Statement::StringAnnotation {
                    text: "ALL_DIFFER".to_string(),
                    location: SourceLocation::unknown(),
                },
                Statement::StringAnnotation {
                    text: "epsilon:0:0".to_string(),
                    location: SourceLocation::unknown(),
                },
                Statement::Return {
                    expr: crate::cast::Expr::num(0.0),
                    location: SourceLocation::unknown(),
                },
            ],
            location: SourceLocation::unknown(),
        };
        let program = Program { function };
        let result = run(&program, &TransformOptions::default()).unwrap();
        assert!(result.rendered.contains("__SHADOWDP_v_epsilon"));
        assert!(result.verification.is_none());
    }
}
