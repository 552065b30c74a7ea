// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CLI entry point: `transform`, `verify`, `check` over a JSON-encoded
//! program AST (§6.1 puts parsing C itself out of scope, so the input to
//! this binary is the already-parsed `cast::Program` fixture).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shadow_dp::cast::{Expr, Program};
use shadow_dp::error::ErrorReporter;
use shadow_dp::pipeline::{self, TransformOptions};
use shadow_dp::transform::linearize_epsilon;
use shadow_dp::verifier::{ProcessBackend, VerifierBackend};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "shadow-dp", about = "Proves differential privacy via shadow-execution instrumentation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set epsilon to a fixed value (or another identifier), to linearize
    /// Lap scale expressions and the final bound for solvers that choke on
    /// a symbolic epsilon in a division.
    #[arg(short = 'e', long, global = true)]
    epsilon: Option<String>,

    /// The goal multiplier `k`: verify `v_epsilon <= k * epsilon` instead
    /// of `v_epsilon <= epsilon`.
    #[arg(short = 'g', long, global = true, default_value_t = 1.0)]
    goal: f64,

    /// Enable debug-level tracing of the transformer's pass.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Transform the source program, writing instrumented C to `output`.
    Transform {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Verify an already-transformed C file against an external checker.
    Verify {
        input: PathBuf,
        #[arg(short = 'c', long)]
        verifier_path: PathBuf,
        #[arg(short = 'a', long, value_delimiter = ' ')]
        verifier_args: Vec<String>,
    },
    /// Transform then verify in one pass.
    Check {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short = 'c', long)]
        verifier_path: PathBuf,
        #[arg(short = 'a', long, value_delimiter = ' ')]
        verifier_args: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(transform_err) = err.downcast_ref::<shadow_dp::error::TransformError>() {
                ErrorReporter::new(std::env::var_os("NO_COLOR").is_none()).report(transform_err);
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let epsilon_override = cli.epsilon.clone();
    match cli.command {
        Commands::Transform { input, output } => {
            let mut program = load_program(&input)?;
            if let Some(ref value) = epsilon_override {
                program = apply_epsilon_override(&program, value);
            }
            let name = program.function.name.clone();
            let options = TransformOptions {
                output: output.clone(),
                verify: false,
                verifier_timeout: Duration::from_secs(30),
                goal: cli.goal,
            };
            let result = pipeline::run(&program, &options)?;
            log::info!(
                "transformed '{}': {} Lap call(s) instrumented, {} auxiliary param(s), {} auxiliary local(s)",
                name,
                result.report.lap_calls_instrumented,
                result.report.auxiliary_params_added.len(),
                result.report.auxiliary_locals_added.len(),
            );
            if output.is_none() {
                println!("{}", result.rendered);
            }
            Ok(())
        }
        Commands::Verify {
            input,
            verifier_path,
            verifier_args,
        } => {
            let backends = verifier_backends(&verifier_path, &verifier_args);
            let source_path = input.to_string_lossy().to_string();
            let outcome = shadow_dp::verifier::race_backends(&backends, &source_path, Duration::from_secs(30))
                .context("verification failed")?;
            report_outcome(&outcome);
            Ok(())
        }
        Commands::Check {
            input,
            output,
            verifier_path,
            verifier_args,
        } => {
            let mut program = load_program(&input)?;
            if let Some(ref value) = epsilon_override {
                program = apply_epsilon_override(&program, value);
            }
            let options = TransformOptions {
                output,
                verify: true,
                verifier_timeout: Duration::from_secs(30),
                goal: cli.goal,
            };
            let backends = verifier_backends(&verifier_path, &verifier_args);
            let result = pipeline::run_with_solver(&program, &options, &shadow_dp::smt::LinearSolver::new(), &backends)?;
            if let Some(outcome) = &result.verification {
                report_outcome(outcome);
            }
            Ok(())
        }
    }
}

fn load_program(path: &PathBuf) -> Result<Program> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing program AST from {}", path.display()))
}

fn apply_epsilon_override(program: &Program, value: &str) -> Program {
    let replacement = match value.parse::<f64>() {
        Ok(number) => Expr::num(number),
        Err(_) => Expr::id(value.to_string()),
    };
    let epsilon_name = program
        .function
        .params
        .iter()
        .find(|p| p.name == "epsilon")
        .map(|p| p.name.clone())
        .unwrap_or_else(|| "epsilon".to_string());
    linearize_epsilon(program, &epsilon_name, &replacement)
}

fn verifier_backends(verifier_path: &PathBuf, extra_args: &[String]) -> Vec<Box<dyn VerifierBackend>> {
    vec![Box::new(ProcessBackend {
        name: "external".to_string(),
        program: verifier_path.to_string_lossy().to_string(),
        args: extra_args.to_vec(),
    })]
}

fn report_outcome(outcome: &shadow_dp::verifier::VerificationOutcome) {
    match outcome {
        shadow_dp::verifier::VerificationOutcome::Verified => println!("Verification result: TRUE"),
        shadow_dp::verifier::VerificationOutcome::CounterexampleFound(diagnostics) => {
            println!("Verification result: FALSE");
            eprintln!("{}", diagnostics);
        }
    }
}
