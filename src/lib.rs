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

//! A type-directed source-to-source transformer that turns a small
//! imperative differentially-private program into an instrumented program
//! whose `assert`s, once discharged by an external model checker, imply
//! ε-differential privacy.
//!
//! Implements the shadow-execution type system from "Proving Differential
//! Privacy with Shadow Execution" (PLDI'19): an aligned run and a shadow
//! run of the same program are carried side by side, and a distance
//! environment tracks how far the two runs' copies of each variable can
//! have drifted apart, given that the two runs are fed adjacent inputs.
//!
//! See `DESIGN.md` for how each module here is grounded in the reference
//! implementation this crate reimplements.

pub mod cast;
pub mod distance;
pub mod error;
pub mod expr;
pub mod pipeline;
pub mod replacer;
pub mod shadow;
pub mod smt;
pub mod transform;
pub mod typeenv;
pub mod verifier;

use crate::cast::Program;
use crate::error::TransformError;
use crate::pipeline::{PipelineResult, TransformOptions};

/// Transforms `program` end to end: runs the shadow-execution transformer,
/// renders the instrumented C, and (if `options.verify` is set) races it
/// against the configured verifier backends.
pub fn transform(program: &Program, options: &TransformOptions) -> Result<PipelineResult, TransformError> {
    pipeline::run(program, options)
}
