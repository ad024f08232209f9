//! Server-side pug template rendering core.
//!
//! This crate intentionally separates rendering concerns into layers:
//!
//! - `ast`: the pre-parsed pug AST as delivered by the upstream parser.
//! - `jsparse` + `transpile`: the embedded JavaScript expression
//!   dialect and its lowering to intermediate template language text.
//! - `lower`: node-by-node compilation of the AST, including mixin
//!   buffering and attribute merging calls.
//! - `itl` + `exec`: parser and interpreter for the generated template
//!   language, with JavaScript-like values and scoping.
//! - `value` + `ops` + `regexp`: the value model, the total operator
//!   table, and regex dialect rewriting.
//! - `engine`: cache, admission control, and the host function
//!   registry tying it together.
//!
//! Rendering strategy (high level):
//!
//! 1. Compile once (`Engine::load_templates`) from AST JSON to an
//!    executable program, caching by template name.
//! 2. Render many times (`Engine::render`) against per-request data.
//!
//! The critical design rule is coercion fidelity: expressions evaluate
//! the way the source templates' authors expect from JavaScript, so
//! operators never panic and prefer sentinel values over type errors.

pub mod ast;
pub mod engine;
pub mod error;
pub mod exec;
pub mod itl;
pub mod jsparse;
pub mod lower;
pub mod ops;
pub mod regexp;
pub mod transpile;
pub mod value;

pub use engine::{Engine, EngineOptions, RenderContext};
pub use error::{CompileError, EvalError, EvalResult, RenderError};
pub use value::{HostRecord, Value};
