//! Plan model: typed, validated representation of a workflow DAG.
//!
//! Plans arrive as JSON documents in one of two shapes. The primary shape
//! embeds child ids in container nodes (`children`, `whenTrue`/`whenFalse`,
//! `body`). The edge-list shape lists nodes without children plus explicit
//! `{source, target}` edges and is normalized into the primary shape.
//!
//! Parsing is pure: no I/O, no adapters.

pub mod expr;
pub mod node;
pub mod parse;

pub use expr::{Expr, StateMap};
pub use node::{LoopMode, NodeKind, Plan, PlanNode, RetryPolicy, Schedule};
pub use parse::{PlanContext, MAX_BACKOFF_SECONDS};
