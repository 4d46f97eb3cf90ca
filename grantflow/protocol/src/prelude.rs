//! Prelude module that exports commonly used types and functions.

pub use crate::{ClientMessage, ServerMessage};
pub use grantflow_schemas::{ExecutionEvent, ExecutionEventKind, ExecutionSnapshot};
