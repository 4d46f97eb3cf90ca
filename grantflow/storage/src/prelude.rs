//! Prelude module that exports commonly used types and functions.
//!
//! This module provides a convenient way to import all the necessary
//! components with a single `use grantflow_storage::prelude::*;` statement.

pub use crate::{Error, ExecutionFilter, MemoryStore, Result, Statistics, Store};

#[cfg(feature = "postgres")]
pub use crate::PostgresStore;
