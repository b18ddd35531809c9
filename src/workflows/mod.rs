//! Built-in workflows registered by the `docflow` binary.

pub mod maintenance;

use std::sync::Arc;

use crate::db::Db;
use crate::engine::{WorkflowCatalog, WorkflowRegistry};
use crate::error::Result;

/// Catalog of every built-in workflow backed by `db`.
pub fn builtin_catalog(db: Arc<Db>) -> impl WorkflowCatalog {
    move |registry: &mut WorkflowRegistry| -> Result<()> {
        maintenance::register(registry, db.clone())?;
        Ok(())
    }
}
