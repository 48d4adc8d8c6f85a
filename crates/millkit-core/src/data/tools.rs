//! Tool defaults consumed from the tool database
//!
//! The tool database itself lives outside the engine; the engine only needs
//! cutter defaults to pre-seed the spindle when a job starts.

use super::SpindleDirection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cutter defaults returned by a tool lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefaults {
    /// Tool identifier in the database
    pub id: u32,
    /// Display name
    pub name: String,
    /// Cutter diameter (mm)
    pub diameter_mm: f64,
    /// Default feed (mm/min)
    pub feed_mm_min: f64,
    /// Default spindle speed
    pub rpm: f64,
    /// Default spindle direction
    pub direction: SpindleDirection,
}

/// Lookup of cutter defaults by tool id
pub trait ToolLookup: Send + Sync {
    /// Defaults for `id`, if the tool exists
    fn tool(&self, id: u32) -> Option<ToolDefaults>;
}

/// In-memory tool table
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    tools: HashMap<u32, ToolDefaults>,
}

impl ToolTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tool
    pub fn insert(&mut self, tool: ToolDefaults) {
        self.tools.insert(tool.id, tool);
    }

    /// Number of tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolLookup for ToolTable {
    fn tool(&self, id: u32) -> Option<ToolDefaults> {
        self.tools.get(&id).cloned()
    }
}
