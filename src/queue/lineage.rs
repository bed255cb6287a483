//! Lineage tracking for spawned queue items.
//!
//! Every root item gets a fresh tracking id; every item spawned from it,
//! directly or transitively, carries that same id unchanged. The tracking id
//! is the tracing mechanism for a whole pipeline run. A depth counter is
//! carried alongside it as a defensive cap on runaway spawning.

use thiserror::Error;
use uuid::Uuid;

use super::item::QueueItem;

/// Errors raised when deriving lineage for a spawn.
#[derive(Debug, Error)]
pub enum LineageError {
    /// The spawn would exceed the maximum ancestry depth.
    #[error("lineage depth {depth} exceeds maximum {max} for tracking id {tracking_id}")]
    DepthExceeded {
        tracking_id: Uuid,
        depth: u32,
        max: u32,
    },
}

/// Lineage fields assigned to a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lineage {
    /// Tracking id shared across the whole lineage.
    pub tracking_id: Uuid,
    /// Number of spawns between this item and the root.
    pub depth: u32,
}

/// Assigns and propagates tracking ids across spawned items.
#[derive(Debug, Clone)]
pub struct LineageTracker {
    max_depth: u32,
}

impl LineageTracker {
    /// Default maximum ancestry depth. The deepest legal pipeline is four
    /// stages, so this only trips on genuine runaway spawning.
    pub const MAX_DEPTH: u32 = 16;

    /// Creates a tracker with the default depth cap.
    pub fn new() -> Self {
        Self {
            max_depth: Self::MAX_DEPTH,
        }
    }

    /// Creates a tracker with a custom depth cap.
    pub fn with_max_depth(max_depth: u32) -> Self {
        Self { max_depth }
    }

    /// Lineage for a freshly submitted root item.
    pub fn root(&self) -> Lineage {
        Lineage {
            tracking_id: Uuid::new_v4(),
            depth: 0,
        }
    }

    /// Lineage for an item spawned by `parent`.
    ///
    /// The tracking id is copied unchanged; the depth is incremented and
    /// checked against the cap.
    pub fn child_of(&self, parent: &QueueItem) -> Result<Lineage, LineageError> {
        let depth = parent.lineage_depth + 1;
        if depth > self.max_depth {
            return Err(LineageError::DepthExceeded {
                tracking_id: parent.tracking_id,
                depth,
                max: self.max_depth,
            });
        }

        Ok(Lineage {
            tracking_id: parent.tracking_id,
            depth,
        })
    }
}

impl Default for LineageTracker {
    fn default() -> Self {
        Self::new()
    }
}
