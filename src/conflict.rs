//! Conflict checking for concurrent writes to the same stream.
//!
//! When a save hits a version mismatch the repository re-reads what other
//! writers appended and asks a [`ConflictChecker`] whether its own events can
//! safely be appended after them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::metadata::ActionMetadata;
use crate::stream::{EventData, RecordedEvent};

/// Decides whether events written concurrently to one stream are compatible.
pub trait ConflictChecker: Send + Sync + 'static {
    /// `true` if `new_events` must not be appended after `stored`.
    ///
    /// # Arguments
    ///
    /// * `new_events` - The events the caller is trying to save.
    /// * `stored` - Events appended by other writers since the caller loaded.
    /// * `metadata` - The action metadata of the save.
    fn has_conflicts(
        &self,
        new_events: &[EventData],
        stored: &[RecordedEvent],
        metadata: &ActionMetadata,
    ) -> bool;
}

/// Treats every concurrent write as a conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConflict;

impl ConflictChecker for AlwaysConflict {
    fn has_conflicts(&self, _: &[EventData], _: &[RecordedEvent], _: &ActionMetadata) -> bool {
        true
    }
}

/// Accepts every concurrent write.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConflict;

impl ConflictChecker for NeverConflict {
    fn has_conflicts(&self, _: &[EventData], _: &[RecordedEvent], _: &ActionMetadata) -> bool {
        false
    }
}

/// Type-aware policy: declared pairs of event types conflict, everything
/// else interleaves freely.
///
/// # Examples
///
/// ```
/// use streamfold_es::EventTypeConflicts;
///
/// let policy = EventTypeConflicts::default()
///     .conflicting("ItemRemoved", "OrderShipped")
///     .conflicting_with_all("OrderCancelled");
/// # let _ = policy;
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventTypeConflicts {
    pairs: HashSet<(String, String)>,
    exclusive: HashSet<String>,
}

impl EventTypeConflicts {
    /// Declare that `a` and `b` conflict, in either order.
    pub fn conflicting(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        self.pairs.insert((b.clone(), a.clone()));
        self.pairs.insert((a, b));
        self
    }

    /// Declare that `event_type` conflicts with any concurrent event.
    pub fn conflicting_with_all(mut self, event_type: impl Into<String>) -> Self {
        self.exclusive.insert(event_type.into());
        self
    }
}

impl ConflictChecker for EventTypeConflicts {
    fn has_conflicts(
        &self,
        new_events: &[EventData],
        stored: &[RecordedEvent],
        _: &ActionMetadata,
    ) -> bool {
        if stored.is_empty() {
            return false;
        }
        let exclusive = |t: &str| self.exclusive.contains(t);
        if new_events.iter().any(|e| exclusive(&e.event_type))
            || stored.iter().any(|e| exclusive(&e.event_type))
        {
            return true;
        }
        new_events.iter().any(|mine| {
            stored.iter().any(|theirs| {
                self.pairs
                    .contains(&(mine.event_type.clone(), theirs.event_type.clone()))
            })
        })
    }
}

/// Conflict policy per aggregate type, resolved once at configuration time.
#[derive(Clone)]
pub struct ConflictPolicies {
    default: Arc<dyn ConflictChecker>,
    by_type: HashMap<String, Arc<dyn ConflictChecker>>,
}

impl ConflictPolicies {
    pub fn new(default: impl ConflictChecker) -> Self {
        Self {
            default: Arc::new(default),
            by_type: HashMap::new(),
        }
    }

    /// Use `checker` for aggregates of `aggregate_type`.
    pub fn with_policy(
        mut self,
        aggregate_type: impl Into<String>,
        checker: impl ConflictChecker,
    ) -> Self {
        self.by_type.insert(aggregate_type.into(), Arc::new(checker));
        self
    }

    /// The checker for `aggregate_type`, falling back to the default.
    pub fn for_type(&self, aggregate_type: &str) -> Arc<dyn ConflictChecker> {
        self.by_type
            .get(aggregate_type)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for ConflictPolicies {
    fn default() -> Self {
        Self::new(AlwaysConflict)
    }
}

impl std::fmt::Debug for ConflictPolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("ConflictPolicies")
            .field("overridden_types", &types)
            .finish()
    }
}
