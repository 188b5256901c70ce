//! Last-writer-wins reconciliation of scene entity transforms.
//!
//! Each entity id moves through `Unknown -> Active -> Deleted` and may be
//! resurrected from `Deleted` by a later update. A deleted entity remembers
//! only when it was deleted, so an update stamped before the deletion cannot
//! bring it back.
//!
//! Ordering is by the payload timestamp alone. On a tie the incoming update
//! wins, except that re-applying an identical transform is a no-op.
//!
//! Deletion markers are kept for a retention window measured against the
//! newest timestamp seen so far. Once a marker falls outside the window the
//! id is forgotten, and any later update for it is treated as a first sighting.

use std::collections::HashMap;

use parade_net::{EntityAction, EntityUpdatePayload, Transform};

/// How long a deletion marker outlives the newest timestamp seen, in
/// milliseconds.
pub const DEFAULT_TOMBSTONE_RETENTION_MS: u64 = 5 * 60 * 1000;

/// Last applied transform of an active entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    pub transform: Transform,
    /// Timestamp of the update that produced `transform`.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Active(EntityState),
    Deleted { timestamp: u64 },
}

/// What the reconciler knows about one entity id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityPresence<'a> {
    /// Never seen.
    Unknown,
    Active(&'a EntityState),
    /// Deleted at `timestamp`.
    Deleted { timestamp: u64 },
}

impl<'a> EntityPresence<'a> {
    /// The active state, if any.
    pub fn active(self) -> Option<&'a EntityState> {
        match self {
            EntityPresence::Active(state) => Some(state),
            _ => None,
        }
    }
}

/// Result of feeding one update to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciled {
    /// The entity now has this transform.
    Applied(Transform),
    /// The entity was deleted.
    Removed,
    /// Transient selection; nothing stored.
    Selected,
    /// Stale or duplicate input.
    Ignored,
}

/// Per-entity reconciliation state.
#[derive(Debug)]
pub struct EntityReconciler {
    entities: HashMap<String, Slot>,
    retention_ms: u64,
    /// Newest update timestamp seen, local or remote.
    newest: u64,
    tombstones: usize,
}

impl Default for EntityReconciler {
    fn default() -> Self {
        Self::with_retention(DEFAULT_TOMBSTONE_RETENTION_MS)
    }
}

impl EntityReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep deletion markers for `retention_ms` behind the newest timestamp.
    pub fn with_retention(retention_ms: u64) -> Self {
        Self {
            entities: HashMap::new(),
            retention_ms,
            newest: 0,
            tombstones: 0,
        }
    }

    /// Apply a remote update.
    pub fn apply(&mut self, update: &EntityUpdatePayload) -> Reconciled {
        let ts = update.timestamp;
        if ts > self.newest {
            self.newest = ts;
            self.expire_tombstones();
        }
        match update.action {
            EntityAction::Selected => Reconciled::Selected,
            EntityAction::Deleted => self.delete(&update.entity_id, ts),
            EntityAction::Created
            | EntityAction::Moved
            | EntityAction::Rotated
            | EntityAction::Scaled => self.upsert(&update.entity_id, update.transform, ts),
        }
    }

    /// Apply an update made on this device. Same rules as [`apply`](Self::apply);
    /// the outcome is not reported anywhere.
    pub fn record_local(&mut self, update: &EntityUpdatePayload) {
        let outcome = self.apply(update);
        tracing::trace!("Local update to '{}': {outcome:?}", update.entity_id);
    }

    fn upsert(&mut self, entity_id: &str, transform: Transform, ts: u64) -> Reconciled {
        let next = EntityState {
            transform,
            timestamp: ts,
        };
        match self.entities.get(entity_id).copied() {
            Some(Slot::Deleted { timestamp }) if ts < timestamp => {
                tracing::debug!("Ignoring update to '{entity_id}' older than its deletion");
                return Reconciled::Ignored;
            }
            Some(Slot::Deleted { .. }) => {
                tracing::debug!("Resurrecting '{entity_id}'");
                self.tombstones -= 1;
            }
            Some(Slot::Active(current)) if ts < current.timestamp => {
                tracing::debug!(
                    "Ignoring stale update to '{entity_id}' ({ts} < {})",
                    current.timestamp
                );
                return Reconciled::Ignored;
            }
            Some(Slot::Active(current)) if current == next => return Reconciled::Ignored,
            Some(Slot::Active(_)) | None => {}
        }
        self.entities.insert(entity_id.to_string(), Slot::Active(next));
        Reconciled::Applied(transform)
    }

    fn delete(&mut self, entity_id: &str, ts: u64) -> Reconciled {
        match self.entities.get(entity_id).copied() {
            Some(Slot::Active(current)) if ts < current.timestamp => {
                tracing::debug!("Ignoring stale delete of '{entity_id}'");
                Reconciled::Ignored
            }
            Some(Slot::Active(_)) => {
                self.entities
                    .insert(entity_id.to_string(), Slot::Deleted { timestamp: ts });
                self.tombstones += 1;
                Reconciled::Removed
            }
            Some(Slot::Deleted { timestamp }) => {
                self.entities.insert(
                    entity_id.to_string(),
                    Slot::Deleted {
                        timestamp: timestamp.max(ts),
                    },
                );
                Reconciled::Ignored
            }
            None if self.is_expired(ts) => Reconciled::Ignored,
            None => {
                // Remember the deletion so a late create cannot undo it.
                self.entities
                    .insert(entity_id.to_string(), Slot::Deleted { timestamp: ts });
                self.tombstones += 1;
                Reconciled::Ignored
            }
        }
    }

    fn is_expired(&self, deleted_at: u64) -> bool {
        deleted_at.saturating_add(self.retention_ms) < self.newest
    }

    fn expire_tombstones(&mut self) {
        if self.tombstones == 0 {
            return;
        }
        let cutoff = self.newest.saturating_sub(self.retention_ms);
        self.entities.retain(|id, slot| match slot {
            Slot::Deleted { timestamp } if *timestamp < cutoff => {
                tracing::trace!("Forgetting deletion of '{id}'");
                false
            }
            _ => true,
        });
        self.tombstones = self
            .entities
            .values()
            .filter(|slot| matches!(slot, Slot::Deleted { .. }))
            .count();
    }

    /// Current knowledge about `entity_id`.
    pub fn state(&self, entity_id: &str) -> EntityPresence<'_> {
        match self.entities.get(entity_id) {
            None => EntityPresence::Unknown,
            Some(Slot::Active(state)) => EntityPresence::Active(state),
            Some(Slot::Deleted { timestamp }) => EntityPresence::Deleted {
                timestamp: *timestamp,
            },
        }
    }

    /// Active entities sorted by id.
    pub fn active_entities(&self) -> Vec<(&str, &EntityState)> {
        let mut active: Vec<_> = self
            .entities
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Active(state) => Some((id.as_str(), state)),
                Slot::Deleted { .. } => None,
            })
            .collect();
        active.sort_by(|a, b| a.0.cmp(b.0));
        active
    }

    /// Number of active entities.
    pub fn len(&self) -> usize {
        self.entities
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of deletion markers still held.
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }
}
