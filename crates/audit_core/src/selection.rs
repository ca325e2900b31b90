use std::collections::HashSet;

use shared::domain::WorkUnitId;

use crate::{error::ValidationError, types::Listing};

/// Stored procedures chosen for analysis. Always a subset of the listing it
/// was last reconciled against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSet {
    ids: HashSet<WorkUnitId>,
}

impl SelectionSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: WorkUnitId) -> bool {
        self.ids.contains(&id)
    }

    /// Flips one id and returns whether it is selected afterwards.
    pub fn toggle(&mut self, id: WorkUnitId, listing: &Listing) -> Result<bool, ValidationError> {
        if !listing.contains(id) {
            return Err(ValidationError::UnknownWorkUnit(id));
        }
        if self.ids.remove(&id) {
            Ok(false)
        } else {
            self.ids.insert(id);
            Ok(true)
        }
    }

    pub fn select_all(&mut self, listing: &Listing) {
        self.ids = listing.ids().collect();
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Drops ids missing from `listing`; returns how many were dropped.
    pub fn prune(&mut self, listing: &Listing) -> usize {
        let before = self.ids.len();
        self.ids.retain(|id| listing.contains(*id));
        before - self.ids.len()
    }

    pub fn all_selected(&self, listing: &Listing) -> bool {
        !listing.is_empty() && listing.ids().all(|id| self.ids.contains(&id))
    }

    /// Selected ids in listing order.
    pub fn ordered(&self, listing: &Listing) -> Vec<WorkUnitId> {
        listing.ids().filter(|id| self.ids.contains(id)).collect()
    }
}
