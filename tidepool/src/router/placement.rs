//! Placement: which storage region holds an object's state.
//!
//! An object's region is decided by the jurisdiction tag carried in its id.
//! Ids without a tag go to the default region. Ids tagged with a
//! jurisdiction go to the region registered for it, and to nowhere else:
//! if no such region exists the request is rejected rather than served
//! from an unrestricted region.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RoutingError;
use crate::object::{Jurisdiction, ObjectId};
use crate::storage::StorageBackend;

/// Errors from placement decisions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// No region serves the id's jurisdiction.
    #[error("no region for jurisdiction {jurisdiction:?} (object {id})")]
    NoRegion {
        /// The object that could not be placed.
        id: ObjectId,
        /// The jurisdiction it is tagged with.
        jurisdiction: Option<Jurisdiction>,
    },
}

impl From<PlacementError> for RoutingError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NoRegion { id, jurisdiction } => {
                RoutingError::JurisdictionUnavailable { id, jurisdiction }
            }
        }
    }
}

/// Maps object ids to the storage region that holds them.
///
/// Called by the [`InstanceRouter`](super::InstanceRouter) before a record
/// is created. Must be deterministic: the same id always maps to the same
/// backend.
pub trait PlacementDirector: Send + Sync + fmt::Debug {
    /// Storage region for `id`.
    fn place(&self, id: &ObjectId) -> Result<Arc<dyn StorageBackend>, PlacementError>;

    /// Every distinct region, scanned for pending alarms at startup.
    fn backends(&self) -> Vec<Arc<dyn StorageBackend>>;
}

/// Placement by jurisdiction tag.
///
/// # Example
///
/// ```rust,ignore
/// let placement = RegionPlacement::new(Arc::new(MemoryBackend::new()))
///     .with_region(Jurisdiction::Eu, Arc::new(FileBackend::open("/data/eu").await?));
/// ```
#[derive(Debug, Clone)]
pub struct RegionPlacement {
    default: Option<Arc<dyn StorageBackend>>,
    regions: HashMap<Jurisdiction, Arc<dyn StorageBackend>>,
}

impl RegionPlacement {
    /// Placement with `default` serving every id that has no jurisdiction tag.
    pub fn new(default: Arc<dyn StorageBackend>) -> Self {
        Self {
            default: Some(default),
            regions: HashMap::new(),
        }
    }

    /// Placement with no default region: untagged ids are rejected.
    pub fn restricted() -> Self {
        Self {
            default: None,
            regions: HashMap::new(),
        }
    }

    /// Serve ids tagged with `jurisdiction` from `backend`.
    pub fn with_region(mut self, jurisdiction: Jurisdiction, backend: Arc<dyn StorageBackend>) -> Self {
        self.regions.insert(jurisdiction, backend);
        self
    }

    /// Whether a region is registered for `jurisdiction`.
    pub fn serves(&self, jurisdiction: Option<Jurisdiction>) -> bool {
        match jurisdiction {
            None => self.default.is_some(),
            Some(j) => self.regions.contains_key(&j),
        }
    }
}

impl PlacementDirector for RegionPlacement {
    fn place(&self, id: &ObjectId) -> Result<Arc<dyn StorageBackend>, PlacementError> {
        let jurisdiction = id.jurisdiction();
        let backend = match jurisdiction {
            None => self.default.as_ref(),
            Some(j) => self.regions.get(&j),
        };
        backend.cloned().ok_or_else(|| PlacementError::NoRegion {
            id: id.clone(),
            jurisdiction,
        })
    }

    fn backends(&self) -> Vec<Arc<dyn StorageBackend>> {
        let mut all: Vec<Arc<dyn StorageBackend>> = Vec::new();
        for backend in self.default.iter().chain(self.regions.values()) {
            // The same backend may serve several regions.
            if !all.iter().any(|b| Arc::ptr_eq(b, backend)) {
                all.push(backend.clone());
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{id_from_name, new_unique_id};
    use crate::storage::MemoryBackend;

    fn backend() -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn test_untagged_ids_use_default() {
        let default = backend();
        let placement = RegionPlacement::new(default.clone());
        let id = id_from_name("COUNTER", "alice").expect("valid name");
        let placed = placement.place(&id).expect("placed");
        assert!(Arc::ptr_eq(&placed, &default));
    }

    #[test]
    fn test_tagged_ids_use_their_region_only() {
        let default = backend();
        let eu = backend();
        let placement = RegionPlacement::new(default.clone()).with_region(Jurisdiction::Eu, eu.clone());

        let eu_id = new_unique_id("COUNTER", Some(Jurisdiction::Eu));
        assert!(Arc::ptr_eq(&placement.place(&eu_id).expect("placed"), &eu));

        let fed_id = new_unique_id("COUNTER", Some(Jurisdiction::FedRamp));
        assert_eq!(
            placement.place(&fed_id).err(),
            Some(PlacementError::NoRegion {
                id: fed_id.clone(),
                jurisdiction: Some(Jurisdiction::FedRamp),
            })
        );
    }

    #[test]
    fn test_restricted_rejects_untagged() {
        let placement = RegionPlacement::restricted().with_region(Jurisdiction::Eu, backend());
        let id = id_from_name("COUNTER", "alice").expect("valid name");
        assert!(placement.place(&id).is_err());
        assert!(!placement.serves(None));
        assert!(placement.serves(Some(Jurisdiction::Eu)));
    }

    #[test]
    fn test_backends_are_deduplicated() {
        let shared = backend();
        let placement = RegionPlacement::new(shared.clone())
            .with_region(Jurisdiction::Eu, shared.clone())
            .with_region(Jurisdiction::FedRamp, backend());
        assert_eq!(placement.backends().len(), 2);
    }
}
