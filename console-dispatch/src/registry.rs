use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::datacenter::{DatacenterHandle, DatacenterId};

/// In-memory map of datacenter handles, keyed and ordered by identifier.
///
/// Only the command loop writes (on login); workers read concurrently.
/// Inserts replace a whole entry at once, so a poisoned lock still guards a
/// consistent map and is simply recovered.
#[derive(Debug, Default)]
pub struct DatacenterRegistry {
    handles: RwLock<BTreeMap<DatacenterId, Arc<DatacenterHandle>>>,
}

impl DatacenterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle` under its identifier, returning the handle it replaced.
    pub fn register(&self, handle: Arc<DatacenterHandle>) -> Option<Arc<DatacenterHandle>> {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id().clone(), handle)
    }

    pub fn lookup(&self, id: &DatacenterId) -> Option<Arc<DatacenterHandle>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Identifiers of every handle that reports logged in, in key order.
    pub fn list_logged_in(&self) -> Vec<DatacenterId> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| handle.is_logged_in())
            .map(|handle| handle.id().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<DatacenterId> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedCloud;

    fn handle(id: &str) -> Arc<DatacenterHandle> {
        let id = DatacenterId::from(id);
        let cloud = Arc::new(SimulatedCloud::new(id.clone()));
        Arc::new(DatacenterHandle::new(id, cloud))
    }

    #[tokio::test]
    async fn lists_only_logged_in_handles_in_order() {
        let registry = DatacenterRegistry::new();
        let third = handle("3");
        let first = handle("1");
        registry.register(third.clone());
        registry.register(handle("2"));
        registry.register(first.clone());

        assert!(registry.list_logged_in().is_empty());

        third.login("admin", "secret").await.unwrap();
        first.login("admin", "secret").await.unwrap();

        assert_eq!(
            registry.list_logged_in(),
            vec![DatacenterId::from("1"), DatacenterId::from("3")]
        );
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn re_registering_replaces_the_handle() {
        let registry = DatacenterRegistry::new();
        let old = handle("1");
        assert!(registry.register(old.clone()).is_none());

        let new = handle("1");
        let replaced = registry.register(new.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &old));
        assert!(Arc::ptr_eq(
            &registry.lookup(&DatacenterId::from("1")).unwrap(),
            &new
        ));
    }

    #[test]
    fn lookup_of_unknown_id_is_none() {
        let registry = DatacenterRegistry::new();
        assert!(registry.lookup(&DatacenterId::from("9")).is_none());
        assert!(registry.is_empty());
    }
}
