//! Subscription table keyed by id, with a stream index derived from it.
//!
//! All mutation goes through [`SubscriptionRegistry::insert`] and
//! [`SubscriptionRegistry::remove`] so the two views cannot drift apart.

use std::collections::{BTreeMap, HashMap};

use crate::stream::subscription::{Subscription, SubscriptionId};

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    by_id: HashMap<SubscriptionId, Subscription>,
    by_stream: BTreeMap<String, Vec<SubscriptionId>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id().clone();
        self.by_stream
            .entry(subscription.stream_id().to_string())
            .or_default()
            .push(id.clone());
        if let Some(previous) = self.by_id.insert(id.clone(), subscription) {
            // Re-inserting an id replaces its stream index entry.
            self.unindex(&id, previous.stream_id());
        }
        id
    }

    pub(crate) fn remove(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        let subscription = self.by_id.remove(id)?;
        self.unindex(id, subscription.stream_id());
        Some(subscription)
    }

    pub(crate) fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.by_id.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SubscriptionId) -> Option<&mut Subscription> {
        self.by_id.get_mut(id)
    }

    /// Ids on `stream_id` in subscription order.
    pub(crate) fn ids_for_stream(&self, stream_id: &str) -> Vec<SubscriptionId> {
        self.by_stream.get(stream_id).cloned().unwrap_or_default()
    }

    /// All ids, grouped by stream.
    pub(crate) fn ids(&self) -> Vec<SubscriptionId> {
        self.by_stream.values().flatten().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<Subscription> {
        let ids = self.ids();
        self.by_stream.clear();
        ids.iter().filter_map(|id| self.by_id.remove(id)).collect()
    }

    fn unindex(&mut self, id: &SubscriptionId, stream_id: &str) {
        if let Some(ids) = self.by_stream.get_mut(stream_id) {
            if let Some(position) = ids.iter().position(|candidate| candidate == id) {
                ids.remove(position);
            }
            if ids.is_empty() {
                self.by_stream.remove(stream_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let indexed: usize = self.by_stream.values().map(Vec::len).sum();
        assert_eq!(indexed, self.by_id.len(), "stream index size");
        for (stream_id, ids) in &self.by_stream {
            assert!(!ids.is_empty(), "empty stream entry for {stream_id}");
            for id in ids {
                let subscription = self
                    .by_id
                    .get(id)
                    .unwrap_or_else(|| panic!("{id} indexed under {stream_id} but missing"));
                assert_eq!(subscription.stream_id(), stream_id);
            }
        }
    }
}
