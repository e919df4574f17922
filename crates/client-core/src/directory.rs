//! Call directory
//!
//! The only place calls are stored. Readers clone out `Arc<Call>` handles;
//! insertion and removal are crate-private and go through the phone, which
//! pairs removal with releasing the call's ports and session id.

use std::sync::Arc;

use dashmap::DashMap;

use crate::call::{Call, CallState};

#[derive(Debug, Default)]
pub struct CallDirectory {
    calls: DashMap<String, Arc<Call>>,
}

impl CallDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<Call>> {
        self.calls.get(call_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.calls.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Handles to every call, detached from the map's locks
    pub fn snapshot(&self) -> Vec<Arc<Call>> {
        self.calls.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Calls currently in `state`
    pub fn in_state(&self, state: CallState) -> Vec<Arc<Call>> {
        self.calls
            .iter()
            .filter(|entry| entry.value().state() == state)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Insert unless the id is taken; returns false on conflict
    pub(crate) fn insert(&self, call: Arc<Call>) -> bool {
        match self.calls.entry(call.call_id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(call);
                true
            }
        }
    }

    pub(crate) fn remove(&self, call_id: &str) -> Option<Arc<Call>> {
        self.calls.remove(call_id).map(|(_, call)| call)
    }
}
