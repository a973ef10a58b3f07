//! In-memory cluster for testing and development.
//!
//! `FakeCluster` stores objects by identity, applies merge patches the way a
//! real API server would, and records every mutation in a journal. Tests
//! script readiness, failures and immutable fields per object.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use keel_release::{ResourceIdentity, ResourceKey};
use serde_json::Value;
use tracing::debug;

use crate::cluster::{ClusterClient, Resource, ResourceState};
use crate::error::ClusterError;
use crate::merge::apply_merge_patch;

/// Mutating operation, used to script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// A mutation observed by the fake cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Created(ResourceKey),
    Updated(ResourceKey),
    Deleted(ResourceKey),
}

impl ClusterEvent {
    pub fn key(&self) -> &ResourceKey {
        match self {
            Self::Created(key) | Self::Updated(key) | Self::Deleted(key) => key,
        }
    }
}

type ObjectName = (String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ResourceIdentity, Resource>,
    journal: Vec<ClusterEvent>,
    states: HashMap<ObjectName, VecDeque<ResourceState>>,
    failures: HashMap<(Operation, ObjectName), ClusterError>,
    immutable: HashMap<String, Vec<String>>,
    rejected_kinds: HashSet<String>,
}

impl FakeState {
    fn check_failure(&self, op: Operation, key: &ResourceKey) -> Result<(), ClusterError> {
        match self.failures.get(&(op, object_name(key))) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn find(&self, kind: &str, name: &str) -> Option<&Resource> {
        self.objects
            .values()
            .find(|r| r.key.kind.as_str() == kind && r.key.name == name)
    }
}

fn object_name(key: &ResourceKey) -> ObjectName {
    (key.kind.as_str().to_string(), key.name.clone())
}

fn name_of(kind: &str, name: &str) -> ObjectName {
    (kind.to_string(), name.to_string())
}

/// In-memory [`ClusterClient`].
///
/// Objects without a scripted state report `Succeeded` for kinds that run
/// to completion and `Ready` otherwise.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script the states reported for an object. The last one repeats.
    pub fn script_states(&self, kind: &str, name: &str, states: Vec<ResourceState>) {
        self.lock()
            .states
            .insert(name_of(kind, name), states.into());
    }

    /// Report a fixed state for an object.
    pub fn set_state(&self, kind: &str, name: &str, state: ResourceState) {
        self.script_states(kind, name, vec![state]);
    }

    /// Fail every `op` on the object with `error` until cleared.
    pub fn fail(&self, op: Operation, kind: &str, name: &str, error: ClusterError) {
        self.lock().failures.insert((op, name_of(kind, name)), error);
    }

    pub fn clear_failure(&self, op: Operation, kind: &str, name: &str) {
        self.lock().failures.remove(&(op, name_of(kind, name)));
    }

    /// Reject updates of `kind` that touch the field at JSON `pointer`.
    pub fn immutable_field(&self, kind: &str, pointer: &str) {
        self.lock()
            .immutable
            .entry(kind.to_string())
            .or_default()
            .push(pointer.to_string());
    }

    /// Fail `build` for documents of `kind`.
    pub fn reject_kind(&self, kind: &str) {
        self.lock().rejected_kinds.insert(kind.to_string());
    }

    /// Seed an object without recording it in the journal.
    pub fn insert(&self, resource: Resource) {
        self.lock().objects.insert(resource.identity(), resource);
    }

    /// Change a live object out of band.
    pub fn modify(&self, kind: &str, name: &str, f: impl FnOnce(&mut Value)) {
        let mut state = self.lock();
        if let Some(resource) = state
            .objects
            .values_mut()
            .find(|r| r.key.kind.as_str() == kind && r.key.name == name)
        {
            f(&mut resource.object);
        }
    }

    /// Live object by kind and name, ignoring namespace.
    pub fn object(&self, kind: &str, name: &str) -> Option<Value> {
        self.lock().find(kind, name).map(|r| r.object.clone())
    }

    pub fn contains(&self, kind: &str, name: &str) -> bool {
        self.lock().find(kind, name).is_some()
    }

    /// Keys of all live objects, in identity order.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().objects.values().map(|r| r.key.clone()).collect()
    }

    /// Mutations since creation or the last [`clear_journal`](Self::clear_journal).
    pub fn journal(&self) -> Vec<ClusterEvent> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn build(&self, raw: &str, default_namespace: &str) -> Result<Resource, ClusterError> {
        let resource = Resource::parse(raw, default_namespace)?;
        if self
            .lock()
            .rejected_kinds
            .contains(resource.key.kind.as_str())
        {
            return Err(ClusterError::Invalid {
                message: format!("no matches for kind \"{}\"", resource.key.kind),
            });
        }
        Ok(resource)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Resource, ClusterError> {
        self.lock()
            .objects
            .get(&key.identity())
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                resource: key.to_string(),
            })
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, ClusterError> {
        let mut state = self.lock();
        state.check_failure(Operation::Create, &resource.key)?;

        let identity = resource.identity();
        if state.objects.contains_key(&identity) {
            return Err(ClusterError::AlreadyExists {
                resource: resource.key.to_string(),
            });
        }
        state.objects.insert(identity, resource.clone());
        state.journal.push(ClusterEvent::Created(resource.key.clone()));

        debug!(resource = %resource.key, "[FAKE] Created object");
        Ok(resource.clone())
    }

    async fn update(&self, key: &ResourceKey, patch: &Value) -> Result<Resource, ClusterError> {
        let mut state = self.lock();
        state.check_failure(Operation::Update, key)?;

        let immutable = state
            .immutable
            .get(key.kind.as_str())
            .cloned()
            .unwrap_or_default();
        let live = state
            .objects
            .get_mut(&key.identity())
            .ok_or_else(|| ClusterError::NotFound {
                resource: key.to_string(),
            })?;

        for pointer in immutable {
            if let Some(value) = patch.pointer(&pointer) {
                if live.object.pointer(&pointer) != Some(value) {
                    return Err(ClusterError::Immutable {
                        resource: key.to_string(),
                        field: pointer.trim_start_matches('/').replace('/', "."),
                    });
                }
            }
        }

        apply_merge_patch(&mut live.object, patch);
        live.key = key.clone();
        let updated = live.clone();
        state.journal.push(ClusterEvent::Updated(key.clone()));

        debug!(resource = %key, "[FAKE] Patched object");
        Ok(updated)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.check_failure(Operation::Delete, key)?;

        if state.objects.remove(&key.identity()).is_none() {
            return Err(ClusterError::NotFound {
                resource: key.to_string(),
            });
        }
        state.journal.push(ClusterEvent::Deleted(key.clone()));

        debug!(resource = %key, "[FAKE] Deleted object");
        Ok(())
    }

    async fn state(&self, key: &ResourceKey) -> Result<ResourceState, ClusterError> {
        let mut state = self.lock();
        if !state.objects.contains_key(&key.identity()) {
            return Err(ClusterError::NotFound {
                resource: key.to_string(),
            });
        }

        if let Some(script) = state.states.get_mut(&object_name(key)) {
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            if let Some(next) = next {
                return Ok(next);
            }
        }

        Ok(if key.kind.runs_to_completion() {
            ResourceState::Succeeded
        } else {
            ResourceState::Ready
        })
    }
}
