//! Aggregate snapshots and the snapshot store contract.
//!
//! A [`Snapshot`] freezes an aggregate's marshalled state at a version so
//! rebuilds can start from it instead of replaying the full history. This
//! crate only defines the storage contract and an in-memory reference
//! store; persistence backends live elsewhere.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::BoxError;
use crate::aggregate::{Aggregate, AggregateRef};
use crate::query::{TimeConstraints, VersionConstraints};
use crate::streams;

/// Errors produced by snapshot handling and snapshot stores.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// No snapshot exists for the requested aggregate (and version bound).
    #[error("no snapshot for {name}({id})")]
    NotFound { name: String, id: Uuid },

    /// The aggregate failed to marshal its state.
    #[error("marshal snapshot: {0}")]
    Marshal(#[source] BoxError),

    /// The aggregate failed to unmarshal a snapshot's state.
    #[error("unmarshal snapshot: {0}")]
    Unmarshal(#[source] BoxError),

    /// Backend-specific failure.
    #[error("backend: {0}")]
    Backend(#[source] BoxError),
}

/// A frozen aggregate state: reference, version, time, and opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    reference: AggregateRef,
    version: u64,
    time: DateTime<Utc>,
    state: Vec<u8>,
}

impl Snapshot {
    /// Assemble a snapshot from raw parts (used by store backends).
    pub fn from_parts(
        reference: AggregateRef,
        version: u64,
        time: DateTime<Utc>,
        state: Vec<u8>,
    ) -> Self {
        Self {
            reference,
            version,
            time,
            state,
        }
    }

    pub fn reference(&self) -> &AggregateRef {
        &self.reference
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// The marshalled aggregate state.
    pub fn state(&self) -> &[u8] {
        &self.state
    }
}

/// Aggregates that can be snapshotted marshal their domain state to bytes
/// and back. The base bookkeeping (reference, version) is carried by the
/// [`Snapshot`] itself and restored by [`restore`].
pub trait Snapshotter: Aggregate {
    fn marshal_snapshot(&self) -> Result<Vec<u8>, BoxError>;
    fn unmarshal_snapshot(&mut self, state: &[u8]) -> Result<(), BoxError>;
}

/// Take a snapshot of `a` at its current version.
pub fn take<A: Snapshotter>(a: &A) -> Result<Snapshot, SnapshotError> {
    let state = a.marshal_snapshot().map_err(SnapshotError::Marshal)?;
    Ok(Snapshot {
        reference: a.reference().clone(),
        version: a.current_version(),
        time: Utc::now(),
        state,
    })
}

/// Restore `a` from `snapshot`: unmarshal the state and advance the
/// aggregate's version to the snapshot's version.
pub fn restore<A: Snapshotter>(a: &mut A, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    a.unmarshal_snapshot(snapshot.state())
        .map_err(SnapshotError::Unmarshal)?;
    a.base_mut().set_version(snapshot.version());
    Ok(())
}

/// A declarative snapshot filter, mirroring the event [`Query`](crate::query::Query)
/// for the constraint groups that apply to snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotQuery {
    names: Vec<String>,
    ids: Vec<Uuid>,
    versions: VersionConstraints,
    times: TimeConstraints,
}

impl SnapshotQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to snapshots of aggregates with the given name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    /// Restrict to snapshots of aggregates with the given instance id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.ids.push(id);
        self
    }

    /// Require a snapshot version of at least `min`.
    pub fn with_min_version(mut self, min: u64) -> Self {
        self.versions.min = Some(self.versions.min.map_or(min, |v| v.max(min)));
        self
    }

    /// Require a snapshot version of at most `max`.
    pub fn with_max_version(mut self, max: u64) -> Self {
        self.versions.max = Some(self.versions.max.map_or(max, |v| v.min(max)));
        self
    }

    /// Require a snapshot time strictly after `time`.
    pub fn with_after(mut self, time: DateTime<Utc>) -> Self {
        self.times.after = Some(self.times.after.map_or(time, |t| t.max(time)));
        self
    }

    /// Require a snapshot time strictly before `time`.
    pub fn with_before(mut self, time: DateTime<Utc>) -> Self {
        self.times.before = Some(self.times.before.map_or(time, |t| t.min(time)));
        self
    }

    /// Whether `snapshot` satisfies every populated constraint group.
    pub fn test(&self, snapshot: &Snapshot) -> bool {
        if !self.names.is_empty()
            && !self.names.iter().any(|n| n == snapshot.reference().name())
        {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&snapshot.reference().id()) {
            return false;
        }
        if !self.versions.is_empty() && !self.versions.matches(snapshot.version()) {
            return false;
        }
        if !self.times.is_empty() && !self.times.matches(snapshot.time()) {
            return false;
        }
        true
    }
}

/// Persistent store for snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot, replacing any existing one at the same version.
    async fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError>;

    /// The snapshot with the highest version for `(name, id)`.
    async fn latest(&self, name: &str, id: Uuid) -> Result<Snapshot, SnapshotError>;

    /// The snapshot at exactly `version`.
    async fn version(&self, name: &str, id: Uuid, version: u64) -> Result<Snapshot, SnapshotError>;

    /// The greatest snapshot with version `<= max_version`; fails with
    /// [`SnapshotError::NotFound`] if none exists.
    async fn limit(&self, name: &str, id: Uuid, max_version: u64)
    -> Result<Snapshot, SnapshotError>;

    /// Stream the snapshots matching `query`, ordered by `(name, id,
    /// version)`.
    async fn query(
        &self,
        query: SnapshotQuery,
    ) -> Result<(mpsc::Receiver<Snapshot>, mpsc::Receiver<SnapshotError>), SnapshotError>;

    /// Delete the given snapshot (matched by reference and version).
    async fn delete(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
}

/// In-memory snapshot store, keyed `(name, id) -> version -> snapshot`.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: std::sync::RwLock<HashMap<(String, Uuid), BTreeMap<u64, Snapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let key = (
            snapshot.reference().name().to_string(),
            snapshot.reference().id(),
        );
        self.snapshots
            .write()
            .expect("snapshot store lock poisoned")
            .entry(key)
            .or_default()
            .insert(snapshot.version(), snapshot);
        Ok(())
    }

    async fn latest(&self, name: &str, id: Uuid) -> Result<Snapshot, SnapshotError> {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(&(name.to_string(), id))
            .and_then(|versions| versions.last_key_value())
            .map(|(_, snapshot)| snapshot.clone())
            .ok_or_else(|| SnapshotError::NotFound {
                name: name.to_string(),
                id,
            })
    }

    async fn version(&self, name: &str, id: Uuid, version: u64) -> Result<Snapshot, SnapshotError> {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(&(name.to_string(), id))
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound {
                name: name.to_string(),
                id,
            })
    }

    async fn limit(
        &self,
        name: &str,
        id: Uuid,
        max_version: u64,
    ) -> Result<Snapshot, SnapshotError> {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(&(name.to_string(), id))
            .and_then(|versions| versions.range(..=max_version).next_back())
            .map(|(_, snapshot)| snapshot.clone())
            .ok_or_else(|| SnapshotError::NotFound {
                name: name.to_string(),
                id,
            })
    }

    async fn query(
        &self,
        query: SnapshotQuery,
    ) -> Result<(mpsc::Receiver<Snapshot>, mpsc::Receiver<SnapshotError>), SnapshotError> {
        let mut matching: Vec<Snapshot> = self
            .snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .values()
            .flat_map(|versions| versions.values())
            .filter(|snapshot| query.test(snapshot))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (a.reference().name(), a.reference().id(), a.version()).cmp(&(
                b.reference().name(),
                b.reference().id(),
                b.version(),
            ))
        });

        let (_errs_tx, errs_rx) = mpsc::channel(1);
        Ok((streams::from_vec(matching), errs_rx))
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let key = (
            snapshot.reference().name().to_string(),
            snapshot.reference().id(),
        );
        let mut guard = self.snapshots.write().expect("snapshot store lock poisoned");
        let removed = guard
            .get_mut(&key)
            .and_then(|versions| versions.remove(&snapshot.version()))
            .is_some();
        if !removed {
            return Err(SnapshotError::NotFound {
                name: key.0,
                id: key.1,
            });
        }
        Ok(())
    }
}
