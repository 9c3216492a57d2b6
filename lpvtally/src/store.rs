use crate::*;
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Outcome of a successful append
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub success: bool,
    pub new_version: u64,
}

/// Head of a stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub stream_id: String,

    /// Version of the last event, 0 for an empty stream
    pub version: u64,
    pub sealed: bool,

    /// `audit_hash` of the last event, or the genesis hash
    pub head_hash: String,
}

/// Latest compacted state of an aggregate
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub version: u64,
    pub state: Value,
    pub taken_at: DateTime<Utc>,
}

/// Append-only event storage, one stream per aggregate id.
///
/// Streams are never deleted. Appends are serialized per stream with optimistic concurrency.
pub trait EventStore: Send + Sync {
    /// Append `events` if the stream is still at `expected_version`
    fn append(
        &self,
        stream: &str,
        expected_version: u64,
        events: Vec<AuditEvent>,
    ) -> Result<AppendResult, Error>;

    /// Events with version >= `from_version`, in append order
    fn read(&self, stream: &str, from_version: u64) -> Result<Vec<AuditEvent>, Error>;

    fn metadata(&self, stream: &str) -> Result<StreamMetadata, Error>;

    /// Close a stream to further appends
    fn seal(&self, stream: &str) -> Result<(), Error>;

    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), Error>;

    fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, Error>;

    fn streams(&self) -> Result<Vec<String>, Error>;
}

impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    fn append(
        &self,
        stream: &str,
        expected_version: u64,
        events: Vec<AuditEvent>,
    ) -> Result<AppendResult, Error> {
        (**self).append(stream, expected_version, events)
    }

    fn read(&self, stream: &str, from_version: u64) -> Result<Vec<AuditEvent>, Error> {
        (**self).read(stream, from_version)
    }

    fn metadata(&self, stream: &str) -> Result<StreamMetadata, Error> {
        (**self).metadata(stream)
    }

    fn seal(&self, stream: &str) -> Result<(), Error> {
        (**self).seal(stream)
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), Error> {
        (**self).save_snapshot(snapshot)
    }

    fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, Error> {
        (**self).load_snapshot(aggregate_id)
    }

    fn streams(&self) -> Result<Vec<String>, Error> {
        (**self).streams()
    }
}

#[derive(Default, Clone)]
struct Stream {
    events: Vec<AuditEvent>,
    sealed: bool,
}

impl Stream {
    fn metadata(&self, stream_id: &str) -> StreamMetadata {
        StreamMetadata {
            stream_id: stream_id.to_owned(),
            version: self.events.len() as u64,
            sealed: self.sealed,
            head_hash: self
                .events
                .last()
                .map(|e| e.audit_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_owned()),
        }
    }
}

/// A simple thread-safe store that keeps streams in an in-memory BTreeMap
#[derive(Default)]
pub struct MemEventStore {
    streams: RwLock<BTreeMap<String, Stream>>,
    snapshots: RwLock<BTreeMap<String, Snapshot>>,
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("lock poisoned".to_owned())
}

impl MemEventStore {
    pub fn new() -> Self {
        MemEventStore::default()
    }
}

impl EventStore for MemEventStore {
    fn append(
        &self,
        stream: &str,
        expected_version: u64,
        events: Vec<AuditEvent>,
    ) -> Result<AppendResult, Error> {
        let mut streams = self.streams.write().map_err(poisoned)?;
        let entry = streams.entry(stream.to_owned()).or_default();

        if entry.sealed {
            return Err(Error::StreamSealed(stream.to_owned()));
        }

        let actual = entry.events.len() as u64;
        if actual != expected_version {
            warn!(
                "append to {} at version {} rejected, stream is at {}",
                stream, expected_version, actual
            );
            return Err(Error::ConcurrencyConflict {
                stream: stream.to_owned(),
                expected: expected_version,
                actual,
            });
        }

        for (i, event) in events.iter().enumerate() {
            let expected = actual + i as u64 + 1;
            if event.version != expected || event.aggregate_id != stream {
                return Err(Error::Integrity(IntegrityError {
                    stream: stream.to_owned(),
                    version: expected,
                    failure: if event.version != expected {
                        IntegrityFailure::VersionGap {
                            expected,
                            found: event.version,
                        }
                    } else {
                        IntegrityFailure::WrongAggregate(event.aggregate_id.clone())
                    },
                }));
            }
        }

        entry.events.extend(events);
        Ok(AppendResult {
            success: true,
            new_version: entry.events.len() as u64,
        })
    }

    fn read(&self, stream: &str, from_version: u64) -> Result<Vec<AuditEvent>, Error> {
        let streams = self.streams.read().map_err(poisoned)?;
        Ok(streams
            .get(stream)
            .map(|s| {
                s.events
                    .iter()
                    .filter(|e| e.version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn metadata(&self, stream: &str) -> Result<StreamMetadata, Error> {
        let streams = self.streams.read().map_err(poisoned)?;
        Ok(streams
            .get(stream)
            .map(|s| s.metadata(stream))
            .unwrap_or_else(|| Stream::default().metadata(stream)))
    }

    fn seal(&self, stream: &str) -> Result<(), Error> {
        let mut streams = self.streams.write().map_err(poisoned)?;
        streams.entry(stream.to_owned()).or_default().sealed = true;
        Ok(())
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), Error> {
        let mut snapshots = self.snapshots.write().map_err(poisoned)?;
        snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, Error> {
        let snapshots = self.snapshots.read().map_err(poisoned)?;
        Ok(snapshots.get(aggregate_id).cloned())
    }

    fn streams(&self) -> Result<Vec<String>, Error> {
        let streams = self.streams.read().map_err(poisoned)?;
        Ok(streams.keys().cloned().collect())
    }
}

/// Load an exported event list, grouping events by aggregate id in their given order
impl From<Vec<AuditEvent>> for MemEventStore {
    fn from(events: Vec<AuditEvent>) -> Self {
        let mut streams: BTreeMap<String, Stream> = BTreeMap::new();
        for event in events {
            streams
                .entry(event.aggregate_id.clone())
                .or_default()
                .events
                .push(event);
        }
        MemEventStore {
            streams: RwLock::new(streams),
            snapshots: RwLock::new(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;

    fn chain() -> AuditChain<Arc<MemEventStore>, Ed25519Signer> {
        AuditChain::new(Arc::new(MemEventStore::new()), Ed25519Signer::generate())
    }

    #[test]
    fn empty_stream_is_version_zero() {
        let store = MemEventStore::new();
        let meta = store.metadata("nothing").unwrap();
        assert_eq!(meta.version, 0);
        assert_eq!(meta.head_hash, GENESIS_HASH);
        assert!(!meta.sealed);
        assert!(store.read("nothing", 0).unwrap().is_empty());
    }

    #[test]
    fn concurrent_appends_one_wins() {
        let chain = Arc::new(chain());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let chain = chain.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    chain.append(
                        "session-x",
                        0,
                        vec![(EventType::RoundComputed, json!({ "writer": i }))],
                    )
                })
            })
            .collect();

        let outcomes: Vec<Result<AppendResult, Error>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let wins = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(wins, 1);
        let loser = outcomes.into_iter().find(|o| o.is_err()).unwrap().unwrap_err();
        assert!(loser.is_retryable());
        assert!(matches!(loser, Error::ConcurrencyConflict { expected: 0, .. }));

        // Loser re-reads and retries at the new version
        let version = chain.version("session-x").unwrap();
        assert_eq!(version, 1);
        let retried = chain
            .append("session-x", version, vec![(EventType::RoundComputed, json!({}))])
            .unwrap();
        assert_eq!(retried.new_version, 2);
    }

    #[test]
    fn sealed_streams_reject_appends() {
        let chain = chain();
        chain
            .append("s", 0, vec![(EventType::ResultsPublished, json!({}))])
            .unwrap();
        chain.seal("s").unwrap();

        let err = chain
            .append("s", 1, vec![(EventType::SessionDisputed, json!({}))])
            .unwrap_err();
        assert!(matches!(err, Error::StreamSealed(_)));
        assert!(err.is_fatal());
        assert!(chain.store().metadata("s").unwrap().sealed);
        assert_eq!(chain.read("s", 0).unwrap().len(), 1);
    }

    #[test]
    fn out_of_order_events_rejected() {
        let source = chain();
        source
            .append("a", 0, vec![(EventType::BallotCast, json!({}))])
            .unwrap();
        let events = source.read("a", 0).unwrap();

        let store = MemEventStore::new();
        let err = store.append("b", 0, events.clone()).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));

        let empty = store.append("a", 0, vec![]).unwrap();
        assert_eq!(empty.new_version, 0);
        store.append("a", 0, events).unwrap();
    }

    #[test]
    fn snapshots_keep_the_latest() {
        let store = MemEventStore::new();
        assert!(store.load_snapshot("session-1").unwrap().is_none());
        for version in 1..=2 {
            store
                .save_snapshot(Snapshot {
                    aggregate_id: "session-1".into(),
                    version,
                    state: json!({ "status": "published" }),
                    taken_at: Utc::now(),
                })
                .unwrap();
        }
        assert_eq!(store.load_snapshot("session-1").unwrap().unwrap().version, 2);
    }

    #[test]
    fn exported_events_regroup_by_stream() {
        let source = chain();
        source
            .append("a", 0, vec![(EventType::BallotCast, json!({}))])
            .unwrap();
        source
            .append("b", 0, vec![(EventType::BallotCast, json!({}))])
            .unwrap();
        let mut all = source.read("a", 0).unwrap();
        all.extend(source.read("b", 0).unwrap());

        let store = MemEventStore::from(all);
        assert_eq!(store.streams().unwrap(), vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(store.metadata("b").unwrap().version, 1);
    }
}
