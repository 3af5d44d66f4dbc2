use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use kestrel_checkpoint::{
    CheckpointError, CheckpointRecord, CheckpointStore, CommitState, LocalObjectStore,
    MemoryObjectStore, ObjectStore, ObjectStoreError,
};
use kestrel_core::{AcceleratorKind, JobId, Topology};
use kestrel_sharding::{ModelShapes, PartitionPlan, ShardId, TensorSpec, plan};
use pretty_assertions::assert_eq;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Wraps a store and fails puts whose path contains one of the configured
/// fragments.
#[derive(Debug, Default)]
struct FaultyStore {
    inner: MemoryObjectStore,
    fail_puts: Mutex<Vec<String>>,
    puts: AtomicUsize,
}

impl FaultyStore {
    fn fail_puts_containing(&self, fragment: &str) {
        self.fail_puts.lock().unwrap().push(fragment.to_owned());
    }

    fn heal(&self) {
        self.fail_puts.lock().unwrap().clear();
    }

    fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        if self
            .fail_puts
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
        {
            return Err(ObjectStoreError::Backend(format!("injected failure for {path}")));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(path, data).await
    }

    async fn get(&self, path: &str) -> Result<Bytes, ObjectStoreError> {
        self.inner.get(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError> {
        self.inner.delete(path).await
    }
}

fn job() -> JobId {
    JobId::new("ft-run").unwrap()
}

/// Five trainable shards over a single rank.
fn five_shard_plan() -> PartitionPlan {
    let model = ModelShapes::new(
        (0..5)
            .map(|i| TensorSpec::new(format!("w{i}"), [4, 4]))
            .collect(),
    );
    let topology = Topology::uniform(1, "host", AcceleratorKind::Cpu, 1).unwrap();
    plan(&model, &topology).unwrap()
}

fn payload(shard: &ShardId, step: u64) -> Bytes {
    Bytes::from(format!("{shard}@{step}"))
}

async fn commit_all(
    store: &CheckpointStore,
    plan: &PartitionPlan,
    step: u64,
) -> CheckpointRecord {
    let record = store.begin_commit(&job(), step, plan).await.unwrap();
    for shard in &record.manifest {
        store
            .upload_shard(&record, shard, payload(shard, step))
            .await
            .unwrap();
    }
    store.finalize(&record).await.unwrap()
}

fn memory_store() -> (Arc<FaultyStore>, CheckpointStore) {
    let objects = Arc::new(FaultyStore::default());
    let store = CheckpointStore::new(objects.clone());
    (objects, store)
}

#[test_log::test(tokio::test)]
async fn test_commit_and_load() {
    let (_, store) = memory_store();
    let plan = five_shard_plan();
    let record = commit_all(&store, &plan, 10).await;

    assert_eq!(record.state, CommitState::Committed);
    assert_eq!(record.shards.len(), 5);
    assert_eq!(record.plan_fingerprint, plan.fingerprint());

    let latest = store.latest_committed(&job()).await.unwrap().unwrap();
    assert_eq!(latest, record);
    for shard in &latest.manifest {
        let bytes = store.load_shard(&latest, shard).await.unwrap();
        assert_eq!(bytes, payload(shard, 10));
    }
}

#[tokio::test]
async fn test_failed_upload_never_commits() {
    let (objects, store) = memory_store();
    let plan = five_shard_plan();
    commit_all(&store, &plan, 16).await;

    let record = store.begin_commit(&job(), 20, &plan).await.unwrap();
    objects.fail_puts_containing("w2--");
    let mut failures = 0;
    for shard in &record.manifest {
        if store
            .upload_shard(&record, shard, payload(shard, 20))
            .await
            .is_err()
        {
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    match store.finalize(&record).await {
        Err(CheckpointError::IncompleteCheckpoint { step, missing }) => {
            assert_eq!(step, 20);
            assert_eq!(missing, vec![ShardId::new("w2", 0)]);
        }
        other => panic!("expected IncompleteCheckpoint, got {other:?}"),
    }
    assert_eq!(
        store.latest_committed(&job()).await.unwrap().unwrap().step,
        16
    );
    let stored = store.record(&job(), 20).await.unwrap().unwrap();
    assert_eq!(stored.state, CommitState::InProgress);

    // the next attempt at the same step succeeds once the store recovers
    objects.heal();
    let retry = commit_all(&store, &plan, 20).await;
    assert!(retry.is_committed());
    assert_eq!(store.latest_committed(&job()).await.unwrap().unwrap().step, 20);
}

#[tokio::test]
async fn test_crash_mid_commit_is_swept() {
    let (_, store) = memory_store();
    let plan = five_shard_plan();
    commit_all(&store, &plan, 16).await;

    // three of five shards uploaded, then the writer dies
    let record = store.begin_commit(&job(), 17, &plan).await.unwrap();
    for shard in record.manifest.iter().take(3) {
        store
            .upload_shard(&record, shard, payload(shard, 17))
            .await
            .unwrap();
    }

    assert_eq!(store.latest_committed(&job()).await.unwrap().unwrap().step, 16);

    assert!(store
        .sweep_abandoned(&job(), Utc::now())
        .await
        .unwrap()
        .is_empty());
    let later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(store.sweep_abandoned(&job(), later).await.unwrap(), vec![17]);

    assert!(store.record(&job(), 17).await.unwrap().is_none());
    let leftover = store
        .object_store()
        .list("ft-run/step-000000000017/")
        .await
        .unwrap();
    assert!(leftover.is_empty(), "{leftover:?}");
    assert_eq!(store.latest_committed(&job()).await.unwrap().unwrap().step, 16);
}

#[tokio::test]
async fn test_reupload_identical_is_noop() {
    let (objects, store) = memory_store();
    let plan = five_shard_plan();
    let record = store.begin_commit(&job(), 1, &plan).await.unwrap();
    let shard = record.manifest[0].clone();

    let first = store
        .upload_shard(&record, &shard, payload(&shard, 1))
        .await
        .unwrap();
    let puts = objects.puts();
    let second = store
        .upload_shard(&record, &shard, payload(&shard, 1))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(objects.puts(), puts);
}

#[tokio::test]
async fn test_unexpected_shard_rejected() {
    let (_, store) = memory_store();
    let record = store
        .begin_commit(&job(), 1, &five_shard_plan())
        .await
        .unwrap();
    let err = store
        .upload_shard(&record, &ShardId::new("nope", 0), Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::UnexpectedShard { step: 1, .. }));
}

#[tokio::test]
async fn test_committed_step_is_immutable() {
    let (_, store) = memory_store();
    let plan = five_shard_plan();
    let record = commit_all(&store, &plan, 5).await;

    assert!(matches!(
        store.begin_commit(&job(), 5, &plan).await,
        Err(CheckpointError::AlreadyCommitted { step: 5, .. })
    ));
    let shard = &record.manifest[0];
    assert!(matches!(
        store
            .upload_shard(&record, shard, Bytes::from_static(b"different"))
            .await,
        Err(CheckpointError::AlreadyCommitted { .. })
    ));

    // finalize is safe to retry
    let again = store.finalize(&record).await.unwrap();
    assert_eq!(again, record);
}

#[tokio::test]
async fn test_tampered_shard_detected_and_marked_corrupt() {
    let (objects, store) = memory_store();
    let plan = five_shard_plan();
    commit_all(&store, &plan, 8).await;
    let record = commit_all(&store, &plan, 9).await;

    let shard = record.manifest[3].clone();
    objects
        .inner
        .put(
            "ft-run/step-000000000009/shards/w3--00000.bin",
            Bytes::from_static(b"bit rot"),
        )
        .await
        .unwrap();

    match store.load_shard(&record, &shard).await {
        Err(CheckpointError::ChecksumMismatch { shard: bad, expected, .. }) => {
            assert_eq!(bad, shard);
            assert_eq!(expected, record.ack(&shard).unwrap().checksum);
        }
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }

    store.mark_corrupt(&record).await.unwrap();
    assert_eq!(store.latest_committed(&job()).await.unwrap().unwrap().step, 8);
    assert!(matches!(
        store.open_commit(&job(), 9).await,
        Err(CheckpointError::Corrupt { step: 9 })
    ));
}

#[tokio::test]
async fn test_gc_keeps_newest_committed() {
    let (_, store) = memory_store();
    let store = store.with_keep_committed(3);
    let plan = five_shard_plan();
    for step in [10, 20, 30, 40, 50, 60] {
        commit_all(&store, &plan, step).await;
    }
    store.begin_commit(&job(), 5, &plan).await.unwrap();

    assert_eq!(store.gc(&job(), 35).await.unwrap(), vec![10, 20, 30]);
    let steps: Vec<u64> = store
        .records(&job())
        .await
        .unwrap()
        .iter()
        .map(|r| r.step)
        .collect();
    assert_eq!(steps, vec![5, 40, 50, 60]);

    // retention wins over the step threshold
    assert!(store.gc(&job(), 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_point() {
    let (_, store) = memory_store();
    let plan = five_shard_plan();
    assert!(store.resume_point(&job()).await.unwrap().is_none());
    assert!(store.resolve_resume(&job()).await.unwrap().is_none());

    let first = commit_all(&store, &plan, 3).await;
    let point = store.record_resume_point(&job(), &first).await.unwrap();
    assert_eq!(point.step, 3);
    assert_eq!(store.resume_point(&job()).await.unwrap(), Some(point));
    assert_eq!(
        store.resolve_resume(&job()).await.unwrap().unwrap().step,
        3
    );

    let pending = store.begin_commit(&job(), 9, &plan).await.unwrap();
    assert!(matches!(
        store.record_resume_point(&job(), &pending).await,
        Err(CheckpointError::NotCommitted { step: 9 })
    ));
}

#[tokio::test]
async fn test_resume_prefers_newer_commit_over_resume_point() {
    let (_, store) = memory_store();
    let plan = five_shard_plan();
    let first = commit_all(&store, &plan, 20).await;
    store.record_resume_point(&job(), &first).await.unwrap();
    commit_all(&store, &plan, 40).await;

    let resumed = store.resolve_resume(&job()).await.unwrap().unwrap();
    assert_eq!(resumed.step, 40);
    // training on from the resumed step commits past it
    store.begin_commit(&job(), 42, &plan).await.unwrap();

    // a corrupt newest step falls back to the next committed one
    store.mark_corrupt(&resumed).await.unwrap();
    assert_eq!(
        store.resolve_resume(&job()).await.unwrap().unwrap().step,
        20
    );
}

#[tokio::test]
async fn test_local_store_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(Arc::new(LocalObjectStore::new(dir.path())))
        .with_abandon_after(Duration::from_secs(1));
    let plan = five_shard_plan();
    let record = commit_all(&store, &plan, 2).await;

    assert!(dir
        .path()
        .join("ft-run/step-000000000002/record.json")
        .is_file());
    let reopened = CheckpointStore::new(Arc::new(LocalObjectStore::new(dir.path())));
    let latest = reopened.latest_committed(&job()).await.unwrap().unwrap();
    assert_eq!(latest, record);
    let shard = &latest.manifest[4];
    assert_eq!(
        reopened.load_shard(&latest, shard).await.unwrap(),
        payload(shard, 2)
    );
}
