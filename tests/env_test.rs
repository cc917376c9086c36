use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cloudenv::bucket::BucketOptions;
use cloudenv::env::{CloudEnv, CloudEnvOptions, EnvState, StaticLiveFiles};
use cloudenv::file::{RandomAccessFile, SequentialFile, WritableFile};
use cloudenv::provider::memory::MemoryProvider;
use cloudenv::provider::{CloudStorageProvider, ProviderOptions, RequestOp};
use cloudenv::Error;
use tempfile::TempDir;

struct Harness {
    memory: MemoryProvider,
    live: StaticLiveFiles,
    env: CloudEnv,
    dir: TempDir,
}

impl Harness {
    async fn new(run_purger: bool, purger_interval: Duration) -> Self {
        let memory = MemoryProvider::default();
        memory.create_bucket("db.snap").await.unwrap();

        let options = CloudEnvOptions {
            src_bucket: BucketOptions::new("snap", "db.", "base", ""),
            dest_bucket: BucketOptions::new("live", "db.", "base", ""),
            storage_provider: Some(Arc::new(memory.clone())),
            run_purger,
            purger_interval,
            ..CloudEnvOptions::default()
        };
        let live = StaticLiveFiles::default();
        let mut env = CloudEnv::new(options, Arc::new(live.clone()));
        env.prepare().await.unwrap();

        Self {
            memory,
            live,
            env,
            dir: TempDir::new().unwrap(),
        }
    }

    async fn upload(&self, fname: &str, body: &str) {
        let local = self
            .dir
            .path()
            .join(format!("upload-{}", fname.replace('/', "_")));
        tokio::fs::write(&local, body).await.unwrap();
        self.env.upload_file(&local, fname).await.unwrap();
    }

    async fn put_source(&self, fname: &str, body: &str) {
        let local = self
            .dir
            .path()
            .join(format!("source-{}", fname.replace('/', "_")));
        tokio::fs::write(&local, body).await.unwrap();
        self.memory
            .put_cloud_object(&local, "db.snap", &format!("base/{}", fname))
            .await
            .unwrap();
    }

    async fn dest_names(&self) -> Vec<String> {
        self.memory.list_cloud_objects("db.live", "base").await.unwrap()
    }
}

#[tokio::test]
async fn test_prepare_rejects_purger_without_destination() {
    let memory = MemoryProvider::default();
    memory.create_bucket("db.snap").await.unwrap();

    let options = CloudEnvOptions {
        src_bucket: BucketOptions::new("snap", "db.", "base", ""),
        dest_bucket: BucketOptions::default(),
        storage_provider: Some(Arc::new(memory)),
        run_purger: true,
        ..CloudEnvOptions::default()
    };
    let mut env = CloudEnv::new(options, Arc::new(StaticLiveFiles::default()));

    let err = env.prepare().await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
    assert!(!env.has_purger());
    assert_eq!(env.state(), EnvState::Constructed);
}

#[tokio::test]
async fn test_prepare_rejects_missing_source_bucket() {
    let options = CloudEnvOptions {
        src_bucket: BucketOptions::new("absent", "db.", "base", ""),
        dest_bucket: BucketOptions::new("live", "db.", "base", ""),
        storage_provider: Some(Arc::new(MemoryProvider::default())),
        ..CloudEnvOptions::default()
    };
    let mut env = CloudEnv::new(options, Arc::new(StaticLiveFiles::default()));

    assert!(matches!(
        env.prepare().await,
        Err(Error::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_prepare_without_provider_fails() {
    let options = CloudEnvOptions {
        dest_bucket: BucketOptions::new("live", "db.", "base", ""),
        ..CloudEnvOptions::default()
    };
    let mut env = CloudEnv::new(options, Arc::new(StaticLiveFiles::default()));
    assert!(matches!(
        env.prepare().await,
        Err(Error::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_prepare_creates_destination_bucket() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    assert!(harness.memory.exists_bucket("db.live").await.is_ok());
    assert_eq!(harness.env.state(), EnvState::Running);
    assert!(!harness.env.has_purger());
}

#[tokio::test]
async fn test_reads_fall_back_to_source_bucket() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.put_source("MANIFEST-000001", "snapshot").await;

    assert_eq!(harness.env.get_file_size("MANIFEST-000001").await.unwrap(), 8);
    harness.env.file_exists("MANIFEST-000001").await.unwrap();
    harness
        .env
        .get_file_modification_time("MANIFEST-000001")
        .await
        .unwrap();

    // A destination copy shadows the source.
    harness.upload("MANIFEST-000001", "live").await;
    assert_eq!(harness.env.get_file_size("MANIFEST-000001").await.unwrap(), 4);

    let missing = harness.env.file_exists("000404.sst").await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn test_get_children_merges_both_buckets() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.put_source("000001.sst", "a").await;
    harness.put_source("CURRENT", "b").await;
    harness.upload("000002.sst", "c").await;
    harness.upload("CURRENT", "d").await;

    let children = harness.env.get_children().await.unwrap();
    assert_eq!(children, vec!["000001.sst", "000002.sst", "CURRENT"]);
}

#[tokio::test]
async fn test_writable_file_round_trip() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    let local = harness.dir.path().join("local/000007.log");

    let mut file = harness
        .env
        .new_writable_file("000007.log", &local)
        .await
        .unwrap();
    file.append(b"record-1;").await.unwrap();
    file.append(b"record-2;").await.unwrap();

    // Not visible before close.
    assert!(harness.env.file_exists("000007.log").await.unwrap_err().is_not_found());
    file.close().await.unwrap();

    let mut reader = harness.env.new_sequential_file("000007.log").await.unwrap();
    assert_eq!(reader.read(9).await.unwrap(), Bytes::from_static(b"record-1;"));
    assert_eq!(reader.read(100).await.unwrap(), Bytes::from_static(b"record-2;"));

    let random = harness.env.new_random_access_file("000007.log").await.unwrap();
    assert_eq!(random.read_at(7, 2).await.unwrap(), Bytes::from_static(b"1;"));
}

#[tokio::test]
async fn test_nested_paths_are_flattened() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.upload("archive/000003.log", "x").await;

    assert_eq!(harness.dest_names().await, vec!["archive-000003.log"]);
    assert_eq!(
        harness.env.object_name("archive/000003.log"),
        "base/archive-000003.log"
    );
}

#[tokio::test]
async fn test_download_file_from_source() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.put_source("OPTIONS-000005", "opts").await;

    let local = harness.dir.path().join("restore/OPTIONS-000005");
    harness.env.download_file("OPTIONS-000005", &local).await.unwrap();
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"opts");
}

#[tokio::test]
async fn test_delete_only_touches_destination() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.put_source("000001.sst", "a").await;

    let err = harness.env.delete_file("000001.sst").await.unwrap_err();
    assert!(err.is_not_found());
    harness.env.file_exists("000001.sst").await.unwrap();
}

#[tokio::test]
async fn test_rename_moves_object() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.upload("MANIFEST-tmp", "m").await;

    harness.env.rename_file("MANIFEST-tmp", "MANIFEST-000002").await.unwrap();
    assert_eq!(harness.dest_names().await, vec!["MANIFEST-000002"]);
}

#[tokio::test]
async fn test_rename_reports_partial_failure() {
    let harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.upload("CURRENT.tmp", "m").await;
    harness.memory.fail_next(RequestOp::Delete, 1);

    let err = harness.env.rename_file("CURRENT.tmp", "CURRENT").await.unwrap_err();
    assert!(matches!(err, Error::PartialFailure(_)));
    assert_eq!(harness.dest_names().await, vec!["CURRENT", "CURRENT.tmp"]);
}

#[tokio::test]
async fn test_purge_keeps_live_and_in_flight_objects() {
    let harness = Harness::new(true, Duration::from_secs(3600)).await;
    assert!(harness.env.has_purger());

    harness.upload("000001.sst", "live").await;
    harness.upload("000002.sst", "dead").await;
    harness.upload("000004.sst", "being rewritten").await;
    harness.live.insert("000001.sst");

    // An open writer claims its name even though the engine has not
    // registered the file yet.
    let local = harness.dir.path().join("000004.sst");
    let writer = harness.env.new_writable_file("000004.sst", &local).await.unwrap();

    let stats = harness.env.purge_now().await.unwrap();
    assert_eq!(stats.listed, 3);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.kept, 2);
    assert_eq!(harness.dest_names().await, vec!["000001.sst", "000004.sst"]);

    drop(writer);
    let stats = harness.env.purge_now().await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(harness.dest_names().await, vec!["000001.sst"]);
}

#[tokio::test]
async fn test_purge_skips_source_in_shared_bucket() {
    let memory = MemoryProvider::default();
    memory.create_bucket("db.shared").await.unwrap();
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("snapshot");
    tokio::fs::write(&local, "snapshot").await.unwrap();
    for key in ["snap/000001.sst", "other-db/base/000002.sst"] {
        memory.put_cloud_object(&local, "db.shared", key).await.unwrap();
    }

    let options = CloudEnvOptions {
        src_bucket: BucketOptions::new("shared", "db.", "snap", ""),
        dest_bucket: BucketOptions::new("shared", "db.", "", ""),
        storage_provider: Some(Arc::new(memory.clone())),
        run_purger: true,
        purger_interval: Duration::from_secs(3600),
        ..CloudEnvOptions::default()
    };
    let live = StaticLiveFiles::new(["000001.sst"]);
    let mut env = CloudEnv::new(options, Arc::new(live));
    env.prepare().await.unwrap();

    let staged = dir.path().join("dead");
    tokio::fs::write(&staged, "dead").await.unwrap();
    env.upload_file(&staged, "000003.sst").await.unwrap();

    let stats = env.purge_now().await.unwrap();
    assert_eq!(stats.listed, 3);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.kept, 2);

    assert_eq!(
        memory.list_cloud_objects("db.shared", "snap").await.unwrap(),
        vec!["000001.sst"]
    );
    memory
        .exists_cloud_object("db.shared", "other-db/base/000002.sst")
        .await
        .unwrap();
    env.file_exists("000001.sst").await.unwrap();
    env.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_purge_never_touches_source() {
    let harness = Harness::new(true, Duration::from_secs(3600)).await;
    harness.put_source("000001.sst", "snapshot").await;

    let stats = harness.env.purge_now().await.unwrap();
    assert_eq!(stats.listed, 0);
    harness.env.file_exists("000001.sst").await.unwrap();
}

#[tokio::test]
async fn test_purge_cycle_fails_on_listing_error() {
    let harness = Harness::new(true, Duration::from_secs(3600)).await;
    harness.upload("000009.sst", "dead").await;
    harness.memory.fail_next(RequestOp::List, 1);

    let err = harness.env.purge_now().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(harness.dest_names().await, vec!["000009.sst"]);

    let stats = harness.env.purge_now().await.unwrap();
    assert_eq!(stats.deleted, 1);
}

#[tokio::test]
async fn test_purge_counts_failed_deletes() {
    let harness = Harness::new(true, Duration::from_secs(3600)).await;
    harness.upload("000010.sst", "dead").await;
    harness.upload("000011.sst", "dead").await;
    harness.memory.fail_next(RequestOp::Delete, 1);

    let stats = harness.env.purge_now().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(harness.dest_names().await.len(), 1);
}

#[tokio::test]
async fn test_background_purger_survives_listing_failure() {
    let mut harness = Harness::new(true, Duration::from_millis(20)).await;
    harness.memory.fail_next(RequestOp::List, 2);
    harness.upload("000020.sst", "dead").await;

    // Poll with metadata calls so the injected listing failures are left
    // to the purger.
    let mut purged = false;
    for _ in 0..100 {
        let lookup = harness
            .memory
            .exists_cloud_object("db.live", "base/000020.sst")
            .await;
        if lookup.is_err_and(|e| e.is_not_found()) {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(purged, "background purger never deleted the dead object");

    harness.env.shutdown().await.unwrap();
    assert_eq!(harness.env.state(), EnvState::Destroyed);
    assert!(!harness.env.has_purger());

    // Nothing is purged after shutdown.
    let local = harness.dir.path().join("late");
    tokio::fs::write(&local, "late").await.unwrap();
    harness
        .memory
        .put_cloud_object(&local, "db.live", "base/late")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.dest_names().await, vec!["late"]);
}

#[tokio::test]
async fn test_operations_after_shutdown_are_rejected() {
    let mut harness = Harness::new(false, Duration::from_secs(3600)).await;
    harness.env.shutdown().await.unwrap();
    harness.env.shutdown().await.unwrap();

    assert!(matches!(
        harness.env.get_children().await,
        Err(Error::InvalidState(_))
    ));
    assert!(harness.env.storage_provider().is_none());
}

#[tokio::test]
async fn test_request_callback_sees_environment_calls() {
    let ops = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&ops);
    let provider_options =
        ProviderOptions::default().with_request_callback(move |event| {
            seen.lock().unwrap().push(event.op);
        });
    let memory = MemoryProvider::new(provider_options);

    let options = CloudEnvOptions {
        dest_bucket: BucketOptions::new("metrics", "db.", "", ""),
        storage_provider: Some(Arc::new(memory)),
        ..CloudEnvOptions::default()
    };
    let mut env = CloudEnv::new(options, Arc::new(StaticLiveFiles::default()));
    env.prepare().await.unwrap();
    // exists_bucket (missing) then create_bucket.
    assert_eq!(*ops.lock().unwrap(), vec![RequestOp::Info, RequestOp::Create]);
    ops.lock().unwrap().clear();

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("f");
    tokio::fs::write(&local, "12345").await.unwrap();
    env.upload_file(&local, "000001.sst").await.unwrap();
    env.get_file_size("000001.sst").await.unwrap();
    env.get_children().await.unwrap();

    assert_eq!(
        *ops.lock().unwrap(),
        vec![RequestOp::Write, RequestOp::Info, RequestOp::List]
    );
    env.shutdown().await.unwrap();
}
