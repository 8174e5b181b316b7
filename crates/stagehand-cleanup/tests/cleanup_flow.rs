//! End-to-end cleanup and purge flows against in-memory collaborators.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use stagehand_cleanup::{
    CleanupEvent, CollectingSink, ImagesCleanup, ImagesCleanupOptions, Purge, StagesPurge,
    StagesPurgeOptions,
};
use stagehand_core::config::{
    GitHistoryCleanupConfig, ReferencePolicy, RetentionPolicies, StrategyPolicy,
};
use stagehand_core::host_lock::HostLocker;
use stagehand_core::lock::{LockManager, MemoryLockBackend};
use stagehand_core::probe::StaticImagesProbe;
use stagehand_git::FakeGitRepository;
use stagehand_registry::{labels, ImageMetadata, ImagesRepo, MemoryRegistry, RepoStagesStorage};

const REPO: &str = "registry.local/demo";

struct Harness {
    registry: Arc<MemoryRegistry>,
    storage: Arc<RepoStagesStorage>,
    images_repo: Arc<ImagesRepo>,
    lock_manager: Arc<LockManager>,
    host_locker: Arc<HostLocker>,
    sink: Arc<CollectingSink>,
    _lock_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(MemoryRegistry::new(REPO));
        let storage = Arc::new(RepoStagesStorage::new(registry.clone()));
        let images_repo = Arc::new(ImagesRepo::new(registry.clone(), 4));
        let lock_manager = Arc::new(
            LockManager::new(Arc::new(MemoryLockBackend::new()))
                .with_ttl(std::time::Duration::from_secs(5)),
        );
        let lock_dir = tempfile::tempdir().expect("tempdir");
        let host_locker = Arc::new(HostLocker::new(lock_dir.path()).expect("host locker"));
        Self {
            registry,
            storage,
            images_repo,
            lock_manager,
            host_locker,
            sink: Arc::new(CollectingSink::new()),
            _lock_dir: lock_dir,
        }
    }

    fn cleanup(&self, git: FakeGitRepository, options: ImagesCleanupOptions) -> ImagesCleanup {
        ImagesCleanup::new(
            "demo",
            self.storage.clone(),
            self.images_repo.clone(),
            self.lock_manager.clone(),
            self.host_locker.clone(),
            options,
        )
        .with_git(Arc::new(git))
        .with_sink(self.sink.clone())
    }
}

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
}

fn git_with_tag_v1() -> FakeGitRepository {
    let mut git = FakeGitRepository::new();
    git.add_commit("c1", &[], at(1));
    git.add_tag("v1", "c1");
    git.add_branch("main", "c1");
    git
}

#[tokio::test]
async fn test_nonexistent_git_tag_image_is_deleted() {
    let harness = Harness::new();
    harness.registry.seed_image(
        "v9",
        &[(labels::TAG_STRATEGY, "git-tag"), (labels::META_TAG, "v9")],
        at(1),
    );
    harness.registry.seed_image(
        "v1",
        &[(labels::TAG_STRATEGY, "git-tag"), (labels::META_TAG, "v1")],
        at(1),
    );

    let engine = harness.cleanup(
        git_with_tag_v1(),
        ImagesCleanupOptions {
            image_names: vec![String::new()],
            without_kube: true,
            ..ImagesCleanupOptions::default()
        },
    );
    let report = engine.run(&CancellationToken::new()).await.expect("run");

    assert_eq!(report.deleted_tags, vec![format!("{REPO}:v9")]);
    assert_eq!(harness.registry.tags(), vec!["v1".to_string()]);
    assert!(!report.has_errors());
}

#[tokio::test]
async fn test_retention_by_limit_deletes_oldest() {
    let harness = Harness::new();
    let mut git = FakeGitRepository::new();
    for day in 1..=5 {
        let commit = format!("c{day}");
        if day == 1 {
            git.add_commit(&commit, &[], at(day));
        } else {
            let parent = format!("c{}", day - 1);
            git.add_commit(&commit, &[parent.as_str()], at(day));
        }
        harness.registry.seed_image(
            &commit,
            &[
                (labels::TAG_STRATEGY, "git-commit"),
                (labels::META_TAG, commit.as_str()),
            ],
            at(day),
        );
    }
    git.add_branch("main", "c5");

    let engine = harness.cleanup(
        git,
        ImagesCleanupOptions {
            image_names: vec![String::new()],
            without_kube: true,
            policies: RetentionPolicies {
                git_commit: StrategyPolicy {
                    limit: Some(3),
                    expiry: None,
                },
                ..RetentionPolicies::default()
            },
            ..ImagesCleanupOptions::default()
        },
    );
    let report = engine.run(&CancellationToken::new()).await.expect("run");

    let deleted: HashSet<String> = report.deleted_tags.into_iter().collect();
    assert_eq!(
        deleted,
        HashSet::from([format!("{REPO}:c1"), format!("{REPO}:c2")])
    );
    assert_eq!(
        harness.registry.tags(),
        vec!["c3".to_string(), "c4".to_string(), "c5".to_string()]
    );
}

#[tokio::test]
async fn test_deployed_images_are_never_deleted() {
    let harness = Harness::new();
    harness.registry.seed_image(
        "v9",
        &[(labels::TAG_STRATEGY, "git-tag"), (labels::META_TAG, "v9")],
        at(1),
    );

    let engine = harness
        .cleanup(
            git_with_tag_v1(),
            ImagesCleanupOptions {
                image_names: vec![String::new()],
                ..ImagesCleanupOptions::default()
            },
        )
        .with_probe(Arc::new(StaticImagesProbe::new([format!("{REPO}:v9")])));
    let report = engine.run(&CancellationToken::new()).await.expect("run");

    // The tag's git tag is gone, but the deployed reference wins.
    assert!(report.deleted_tags.is_empty());
    assert_eq!(report.kept_tags, vec![format!("{REPO}:v9")]);
    assert_eq!(harness.registry.tags(), vec!["v9".to_string()]);
    assert!(harness.sink.events().contains(&CleanupEvent::ImageKept {
        image: String::new(),
        tag: "v9".into(),
        reason: "deployed in kubernetes",
    }));
}

#[tokio::test]
async fn test_history_based_cleanup_keeps_reachable_signatures() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    // Ancestry c5 -> c4 -> ... -> c1 on main.
    let mut git = FakeGitRepository::new();
    for day in 1..=5 {
        let commit = format!("c{day}");
        if day == 1 {
            git.add_commit(&commit, &[], at(day));
        } else {
            let parent = format!("c{}", day - 1);
            git.add_commit(&commit, &[parent.as_str()], at(day));
        }
    }
    git.add_branch("main", "c5");

    // sigA was built at c4 (within limit 2), sigB at c2 (outside).
    harness
        .storage
        .put_image_commit(
            "",
            "c4",
            &ImageMetadata {
                content_signature: "sigA".into(),
            },
            &cancel,
        )
        .await
        .expect("metadata");
    harness
        .storage
        .put_image_commit(
            "",
            "c2",
            &ImageMetadata {
                content_signature: "sigB".into(),
            },
            &cancel,
        )
        .await
        .expect("metadata");
    harness
        .registry
        .seed_image("img-a", &[(labels::CONTENT_SIGNATURE, "sigA")], at(4));
    harness
        .registry
        .seed_image("img-b", &[(labels::CONTENT_SIGNATURE, "sigB")], at(2));

    let engine = harness.cleanup(
        git,
        ImagesCleanupOptions {
            image_names: vec![String::new()],
            without_kube: true,
            git_history_based_cleanup: true,
            history_config: Some(GitHistoryCleanupConfig {
                references: vec![ReferencePolicy {
                    branch: Some("main".into()),
                    limit: Some(2),
                    ..ReferencePolicy::default()
                }],
                images_per_reference: None,
            }),
            ..ImagesCleanupOptions::default()
        },
    );
    let report = engine.run(&cancel).await.expect("run");

    assert_eq!(report.deleted_tags, vec![format!("{REPO}:img-b")]);
    assert_eq!(report.kept_tags, vec![format!("{REPO}:img-a")]);
    // sigB's metadata record is orphaned and collected.
    assert_eq!(report.deleted_metadata, vec![(String::new(), "c2".to_string())]);

    let tags = harness.registry.tags();
    assert!(tags.contains(&"img-a".to_string()));
    assert!(!tags.contains(&"img-b".to_string()));
    assert!(!tags.iter().any(|tag| tag.ends_with("-c2")));
}

#[tokio::test]
async fn test_history_mode_keeps_tags_without_metadata_unless_v12() {
    for (v12, expect_deleted) in [(false, false), (true, true)] {
        let harness = Harness::new();
        let mut git = FakeGitRepository::new();
        git.add_commit("c1", &[], at(1));
        git.add_branch("main", "c1");

        harness.registry.seed_image("mystery", &[], at(1));

        let engine = harness.cleanup(
            git,
            ImagesCleanupOptions {
                image_names: vec![String::new()],
                without_kube: true,
                git_history_based_cleanup: !v12,
                git_history_based_cleanup_v12: v12,
                ..ImagesCleanupOptions::default()
            },
        );
        let report = engine.run(&CancellationToken::new()).await.expect("run");

        if expect_deleted {
            assert_eq!(report.deleted_tags, vec![format!("{REPO}:mystery")]);
            assert!(harness.registry.tags().is_empty());
        } else {
            assert!(report.deleted_tags.is_empty());
            assert_eq!(harness.registry.tags(), vec!["mystery".to_string()]);
        }
    }
}

#[tokio::test]
async fn test_dry_run_never_writes() {
    let harness = Harness::new();
    harness.registry.seed_image(
        "v9",
        &[(labels::TAG_STRATEGY, "git-tag"), (labels::META_TAG, "v9")],
        at(1),
    );

    let engine = harness.cleanup(
        git_with_tag_v1(),
        ImagesCleanupOptions {
            image_names: vec![String::new()],
            without_kube: true,
            dry_run: true,
            ..ImagesCleanupOptions::default()
        },
    );
    let report = engine.run(&CancellationToken::new()).await.expect("run");

    // The intention is reported, the adapter never sees a write.
    assert_eq!(report.deleted_tags, vec![format!("{REPO}:v9")]);
    assert_eq!(harness.registry.write_count(), 0);
    assert_eq!(harness.registry.tags(), vec!["v9".to_string()]);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let harness = Harness::new();
    for day in 1..=5 {
        let tag = format!("c{day}");
        harness.registry.seed_image(
            &tag,
            &[
                (labels::TAG_STRATEGY, "git-commit"),
                (labels::META_TAG, tag.as_str()),
            ],
            at(day),
        );
    }

    let git = || {
        let mut git = FakeGitRepository::new();
        for day in 1..=5 {
            let commit = format!("c{day}");
            if day == 1 {
                git.add_commit(&commit, &[], at(day));
            } else {
                let parent = format!("c{}", day - 1);
                git.add_commit(&commit, &[parent.as_str()], at(day));
            }
        }
        git.add_branch("main", "c5");
        git
    };
    let options = || ImagesCleanupOptions {
        image_names: vec![String::new()],
        without_kube: true,
        policies: RetentionPolicies {
            git_commit: StrategyPolicy {
                limit: Some(3),
                expiry: None,
            },
            ..RetentionPolicies::default()
        },
        ..ImagesCleanupOptions::default()
    };

    let first = harness
        .cleanup(git(), options())
        .run(&CancellationToken::new())
        .await
        .expect("first run");
    assert_eq!(first.deleted_tags.len(), 2);

    let second = harness
        .cleanup(git(), options())
        .run(&CancellationToken::new())
        .await
        .expect("second run");
    assert!(second.deleted_tags.is_empty());
}

#[tokio::test]
async fn test_purge_empties_the_repository() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    harness.registry.seed_image("abc123-1700000000000", &[], at(1));
    harness.registry.seed_image("abc123-1700000001000", &[], at(1));
    harness.registry.seed_image("backend-v1", &[], at(1));
    harness
        .storage
        .add_managed_image("backend", &cancel)
        .await
        .expect("managed");
    harness
        .storage
        .put_image_commit(
            "backend",
            "0123456789abcdef0123456789abcdef01234567",
            &ImageMetadata {
                content_signature: "sig".into(),
            },
            &cancel,
        )
        .await
        .expect("metadata");
    harness
        .storage
        .post_client_id_record(
            &stagehand_registry::ClientIdRecord {
                client_id: "host-a".into(),
                timestamp_millis: 1_700_000_000_000,
            },
            &cancel,
        )
        .await
        .expect("client id");

    let purge = Purge::new(
        "demo",
        harness.storage.clone(),
        harness.images_repo.clone(),
        harness.lock_manager.clone(),
        harness.host_locker.clone(),
        Vec::new(),
        StagesPurgeOptions::default(),
    )
    .with_sink(harness.sink.clone());
    let report = purge.run(&cancel).await.expect("purge");
    assert!(!report.has_errors());

    assert!(harness.storage.get_all_stages(&cancel).await.expect("stages").is_empty());
    assert!(harness
        .storage
        .get_managed_images(&cancel)
        .await
        .expect("managed")
        .is_empty());
    assert!(harness.registry.tags().is_empty());
}

#[tokio::test]
async fn test_stages_purge_dry_run_reports_without_writes() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness.registry.seed_image("abc123-1700000000000", &[], at(1));

    let purge = StagesPurge::new(
        "demo",
        harness.storage.clone(),
        harness.lock_manager.clone(),
        harness.host_locker.clone(),
        StagesPurgeOptions { dry_run: true },
    );
    let report = purge.run(&cancel).await.expect("purge");

    assert_eq!(report.deleted_stages, vec!["abc123-1700000000000".to_string()]);
    assert_eq!(harness.registry.write_count(), 0);
    assert_eq!(harness.registry.tags(), vec!["abc123-1700000000000".to_string()]);
}

#[tokio::test]
async fn test_cancelled_run_skips_deletes() {
    let harness = Harness::new();
    harness.registry.seed_image(
        "v9",
        &[(labels::TAG_STRATEGY, "git-tag"), (labels::META_TAG, "v9")],
        at(1),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = harness.cleanup(
        git_with_tag_v1(),
        ImagesCleanupOptions {
            image_names: vec![String::new()],
            without_kube: true,
            ..ImagesCleanupOptions::default()
        },
    );
    let err = engine.run(&cancel).await.expect_err("cancelled");
    assert!(matches!(err, stagehand_core::Error::Cancelled { .. }));
    assert_eq!(harness.registry.delete_count(), 0);
}
