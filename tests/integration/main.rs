//! Integration tests for Stockpile

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use stockpile::hash::ContentHash;
    use tempfile::TempDir;

    struct Env {
        dir: TempDir,
        config: PathBuf,
    }

    impl Env {
        fn new(hard_limit_mb: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let config = dir.path().join("config.toml");
            let store = dir.path().join("store");
            std::fs::write(
                &config,
                format!(
                    "[store]\nroot = '{}'\n\n[quota]\nhard_limit_mb = {}\n",
                    store.display(),
                    hard_limit_mb
                ),
            )
            .unwrap();
            Self { dir, config }
        }

        fn cmd(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("stockpile");
            cmd.env("STOCKPILE_CONFIG", &self.config).env("NO_COLOR", "1");
            cmd
        }

        fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path
        }
    }

    fn put(env: &Env, path: &Path) -> String {
        let output = env.cmd().arg("put").arg(path).output().unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout)
            .unwrap()
            .lines()
            .next()
            .unwrap()
            .trim()
            .to_string()
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("stockpile")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("content-addressable build cache"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("stockpile")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("stockpile"));
    }

    #[test]
    fn put_prints_hash_and_list_shows_it() {
        let env = Env::new(16);
        let path = env.file("artifact.o", b"object code");

        let hash = put(&env, &path);

        assert_eq!(hash, ContentHash::of(b"object code").to_hex());
        env.cmd()
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains(hash));
    }

    #[test]
    fn put_same_file_twice_reports_already_stored() {
        let env = Env::new(16);
        let path = env.file("lib.a", b"archive");
        put(&env, &path);

        env.cmd()
            .arg("put")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Already stored"));
    }

    #[test]
    fn put_missing_file_fails() {
        let env = Env::new(16);

        env.cmd()
            .args(["put", "/nonexistent/stockpile/input"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Path not found"));
    }

    #[test]
    fn put_larger_than_hard_limit_fails() {
        let env = Env::new(1);
        let path = env.file("huge.bin", &vec![0u8; 2 * 1024 * 1024]);

        env.cmd()
            .arg("put")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cannot reserve"));
        env.cmd()
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn list_empty() {
        let env = Env::new(16);

        env.cmd()
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("Store is empty"));
    }

    #[test]
    fn status_json_reports_usage() {
        let env = Env::new(1);
        put(&env, &env.file("a.bin", &[1u8; 1000]));

        env.cmd()
            .args(["status", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"content_bytes\": 1000"))
            .stdout(predicate::str::contains("\"hard_limit_bytes\": 1048576"))
            .stdout(predicate::str::contains("\"status\": \"ok\""));
    }

    #[test]
    fn purge_with_nothing_to_evict() {
        let env = Env::new(16);

        env.cmd()
            .arg("purge")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to purge"));
    }

    #[test]
    fn calibrate_below_usage_purges() {
        let env = Env::new(16);
        put(&env, &env.file("big.bin", &vec![3u8; 2 * 1024 * 1024]));

        env.cmd()
            .args(["calibrate", "--hard-mb", "1", "--soft-percent", "50"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Evicted 1 entries"));
        env.cmd()
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
    }

    #[test]
    fn calibrate_zero_hard_limit_fails_with_hint() {
        let env = Env::new(16);

        env.cmd()
            .args(["calibrate", "--hard-mb", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid quota calibration"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn calibrate_save_writes_config() {
        let env = Env::new(16);

        env.cmd()
            .args(["calibrate", "--hard-mb", "64", "--save"])
            .assert()
            .success();

        let saved = std::fs::read_to_string(&env.config).unwrap();
        assert!(saved.contains("hard_limit_mb = 64"));
    }

    #[test]
    fn delete_is_idempotent() {
        let env = Env::new(16);
        let hash = put(&env, &env.file("x.bin", b"delete me"));

        env.cmd()
            .args(["delete", &hash])
            .assert()
            .success()
            .stdout(predicate::str::contains("Deleted"));
        env.cmd()
            .args(["delete", &hash])
            .assert()
            .success()
            .stdout(predicate::str::contains("not present"));
    }

    #[test]
    fn delete_rejects_malformed_hash() {
        let env = Env::new(16);

        env.cmd()
            .args(["delete", "abc123"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid content hash"));
    }

    #[test]
    fn put_replicate_reports_unreachable_peers() {
        let env = Env::new(16);
        let mut config = std::fs::read_to_string(&env.config).unwrap();
        config.push_str("\n[replication]\nring = ['ring-peer']\npeers = ['far-peer']\n");
        std::fs::write(&env.config, config).unwrap();
        let path = env.file("shared.o", b"shared object");

        env.cmd()
            .arg("put")
            .arg(&path)
            .arg("--replicate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Proactive copy degraded"))
            .stdout(predicate::str::contains("ring-peer"))
            .stdout(predicate::str::contains("far-peer"));
    }

    #[test]
    fn config_path() {
        let env = Env::new(16);

        env.cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let env = Env::new(16);

        env.cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[quota]"))
            .stdout(predicate::str::contains("hard_limit_mb = 16"));
    }

    #[test]
    fn config_init_does_not_overwrite() {
        let env = Env::new(16);

        env.cmd()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));
        assert!(std::fs::read_to_string(&env.config)
            .unwrap()
            .contains("hard_limit_mb = 16"));
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let env = Env::new(16);
        std::fs::write(&env.config, "[quota]\nhard_limit_mb = \"lots\"\n").unwrap();

        env.cmd()
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("config init --force"));
    }
}

mod cluster_tests {
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use stockpile::context::OperationContext;
    use stockpile::error::StockpileResult;
    use stockpile::hash::ContentHash;
    use stockpile::index::ContentIndex;
    use stockpile::quota::{LeastRecentlyUsed, QuotaKeeper, QuotaLimits};
    use stockpile::replication::{
        CopyRequestHandler, CopyStatus, DeleteFileHandler, DeleteOptions, DeleteResult,
        DeleteStatus, LocalContentStore, LocationRegistry, LoopbackTransport, MachineId,
        NotNeededReason, PeerTransport, PushRejection, ProactiveCopyMode, ProactiveCopyResult,
        ProactiveCopySettings, PushFileHandler, PushSource, PushStatus, PutResult, PutStatus,
        RemoteContent, ReplicationSettings, SkipReason, StaticRing,
    };
    use stockpile::storage::{ContentStorage, ContentStream, MemoryStorage};
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    /// Loopback transport that counts fetches
    #[derive(Debug, Default)]
    struct CountingTransport {
        inner: LoopbackTransport,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PeerTransport for CountingTransport {
        async fn has_content(
            &self,
            ctx: &OperationContext,
            target: &MachineId,
            hash: ContentHash,
        ) -> StockpileResult<bool> {
            self.inner.has_content(ctx, target, hash).await
        }

        async fn push(
            &self,
            ctx: &OperationContext,
            target: &MachineId,
            hash: ContentHash,
            size: u64,
            stream: ContentStream,
            cancel: CancellationToken,
        ) -> StockpileResult<PutResult> {
            self.inner.push(ctx, target, hash, size, stream, cancel).await
        }

        async fn fetch(
            &self,
            ctx: &OperationContext,
            source: &MachineId,
            hash: ContentHash,
        ) -> StockpileResult<RemoteContent> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.fetch(ctx, source, hash).await
        }

        async fn delete(
            &self,
            ctx: &OperationContext,
            target: &MachineId,
            hash: ContentHash,
        ) -> StockpileResult<DeleteResult> {
            self.inner.delete(ctx, target, hash).await
        }
    }

    struct Node {
        store: Arc<LocalContentStore>,
        storage: Arc<MemoryStorage>,
    }

    struct Cluster {
        transport: Arc<CountingTransport>,
        registry: LocationRegistry,
        nodes: HashMap<&'static str, Node>,
    }

    impl Cluster {
        fn new() -> Self {
            Self {
                transport: Arc::new(CountingTransport::default()),
                registry: LocationRegistry::new(),
                nodes: HashMap::new(),
            }
        }

        fn add(
            &mut self,
            name: &'static str,
            ring: &[&str],
            peers: &[&str],
            hard_limit: u64,
            proactive: ProactiveCopySettings,
        ) {
            let machine = MachineId::from(name);
            let storage = Arc::new(MemoryStorage::new());
            let keeper = QuotaKeeper::start(
                Arc::new(ContentIndex::new()),
                storage.clone(),
                Arc::new(LeastRecentlyUsed),
                QuotaLimits::new(hard_limit, hard_limit).unwrap(),
            );
            let locator = StaticRing::new(
                machine.clone(),
                ring.iter().map(|m| MachineId::from(*m)),
                peers.iter().map(|m| MachineId::from(*m)),
                self.registry.clone(),
            );
            let transport: Arc<dyn PeerTransport> = self.transport.clone();
            let store = Arc::new(LocalContentStore::new(
                machine.clone(),
                keeper,
                storage.clone(),
                Arc::new(locator),
                transport,
                ReplicationSettings {
                    proactive,
                    max_concurrent_inbound_pushes: 4,
                },
            ));
            self.transport.inner.register(machine, &store);
            self.nodes.insert(name, Node { store, storage });
        }

        fn store(&self, name: &str) -> &Arc<LocalContentStore> {
            &self.nodes[name].store
        }

        fn storage(&self, name: &str) -> &Arc<MemoryStorage> {
            &self.nodes[name].storage
        }
    }

    fn both() -> ProactiveCopySettings {
        ProactiveCopySettings {
            mode: ProactiveCopyMode::Both,
            locations_threshold: 3,
            push_timeout: Duration::from_secs(5),
        }
    }

    fn three_machines() -> Cluster {
        let mut cluster = Cluster::new();
        cluster.add("a", &["b"], &["x"], 1024, both());
        cluster.add("b", &["a"], &["x"], 1024, both());
        cluster.add("x", &[], &["a", "b"], 1024, both());
        cluster
    }

    #[tokio::test]
    async fn proactive_copy_reaches_both_sides() {
        let cluster = three_machines();
        let ctx = OperationContext::new();
        let hash = cluster
            .store("a")
            .put_bytes(&ctx, b"fresh artifact".to_vec())
            .await
            .hash();

        let result = cluster
            .store("a")
            .proactive_copy(&ctx, hash, CancellationToken::new())
            .await;

        assert!(result.was_proactive_copy_needed());
        assert!(result.succeeded(), "{:?}", result);
        assert!(cluster.store("b").index().contains(&hash));
        assert!(cluster.store("x").index().contains(&hash));
        assert_eq!(cluster.registry.locations(&hash).len(), 3);
    }

    #[tokio::test]
    async fn proactive_copy_with_one_failed_side_names_both() {
        let cluster = three_machines();
        cluster
            .transport
            .inner
            .set_reachable(&MachineId::from("x"), false);
        let ctx = OperationContext::new();
        let hash = cluster
            .store("a")
            .put_bytes(&ctx, b"partly replicated".to_vec())
            .await
            .hash();

        let result = cluster
            .store("a")
            .proactive_copy(&ctx, hash, CancellationToken::new())
            .await;

        let message = result.error_message().unwrap();
        assert!(message.contains("Ring: succeeded to b"), "{}", message);
        assert!(message.contains("Outside ring: failed on x"), "{}", message);
        assert!(cluster.store("b").index().contains(&hash));
        assert!(!cluster.store("x").index().contains(&hash));
    }

    #[tokio::test]
    async fn sufficiently_replicated_copy_is_not_needed() {
        let mut cluster = Cluster::new();
        let settings = ProactiveCopySettings {
            locations_threshold: 1,
            ..both()
        };
        cluster.add("a", &["b"], &[], 1024, settings);
        cluster.add("b", &["a"], &[], 1024, settings);
        let ctx = OperationContext::new();
        let hash = cluster
            .store("a")
            .put_bytes(&ctx, b"enough".to_vec())
            .await
            .hash();

        let result = cluster
            .store("a")
            .proactive_copy(&ctx, hash, CancellationToken::new())
            .await;

        assert_eq!(
            result,
            ProactiveCopyResult::not_needed(NotNeededReason::SufficientlyReplicated {
                locations: 1
            })
        );
        assert!(result.error_message().is_none());
        assert!(!cluster.store("b").index().contains(&hash));
    }

    #[tokio::test]
    async fn inside_ring_mode_skips_outside_side() {
        let mut cluster = Cluster::new();
        let settings = ProactiveCopySettings {
            mode: ProactiveCopyMode::InsideRing,
            ..both()
        };
        cluster.add("a", &["b"], &["x"], 1024, settings);
        cluster.add("b", &["a"], &["x"], 1024, both());
        cluster.add("x", &[], &["a", "b"], 1024, both());
        let ctx = OperationContext::new();
        let hash = cluster
            .store("a")
            .put_bytes(&ctx, b"ring only".to_vec())
            .await
            .hash();

        let result = cluster
            .store("a")
            .proactive_copy(&ctx, hash, CancellationToken::new())
            .await;

        let ProactiveCopyResult::Needed { ring, outside_ring } = result else {
            panic!("expected a copy");
        };
        assert_eq!(ring.status(), PushStatus::Succeeded);
        assert_eq!(
            outside_ring.status(),
            PushStatus::Skipped(SkipReason::DisabledByMode)
        );
        assert!(!cluster.store("x").index().contains(&hash));
    }

    #[tokio::test]
    async fn cancelled_push_leaves_no_trace() {
        let cluster = three_machines();
        let data = vec![9u8; 1024];
        let hash = ContentHash::of(&data);
        let (mut writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let target = Arc::clone(cluster.store("b"));
        let token = cancel.clone();
        let push = tokio::spawn(async move {
            target
                .handle_push_file(
                    &OperationContext::new(),
                    hash,
                    PushSource::Stream {
                        size: data.len() as u64,
                        stream: Box::pin(reader),
                    },
                    token,
                )
                .await
        });

        writer.write_all(&vec![9u8; 512]).await.unwrap();
        cancel.cancel();
        let result = push.await.unwrap();

        assert_eq!(result.status(), PutStatus::Failed);
        assert!(result.error_message().unwrap().contains("cancelled"));
        let store = cluster.store("b");
        assert!(!store.index().contains(&hash));
        assert!(!store.has_content_locally(&OperationContext::new(), hash).await);
        assert!(cluster.storage("b").is_empty());
        store.keeper().synchronize().await.unwrap();
        assert_eq!(store.keeper().usage().used_bytes(), 0);
        drop(writer);
    }

    #[tokio::test]
    async fn concurrent_pushes_of_one_hash_are_rejected() {
        let cluster = three_machines();
        let data = vec![5u8; 1024];
        let hash = ContentHash::of(&data);
        let (mut writer, reader) = tokio::io::duplex(64);
        let ctx = OperationContext::new();

        let target = Arc::clone(cluster.store("b"));
        let first = tokio::spawn(async move {
            target
                .handle_push_file(
                    &OperationContext::new(),
                    hash,
                    PushSource::Stream {
                        size: 1024,
                        stream: Box::pin(reader),
                    },
                    CancellationToken::new(),
                )
                .await
        });
        writer.write_all(&data[..512]).await.unwrap();

        let second = cluster
            .store("b")
            .handle_push_file(&ctx, hash, PushSource::bytes(data.clone()), CancellationToken::new())
            .await;
        writer.write_all(&data[512..]).await.unwrap();
        drop(writer);
        let first = first.await.unwrap();

        assert_eq!(second.status(), PutStatus::Rejected(PushRejection::OngoingCopy));
        assert_eq!(first.status(), PutStatus::Stored);
        assert!(cluster.store("b").index().contains(&hash));
    }

    #[tokio::test]
    async fn push_evicts_cold_content_for_room() {
        let mut cluster = Cluster::new();
        cluster.add("a", &[], &[], 100, both());
        let ctx = OperationContext::new();
        let cold = cluster
            .store("a")
            .put_bytes(&ctx, vec![1u8; 80])
            .await
            .hash();

        let incoming = vec![2u8; 50];
        let hash = ContentHash::of(&incoming);
        let result = cluster
            .store("a")
            .handle_push_file(&ctx, hash, PushSource::bytes(incoming), CancellationToken::new())
            .await;

        assert_eq!(result.status(), PutStatus::Stored);
        assert!(!cluster.store("a").index().contains(&cold));
        assert!(!cluster.storage("a").contains(&cold));
        assert_eq!(cluster.store("a").index().total_bytes(), 50);
    }

    #[tokio::test]
    async fn concurrent_copy_requests_share_one_pull() {
        let cluster = three_machines();
        let ctx = OperationContext::new();
        let hash = cluster
            .store("b")
            .put_bytes(&ctx, b"wanted everywhere".to_vec())
            .await
            .hash();

        let requester = cluster.store("a");
        let (first, second) = tokio::join!(
            requester.handle_copy_file_request(&ctx, hash),
            requester.handle_copy_file_request(&ctx, hash),
        );

        assert_eq!(first.status(), CopyStatus::Copied);
        assert_eq!(first, second);
        assert_eq!(cluster.transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(requester.read(hash).await.unwrap(), b"wanted everywhere");

        let third = requester.handle_copy_file_request(&ctx, hash).await;
        assert_eq!(third.status(), CopyStatus::AlreadyPresent);
    }

    #[tokio::test]
    async fn copy_skips_stale_location() {
        let mut cluster = Cluster::new();
        cluster.add("alpha", &[], &[], 1024, both());
        cluster.add("beta", &[], &[], 1024, both());
        cluster.add("req", &[], &[], 1024, both());
        let ctx = OperationContext::new();
        let hash = cluster
            .store("beta")
            .put_bytes(&ctx, b"moved around".to_vec())
            .await
            .hash();
        cluster.registry.register(&hash, &MachineId::from("alpha"));

        let result = cluster.store("req").handle_copy_file_request(&ctx, hash).await;

        assert_eq!(result.status(), CopyStatus::Copied);
        assert_eq!(result.source(), Some(&MachineId::from("beta")));
        assert!(result.diagnostics().unwrap().contains("alpha"));
        assert!(!cluster
            .registry
            .locations(&hash)
            .contains(&MachineId::from("alpha")));
    }

    #[tokio::test]
    async fn copy_from_unreachable_only_source_fails() {
        let cluster = three_machines();
        let ctx = OperationContext::new();
        let hash = cluster
            .store("b")
            .put_bytes(&ctx, b"island".to_vec())
            .await
            .hash();
        cluster
            .transport
            .inner
            .set_reachable(&MachineId::from("b"), false);

        let result = cluster.store("a").handle_copy_file_request(&ctx, hash).await;

        assert_eq!(result.status(), CopyStatus::Failed);
        assert!(result.diagnostics().unwrap().contains("unreachable"));
        assert!(!cluster.store("a").index().contains(&hash));
    }

    #[tokio::test]
    async fn double_delete_of_absent_content_succeeds() {
        let cluster = three_machines();
        let ctx = OperationContext::new();
        let hash = ContentHash::of(b"never stored");

        let first = cluster
            .store("a")
            .handle_delete(&ctx, hash, DeleteOptions::default())
            .await;
        let second = cluster
            .store("a")
            .handle_delete(&ctx, hash, DeleteOptions::default())
            .await;

        assert_eq!(first.status(), DeleteStatus::Absent);
        assert_eq!(second.status(), DeleteStatus::Absent);
        assert!(first.succeeded() && second.succeeded());
    }

    #[tokio::test]
    async fn fan_out_delete_reaches_every_location() {
        let cluster = three_machines();
        let ctx = OperationContext::new();
        let hash = cluster
            .store("a")
            .put_bytes(&ctx, b"retract".to_vec())
            .await
            .hash();
        cluster
            .store("a")
            .proactive_copy(&ctx, hash, CancellationToken::new())
            .await;
        assert_eq!(cluster.registry.locations(&hash).len(), 3);

        let result = cluster
            .store("a")
            .handle_delete(&ctx, hash, DeleteOptions { fan_out: true })
            .await;

        assert_eq!(result.status(), DeleteStatus::Deleted);
        let report = result.diagnostics().unwrap();
        assert!(report.contains("b: deleted"), "{}", report);
        assert!(report.contains("x: deleted"), "{}", report);
        for name in ["a", "b", "x"] {
            assert!(!cluster.store(name).index().contains(&hash));
            assert!(cluster.storage(name).list().await.unwrap().is_empty());
        }
        assert!(cluster.registry.locations(&hash).is_empty());
    }
}
