use archivist_core::SegmentId;
use archivist_core::config::{AppConfig, BackupMode, NodeConfig, SiteConfig};
use archivist_daemon::error::{SiteError, SiteResult};
use archivist_daemon::pg::ClusterProbe;
use archivist_daemon::producer::{
    BasebackupJob, BasebackupOutcome, BasebackupProducer, BasebackupRequest, JobReporter,
};
use archivist_daemon::queue::WorkQueue;
use archivist_daemon::state::Activity;
use archivist_daemon::streamer::{LogStreamer, StreamerHandle, StreamerRequest};
use archivist_daemon::Collaborators;
use archivist_storage::{
    FilesystemBackend, ListedObject, ObjectMetadata, ObjectStore, StorageError, StorageResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Probe answering from fixed values. Panics for hosts listed in `panic_hosts`.
#[allow(dead_code)]
pub struct FakeProbe {
    pub server_version: u32,
    pub segment: Mutex<SegmentId>,
    pub fail_hosts: Mutex<HashSet<String>>,
    pub panic_hosts: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl FakeProbe {
    pub fn new(server_version: u32) -> Arc<Self> {
        Arc::new(Self {
            server_version,
            segment: Mutex::new(SegmentId::new(1, 0, 1)),
            fail_hosts: Mutex::new(HashSet::new()),
            panic_hosts: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_host(&self, host: &str) {
        self.fail_hosts.lock().unwrap().insert(host.to_string());
    }

    pub fn panic_on_host(&self, host: &str) {
        self.panic_hosts.lock().unwrap().insert(host.to_string());
    }

    pub fn set_segment(&self, segment: SegmentId) {
        *self.segment.lock().unwrap() = segment;
    }

    fn check(&self, node: &NodeConfig) -> SiteResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_hosts.lock().unwrap().contains(&node.host) {
            panic!("probe exploded for {}", node.host);
        }
        if self.fail_hosts.lock().unwrap().contains(&node.host) {
            return Err(SiteError::Authentication(format!(
                "password authentication failed for {}",
                node.user
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterProbe for FakeProbe {
    async fn server_version(&self, node: &NodeConfig) -> SiteResult<u32> {
        self.check(node)?;
        Ok(self.server_version)
    }

    async fn current_wal_segment(
        &self,
        node: &NodeConfig,
        _server_version: u32,
    ) -> SiteResult<SegmentId> {
        self.check(node)?;
        Ok(*self.segment.lock().unwrap())
    }
}

/// Producer whose jobs are completed by the test.
#[allow(dead_code)]
pub struct FakeProducer {
    pub tool_version: u32,
    pub requests: Mutex<Vec<BasebackupRequest>>,
    pub reporters: Mutex<Vec<JobReporter>>,
    pub fail_sites: Mutex<HashSet<String>>,
    pub panic_sites: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl FakeProducer {
    pub fn new(tool_version: u32) -> Arc<Self> {
        Arc::new(Self {
            tool_version,
            requests: Mutex::new(Vec::new()),
            reporters: Mutex::new(Vec::new()),
            fail_sites: Mutex::new(HashSet::new()),
            panic_sites: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_site(&self, site: &str) {
        self.fail_sites.lock().unwrap().insert(site.to_string());
    }

    pub fn panic_on_site(&self, site: &str) {
        self.panic_sites.lock().unwrap().insert(site.to_string());
    }

    pub fn launches(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Complete the oldest outstanding job.
    pub fn complete_next(&self, outcome: BasebackupOutcome) {
        let reporter = self.reporters.lock().unwrap().remove(0);
        reporter.complete(outcome);
    }
}

#[async_trait]
impl BasebackupProducer for FakeProducer {
    async fn tool_version(&self) -> SiteResult<u32> {
        Ok(self.tool_version)
    }

    async fn launch(
        &self,
        request: BasebackupRequest,
        _compression_queue: WorkQueue,
    ) -> SiteResult<BasebackupJob> {
        if self.panic_sites.lock().unwrap().contains(&request.site) {
            panic!("producer exploded for {}", request.site);
        }
        if self.fail_sites.lock().unwrap().contains(&request.site) {
            return Err(SiteError::Unexpected(format!(
                "injected launch failure for {}",
                request.site
            )));
        }
        let (job, reporter) = BasebackupJob::pending();
        self.requests.lock().unwrap().push(request);
        self.reporters.lock().unwrap().push(reporter);
        Ok(job)
    }
}

/// Streamer whose processes exist only as activity markers.
#[allow(dead_code)]
pub struct FakeStreamer {
    pub tool_version: u32,
    pub requests: Mutex<Vec<StreamerRequest>>,
    pub activities: Mutex<Vec<Arc<Activity>>>,
    pub tokens: Mutex<Vec<CancellationToken>>,
}

#[allow(dead_code)]
impl FakeStreamer {
    pub fn new(tool_version: u32) -> Arc<Self> {
        Arc::new(Self {
            tool_version,
            requests: Mutex::new(Vec::new()),
            activities: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Simulate the most recent streamer process exiting.
    pub fn kill_latest(&self) {
        if let Some(activity) = self.activities.lock().unwrap().last() {
            activity.set_stopped();
        }
    }
}

#[async_trait]
impl LogStreamer for FakeStreamer {
    async fn tool_version(&self) -> SiteResult<u32> {
        Ok(self.tool_version)
    }

    async fn launch(&self, request: StreamerRequest) -> SiteResult<StreamerHandle> {
        let cancel = CancellationToken::new();
        let activity = Arc::new(Activity::started());
        self.requests.lock().unwrap().push(request);
        self.activities.lock().unwrap().push(activity.clone());
        self.tokens.lock().unwrap().push(cancel.clone());
        Ok(StreamerHandle::new(cancel, activity))
    }
}

/// Filesystem store that can be told to fail deletes of specific keys.
#[allow(dead_code)]
pub struct FlakyStore {
    inner: FilesystemBackend,
    failing_deletes: Mutex<HashSet<String>>,
    failing_listings: AtomicBool,
    pub deleted: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl FlakyStore {
    pub async fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: FilesystemBackend::new(root).await.unwrap(),
            failing_deletes: Mutex::new(HashSet::new()),
            failing_listings: AtomicBool::new(false),
            deleted: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_delete_of(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_listings(&self, fail: bool) {
        self.failing_listings.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn list_path(&self, prefix: &str) -> StorageResult<Vec<ListedObject>> {
        if self.failing_listings.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected listing failure")));
        }
        self.inner.list_path(prefix).await
    }

    async fn put(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> StorageResult<()> {
        self.inner.put(key, data, metadata).await
    }

    async fn delete_key(&self, key: &str) -> StorageResult<()> {
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(StorageError::Io(std::io::Error::other("injected delete failure")));
        }
        self.inner.delete_key(key).await?;
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// A site with a single node on `host`.
#[allow(dead_code)]
pub fn site_config(host: &str, mode: BackupMode) -> SiteConfig {
    SiteConfig {
        nodes: vec![NodeConfig {
            host: host.to_string(),
            port: 5432,
            user: "backup".to_string(),
            password: Some("secret".to_string()),
            dbname: None,
            slot: Some("archivist".to_string()),
            sslmode: None,
        }],
        active: true,
        basebackup_interval_hours: 24,
        basebackup_count: 2,
        active_backup_mode: mode,
    }
}

/// Test config plus fakes wired into collaborators.
#[allow(dead_code)]
pub struct TestSetup {
    pub config: AppConfig,
    pub store: Arc<FlakyStore>,
    pub producer: Arc<FakeProducer>,
    pub streamer: Arc<FakeStreamer>,
    pub probe: Arc<FakeProbe>,
}

#[allow(dead_code)]
impl TestSetup {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            storage: self.store.clone(),
            producer: self.producer.clone(),
            streamer: self.streamer.clone(),
            probe: self.probe.clone(),
        }
    }
}

#[allow(dead_code)]
pub async fn test_setup(root: &Path) -> TestSetup {
    let config = AppConfig::for_testing(root);
    TestSetup {
        store: FlakyStore::new(&root.join("remote")).await,
        producer: FakeProducer::new(160002),
        streamer: FakeStreamer::new(160002),
        probe: FakeProbe::new(160002),
        config,
    }
}
