use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gust_cluster::prelude::*;
use gust_core::prelude::{RunSpec, ShutdownHandle, ShutdownSignalError, SuiteConfig, ValueFile};
use pretty_assertions::assert_eq;
use tokio::io::AsyncReadExt;

fn settings() -> Arc<ClusterSettings> {
    Arc::new(ClusterSettings::default().with_poll_interval(Duration::from_millis(5)))
}

async fn create(cluster: &Arc<MemoryCluster>, spec: RunSpec) -> anyhow::Result<Job> {
    Job::create(
        cluster.clone(),
        settings(),
        spec,
        &SuiteConfig::default(),
        ShutdownHandle::new().new_listener(),
    )
    .await
}

fn job_ref(spec: &RunSpec) -> ObjectRef {
    ObjectRef::namespaced(ObjectKind::Job, &spec.namespace, &spec.job_name())
}

#[tokio::test(flavor = "multi_thread")]
async fn create_provisions_delivers_and_signals_ready() {
    env_logger::try_init().ok();

    let fixtures = tempfile::tempdir().unwrap();
    let artifact = fixtures.path().join("suite");
    std::fs::write(&artifact, "binary").unwrap();
    let context = fixtures.path().join("context");
    std::fs::create_dir_all(context.join("data")).unwrap();
    std::fs::write(context.join("data/input.txt"), "input").unwrap();
    let values = fixtures.path().join("values.yaml");
    std::fs::write(&values, "replicas: 2").unwrap();

    let cluster = Arc::new(MemoryCluster::new());
    cluster.delay_pod_start(3);

    let mut spec = RunSpec::new("registry/suite:latest");
    spec.artifact_path = Some(artifact);
    spec.context_path = Some(context);
    spec.value_files = vec![ValueFile {
        release: "redis".to_string(),
        path: values,
    }];
    spec.secrets = BTreeMap::from([("token".to_string(), "abc".to_string())]);
    let name = spec.job_name();
    let ns = spec.namespace.clone();

    let job = create(&cluster, spec.clone()).await.unwrap();

    assert!(job.ip().is_some());
    assert!(cluster.contains(&ObjectRef::cluster(ObjectKind::Namespace, &ns)));
    assert!(cluster.contains(&job_ref(&spec)));
    assert!(cluster.contains(&ObjectRef::namespaced(ObjectKind::Identity, &ns, "gust")));
    assert!(cluster.contains(&ObjectRef::namespaced(
        ObjectKind::Secret,
        &ns,
        &format!("{name}-secret")
    )));

    let config = cluster
        .objects_of(ObjectKind::Config)
        .into_iter()
        .find_map(|o| match o {
            Object::Config(config) => Some(config),
            _ => None,
        })
        .unwrap();
    let stored: RunSpec = serde_json::from_str(&config.data[RUN_SPEC_KEY]).unwrap();
    assert_eq!(spec, stored);
    assert_eq!(Some(&spec.run_id), config.meta.labels.get("gust.io/run-id"));

    assert_eq!(Some(b"binary".to_vec()), cluster.file(&ns, &name, "/gust/bin/suite"));
    assert_eq!(Some(0o755), cluster.file_mode(&ns, &name, "/gust/bin/suite"));
    assert_eq!(
        Some(b"input".to_vec()),
        cluster.file(&ns, &name, "/gust/context/data/input.txt")
    );
    assert_eq!(
        Some(b"replicas: 2".to_vec()),
        cluster.file(&ns, &name, "/gust/values/redis/values.yaml")
    );
    assert_eq!(Some(Vec::new()), cluster.file(&ns, &name, "/gust/ready"));
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_is_idempotent() {
    let cluster = Arc::new(MemoryCluster::new());
    let spec = RunSpec::new("image");
    let job = create(&cluster, spec.clone()).await.unwrap();

    job.delete().await.unwrap();
    job.delete().await.unwrap();

    assert!(!cluster.contains(&job_ref(&spec)));
    assert!(cluster.objects_of(ObjectKind::Identity).is_empty());
    assert_eq!(1, cluster.objects_of(ObjectKind::RoleBinding).len());
    assert!(!cluster.contains(&ObjectRef::cluster(ObjectKind::Namespace, &spec.namespace)));
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_delete_counts_as_done() {
    let cluster = Arc::new(MemoryCluster::new());
    let job = create(&cluster, RunSpec::new("image")).await.unwrap();

    cluster.fail_deletes_unavailable(1);
    job.delete().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_teardown_keeps_namespace() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut spec = RunSpec::new("image");
    spec.skip_teardown = true;
    let job = create(&cluster, spec.clone()).await.unwrap();

    job.delete().await.unwrap();

    assert!(!cluster.contains(&job_ref(&spec)));
    assert!(cluster.contains(&ObjectRef::cluster(ObjectKind::Namespace, &spec.namespace)));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_create_rolls_back() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.fail_creates(ObjectKind::Secret);

    let mut spec = RunSpec::new("image");
    spec.secrets.insert("token".to_string(), "abc".to_string());

    let err = create(&cluster, spec.clone()).await.err().unwrap();
    assert!(format!("{err:?}").contains("injected failure"));

    assert!(!cluster.contains(&job_ref(&spec)));
    assert!(cluster.objects_of(ObjectKind::Config).is_empty());
    assert!(!cluster.contains(&ObjectRef::cluster(ObjectKind::Namespace, &spec.namespace)));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_delivery_rolls_back() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut spec = RunSpec::new("image");
    spec.context_path = Some(Path::new("/does/not/exist").to_path_buf());

    assert!(create(&cluster, spec.clone()).await.is_err());
    assert!(!cluster.contains(&job_ref(&spec)));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_while_waiting_rolls_back() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.delay_pod_start(u32::MAX);
    let spec = RunSpec::new("image");

    let mut scope = ShutdownHandle::new().scope();
    scope.shutdown_after(Duration::from_millis(50));
    let err = Job::create(
        cluster.clone(),
        settings(),
        spec.clone(),
        &SuiteConfig::default(),
        scope.handle().new_listener(),
    )
    .await
    .err()
    .unwrap();

    assert!(err.is::<ShutdownSignalError>());
    assert!(!cluster.contains(&job_ref(&spec)));
}

/// Fires the shutdown signal while the config object is being created.
struct InterruptedCreate {
    inner: Arc<MemoryCluster>,
    shutdown: ShutdownHandle,
}

#[async_trait::async_trait]
impl ClusterApi for InterruptedCreate {
    async fn create(&self, object: Object) -> Result<Object, ApiError> {
        let is_config = object.kind() == ObjectKind::Config;
        let created = self.inner.create(object).await;
        if is_config {
            self.shutdown.shutdown();
            tokio::task::yield_now().await;
        }
        created
    }

    async fn get(&self, object: &ObjectRef) -> Result<Object, ApiError> {
        self.inner.get(object).await
    }

    async fn update(&self, object: Object) -> Result<Object, ApiError> {
        self.inner.update(object).await
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ApiError> {
        self.inner.delete(object).await
    }

    async fn pod_for_job(&self, namespace: &str, job: &str) -> Result<Option<PodStatus>, ApiError> {
        self.inner.pod_for_job(namespace, job).await
    }

    async fn logs(&self, namespace: &str, pod: &str, follow: bool) -> Result<LogStream, ApiError> {
        self.inner.logs(namespace, pod, follow).await
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: Vec<u8>,
    ) -> Result<ExecOutput, ApiError> {
        self.inner
            .exec(namespace, pod, container, command, stdin)
            .await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_during_a_create_still_rolls_it_back() {
    let cluster = Arc::new(MemoryCluster::new());
    let shutdown = ShutdownHandle::new();
    let api = Arc::new(InterruptedCreate {
        inner: cluster.clone(),
        shutdown: shutdown.clone(),
    });
    let spec = RunSpec::new("image");

    let err = Job::create(
        api,
        settings(),
        spec.clone(),
        &SuiteConfig::default(),
        shutdown.new_listener(),
    )
    .await
    .err()
    .unwrap();

    assert!(err.is::<ShutdownSignalError>());
    assert!(cluster.objects_of(ObjectKind::Config).is_empty());
    assert!(cluster.objects_of(ObjectKind::Job).is_empty());
    assert!(!cluster.contains(&ObjectRef::cluster(ObjectKind::Namespace, &spec.namespace)));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_runs_both_join_role_binding() {
    let cluster = Arc::new(MemoryCluster::new());
    let provisioner = ResourceProvisioner::new(cluster.clone(), settings());
    let first = RunSpec::new("image");
    let second = RunSpec::new("image");

    // The binding exists so both runs go down the update path.
    provisioner.bind_role(&RunSpec::new("image")).await.unwrap();
    cluster.inject_conflicts(ObjectKind::RoleBinding, 1);

    let (a, b) = tokio::join!(provisioner.bind_role(&first), provisioner.bind_role(&second));
    a.unwrap();
    b.unwrap();

    let namespaces = cluster
        .subjects("gust")
        .into_iter()
        .map(|s| s.namespace)
        .collect::<Vec<_>>();
    assert_eq!(3, namespaces.len());
    assert!(namespaces.contains(&first.namespace));
    assert!(namespaces.contains(&second.namespace));
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_code_and_logs_are_reported() {
    let cluster = Arc::new(MemoryCluster::new());
    let spec = RunSpec::new("image");
    cluster.set_exit(&spec.job_name(), 3, Some("suite failed"));
    cluster.set_logs(&spec.job_name(), b"line one\nline two\n");

    let job = create(&cluster, spec).await.unwrap();

    let mut output = String::new();
    job.logs(false)
        .await
        .unwrap()
        .read_to_string(&mut output)
        .await
        .unwrap();
    assert_eq!("line one\nline two\n", output);

    let exit = job.wait_for_exit().await.unwrap();
    assert_eq!(
        JobExit {
            exit_code: 3,
            message: Some("suite failed".to_string()),
        },
        exit
    );
    assert!(!exit.success());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_signal_writes_sentinel() {
    let cluster = Arc::new(MemoryCluster::new());
    let spec = RunSpec::new("image").for_worker(0);
    let job = create(&cluster, spec.clone()).await.unwrap();

    job.signal_shutdown().await.unwrap();

    assert_eq!(
        Some(Vec::new()),
        cluster.file(&spec.namespace, &spec.job_name(), "/gust/shutdown")
    );
}
