//! The narrow view of the cluster resource API that Gust depends on.
//!
//! Only the verbs are fixed here. A transport binding implements [ClusterApi] and maps these
//! objects onto the platform's own resources.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::pin::Pin;

use async_trait::async_trait;
use gust_core::prelude::PullPolicy;
use tokio::io::AsyncRead;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(ObjectRef),
    #[error("{0} already exists")]
    AlreadyExists(ObjectRef),
    /// The object changed since it was read, an optimistic-concurrency failure.
    #[error("conflict updating {0}")]
    Conflict(ObjectRef),
    #[error("cluster API unavailable: {0}")]
    Unavailable(String),
    #[error("cluster API error: {0}")]
    Other(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Responses to a delete which still count as the object being gone.
    pub fn is_transient_on_delete(&self) -> bool {
        matches!(self, ApiError::NotFound(_) | ApiError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Namespace,
    Job,
    Config,
    Identity,
    RoleBinding,
    Secret,
}

impl ObjectKind {
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, ObjectKind::Namespace | ObjectKind::RoleBinding)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn namespaced(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(kind: ObjectKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{:?} {}/{}", self.kind, namespace, self.name),
            None => write!(f, "{:?} {}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Assigned by the cluster. An update must carry the version it read, or it conflicts.
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub meta: ObjectMeta,
}

/// The pod template of a job: one container running the run's image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTemplate {
    pub container: String,
    pub image: String,
    pub pull_policy: PullPolicy,
    pub service_account: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Config object mounted into the container.
    pub config: String,
    /// Secret exposed to the container, if any.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub meta: ObjectMeta,
    pub template: JobTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigObject {
    pub meta: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub meta: ObjectMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Subject {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBinding {
    pub meta: ObjectMeta,
    pub role: String,
    pub subjects: Vec<Subject>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub meta: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Namespace(Namespace),
    Job(JobRecord),
    Config(ConfigObject),
    Identity(Identity),
    RoleBinding(RoleBinding),
    Secret(Secret),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Namespace(_) => ObjectKind::Namespace,
            Object::Job(_) => ObjectKind::Job,
            Object::Config(_) => ObjectKind::Config,
            Object::Identity(_) => ObjectKind::Identity,
            Object::RoleBinding(_) => ObjectKind::RoleBinding,
            Object::Secret(_) => ObjectKind::Secret,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Object::Namespace(o) => &o.meta,
            Object::Job(o) => &o.meta,
            Object::Config(o) => &o.meta,
            Object::Identity(o) => &o.meta,
            Object::RoleBinding(o) => &o.meta,
            Object::Secret(o) => &o.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Object::Namespace(o) => &mut o.meta,
            Object::Job(o) => &mut o.meta,
            Object::Config(o) => &mut o.meta,
            Object::Identity(o) => &mut o.meta,
            Object::RoleBinding(o) => &mut o.meta,
            Object::Secret(o) => &mut o.meta,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        let meta = self.meta();
        ObjectRef {
            kind: self.kind(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Waiting { reason: String },
    Running,
    Terminated { exit_code: i32, message: Option<String> },
}

/// The managed process behind a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub name: String,
    pub namespace: String,
    pub ip: Option<String>,
    pub container: ContainerState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create(&self, object: Object) -> Result<Object, ApiError>;

    async fn get(&self, object: &ObjectRef) -> Result<Object, ApiError>;

    /// Replace an object. Fails with [ApiError::Conflict] if its resource version is stale.
    async fn update(&self, object: Object) -> Result<Object, ApiError>;

    async fn delete(&self, object: &ObjectRef) -> Result<(), ApiError>;

    /// The process the job is running, once the platform has scheduled one.
    async fn pod_for_job(&self, namespace: &str, job: &str) -> Result<Option<PodStatus>, ApiError>;

    async fn logs(&self, namespace: &str, pod: &str, follow: bool) -> Result<LogStream, ApiError>;

    /// Run a command in the pod's container, streaming `stdin` into it.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: Vec<u8>,
    ) -> Result<ExecOutput, ApiError>;
}
