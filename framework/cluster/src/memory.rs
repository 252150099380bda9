//! An in-memory [ClusterApi] for tests and local dry runs.
//!
//! Objects carry resource versions so optimistic concurrency behaves as it does on a real cluster.
//! Jobs get a pod immediately, which can be made to linger in a waiting state, to exit with a
//! chosen code, or to fail. Commands sent through `exec` understand just the two shell forms used
//! for artifact delivery and small file writes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use crate::api::{
    ApiError, ClusterApi, ContainerState, ExecOutput, LogStream, Object, ObjectKind, ObjectRef,
    PodStatus, Subject,
};

#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectRef, Object>,
    last_version: u64,
    pods: BTreeMap<(String, String), Pod>,
    last_ip: u8,
    faults: Faults,
}

#[derive(Debug)]
struct Pod {
    name: String,
    ip: String,
    /// Polls left before the container starts running.
    pending_polls: u32,
    /// Polls which have observed the container running.
    running_polls: u32,
    files: BTreeMap<PathBuf, StoredFile>,
    logs: Vec<u8>,
    exit: Option<(i32, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredFile {
    data: Vec<u8>,
    mode: u32,
}

#[derive(Debug, Default)]
struct Faults {
    failing_kinds: BTreeSet<ObjectKind>,
    failing_names: BTreeSet<String>,
    conflicts: BTreeMap<ObjectKind, u32>,
    unavailable_deletes: u32,
    start_delay_polls: u32,
    exits: BTreeMap<String, (i32, Option<String>)>,
    logs: BTreeMap<String, Vec<u8>>,
    exec_failures: BTreeSet<String>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every create of this kind fails.
    pub fn fail_creates(&self, kind: ObjectKind) {
        self.state.lock().faults.failing_kinds.insert(kind);
    }

    /// Every create of an object with this name fails.
    pub fn fail_create_named(&self, name: &str) {
        self.state.lock().faults.failing_names.insert(name.to_string());
    }

    /// The next `count` updates of this kind fail with a conflict, as if another writer got there
    /// first.
    pub fn inject_conflicts(&self, kind: ObjectKind, count: u32) {
        *self.state.lock().faults.conflicts.entry(kind).or_default() += count;
    }

    /// The next `count` deletes fail as unavailable without removing anything.
    pub fn fail_deletes_unavailable(&self, count: u32) {
        self.state.lock().faults.unavailable_deletes += count;
    }

    /// Pods created from now on report a waiting container for this many polls.
    pub fn delay_pod_start(&self, polls: u32) {
        self.state.lock().faults.start_delay_polls = polls;
    }

    /// The job's container exits once it has been observed running.
    pub fn set_exit(&self, job: &str, exit_code: i32, message: Option<&str>) {
        let exit = (exit_code, message.map(str::to_string));
        let mut state = self.state.lock();
        for ((_, job_name), pod) in state.pods.iter_mut() {
            if job_name == job {
                pod.exit = Some(exit.clone());
            }
        }
        state.faults.exits.insert(job.to_string(), exit);
    }

    /// Output the job's process will have written.
    pub fn set_logs(&self, job: &str, logs: &[u8]) {
        let mut state = self.state.lock();
        for ((_, job_name), pod) in state.pods.iter_mut() {
            if job_name == job {
                pod.logs = logs.to_vec();
            }
        }
        state.faults.logs.insert(job.to_string(), logs.to_vec());
    }

    /// Commands run in this job's pod exit non-zero.
    pub fn fail_exec(&self, job: &str) {
        self.state.lock().faults.exec_failures.insert(job.to_string());
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.state.lock().objects.contains_key(object)
    }

    pub fn objects_of(&self, kind: ObjectKind) -> Vec<Object> {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().objects.is_empty()
    }

    /// The subjects of a cluster-scoped role binding, empty if it does not exist.
    pub fn subjects(&self, binding: &str) -> Vec<Subject> {
        match self
            .state
            .lock()
            .objects
            .get(&ObjectRef::cluster(ObjectKind::RoleBinding, binding))
        {
            Some(Object::RoleBinding(binding)) => binding.subjects.clone(),
            _ => Vec::new(),
        }
    }

    /// Contents of a file delivered into the pod of a job.
    pub fn file(&self, namespace: &str, job: &str, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.stored_file(namespace, job, path.as_ref())
            .map(|f| f.data)
    }

    pub fn file_mode(&self, namespace: &str, job: &str, path: impl AsRef<Path>) -> Option<u32> {
        self.stored_file(namespace, job, path.as_ref())
            .map(|f| f.mode)
    }

    fn stored_file(&self, namespace: &str, job: &str, path: &Path) -> Option<StoredFile> {
        self.state
            .lock()
            .pods
            .get(&(namespace.to_string(), job.to_string()))
            .and_then(|pod| pod.files.get(path).cloned())
    }
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn pod_by_name(&mut self, namespace: &str, pod: &str) -> Option<&mut Pod> {
        self.pods
            .iter_mut()
            .find(|((ns, _), p)| ns == namespace && p.name == pod)
            .map(|(_, p)| p)
    }

    fn start_pod(&mut self, namespace: &str, job: &str) {
        self.last_ip = self.last_ip.wrapping_add(1);
        let pod = Pod {
            name: format!("{job}-pod"),
            ip: format!("10.0.0.{}", self.last_ip),
            pending_polls: self.faults.start_delay_polls,
            running_polls: 0,
            files: BTreeMap::new(),
            logs: self.faults.logs.get(job).cloned().unwrap_or_default(),
            exit: self.faults.exits.get(job).cloned(),
        };
        self.pods
            .insert((namespace.to_string(), job.to_string()), pod);
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn create(&self, mut object: Object) -> Result<Object, ApiError> {
        let mut state = self.state.lock();
        let object_ref = object.object_ref();

        if state.faults.failing_kinds.contains(&object_ref.kind)
            || state.faults.failing_names.contains(&object_ref.name)
        {
            return Err(ApiError::Other(format!("injected failure creating {object_ref}")));
        }
        if state.objects.contains_key(&object_ref) {
            return Err(ApiError::AlreadyExists(object_ref));
        }

        object.meta_mut().resource_version = state.next_version();
        if let Object::Job(job) = &object {
            let namespace = job.meta.namespace.clone().unwrap_or_default();
            state.start_pod(&namespace, &job.meta.name);
        }
        state.objects.insert(object_ref, object.clone());

        Ok(object)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Object, ApiError> {
        self.state
            .lock()
            .objects
            .get(object)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(object.clone()))
    }

    async fn update(&self, mut object: Object) -> Result<Object, ApiError> {
        let mut state = self.state.lock();
        let object_ref = object.object_ref();

        if let Some(remaining) = state.faults.conflicts.get_mut(&object_ref.kind) {
            if *remaining > 0 {
                *remaining -= 1;
                // Another writer got in first.
                state.next_version();
                if let Some(stored) = state.objects.get_mut(&object_ref) {
                    stored.meta_mut().resource_version += 1;
                }
                return Err(ApiError::Conflict(object_ref));
            }
        }

        let current = state
            .objects
            .get(&object_ref)
            .ok_or_else(|| ApiError::NotFound(object_ref.clone()))?
            .meta()
            .resource_version;
        if current != object.meta().resource_version {
            return Err(ApiError::Conflict(object_ref));
        }

        object.meta_mut().resource_version = state.next_version();
        state.objects.insert(object_ref, object.clone());

        Ok(object)
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ApiError> {
        let mut state = self.state.lock();

        if state.faults.unavailable_deletes > 0 {
            state.faults.unavailable_deletes -= 1;
            return Err(ApiError::Unavailable(format!("injected failure deleting {object}")));
        }
        if state.objects.remove(object).is_none() {
            return Err(ApiError::NotFound(object.clone()));
        }

        match object.kind {
            ObjectKind::Job => {
                let namespace = object.namespace.clone().unwrap_or_default();
                state.pods.remove(&(namespace, object.name.clone()));
            }
            ObjectKind::Namespace => {
                let namespace = Some(object.name.clone());
                state.objects.retain(|r, _| r.namespace != namespace);
                state.pods.retain(|(ns, _), _| *ns != object.name);
            }
            _ => {}
        }

        Ok(())
    }

    async fn pod_for_job(&self, namespace: &str, job: &str) -> Result<Option<PodStatus>, ApiError> {
        let mut state = self.state.lock();
        let Some(pod) = state.pods.get_mut(&(namespace.to_string(), job.to_string())) else {
            return Ok(None);
        };

        let container = if pod.pending_polls > 0 {
            pod.pending_polls -= 1;
            ContainerState::Waiting {
                reason: "ContainerCreating".to_string(),
            }
        } else {
            match &pod.exit {
                Some((exit_code, message)) if pod.running_polls > 0 => ContainerState::Terminated {
                    exit_code: *exit_code,
                    message: message.clone(),
                },
                _ => {
                    pod.running_polls += 1;
                    ContainerState::Running
                }
            }
        };

        Ok(Some(PodStatus {
            name: pod.name.clone(),
            namespace: namespace.to_string(),
            ip: Some(pod.ip.clone()),
            container,
        }))
    }

    async fn logs(&self, namespace: &str, pod: &str, _follow: bool) -> Result<LogStream, ApiError> {
        let mut state = self.state.lock();
        let pod = state.pod_by_name(namespace, pod).ok_or_else(|| {
            ApiError::Other(format!("no pod {namespace}/{pod}"))
        })?;

        Ok(Box::pin(Cursor::new(pod.logs.clone())))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        command: Vec<String>,
        stdin: Vec<u8>,
    ) -> Result<ExecOutput, ApiError> {
        let mut state = self.state.lock();
        let failing = state
            .pods
            .iter()
            .any(|((ns, job), p)| ns == namespace && p.name == pod && state.faults.exec_failures.contains(job));
        let target = state.pod_by_name(namespace, pod).ok_or_else(|| {
            ApiError::Other(format!("no pod {namespace}/{pod}"))
        })?;

        if failing {
            return Ok(failed(1, "injected exec failure"));
        }

        let script = match command.as_slice() {
            [shell, flag, script] if shell == "sh" && flag == "-c" => script,
            _ => return Ok(failed(127, &format!("unsupported command {command:?}"))),
        };

        let unpack = Regex::new(r"^mkdir -p '([^']+)' && tar -xf - -C '([^']+)'$")
            .map_err(|e| ApiError::Other(e.to_string()))?;
        let write = Regex::new(r"^mkdir -p '([^']+)' && cat > '([^']+)'$")
            .map_err(|e| ApiError::Other(e.to_string()))?;

        if let Some(captures) = unpack.captures(script) {
            let dir = PathBuf::from(&captures[2]);
            return Ok(match unpack_into(&mut target.files, &dir, &stdin) {
                Ok(()) => ExecOutput::default(),
                Err(e) => failed(2, &format!("tar: {e}")),
            });
        }

        if let Some(captures) = write.captures(script) {
            target.files.insert(
                PathBuf::from(&captures[2]),
                StoredFile {
                    data: stdin,
                    mode: 0o644,
                },
            );
            return Ok(ExecOutput::default());
        }

        Ok(failed(127, &format!("unsupported script {script:?}")))
    }
}

fn failed(status: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        status,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

fn unpack_into(
    files: &mut BTreeMap<PathBuf, StoredFile>,
    dir: &Path,
    archive: &[u8],
) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }

        let path = dir.join(entry.path()?);
        let mode = entry.header().mode()?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(path, StoredFile { data, mode });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Identity, Namespace, ObjectMeta};
    use pretty_assertions::assert_eq;

    fn identity(name: &str) -> Object {
        Object::Identity(Identity {
            meta: ObjectMeta::namespaced("ns", name),
        })
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let cluster = MemoryCluster::new();
        let created = cluster.create(identity("a")).await.unwrap();

        let updated = cluster.update(created.clone()).await.unwrap();
        assert!(updated.meta().resource_version > created.meta().resource_version);

        let err = cluster.update(created).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn namespace_delete_cascades() {
        let cluster = MemoryCluster::new();
        cluster
            .create(Object::Namespace(Namespace {
                meta: ObjectMeta::cluster("ns"),
            }))
            .await
            .unwrap();
        cluster.create(identity("a")).await.unwrap();

        cluster
            .delete(&ObjectRef::cluster(ObjectKind::Namespace, "ns"))
            .await
            .unwrap();

        assert!(cluster.is_empty());
        let err = cluster
            .delete(&ObjectRef::namespaced(ObjectKind::Identity, "ns", "a"))
            .await
            .unwrap_err();
        assert_eq!(
            ApiError::NotFound(ObjectRef::namespaced(ObjectKind::Identity, "ns", "a")),
            err
        );
    }

    #[tokio::test]
    async fn unsupported_exec_exits_127() {
        let cluster = MemoryCluster::new();
        cluster.state.lock().start_pod("ns", "job");

        let output = cluster
            .exec("ns", "job-pod", "gust", vec!["ls".to_string()], Vec::new())
            .await
            .unwrap();
        assert_eq!(127, output.status);
    }
}
