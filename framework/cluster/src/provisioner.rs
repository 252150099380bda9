use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use gust_core::prelude::{GustResult, ProcessRole, RunSpec, SuiteConfig};

use crate::api::{
    ApiError, ClusterApi, ConfigObject, Identity, JobRecord, JobTemplate, Namespace, Object,
    ObjectKind, ObjectMeta, ObjectRef, RoleBinding, Secret, Subject,
};
use crate::settings::{ClusterSettings, RUN_SPEC_KEY, SUITE_CONFIG_KEY};

/// Issues and retires the cluster objects backing one process of a run.
#[derive(Clone)]
pub struct ResourceProvisioner {
    api: Arc<dyn ClusterApi>,
    settings: Arc<ClusterSettings>,
}

impl ResourceProvisioner {
    pub fn new(api: Arc<dyn ClusterApi>, settings: Arc<ClusterSettings>) -> Self {
        Self { api, settings }
    }

    /// Create the run's namespace. Returns whether it was created by this call.
    pub async fn ensure_namespace(&self, spec: &RunSpec) -> GustResult<bool> {
        let namespace = Object::Namespace(Namespace {
            meta: self.meta(spec, None, &spec.namespace),
        });

        match self.api.create(namespace).await {
            Ok(_) => {
                log::info!("Created namespace {}", spec.namespace);
                Ok(true)
            }
            Err(ApiError::AlreadyExists(_)) => {
                log::debug!("Namespace {} already exists", spec.namespace);
                Ok(false)
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to create namespace {}", spec.namespace))
            }
        }
    }

    pub async fn create_job(
        &self,
        spec: &RunSpec,
        name: &str,
        config: &str,
        secret: Option<&str>,
    ) -> GustResult<ObjectRef> {
        let job = Object::Job(JobRecord {
            meta: self.meta(spec, Some(&spec.namespace), name),
            template: JobTemplate {
                container: self.settings.container.clone(),
                image: spec.image.clone(),
                pull_policy: spec.pull_policy,
                service_account: spec.service_account.clone(),
                args: self.process_args(spec),
                env: spec.env.clone(),
                config: config.to_string(),
                secret: secret.map(str::to_string),
            },
        });

        self.create(job).await
    }

    /// Store the run specification and suite configuration as the two documents the process reads
    /// at startup.
    pub async fn create_config(
        &self,
        spec: &RunSpec,
        name: &str,
        suite_config: &SuiteConfig,
    ) -> GustResult<ObjectRef> {
        let data = BTreeMap::from([
            (
                RUN_SPEC_KEY.to_string(),
                serde_json::to_string_pretty(spec).context("Failed to serialize run spec")?,
            ),
            (
                SUITE_CONFIG_KEY.to_string(),
                serde_json::to_string_pretty(suite_config)
                    .context("Failed to serialize suite config")?,
            ),
        ]);

        self.create(Object::Config(ConfigObject {
            meta: self.meta(spec, Some(&spec.namespace), name),
            data,
        }))
        .await
    }

    /// Create the identity the job runs as, unless it already exists.
    ///
    /// Every process of a run shares one identity, so it is left for namespace deletion to remove.
    pub async fn create_identity(&self, spec: &RunSpec) -> GustResult<()> {
        let identity = Object::Identity(Identity {
            meta: self.meta(spec, Some(&spec.namespace), &spec.service_account),
        });

        match self.api.create(identity).await {
            Ok(_) | Err(ApiError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to create identity {}/{}",
                    spec.namespace, spec.service_account
                )
            }),
        }
    }

    /// Add the run's identity to the shared cluster-scoped role binding, creating the binding if it
    /// is missing.
    ///
    /// The binding is shared by every run on the cluster, so concurrent writers are expected.
    /// Conflicts are resolved by re-reading and trying again, with no limit of its own.
    pub async fn bind_role(&self, spec: &RunSpec) -> GustResult<()> {
        let binding = ObjectRef::cluster(ObjectKind::RoleBinding, &self.settings.role_binding);
        let subject = Subject {
            name: spec.service_account.clone(),
            namespace: spec.namespace.clone(),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let current = match self.api.get(&binding).await {
                Ok(Object::RoleBinding(current)) => current,
                Ok(other) => anyhow::bail!("{binding} is a {:?}", other.kind()),
                Err(ApiError::NotFound(_)) => {
                    let created = Object::RoleBinding(RoleBinding {
                        meta: ObjectMeta::cluster(&self.settings.role_binding),
                        role: self.settings.cluster_role.clone(),
                        subjects: vec![subject.clone()],
                    });
                    match self.api.create(created).await {
                        Ok(_) => {
                            log::debug!("Created role binding {binding}");
                            return Ok(());
                        }
                        Err(ApiError::AlreadyExists(_)) => continue,
                        Err(e) => {
                            return Err(e)
                                .with_context(|| format!("Failed to create {binding}"))
                        }
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to read {binding}")),
            };

            if current.subjects.contains(&subject) {
                return Ok(());
            }

            let mut updated = current;
            updated.subjects.push(subject.clone());
            match self.api.update(Object::RoleBinding(updated)).await {
                Ok(_) => {
                    log::debug!("Added {subject:?} to {binding} after {attempt} attempt(s)");
                    return Ok(());
                }
                Err(ApiError::Conflict(_)) => {
                    log::debug!("Conflict updating {binding}, retrying");
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to update {binding}")),
            }
        }
    }

    /// Create the secret holding the run's secrets. Nothing is created when there are none.
    pub async fn create_secret(
        &self,
        spec: &RunSpec,
        name: Option<&str>,
    ) -> GustResult<Option<ObjectRef>> {
        let Some(name) = name.filter(|_| !spec.secrets.is_empty()) else {
            return Ok(None);
        };

        let secret = Object::Secret(Secret {
            meta: self.meta(spec, Some(&spec.namespace), name),
            data: spec.secrets.clone(),
        });
        self.create(secret).await.map(Some)
    }

    /// Delete an object. Not found and unavailable responses count as the object being gone, so
    /// retiring is safe to repeat.
    pub async fn retire(&self, object: &ObjectRef) -> GustResult<()> {
        match self.api.delete(object).await {
            Ok(()) => {
                log::debug!("Deleted {object}");
                Ok(())
            }
            Err(e) if e.is_transient_on_delete() => {
                log::debug!("Treating delete of {object} as done: {e}");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete {object}")),
        }
    }

    async fn create(&self, object: Object) -> GustResult<ObjectRef> {
        let object_ref = object.object_ref();
        self.api
            .create(object)
            .await
            .with_context(|| format!("Failed to create {object_ref}"))?;
        log::debug!("Created {object_ref}");

        Ok(object_ref)
    }

    fn meta(&self, spec: &RunSpec, namespace: Option<&str>, name: &str) -> ObjectMeta {
        let meta = match namespace {
            Some(namespace) => ObjectMeta::namespaced(namespace, name),
            None => ObjectMeta::cluster(name),
        };
        meta.with_label(&self.settings.label_key, &spec.run_id)
    }

    fn process_args(&self, spec: &RunSpec) -> Vec<String> {
        let settings = &self.settings;
        let mut args = vec![
            "--config-dir".to_string(),
            settings.config_dir.display().to_string(),
            "--ready-sentinel".to_string(),
            settings.ready_sentinel.display().to_string(),
            "--shutdown-sentinel".to_string(),
            settings.shutdown_sentinel.display().to_string(),
        ];
        match spec.role {
            ProcessRole::Coordinator => {
                args.extend(["--role".to_string(), "coordinator".to_string()]);
            }
            ProcessRole::Worker { index } => {
                args.extend([
                    "--role".to_string(),
                    "worker".to_string(),
                    "--worker-index".to_string(),
                    index.to_string(),
                ]);
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use pretty_assertions::assert_eq;

    fn provisioner(cluster: Arc<MemoryCluster>) -> ResourceProvisioner {
        ResourceProvisioner::new(cluster, Arc::new(ClusterSettings::default()))
    }

    #[tokio::test]
    async fn existing_namespace_is_not_owned() {
        let cluster = Arc::new(MemoryCluster::new());
        let provisioner = provisioner(cluster.clone());
        let spec = RunSpec::new("image");

        assert!(provisioner.ensure_namespace(&spec).await.unwrap());
        assert!(!provisioner.ensure_namespace(&spec).await.unwrap());
    }

    #[tokio::test]
    async fn bind_role_is_idempotent() {
        let cluster = Arc::new(MemoryCluster::new());
        let provisioner = provisioner(cluster.clone());
        let spec = RunSpec::new("image");

        provisioner.bind_role(&spec).await.unwrap();
        provisioner.bind_role(&spec).await.unwrap();

        assert_eq!(
            vec![Subject {
                name: "gust".to_string(),
                namespace: spec.namespace.clone(),
            }],
            cluster.subjects("gust")
        );
    }

    #[tokio::test]
    async fn no_secret_without_secrets() {
        let cluster = Arc::new(MemoryCluster::new());
        let provisioner = provisioner(cluster.clone());
        let mut spec = RunSpec::new("image");

        assert_eq!(None, provisioner.create_secret(&spec, Some("s")).await.unwrap());

        spec.secrets.insert("token".to_string(), "abc".to_string());
        let created = provisioner.create_secret(&spec, Some("s")).await.unwrap();
        assert_eq!(
            Some(ObjectRef::namespaced(ObjectKind::Secret, &spec.namespace, "s")),
            created
        );
    }

    #[tokio::test]
    async fn retire_twice_succeeds() {
        let cluster = Arc::new(MemoryCluster::new());
        let provisioner = provisioner(cluster.clone());
        let spec = RunSpec::new("image");
        let config = provisioner
            .create_config(&spec, "c", &SuiteConfig::default())
            .await
            .unwrap();

        provisioner.retire(&config).await.unwrap();
        provisioner.retire(&config).await.unwrap();
        assert!(!cluster.contains(&config));
    }

    #[test]
    fn worker_args_carry_index() {
        let provisioner = provisioner(Arc::new(MemoryCluster::new()));
        let spec = RunSpec::new("image").for_worker(3);

        let args = provisioner.process_args(&spec);
        assert_eq!(
            vec!["--role", "worker", "--worker-index", "3"],
            args[args.len() - 4..].to_vec()
        );
    }
}
