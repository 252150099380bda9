use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use gust_core::prelude::{
    DelegatedShutdownListener, GustResult, RunSpec, ShutdownSignalError, SuiteConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::api::{ClusterApi, ContainerState, LogStream, ObjectKind, ObjectRef, PodStatus};
use crate::archive;
use crate::provisioner::ResourceProvisioner;
use crate::settings::ClusterSettings;

/// The terminal state of a job's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExit {
    pub exit_code: i32,
    pub message: Option<String>,
}

impl JobExit {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One process of a run, materialized as a cluster job.
///
/// A job is created, runs until its process exits or it is deleted, and is never reused.
pub struct Job {
    api: Arc<dyn ClusterApi>,
    settings: Arc<ClusterSettings>,
    spec: RunSpec,
    name: String,
    /// Objects owned by this job, in creation order.
    created: Vec<ObjectRef>,
    created_namespace: bool,
    pod: Option<PodStatus>,
}

impl Job {
    /// Provision everything backing the job, wait for its process to run, deliver its artifacts and
    /// tell it to start.
    ///
    /// If any step fails, or the shutdown signal arrives first, whatever was created is removed
    /// again before the error is returned.
    pub async fn create(
        api: Arc<dyn ClusterApi>,
        settings: Arc<ClusterSettings>,
        spec: RunSpec,
        config: &SuiteConfig,
        mut shutdown: DelegatedShutdownListener,
    ) -> GustResult<Self> {
        let mut job = Job {
            api,
            settings,
            name: spec.job_name(),
            spec,
            created: Vec::new(),
            created_namespace: false,
            pod: None,
        };

        let result = job.provision(config, &mut shutdown).await;

        if let Err(e) = result {
            log::warn!("Failed to create job {}, removing what was created: {e:?}", job.name);
            if let Err(cleanup) = job.teardown(job.created_namespace).await {
                log::error!("Failed to clean up after job {}: {cleanup:?}", job.name);
            }
            return Err(e);
        }

        log::info!("Job {} is ready", job.name);
        Ok(job)
    }

    /// Creates of objects the rollback removes always run to completion, so that every object that
    /// exists is in `created`. Shutdown is checked between them and raced against the other steps.
    async fn provision(
        &mut self,
        config: &SuiteConfig,
        shutdown: &mut DelegatedShutdownListener,
    ) -> GustResult<()> {
        let provisioner = self.provisioner();
        let config_name = format!("{}-config", self.name);
        let secret_name = format!("{}-secret", self.name);
        let secret = (!self.spec.secrets.is_empty()).then_some(secret_name.as_str());

        if self.spec.create_namespace {
            self.created_namespace = provisioner.ensure_namespace(&self.spec).await?;
        }
        check_shutdown(shutdown)?;

        let job = provisioner
            .create_job(&self.spec, &self.name, &config_name, secret)
            .await?;
        self.created.push(job);
        check_shutdown(shutdown)?;

        let config = provisioner
            .create_config(&self.spec, &config_name, config)
            .await?;
        self.created.push(config);
        check_shutdown(shutdown)?;

        or_shutdown(shutdown, provisioner.create_identity(&self.spec)).await?;
        or_shutdown(shutdown, provisioner.bind_role(&self.spec)).await?;

        if let Some(secret) = provisioner.create_secret(&self.spec, secret).await? {
            self.created.push(secret);
        }
        check_shutdown(shutdown)?;

        or_shutdown(shutdown, async { self.wait_running().await.map(|_| ()) }).await?;
        or_shutdown(shutdown, self.deliver_artifacts()).await?;
        or_shutdown(shutdown, self.signal_ready()).await?;

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    /// Address of the job's process, known once it is running.
    pub fn ip(&self) -> Option<&str> {
        self.pod.as_ref().and_then(|p| p.ip.as_deref())
    }

    /// Poll until the job's container is running. There is no timeout here, callers impose one.
    pub async fn wait_running(&mut self) -> GustResult<&PodStatus> {
        log::debug!("Waiting for job {} to start running", self.name);
        loop {
            let pod = self
                .api
                .pod_for_job(&self.spec.namespace, &self.name)
                .await
                .with_context(|| format!("Failed to get status of job {}", self.name))?;

            match pod {
                Some(pod) if pod.container == ContainerState::Running => {
                    log::debug!("Job {} is running as {}", self.name, pod.name);
                    return Ok(&*self.pod.insert(pod));
                }
                Some(PodStatus {
                    container: ContainerState::Terminated { exit_code, message },
                    ..
                }) => {
                    anyhow::bail!(
                        "Job {} exited with code {exit_code} before it was ready: {}",
                        self.name,
                        message.unwrap_or_default()
                    );
                }
                Some(PodStatus {
                    container: ContainerState::Waiting { reason },
                    ..
                }) => {
                    log::trace!("Job {} is waiting: {reason}", self.name);
                }
                _ => {}
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Stream the executable, the context directory and each value file into the job.
    pub async fn deliver_artifacts(&self) -> GustResult<()> {
        let settings = self.settings.clone();

        if let Some(path) = &self.spec.artifact_path {
            log::debug!("Delivering executable {} to {}", path.display(), self.name);
            let archive = archive::executable_archive(path)?;
            self.unpack(&settings.artifact_dir, archive).await?;
        }

        if let Some(path) = &self.spec.context_path {
            log::debug!("Delivering context {} to {}", path.display(), self.name);
            let archive = archive::context_archive(path)?;
            self.unpack(&settings.context_dir, archive).await?;
        }

        for value_file in &self.spec.value_files {
            let data = std::fs::read(&value_file.path).with_context(|| {
                format!("Failed to read value file {}", value_file.path.display())
            })?;
            let name = format!(
                "{}/{}",
                value_file.release,
                archive::file_name(&value_file.path)?
            );
            let archive = archive::file_archive(&name, &data)?;
            self.unpack(&settings.values_dir, archive).await?;
        }

        Ok(())
    }

    /// Write a small file inside the job's container.
    pub async fn write_file(&self, path: &Path, data: &[u8]) -> GustResult<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("/"));
        let script = format!("mkdir -p {} && cat > {}", quote(dir)?, quote(path)?);
        self.run_script(script, data.to_vec())
            .await
            .with_context(|| format!("Failed to write {} in job {}", path.display(), self.name))
    }

    /// Tell the process its artifacts are in place and it may read its configuration.
    pub async fn signal_ready(&self) -> GustResult<()> {
        self.write_file(&self.settings.ready_sentinel, b"").await
    }

    /// Ask the process to exit.
    pub async fn signal_shutdown(&self) -> GustResult<()> {
        self.write_file(&self.settings.shutdown_sentinel, b"").await
    }

    pub async fn logs(&self, follow: bool) -> GustResult<LogStream> {
        let pod = self.pod_name()?;
        self.api
            .logs(&self.spec.namespace, pod, follow)
            .await
            .with_context(|| format!("Failed to get logs of job {}", self.name))
    }

    /// Forward the job's output line by line to the log under a target named after the job.
    pub async fn follow_logs(&self) -> GustResult<JoinHandle<()>> {
        let stream = self.logs(true).await?;
        let log_target = format!("gust_job::{}", self.name);

        Ok(tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if log::log_enabled!(target: &log_target, log::Level::Info) {
                    log::info!(target: &log_target, "{line}");
                }
            }
        }))
    }

    /// Poll until the job's container terminates.
    pub async fn wait_for_exit(&self) -> GustResult<JobExit> {
        loop {
            let pod = self
                .api
                .pod_for_job(&self.spec.namespace, &self.name)
                .await
                .with_context(|| format!("Failed to get status of job {}", self.name))?
                .with_context(|| format!("Job {} has no process", self.name))?;

            if let ContainerState::Terminated { exit_code, message } = pod.container {
                log::info!("Job {} exited with code {exit_code}", self.name);
                return Ok(JobExit { exit_code, message });
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Remove the job and the objects it owns. Safe to call more than once.
    ///
    /// The namespace is removed too if this job created it, deletion was requested and teardown is
    /// not suppressed.
    pub async fn delete(&self) -> GustResult<()> {
        let remove_namespace =
            self.created_namespace && self.spec.delete_namespace && !self.spec.skip_teardown;
        self.teardown(remove_namespace).await
    }

    async fn teardown(&self, remove_namespace: bool) -> GustResult<()> {
        let provisioner = self.provisioner();
        let mut first_error = None;

        for object in &self.created {
            if let Err(e) = provisioner.retire(object).await {
                log::error!("{e:?}");
                first_error.get_or_insert(e);
            }
        }

        if remove_namespace {
            let namespace = ObjectRef::cluster(ObjectKind::Namespace, &self.spec.namespace);
            if let Err(e) = provisioner.retire(&namespace).await {
                log::error!("{e:?}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn provisioner(&self) -> ResourceProvisioner {
        ResourceProvisioner::new(self.api.clone(), self.settings.clone())
    }

    fn pod_name(&self) -> GustResult<&str> {
        self.pod
            .as_ref()
            .map(|p| p.name.as_str())
            .with_context(|| format!("Job {} is not running", self.name))
    }

    async fn unpack(&self, dir: &Path, archive: Vec<u8>) -> GustResult<()> {
        let dir = quote(dir)?;
        let script = format!("mkdir -p {dir} && tar -xf - -C {dir}");
        self.run_script(script, archive)
            .await
            .with_context(|| format!("Failed to unpack archive into {dir} in job {}", self.name))
    }

    async fn run_script(&self, script: String, stdin: Vec<u8>) -> GustResult<()> {
        let pod = self.pod_name()?;
        let output = self
            .api
            .exec(
                &self.spec.namespace,
                pod,
                &self.settings.container,
                vec!["sh".to_string(), "-c".to_string(), script],
                stdin,
            )
            .await?;

        if !output.success() {
            anyhow::bail!(
                "Command exited with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}

fn quote(path: &Path) -> GustResult<String> {
    let path = path.display().to_string();
    if path.contains('\'') {
        anyhow::bail!("Cannot quote path {path}");
    }
    Ok(format!("'{path}'"))
}

fn check_shutdown(shutdown: &DelegatedShutdownListener) -> GustResult<()> {
    if shutdown.should_shutdown() {
        return Err(ShutdownSignalError::default().into());
    }
    Ok(())
}

async fn or_shutdown<T>(
    shutdown: &mut DelegatedShutdownListener,
    step: impl std::future::Future<Output = GustResult<T>>,
) -> GustResult<T> {
    tokio::select! {
        result = step => result,
        _ = shutdown.wait_for_shutdown() => Err(ShutdownSignalError::default().into()),
    }
}
