//! Everything Gust does against the cluster: provisioning the objects backing a run, the lifecycle
//! of the job for each process and the bootstrap those processes perform once they are running.

mod api;
pub mod archive;
pub mod bootstrap;
mod job;
pub mod memory;
mod provisioner;
mod settings;

pub mod prelude {
    pub use crate::api::{
        ApiError, ClusterApi, ConfigObject, ContainerState, ExecOutput, Identity, JobRecord,
        JobTemplate, LogStream, Namespace, Object, ObjectKind, ObjectMeta, ObjectRef, PodStatus,
        RoleBinding, Secret, Subject,
    };
    pub use crate::job::{Job, JobExit};
    pub use crate::memory::MemoryCluster;
    pub use crate::provisioner::ResourceProvisioner;
    pub use crate::settings::{ClusterSettings, RUN_SPEC_KEY, SUITE_CONFIG_KEY};
}
