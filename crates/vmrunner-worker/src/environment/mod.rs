// The per-job VM: boot with readiness detection, workspace mount, teardown.

pub mod process_host;
pub mod provisioner;
pub mod readiness;

pub use process_host::{CommandOutcome, CommandSpec, InvokerProcessHost, ProcessHost};
pub use provisioner::{
    EnvironmentHandle, EnvironmentProvider, ProvisioningError, VmProvisioner, SET_UP_VM_STEP,
};
pub use readiness::{LineDisposition, ReadinessScanner};
