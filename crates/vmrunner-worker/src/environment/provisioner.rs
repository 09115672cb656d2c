// Boots the job VM, mounts the workspace into it, and tears both down again.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use vmrunner_common::constants::{self, vm};
use vmrunner_common::{TaskResult, Tracing};
use vmrunner_sdk::{IOUtil, ProcessSignal, TraceWriter, WhichUtil};

use super::process_host::{CommandOutcome, CommandSpec, ProcessHost};
use super::readiness::{LineDisposition, ReadinessScanner};
use crate::execution_context::ExecutionContext;
use crate::variables::Variables;

/// Display name of the child record that shows VM boot output.
pub const SET_UP_VM_STEP: &str = "Set up VM";

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("VM starter exited with non-zero exit code: {exit_code}")]
    VmStartFailed { exit_code: i32, stderr: String },

    #[error("sshfs: exit code {exit_code}, err {stderr}")]
    MountFailed { exit_code: i32, stderr: String },

    #[error("Failed to run VM helper: {0:#}")]
    Spawn(anyhow::Error),

    #[error("VM provisioning was cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// EnvironmentHandle
// ---------------------------------------------------------------------------

/// One VM slot. Everything is derived from the instance number, so a handle
/// exists (and can be torn down) before provisioning has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub instance: u8,
    pub vm_ip: String,
    /// Holds the helper scripts; working directory for every VM command.
    pub virt_dir: PathBuf,
    /// Workspace path handed to the mount script, `<repo>/<repo>`.
    pub workspace: String,
    pub pid_file: PathBuf,
}

impl EnvironmentHandle {
    pub fn new(instance: u8, virt_dir: PathBuf, workspace: impl Into<String>) -> Self {
        let pid_file = virt_dir
            .join(constants::path::VIRT_WORK_DIRECTORY)
            .join(format!("{}{}", instance, vm::PID_FILE_SUFFIX));
        Self {
            instance,
            vm_ip: format!("{}.{}.{}", vm::SUBNET_PREFIX, instance, vm::HOST_OCTET),
            virt_dir,
            workspace: workspace.into(),
            pid_file,
        }
    }

    /// `<repo>/<repo>` from the repository name.
    pub fn workspace_for(repository_name: &str) -> String {
        format!("{0}/{0}", repository_name)
    }

    /// Publish the VM coordinates to the step engine.
    pub fn export_variables(&self, variables: &Variables) {
        use constants::variables::system;
        variables.set_system(system::VM_TOOLS_DIRECTORY, self.virt_dir.to_string_lossy());
        variables.set_system(system::VM_IP, self.vm_ip.clone());
        variables.set_system(system::VM_WORKSPACE, self.workspace.clone());
    }
}

/// VM image file name: `ubuntu:22.04` → `ubuntu_22.04`.
pub fn image_tag(image: &str) -> String {
    image.replace(':', "_")
}

// ---------------------------------------------------------------------------
// EnvironmentProvider
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Boot the VM from `image` and mount the workspace. Writes a job error
    /// for every failure before returning it.
    async fn provision(
        &self,
        handle: &EnvironmentHandle,
        image: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ProvisioningError>;

    /// Unmount and stop the VM. Best effort: every failure is logged and
    /// the remaining steps still run.
    async fn teardown(&self, handle: &EnvironmentHandle, ctx: &mut ExecutionContext);
}

/// Drives `run_image.sh` / `sshfs.sh` in the virt directory through `bash`.
pub struct VmProvisioner {
    process_host: Arc<dyn ProcessHost>,
    trace: Tracing,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl VmProvisioner {
    pub fn new(process_host: Arc<dyn ProcessHost>, trace: Tracing) -> Self {
        Self {
            process_host,
            trace,
            poll_attempts: vm::TEARDOWN_POLL_ATTEMPTS,
            poll_interval: Duration::from_secs(vm::TEARDOWN_POLL_INTERVAL_SECS),
        }
    }

    fn shell(&self) -> PathBuf {
        match WhichUtil::which(vm::SHELL, false) {
            Ok(Some(path)) => path,
            _ => PathBuf::from(vm::SHELL),
        }
    }

    fn script(&self, handle: &EnvironmentHandle) -> CommandSpec {
        CommandSpec::new(self.shell(), handle.virt_dir.clone())
    }

    fn boot_command(&self, handle: &EnvironmentHandle, image: &str) -> CommandSpec {
        self.script(handle)
            .arg(vm::BOOT_SCRIPT)
            .arg("-n")
            .arg(handle.instance.to_string())
            .arg("-s")
            .arg(image_tag(image))
    }

    fn mount_command(&self, handle: &EnvironmentHandle) -> CommandSpec {
        self.script(handle)
            .arg(vm::MOUNT_SCRIPT)
            .arg(handle.instance.to_string())
            .arg(handle.workspace.clone())
    }

    fn unmount_command(&self, handle: &EnvironmentHandle) -> CommandSpec {
        self.script(handle)
            .arg("-e")
            .arg(vm::MOUNT_SCRIPT)
            .arg(handle.instance.to_string())
            .arg(handle.workspace.clone())
    }

    async fn boot(
        &self,
        handle: &EnvironmentHandle,
        image: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ProvisioningError> {
        let cancel_token = ctx.cancel_token();
        let mut vm_ctx = ctx.create_child(SET_UP_VM_STEP);
        let command = self.boot_command(handle, image);
        self.trace.info(&format!("Starting VM: {}", command.command_line()));

        let mut scanner = ReadinessScanner::default();
        let trace = &self.trace;
        let mut on_line = |line: &str| {
            if scanner.observe(line) == LineDisposition::Forward {
                vm_ctx.output(line);
            }
            trace.info(line);
        };

        let outcome = match self
            .process_host
            .run(&command, &mut on_line, cancel_token.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(_) if cancel_token.is_cancelled() => {
                self.trace.info("VM boot was cancelled.");
                vm_ctx.output(&ProvisioningError::Cancelled.to_string());
                vm_ctx.complete(Some(TaskResult::Canceled));
                return Err(ProvisioningError::Cancelled);
            }
            Err(e) => {
                let error = ProvisioningError::Spawn(e);
                vm_ctx.output(&error.to_string());
                vm_ctx.complete(Some(TaskResult::Failed));
                ctx.error(&error.to_string());
                return Err(error);
            }
        };

        if outcome.exit_code == 0 {
            self.trace.info("VM is ready.");
            vm_ctx.complete(None);
            return Ok(());
        }

        let CommandOutcome { exit_code, stderr } = outcome;
        for line in stderr.lines() {
            self.trace.info(line);
        }
        let error = ProvisioningError::VmStartFailed { exit_code, stderr };
        vm_ctx.output(&error.to_string());
        vm_ctx.complete(Some(TaskResult::Failed));
        self.trace.info(&error.to_string());
        ctx.error(&error.to_string());
        Err(error)
    }

    async fn mount(
        &self,
        handle: &EnvironmentHandle,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ProvisioningError> {
        self.trace
            .info(&format!("Mounting {} via sshfs...", handle.workspace));
        let command = self.mount_command(handle);
        let cancel_token = ctx.cancel_token();
        let trace = &self.trace;
        let outcome = self
            .process_host
            .run(&command, &mut |line: &str| trace.info(line), cancel_token.clone())
            .await;
        if outcome.is_err() && cancel_token.is_cancelled() {
            self.trace.info("Workspace mount was cancelled.");
            return Err(ProvisioningError::Cancelled);
        }
        let outcome = outcome.map_err(ProvisioningError::Spawn);

        let error = match outcome {
            Ok(outcome) if outcome.exit_code == 0 => return Ok(()),
            Ok(CommandOutcome { exit_code, stderr }) => {
                self.trace
                    .error(&format!("sshfs exited with {}", exit_code));
                self.trace.error(&stderr);
                ProvisioningError::MountFailed { exit_code, stderr }
            }
            Err(error) => error,
        };
        ctx.error(&error.to_string());
        Err(error)
    }

    fn read_vm_pid(&self, pid_file: &Path) -> Option<i32> {
        let line = match IOUtil::read_first_line(pid_file) {
            Ok(line) => line,
            Err(e) => {
                self.trace
                    .error("Reading VM work files failed, consult the error below.");
                self.trace.error(&format!("{:#}", e));
                return None;
            }
        };
        match line.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Some(pid),
            _ => {
                self.trace
                    .error(&format!("PID file {:?} holds no process id: '{}'", pid_file, line));
                None
            }
        }
    }

    fn send(&self, pid: i32, signal: ProcessSignal) {
        if let Err(e) = self.process_host.signal(pid, signal) {
            self.trace.error(&format!("{:#}", e));
        }
    }
}

#[async_trait]
impl EnvironmentProvider for VmProvisioner {
    async fn provision(
        &self,
        handle: &EnvironmentHandle,
        image: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ProvisioningError> {
        self.trace.info(&format!("Runner instance: {}", handle.instance));
        self.trace
            .info(&format!("VM tools directory: {}", handle.virt_dir.display()));
        self.trace.info(&format!("VM IP: {}", handle.vm_ip));
        self.trace.info(&format!("VM image: {}", image));

        if ctx.cancel_token().is_cancelled() {
            return Err(ProvisioningError::Cancelled);
        }
        self.boot(handle, image, ctx).await?;
        self.mount(handle, ctx).await
    }

    async fn teardown(&self, handle: &EnvironmentHandle, ctx: &mut ExecutionContext) {
        self.trace.entering("teardown");
        let pid = self.read_vm_pid(&handle.pid_file);

        self.trace
            .info(&format!("Unmounting sshfs from {}", handle.workspace));
        let command = self.unmount_command(handle);
        let trace = &self.trace;
        // Teardown must finish even when the job was cancelled.
        match self
            .process_host
            .run(&command, &mut |line: &str| trace.info(line), CancellationToken::new())
            .await
        {
            Ok(outcome) if outcome.exit_code != 0 => {
                self.trace.error(&outcome.stderr);
                ctx.error(&outcome.stderr);
            }
            Ok(_) => {}
            Err(e) => {
                self.trace.error(&format!("{:#}", e));
                ctx.error(&format!("Failed to unmount {}: {:#}", handle.workspace, e));
            }
        }

        match pid {
            Some(pid) => {
                self.trace.info(&format!("Killing VM with PID {}", pid));
                self.send(pid, ProcessSignal::Terminate);
            }
            None => self.trace.info("No VM process id recorded, skipping terminate"),
        }

        let attempts = self.poll_attempts;
        for i in 1..=attempts {
            self.trace
                .info(&format!("[{}/{}] waiting for VM to exit", i, attempts));
            if !handle.pid_file.exists() {
                break;
            }

            if i == attempts {
                if let Some(pid) = pid {
                    self.trace.info(&format!("Sending {} to {}", ProcessSignal::Kill, pid));
                    self.send(pid, ProcessSignal::Kill);
                }
                match IOUtil::delete_file(&handle.pid_file) {
                    Ok(()) => self
                        .trace
                        .info(&format!("Removed {}", handle.pid_file.display())),
                    Err(e) => self.trace.info(&format!(
                        "Couldn't remove {}: {:#}",
                        handle.pid_file.display(),
                        e
                    )),
                }
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
