// Well-known directories, files, variable names and VM protocol constants.

use std::fmt;

/// Well-known directories used by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Bin,
    Diag,
    Root,
    Temp,
    Tools,
    /// Shared VM tooling: boot/mount scripts, images and pid files.
    Virt,
    Work,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Well-known configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownConfigFile {
    Runner,
}

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl OsPlatform {
    /// Value exposed to jobs as `runner.os`.
    pub fn label_name(&self) -> &'static str {
        match self {
            OsPlatform::Linux => "Linux",
            OsPlatform::MacOS => "macOS",
            OsPlatform::Windows => "Windows",
        }
    }
}

#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;

/// Directory names relative to root / work.
pub mod path {
    pub const DIAG_DIRECTORY: &str = "_diag";
    pub const TEMP_DIRECTORY: &str = "_temp";
    pub const TOOL_DIRECTORY: &str = "_tool";
    pub const WORK_DIRECTORY: &str = "_work";
    /// Sibling of the runner root holding the VM tooling.
    pub const VIRT_DIRECTORY: &str = "virt";
    /// Under the virt directory; holds per-instance pid files.
    pub const VIRT_WORK_DIRECTORY: &str = "work";
}

/// Environment and job variable names.
pub mod variables {
    /// Process environment read by the runner itself.
    pub mod agent {
        pub const PRINT_LOG_TO_STDOUT: &str = "ACTIONS_RUNNER_PRINT_LOG_TO_STDOUT";
        pub const INSTANCE_NUMBER: &str = "RUNNER_INSTANCE_NUMBER";
        pub const VIRT_DIRECTORY: &str = "RUNNER_VIRT_DIRECTORY";
        pub const TOOLS_DIRECTORY: &str = "RUNNER_TOOL_CACHE";
        pub const TEMP_DIRECTORY: &str = "RUNNER_TEMP";
    }

    /// Variables derived during provisioning and handed to the step engine.
    pub mod system {
        pub const VM_TOOLS_DIRECTORY: &str = "system.qemuDir";
        pub const VM_IP: &str = "system.qemuIp";
        pub const VM_WORKSPACE: &str = "system.containerWorkspace";
    }

    pub const STEP_DEBUG: &str = "ACTIONS_STEP_DEBUG";
}

/// Names of well-known service endpoints in the job message.
pub mod endpoints {
    pub const SYSTEM_VSS_CONNECTION: &str = "SystemVssConnection";
    pub const ACCESS_TOKEN_PARAMETER: &str = "AccessToken";
}

/// VM boot, mount and teardown protocol.
pub mod vm {
    /// Boot output after this marker is internal diagnostics.
    pub const READINESS_MARKER: &str = "DEBUG START";
    /// First two octets of the private VM network; `172.17.<instance>.2`.
    pub const SUBNET_PREFIX: &str = "172.17";
    pub const HOST_OCTET: u8 = 2;
    pub const SHELL: &str = "bash";
    pub const BOOT_SCRIPT: &str = "run_image.sh";
    pub const MOUNT_SCRIPT: &str = "sshfs.sh";
    pub const PID_FILE_SUFFIX: &str = "_qemu.pid";
    pub const TEARDOWN_POLL_ATTEMPTS: u32 = 5;
    pub const TEARDOWN_POLL_INTERVAL_SECS: u64 = 1;
}

/// Completion event publishing.
pub mod completion {
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const RETRY_DELAY_SECS: u64 = 5;
}
