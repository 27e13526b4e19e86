//! Platform detection and capability enumeration.
//!
//! Detects the host OS and which virtualization tooling is installed so
//! that [`crate::hypervisor::select_hypervisor`] can pick a backend once,
//! at environment construction. All probes are side-effect free.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Darwin => write!(f, "darwin"),
            Self::Windows => write!(f, "windows"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Host capabilities that affect hypervisor availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// A container engine runs directly on this kernel.
    NativeEngine,
    /// `docker-machine` is on `PATH`.
    DockerMachine,
    /// `VBoxManage` is on `PATH`.
    VirtualBox,
    /// Hyper-V PowerShell module is present.
    HyperV,
    /// A Docker Desktop settings file exists.
    DockerDesktop,
    /// A legacy Docker for Mac settings file exists.
    LegacyDockerDesktop,
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        let capabilities = Self::detect_capabilities(os);
        Self { os, capabilities }
    }

    /// Builds a platform description from explicit parts.
    ///
    /// Used to exercise backend selection for hosts other than the current one.
    pub fn with_capabilities(os: Os, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            os,
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Detects the operating system.
    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    /// Detects available capabilities based on OS.
    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();

        if find_on_path("docker-machine").is_some() {
            caps.insert(Capability::DockerMachine);
        }

        match os {
            Os::Linux => {
                if Path::new("/var/run/docker.sock").exists() || find_on_path("dockerd").is_some()
                {
                    caps.insert(Capability::NativeEngine);
                }
            }
            Os::Darwin => {
                if find_on_path("VBoxManage").is_some() {
                    caps.insert(Capability::VirtualBox);
                }
                if crate::hypervisor::desktop::DesktopLayout::Current
                    .settings_path()
                    .is_some_and(|p| p.exists())
                {
                    caps.insert(Capability::DockerDesktop);
                }
                if crate::hypervisor::desktop::DesktopLayout::Legacy
                    .settings_path()
                    .is_some_and(|p| p.exists())
                {
                    caps.insert(Capability::LegacyDockerDesktop);
                }
            }
            Os::Windows => {
                if find_on_path("VBoxManage").is_some() || vbox_install_dir().is_some() {
                    caps.insert(Capability::VirtualBox);
                }
                if Path::new(r"C:\Windows\System32\WindowsPowerShell\v1.0\Modules\Hyper-V")
                    .exists()
                {
                    caps.insert(Capability::HyperV);
                }
            }
            Os::Unknown => {}
        }

        caps
    }

    /// Returns true if the given capability was detected.
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (capabilities: {:?})", self.os, self.capabilities)
    }
}

/// Suffixes tried after a bare program name.
#[cfg(windows)]
const EXECUTABLE_SUFFIXES: &[&str] = &["", ".exe", ".cmd", ".bat"];
#[cfg(not(windows))]
const EXECUTABLE_SUFFIXES: &[&str] = &[""];

/// Looks up an executable on `PATH`.
///
/// On Windows `docker-machine` also matches `docker-machine.exe`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    search_path(&path, program, EXECUTABLE_SUFFIXES)
}

fn search_path(path: &OsStr, program: &str, suffixes: &[&str]) -> Option<PathBuf> {
    std::env::split_paths(path).find_map(|dir| {
        suffixes
            .iter()
            .map(|suffix| dir.join(format!("{program}{suffix}")))
            .find(|candidate| candidate.is_file())
    })
}

/// Returns the VirtualBox install directory announced by its installer.
fn vbox_install_dir() -> Option<PathBuf> {
    std::env::var_os("VBOX_MSI_INSTALL_PATH")
        .or_else(|| std::env::var_os("VBOX_INSTALL_PATH"))
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
}
