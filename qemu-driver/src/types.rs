//! Types shared with the owning sandbox supervisor.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use tokio::sync::mpsc;

/// Boot-time settings of the VM that change how the driver talks to QEMU.
#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    pub cpus: u32,
    pub memory_mb: u32,
    /// Attach NICs through vhost-user endpoints instead of tap descriptors.
    pub enable_vhost_user: bool,
    /// The VM was booted to become a template; `save` must not copy shared memory.
    pub boot_to_be_template: bool,
}

/// Identity of the VM a context is bound to, plus the event hub the driver
/// reports asynchronous events to.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub id: String,
    pub home_dir: PathBuf,
    pub boot: BootConfig,
    pub hub: mpsc::Sender<VmEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct DiskDescriptor {
    pub name: String,
    pub filename: String,
    pub format: String,
    pub fstype: String,
    pub device_name: String,
    pub scsi_id: u32,
    pub read_only: bool,
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct HostNicInfo {
    pub id: String,
    pub device: String,
    pub mac: String,
    pub bridge: String,
    pub gateway: String,
    pub options: String,
}

#[derive(Debug, Clone, Default)]
pub struct GuestNicInfo {
    pub device: String,
    pub ipaddr: String,
    pub index: u32,
    pub bus_addr: u32,
}

/// Host-side half of a NIC, acquired before QEMU is told about it.
#[derive(Debug)]
pub enum HostNicResource {
    Tap(OwnedFd),
    VhostUser { socket: PathBuf },
}

impl HostNicResource {
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            HostNicResource::Tap(fd) => Some(fd.as_raw_fd()),
            HostNicResource::VhostUser { .. } => None,
        }
    }
}

/// A NIC that QEMU accepted. Owns the host resource until it is removed.
#[derive(Debug)]
pub struct NicAttachment {
    pub id: String,
    pub index: u32,
    pub pci_addr: u32,
    pub host_device: String,
    pub device_name: String,
    pub bridge: String,
    pub resource: HostNicResource,
}

#[derive(Debug)]
pub enum VmEvent {
    BlockdevInserted {
        name: String,
        source_type: String,
        device_name: String,
        scsi_id: u32,
    },
    BlockdevRemoved {
        name: String,
    },
    NetDevInserted(NicAttachment),
    NetDevRemoved {
        index: u32,
    },
    /// A device session failed; `session` carries the event the caller asked
    /// to receive on success, when there was one.
    DeviceFailed {
        session: Option<Box<VmEvent>>,
    },
    VmExit,
}

impl VmEvent {
    pub fn is_failure(&self) -> bool {
        matches!(self, VmEvent::DeviceFailed { .. })
    }
}

/// Resource usage of a running VM. The QEMU driver does not collect any yet.
#[derive(Debug, Clone, Default)]
pub struct VmStats {
    pub cpu_time_ns: Option<u64>,
    pub memory_bytes: Option<u64>,
}
