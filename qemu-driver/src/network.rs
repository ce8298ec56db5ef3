//! Host networking collaborator.
//!
//! NIC hot-plug is two-phase: a host-side resource is acquired here before
//! QEMU is told to attach it, and handed back through
//! [`NetworkBackend::release`] when the attach does not go through.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::types::HostNicResource;

#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Create (or open) tap `device`, enslave it to `bridge` and return its
    /// descriptor.
    async fn acquire_tap(
        &self,
        device: &str,
        bridge: &str,
        options: &str,
    ) -> std::io::Result<OwnedFd>;

    /// Create a vhost-user port for `device` on `bridge`; returns the socket
    /// QEMU has to connect to.
    async fn acquire_vhost_user_port(
        &self,
        device: &str,
        bridge: &str,
        home_dir: &Path,
        options: &str,
    ) -> std::io::Result<PathBuf>;

    /// Give back a resource whose attach did not complete.
    fn release(&self, resource: HostNicResource) {
        drop(resource);
    }
}

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

/// Backend driving the host's tun driver, `ip` and `ovs-vsctl`.
#[derive(Debug, Clone, Default)]
pub struct HostNetwork;

impl HostNetwork {
    pub fn new() -> Self {
        Self
    }

    fn open_tap(device: &str) -> std::io::Result<OwnedFd> {
        if device.is_empty() || device.len() >= libc::IFNAMSIZ {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid tap device name {:?}", device),
            ));
        }

        let file = OpenOptions::new().read(true).write(true).open(TUN_DEVICE)?;

        let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifreq.ifr_name.iter_mut().zip(device.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifreq.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI | IFF_VNET_HDR;

        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifreq) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(OwnedFd::from(file))
    }
}

async fn run_tool(program: &str, args: &[&str]) -> std::io::Result<()> {
    debug!("running {} {}", program, args.join(" "));
    let status = Command::new(program).args(args).status().await?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "{} {} failed with status {}",
            program,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

#[async_trait]
impl NetworkBackend for HostNetwork {
    async fn acquire_tap(
        &self,
        device: &str,
        bridge: &str,
        _options: &str,
    ) -> std::io::Result<OwnedFd> {
        // The tap is not persistent: dropping `fd` on any error below removes it.
        let fd = Self::open_tap(device)?;
        if !bridge.is_empty() {
            run_tool("ip", &["link", "set", "dev", device, "master", bridge]).await?;
        }
        run_tool("ip", &["link", "set", "dev", device, "up"]).await?;

        info!("TAP device {} created on bridge {:?}", device, bridge);
        Ok(fd)
    }

    async fn acquire_vhost_user_port(
        &self,
        device: &str,
        bridge: &str,
        home_dir: &Path,
        _options: &str,
    ) -> std::io::Result<PathBuf> {
        let socket = home_dir.join(device);
        let server_path = format!("options:vhost-server-path={}", socket.display());
        let interface_type = "type=dpdkvhostuserclient".to_string();
        run_tool(
            "ovs-vsctl",
            &[
                "--may-exist",
                "add-port",
                bridge,
                device,
                "--",
                "set",
                "Interface",
                device,
                &interface_type,
                &server_path,
            ],
        )
        .await?;

        info!("vhost-user port {} created at {}", device, socket.display());
        Ok(socket)
    }
}
