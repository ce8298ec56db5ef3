use std::collections::HashMap;
use std::fmt::Write as _;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::QemuContext;
use crate::qmp::QmpSession;
use crate::qmp::sessions::{
    disk_add_commands, disk_del_commands, nic_del_commands, tap_add_commands,
    vhost_user_add_commands,
};
use crate::types::{
    DiskDescriptor, GuestNicInfo, HostNicInfo, HostNicResource, NicAttachment, VmEvent,
};

fn option<'a>(options: &'a HashMap<String, String>, key: &str) -> &'a str {
    options.get(key).map(String::as_str).unwrap_or_default()
}

/// Build the `rbd:` drive filename: credentials and monitor hosts are part of
/// the filename itself, with `:` inside monitor addresses escaped.
pub fn rbd_filename(filename: &str, options: &HashMap<String, String>) -> String {
    let mut descriptor = filename.to_string();

    let user = option(options, "user");
    let keyring = option(options, "keyring");
    if !user.is_empty() && !keyring.is_empty() {
        let _ = write!(descriptor, ":id={}:key={}", user, keyring);
    }

    let monitors: Vec<String> = option(options, "monitors")
        .split(';')
        .filter(|m| !m.is_empty())
        .map(|m| m.replace(':', "\\:"))
        .collect();
    if !monitors.is_empty() {
        descriptor.push_str(":mon_host=");
        descriptor.push_str(&monitors.join(";"));
    }
    descriptor
}

async fn report(vm_id: &str, result: &mpsc::Sender<VmEvent>, event: VmEvent) {
    if result.send(event).await.is_err() {
        warn!(vm_id = %vm_id, "device result dropped, receiver is gone");
    }
}

impl QemuContext {
    /// Hot-plug `disk` on the SCSI bus and report `BlockdevInserted` or
    /// `DeviceFailed` on `result`.
    pub async fn add_disk(
        &self,
        disk: &DiskDescriptor,
        source_type: &str,
        result: &mpsc::Sender<VmEvent>,
    ) {
        let filename = if disk.format == "rbd" {
            rbd_filename(&disk.filename, &disk.options)
        } else {
            disk.filename.clone()
        };

        let commands = disk_add_commands(&filename, &disk.format, disk.scsi_id, disk.read_only);
        let event = match self.execute(commands).await {
            Ok(()) => {
                info!(vm_id = %self.vm_id(), disk = %disk.name, scsi_id = disk.scsi_id, "disk attached");
                VmEvent::BlockdevInserted {
                    name: disk.name.clone(),
                    source_type: source_type.to_string(),
                    device_name: disk.device_name.clone(),
                    scsi_id: disk.scsi_id,
                }
            }
            Err(e) => {
                warn!(vm_id = %self.vm_id(), disk = %disk.name, "disk attach failed: {}", e);
                VmEvent::DeviceFailed { session: None }
            }
        };
        report(self.vm_id(), result, event).await;
    }

    /// Unplug `disk`. `callback` is reported on success and wrapped in
    /// `DeviceFailed` otherwise.
    pub async fn remove_disk(
        &self,
        disk: &DiskDescriptor,
        callback: VmEvent,
        result: &mpsc::Sender<VmEvent>,
    ) {
        let event = match self.execute(disk_del_commands(disk.scsi_id)).await {
            Ok(()) => {
                info!(vm_id = %self.vm_id(), disk = %disk.name, "disk detached");
                callback
            }
            Err(e) => {
                warn!(vm_id = %self.vm_id(), disk = %disk.name, "disk detach failed: {}", e);
                VmEvent::DeviceFailed {
                    session: Some(Box::new(callback)),
                }
            }
        };
        report(self.vm_id(), result, event).await;
    }

    /// Two-phase NIC hot-plug.
    ///
    /// The host resource is acquired first; if that fails nothing is sent to
    /// QEMU. Otherwise the attach session is queued and a watcher task waits
    /// for its outcome, releasing the resource if the attach failed or the
    /// session was dropped. Returns once the session is queued.
    pub async fn add_nic(
        self: &Arc<Self>,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        result: mpsc::Sender<VmEvent>,
    ) {
        let network = self.driver.network().clone();
        let acquired = if self.sandbox.boot.enable_vhost_user {
            network
                .acquire_vhost_user_port(
                    &host.device,
                    &host.bridge,
                    &self.sandbox.home_dir,
                    &host.options,
                )
                .await
                .map(|socket| HostNicResource::VhostUser { socket })
        } else {
            network
                .acquire_tap(&host.device, &host.bridge, &host.options)
                .await
                .map(HostNicResource::Tap)
        };
        let resource = match acquired {
            Ok(resource) => resource,
            Err(e) => {
                warn!(vm_id = %self.vm_id(), device = %host.device, "cannot acquire host nic: {}", e);
                report(self.vm_id(), &result, VmEvent::DeviceFailed { session: None }).await;
                return;
            }
        };

        let commands = match &resource {
            HostNicResource::Tap(fd) => {
                tap_add_commands(fd.as_raw_fd(), &guest.device, &host.mac, guest.bus_addr)
            }
            HostNicResource::VhostUser { socket } => {
                vhost_user_add_commands(socket, &guest.device, &host.mac, guest.bus_addr)
            }
        };

        let (tx, rx) = oneshot::channel();
        let attachment = NicAttachment {
            id: host.id.clone(),
            index: guest.index,
            pci_addr: guest.bus_addr,
            host_device: host.device.clone(),
            device_name: guest.device.clone(),
            bridge: host.bridge.clone(),
            resource,
        };
        let vm_id = self.sandbox.id.clone();

        // The watcher owns the resource, so the tap fd stays open until QEMU
        // has answered the getfd that carries it. It is not joined by `close`:
        // it ends once the session is answered or dropped, whatever the caller
        // does with `result`.
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(())) => {
                    info!(vm_id = %vm_id, device = %attachment.device_name, "nic attached");
                    report(&vm_id, &result, VmEvent::NetDevInserted(attachment)).await;
                }
                Ok(Err(e)) => {
                    warn!(vm_id = %vm_id, device = %attachment.device_name, "nic attach failed: {}", e);
                    network.release(attachment.resource);
                    report(&vm_id, &result, VmEvent::DeviceFailed { session: None }).await;
                }
                Err(_) => {
                    warn!(vm_id = %vm_id, device = %attachment.device_name, "nic attach aborted");
                    network.release(attachment.resource);
                    report(&vm_id, &result, VmEvent::DeviceFailed { session: None }).await;
                }
            }
        });

        self.qmp_send(QmpSession::new(commands, move |r| {
            let _ = tx.send(r);
        }))
        .await;
    }

    /// Unplug a NIC and hand its host resource back. `callback` is reported on
    /// success and wrapped in `DeviceFailed` otherwise.
    pub async fn remove_nic(
        &self,
        nic: NicAttachment,
        callback: VmEvent,
        result: &mpsc::Sender<VmEvent>,
    ) {
        let NicAttachment {
            device_name,
            resource,
            ..
        } = nic;
        // QEMU keeps its own copy of the tap fd, ours is no longer needed
        self.driver.network().release(resource);

        let event = match self.execute(nic_del_commands(&device_name)).await {
            Ok(()) => {
                info!(vm_id = %self.vm_id(), device = %device_name, "nic detached");
                callback
            }
            Err(e) => {
                warn!(vm_id = %self.vm_id(), device = %device_name, "nic detach failed: {}", e);
                VmEvent::DeviceFailed {
                    session: Some(Box::new(callback)),
                }
            }
        };
        report(self.vm_id(), result, event).await;
    }
}
