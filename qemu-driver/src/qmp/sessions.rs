//! Command batches for device hot-plug.
//!
//! Each builder returns the ordered commands of one session; the caller wraps
//! them in a [`QmpSession`](super::QmpSession) with its own completion logic.

use std::os::fd::RawFd;
use std::path::Path;

use serde_json::json;

use super::QmpCommand;

pub fn drive_id(scsi_id: u32) -> String {
    format!("drive{}", scsi_id)
}

pub fn scsi_device_id(scsi_id: u32) -> String {
    format!("scsi-disk{}", scsi_id)
}

pub fn tap_fd_name(device: &str) -> String {
    format!("fd{}", device)
}

pub fn chardev_id(device: &str) -> String {
    format!("chardev-{}", device)
}

fn human_monitor(command_line: String) -> QmpCommand {
    QmpCommand::with_arguments(
        "human-monitor-command",
        json!({ "command-line": command_line }),
    )
}

/// `drive_add` option values use `,` as separator; literal commas are doubled.
fn escape_drive_option(value: &str) -> String {
    value.replace(',', ",,")
}

pub fn disk_add_commands(
    filename: &str,
    format: &str,
    scsi_id: u32,
    readonly: bool,
) -> Vec<QmpCommand> {
    let mut drive = format!(
        "drive_add dummy file={},if=none,id={},format={},cache=writeback",
        escape_drive_option(filename),
        drive_id(scsi_id),
        format
    );
    if readonly {
        drive.push_str(",readonly=on");
    }

    vec![
        human_monitor(drive),
        QmpCommand::with_arguments(
            "device_add",
            json!({
                "driver": "scsi-hd",
                "bus": "scsi0.0",
                "scsi-id": scsi_id,
                "drive": drive_id(scsi_id),
                "id": scsi_device_id(scsi_id),
            }),
        ),
    ]
}

pub fn disk_del_commands(scsi_id: u32) -> Vec<QmpCommand> {
    vec![
        QmpCommand::with_arguments("device_del", json!({ "id": scsi_device_id(scsi_id) })),
        human_monitor(format!("drive_del {}", drive_id(scsi_id))),
    ]
}

fn nic_device_add(device: &str, mac: &str, bus_addr: u32) -> QmpCommand {
    QmpCommand::with_arguments(
        "device_add",
        json!({
            "driver": "virtio-net-pci",
            "netdev": device,
            "mac": mac,
            "bus": "pci.0",
            "addr": format!("0x{:x}", bus_addr),
            "id": device,
        }),
    )
}

/// Hand the tap descriptor to QEMU with `getfd`, then create the backend and
/// the guest-visible device on top of it.
pub fn tap_add_commands(fd: RawFd, device: &str, mac: &str, bus_addr: u32) -> Vec<QmpCommand> {
    vec![
        QmpCommand::with_arguments("getfd", json!({ "fdname": tap_fd_name(device) })).with_fd(fd),
        QmpCommand::with_arguments(
            "netdev_add",
            json!({
                "type": "tap",
                "id": device,
                "fd": tap_fd_name(device),
            }),
        ),
        nic_device_add(device, mac, bus_addr),
    ]
}

pub fn vhost_user_add_commands(
    socket: &Path,
    device: &str,
    mac: &str,
    bus_addr: u32,
) -> Vec<QmpCommand> {
    vec![
        QmpCommand::with_arguments(
            "chardev-add",
            json!({
                "id": chardev_id(device),
                "backend": {
                    "type": "socket",
                    "data": {
                        "addr": {
                            "type": "unix",
                            "data": { "path": socket.to_string_lossy() },
                        },
                        "server": false,
                    },
                },
            }),
        ),
        QmpCommand::with_arguments(
            "netdev_add",
            json!({
                "type": "vhost-user",
                "id": device,
                "chardev": chardev_id(device),
            }),
        ),
        nic_device_add(device, mac, bus_addr),
    ]
}

pub fn nic_del_commands(device: &str) -> Vec<QmpCommand> {
    vec![
        QmpCommand::with_arguments("device_del", json!({ "id": device })),
        QmpCommand::with_arguments("netdev_del", json!({ "id": device })),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_line(command: &QmpCommand) -> &str {
        command
            .argument("command-line")
            .and_then(|v| v.as_str())
            .unwrap()
    }

    #[test]
    fn readonly_disk_gets_readonly_drive() {
        let commands = disk_add_commands("/images/data.img", "qcow2", 3, true);
        assert_eq!(commands.len(), 2);
        assert_eq!(
            command_line(&commands[0]),
            "drive_add dummy file=/images/data.img,if=none,id=drive3,format=qcow2,cache=writeback,readonly=on"
        );
        assert_eq!(commands[1].execute, "device_add");
        assert_eq!(commands[1].argument("drive").unwrap(), "drive3");
        assert_eq!(commands[1].argument("id").unwrap(), "scsi-disk3");
    }

    #[test]
    fn drive_filename_commas_are_escaped() {
        let commands = disk_add_commands("/images/a,b.img", "raw", 0, false);
        assert!(command_line(&commands[0]).starts_with("drive_add dummy file=/images/a,,b.img,if=none"));
        assert!(!command_line(&commands[0]).contains("readonly"));
    }

    #[test]
    fn disk_removal_deletes_device_before_drive() {
        let commands = disk_del_commands(5);
        assert_eq!(commands[0].execute, "device_del");
        assert_eq!(commands[0].argument("id").unwrap(), "scsi-disk5");
        assert_eq!(command_line(&commands[1]), "drive_del drive5");
    }

    #[test]
    fn tap_session_passes_fd_only_with_getfd() {
        let commands = tap_add_commands(42, "eth0", "52:54:00:12:34:56", 5);
        let names: Vec<&str> = commands.iter().map(|c| c.execute.as_str()).collect();
        assert_eq!(names, vec!["getfd", "netdev_add", "device_add"]);
        assert_eq!(commands[0].fds, vec![42]);
        assert!(commands[1].fds.is_empty());
        assert_eq!(commands[1].argument("fd").unwrap(), "fdeth0");
        assert_eq!(commands[2].argument("addr").unwrap(), "0x5");
    }

    #[test]
    fn vhost_user_session_uses_chardev() {
        let commands =
            vhost_user_add_commands(Path::new("/run/vm-1/eth1"), "eth1", "52:54:00:00:00:01", 6);
        assert_eq!(commands[0].execute, "chardev-add");
        assert_eq!(commands[1].argument("chardev").unwrap(), "chardev-eth1");
        assert_eq!(commands[1].argument("type").unwrap(), "vhost-user");
        assert!(commands.iter().all(|c| c.fds.is_empty()));
    }
}
