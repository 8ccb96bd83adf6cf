use super::MonitorCommand;
use crate::net::SharedFd;
use crate::sandbox::events::HardwareEvent;
use serde_json::json;

/// Guest block device name for a SCSI id: `sda`..`sdz`, `sdaa`, ...
pub fn scsi_device_name(scsi_id: u32) -> String {
    fn letters(id: u32) -> String {
        let c = char::from(b'a' + (id % 26) as u8);
        if id < 26 {
            c.to_string()
        } else {
            format!("{}{}", letters(id / 26 - 1), c)
        }
    }
    format!("sd{}", letters(scsi_id))
}

/// One hotplug operation, expanded into its monitor commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Hotplug {
    DiskAdd {
        filename: String,
        format: String,
        scsi_id: u32,
    },
    DiskRemove {
        scsi_id: u32,
    },
    NicAdd {
        /// Monitor id of the backend and frontend.
        device: String,
        fd: SharedFd,
        mac: String,
        pci_addr: u32,
    },
    NicRemove {
        device: String,
    },
}

impl Hotplug {
    pub fn commands(&self) -> Vec<MonitorCommand> {
        match self {
            Hotplug::DiskAdd {
                filename,
                format,
                scsi_id,
            } => vec![
                MonitorCommand::human(format!(
                    "drive_add dummy file={},if=none,id=drive{},format={},cache=writeback",
                    filename, scsi_id, format
                )),
                MonitorCommand::new("device_add").with_arguments(json!({
                    "driver": "scsi-hd",
                    "bus": "scsi0.0",
                    "scsi-id": scsi_id.to_string(),
                    "drive": format!("drive{}", scsi_id),
                    "id": format!("scsi-disk{}", scsi_id),
                })),
            ],
            Hotplug::DiskRemove { scsi_id } => vec![
                MonitorCommand::human(format!("drive_del drive{}", scsi_id)),
                MonitorCommand::new("device_del")
                    .with_arguments(json!({ "id": format!("scsi-disk{}", scsi_id) })),
            ],
            Hotplug::NicAdd {
                device,
                fd,
                mac,
                pci_addr,
            } => vec![
                MonitorCommand::new("getfd")
                    .with_arguments(json!({ "fdname": format!("fd{}", device) }))
                    .with_fd(fd.clone()),
                MonitorCommand::new("netdev_add").with_arguments(json!({
                    "type": "tap",
                    "id": device,
                    "fd": format!("fd{}", device),
                })),
                MonitorCommand::new("device_add").with_arguments(json!({
                    "driver": "virtio-net-pci",
                    "netdev": device,
                    "mac": mac,
                    "bus": "pci.0",
                    "addr": format!("0x{:x}", pci_addr),
                    "id": device,
                })),
            ],
            Hotplug::NicRemove { device } => vec![
                MonitorCommand::new("device_del").with_arguments(json!({ "id": device })),
                MonitorCommand::new("netdev_del").with_arguments(json!({ "id": device })),
            ],
        }
    }

    pub fn label(&self) -> String {
        match self {
            Hotplug::DiskAdd { scsi_id, .. } => format!("disk-add scsi{}", scsi_id),
            Hotplug::DiskRemove { scsi_id } => format!("disk-remove scsi{}", scsi_id),
            Hotplug::NicAdd { device, .. } => format!("nic-add {}", device),
            Hotplug::NicRemove { device } => format!("nic-remove {}", device),
        }
    }
}

/// An ordered batch of monitor commands with one outcome.
#[derive(Debug, Clone)]
pub struct Session {
    pub label: String,
    pub commands: Vec<MonitorCommand>,
    /// Raised when every command succeeded.
    pub completion: Option<HardwareEvent>,
}

impl Session {
    pub fn new(
        label: impl Into<String>,
        commands: Vec<MonitorCommand>,
        completion: Option<HardwareEvent>,
    ) -> Self {
        Self {
            label: label.into(),
            commands,
            completion,
        }
    }

    pub fn hotplug(request: Hotplug, completion: HardwareEvent) -> Self {
        Self::new(request.label(), request.commands(), Some(completion))
    }

    pub fn quit() -> Self {
        Self::new("quit", vec![MonitorCommand::new("quit")], None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::sync::Arc;

    fn executes(h: &Hotplug) -> Vec<String> {
        h.commands().into_iter().map(|c| c.execute).collect()
    }

    #[test]
    fn test_scsi_device_names() {
        assert_eq!(scsi_device_name(0), "sda");
        assert_eq!(scsi_device_name(1), "sdb");
        assert_eq!(scsi_device_name(25), "sdz");
        assert_eq!(scsi_device_name(26), "sdaa");
        assert_eq!(scsi_device_name(27), "sdab");
        assert_eq!(scsi_device_name(701), "sdzz");
        assert_eq!(scsi_device_name(702), "sdaaa");
    }

    #[test]
    fn test_disk_sessions_are_two_commands() {
        let add = Hotplug::DiskAdd {
            filename: "/dev/dm-3".into(),
            format: "raw".into(),
            scsi_id: 2,
        };
        assert_eq!(executes(&add), vec!["human-monitor-command", "device_add"]);
        let cmds = add.commands();
        assert_eq!(
            cmds[0].arguments.as_ref().unwrap()["command-line"],
            "drive_add dummy file=/dev/dm-3,if=none,id=drive2,format=raw,cache=writeback"
        );
        assert_eq!(cmds[1].arguments.as_ref().unwrap()["scsi-id"], "2");

        let remove = Hotplug::DiskRemove { scsi_id: 2 };
        assert_eq!(executes(&remove), vec!["human-monitor-command", "device_del"]);
    }

    #[test]
    fn test_nic_sessions() {
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        let add = Hotplug::NicAdd {
            device: "hltap0".into(),
            fd: SharedFd(Arc::new(fd)),
            mac: "52:54:00:00:00:01".into(),
            pci_addr: 5,
        };
        assert_eq!(executes(&add), vec!["getfd", "netdev_add", "device_add"]);
        let cmds = add.commands();
        assert!(cmds[0].fd.is_some());
        assert!(cmds[1].fd.is_none());
        assert_eq!(cmds[2].arguments.as_ref().unwrap()["addr"], "0x5");

        let remove = Hotplug::NicRemove {
            device: "hltap0".into(),
        };
        assert_eq!(executes(&remove), vec!["device_del", "netdev_del"]);
    }
}
