//! QEMU command line.

use crate::runtime::{BootConfig, SandboxLayout};
use hyperlite_shared::constants::sockets::{INIT_PORT, SHARE_TAG, TTY_PORT};
use std::path::Path;

const KERNEL_APPEND: &str = "console=ttyS0 panic=1 no_timer_check";

fn path(p: &Path) -> String {
    p.display().to_string()
}

fn pflash(p: &Path) -> String {
    format!("if=pflash,file={},readonly=on", p.display())
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

fn boot_args(args: &mut Vec<String>, boot: &BootConfig) {
    let kernel = |args: &mut Vec<String>| {
        if let (Some(kernel), Some(initrd)) = (&boot.kernel, &boot.initrd) {
            args.extend([
                "-kernel".to_string(),
                path(kernel),
                "-initrd".to_string(),
                path(initrd),
                "-append".to_string(),
                KERNEL_APPEND.to_string(),
            ]);
        } else if let Some(kernel) = &boot.kernel {
            args.extend([
                "-kernel".to_string(),
                path(kernel),
                "-append".to_string(),
                KERNEL_APPEND.to_string(),
            ]);
        }
    };

    match (&boot.bios, &boot.cbfs) {
        (Some(bios), Some(cbfs)) => {
            args.extend(["-drive".to_string(), pflash(bios)]);
            args.extend(["-drive".to_string(), pflash(cbfs)]);
        }
        (Some(bios), None) => {
            args.extend(["-bios".to_string(), path(bios)]);
            kernel(args);
        }
        (None, Some(cbfs)) => args.extend(["-drive".to_string(), pflash(cbfs)]),
        (None, None) => kernel(args),
    }
}

/// Build the arguments for one sandbox.
///
/// `kvm` selects hardware acceleration; without it QEMU runs emulated.
pub fn build(sandbox_id: &str, boot: &BootConfig, layout: &SandboxLayout, kvm: bool) -> Vec<String> {
    let mut args = Vec::new();
    push(&mut args, &["-name", sandbox_id]);

    if kvm {
        push(
            &mut args,
            &[
                "-machine",
                "pc-i440fx-2.0,accel=kvm,usb=off",
                "-global",
                "kvm-pit.lost_tick_policy=discard",
                "-cpu",
                "host",
            ],
        );
    } else {
        push(&mut args, &["-machine", "pc-i440fx-2.0,usb=off", "-cpu", "core2duo"]);
    }

    boot_args(&mut args, boot);

    push(
        &mut args,
        &[
            "-realtime",
            "mlock=off",
            "-no-user-config",
            "-nodefaults",
            "-no-hpet",
            "-rtc",
            "base=utc,driftfix=slew",
            "-no-reboot",
            "-display",
            "none",
            "-boot",
            "strict=on",
        ],
    );
    args.extend([
        "-m".to_string(),
        boot.memory_mib.to_string(),
        "-smp".to_string(),
        boot.cpus.to_string(),
        "-qmp".to_string(),
        format!("unix:{},server,nowait", layout.monitor_socket().display()),
        "-serial".to_string(),
        format!("unix:{},server,nowait", layout.console_socket().display()),
    ]);
    push(
        &mut args,
        &[
            "-device",
            "virtio-serial-pci,id=virtio-serial0,bus=pci.0,addr=0x2",
            "-device",
            "virtio-scsi-pci,id=scsi0,bus=pci.0,addr=0x3",
        ],
    );
    args.extend([
        "-chardev".to_string(),
        format!(
            "socket,id=charch0,path={},server,nowait",
            layout.init_socket().display()
        ),
        "-device".to_string(),
        format!(
            "virtserialport,bus=virtio-serial0.0,nr=1,chardev=charch0,id=channel0,name={}",
            INIT_PORT
        ),
        "-chardev".to_string(),
        format!(
            "socket,id=charch1,path={},server,nowait",
            layout.tty_socket().display()
        ),
        "-device".to_string(),
        format!(
            "virtserialport,bus=virtio-serial0.0,nr=2,chardev=charch1,id=channel1,name={}",
            TTY_PORT
        ),
        "-fsdev".to_string(),
        format!(
            "local,id=virtio9p,path={},security_model=none",
            layout.share_dir().display()
        ),
        "-device".to_string(),
        format!("virtio-9p-pci,fsdev=virtio9p,mount_tag={}", SHARE_TAG),
    ]);

    args
}
