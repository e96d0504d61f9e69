use std::fs;

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::mount::{mount, MsFlags};

struct MountPoint {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
}

fn essential_mounts() -> Vec<MountPoint> {
    vec![
        MountPoint {
            source: "devtmpfs",
            target: "/dev",
            fstype: "devtmpfs",
            flags: MsFlags::MS_NOSUID,
            data: Some("mode=0755"),
        },
        MountPoint {
            source: "proc",
            target: "/proc",
            fstype: "proc",
            flags: MsFlags::MS_NOSUID
                .union(MsFlags::MS_NODEV)
                .union(MsFlags::MS_NOEXEC),
            data: None,
        },
        MountPoint {
            source: "sysfs",
            target: "/sys",
            fstype: "sysfs",
            flags: MsFlags::MS_NOSUID
                .union(MsFlags::MS_NODEV)
                .union(MsFlags::MS_NOEXEC),
            data: None,
        },
    ]
}

fn extra_mounts() -> Vec<MountPoint> {
    let nosuid_nodev = MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV);
    let secure = nosuid_nodev.union(MsFlags::MS_NOEXEC);
    vec![
        MountPoint {
            source: "tmpfs",
            target: "/run",
            fstype: "tmpfs",
            flags: nosuid_nodev,
            data: Some("mode=0755"),
        },
        MountPoint {
            source: "tmpfs",
            target: "/tmp",
            fstype: "tmpfs",
            flags: nosuid_nodev,
            data: None,
        },
        MountPoint {
            source: "devpts",
            target: "/dev/pts",
            fstype: "devpts",
            flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NOEXEC),
            data: Some("gid=5,mode=0620,ptmxmode=0666"),
        },
        MountPoint {
            source: "tmpfs",
            target: "/dev/shm",
            fstype: "tmpfs",
            flags: nosuid_nodev,
            data: None,
        },
        MountPoint {
            source: "bpf",
            target: "/sys/fs/bpf",
            fstype: "bpf",
            flags: secure,
            data: Some("mode=0700"),
        },
        MountPoint {
            source: "cgroup2",
            target: "/sys/fs/cgroup",
            fstype: "cgroup2",
            flags: secure,
            data: None,
        },
        MountPoint {
            source: "fusectl",
            target: "/sys/fs/fuse/connections",
            fstype: "fusectl",
            flags: secure,
            data: None,
        },
        MountPoint {
            source: "pstore",
            target: "/sys/fs/pstore",
            fstype: "pstore",
            flags: secure,
            data: None,
        },
        MountPoint {
            source: "configfs",
            target: "/sys/kernel/config",
            fstype: "configfs",
            flags: secure,
            data: None,
        },
        MountPoint {
            source: "debugfs",
            target: "/sys/kernel/debug",
            fstype: "debugfs",
            flags: secure,
            data: None,
        },
        MountPoint {
            source: "securityfs",
            target: "/sys/kernel/security",
            fstype: "securityfs",
            flags: secure,
            data: None,
        },
        MountPoint {
            source: "tracefs",
            target: "/sys/kernel/tracing",
            fstype: "tracefs",
            flags: secure,
            data: None,
        },
        MountPoint {
            source: "hugetlbfs",
            target: "/dev/hugepages",
            fstype: "hugetlbfs",
            flags: MsFlags::MS_RELATIME,
            data: Some("pagesize=2M"),
        },
        MountPoint {
            source: "mqueue",
            target: "/dev/mqueue",
            fstype: "mqueue",
            flags: secure,
            data: None,
        },
    ]
}

fn mount_one(point: &MountPoint) -> Result<()> {
    fs::create_dir_all(point.target)
        .with_context(|| format!("failed to create {}", point.target))?;
    mount(
        Some(point.source),
        point.target,
        Some(point.fstype),
        point.flags,
        point.data,
    )
    .with_context(|| format!("failed to mount {} at {}", point.fstype, point.target))?;
    debug!("mounted {} at {}", point.fstype, point.target);
    Ok(())
}

/// Mount `/dev`, `/proc` and `/sys`. Everything else depends on these, so
/// any failure is fatal.
pub(crate) fn mount_essential() -> Result<()> {
    for point in essential_mounts() {
        mount_one(&point)?;
    }
    Ok(())
}

/// Mount the optional pseudo-filesystems. Kernels miss some of these
/// depending on configuration, so individual failures are only logged.
pub(crate) fn mount_extra() {
    for point in extra_mounts() {
        if let Err(err) = mount_one(&point) {
            warn!("{err:#}");
        }
    }
}
