use std::env::consts::ARCH;
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;

use goblin::elf::header::{EM_AARCH64, EM_RISCV, EM_X86_64};

use crate::qemu::Transport;

mod blobs {
    include!(concat!(env!("OUT_DIR"), "/init_blobs.rs"));
}

/// Guest architectures virtrun can boot.
///
/// Each tag knows its QEMU system emulator, default machine type and default
/// console transport. KVM acceleration is only offered when the tag matches
/// the host architecture and `/dev/kvm` is usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    /// x86-64
    Amd64,
    /// AArch64
    Arm64,
    /// RISC-V 64
    Riscv64,
}

impl Arch {
    /// The architecture virtrun was compiled for, if supported.
    pub fn host() -> Option<Self> {
        match ARCH {
            "x86_64" => Some(Arch::Amd64),
            "aarch64" => Some(Arch::Arm64),
            "riscv64" => Some(Arch::Riscv64),
            _ => None,
        }
    }

    /// Name of the qemu-system binary for this architecture.
    pub fn qemu_bin(self) -> &'static str {
        match self {
            Arch::Amd64 => "qemu-system-x86_64",
            Arch::Arm64 => "qemu-system-aarch64",
            Arch::Riscv64 => "qemu-system-riscv64",
        }
    }

    /// Default QEMU machine type.
    pub fn default_machine(self) -> &'static str {
        match self {
            Arch::Amd64 => "q35",
            Arch::Arm64 | Arch::Riscv64 => "virt",
        }
    }

    /// Default console transport.
    pub fn default_transport(self) -> Transport {
        match self {
            Arch::Amd64 => Transport::Isa,
            Arch::Arm64 | Arch::Riscv64 => Transport::Mmio,
        }
    }

    /// Default `-cpu` value.
    pub fn default_cpu(self, kvm: bool) -> &'static str {
        if kvm {
            return "host";
        }
        match self {
            Arch::Amd64 => "qemu64",
            Arch::Arm64 | Arch::Riscv64 => "max",
        }
    }

    /// Whether KVM can accelerate a guest of this architecture right now.
    ///
    /// True iff the host architecture equals the tag and the KVM device node
    /// can be opened for writing.
    pub fn kvm_available(self) -> bool {
        Self::host() == Some(self) && OpenOptions::new().write(true).open("/dev/kvm").is_ok()
    }

    /// The embedded statically linked init for this architecture, if it was
    /// available at build time.
    pub fn init_blob(self) -> Option<&'static [u8]> {
        match self {
            Arch::Amd64 => blobs::AMD64,
            Arch::Arm64 => blobs::ARM64,
            Arch::Riscv64 => blobs::RISCV64,
        }
    }

    /// Whether an ELF machine field belongs to this architecture.
    pub(crate) fn matches_elf_machine(self, machine: u16) -> bool {
        matches!(
            (self, machine),
            (Arch::Amd64, EM_X86_64) | (Arch::Arm64, EM_AARCH64) | (Arch::Riscv64, EM_RISCV)
        )
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Riscv64 => "riscv64",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Arch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Arch::Amd64),
            "arm64" => Ok(Arch::Arm64),
            "riscv64" => Ok(Arch::Riscv64),
            other => Err(anyhow::anyhow!(
                "unknown architecture '{other}' (expected amd64, arm64 or riscv64)"
            )),
        }
    }
}

/// Error raised when wrapped mode needs an init blob that was not embedded.
pub fn missing_init_blob(arch: Arch) -> anyhow::Error {
    anyhow::anyhow!(
        "no init program embedded for {arch}; build virtrun-init for the musl \
         target and place it at init-blobs/virtrun-init-{arch} (or set \
         VIRTRUN_INIT_DIR), then rebuild virtrun"
    )
}
