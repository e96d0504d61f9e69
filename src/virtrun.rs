use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::arch::Arch;
use crate::gotest::{self, Rewrite};
use crate::initramfs;
use crate::qemu::{CommandError, CommandSpec, Transport};

/// Exit code reported for failures on the host side of the boundary.
///
/// The guest's own exit code passes through unchanged; 126 and 127 are
/// conventionally left to guest init setup and not-PID-1 conditions.
pub const HOST_ERROR_EXIT_CODE: i32 = 125;

/// A validated run configuration, assembled by the CLI.
pub struct Config {
    /// Guest architecture.
    pub arch: Arch,
    /// Kernel to boot.
    pub kernel: PathBuf,
    /// Override for the qemu-system binary.
    pub qemu_bin: Option<PathBuf>,
    /// Override for the QEMU machine type.
    pub machine: Option<String>,
    /// Override for the QEMU cpu model.
    pub cpu: Option<String>,
    /// Number of guest CPUs.
    pub smp: u16,
    /// Guest memory in MiB.
    pub memory_mib: u64,
    /// Force software virtualization.
    pub no_kvm: bool,
    /// Override for the console transport.
    pub transport: Option<Transport>,
    /// Keep printing guest output after the exit code is seen.
    pub verbose: bool,
    /// Use the binary itself as the guest init.
    pub standalone: bool,
    /// Skip go-test file flag rewriting.
    pub no_go_test_flag_rewrite: bool,
    /// Leave the initramfs archive in place and report its path.
    pub keep_initramfs: bool,
    /// Files to include under `/data`.
    pub add_files: Vec<PathBuf>,
    /// Kernel modules to load in the guest, in order.
    pub add_modules: Vec<PathBuf>,
    /// The binary to run in the guest.
    pub binary: PathBuf,
    /// Arguments for the guest binary.
    pub args: Vec<String>,
}

/// Fill architecture defaults and assemble the QEMU command.
fn command_spec(config: &Config, rewrite: Rewrite) -> CommandSpec {
    let kvm = !config.no_kvm && config.arch.kvm_available();
    CommandSpec {
        arch: config.arch,
        qemu_bin: config
            .qemu_bin
            .clone()
            .unwrap_or_else(|| PathBuf::from(config.arch.qemu_bin())),
        kernel: config.kernel.clone(),
        initramfs: PathBuf::new(),
        machine: config
            .machine
            .clone()
            .unwrap_or_else(|| config.arch.default_machine().to_string()),
        cpu: config
            .cpu
            .clone()
            .unwrap_or_else(|| config.arch.default_cpu(kvm).to_string()),
        smp: config.smp,
        memory_mib: config.memory_mib,
        kvm,
        transport: config
            .transport
            .unwrap_or_else(|| config.arch.default_transport()),
        binary: config.binary.clone(),
        init_args: rewrite.args,
        extra_sinks: rewrite.output_files,
        data_files: config.add_files.clone(),
        modules: config.add_modules.clone(),
        verbose: config.verbose,
        exit_code_parser: None,
    }
}

/// Build the initramfs, run QEMU and translate the outcome into the
/// process exit code.
///
/// Guest exit codes pass through; every other failure bubbles up for the
/// CLI to print and map to [`HOST_ERROR_EXIT_CODE`].
pub fn run(config: Config) -> Result<i32> {
    let rewrite = if config.no_go_test_flag_rewrite {
        Rewrite {
            args: config.args.clone(),
            output_files: Vec::new(),
        }
    } else {
        gotest::rewrite_go_test_flags(&config.args)
    };

    let mut spec = command_spec(&config, rewrite);
    spec.validate()?;

    let initramfs = initramfs::Builder::new(config.arch, &config.binary)
        .standalone(config.standalone)
        .add_files(config.add_files.clone())
        .add_modules(config.add_modules.clone())
        .build()
        .context("failed to build initramfs")?;
    if config.keep_initramfs {
        eprintln!("initramfs kept at {}", initramfs.display());
    }
    let keep = config.keep_initramfs;
    let initramfs = scopeguard::guard(initramfs, move |path| {
        if keep {
            return;
        }
        if let Err(err) = fs::remove_file(&path) {
            warn!("failed to remove initramfs {}: {err}", path.display());
        }
    });

    spec.initramfs = initramfs.clone();
    let result = spec.run();
    drop(initramfs);

    match result {
        Ok(()) => Ok(0),
        Err(CommandError::GuestNonZeroExitCode(code)) => {
            debug!("guest exited with {code}");
            Ok(code)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(arch: Arch) -> Config {
        Config {
            arch,
            kernel: PathBuf::from("/boot/vmlinuz"),
            qemu_bin: None,
            machine: None,
            cpu: None,
            smp: 1,
            memory_mib: 256,
            no_kvm: false,
            transport: None,
            verbose: false,
            standalone: false,
            no_go_test_flag_rewrite: false,
            keep_initramfs: false,
            add_files: Vec::new(),
            add_modules: Vec::new(),
            binary: PathBuf::from("/bin/true"),
            args: Vec::new(),
        }
    }

    #[test]
    fn test_cross_arch_defaults() {
        // arm64 guest on (most likely) a non-arm64 test host: software
        // virtualization, virt machine, mmio consoles, aarch64 emulator
        let config = base_config(Arch::Arm64);
        let spec = command_spec(&config, Rewrite::default());

        assert_eq!(spec.machine, "virt");
        assert_eq!(spec.transport, Transport::Mmio);
        assert_eq!(spec.qemu_bin, PathBuf::from("qemu-system-aarch64"));
        if Arch::host() != Some(Arch::Arm64) {
            assert!(!spec.kvm);
            assert_eq!(spec.cpu, "max");
        }
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let mut config = base_config(Arch::Amd64);
        config.machine = Some("microvm".to_string());
        config.transport = Some(Transport::Mmio);
        config.qemu_bin = Some(PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"));
        config.no_kvm = true;

        let spec = command_spec(&config, Rewrite::default());
        assert_eq!(spec.machine, "microvm");
        assert_eq!(spec.transport, Transport::Mmio);
        assert_eq!(spec.qemu_bin, PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"));
        assert!(!spec.kvm);
    }

    #[test]
    fn test_rewrite_feeds_extra_sinks() {
        let mut config = base_config(Arch::Amd64);
        config.args = vec!["-test.coverprofile=cover.out".to_string()];

        let rewrite = gotest::rewrite_go_test_flags(&config.args);
        let spec = command_spec(&config, rewrite);

        assert_eq!(spec.init_args, vec!["-test.coverprofile=/dev/virtrun2"]);
        assert_eq!(spec.extra_sinks, vec![PathBuf::from("cover.out")]);
    }
}
