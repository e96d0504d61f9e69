use std::env;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{fmt::Target as LogTarget, Builder};
use log::LevelFilter;

use virtrun::{Arch, Config, Transport, HOST_ERROR_EXIT_CODE};

#[derive(Parser, Debug)]
#[command(version, about = "Run a binary inside an ephemeral QEMU virtual machine")]
struct Args {
    /// Path to the kernel to boot (bzImage/vmlinuz)
    #[arg(long, overrides_with = "kernel")]
    kernel: PathBuf,
    /// Architecture of the guest binary (amd64, arm64, riscv64).
    ///
    /// Defaults to VIRTRUN_ARCH or the host architecture.
    #[arg(long, overrides_with = "arch")]
    arch: Option<String>,
    /// Override the qemu-system binary
    #[arg(long, overrides_with = "qemu_bin")]
    qemu_bin: Option<PathBuf>,
    /// Override the QEMU machine type
    #[arg(long, overrides_with = "machine")]
    machine: Option<String>,
    /// Override the QEMU cpu model
    #[arg(long, overrides_with = "cpu")]
    cpu: Option<String>,
    /// Number of guest CPUs
    #[arg(long, default_value_t = 1, overrides_with = "smp",
          value_parser = clap::value_parser!(u16).range(1..=16))]
    smp: u16,
    /// Guest memory in MiB
    #[arg(long, default_value_t = 256, overrides_with = "memory",
          value_parser = clap::value_parser!(u64).range(128..=16384))]
    memory: u64,
    /// Force software virtualization even when KVM is available
    #[arg(long)]
    nokvm: bool,
    /// Console transport: isa, pci or mmio
    #[arg(long, overrides_with = "transport")]
    transport: Option<String>,
    /// Keep printing guest output after the exit code is seen
    #[arg(long)]
    verbose: bool,
    /// Use the binary itself as the guest init; it must do its own setup
    /// and print the exit-code sentinel
    #[arg(long)]
    standalone: bool,
    /// Do not rewrite go-test file output flags
    #[arg(long = "no-go-test-flag-rewrite")]
    no_go_test_flag_rewrite: bool,
    /// Do not delete the initramfs archive; print its path to stderr
    #[arg(long = "keep-initramfs")]
    keep_initramfs: bool,
    /// Include a file under /data in the guest (repeatable)
    #[arg(long = "add-file")]
    add_file: Vec<PathBuf>,
    /// Load a kernel module in the guest, in the given order (repeatable)
    #[arg(long = "add-module")]
    add_module: Vec<PathBuf>,
    /// Enable debug logging
    #[arg(long)]
    debug: bool,
    /// Binary to run in the guest, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Initialize logging on stderr; `--debug` raises the default filter,
/// RUST_LOG still wins.
fn init_logging(debug: bool) {
    let mut builder = Builder::from_default_env();
    if debug && env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.target(LogTarget::Stderr).init();
}

/// Splice VIRTRUN_ARGS in front of the command line arguments; explicit
/// arguments come later and win through self-overrides.
fn splice_env_args(mut argv: Vec<String>, extra: Option<&str>) -> Vec<String> {
    if let Some(words) = extra.and_then(shlex::split) {
        argv.splice(1..1, words);
    }
    argv
}

/// Assemble the run configuration from parsed arguments.
fn config(args: &Args) -> Result<Config> {
    let arch = match args
        .arch
        .clone()
        .or_else(|| env::var("VIRTRUN_ARCH").ok())
    {
        Some(name) => name.parse()?,
        None => Arch::host().context("running on an unsupported host architecture")?,
    };

    let transport = args
        .transport
        .as_deref()
        .map(str::parse::<Transport>)
        .transpose()?;

    let (binary, binary_args) = args
        .command
        .split_first()
        .context("no guest binary given")?;

    Ok(Config {
        arch,
        kernel: args.kernel.clone(),
        qemu_bin: args.qemu_bin.clone(),
        machine: args.machine.clone(),
        cpu: args.cpu.clone(),
        smp: args.smp,
        memory_mib: args.memory,
        no_kvm: args.nokvm,
        transport,
        verbose: args.verbose,
        standalone: args.standalone,
        no_go_test_flag_rewrite: args.no_go_test_flag_rewrite,
        keep_initramfs: args.keep_initramfs,
        add_files: args.add_file.clone(),
        add_modules: args.add_module.clone(),
        binary: PathBuf::from(binary),
        args: binary_args.to_vec(),
    })
}

fn main() {
    let argv = splice_env_args(
        env::args().collect(),
        env::var("VIRTRUN_ARGS").ok().as_deref(),
    );
    let args = Args::parse_from(argv);
    init_logging(args.debug);

    let code = config(&args)
        .and_then(virtrun::run)
        .unwrap_or_else(|err| {
            eprintln!("virtrun: {err:#}");
            HOST_ERROR_EXIT_CODE
        });
    exit(code);
}
