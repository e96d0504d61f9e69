use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::os::fd::RawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use itertools::Itertools;
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;

use crate::arch::Arch;
use crate::elf::{self, ElfError};
use crate::output::{default_exit_code_parser, ExitCodeParser, StdoutParser, Verdict};
use crate::pipes::{ConsoleError, CopyMode, Hub, Sink};
use crate::qemuargs::{ArgsError, Argument, Arguments, ConsoleBackend};

pub use crate::qemuargs::Transport;

/// How long the pipe hub may drain after QEMU exits.
const PIPE_GRACE: Duration = Duration::from_secs(1);

/// Console limit per command; virtio serial buses are configured with
/// max_ports=8 and console 0 plus guest stdout are always present.
const MAX_CONSOLES: usize = 8;

/// Validation failures detected before QEMU is spawned.
#[derive(Debug, Error)]
pub enum SpecError {
    /// The machine type cannot carry the selected transport.
    #[error("machine '{machine}' does not support the {transport} transport")]
    IncompatibleTransport {
        /// Machine type.
        machine: String,
        /// Selected transport.
        transport: Transport,
    },
    /// More consoles were requested than the machine/transport pair offers.
    #[error("machine '{machine}' supports at most {limit} console(s), {requested} requested")]
    TooManyConsoles {
        /// Machine type.
        machine: String,
        /// Console limit for the configuration.
        limit: usize,
        /// Consoles the command would need.
        requested: usize,
    },
    /// Guests need at least 128 MiB to boot the kernel and unpack the
    /// initramfs.
    #[error("memory must be at least 128 MiB, got {0}")]
    MemoryTooSmall(u64),
    /// At least one CPU is required.
    #[error("smp must be at least 1, got {0}")]
    SmpTooSmall(u16),
    /// A referenced input is missing or not a regular file.
    #[error("{0} is not an existing regular file")]
    NotARegularFile(PathBuf),
    /// The guest binary does not match the requested architecture.
    #[error(transparent)]
    Elf(#[from] ElfError),
}

/// Failures raised while driving QEMU, mapped to exit codes by the caller.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command was rejected before spawn.
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
    /// The argument list did not compile.
    #[error(transparent)]
    Args(#[from] ArgsError),
    /// QEMU could not be started.
    #[error("failed to start {qemu}: {err}")]
    Spawn {
        /// QEMU binary.
        qemu: PathBuf,
        /// Underlying error.
        #[source]
        err: io::Error,
    },
    /// QEMU terminated abnormally before the guest reported anything.
    #[error("qemu exited with status {exit_code}")]
    QemuFailed {
        /// QEMU's own exit code (128+n for signals).
        exit_code: i32,
    },
    /// The guest kernel panicked.
    #[error("guest kernel panicked")]
    GuestPanic,
    /// The guest kernel killed a process for running out of memory.
    #[error("guest ran out of memory")]
    GuestOom,
    /// The guest binary exited with a nonzero code.
    #[error("guest command exited with code {0}")]
    GuestNonZeroExitCode(i32),
    /// The default console closed without a sentinel line.
    #[error("guest did not report an exit code")]
    GuestNoExitCodeFound,
    /// A console pipe failed or stayed unexpectedly silent.
    #[error(transparent)]
    Console(#[from] ConsoleError),
    /// Supervision failed on the host side.
    #[error("i/o error while supervising qemu: {0}")]
    Io(#[from] io::Error),
}

impl CommandError {
    /// The exit code recovered from the guest, if any.
    pub fn guest_exit_code(&self) -> Option<i32> {
        match self {
            CommandError::GuestNonZeroExitCode(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether the failure originated inside the guest.
    pub fn is_guest(&self) -> bool {
        matches!(
            self,
            CommandError::GuestPanic
                | CommandError::GuestOom
                | CommandError::GuestNonZeroExitCode(_)
                | CommandError::GuestNoExitCodeFound
        )
    }
}

/// A fully resolved QEMU invocation.
///
/// Construct one field by field (the orchestrator does), call
/// [`CommandSpec::validate`], then [`CommandSpec::run`].
pub struct CommandSpec {
    /// Guest architecture.
    pub arch: Arch,
    /// qemu-system binary to execute.
    pub qemu_bin: PathBuf,
    /// Kernel image to boot.
    pub kernel: PathBuf,
    /// Initramfs archive built for this run.
    pub initramfs: PathBuf,
    /// QEMU machine type, options included (`virt`, `microvm,pit=off`, ...).
    pub machine: String,
    /// QEMU cpu model.
    pub cpu: String,
    /// Number of guest CPUs.
    pub smp: u16,
    /// Guest memory in MiB.
    pub memory_mib: u64,
    /// Whether to enable KVM acceleration.
    pub kvm: bool,
    /// Console transport.
    pub transport: Transport,
    /// Host path of the guest executable, revalidated against `arch`.
    pub binary: PathBuf,
    /// Arguments handed to the guest init (and through it to the binary).
    pub init_args: Vec<String>,
    /// Host files receiving the additional consoles, in registry order
    /// (console index 2 onward).
    pub extra_sinks: Vec<PathBuf>,
    /// Files included under `/data`, checked before spawn.
    pub data_files: Vec<PathBuf>,
    /// Kernel modules included in the initramfs, checked before spawn.
    pub modules: Vec<PathBuf>,
    /// Keep forwarding console output after the exit code is seen.
    pub verbose: bool,
    /// Custom sentinel scanner; the default recognizes
    /// [`crate::output::EXIT_CODE_ID`].
    pub exit_code_parser: Option<ExitCodeParser>,
}

fn ensure_regular_file(path: &Path) -> Result<(), SpecError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(SpecError::NotARegularFile(path.to_owned())),
    }
}

impl CommandSpec {
    /// Total consoles this command wires up: kernel console, guest stdout,
    /// plus one per additional sink.
    fn console_count(&self) -> usize {
        2 + self.extra_sinks.len()
    }

    /// Enforce the pre-spawn invariants.
    pub fn validate(&self) -> Result<(), SpecError> {
        // Machine options do not matter for transport compatibility
        let machine = self
            .machine
            .split(',')
            .next()
            .unwrap_or_default()
            .to_string();
        let incompatible = || SpecError::IncompatibleTransport {
            machine: machine.clone(),
            transport: self.transport,
        };

        match self.transport {
            Transport::Pci if machine.starts_with("microvm") => return Err(incompatible()),
            Transport::Isa if machine.starts_with("microvm") && self.console_count() > 1 => {
                return Err(SpecError::TooManyConsoles {
                    machine,
                    limit: 1,
                    requested: self.console_count(),
                });
            }
            Transport::Isa if machine.starts_with("virt") => return Err(incompatible()),
            Transport::Mmio if machine.starts_with("q35") || machine.starts_with("pc") => {
                return Err(incompatible())
            }
            _ => {}
        }

        if self.console_count() > MAX_CONSOLES {
            return Err(SpecError::TooManyConsoles {
                machine,
                limit: MAX_CONSOLES,
                requested: self.console_count(),
            });
        }

        if self.memory_mib < 128 {
            return Err(SpecError::MemoryTooSmall(self.memory_mib));
        }
        if self.smp < 1 {
            return Err(SpecError::SmpTooSmall(self.smp));
        }

        ensure_regular_file(&self.kernel)?;
        ensure_regular_file(&self.binary)?;
        for path in self.data_files.iter().chain(&self.modules) {
            ensure_regular_file(path)?;
        }

        elf::validate(&self.binary, self.arch)?;

        Ok(())
    }

    /// The guest kernel command line.
    fn kernel_cmdline(&self) -> String {
        let mut params = vec![
            format!("console={}", self.transport.console_device(0)),
            // Paired with -no-reboot: a panicking kernel reboots
            // immediately and qemu exits instead of hanging
            "panic=-1".to_string(),
        ];
        if self.smp == 1 {
            params.push("acpi=off".to_string());
        }
        if self.verbose {
            params.push("debug".to_string());
            // Reaches the guest init's env_logger through the kernel's
            // environment passing
            params.push("RUST_LOG=debug".to_string());
        } else {
            params.push("quiet".to_string());
        }
        if !self.init_args.is_empty() {
            params.push("--".to_string());
            params.extend(self.init_args.iter().cloned());
        }
        params.join(" ")
    }

    /// Compile the full argv fragment, with additional console chardevs
    /// pointing at the inherited descriptors 3, 4, ...
    fn build_args(&self) -> Result<Vec<OsString>, ArgsError> {
        let mut args = Arguments::new();

        args.push(Argument::unique_with("machine", &self.machine));
        args.push(Argument::unique_with("cpu", &self.cpu));
        args.push(Argument::unique_with("smp", self.smp));
        args.push(Argument::unique_with("m", self.memory_mib));
        if self.kvm {
            args.push(Argument::unique("enable-kvm"));
        }
        args.push(Argument::unique_with("kernel", self.kernel.display()));
        args.push(Argument::unique_with("initrd", self.initramfs.display()));
        args.push(Argument::unique("no-reboot"));
        args.push(Argument::unique_with("display", "none"));
        args.push(Argument::unique("nodefaults"));

        args.push_serial_bus(self.transport);
        args.push_console(self.transport, "con0", &ConsoleBackend::Stdio);
        for n in 1..self.console_count() {
            let fd = 2 + n as RawFd;
            args.push_console(self.transport, &format!("con{n}"), &ConsoleBackend::Fd(fd));
        }

        args.push(Argument::unique_with("append", self.kernel_cmdline()));

        args.compile()
    }

    /// Spawn QEMU, demultiplex its consoles and translate the outcome.
    pub fn run(mut self) -> Result<(), CommandError> {
        self.validate()?;

        // Pipe 0 carries the guest's logical stdout (a quiet binary is
        // fine); pipes 1.. feed the additional sink files, which are
        // expected to produce data.
        let mut hub = Hub::new();
        hub.add("guest stdout", CopyMode::DecodeLines, Sink::Stdout, true)?;
        for path in &self.extra_sinks {
            let file = File::create(path)?;
            hub.add(
                &format!("file:{}", path.display()),
                CopyMode::Decode,
                Sink::File(file),
                false,
            )?;
        }

        let argv = self.build_args()?;
        debug!(
            "qemu invocation: {} {}",
            self.qemu_bin.display(),
            argv.iter().map(|a| a.to_string_lossy()).join(" ")
        );

        let parser = StdoutParser::with_exit_code_parser(
            self.verbose,
            self.exit_code_parser
                .take()
                .unwrap_or_else(default_exit_code_parser),
        );

        let mut cmd = Command::new(&self.qemu_bin);
        cmd.args(&argv)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let writer_fds = hub.writer_fds();
        // SAFETY: move_fds only performs async-signal-safe calls and does
        // not allocate in the forked child.
        unsafe {
            cmd.pre_exec(move || move_fds(&writer_fds));
        }

        let child = cmd.spawn().map_err(|err| CommandError::Spawn {
            qemu: self.qemu_bin.clone(),
            err,
        })?;
        // Ensure qemu is interrupted and reaped even if we bail early
        let mut child = scopeguard::guard(child, child_cleanup);

        // Forward termination signals as SIGINT (never SIGKILL) so qemu
        // can reset the terminal on its way out.
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let signals_handle = signals.handle();
        let qemu_pid = Pid::from_raw(child.id() as i32);
        let signal_thread = thread::spawn(move || {
            for signal in signals.forever() {
                debug!("forwarding signal {signal} to qemu as SIGINT");
                let _ = kill(qemu_pid, Signal::SIGINT);
            }
        });

        let parser_thread = spawn_stdout_parser(&mut child, parser);

        let wait_result = child.wait();
        signals_handle.close();
        hub.close_writers();
        let _ = signal_thread.join();

        let parser = parser_thread
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdout parser thread panicked"))?;
        let status = wait_result?;
        let verdict = parser.finish();
        let hub_result = hub.wait(PIPE_GRACE);

        debug!("qemu exited with {status}, guest verdict {verdict:?}");

        if !status.success() && !matches!(verdict, Verdict::Success | Verdict::NonZeroExit(_)) {
            let exit_code = status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
            return Err(CommandError::QemuFailed { exit_code });
        }

        match verdict {
            Verdict::Success => {}
            Verdict::NonZeroExit(code) => return Err(CommandError::GuestNonZeroExitCode(code)),
            Verdict::Panic => return Err(CommandError::GuestPanic),
            Verdict::Oom => return Err(CommandError::GuestOom),
            Verdict::NoExitCode => return Err(CommandError::GuestNoExitCodeFound),
        }

        hub_result?;
        Ok(())
    }
}

/// Interrupt and reap a possibly still-running QEMU child.
fn child_cleanup(mut child: Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!("qemu already exited with {status}"),
        Ok(None) => {
            debug!("qemu still alive, interrupting");
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGINT);
            if let Err(err) = child.wait() {
                warn!("failed to wait on interrupted qemu: {err}");
            }
        }
        Err(err) => warn!("failed to check qemu state: {err}"),
    }
}

/// Stream QEMU's stdout (the guest's default console) through the parser.
///
/// Passthrough lines land on host stderr so kernel chatter shares a stream
/// with host diagnostics, leaving host stdout to the guest payload.
fn spawn_stdout_parser(child: &mut Child, mut parser: StdoutParser) -> JoinHandle<StdoutParser> {
    // unwrap() should never fail b/c we are capturing stdout
    let stdout = child.stdout.take().unwrap();

    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut sink = io::stderr();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    if let Err(err) = parser.scan_line(&line, &mut sink) {
                        debug!("failed to forward console line: {err}");
                    }
                }
                Err(err) => {
                    debug!("failed to read qemu stdout: {err}");
                    break;
                }
            }
        }
        parser
    })
}

/// Move the inherited writer ends onto file descriptors 3, 4, ... in the
/// forked child.
///
/// Runs between fork and exec: only async-signal-safe calls, no
/// allocation. Sources inside the target window are lifted above it first
/// so a dup2 cannot clobber a source that has not been copied yet. dup2
/// clears close-on-exec on the target; the lifted and original
/// descriptors keep it and vanish at exec.
fn move_fds(fds: &[RawFd]) -> io::Result<()> {
    const MAX: usize = MAX_CONSOLES + 8;
    let mut src = [-1 as RawFd; MAX];
    if fds.len() > MAX {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "too many fds"));
    }

    let window_end = 3 + fds.len() as RawFd;
    for (i, &fd) in fds.iter().enumerate() {
        src[i] = fd;
        if fd < window_end {
            let lifted = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, window_end) };
            if lifted < 0 {
                return Err(io::Error::last_os_error());
            }
            src[i] = lifted;
        }
    }
    for (i, &fd) in src[..fds.len()].iter().enumerate() {
        if unsafe { libc::dup2(fd, 3 + i as RawFd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    fn test_spec(machine: &str, transport: Transport) -> (CommandSpec, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kernel = touch(dir.path(), "vmlinuz");
        let spec = CommandSpec {
            arch: Arch::host().expect("supported host arch"),
            qemu_bin: PathBuf::from("qemu-system-x86_64"),
            kernel,
            initramfs: dir.path().join("initramfs.img"),
            machine: machine.to_string(),
            cpu: "max".to_string(),
            smp: 2,
            memory_mib: 256,
            kvm: false,
            transport,
            binary: std::env::current_exe().unwrap(),
            init_args: Vec::new(),
            extra_sinks: Vec::new(),
            data_files: Vec::new(),
            modules: Vec::new(),
            verbose: false,
            exit_code_parser: None,
        };
        (spec, dir)
    }

    #[rstest]
    #[case("microvm", Transport::Mmio, true)]
    #[case("microvm", Transport::Pci, false)]
    #[case("microvm", Transport::Isa, false)] // stdout console makes it two ISA consoles
    #[case("microvm,pit=off", Transport::Pci, false)]
    #[case("virt", Transport::Mmio, true)]
    #[case("virt", Transport::Pci, true)]
    #[case("virt", Transport::Isa, false)]
    #[case("virt,gic-version=3", Transport::Isa, false)]
    #[case("q35", Transport::Isa, true)]
    #[case("q35", Transport::Pci, true)]
    #[case("q35", Transport::Mmio, false)]
    #[case("pc", Transport::Mmio, false)]
    #[case("pc", Transport::Isa, true)]
    fn test_validate_machine_transport(
        #[case] machine: &str,
        #[case] transport: Transport,
        #[case] ok: bool,
    ) {
        let (spec, _dir) = test_spec(machine, transport);
        assert_eq!(spec.validate().is_ok(), ok, "{machine}/{transport}");
    }

    #[test]
    fn test_validate_memory_boundary() {
        let (mut spec, _dir) = test_spec("q35", Transport::Isa);
        spec.memory_mib = 127;
        assert!(matches!(
            spec.validate().unwrap_err(),
            SpecError::MemoryTooSmall(127)
        ));
        spec.memory_mib = 128;
        spec.validate().unwrap();
    }

    #[test]
    fn test_validate_smp_boundary() {
        let (mut spec, _dir) = test_spec("q35", Transport::Isa);
        spec.smp = 0;
        assert!(matches!(
            spec.validate().unwrap_err(),
            SpecError::SmpTooSmall(0)
        ));
        spec.smp = 1;
        spec.validate().unwrap();
    }

    #[test]
    fn test_validate_missing_kernel() {
        let (mut spec, _dir) = test_spec("q35", Transport::Isa);
        spec.kernel = PathBuf::from("/definitely/not/there");
        assert!(matches!(
            spec.validate().unwrap_err(),
            SpecError::NotARegularFile(_)
        ));
    }

    #[test]
    fn test_validate_missing_data_file() {
        let (mut spec, _dir) = test_spec("q35", Transport::Isa);
        spec.data_files.push(PathBuf::from("/missing/data"));
        assert!(matches!(
            spec.validate().unwrap_err(),
            SpecError::NotARegularFile(_)
        ));
    }

    #[test]
    fn test_validate_rejects_non_elf_binary() {
        let (mut spec, dir) = test_spec("q35", Transport::Isa);
        spec.binary = touch(dir.path(), "script.sh");
        assert!(matches!(spec.validate().unwrap_err(), SpecError::Elf(_)));
    }

    #[test]
    fn test_validate_console_limit() {
        let (mut spec, dir) = test_spec("q35", Transport::Pci);
        for n in 0..7 {
            spec.extra_sinks.push(dir.path().join(format!("sink{n}")));
        }
        assert!(matches!(
            spec.validate().unwrap_err(),
            SpecError::TooManyConsoles { requested: 9, .. }
        ));
    }

    #[test]
    fn test_kernel_cmdline_acpi_off_single_cpu() {
        let (mut spec, _dir) = test_spec("q35", Transport::Isa);
        spec.smp = 1;
        let cmdline = spec.kernel_cmdline();
        assert!(cmdline.contains("acpi=off"), "{cmdline}");

        spec.smp = 2;
        assert!(!spec.kernel_cmdline().contains("acpi=off"));
    }

    #[test]
    fn test_kernel_cmdline_console_per_transport() {
        let (spec, _dir) = test_spec("q35", Transport::Isa);
        assert!(spec.kernel_cmdline().starts_with("console=ttyS0 "));

        let (spec, _dir) = test_spec("virt", Transport::Mmio);
        assert!(spec.kernel_cmdline().starts_with("console=hvc0 "));
    }

    #[test]
    fn test_kernel_cmdline_forwards_init_args() {
        let (mut spec, _dir) = test_spec("q35", Transport::Isa);
        spec.init_args = vec!["-test.v".to_string(), "-test.run=TestFoo".to_string()];
        let cmdline = spec.kernel_cmdline();
        assert!(cmdline.ends_with("-- -test.v -test.run=TestFoo"), "{cmdline}");
    }

    #[test]
    fn test_kernel_cmdline_verbose() {
        let (mut spec, _dir) = test_spec("q35", Transport::Isa);
        assert!(spec.kernel_cmdline().contains("quiet"));
        spec.verbose = true;
        let cmdline = spec.kernel_cmdline();
        assert!(
            cmdline.contains("debug") && !cmdline.contains("quiet"),
            "{cmdline}"
        );
    }

    #[test]
    fn test_build_args_wires_fd_consoles() {
        let (mut spec, dir) = test_spec("virt", Transport::Mmio);
        spec.extra_sinks.push(dir.path().join("cover.out"));
        let argv: Vec<String> = spec
            .build_args()
            .unwrap()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        // guest stdout on fd 3, first extra console on fd 4
        assert!(
            argv.contains(&"file,id=con1,path=/dev/fd/3".to_string()),
            "{argv:?}"
        );
        assert!(
            argv.contains(&"file,id=con2,path=/dev/fd/4".to_string()),
            "{argv:?}"
        );
        // one-time serial bus plus one virtconsole per console
        let buses = argv
            .iter()
            .filter(|a| a.starts_with("virtio-serial-device"))
            .count();
        assert_eq!(buses, 1);
        let consoles = argv.iter().filter(|a| a.starts_with("virtconsole,")).count();
        assert_eq!(consoles, 3);
    }

    #[test]
    fn test_build_args_contains_boot_set() {
        let (spec, _dir) = test_spec("q35", Transport::Isa);
        let argv: Vec<String> = spec
            .build_args()
            .unwrap()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        for flag in [
            "-machine",
            "-kernel",
            "-initrd",
            "-append",
            "-no-reboot",
            "-nodefaults",
        ] {
            assert!(argv.contains(&flag.to_string()), "{flag} missing from {argv:?}");
        }
        assert!(!argv.contains(&"-enable-kvm".to_string()));
    }
}
