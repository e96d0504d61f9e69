use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, warn};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup, dup2, mkfifo};

use super::CleanupStack;
use crate::gotest::guest_console_path;

/// virtio serial buses are set up with max_ports=8 on the host side.
const MAX_PORTS: usize = 8;

/// Encoder read chunk; each chunk becomes one base64 frame.
const CHUNK: usize = 3072;

/// Discover host console ports and expose every port but the kernel's as a
/// named pipe `/dev/virtrun<n>`.
///
/// Port 1 carries the guest's logical stdout: the process's fd 1 is
/// replaced with the pipe's writer end so anything the user binary prints
/// lands on the host's stdout pipe. The original stdout (the default
/// console) is restored during cleanup, before the sentinel is printed.
pub(crate) fn setup(cleanup: &mut CleanupStack) -> Result<()> {
    let ports = discover_ports()?;
    debug!("console ports: {ports:?}");

    for (n, backing) in ports {
        if n == 0 {
            // Reserved for the kernel log and the exit-code sentinel
            continue;
        }
        let fifo = PathBuf::from(guest_console_path(n));
        start_encoder(&fifo, &backing, cleanup)
            .with_context(|| format!("failed to wrap console port {n}"))?;
        if n == 1 {
            redirect_stdout(&fifo, cleanup).context("failed to redirect stdout")?;
        }
    }
    Ok(())
}

/// Probe for virtio consoles; fall back to the ISA serial ports the kernel
/// actually found.
fn discover_ports() -> Result<Vec<(usize, PathBuf)>> {
    let mut ports = Vec::new();
    for n in 0..MAX_PORTS {
        let path = PathBuf::from(format!("/dev/hvc{n}"));
        if OpenOptions::new().write(true).open(&path).is_ok() {
            ports.push((n, path));
        }
    }
    if !ports.is_empty() {
        return Ok(ports);
    }

    let table = fs::read_to_string("/proc/tty/driver/serial").unwrap_or_default();
    Ok(parse_serial_table(&table))
}

/// Rows look like `0: uart:16550A port:000003F8 irq:4 tx:118 rx:0`; a
/// `uart:unknown` entry is a port the kernel did not probe successfully.
fn parse_serial_table(table: &str) -> Vec<(usize, PathBuf)> {
    let mut ports = Vec::new();
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let Some(index) = fields
            .next()
            .and_then(|f| f.strip_suffix(':'))
            .and_then(|f| f.parse::<usize>().ok())
        else {
            continue;
        };
        let Some(uart) = fields.next().and_then(|f| f.strip_prefix("uart:")) else {
            continue;
        };
        if uart == "unknown" {
            continue;
        }
        ports.push((index, PathBuf::from(format!("/dev/ttyS{index}"))));
    }
    ports
}

/// Create the FIFO and start the worker that base64-encodes everything
/// written to it into the backing console.
fn start_encoder(fifo: &Path, backing: &Path, cleanup: &mut CleanupStack) -> Result<()> {
    mkfifo(fifo, Mode::from_bits_truncate(0o666))
        .with_context(|| format!("failed to create fifo {}", fifo.display()))?;
    let console = OpenOptions::new()
        .write(true)
        .open(backing)
        .with_context(|| format!("failed to open console {}", backing.display()))?;

    let fifo_path = fifo.to_path_buf();
    let handle = thread::spawn(move || {
        if let Err(err) = encode_stream(&fifo_path, console) {
            warn!("encoder for {} failed: {err:#}", fifo_path.display());
        }
    });

    let fifo_path = fifo.to_path_buf();
    cleanup.defer("console encoder", move || {
        // If nothing ever opened the pipe the worker is still blocked in
        // open(); a non-blocking write-open releases it (ENXIO just means
        // the worker is already past that point).
        let _ = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo_path);
        let _ = handle.join();
    });
    Ok(())
}

fn encode_stream(fifo: &Path, console: File) -> Result<()> {
    // Blocks until the first writer shows up
    let mut reader = File::open(fifo)?;
    let mut writer = console;
    let mut buf = [0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        // Newline-framed so the transport's newline rewriting cannot
        // corrupt the payload; the host decodes frame by frame
        writeln!(writer, "{}", BASE64.encode(&buf[..n]))?;
    }
    writer.flush()?;
    Ok(())
}

/// Point the process's stdout at the port-1 pipe, restoring the default
/// console during cleanup so the sentinel still reaches the host parser.
fn redirect_stdout(fifo: &Path, cleanup: &mut CleanupStack) -> Result<()> {
    let saved = dup(libc::STDOUT_FILENO).context("failed to save stdout")?;
    // Rendezvous with the encoder's read-open
    let writer = OpenOptions::new()
        .write(true)
        .open(fifo)
        .with_context(|| format!("failed to open {}", fifo.display()))?;
    dup2(writer.as_raw_fd(), libc::STDOUT_FILENO).context("failed to replace stdout")?;
    drop(writer);

    cleanup.defer("restore stdout", move || {
        let _ = dup2(saved, libc::STDOUT_FILENO);
        let _ = close(saved);
    });
    Ok(())
}
