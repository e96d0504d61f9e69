//! The guest side of virtrun: what runs as PID 1 inside the VM.
//!
//! The `virtrun-init` binary is a thin wrapper around [`run`]. In wrapped
//! mode the host embeds that binary into the initramfs as `/init`; it
//! prepares the guest, executes `/main`, prints the exit-code sentinel on
//! the default console and reboots.

mod console;
mod modules;
mod mounts;

use std::env;
use std::io::{self, Write};
use std::os::unix::fs::symlink;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{self, Command, ExitStatus};

use anyhow::{Context, Result};
use log::{debug, error, warn};
use nix::sys::reboot::{reboot, RebootMode};

use crate::output::EXIT_CODE_ID;

/// Cleanup callbacks, run in LIFO order after the user binary returns.
pub(crate) struct CleanupStack {
    items: Vec<(&'static str, Box<dyn FnOnce()>)>,
}

impl CleanupStack {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Register a callback; later registrations run first.
    pub(crate) fn defer<F: FnOnce() + 'static>(&mut self, name: &'static str, f: F) {
        self.items.push((name, Box::new(f)));
    }

    fn run(&mut self) {
        while let Some((name, f)) = self.items.pop() {
            debug!("cleanup: {name}");
            f();
        }
    }
}

/// Run the guest init to completion. Never returns.
///
/// Must be PID 1; anything else means the binary escaped its VM and there
/// is no sane way to continue.
pub fn run() -> ! {
    if process::id() != 1 {
        panic!("virtrun-init must run as PID 1 inside a virtual machine");
    }

    let mut cleanup = CleanupStack::new();
    let code = match setup_and_exec(&mut cleanup) {
        Ok(code) => code,
        Err(err) => {
            error!("init failed: {err:#}");
            -1
        }
    };
    // Encoders close and stdout is restored to the default console here,
    // so the sentinel below is the last thing the host parser sees
    cleanup.run();

    println!("{EXIT_CODE_ID}: {code}");
    let _ = io::stdout().flush();

    if let Err(err) = reboot(RebootMode::RB_AUTOBOOT) {
        error!("reboot failed: {err}");
    }
    // Exiting PID 1 panics the kernel, which the host observes
    process::exit(126);
}

fn setup_and_exec(cleanup: &mut CleanupStack) -> Result<i32> {
    mounts::mount_essential()?;
    mounts::mount_extra();
    modules::load_all(Path::new("/lib/modules"))?;
    create_dev_symlinks();
    loopback_up().context("failed to bring up loopback")?;
    env::set_var("PATH", "/data");
    console::setup(cleanup).context("failed to set up console ports")?;
    exec_main()
}

/// Execute `/main` with our own arguments (the kernel passes everything
/// after `--` on its command line through to init).
fn exec_main() -> Result<i32> {
    let args: Vec<String> = env::args().skip(1).collect();
    debug!("executing /main {args:?}");
    let status = Command::new("/main")
        .args(&args)
        .status()
        .context("failed to execute /main")?;
    Ok(exit_code(status))
}

/// Shell conventions: 128+n for a signal death.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn create_dev_symlinks() {
    for (target, link) in [
        ("/proc/kcore", "/dev/core"),
        ("/proc/self/fd", "/dev/fd"),
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
        ("rtc0", "/dev/rtc"),
    ] {
        if let Err(err) = symlink(target, link) {
            if err.kind() != io::ErrorKind::AlreadyExists {
                warn!("failed to link {link} -> {target}: {err}");
            }
        }
    }
}

/// SIOCSIFFLAGS with IFF_UP on an AF_INET datagram socket.
fn loopback_up() -> Result<()> {
    let errno = |what: &'static str| {
        Err::<(), _>(io::Error::last_os_error()).context(what)
    };

    let socket = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if socket < 0 {
        errno("socket")?;
    }
    let socket = scopeguard::guard(socket, |fd| {
        unsafe { libc::close(fd) };
    });

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(b"lo\0") {
        *dst = *src as libc::c_char;
    }

    if unsafe { libc::ioctl(*socket, libc::SIOCGIFFLAGS as _, &mut req) } < 0 {
        errno("SIOCGIFFLAGS")?;
    }
    unsafe {
        req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
    }
    if unsafe { libc::ioctl(*socket, libc::SIOCSIFFLAGS as _, &req) } < 0 {
        errno("SIOCSIFFLAGS")?;
    }
    Ok(())
}
