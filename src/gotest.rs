//! Rewrites `go test` file-output flags so profile data crosses the
//! host-guest boundary through additional consoles.
//!
//! A test binary invoked as `go test -exec virtrun -coverprofile=cover.out`
//! would otherwise write into a path that only exists on the host. The
//! rewriter points such flags at the guest path of a fresh console and
//! records the host file the driver should decode the stream into.

use std::path::{Path, PathBuf};

use log::debug;

/// First console index available to rewritten flags; 0 is the kernel
/// console and 1 the guest's logical stdout.
const FIRST_FREE_CONSOLE: usize = 2;

/// Flags whose relative values are anchored at `-test.outputdir` before
/// being redirected, mirroring what `go test` itself does.
const PROFILE_FLAGS: &[&str] = &[
    "test.blockprofile",
    "test.cpuprofile",
    "test.memprofile",
    "test.mutexprofile",
    "test.trace",
];

/// Outcome of a rewrite pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Rewrite {
    /// The argument list to hand to the guest binary.
    pub args: Vec<String>,
    /// Host files to capture, one per appended console, in console order
    /// starting at index 2.
    pub output_files: Vec<PathBuf>,
}

fn split_flag(arg: &str) -> Option<(&str, &str)> {
    let rest = arg.strip_prefix('-')?;
    let (key, value) = rest.split_once('=')?;
    Some((key, value))
}

/// The guest device path for console `n`.
pub fn guest_console_path(n: usize) -> String {
    format!("/dev/virtrun{n}")
}

/// Substitute file-output flags in a `go test` argument list.
///
/// First pass captures `-test.outputdir` and forces directory flags to
/// `/tmp`; second pass redirects each profile path onto the next free
/// console and records the host destination.
pub fn rewrite_go_test_flags(args: &[String]) -> Rewrite {
    let mut outputdir: Option<PathBuf> = None;

    let first_pass: Vec<String> = args
        .iter()
        .map(|arg| match split_flag(arg) {
            Some(("test.outputdir", value)) => {
                outputdir = Some(PathBuf::from(value));
                "-test.outputdir=/tmp".to_string()
            }
            Some(("test.gocoverdir", _)) => "-test.gocoverdir=/tmp".to_string(),
            _ => arg.clone(),
        })
        .collect();

    let mut output_files = Vec::new();
    let args = first_pass
        .into_iter()
        .map(|arg| {
            let (key, value) = match split_flag(&arg) {
                Some(pair) => pair,
                None => return arg,
            };

            let host_path = if key == "test.coverprofile" {
                PathBuf::from(value)
            } else if PROFILE_FLAGS.contains(&key) {
                let value = Path::new(value);
                if value.is_relative() {
                    outputdir
                        .as_deref()
                        .unwrap_or_else(|| Path::new(""))
                        .join(value)
                } else {
                    value.to_path_buf()
                }
            } else {
                return arg;
            };

            let console = FIRST_FREE_CONSOLE + output_files.len();
            let guest_path = guest_console_path(console);
            debug!(
                "rewriting -{key}={value} to {guest_path}, capturing {}",
                host_path.display()
            );
            output_files.push(host_path);
            format!("-{key}={guest_path}")
        })
        .collect();

    Rewrite { args, output_files }
}
