use std::ffi::{CString, OsStr};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use log::debug;
use nix::errno::Errno;
use nix::kmod::{finit_module, init_module, ModuleInitFlags};

// MODULE_INIT_COMPRESSED_FILE, missing from nix's bitflags
const COMPRESSED_FILE: u32 = 0x4;

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(OsStr::to_str)
}

fn is_compressed(path: &Path) -> bool {
    matches!(extension(path), Some("gz" | "xz" | "zst"))
}

/// Module files in `dir`, lexicographically sorted. The initramfs builder
/// prefixes names with a numeric index, so this is the load order the user
/// requested.
fn collect(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()))
        }
    };

    let mut modules: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    modules.sort();
    Ok(modules)
}

/// Load every module found under `dir` in name order.
pub(crate) fn load_all(dir: &Path) -> Result<()> {
    for path in collect(dir)? {
        load(&path).with_context(|| format!("failed to load module {}", path.display()))?;
    }
    Ok(())
}

fn load(path: &Path) -> Result<()> {
    let file = File::open(path)?;
    let params = CString::new("")?;
    let flags = if is_compressed(path) {
        ModuleInitFlags::from_bits_retain(COMPRESSED_FILE)
    } else {
        ModuleInitFlags::empty()
    };

    debug!("loading module {}", path.display());
    match finit_module(&file, &params, flags) {
        Ok(()) => Ok(()),
        // The kernel may lack in-kernel decompression; fall back to
        // feeding it a plain module image
        Err(Errno::EOPNOTSUPP) => load_image(path, &params),
        Err(errno) => Err(errno).context("finit_module"),
    }
}

fn load_image(path: &Path, params: &CString) -> Result<()> {
    let image = match extension(path) {
        Some("gz") => {
            let mut buf = Vec::new();
            GzDecoder::new(File::open(path)?)
                .read_to_end(&mut buf)
                .context("failed to decompress gzip module")?;
            buf
        }
        Some(ext @ ("xz" | "zst")) => {
            bail!("cannot decompress .{ext} modules without kernel support")
        }
        _ => fs::read(path)?,
    };
    init_module(&image, params).context("init_module")?;
    Ok(())
}
