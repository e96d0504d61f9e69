use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use goblin::elf::Elf;
use log::debug;
use thiserror::Error;

use crate::arch::Arch;

// e_ident[EI_OSABI] values we accept. goblin does not export these by name.
const EI_OSABI: usize = 7;
const ELFOSABI_NONE: u8 = 0;
const ELFOSABI_LINUX: u8 = 3;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Errors raised while inspecting guest executables.
#[derive(Debug, Error)]
pub enum ElfError {
    /// The file could not be read.
    #[error("failed to read {path}: {err}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        err: io::Error,
    },
    /// The file is not a well-formed ELF object.
    #[error("{path} is not a valid ELF file: {reason}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },
    /// The OS/ABI field is neither NONE nor LINUX.
    #[error("{path} has unsupported ELF OS/ABI {osabi:#x}")]
    OsAbi {
        /// Offending path.
        path: PathBuf,
        /// Raw e_ident[EI_OSABI] value.
        osabi: u8,
    },
    /// The machine field does not belong to the requested architecture.
    #[error("{path} (ELF machine {machine:#x}) does not match architecture {arch}")]
    ArchMismatch {
        /// Offending path.
        path: PathBuf,
        /// Raw e_machine value.
        machine: u16,
        /// Architecture that was requested.
        arch: Arch,
    },
    /// The program interpreter could not report the dependency list.
    #[error("failed to resolve shared objects of {path} via {interp}: {reason}")]
    Resolve {
        /// Binary being resolved.
        path: PathBuf,
        /// Interpreter that was invoked.
        interp: PathBuf,
        /// What went wrong.
        reason: String,
    },
}

fn read(path: &Path) -> Result<Vec<u8>, ElfError> {
    fs::read(path).map_err(|err| ElfError::Io {
        path: path.to_owned(),
        err,
    })
}

fn parse<'a>(path: &Path, data: &'a [u8]) -> Result<Elf<'a>, ElfError> {
    Elf::parse(data).map_err(|err| ElfError::Parse {
        path: path.to_owned(),
        reason: err.to_string(),
    })
}

/// Whether the file starts with the ELF magic.
///
/// Used by callers that must tolerate non-ELF inputs (shell scripts under
/// `/data`, for example) before asking for a dependency closure.
pub fn is_elf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match fs::File::open(path).and_then(|mut f| io::Read::read_exact(&mut f, &mut magic)) {
        Ok(()) => &magic == ELF_MAGIC,
        Err(_) => false,
    }
}

/// Validate that `path` is a Linux ELF executable for `arch`.
pub fn validate(path: &Path, arch: Arch) -> Result<(), ElfError> {
    let data = read(path)?;
    let elf = parse(path, &data)?;

    let osabi = elf.header.e_ident[EI_OSABI];
    if osabi != ELFOSABI_NONE && osabi != ELFOSABI_LINUX {
        return Err(ElfError::OsAbi {
            path: path.to_owned(),
            osabi,
        });
    }

    if !arch.matches_elf_machine(elf.header.e_machine) {
        return Err(ElfError::ArchMismatch {
            path: path.to_owned(),
            machine: elf.header.e_machine,
            arch,
        });
    }

    Ok(())
}

/// The program interpreter (PT_INTERP) of `path`, if any.
pub fn interpreter(path: &Path) -> Result<Option<PathBuf>, ElfError> {
    let data = read(path)?;
    let elf = parse(path, &data)?;
    Ok(elf.interpreter.map(PathBuf::from))
}

/// Resolve the shared-object closure of a dynamically linked executable.
///
/// A binary without an interpreter is statically linked and yields an empty
/// closure. Otherwise the interpreter itself is asked for the dependency
/// list (`<interp> --list <binary>`) in an environment cleared down to
/// `LD_LIBRARY_PATH`, and every absolute path token that exists on disk is
/// collected. Paths are kept as reported so their parent directories remain
/// meaningful to the caller; the interpreter is part of the closure.
pub fn shared_object_closure(path: &Path) -> Result<Vec<PathBuf>, ElfError> {
    let interp = match interpreter(path)? {
        Some(interp) => interp,
        None => return Ok(Vec::new()),
    };

    let mut cmd = Command::new(&interp);
    cmd.arg("--list").arg(path).env_clear();
    if let Some(lib_path) = std::env::var_os("LD_LIBRARY_PATH") {
        cmd.env("LD_LIBRARY_PATH", lib_path);
    }

    let resolve_err = |reason: String| ElfError::Resolve {
        path: path.to_owned(),
        interp: interp.clone(),
        reason,
    };

    let output = cmd.output().map_err(|err| resolve_err(err.to_string()))?;
    if !output.status.success() {
        return Err(resolve_err(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut libs = parse_list_output(&stdout);
    if !libs.contains(&interp) {
        libs.push(interp.clone());
    }
    debug!("{} links against {} shared objects", path.display(), libs.len());

    Ok(libs)
}

/// Extract existing absolute paths from interpreter `--list` output.
///
/// Lines look like `libc.so.6 => /usr/lib/libc.so.6 (0xf000)` or
/// `/lib64/ld-linux-x86-64.so.2 (0xf000)`; the vdso has no on-disk path and
/// is skipped by the existence check.
fn parse_list_output(output: &str) -> Vec<PathBuf> {
    let mut seen = Vec::new();
    for token in output.split_whitespace() {
        if !token.starts_with('/') {
            continue;
        }
        let path = PathBuf::from(token);
        if seen.contains(&path) {
            continue;
        }
        if path.is_file() {
            seen.push(path);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn own_binary() -> PathBuf {
        std::env::current_exe().expect("current_exe")
    }

    #[test]
    fn test_validate_own_binary() {
        let arch = Arch::host().expect("host arch supported");
        validate(&own_binary(), arch).expect("own binary should validate");
    }

    #[test]
    fn test_validate_arch_mismatch() {
        let host = Arch::host().expect("host arch supported");
        let other = if host == Arch::Amd64 {
            Arch::Arm64
        } else {
            Arch::Amd64
        };
        let err = validate(&own_binary(), other).unwrap_err();
        assert!(matches!(err, ElfError::ArchMismatch { .. }), "{err}");
    }

    #[test]
    fn test_validate_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        let err = validate(file.path(), Arch::Amd64).unwrap_err();
        assert!(matches!(err, ElfError::Parse { .. }), "{err}");
        assert!(!is_elf(file.path()));
    }

    #[test]
    fn test_is_elf() {
        assert!(is_elf(&own_binary()));
        assert!(!is_elf(Path::new("/nonexistent")));
    }

    #[test]
    fn test_parse_list_output() {
        let output = "\tlinux-vdso.so.1 (0x00007fff0000)\n\
                      \tlibc.so.6 => /proc/self/exe (0x00007f00)\n\
                      \t/proc/self/exe (0x00007f11)\n";
        // /proc/self/exe doubles as a path that definitely exists
        let libs = parse_list_output(output);
        assert_eq!(libs, vec![PathBuf::from("/proc/self/exe")]);
    }

    #[test]
    fn test_parse_list_output_skips_missing() {
        let output = "\tlibmissing.so => /definitely/not/there.so (0x0)\n";
        assert!(parse_list_output(output).is_empty());
    }
}
