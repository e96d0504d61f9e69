use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;

use crate::arch::{self, Arch};
use crate::cpio;
use crate::elf;

/// Where a regular entry's bytes come from at archive-write time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// Copy of a file on the host, read when the archive is serialized.
    Host(PathBuf),
    /// In-memory bytes, used for the embedded init program.
    Blob(&'static [u8]),
}

#[derive(Debug)]
enum Entry {
    File { source: Source },
    Dir { children: BTreeMap<String, Entry> },
    Symlink { target: String },
}

/// In-memory initramfs file tree.
///
/// Entries are uniquely named within a directory. Directory creation is
/// idempotent; creating anything else on top of an existing entry is an
/// error. Iteration (and thus archive order) is sorted.
#[derive(Debug, Default)]
pub struct Tree {
    root: BTreeMap<String, Entry>,
}

fn components(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if parts.is_empty() {
        bail!("empty initramfs path '{path}'");
    }
    if parts.iter().any(|c| *c == "..") {
        bail!("initramfs path '{path}' must not contain '..'");
    }
    Ok(parts)
}

impl Tree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    fn dir_of<'a>(map: &'a mut BTreeMap<String, Entry>, parts: &[&str]) -> Result<&'a mut BTreeMap<String, Entry>> {
        let mut cur = map;
        for part in parts {
            let entry = cur
                .entry(part.to_string())
                .or_insert_with(|| Entry::Dir {
                    children: BTreeMap::new(),
                });
            match entry {
                Entry::Dir { children } => cur = children,
                _ => bail!("'{part}' already exists and is not a directory"),
            }
        }
        Ok(cur)
    }

    /// Create a directory and any missing parents. Re-creating an existing
    /// directory is a no-op.
    pub fn mkdir_all(&mut self, path: &str) -> Result<()> {
        let parts = components(path)?;
        Self::dir_of(&mut self.root, &parts).with_context(|| format!("mkdir {path}"))?;
        Ok(())
    }

    /// Add a regular file, creating parent directories as needed.
    ///
    /// Re-adding the same path with an identical source is a no-op; any
    /// other collision is an error.
    pub fn add_file(&mut self, path: &str, source: Source) -> Result<()> {
        let parts = components(path)?;
        let (name, parents) = parts.split_last().expect("components is non-empty");
        let dir = Self::dir_of(&mut self.root, parents).with_context(|| format!("add {path}"))?;
        match dir.get(*name) {
            None => {
                dir.insert(name.to_string(), Entry::File { source });
                Ok(())
            }
            Some(Entry::File { source: existing }) if *existing == source => Ok(()),
            Some(_) => bail!("initramfs entry '{path}' already exists"),
        }
    }

    /// Add a symlink, creating parent directories as needed. Re-adding the
    /// same link with an identical target is a no-op.
    pub fn add_symlink(&mut self, path: &str, target: &str) -> Result<()> {
        let parts = components(path)?;
        let (name, parents) = parts.split_last().expect("components is non-empty");
        let dir = Self::dir_of(&mut self.root, parents).with_context(|| format!("link {path}"))?;
        match dir.get(*name) {
            None => {
                dir.insert(
                    name.to_string(),
                    Entry::Symlink {
                        target: target.to_string(),
                    },
                );
                Ok(())
            }
            Some(Entry::Symlink { target: existing }) if existing == target => Ok(()),
            Some(_) => bail!("initramfs entry '{path}' already exists"),
        }
    }

    /// Host paths backing the regular entries currently in the tree.
    fn host_sources(&self) -> Vec<PathBuf> {
        fn walk(map: &BTreeMap<String, Entry>, out: &mut Vec<PathBuf>) {
            for entry in map.values() {
                match entry {
                    Entry::File {
                        source: Source::Host(path),
                    } => out.push(path.clone()),
                    Entry::Dir { children } => walk(children, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    fn serialize<W: Write>(&self, out: W) -> Result<W> {
        fn write_dir<W: Write>(
            w: &mut cpio::Writer<W>,
            prefix: &str,
            map: &BTreeMap<String, Entry>,
        ) -> Result<()> {
            for (name, entry) in map {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                match entry {
                    Entry::Dir { children } => {
                        w.directory(&path, 0o755)?;
                        write_dir(w, &path, children)?;
                    }
                    Entry::Symlink { target } => w.symlink(&path, target)?,
                    Entry::File { source } => {
                        let data = match source {
                            Source::Blob(blob) => blob.to_vec(),
                            Source::Host(host) => {
                                let meta = fs::metadata(host).with_context(|| {
                                    format!("missing initramfs source {}", host.display())
                                })?;
                                if !meta.is_file() {
                                    bail!("initramfs source {} is not a regular file", host.display());
                                }
                                fs::read(host)
                                    .with_context(|| format!("read {}", host.display()))?
                            }
                        };
                        w.file(&path, 0o755, &data)?;
                    }
                }
            }
            Ok(())
        }

        let mut writer = cpio::Writer::new(out);
        write_dir(&mut writer, "", &self.root)?;
        Ok(writer.finish()?)
    }
}

fn basename(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?
        .to_string_lossy()
        .into_owned())
}

/// Assembles and serializes the guest root filesystem.
pub struct Builder {
    arch: Arch,
    binary: PathBuf,
    standalone: bool,
    files: Vec<PathBuf>,
    modules: Vec<PathBuf>,
}

impl Builder {
    /// Start a wrapped-mode builder for `binary`.
    pub fn new<P: Into<PathBuf>>(arch: Arch, binary: P) -> Self {
        Self {
            arch,
            binary: binary.into(),
            standalone: false,
            files: Vec::new(),
            modules: Vec::new(),
        }
    }

    /// Place the binary itself at `/init` instead of wrapping it.
    pub fn standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    /// Include files under `/data/<basename>`.
    pub fn add_files<I: IntoIterator<Item = PathBuf>>(mut self, files: I) -> Self {
        self.files.extend(files);
        self
    }

    /// Include kernel modules under `/lib/modules/<NNNN>-<basename>`; the
    /// numeric prefix fixes load order.
    pub fn add_modules<I: IntoIterator<Item = PathBuf>>(mut self, modules: I) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Build the tree, resolve shared objects, and write the archive into
    /// the system temporary directory.
    ///
    /// The caller owns the returned path and is expected to remove it.
    pub fn build(self) -> Result<PathBuf> {
        let mut tree = self.populate()?;
        self.resolve_libraries(&mut tree)?;

        let tmp = tempfile::Builder::new()
            .prefix("virtrun-initramfs-")
            .suffix(".img")
            .tempfile()
            .context("failed to create initramfs file")?;

        tree.serialize(BufWriter::new(tmp.as_file()))
            .context("failed to write initramfs archive")?;

        let path = tmp
            .into_temp_path()
            .keep()
            .context("failed to persist initramfs file")?;
        debug!("initramfs written to {}", path.display());

        Ok(path)
    }

    fn populate(&self) -> Result<Tree> {
        let mut tree = Tree::new();

        if self.standalone {
            tree.add_file("init", Source::Host(self.binary.clone()))?;
        } else {
            let blob = self
                .arch
                .init_blob()
                .ok_or_else(|| arch::missing_init_blob(self.arch))?;
            tree.add_file("init", Source::Blob(blob))?;
            tree.add_file("main", Source::Host(self.binary.clone()))?;
        }

        for file in &self.files {
            let name = basename(file)?;
            tree.add_file(&format!("data/{name}"), Source::Host(file.clone()))?;
        }

        for (idx, module) in self.modules.iter().enumerate() {
            let name = basename(module)?;
            tree.add_file(
                &format!("lib/modules/{idx:04}-{name}"),
                Source::Host(module.clone()),
            )?;
        }

        Ok(tree)
    }

    /// Pull the shared-object closure of every ELF entry into `/lib` and
    /// alias each source directory onto it so the guest's dynamic linker
    /// finds the libraries along its usual search paths.
    fn resolve_libraries(&self, tree: &mut Tree) -> Result<()> {
        let mut libs: Vec<PathBuf> = Vec::new();
        for source in tree.host_sources() {
            if !elf::is_elf(&source) {
                continue;
            }
            for lib in elf::shared_object_closure(&source)? {
                if !libs.contains(&lib) {
                    libs.push(lib);
                }
            }
        }
        if libs.is_empty() {
            return Ok(());
        }

        tree.mkdir_all("lib")?;
        let mut dirs: Vec<PathBuf> = Vec::new();
        for lib in &libs {
            let name = basename(lib)?;
            tree.add_file(&format!("lib/{name}"), Source::Host(lib.clone()))
                .with_context(|| format!("conflicting library name {name}"))?;
            if let Some(dir) = lib.parent() {
                if !dirs.contains(&dir.to_path_buf()) {
                    dirs.push(dir.to_path_buf());
                }
            }
        }

        // Shallower directories first so /usr/lib is attempted before
        // /usr/lib/foo; later collisions resolve idempotently.
        dirs.sort();
        for dir in dirs {
            let site = dir.to_string_lossy().trim_matches('/').to_string();
            if site == "lib" || site.is_empty() {
                continue;
            }
            if let Err(err) = tree.add_symlink(&site, "/lib") {
                debug!("skipping library path alias {site}: {err:#}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::reader::{parse, Kind};
    use std::io::Write as _;

    fn temp_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn test_mkdir_idempotent() {
        let mut tree = Tree::new();
        tree.mkdir_all("a/b/c").unwrap();
        tree.mkdir_all("a/b/c").unwrap();
        tree.mkdir_all("a/b").unwrap();
    }

    #[test]
    fn test_file_collision() {
        let mut tree = Tree::new();
        tree.add_file("data/x", Source::Host("/tmp/x".into())).unwrap();
        // identical re-add is a no-op
        tree.add_file("data/x", Source::Host("/tmp/x".into())).unwrap();
        // different source is a collision
        assert!(tree.add_file("data/x", Source::Host("/tmp/y".into())).is_err());
        // so is a directory on top of a file
        assert!(tree.mkdir_all("data/x/sub").is_err());
    }

    #[test]
    fn test_symlink_idempotent() {
        let mut tree = Tree::new();
        tree.add_symlink("usr/lib", "/lib").unwrap();
        tree.add_symlink("usr/lib", "/lib").unwrap();
        assert!(tree.add_symlink("usr/lib", "/other").is_err());
    }

    #[test]
    fn test_rejects_traversal() {
        let mut tree = Tree::new();
        assert!(tree.mkdir_all("../escape").is_err());
        assert!(tree.add_file("", Source::Blob(b"")).is_err());
    }

    #[test]
    fn test_standalone_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let binary = temp_file(dir.path(), "prog", b"#!/bin/sh\nexit 0\n");
        let data = temp_file(dir.path(), "table.txt", b"1 2 3");
        let module = temp_file(dir.path(), "veth.ko", b"module bytes");

        let path = Builder::new(Arch::Amd64, &binary)
            .standalone(true)
            .add_files(vec![data])
            .add_modules(vec![module])
            .build()
            .unwrap();

        let archive = fs::read(&path).unwrap();
        fs::remove_file(&path).unwrap();
        let entries = parse(&archive).unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "data",
                "data/table.txt",
                "init",
                "lib",
                "lib/modules",
                "lib/modules/0000-veth.ko",
            ]
        );

        let init = entries.iter().find(|e| e.name == "init").unwrap();
        assert_eq!(init.kind, Kind::File);
        assert_eq!(init.mode & 0o111, 0o111, "init must be executable");
        assert_eq!(init.data, b"#!/bin/sh\nexit 0\n");

        let module = entries.iter().find(|e| e.name.starts_with("lib/modules/")).unwrap();
        assert_eq!(module.data, b"module bytes");
    }

    #[test]
    fn test_module_order_is_add_order() {
        let dir = tempfile::tempdir().unwrap();
        let binary = temp_file(dir.path(), "prog", b"x");
        let zeta = temp_file(dir.path(), "zeta.ko", b"z");
        let alpha = temp_file(dir.path(), "alpha.ko", b"a");

        let path = Builder::new(Arch::Amd64, &binary)
            .standalone(true)
            .add_modules(vec![zeta, alpha])
            .build()
            .unwrap();

        let archive = fs::read(&path).unwrap();
        fs::remove_file(&path).unwrap();
        let entries = parse(&archive).unwrap();
        let modules: Vec<&str> = entries
            .iter()
            .filter(|e| e.kind == Kind::File && e.name.starts_with("lib/modules/"))
            .map(|e| e.name.as_str())
            .collect();
        // zeta was added first, so it keeps the lower load-order prefix
        assert_eq!(modules, vec!["lib/modules/0000-zeta.ko", "lib/modules/0001-alpha.ko"]);
    }

    #[test]
    fn test_wrapped_requires_init_blob() {
        // Test builds carry no embedded init, so wrapped mode must point
        // the user at the blob location.
        if Arch::Amd64.init_blob().is_some() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let binary = temp_file(dir.path(), "prog", b"x");
        let err = Builder::new(Arch::Amd64, &binary).build().unwrap_err();
        assert!(err.to_string().contains("virtrun-init"), "{err:#}");
    }

    #[test]
    fn test_missing_source_fails_at_write() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("never-created");
        let err = Builder::new(Arch::Amd64, &binary)
            .standalone(true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("initramfs"), "{err:#}");
    }
}
