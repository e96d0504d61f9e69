//! newc ("070701") CPIO archive emission.
//!
//! The kernel unpacks the initramfs from this format at boot. Records are
//! written in the order the caller supplies them; inodes are assigned
//! monotonically and mtime is pinned to zero so archives are reproducible.

use std::io::{self, Write};

const MAGIC: &[u8; 6] = b"070701";
const TRAILER: &str = "TRAILER!!!";

const MODE_FILE: u32 = 0o100000;
const MODE_DIR: u32 = 0o040000;
const MODE_SYMLINK: u32 = 0o120000;

/// Streaming newc archive writer.
pub(crate) struct Writer<W: Write> {
    out: W,
    ino: u32,
}

impl<W: Write> Writer<W> {
    pub(crate) fn new(out: W) -> Self {
        Self { out, ino: 0 }
    }

    /// Append a regular file entry. `/init` and friends rely on the exec
    /// bits, so the full permission set is the caller's to choose.
    pub(crate) fn file(&mut self, name: &str, perm: u32, data: &[u8]) -> io::Result<()> {
        self.header(name, MODE_FILE | perm, 1, data.len() as u32)?;
        self.out.write_all(data)?;
        self.pad(data.len())
    }

    /// Append a directory entry.
    pub(crate) fn directory(&mut self, name: &str, perm: u32) -> io::Result<()> {
        self.header(name, MODE_DIR | perm, 2, 0)
    }

    /// Append a symlink entry; the target string is the record content.
    pub(crate) fn symlink(&mut self, name: &str, target: &str) -> io::Result<()> {
        self.header(name, MODE_SYMLINK | 0o777, 1, target.len() as u32)?;
        self.out.write_all(target.as_bytes())?;
        self.pad(target.len())
    }

    /// Write the trailer record and flush, returning the inner writer.
    pub(crate) fn finish(mut self) -> io::Result<W> {
        self.ino = 0;
        self.raw_header(TRAILER, 0, 1, 0)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn header(&mut self, name: &str, mode: u32, nlink: u32, filesize: u32) -> io::Result<()> {
        self.ino += 1;
        self.raw_header(name, mode, nlink, filesize)
    }

    fn raw_header(&mut self, name: &str, mode: u32, nlink: u32, filesize: u32) -> io::Result<()> {
        // 6-byte magic, then 13 8-digit hex fields: ino, mode, uid, gid,
        // nlink, mtime, filesize, devmajor, devminor, rdevmajor, rdevminor,
        // namesize (terminator included), check.
        write!(
            self.out,
            "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            self.ino,
            mode,
            0,
            0,
            nlink,
            0,
            filesize,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0,
        )?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&[0])?;
        self.pad(110 + name.len() + 1)
    }

    fn pad(&mut self, written: usize) -> io::Result<()> {
        let rem = written % 4;
        if rem != 0 {
            self.out.write_all(&[0u8; 3][..4 - rem])?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod reader {
    //! Minimal newc parser, enough to prove archives round-trip.

    use super::{MAGIC, MODE_DIR, MODE_FILE, MODE_SYMLINK, TRAILER};
    use anyhow::{bail, Context, Result};

    /// A parsed archive entry.
    #[derive(Debug, PartialEq, Eq)]
    pub(crate) enum Kind {
        File,
        Dir,
        Symlink,
    }

    #[derive(Debug)]
    pub(crate) struct Entry {
        pub(crate) name: String,
        pub(crate) kind: Kind,
        pub(crate) mode: u32,
        pub(crate) ino: u32,
        pub(crate) data: Vec<u8>,
    }

    fn hex(data: &[u8], field: usize) -> Result<u32> {
        let start = 6 + field * 8;
        let raw = std::str::from_utf8(&data[start..start + 8]).context("non-ascii header")?;
        u32::from_str_radix(raw, 16).context("bad hex field")
    }

    fn align4(n: usize) -> usize {
        (n + 3) & !3
    }

    pub(crate) fn parse(data: &[u8]) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut off = 0;
        loop {
            let header = data.get(off..off + 110).context("truncated header")?;
            if &header[..6] != MAGIC {
                bail!("bad magic at offset {off}");
            }
            let ino = hex(header, 0)?;
            let mode = hex(header, 1)?;
            let filesize = hex(header, 6)? as usize;
            let namesize = hex(header, 11)? as usize;

            let name_start = off + 110;
            let name_bytes = data
                .get(name_start..name_start + namesize - 1)
                .context("truncated name")?;
            let name = std::str::from_utf8(name_bytes)?.to_owned();

            let data_start = align4(name_start + namesize);
            if name == TRAILER {
                return Ok(entries);
            }
            let content = data
                .get(data_start..data_start + filesize)
                .context("truncated content")?
                .to_vec();
            off = align4(data_start + filesize);

            let kind = match mode & 0o170000 {
                MODE_FILE => Kind::File,
                MODE_DIR => Kind::Dir,
                MODE_SYMLINK => Kind::Symlink,
                other => bail!("unexpected file type {other:#o} for {name}"),
            };
            entries.push(Entry {
                name,
                kind,
                mode,
                ino,
                data: content,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reader::{parse, Kind};
    use super::*;

    fn archive(build: impl FnOnce(&mut Writer<Vec<u8>>)) -> Vec<u8> {
        let mut w = Writer::new(Vec::new());
        build(&mut w);
        w.finish().unwrap()
    }

    #[test]
    fn test_single_file_header_layout() {
        let data = archive(|w| w.file("init", 0o755, b"ELF!").unwrap());

        // magic + ino 1 + regular mode 0100755
        assert_eq!(&data[..6], b"070701");
        assert_eq!(&data[6..14], b"00000001");
        assert_eq!(&data[14..22], b"000081ED");
        // namesize of "init" including terminator
        assert_eq!(&data[94..102], b"00000005");
        // name starts right after the 110-byte header
        assert_eq!(&data[110..114], b"init");
        assert_eq!(data[114], 0);
    }

    #[test]
    fn test_archive_is_word_aligned() {
        for name in ["a", "ab", "abc", "abcd"] {
            for payload in [&b""[..], b"x", b"xy", b"xyz", b"wxyz"] {
                let data = archive(|w| w.file(name, 0o644, payload).unwrap());
                assert_eq!(data.len() % 4, 0, "name={name} len={}", payload.len());
            }
        }
    }

    #[test]
    fn test_trailer_terminates() {
        let data = archive(|_| {});
        let entries = parse(&data).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let data = archive(|w| {
            w.directory("data", 0o755).unwrap();
            w.file("data/payload", 0o755, b"hello world").unwrap();
            w.symlink("usr", "/lib").unwrap();
        });

        let entries = parse(&data).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "data");
        assert_eq!(entries[0].kind, Kind::Dir);

        assert_eq!(entries[1].name, "data/payload");
        assert_eq!(entries[1].kind, Kind::File);
        assert_eq!(entries[1].data, b"hello world");
        assert_eq!(entries[1].mode & 0o777, 0o755);

        assert_eq!(entries[2].name, "usr");
        assert_eq!(entries[2].kind, Kind::Symlink);
        assert_eq!(entries[2].data, b"/lib");
    }

    #[test]
    fn test_inodes_increase() {
        let data = archive(|w| {
            w.file("a", 0o755, b"").unwrap();
            w.file("b", 0o755, b"").unwrap();
            w.file("c", 0o755, b"").unwrap();
        });
        let inos: Vec<u32> = parse(&data).unwrap().iter().map(|e| e.ino).collect();
        assert_eq!(inos, vec![1, 2, 3]);
    }
}
