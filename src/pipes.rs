use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use thiserror::Error;

/// Errors raised by the pipe hub.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// A pipe that was expected to carry data stayed silent. Usually the
    /// transport does not match the guest kernel or `/dev` never appeared.
    #[error("no output received on console '{console}'")]
    NoOutput {
        /// Pipe name.
        console: String,
    },
    /// Decoding or writing the stream failed mid-flight.
    #[error("console '{console}' stream failed: {err}")]
    Stream {
        /// Pipe name.
        console: String,
        /// Underlying error.
        #[source]
        err: io::Error,
    },
    /// The OS pipe could not be created.
    #[error("failed to create console pipe: {0}")]
    Create(#[source] io::Error),
}

/// Host-side destination for decoded console bytes.
pub enum Sink {
    /// The process's standard output.
    Stdout,
    /// The process's standard error.
    Stderr,
    /// An open file, typically the target of a rewritten go-test flag.
    File(File),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout => io::stdout().write(buf),
            Sink::Stderr => io::stderr().write(buf),
            Sink::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout => io::stdout().flush(),
            Sink::Stderr => io::stderr().flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

/// How a worker copies guest bytes into its sink.
///
/// Both modes consume the newline-framed base64 stream produced by the
/// guest-side encoders; `DecodeLines` additionally flushes after every
/// frame so interactive output shows up promptly.
#[derive(Clone, Copy, Debug)]
pub enum CopyMode {
    /// Frame-by-frame decode with a flush per frame (guest stdout).
    DecodeLines,
    /// Streaming decode (additional console files).
    Decode,
}

struct PipeState {
    name: String,
    may_be_silent: bool,
    bytes: Arc<AtomicU64>,
}

/// Owns the OS pipes carrying guest console streams and the workers
/// draining them.
///
/// Writer ends exist only to be inherited by the QEMU child; the driver
/// closes them once QEMU exits, upon which the workers observe EOF and
/// finish within the grace period.
pub struct Hub {
    pipes: Vec<PipeState>,
    writers: Vec<OwnedFd>,
    done_tx: Sender<(usize, io::Result<()>)>,
    done_rx: Receiver<(usize, io::Result<()>)>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Self {
        let (done_tx, done_rx) = channel();
        Self {
            pipes: Vec::new(),
            writers: Vec::new(),
            done_tx,
            done_rx,
        }
    }

    /// Create a pipe and start its worker.
    ///
    /// Pipes are numbered in the order they are added; the driver maps the
    /// n-th writer end onto inherited file descriptor `3 + n`.
    pub fn add(
        &mut self,
        name: &str,
        mode: CopyMode,
        sink: Sink,
        may_be_silent: bool,
    ) -> Result<(), ConsoleError> {
        let (reader, writer) =
            pipe2(OFlag::O_CLOEXEC).map_err(|err| ConsoleError::Create(err.into()))?;

        let bytes = Arc::new(AtomicU64::new(0));
        let idx = self.pipes.len();
        let tx = self.done_tx.clone();
        let worker_bytes = Arc::clone(&bytes);
        thread::spawn(move || {
            let result = copy_stream(File::from(reader), mode, sink, &worker_bytes);
            let _ = tx.send((idx, result));
        });

        self.pipes.push(PipeState {
            name: name.to_string(),
            may_be_silent,
            bytes,
        });
        self.writers.push(writer);
        Ok(())
    }

    /// Raw writer file descriptors, in pipe order, for the child to inherit.
    pub fn writer_fds(&self) -> Vec<RawFd> {
        self.writers.iter().map(|fd| fd.as_raw_fd()).collect()
    }

    /// Close the parent's writer ends so workers can observe EOF.
    pub fn close_writers(&mut self) {
        self.writers.clear();
    }

    /// Wait up to `grace` for all workers, then evaluate the pipes.
    ///
    /// Reports the first stream error, or `NoOutput` for a pipe that was
    /// not allowed to stay silent but produced zero bytes.
    pub fn wait(mut self, grace: Duration) -> Result<(), ConsoleError> {
        self.close_writers();

        let deadline = Instant::now() + grace;
        let mut results: Vec<Option<io::Result<()>>> = Vec::new();
        results.resize_with(self.pipes.len(), || None);

        let mut remaining = self.pipes.len();
        while remaining > 0 {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(timeout) {
                Ok((idx, result)) => {
                    results[idx] = Some(result);
                    remaining -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!("{remaining} console worker(s) still running after grace period");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for (state, result) in self.pipes.into_iter().zip(results) {
            if let Some(Err(err)) = result {
                return Err(ConsoleError::Stream {
                    console: state.name,
                    err,
                });
            }
            if !state.may_be_silent && state.bytes.load(Ordering::Relaxed) == 0 {
                return Err(ConsoleError::NoOutput {
                    console: state.name,
                });
            }
        }
        Ok(())
    }
}

fn copy_stream(
    reader: File,
    mode: CopyMode,
    mut sink: Sink,
    bytes: &AtomicU64,
) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();
    loop {
        frame.clear();
        let n = reader.read_until(b'\n', &mut frame)?;
        if n == 0 {
            break;
        }
        bytes.fetch_add(n as u64, Ordering::Relaxed);

        while frame.last() == Some(&b'\n') || frame.last() == Some(&b'\r') {
            frame.pop();
        }
        if frame.is_empty() {
            continue;
        }

        let decoded = BASE64.decode(&frame).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid base64 frame: {err}"),
            )
        })?;
        sink.write_all(&decoded)?;
        if matches!(mode, CopyMode::DecodeLines) {
            sink.flush()?;
        }
    }
    sink.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;

    fn file_sink() -> (Sink, tempfile::TempPath) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.into_temp_path();
        let sink = Sink::File(File::create(&path).unwrap());
        (sink, path)
    }

    fn take_writer(hub: &mut Hub) -> File {
        File::from(hub.writers.remove(0))
    }

    #[test]
    fn test_base64_round_trip() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let (sink, path) = file_sink();

        let mut hub = Hub::new();
        hub.add("file:cover.out", CopyMode::Decode, sink, false).unwrap();

        let mut writer = take_writer(&mut hub);
        for chunk in payload.chunks(300) {
            writeln!(writer, "{}", BASE64.encode(chunk)).unwrap();
        }
        drop(writer);

        hub.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), payload);
    }

    #[test]
    fn test_decode_lines_round_trip() {
        let (sink, path) = file_sink();

        let mut hub = Hub::new();
        hub.add("stdout", CopyMode::DecodeLines, sink, true).unwrap();

        let mut writer = take_writer(&mut hub);
        writeln!(writer, "{}", BASE64.encode("hello ")).unwrap();
        writeln!(writer, "{}", BASE64.encode("world\n")).unwrap();
        drop(writer);

        hub.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello world\n");
    }

    #[test]
    fn test_silent_pipe_reported() {
        let (sink, _path) = file_sink();
        let mut hub = Hub::new();
        hub.add("file:cover.out", CopyMode::Decode, sink, false).unwrap();

        let err = hub.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConsoleError::NoOutput { console } if console == "file:cover.out"));
    }

    #[test]
    fn test_silent_pipe_tolerated() {
        let (sink, _path) = file_sink();
        let mut hub = Hub::new();
        hub.add("stdout", CopyMode::DecodeLines, sink, true).unwrap();
        hub.wait(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_bad_frame_is_stream_error() {
        let (sink, _path) = file_sink();
        let mut hub = Hub::new();
        hub.add("stdout", CopyMode::DecodeLines, sink, true).unwrap();

        let mut writer = take_writer(&mut hub);
        writeln!(writer, "!!! definitely not base64 !!!").unwrap();
        drop(writer);

        let err = hub.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConsoleError::Stream { .. }), "{err}");
    }

    #[test]
    fn test_blank_frames_are_skipped() {
        let (sink, path) = file_sink();
        let mut hub = Hub::new();
        hub.add("stdout", CopyMode::DecodeLines, sink, true).unwrap();

        let mut writer = take_writer(&mut hub);
        writeln!(writer).unwrap();
        writeln!(writer, "{}\r", BASE64.encode("x")).unwrap();
        drop(writer);

        hub.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x");
    }
}
