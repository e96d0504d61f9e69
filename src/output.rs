use std::io::{self, Write};

use regex::Regex;

/// Identifier prefixing the guest's exit-code sentinel line.
///
/// The guest init prints `SYSINIT_EXIT_CODE: <code>` as its last line on the
/// default console; host and guest must agree on this constant.
pub const EXIT_CODE_ID: &str = "SYSINIT_EXIT_CODE";

/// Pluggable scanner recovering the guest exit code from a console line.
pub type ExitCodeParser = Box<dyn Fn(&str) -> Option<i32> + Send>;

/// The default exit-code parser: [`EXIT_CODE_ID`] followed by `: ` and a
/// signed integer, anywhere after the start of the line.
pub fn default_exit_code_parser() -> ExitCodeParser {
    Box::new(|line| {
        let idx = line.find(EXIT_CODE_ID)?;
        let rest = line[idx + EXIT_CODE_ID.len()..].strip_prefix(": ")?;
        rest.trim().parse().ok()
    })
}

/// What the default console revealed about the guest, evaluated at EOF.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The sentinel reported exit code zero.
    Success,
    /// The sentinel reported a nonzero exit code.
    NonZeroExit(i32),
    /// The kernel logged a panic before any sentinel was seen.
    Panic,
    /// The kernel logged an OOM kill before any sentinel was seen.
    Oom,
    /// The stream ended without a sentinel.
    NoExitCode,
}

enum Fatal {
    Panic,
    Oom,
}

/// Line scanner for the guest's default console (kernel log plus sentinel).
///
/// Lines pass through to the sink until an exit code has been captured;
/// after that they are suppressed unless verbose is set.
pub struct StdoutParser {
    panic_re: Regex,
    oom_re: Regex,
    exit_code_parser: ExitCodeParser,
    verbose: bool,
    exit_code: Option<i32>,
    fatal: Option<Fatal>,
}

impl StdoutParser {
    /// Create a parser using the default sentinel format.
    pub fn new(verbose: bool) -> Self {
        Self::with_exit_code_parser(verbose, default_exit_code_parser())
    }

    /// Create a parser with a custom exit-code scanner.
    pub fn with_exit_code_parser(verbose: bool, exit_code_parser: ExitCodeParser) -> Self {
        // Fixed patterns, only trivial bugs possible
        let panic_re = Regex::new(r"^\[[0-9. ]+\] Kernel panic - not syncing: ").unwrap();
        let oom_re = Regex::new(r"^\[[0-9. ]+\] Out of memory: ").unwrap();
        Self {
            panic_re,
            oom_re,
            exit_code_parser,
            verbose,
            exit_code: None,
            fatal: None,
        }
    }

    /// Scan one line, forwarding it to `sink` according to the suppression
    /// rules.
    pub fn scan_line<W: Write>(&mut self, line: &str, sink: &mut W) -> io::Result<()> {
        let suppress = self.exit_code.is_some() && !self.verbose;

        if self.exit_code.is_none() && self.fatal.is_none() {
            if self.panic_re.is_match(line) {
                self.fatal = Some(Fatal::Panic);
            } else if self.oom_re.is_match(line) {
                self.fatal = Some(Fatal::Oom);
            }
        }

        if self.exit_code.is_none() {
            self.exit_code = (self.exit_code_parser)(line);
        }

        if !suppress {
            sink.write_all(line.as_bytes())?;
            sink.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Whether a sentinel has been captured so far.
    pub fn found_exit_code(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Evaluate the stream after EOF.
    pub fn finish(self) -> Verdict {
        match (self.exit_code, self.fatal) {
            (Some(0), _) => Verdict::Success,
            (Some(code), _) => Verdict::NonZeroExit(code),
            (None, Some(Fatal::Panic)) => Verdict::Panic,
            (None, Some(Fatal::Oom)) => Verdict::Oom,
            (None, None) => Verdict::NoExitCode,
        }
    }
}
