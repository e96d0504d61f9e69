use std::ffi::OsString;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// QEMU console device family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Legacy ISA serial ports (`ttyS*` in the guest).
    Isa,
    /// virtio-serial over PCI (`hvc*` in the guest).
    Pci,
    /// virtio-serial over MMIO (`hvc*` in the guest).
    Mmio,
}

impl Transport {
    /// The guest device node the kernel uses for console `n`.
    pub fn console_device(self, n: usize) -> String {
        match self {
            Transport::Isa => format!("ttyS{n}"),
            Transport::Pci | Transport::Mmio => format!("hvc{n}"),
        }
    }

    /// The one-time serial bus device required before any virtio console,
    /// if the transport needs one.
    pub(crate) fn serial_bus(self) -> Option<&'static str> {
        match self {
            Transport::Isa => None,
            Transport::Pci => Some("virtio-serial-pci,max_ports=8"),
            Transport::Mmio => Some("virtio-serial-device,max_ports=8"),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Isa => "isa",
            Transport::Pci => "pci",
            Transport::Mmio => "mmio",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isa" => Ok(Transport::Isa),
            "pci" => Ok(Transport::Pci),
            "mmio" => Ok(Transport::Mmio),
            other => Err(anyhow::anyhow!(
                "unknown transport '{other}' (expected isa, pci or mmio)"
            )),
        }
    }
}

/// Errors detected while compiling an argument list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    /// A unique-named argument appeared twice.
    #[error("duplicate qemu argument -{0}")]
    DuplicateName(String),
    /// Two repeatable entries were fully identical.
    #[error("duplicate qemu argument -{name} {value}")]
    DuplicateEntry {
        /// Argument name.
        name: String,
        /// Repeated value.
        value: String,
    },
}

/// A single `-name [value]` pair.
///
/// Non-repeatable names may appear at most once per command; repeatable
/// entries are equal iff both name and value match.
#[derive(Clone, Debug)]
pub struct Argument {
    name: String,
    value: Option<String>,
    repeatable: bool,
}

impl Argument {
    /// A unique flag without a value, e.g. `-enable-kvm`.
    pub fn unique(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            repeatable: false,
        }
    }

    /// A unique flag with a value, e.g. `-machine q35`.
    pub fn unique_with<V: fmt::Display>(name: &str, value: V) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
            repeatable: false,
        }
    }

    /// A repeatable flag with a value, e.g. `-device ...`.
    pub fn repeatable<V: fmt::Display>(name: &str, value: V) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
            repeatable: true,
        }
    }
}

/// Backend for a console stanza.
#[derive(Clone, Debug)]
pub enum ConsoleBackend {
    /// Wire the console to the QEMU process's stdio.
    Stdio,
    /// Write console bytes to an inherited file descriptor.
    Fd(i32),
}

impl ConsoleBackend {
    fn chardev(&self, id: &str) -> String {
        match self {
            ConsoleBackend::Stdio => format!("stdio,id={id}"),
            ConsoleBackend::Fd(fd) => format!("file,id={id},path=/dev/fd/{fd}"),
        }
    }
}

/// Ordered argument list with uniqueness discipline.
#[derive(Debug, Default)]
pub struct Arguments {
    entries: Vec<Argument>,
}

impl Arguments {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument. Duplicates are rejected at compile time, not
    /// here, so construction sites stay infallible.
    pub fn push(&mut self, arg: Argument) -> &mut Self {
        self.entries.push(arg);
        self
    }

    /// Append the transport-specific incantation for one console.
    ///
    /// Callers add consoles in registry order; the serial bus device for
    /// virtio transports must have been pushed once beforehand (see
    /// [`Transport::serial_bus`] via [`Arguments::push_serial_bus`]).
    pub fn push_console(&mut self, transport: Transport, id: &str, backend: &ConsoleBackend) {
        self.push(Argument::repeatable("chardev", backend.chardev(id)));
        match transport {
            Transport::Isa => {
                self.push(Argument::repeatable("serial", format!("chardev:{id}")));
            }
            Transport::Pci | Transport::Mmio => {
                self.push(Argument::repeatable(
                    "device",
                    format!("virtconsole,chardev={id}"),
                ));
            }
        }
    }

    /// Append the one-time virtio serial bus for the transport, if any.
    pub fn push_serial_bus(&mut self, transport: Transport) {
        if let Some(bus) = transport.serial_bus() {
            self.push(Argument::repeatable("device", bus));
        }
    }

    /// Compile to an argv fragment, rejecting duplicates.
    pub fn compile(&self) -> Result<Vec<OsString>, ArgsError> {
        for (idx, arg) in self.entries.iter().enumerate() {
            for earlier in &self.entries[..idx] {
                if earlier.name != arg.name {
                    continue;
                }
                if !arg.repeatable || !earlier.repeatable {
                    return Err(ArgsError::DuplicateName(arg.name.clone()));
                }
                if earlier.value == arg.value {
                    return Err(ArgsError::DuplicateEntry {
                        name: arg.name.clone(),
                        value: arg.value.clone().unwrap_or_default(),
                    });
                }
            }
        }

        let mut argv = Vec::with_capacity(self.entries.len() * 2);
        for arg in &self.entries {
            argv.push(OsString::from(format!("-{}", arg.name)));
            if let Some(value) = &arg.value {
                argv.push(OsString::from(value.clone()));
            }
        }
        Ok(argv)
    }
}
