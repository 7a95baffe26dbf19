use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{LEVEL_NAMES, LEVELS, PageFaultError, Pte};

/// Failure reported by a device backing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("device i/o failed (code {0})")]
pub struct DeviceIoError(pub i32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MmError {
    #[error("invalid protection bits")]
    InvalidProtection,
    #[error("invalid mapping flags")]
    InvalidFlags,
    #[error("invalid advice {0}")]
    InvalidAdvice(i32),
    #[error("zero-length range")]
    ZeroLength,
    #[error("bad address {0}")]
    BadAddress(VirtualAddress),
    #[error("file-backed mappings are not supported")]
    Unsupported,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("address space exhausted")]
    AddressSpaceExhausted,
    #[error("address range already in use")]
    AddressInUse,
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("device mapping registry is full")]
    RegistryFull,
    #[error("no device mapping at {0}")]
    UnknownDevice(VirtualAddress),
    #[error("current thread has no user address space")]
    NoProcess,
    #[error("address space is not the active one")]
    NotActive,
    #[error(transparent)]
    Device(#[from] DeviceIoError),
}

/// Why a page fault could not be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FatalReason {
    ReservedBit,
    NonCanonical,
    GuardPage,
    ProtectionViolation,
    NotMapped,
    UnrecognizedEntry,
    OutOfMemory,
    UnknownDevice,
    DeviceIo(DeviceIoError),
}

/// Everything known about the fault at the time it was declared fatal.
#[derive(Debug, Copy, Clone)]
pub struct FaultDump {
    pub address: VirtualAddress,
    pub error: PageFaultError,
    pub cpu: usize,
    pub present_mask: u8,
    pub entries: [Option<Pte>; LEVELS],
}

impl fmt::Display for FaultDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "page fault at {} on cpu {}", self.address, self.cpu)?;
        writeln!(f, "  error: {}", self.error)?;
        writeln!(f, "  present mask: {:04b}", self.present_mask)?;
        for (name, entry) in LEVEL_NAMES.iter().zip(self.entries) {
            match entry {
                Some(pte) => writeln!(f, "  {name:>4}: {pte}")?,
                None => writeln!(f, "  {name:>4}: <not reachable>")?,
            }
        }
        Ok(())
    }
}

/// A page fault the memory manager cannot resolve.
#[derive(Debug, Copy, Clone, thiserror::Error)]
#[error("unrecoverable page fault ({reason:?})\n{dump}")]
pub struct FatalFault {
    pub reason: FatalReason,
    pub dump: FaultDump,
}
