use bitfield_struct::bitfield;
use core::fmt;

/// Page-fault error code pushed by the CPU (Intel SDM Vol. 3A, §4.7).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read or execute, 1 = write.
    pub write: bool,
    /// Access from CPL 3.
    pub user: bool,
    /// A reserved bit was set in some paging-structure entry.
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

impl fmt::Display for PageFaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} ({}; {}{}{})",
            self.into_bits(),
            self.explain(),
            if self.write() { "write" } else { "read" },
            if self.user() { ", user" } else { ", kernel" },
            if self.instruction_fetch() { ", fetch" } else { "" },
        )
    }
}
