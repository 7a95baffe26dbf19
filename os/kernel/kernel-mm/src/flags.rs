use crate::MmError;

bitflags::bitflags! {
    /// Page protection requested by a mapping call.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Prot: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl Prot {
    pub const NONE: Self = Self::empty();
}

bitflags::bitflags! {
    /// Mapping flags. The low byte follows the user-visible ABI; the
    /// high bits are kernel-only.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        /// The address is mandatory, not a hint.
        const FIXED = 0x0000_0001;
        /// Kernel stacks are always committed up front.
        const STACK = 0x0000_0004;
        /// Commit every page now.
        const POPULATE = 0x0000_0040;
        /// Skip zero-filling committed frames.
        const UNINITIALIZED = 0x0000_0080;
        /// Back with frames below 4 GiB; implies `POPULATE`.
        const BIT32 = 0x0000_0100;
        const ANONYMOUS = 0x0000_0200;

        /// `addr` is a physical address to map.
        const PHYSICAL = 0x0100_0000;
        const NOCACHE = 0x0200_0000;
        const WRITETHRU = 0x0400_0000;
        const USER = 0x0800_0000;
        const GLOBAL = 0x1000_0000;
        /// Allocate from the near pool.
        const NEAR = 0x2000_0000;
        /// Lazily populated device region.
        const DEVICE = 0x4000_0000;
        /// Write-combining.
        const WEAKORDER = 0x8000_0000;
    }
}

impl MapFlags {
    /// Flags a user mapping may not carry.
    pub const USER_PROHIBITED: Self = Self::NEAR
        .union(Self::DEVICE)
        .union(Self::GLOBAL)
        .union(Self::UNINITIALIZED);
}

bitflags::bitflags! {
    /// `mremap` flags.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct MremapFlags: u32 {
        /// Move to a new address.
        const FIXED = 0x1;
        /// The mapping may move when it cannot grow in place.
        const MAYMOVE = 0x2;
    }
}

/// `madvise` advice.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Advice {
    /// Drop committed frames; the pages fault in fresh and zeroed.
    DontNeed,
    /// Commit every demand page in the range now.
    WillNeed,
    /// Switch the range to write-combining.
    WeakOrder,
    /// Switch the range back to write-back.
    StrongOrder,
    /// Recognised, but has no effect here.
    Ignored(i32),
}

impl TryFrom<i32> for Advice {
    type Error = MmError;

    fn try_from(raw: i32) -> Result<Self, MmError> {
        match raw {
            -2 => Ok(Self::DontNeed),
            2 => Ok(Self::WillNeed),
            9 => Ok(Self::WeakOrder),
            -9 => Ok(Self::StrongOrder),
            -8..=8 => Ok(Self::Ignored(raw)),
            _ => Err(MmError::InvalidAdvice(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advice_codes() {
        assert_eq!(Advice::try_from(-2), Ok(Advice::DontNeed));
        assert_eq!(Advice::try_from(9), Ok(Advice::WeakOrder));
        assert_eq!(Advice::try_from(0), Ok(Advice::Ignored(0)));
        assert_eq!(Advice::try_from(42), Err(MmError::InvalidAdvice(42)));
    }

    #[test]
    fn user_prohibited_set() {
        assert!(MapFlags::USER_PROHIBITED.contains(MapFlags::DEVICE));
        assert!(!MapFlags::USER_PROHIBITED.contains(MapFlags::POPULATE));
    }
}
