use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// A leaf or intermediate x86-64 page-table entry.
///
/// The hardware fields keep their architectural positions. The kernel stores
/// its own bookkeeping in bits the MMU ignores:
///
/// | Bits   | Field                          |
/// |--------|--------------------------------|
/// | 0      | present                        |
/// | 1      | writable                       |
/// | 2      | user                           |
/// | 3, 4   | write-through, cache-disable   |
/// | 5, 6   | accessed, dirty                |
/// | 7      | page-size (PAT on 4 KiB leaves)|
/// | 8      | global                         |
/// | 9      | kernel: physical               |
/// | 10     | kernel: locked                 |
/// | 11     | kernel: device                 |
/// | 12–51  | frame number                   |
/// | 52     | kernel: wait (reserved)        |
/// | 53     | kernel: file-map (reserved)    |
/// | 54     | kernel: demand                 |
/// | 59–62  | protection key                 |
/// | 63     | no-execute                     |
///
/// Two frame numbers never name real memory. All ones ([`Pte::DEMAND_FRAME`])
/// marks a page whose frame is assigned on first touch; the same value with
/// its top bit cleared ([`Pte::GUARD_FRAME`]) marks a page that always
/// faults.
///
/// ```
/// # use kernel_vmem::Pte;
/// # use kernel_memory_addresses::PhysicalAddress;
/// let pte = Pte::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_address(PhysicalAddress::new(0x20_3000));
/// assert_eq!(pte.into_bits(), 0x20_3003);
/// assert!(pte.is_committed());
/// assert!(!Pte::new().with_frame(Pte::DEMAND_FRAME).is_committed());
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Pte {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Large page in PDPT/PD entries; PAT selector bit in 4 KiB leaves.
    pub page_size: bool,
    pub global: bool,

    /// Maps a caller-supplied physical address; never freed on unmap.
    pub physical: bool,
    /// Pinned by `mlock`; `MADV_DONTNEED` leaves the frame alone.
    pub locked: bool,
    /// Part of a lazily populated device region.
    pub device: bool,

    #[bits(40)]
    pub frame: u64,

    /// Reserved so the word layout matches the rest of the kernel; the
    /// memory manager never sets or reads it.
    pub wait: bool,
    /// Reserved like `wait`. File-backed mappings are not supported, so
    /// nothing sets it.
    pub file_map: bool,
    pub demand: bool,

    #[bits(4)]
    __: u8,

    #[bits(4)]
    pub protection_key: u8,

    pub no_execute: bool,
}

impl Pte {
    /// Mask of the address field within the raw word.
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Frame number reserved for "commit on first touch".
    pub const DEMAND_FRAME: u64 = (1 << 40) - 1;

    /// Frame number reserved for guard pages.
    pub const GUARD_FRAME: u64 = Self::DEMAND_FRAME >> 1;

    /// Physical address held in the address field.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.into_bits() & Self::ADDR_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn with_address(self, pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_page_aligned());
        self.with_frame(pa.as_u64() >> 12)
    }

    /// Not yet committed; the next access allocates a frame.
    #[inline]
    #[must_use]
    pub const fn is_demand(self) -> bool {
        self.frame() == Self::DEMAND_FRAME
    }

    /// Always faults.
    #[inline]
    #[must_use]
    pub const fn is_guard(self) -> bool {
        self.frame() == Self::GUARD_FRAME
    }

    #[inline]
    #[must_use]
    pub const fn is_device(self) -> bool {
        self.device()
    }

    #[inline]
    #[must_use]
    pub const fn is_physical_fixed(self) -> bool {
        self.physical()
    }

    /// Holds a real frame address, present or not.
    #[inline]
    #[must_use]
    pub const fn is_committed(self) -> bool {
        let frame = self.frame();
        frame != 0 && frame != Self::DEMAND_FRAME && frame != Self::GUARD_FRAME
    }

    /// Holds a frame taken from the frame allocator, i.e. one that must be
    /// returned when the mapping goes away.
    #[inline]
    #[must_use]
    pub const fn owns_frame(self) -> bool {
        self.is_committed() && !self.physical()
    }

    /// Same flags, address replaced by the demand sentinel, not present.
    #[inline]
    #[must_use]
    pub const fn into_demand(self) -> Self {
        self.with_frame(Self::DEMAND_FRAME)
            .with_present(false)
            .with_accessed(false)
            .with_dirty(false)
    }

    /// Same flags, address replaced by the guard sentinel, not present.
    #[inline]
    #[must_use]
    pub const fn into_guard(self) -> Self {
        self.with_frame(Self::GUARD_FRAME)
            .with_present(false)
            .with_accessed(false)
            .with_dirty(false)
    }

    /// Index into the PAT formed by the PAT, PCD and PWT bits.
    #[inline]
    #[must_use]
    pub const fn pat_index(self) -> u8 {
        ((self.page_size() as u8) << 2)
            | ((self.cache_disable() as u8) << 1)
            | (self.write_through() as u8)
    }

    #[inline]
    #[must_use]
    pub const fn with_pat_index(self, index: u8) -> Self {
        self.with_page_size(index & 4 != 0)
            .with_cache_disable(index & 2 != 0)
            .with_write_through(index & 1 != 0)
    }
}

impl fmt::Display for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u32, &str); 16] = [
            (0, "P"),
            (1, "W"),
            (2, "U"),
            (3, "PWT"),
            (4, "PCD"),
            (5, "A"),
            (6, "D"),
            (7, "PS"),
            (8, "G"),
            (9, "PHYS"),
            (10, "LOCK"),
            (11, "DEV"),
            (52, "WAIT"),
            (53, "FMAP"),
            (54, "DMND"),
            (63, "NX"),
        ];

        let bits = self.into_bits();
        write!(f, "{bits:#018x} [")?;
        for (bit, name) in NAMES {
            if bits & (1 << bit) != 0 {
                write!(f, " {name}")?;
            }
        }
        if self.is_demand() {
            f.write_str(" <demand>")?;
        } else if self.is_guard() {
            f.write_str(" <guard>")?;
        } else {
            write!(f, " addr={}", self.address())?;
        }
        f.write_str(" ]")
    }
}
