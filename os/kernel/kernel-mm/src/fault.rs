//! Page-fault resolution.
//!
//! The handler classifies a fault by which levels of the walk are present
//! ([`kernel_vmem::present_mask`]) and what the leaf entry holds:
//!
//! | mask   | leaf                   | outcome                               |
//! |--------|------------------------|---------------------------------------|
//! | any    | reserved bit in error  | fatal                                 |
//! | any    | kernel slot behind     | copy master entry, retry              |
//! | `1111` | access allowed         | flush stale TLB, retry                |
//! | `1111` | access denied          | fatal                                 |
//! | `0111` | guard sentinel         | fatal                                 |
//! | `0111` | device, not populated  | populate the device block, retry      |
//! | `0111` | demand sentinel        | commit a zeroed frame, retry          |
//! | `0111` | anything else          | fatal                                 |
//! | other  | -                      | fatal                                 |

use crate::error::{FatalFault, FatalReason, FaultDump};
use crate::platform::Platform;
use crate::MemoryManager;
use kernel_info::memory::{KERNEL_HALF_FIRST_SLOT, RECURSIVE_SLOT};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{
    ALL_PRESENT, PageFaultError, PhysMapper, Pte, PteCell, PtePath, TABLES_PRESENT, TableWalker,
};

/// How a fault was resolved. In every case the faulting access is retried.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// A kernel-half top-level entry was copied from the master directory.
    DirectorySynced,
    /// This CPU had missed a shootdown; its TLB was flushed.
    StaleTlbFlushed,
    /// The entry was already valid; the single stale translation was dropped.
    Spurious,
    /// A fresh zeroed frame now backs the page.
    DemandCommitted,
    /// Another CPU committed the page first.
    DemandRaced,
    /// The device block around the page was populated.
    DevicePopulated,
    /// Another CPU populated the device block while this one waited.
    DeviceAlreadyPresent,
}

impl<P: Platform, M: PhysMapper, W: TableWalker> MemoryManager<P, M, W> {
    /// Resolve a page fault at `address` with hardware error code `error`.
    ///
    /// On success the faulting instruction should simply be restarted.
    pub fn handle_page_fault(
        &self,
        address: VirtualAddress,
        error: PageFaultError,
    ) -> Result<FaultResolution, FatalFault> {
        if error.reserved_bit() {
            return Err(self.fatal(address, error, FatalReason::ReservedBit));
        }
        if !address.is_canonical() {
            return Err(self.fatal(address, error, FatalReason::NonCanonical));
        }

        let root = self.platform.page_directory();
        let path = self.walker.locate(root, address);

        if root != self.master && self.sync_kernel_slot(&path) {
            log::trace!("vmm: synced kernel slot for {address}");
            return Ok(FaultResolution::DirectorySynced);
        }

        let leaf = path.leaf();
        let resolved = match (path.present_mask(), leaf) {
            (ALL_PRESENT, Some(cell)) => self.present_fault(address, error, cell.load()),
            (TABLES_PRESENT, Some(cell)) => self.not_present_fault(address, error, cell),
            _ => Err(FatalReason::NotMapped),
        };
        resolved.map_err(|reason| self.fatal(address, error, reason))
    }

    /// Copy the master's top-level entry if the live directory lags behind.
    fn sync_kernel_slot(&self, path: &PtePath<'_>) -> bool {
        let index = path.address().table_index(0);
        if index < KERNEL_HALF_FIRST_SLOT || index == RECURSIVE_SLOT {
            return false;
        }
        let Some(slot) = path.slot(0) else {
            return false;
        };
        let master = self.master_slot(index).load();
        if !master.present() || slot.load() == master {
            return false;
        }
        slot.store(master);
        true
    }

    fn present_fault(
        &self,
        address: VirtualAddress,
        error: PageFaultError,
        pte: Pte,
    ) -> Result<FaultResolution, FatalReason> {
        if !access_permitted(pte, error) {
            return Err(FatalReason::ProtectionViolation);
        }

        let cpu = self.platform.current_cpu();
        if self.shootdown.is_stale(cpu) {
            let generation = self.shootdown.generation();
            self.platform.flush_local_tlb();
            self.shootdown.caught_up(cpu, generation);
            return Ok(FaultResolution::StaleTlbFlushed);
        }

        self.platform.invalidate_page(address);
        Ok(FaultResolution::Spurious)
    }

    fn not_present_fault(
        &self,
        address: VirtualAddress,
        error: PageFaultError,
        cell: &PteCell,
    ) -> Result<FaultResolution, FatalReason> {
        let pte = cell.load();
        if pte.is_guard() {
            return Err(FatalReason::GuardPage);
        }
        if pte.is_device() && !(pte.is_committed() && pte.accessed()) {
            return self.device_fault(address);
        }
        if pte.is_demand() {
            return self.commit_demand(address, error, cell, pte);
        }
        if pte.is_committed() {
            return Err(FatalReason::ProtectionViolation);
        }
        if pte.into_bits() == 0 {
            return Err(FatalReason::NotMapped);
        }
        Err(FatalReason::UnrecognizedEntry)
    }

    fn commit_demand(
        &self,
        address: VirtualAddress,
        error: PageFaultError,
        cell: &PteCell,
        pte: Pte,
    ) -> Result<FaultResolution, FatalReason> {
        match self.commit_demand_page(cell, pte, error.write()) {
            None => Err(FatalReason::OutOfMemory),
            Some(Ok(committed)) => {
                log::trace!("vmm: {address} -> {}", committed.address());
                Ok(FaultResolution::DemandCommitted)
            }
            Some(Err(_)) => {
                self.platform.invalidate_page(address);
                Ok(FaultResolution::DemandRaced)
            }
        }
    }

    fn fatal(&self, address: VirtualAddress, error: PageFaultError, reason: FatalReason) -> FatalFault {
        let path = self.locate(address);
        let dump = FaultDump {
            address,
            error,
            cpu: self.platform.current_cpu(),
            present_mask: path.present_mask(),
            entries: path.snapshot(),
        };
        log::error!("vmm: unresolvable fault ({reason:?})\n{dump}");
        FatalFault { reason, dump }
    }
}

/// Whether a present leaf allows the access described by `error`.
const fn access_permitted(pte: Pte, error: PageFaultError) -> bool {
    if error.write() && !pte.writable() {
        return false;
    }
    if error.instruction_fetch() && pte.no_execute() {
        return false;
    }
    !(error.user() && !pte.user())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions() {
        let ro = Pte::new().with_present(true).with_no_execute(true);
        let write = PageFaultError::new().with_present(true).with_write(true);
        let fetch = PageFaultError::new().with_present(true).with_instruction_fetch(true);
        let user_read = PageFaultError::new().with_user(true);

        assert!(!access_permitted(ro, write));
        assert!(!access_permitted(ro, fetch));
        assert!(!access_permitted(ro, user_read));
        assert!(access_permitted(ro, PageFaultError::new()));
        assert!(access_permitted(ro.with_writable(true).with_user(true), write.with_user(true)));
    }
}
