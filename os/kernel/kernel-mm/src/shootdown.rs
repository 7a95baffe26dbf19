//! Cross-CPU TLB invalidation.
//!
//! Every change that can leave stale translations on other CPUs bumps a
//! global generation and interrupts the CPUs that are not already about to
//! flush. A CPU that flushes records the generation it caught up to, so the
//! fault handler can tell a stale TLB from a real fault.

use crate::platform::{IpiTarget, Platform};
use crate::MemoryManager;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::{MAX_CPUS, TLB_SHOOTDOWN_VECTOR};
use kernel_vmem::{PhysMapper, TableWalker};

pub(crate) struct Shootdown {
    /// One bit per CPU with an interrupt in flight.
    pending: AtomicU64,
    generation: AtomicU64,
    seen: [AtomicU64; MAX_CPUS],
}

impl Shootdown {
    pub(crate) const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            seen: [const { AtomicU64::new(0) }; MAX_CPUS],
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// CPUs without a stamp are never interrupted and always count as
    /// stale.
    pub(crate) fn is_stale(&self, cpu: usize) -> bool {
        self.seen
            .get(cpu)
            .is_none_or(|seen| seen.load(Ordering::Acquire) != self.generation())
    }

    /// Record that `cpu` flushed after observing `generation`.
    pub(crate) fn caught_up(&self, cpu: usize, generation: u64) {
        if let Some(seen) = self.seen.get(cpu) {
            seen.store(generation, Ordering::Release);
        }
    }

    pub(crate) fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Mark `targets` pending; returns the ones that were not already.
    fn claim(&self, targets: u64) -> u64 {
        let before = self.pending.fetch_or(targets, Ordering::AcqRel);
        targets & !before
    }

    fn clear(&self, cpu: usize) {
        self.pending.fetch_and(!cpu_bit(cpu), Ordering::AcqRel);
    }
}

/// Pending bit of `cpu`; none past [`MAX_CPUS`].
const fn cpu_bit(cpu: usize) -> u64 {
    if cpu < MAX_CPUS { 1 << cpu } else { 0 }
}

const fn cpu_mask(count: usize) -> u64 {
    if count >= MAX_CPUS {
        u64::MAX
    } else {
        (1 << count) - 1
    }
}

impl<P: Platform, M: PhysMapper, W: TableWalker> MemoryManager<P, M, W> {
    /// Make every other CPU drop its translations.
    ///
    /// The caller has already invalidated the affected pages locally.
    pub fn broadcast_invalidate(&self) {
        let generation = self.shootdown.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let count = self.platform.cpu_count().min(MAX_CPUS);
        if count <= 1 {
            return;
        }

        let was_enabled = self.platform.disable_interrupts();
        let me = self.platform.current_cpu();
        debug_assert!(me < MAX_CPUS, "cpu {me} has no shootdown slot");
        let others = cpu_mask(count) & !cpu_bit(me);
        let newly = self.shootdown.claim(others);

        if newly == others {
            self.platform.send_ipi(IpiTarget::AllButSelf, TLB_SHOOTDOWN_VECTOR);
        } else {
            for cpu in (0..count).filter(|cpu| newly & cpu_bit(*cpu) != 0) {
                self.platform.send_ipi(IpiTarget::Cpu(cpu), TLB_SHOOTDOWN_VECTOR);
            }
        }
        log::trace!(
            "shootdown gen {generation} from cpu {me}: {newly:#x} of {others:#x} signalled"
        );
        self.platform.restore_interrupts(was_enabled);
    }

    /// Body of the shootdown interrupt.
    pub fn tlb_shootdown_interrupt(&self) {
        let cpu = self.platform.current_cpu();
        let generation = self.shootdown.generation();
        self.shootdown.clear(cpu);
        self.platform.flush_local_tlb();
        self.shootdown.caught_up(cpu, generation);
    }

    /// Hook `handler` (which must end up in [`Self::tlb_shootdown_interrupt`])
    /// into the shootdown vector.
    pub fn install_shootdown_handler(&self, handler: crate::InterruptHandler) {
        self.platform
            .register_interrupt_handler(TLB_SHOOTDOWN_VECTOR, handler);
        log::debug!("TLB shootdown on vector {TLB_SHOOTDOWN_VECTOR:#x}");
    }

    /// CPUs with a shootdown interrupt in flight.
    pub fn pending_shootdowns(&self) -> u64 {
        self.shootdown.pending()
    }

    /// Current shootdown generation.
    pub fn tlb_generation(&self) -> u64 {
        self.shootdown.generation()
    }
}
