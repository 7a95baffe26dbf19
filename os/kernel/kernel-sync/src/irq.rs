//! Local interrupt masking (`x86_64`).
//!
//! These issue `cli`/`sti` and read RFLAGS, so they must only run in a
//! privileged context.

const RFLAGS_IF: u64 = 1 << 9;

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    let rflags: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags)) }
    rflags & RFLAGS_IF != 0
}

/// Disable interrupts and report whether they were enabled before.
#[inline]
#[must_use]
pub fn disable() -> bool {
    let was_enabled = interrupts_enabled();
    if was_enabled {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
    }
    was_enabled
}

/// Re-enable interrupts if `was_enabled` says they were on.
#[inline]
pub fn restore(was_enabled: bool) {
    if was_enabled {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
    }
}
