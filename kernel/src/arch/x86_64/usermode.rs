//! Ring 3 entry.

/// Flags for the first user instruction: reserved bit 1 set, IF set.
pub const USER_RFLAGS: u64 = 0x202;
/// IOPL 3 grants user code direct port access.
pub const IOPL_USER: u64 = 3 << 12;

/// Drop to ring 3 at `rip` with stack `rsp` via `iretq`.
///
/// # Safety
///
/// `rip` must be mapped user-executable and `rsp` mapped user-writable
/// in the live address space, TSS.RSP0 must already point at a valid
/// kernel stack, and the GDT must carry the ring 3 selectors.
#[cfg(target_os = "none")]
pub unsafe fn enter_userspace(rip: u64, rsp: u64) -> ! {
    let selectors = super::gdt::selectors();
    let user_cs = selectors.user_code.0 as u64 | 3;
    let user_ss = selectors.user_data.0 as u64 | 3;

    // SAFETY: builds the iretq frame (SS, RSP, RFLAGS, CS, RIP) on the
    // kernel stack; the caller guarantees the target state is valid.
    unsafe {
        core::arch::asm!(
            "mov ds, {ss:r}",
            "mov es, {ss:r}",
            // FS/GS cleared through a dedicated zero operand; zeroing a
            // fixed register here could clobber another operand.
            "mov fs, {zero:x}",
            "mov gs, {zero:x}",
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) user_ss,
            rsp = in(reg) rsp,
            rflags = in(reg) USER_RFLAGS | IOPL_USER,
            cs = in(reg) user_cs,
            rip = in(reg) rip,
            zero = in(reg) 0u64,
            options(noreturn),
        );
    }
}
