//! CPU primitives: halt/pause, interrupt gating, port I/O re-exports,
//! and CPUID-derived identification used by the fault reporter.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

pub use x86_64::instructions::port::Port;

/// Disable interrupts and halt forever.
pub fn halt() -> ! {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::disable();
        loop {
            x86_64::instructions::hlt();
        }
    }
    #[cfg(not(target_os = "none"))]
    unreachable!("halt() reached on the host target");
}

/// Hint the CPU that we are spinning.
pub fn pause() {
    core::hint::spin_loop();
}

#[cfg(target_os = "none")]
pub fn interrupts_enable() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(target_os = "none")]
pub fn interrupts_disable() {
    x86_64::instructions::interrupts::disable();
}

/// Identification captured once at bring-up so the fault reporter does
/// not have to run CPUID with the machine already wedged.
#[derive(Clone)]
pub struct CpuInfo {
    pub vendor: [u8; 12],
    pub brand: [u8; 48],
    pub core_id: u8,
    pub has_fpu: bool,
    pub has_sse2: bool,
}

impl CpuInfo {
    pub fn vendor_str(&self) -> &str {
        core::str::from_utf8(&self.vendor).unwrap_or("unknown")
    }

    pub fn brand_str(&self) -> &str {
        let end = self
            .brand
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.brand.len());
        core::str::from_utf8(&self.brand[..end]).unwrap_or("unknown")
    }
}

static CPU_INFO: Mutex<Option<CpuInfo>> = Mutex::new(None);
static CPU_INFO_READY: AtomicBool = AtomicBool::new(false);

/// Run CPUID and cache vendor, brand string, APIC id, and feature bits.
pub fn identify() -> CpuInfo {
    let info = query_cpuid();
    *CPU_INFO.lock() = Some(info.clone());
    CPU_INFO_READY.store(true, Ordering::Release);
    info
}

/// The cached identification, if `identify` has run.
pub fn info() -> Option<CpuInfo> {
    if !CPU_INFO_READY.load(Ordering::Acquire) {
        return None;
    }
    CPU_INFO.lock().clone()
}

fn query_cpuid() -> CpuInfo {
    use core::arch::x86_64::{__cpuid, __cpuid_count};

    // SAFETY: CPUID is unprivileged and supported on every 64-bit CPU.
    let leaf0 = unsafe { __cpuid(0) };
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());

    let leaf1 = unsafe { __cpuid(1) };
    let has_fpu = leaf1.edx & (1 << 0) != 0;
    let has_sse2 = leaf1.edx & (1 << 26) != 0;
    let core_id = (leaf1.ebx >> 24) as u8;

    // Brand string lives in extended leaves 0x8000_0002..=0x8000_0004.
    let mut brand = [0u8; 48];
    let ext_max = unsafe { __cpuid(0x8000_0000) }.eax;
    if ext_max >= 0x8000_0004 {
        for (i, leaf) in (0x8000_0002u32..=0x8000_0004).enumerate() {
            let regs = unsafe { __cpuid_count(leaf, 0) };
            let base = i * 16;
            brand[base..base + 4].copy_from_slice(&regs.eax.to_le_bytes());
            brand[base + 4..base + 8].copy_from_slice(&regs.ebx.to_le_bytes());
            brand[base + 8..base + 12].copy_from_slice(&regs.ecx.to_le_bytes());
            brand[base + 12..base + 16].copy_from_slice(&regs.edx.to_le_bytes());
        }
    }

    CpuInfo {
        vendor,
        brand,
        core_id,
        has_fpu,
        has_sse2,
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn cpuid_reports_required_features() {
        let info = identify();
        // Any machine running this test suite is a 64-bit x86 with both.
        assert!(info.has_fpu);
        assert!(info.has_sse2);
        assert_eq!(info.vendor_str().len(), 12);
    }

    #[test]
    fn cached_info_matches() {
        let fresh = identify();
        let cached = info().expect("identify() populated the cache");
        assert_eq!(fresh.vendor, cached.vendor);
    }
}
