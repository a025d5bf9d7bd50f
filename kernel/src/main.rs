//! Bare-metal binary shim.
//!
//! The Multiboot2 header, the 32-to-64-bit entry stub, and
//! `start_kernel` all live in the library (`arch::x86_64::boot` and
//! `bootstrap`); this target only contributes the panic handler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use core::panic::PanicInfo;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    nimbus_kernel::fault::rust_panic(info)
}

#[cfg(not(target_os = "none"))]
fn main() {
    // Host builds exist only so `cargo test` has something to link.
}
