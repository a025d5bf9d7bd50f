//! x86_64 platform layer: boot stub, descriptor tables, interrupt
//! plumbing, legacy PIC/PIT, and the user-mode transition.

pub mod boot;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod multiboot;
pub mod pic;
pub mod timer;
pub mod usermode;
