//! Architecture support. x86_64 is the only implemented architecture.

pub mod x86_64;

pub use self::x86_64::cpu::halt;
