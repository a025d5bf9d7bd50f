//! COM1 serial sink.
//!
//! The logger and the console both end up here. Byte-level access is
//! exposed as `write_byte` for collaborators that format their own
//! output (the fault reporter writes with interrupts already off).

use core::fmt;

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;
#[cfg(target_os = "none")]
use uart_16550::SerialPort;

#[cfg(target_os = "none")]
const COM1: u16 = 0x3F8;

#[cfg(target_os = "none")]
lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: COM1 is the standard PC serial port; probing it is
        // harmless even when no device is attached.
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

/// Write one raw byte to COM1.
#[cfg(target_os = "none")]
pub fn write_byte(byte: u8) {
    SERIAL1.lock().send(byte);
}

#[cfg(not(target_os = "none"))]
pub fn write_byte(_byte: u8) {}

/// Write a string to COM1.
pub fn write_str(s: &str) {
    for byte in s.bytes() {
        write_byte(byte);
    }
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        use fmt::Write;
        x86_64::instructions::interrupts::without_interrupts(|| {
            SERIAL1.lock().write_fmt(args).ok();
        });
    }

    #[cfg(not(target_os = "none"))]
    {
        let _ = args;
    }
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
