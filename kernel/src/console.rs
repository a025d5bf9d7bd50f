//! Kernel console: character output plus the PS/2 scancode stream.
//!
//! Output goes to the serial port; a framebuffer text driver may sit on
//! top of the recorded framebuffer descriptor, but the core only needs
//! `putchar`. Input arrives as raw scancodes pushed from the IRQ 1
//! callback and is decoded lazily (scancode set 1, US layout) when the
//! shell asks for a character.

use core::fmt;

use pc_keyboard::{layouts::Us104Key, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

const SCANCODE_QUEUE_LEN: usize = 64;

/// Fixed-capacity ring of raw scancodes. Pushed from interrupt context,
/// drained from normal context.
struct ScancodeQueue {
    buf: [u8; SCANCODE_QUEUE_LEN],
    head: usize,
    tail: usize,
}

impl ScancodeQueue {
    const fn new() -> Self {
        Self {
            buf: [0; SCANCODE_QUEUE_LEN],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, code: u8) {
        let next = (self.tail + 1) % SCANCODE_QUEUE_LEN;
        if next != self.head {
            self.buf[self.tail] = code;
            self.tail = next;
        }
        // Queue full: the scancode is dropped.
    }

    fn pop(&mut self) -> Option<u8> {
        if self.head == self.tail {
            return None;
        }
        let code = self.buf[self.head];
        self.head = (self.head + 1) % SCANCODE_QUEUE_LEN;
        Some(code)
    }
}

static SCANCODES: Mutex<ScancodeQueue> = Mutex::new(ScancodeQueue::new());

static DECODER: Mutex<Option<Keyboard<Us104Key, ScancodeSet1>>> = Mutex::new(None);

/// Prepare the scancode decoder. Called once during bring-up, before
/// IRQ 1 is unmasked.
pub fn init() {
    *DECODER.lock() = Some(Keyboard::new(
        ScancodeSet1::new(),
        Us104Key,
        HandleControl::Ignore,
    ));
}

/// Push one raw scancode from the keyboard interrupt. Never blocks: if
/// the queue lock is contended the scancode is dropped.
pub fn push_scancode(code: u8) {
    if let Some(mut queue) = SCANCODES.try_lock() {
        queue.push(code);
    }
}

/// Decode the next buffered keystroke, if any.
pub fn try_read_char() -> Option<char> {
    let mut decoder = DECODER.lock();
    let keyboard = decoder.as_mut()?;
    while let Some(code) = SCANCODES.lock().pop() {
        if let Ok(Some(event)) = keyboard.add_byte(code) {
            if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(event) {
                return Some(ch);
            }
        }
    }
    None
}

/// Block until a keystroke is available.
#[cfg(target_os = "none")]
pub fn read_char() -> char {
    loop {
        if let Some(ch) = try_read_char() {
            return ch;
        }
        x86_64::instructions::hlt();
    }
}

/// Write one character to the console.
pub fn putchar(ch: char) {
    let mut buf = [0u8; 4];
    crate::serial::write_str(ch.encode_utf8(&mut buf));
}

/// Write a string to the console.
pub fn write(s: &str) {
    crate::serial::write_str(s);
}

#[doc(hidden)]
pub fn write_fmt(args: fmt::Arguments) {
    crate::serial::_serial_print(args);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn scancode_queue_is_fifo() {
        let mut queue = ScancodeQueue::new();
        queue.push(0x1E);
        queue.push(0x30);
        assert_eq!(queue.pop(), Some(0x1E));
        assert_eq!(queue.pop(), Some(0x30));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn scancode_queue_drops_when_full() {
        let mut queue = ScancodeQueue::new();
        for i in 0..2 * SCANCODE_QUEUE_LEN {
            queue.push(i as u8);
        }
        let mut drained = 0;
        while queue.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, SCANCODE_QUEUE_LEN - 1);
    }

    #[test]
    fn decodes_ascii_make_codes() {
        init();
        // Scancode set 1: 0x1E = 'a' make code, 0x9E = break.
        push_scancode(0x1E);
        push_scancode(0x9E);
        assert_eq!(try_read_char(), Some('a'));
        assert_eq!(try_read_char(), None);
    }
}
