//! In-kernel fallback shell.
//!
//! Runs when no init program could be loaded from the root file
//! system: a line-edit loop over the keyboard stream and a small
//! command table. Deliberately minimal; anything beyond poking at the
//! kernel belongs in user space.

use alloc::string::String;
use alloc::vec::Vec;

use crate::{fs, mm, time};

const CMD_BUFFER_SIZE: usize = 256;
const MAX_HISTORY: usize = 16;

struct Command {
    name: &'static str,
    description: &'static str,
    handler: fn(&str),
}

static COMMANDS: &[Command] = &[
    Command {
        name: "help",
        description: "Show this help message",
        handler: cmd_help,
    },
    Command {
        name: "clear",
        description: "Clear the screen",
        handler: cmd_clear,
    },
    Command {
        name: "echo",
        description: "Echo a message",
        handler: cmd_echo,
    },
    Command {
        name: "history",
        description: "Show recent commands",
        handler: cmd_history,
    },
    Command {
        name: "uptime",
        description: "Show time since boot",
        handler: cmd_uptime,
    },
    Command {
        name: "mem",
        description: "Show memory statistics",
        handler: cmd_mem,
    },
    Command {
        name: "ls",
        description: "List directory",
        handler: cmd_ls,
    },
    Command {
        name: "cat",
        description: "Print file contents",
        handler: cmd_cat,
    },
    Command {
        name: "fsize",
        description: "Show file size",
        handler: cmd_fsize,
    },
    Command {
        name: "pwd",
        description: "Print current directory",
        handler: cmd_pwd,
    },
    Command {
        name: "cd",
        description: "Change current directory",
        handler: cmd_cd,
    },
    Command {
        name: "exec",
        description: "Load and run an ELF program",
        handler: cmd_exec,
    },
    Command {
        name: "kpanic",
        description: "Raise a kernel panic (test)",
        handler: cmd_kpanic,
    },
    Command {
        name: "reboot",
        description: "Reboot the machine",
        handler: cmd_reboot,
    },
];

static HISTORY: spin::Mutex<Vec<String>> = spin::Mutex::new(Vec::new());

/// Split a command line into the command word and its argument tail.
fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.find(' ') {
        Some(index) => (&line[..index], line[index + 1..].trim_start()),
        None => (line, ""),
    }
}

/// Dispatch one command line. Returns false for unknown commands.
pub fn handle_command(line: &str) -> bool {
    let (name, args) = split_command(line);
    if name.is_empty() {
        return true;
    }
    for command in COMMANDS {
        if command.name == name {
            (command.handler)(args);
            return true;
        }
    }
    println!("Unknown command: '{}'", name);
    false
}

fn remember(line: &str) {
    let mut history = HISTORY.lock();
    if history.len() == MAX_HISTORY {
        history.remove(0);
    }
    history.push(String::from(line));
}

/// The interactive loop. Never returns.
#[cfg(target_os = "none")]
pub fn run() -> ! {
    println!("nimbus fallback shell; 'help' lists commands");
    let mut buffer = [0u8; CMD_BUFFER_SIZE];
    loop {
        print!("\n[shell@nimbus] ");
        let mut len = 0usize;
        let mut overflow = false;
        loop {
            let ch = crate::console::read_char();
            match ch {
                '\n' => {
                    println!();
                    break;
                }
                '\u{8}' | '\u{7f}' => {
                    if len > 0 {
                        len -= 1;
                        print!("\u{8} \u{8}");
                    }
                }
                ch if (' '..='~').contains(&ch) => {
                    if len < CMD_BUFFER_SIZE - 1 {
                        buffer[len] = ch as u8;
                        len += 1;
                        print!("{}", ch);
                    } else {
                        overflow = true;
                    }
                }
                _ => {}
            }
        }
        if overflow {
            println!("Error: command too long");
            continue;
        }
        if len == 0 {
            continue;
        }
        let line = core::str::from_utf8(&buffer[..len]).unwrap_or("");
        remember(line);
        handle_command(line);
    }
}

fn cmd_help(_args: &str) {
    for command in COMMANDS {
        println!("  {:10} {}", command.name, command.description);
    }
}

fn cmd_clear(_args: &str) {
    // ANSI clear + home; the serial console understands it.
    print!("\u{1b}[2J\u{1b}[H");
}

fn cmd_echo(args: &str) {
    println!("{}", args);
}

fn cmd_history(_args: &str) {
    for (index, line) in HISTORY.lock().iter().enumerate() {
        println!("  {:3}  {}", index + 1, line);
    }
}

fn cmd_uptime(_args: &str) {
    println!("up {:.2}s ({} ticks)", time::precise(), time::ticks());
}

fn cmd_mem(_args: &str) {
    match mm::stats() {
        Some(stats) => {
            let mib = |frames: usize| frames * mm::PAGE_SIZE / (1024 * 1024);
            println!(
                "physical: {} MiB total, {} MiB used, {} MiB free",
                mib(stats.total),
                mib(stats.used),
                mib(stats.free)
            );
            println!(
                "frames:   {} total, {} used, {} free",
                stats.total, stats.used, stats.free
            );
        }
        None => println!("memory manager not initialized"),
    }
}

fn cmd_ls(args: &str) {
    let path = if args.is_empty() { "." } else { args };
    let result = fs::vfs().lock().list(path, &mut |name, kind| {
        let marker = if kind == fs::FileType::Directory { "/" } else { "" };
        println!("  {}{}", name, marker);
    });
    if let Err(err) = result {
        println!("ls: {:?}", err);
    }
}

fn cmd_cat(args: &str) {
    if args.is_empty() {
        println!("Usage: cat <path>");
        return;
    }
    match fs::vfs().lock().read_to_end(args) {
        Ok(data) => {
            for &byte in &data {
                print!("{}", byte as char);
            }
        }
        Err(err) => println!("cat: {:?}", err),
    }
}

fn cmd_fsize(args: &str) {
    if args.is_empty() {
        println!("Usage: fsize <path>");
        return;
    }
    match fs::vfs().lock().read_to_end(args) {
        Ok(data) => println!("{}: {} bytes", args, data.len()),
        Err(err) => println!("fsize: {:?}", err),
    }
}

fn cmd_pwd(_args: &str) {
    println!("{}", fs::vfs().lock().getcwd());
}

fn cmd_cd(args: &str) {
    if let Err(err) = fs::vfs().lock().chdir(args) {
        println!("cd: {:?}", err);
    }
}

fn cmd_exec(args: &str) {
    if args.is_empty() {
        println!("Usage: exec <elf_path>");
        return;
    }
    match crate::bootstrap::spawn_user_program(args) {
        Ok(never) => match never {},
        Err(err) => println!("exec: {}", err),
    }
}

fn cmd_kpanic(_args: &str) {
    crate::fault::report(crate::fault::FaultCode::Unknown, None);
}

fn cmd_reboot(_args: &str) {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        let mut port: Port<u8> = Port::new(0x64);
        // SAFETY: 8042 reset pulse; we are leaving anyway.
        unsafe { port.write(0xFE) };
    }
    println!("reboot failed");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn command_lines_split_into_name_and_args() {
        assert_eq!(split_command("ls /etc"), ("ls", "/etc"));
        assert_eq!(split_command("help"), ("help", ""));
        assert_eq!(split_command("echo   hi there "), ("echo", "hi there"));
        assert_eq!(split_command("   "), ("", ""));
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert!(!handle_command("frobnicate now"));
        assert!(handle_command("echo hello"));
        assert!(handle_command(""));
    }

    #[test]
    fn history_is_bounded() {
        for i in 0..2 * MAX_HISTORY {
            remember(&alloc::format!("cmd {}", i));
        }
        let history = HISTORY.lock();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.last().unwrap(), "cmd 31");
    }
}
