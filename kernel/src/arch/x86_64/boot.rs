//! Multiboot2 entry stub.
//!
//! GRUB leaves us in 32-bit protected mode with paging off. The stub
//! builds the bootstrap page tables — identity map of the first 4 GiB,
//! the same 4 GiB aliased at the direct-map base in the upper half, and
//! the kernel image window at -2 GiB — enables long mode, and calls
//! `start_kernel` with the Multiboot2 info pointer.
//!
//! Table layout while the stub runs:
//!   L4[0]   -> identity L3 (boot handoff + low scratch)
//!   L4[256] -> identity L3 (direct map, copied into every process)
//!   L4[511] -> kernel L3, entry 510 -> first identity L2

#[cfg(target_os = "none")]
use core::arch::global_asm;

#[cfg(target_os = "none")]
global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8
mb_header_start:
    .long 0xe85250d6                                    // Multiboot2 magic
    .long 0                                             // architecture: i386
    .long mb_header_end - mb_header_start
    .long -(0xe85250d6 + 0 + (mb_header_end - mb_header_start))

    // End tag
    .word 0
    .word 0
    .long 8
mb_header_end:
"#
);

#[cfg(target_os = "none")]
global_asm!(
    r#"
.section .boot_bss, "aw", @nobits
.align 4096
boot_pml4:
    .space 4096
boot_pdpt_low:
    .space 4096
boot_pdpt_high:
    .space 4096
boot_pd:
    .space 4096 * 4
boot_stack_bottom:
    .space 4096 * 4
boot_stack_top:

.section .boot, "awx"
.code32
.global _start
_start:
    cli
    mov esp, offset boot_stack_top
    mov esi, ebx                        // stash the Multiboot2 info pointer

    // Refuse to continue unless a Multiboot2 loader brought us here.
    cmp eax, 0x36d76289
    jne 4f

    // Zero the bootstrap tables (7 pages).
    mov edi, offset boot_pml4
    xor eax, eax
    mov ecx, (4096 * 7) / 4
    rep stosd

    // Identity L3: four 1 GiB slots, each a PD of 2 MiB pages.
    mov edi, offset boot_pdpt_low
    mov eax, offset boot_pd
    or eax, 0x03                        // present | writable
    mov ecx, 4
1:
    mov [edi], eax
    add eax, 4096
    add edi, 8
    loop 1b

    // Fill the four PDs: entry n maps n * 2 MiB.
    mov edi, offset boot_pd
    mov eax, 0x83                       // present | writable | huge
    mov ecx, 512 * 4
2:
    mov [edi], eax
    add eax, 0x200000
    add edi, 8
    loop 2b

    // Kernel L3: -2 GiB window onto the first GiB.
    mov edi, offset boot_pdpt_high
    mov eax, offset boot_pd
    or eax, 0x03
    mov [edi + 510 * 8], eax

    // L4: identity at slot 0, direct map at slot 256, kernel at 511.
    mov edi, offset boot_pml4
    mov eax, offset boot_pdpt_low
    or eax, 0x03
    mov [edi], eax
    mov [edi + 256 * 8], eax
    mov eax, offset boot_pdpt_high
    or eax, 0x03
    mov [edi + 511 * 8], eax

    // Enable PAE, point CR3 at the new L4.
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax
    mov eax, offset boot_pml4
    mov cr3, eax

    // Long mode enable (EFER.LME), then paging.
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr
    mov eax, cr0
    or eax, 0x80000000
    mov cr0, eax

    lgdt [boot_gdt_ptr]

    // Far return into the 64-bit code segment.
    push 0x08
    push offset long_mode_start
    retf

4:
    hlt
    jmp 4b

.align 16
boot_gdt:
    .quad 0
    .quad 0x00209A0000000000            // 64-bit code
    .quad 0x0000920000000000            // data
boot_gdt_ptr:
    .word boot_gdt_ptr - boot_gdt - 1
    .long boot_gdt

.code64
long_mode_start:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    xor ax, ax
    mov fs, ax
    mov gs, ax

    mov edi, esi                        // info pointer, zero-extended
    movabs rsp, offset kernel_boot_stack_top
    movabs rax, offset start_kernel
    call rax
3:
    hlt
    jmp 3b

.section .bss
.align 16
kernel_boot_stack_bottom:
    .space 4096 * 8
kernel_boot_stack_top:
"#
);
