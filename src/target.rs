use std::fmt::Write as _;

/// Value-typed descriptor of one x86-64 target.
///
/// All targets share the instruction set and AT&T syntax; they differ in ABI
/// details, symbol naming and section/directive spellings. One compiler
/// binary has one active target, chosen at build time (see [`host_default`]),
/// so cross-compiling means rebuilding with a `target-*` feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub name: &'static str,
    /// Ordered GPRs for integer arguments.
    pub arg_registers: &'static [&'static str],
    /// GPRs the callee must preserve.
    pub callee_saved: &'static [&'static str],
    /// Stack bytes reserved at call sites (Win64 shadow space).
    pub shadow_space: usize,
    pub has_red_zone: bool,
    /// Whether `%al` must carry the XMM argument count into variadic calls.
    pub needs_al_for_varargs: bool,
    pub stack_alignment: usize,
    /// Prefix applied to every user-visible and external symbol.
    pub symbol_prefix: &'static str,
    pub exe_extension: &'static str,
    pub data_section: &'static str,
    pub text_section: &'static str,
    /// String literals load RIP-relative on ELF/Mach-O, absolute on PE.
    pub rip_relative: bool,
    /// `gcc` invocation template with `{exe}` and `{asm}` placeholders.
    pub assembler_command: &'static str,
}

pub const LINUX_X86_64: TargetSpec = TargetSpec {
    name: "linux-x86_64",
    arg_registers: &["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"],
    callee_saved: &["%rbx", "%rbp", "%r12", "%r13", "%r14", "%r15"],
    shadow_space: 0,
    has_red_zone: true,
    needs_al_for_varargs: true,
    stack_alignment: 16,
    symbol_prefix: "",
    exe_extension: "",
    data_section: ".section .data",
    text_section: ".section .text",
    rip_relative: true,
    assembler_command: "gcc -o {exe} {asm} runtime.o -lm",
};

pub const MACOS_X86_64: TargetSpec = TargetSpec {
    name: "macos-x86_64",
    arg_registers: &["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"],
    callee_saved: &["%rbx", "%rbp", "%r12", "%r13", "%r14", "%r15"],
    shadow_space: 0,
    has_red_zone: true,
    needs_al_for_varargs: true,
    stack_alignment: 16,
    symbol_prefix: "_",
    exe_extension: "",
    data_section: ".section __DATA,__data",
    text_section: ".section __TEXT,__text",
    rip_relative: true,
    assembler_command: "clang -o {exe} {asm} runtime.o -lm",
};

pub const WINDOWS_X86_64: TargetSpec = TargetSpec {
    name: "windows-x86_64",
    arg_registers: &["%rcx", "%rdx", "%r8", "%r9"],
    callee_saved: &[
        "%rbx", "%rbp", "%rdi", "%rsi", "%r12", "%r13", "%r14", "%r15",
    ],
    shadow_space: 32,
    has_red_zone: false,
    needs_al_for_varargs: false,
    stack_alignment: 16,
    symbol_prefix: "",
    exe_extension: ".exe",
    data_section: ".section .data",
    text_section: ".section .text",
    rip_relative: false,
    // mingw-style GCC accepts the AT&T output directly.
    assembler_command: "gcc -m64 -o {exe} {asm} runtime.o",
};

impl TargetSpec {
    pub fn symbol(&self, name: &str) -> String {
        format!("{}{}", self.symbol_prefix, name)
    }

    pub fn global_directive(&self, symbol: &str) -> String {
        format!(".globl {symbol}")
    }

    pub fn extern_directive(&self, symbol: &str) -> String {
        format!(".extern {symbol}")
    }

    /// AT&T memory operand `off(%base)`.
    pub fn memory_operand(&self, base: &str, offset: i64) -> String {
        if offset == 0 {
            format!("({base})")
        } else {
            format!("{offset}({base})")
        }
    }

    pub fn string_directive(&self, label: &str, value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for byte in value.bytes() {
            match byte {
                b'"' => escaped.push_str("\\\""),
                b'\\' => escaped.push_str("\\\\"),
                b'\n' => escaped.push_str("\\n"),
                b'\t' => escaped.push_str("\\t"),
                0x20..=0x7e => escaped.push(byte as char),
                other => {
                    let _ = write!(escaped, "\\{other:03o}");
                }
            }
        }
        format!("{label}: .string \"{escaped}\"")
    }

    pub fn quad_directive(&self, label: &str, value: u64) -> String {
        format!("{label}: .quad {value}")
    }

    /// How a code reference to a data label is rendered.
    pub fn load_address(&self, label: &str, dest: &str) -> String {
        if self.rip_relative {
            format!("leaq {label}(%rip), {dest}")
        } else {
            format!("movq ${label}, {dest}")
        }
    }

    pub fn assembler_command_for(&self, asm_path: &str, exe_path: &str) -> String {
        self.assembler_command
            .replace("{asm}", asm_path)
            .replace("{exe}", exe_path)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "target-windows")] {
        pub fn host_default() -> &'static TargetSpec { &WINDOWS_X86_64 }
    } else if #[cfg(feature = "target-macos")] {
        pub fn host_default() -> &'static TargetSpec { &MACOS_X86_64 }
    } else if #[cfg(feature = "target-linux")] {
        pub fn host_default() -> &'static TargetSpec { &LINUX_X86_64 }
    } else if #[cfg(target_os = "windows")] {
        pub fn host_default() -> &'static TargetSpec { &WINDOWS_X86_64 }
    } else if #[cfg(target_os = "macos")] {
        pub fn host_default() -> &'static TargetSpec { &MACOS_X86_64 }
    } else {
        pub fn host_default() -> &'static TargetSpec { &LINUX_X86_64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_and_win64_differ_in_the_documented_ways() {
        assert_eq!(LINUX_X86_64.shadow_space, 0);
        assert_eq!(WINDOWS_X86_64.shadow_space, 32);
        assert_eq!(LINUX_X86_64.arg_registers.len(), 6);
        assert_eq!(WINDOWS_X86_64.arg_registers.len(), 4);
        assert!(LINUX_X86_64.has_red_zone);
        assert!(!WINDOWS_X86_64.has_red_zone);
        assert_eq!(MACOS_X86_64.symbol_prefix, "_");
        assert_eq!(WINDOWS_X86_64.exe_extension, ".exe");
    }

    #[test]
    fn memory_operands_are_att_flavor() {
        assert_eq!(LINUX_X86_64.memory_operand("%rbp", -8), "-8(%rbp)");
        assert_eq!(LINUX_X86_64.memory_operand("%rax", 0), "(%rax)");
    }

    #[test]
    fn string_directive_escapes_quotes_and_control_bytes() {
        assert_eq!(
            LINUX_X86_64.string_directive(".Lstr0", "a\"b\n"),
            ".Lstr0: .string \"a\\\"b\\n\""
        );
    }

    #[test]
    fn address_loads_follow_the_object_format() {
        assert_eq!(
            LINUX_X86_64.load_address(".Lstr0", "%rax"),
            "leaq .Lstr0(%rip), %rax"
        );
        assert_eq!(
            WINDOWS_X86_64.load_address(".Lstr0", "%rax"),
            "movq $.Lstr0, %rax"
        );
    }

    #[test]
    fn assembler_command_substitutes_paths() {
        assert_eq!(
            LINUX_X86_64.assembler_command_for("prog.s", "prog"),
            "gcc -o prog prog.s runtime.o -lm"
        );
    }
}
