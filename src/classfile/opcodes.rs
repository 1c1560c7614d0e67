//! JVM opcode numbers and operand layout

pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;
pub const LLOAD: u8 = 0x16;
pub const LSTORE: u8 = 0x37;
pub const DUP: u8 = 0x59;
pub const LSUB: u8 = 0x65;
pub const LDIV: u8 = 0x6d;
pub const IINC: u8 = 0x84;
pub const IFEQ: u8 = 0x99;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const ATHROW: u8 = 0xbf;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// How the bytes after an opcode are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// Fixed number of immediate bytes
    Fixed(usize),
    /// Signed 16-bit branch offset
    Branch16,
    /// Signed 32-bit branch offset
    Branch32,
    TableSwitch,
    LookupSwitch,
    Wide,
}

/// Operand layout for a defined opcode, `None` for reserved/undefined ones
pub fn operands(opcode: u8) -> Option<Operands> {
    use Operands::{Branch16, Branch32, Fixed, LookupSwitch, TableSwitch, Wide};

    let layout = match opcode {
        0x00..=0x0f => Fixed(0),
        BIPUSH => Fixed(1),
        SIPUSH => Fixed(2),
        LDC => Fixed(1),
        LDC_W | LDC2_W => Fixed(2),
        0x15..=0x19 => Fixed(1),
        0x1a..=0x35 => Fixed(0),
        0x36..=0x3a => Fixed(1),
        0x3b..=0x83 => Fixed(0),
        IINC => Fixed(2),
        0x85..=0x98 => Fixed(0),
        IFEQ..=JSR => Branch16,
        RET => Fixed(1),
        TABLESWITCH => TableSwitch,
        LOOKUPSWITCH => LookupSwitch,
        IRETURN..=RETURN => Fixed(0),
        GETSTATIC..=INVOKESTATIC => Fixed(2),
        INVOKEINTERFACE | INVOKEDYNAMIC => Fixed(4),
        NEW => Fixed(2),
        0xbc => Fixed(1),
        0xbd => Fixed(2),
        0xbe | ATHROW => Fixed(0),
        0xc0 | 0xc1 => Fixed(2),
        0xc2 | 0xc3 => Fixed(0),
        WIDE => Wide,
        MULTIANEWARRAY => Fixed(3),
        IFNULL | IFNONNULL => Branch16,
        GOTO_W | JSR_W => Branch32,
        _ => return None,
    };
    Some(layout)
}

/// `ireturn` through `return`: the normal method exits
pub fn is_return(opcode: u8) -> bool {
    (IRETURN..=RETURN).contains(&opcode)
}
