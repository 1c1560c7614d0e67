//! `Code` attribute as an editable node list
//!
//! Every bytecode position something refers to (branch and switch targets,
//! exception ranges, line numbers, local variable scopes, stack map frames) is
//! materialised as a [`Node::Label`] placed right before the instruction it
//! names. Instructions can then be inserted anywhere and [`Code::encode`]
//! recomputes every offset from the labels.

use super::bytes::{Reader, Writer};
use super::constant_pool::ConstantPool;
use super::frames::{self, Frame};
use super::opcodes::{self, Operands};
use super::{DecodeError, EncodeError};
use std::collections::{BTreeSet, HashMap};

/// A bytecode position; the value is the offset it had when the code was decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// An instruction without code references; `operands` are its raw
    /// immediates (for `wide`, the widened opcode followed by its operands)
    Plain { opcode: u8, operands: Vec<u8> },
    /// Conditional branches, `goto`, `jsr` and their `_w` forms
    Branch { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

impl Instruction {
    pub fn plain(opcode: u8, operands: &[u8]) -> Self {
        Instruction::Plain {
            opcode,
            operands: operands.to_vec(),
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Plain { opcode, .. } | Instruction::Branch { opcode, .. } => *opcode,
            Instruction::TableSwitch { .. } => opcodes::TABLESWITCH,
            Instruction::LookupSwitch { .. } => opcodes::LOOKUPSWITCH,
        }
    }

    /// Encoded size when the instruction starts at `pc`
    pub fn size_at(&self, pc: u32) -> u32 {
        let pad = (4 - (pc + 1) % 4) % 4;
        match self {
            Instruction::Plain { operands, .. } => 1 + operands.len() as u32,
            Instruction::Branch { opcode, .. } => match *opcode {
                opcodes::GOTO_W | opcodes::JSR_W => 5,
                _ => 3,
            },
            Instruction::TableSwitch { targets, .. } => 1 + pad + 12 + 4 * targets.len() as u32,
            Instruction::LookupSwitch { pairs, .. } => 1 + pad + 8 + 8 * pairs.len() as u32,
        }
    }

    fn labels(&self) -> Vec<Label> {
        match self {
            Instruction::Plain { .. } => Vec::new(),
            Instruction::Branch { target, .. } => vec![*target],
            Instruction::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Instruction::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, l)| *l))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Label(Label),
    Insn(Instruction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Class index of the caught type, 0 for `finally`
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub start: Label,
    pub line: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: Label,
    pub end: Label,
    pub name: u16,
    pub descriptor: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeAttribute {
    LineNumbers {
        name_index: u16,
        entries: Vec<LineNumber>,
    },
    /// `LocalVariableTable`, or `LocalVariableTypeTable` when `generic`
    LocalVariables {
        name_index: u16,
        generic: bool,
        entries: Vec<LocalVariable>,
    },
    StackMap {
        name_index: u16,
        frames: Vec<Frame>,
    },
    /// Runtime(In)VisibleTypeAnnotations; targets hold raw bytecode offsets
    TypeAnnotations { name_index: u16, data: Vec<u8> },
    Raw { name_index: u16, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub nodes: Vec<Node>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<CodeAttribute>,
}

impl Code {
    /// Decode the payload of a `Code` attribute
    pub fn decode(data: &[u8], pool: &ConstantPool) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;
        let code_len = r.u32()? as usize;
        let bytecode = r.take(code_len)?;
        let instructions = decode_instructions(bytecode)?;

        let handler_count = r.u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionHandler {
                start: Label(r.u16()? as u32),
                end: Label(r.u16()? as u32),
                handler: Label(r.u16()? as u32),
                catch_type: r.u16()?,
            });
        }

        let attr_count = r.u16()?;
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            let name_index = r.u16()?;
            let len = r.u32()? as usize;
            let payload = r.take(len)?;
            attributes.push(decode_code_attribute(name_index, payload, pool)?);
        }

        if r.remaining() != 0 {
            return Err(DecodeError::MalformedAttribute {
                attribute: "Code",
                reason: format!("{} unread bytes", r.remaining()),
            });
        }

        let mut code = Code {
            max_stack,
            max_locals,
            nodes: Vec::new(),
            exception_table,
            attributes,
        };

        let referenced = code.referenced_labels(&instructions);
        let boundaries: BTreeSet<u32> = instructions
            .iter()
            .map(|(pc, _)| *pc)
            .chain(std::iter::once(code_len as u32))
            .collect();
        if let Some(bad) = referenced.iter().find(|l| !boundaries.contains(&l.0)) {
            return Err(DecodeError::BadOffset(bad.0));
        }

        code.nodes.reserve(instructions.len() + referenced.len());
        for (pc, insn) in instructions {
            if referenced.contains(&Label(pc)) {
                code.nodes.push(Node::Label(Label(pc)));
            }
            code.nodes.push(Node::Insn(insn));
        }
        if referenced.contains(&Label(code_len as u32)) {
            code.nodes.push(Node::Label(Label(code_len as u32)));
        }

        Ok(code)
    }

    fn referenced_labels(&self, instructions: &[(u32, Instruction)]) -> BTreeSet<Label> {
        let mut labels = BTreeSet::new();
        for (_, insn) in instructions {
            labels.extend(insn.labels());
        }
        for handler in &self.exception_table {
            labels.extend([handler.start, handler.end, handler.handler]);
        }
        for attribute in &self.attributes {
            match attribute {
                CodeAttribute::LineNumbers { entries, .. } => {
                    labels.extend(entries.iter().map(|e| e.start));
                }
                CodeAttribute::LocalVariables { entries, .. } => {
                    labels.extend(entries.iter().flat_map(|e| [e.start, e.end]));
                }
                CodeAttribute::StackMap { frames, .. } => {
                    labels.extend(frames.iter().flat_map(Frame::labels));
                }
                CodeAttribute::TypeAnnotations { .. } | CodeAttribute::Raw { .. } => {}
            }
        }
        labels
    }

    /// Iterate over the instructions, skipping labels
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.nodes.iter().filter_map(|node| match node {
            Node::Insn(insn) => Some(insn),
            Node::Label(_) => None,
        })
    }

    /// Assign a bytecode offset to every label; returns the offsets and total length
    pub fn layout(&self) -> (HashMap<Label, u32>, u32) {
        let mut offsets = HashMap::new();
        let mut pc: u32 = 0;
        for node in &self.nodes {
            match node {
                Node::Label(label) => {
                    offsets.insert(*label, pc);
                }
                Node::Insn(insn) => pc += insn.size_at(pc),
            }
        }
        (offsets, pc)
    }

    /// Encode as the payload of a `Code` attribute
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let (offsets, code_len) = self.layout();
        if code_len == 0 || code_len > u16::MAX as u32 {
            return Err(EncodeError::CodeTooLarge(code_len as usize));
        }
        let at = |label: Label| -> Result<u32, EncodeError> {
            offsets
                .get(&label)
                .copied()
                .ok_or(EncodeError::UnresolvedLabel(label.0))
        };

        let mut w = Writer::with_capacity(code_len as usize + 64);
        w.u16(self.max_stack);
        w.u16(self.max_locals);
        w.u32(code_len);

        let mut pc: u32 = 0;
        for insn in self.instructions() {
            let start = w.len();
            match insn {
                Instruction::Plain { opcode, operands } => {
                    w.u8(*opcode);
                    w.bytes(operands);
                }
                Instruction::Branch { opcode, target } => {
                    let delta = at(*target)? as i64 - pc as i64;
                    w.u8(*opcode);
                    if matches!(*opcode, opcodes::GOTO_W | opcodes::JSR_W) {
                        w.i32(delta as i32);
                    } else {
                        let short = i16::try_from(delta).map_err(|_| EncodeError::BranchOutOfRange {
                            from: pc,
                            to: pc.wrapping_add(delta as u32),
                        })?;
                        w.i16(short);
                    }
                }
                Instruction::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                } => {
                    w.u8(opcodes::TABLESWITCH);
                    pad(&mut w, pc);
                    w.i32((at(*default)? as i64 - pc as i64) as i32);
                    w.i32(*low);
                    w.i32(*high);
                    for target in targets {
                        w.i32((at(*target)? as i64 - pc as i64) as i32);
                    }
                }
                Instruction::LookupSwitch { default, pairs } => {
                    w.u8(opcodes::LOOKUPSWITCH);
                    pad(&mut w, pc);
                    w.i32((at(*default)? as i64 - pc as i64) as i32);
                    w.i32(pairs.len() as i32);
                    for (key, target) in pairs {
                        w.i32(*key);
                        w.i32((at(*target)? as i64 - pc as i64) as i32);
                    }
                }
            }
            pc += (w.len() - start) as u32;
        }

        w.count("exception handlers", self.exception_table.len())?;
        for handler in &self.exception_table {
            w.u16(at(handler.start)? as u16);
            w.u16(at(handler.end)? as u16);
            w.u16(at(handler.handler)? as u16);
            w.u16(handler.catch_type);
        }

        w.count("code attributes", self.attributes.len())?;
        for attribute in &self.attributes {
            let (name_index, payload) = encode_code_attribute(attribute, &offsets)?;
            w.attribute(name_index, &payload)?;
        }

        Ok(w.into_bytes())
    }
}

fn pad(w: &mut Writer, pc: u32) {
    for _ in 0..(4 - (pc + 1) % 4) % 4 {
        w.u8(0);
    }
}

fn branch_target(pc: usize, delta: i64) -> Result<Label, DecodeError> {
    let target = pc as i64 + delta;
    u32::try_from(target)
        .map(Label)
        .map_err(|_| DecodeError::BadOffset(pc as u32))
}

fn decode_instructions(bytecode: &[u8]) -> Result<Vec<(u32, Instruction)>, DecodeError> {
    let mut r = Reader::new(bytecode);
    let mut out = Vec::new();

    while r.remaining() > 0 {
        let pc = r.position();
        let opcode = r.u8()?;
        let layout = opcodes::operands(opcode).ok_or(DecodeError::UnknownOpcode {
            opcode,
            offset: pc as u32,
        })?;

        let insn = match layout {
            Operands::Fixed(n) => Instruction::Plain {
                opcode,
                operands: r.take(n)?.to_vec(),
            },
            Operands::Branch16 => Instruction::Branch {
                opcode,
                target: branch_target(pc, r.i16()? as i64)?,
            },
            Operands::Branch32 => Instruction::Branch {
                opcode,
                target: branch_target(pc, r.i32()? as i64)?,
            },
            Operands::TableSwitch => {
                r.align4(0)?;
                let default = branch_target(pc, r.i32()? as i64)?;
                let low = r.i32()?;
                let high = r.i32()?;
                if high < low {
                    return Err(DecodeError::BadOffset(pc as u32));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count > r.remaining() / 4 {
                    return Err(DecodeError::UnexpectedEof { offset: pc });
                }
                let targets = (0..count)
                    .map(|_| branch_target(pc, r.i32()? as i64))
                    .collect::<Result<Vec<_>, _>>()?;
                Instruction::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                }
            }
            Operands::LookupSwitch => {
                r.align4(0)?;
                let default = branch_target(pc, r.i32()? as i64)?;
                let npairs = r.i32()?;
                if npairs < 0 || npairs as usize > r.remaining() / 8 {
                    return Err(DecodeError::UnexpectedEof { offset: pc });
                }
                let pairs = (0..npairs)
                    .map(|_| {
                        let key = r.i32()?;
                        Ok((key, branch_target(pc, r.i32()? as i64)?))
                    })
                    .collect::<Result<Vec<_>, DecodeError>>()?;
                Instruction::LookupSwitch { default, pairs }
            }
            Operands::Wide => {
                let widened = r.u8()?;
                let len = match widened {
                    opcodes::IINC => 4,
                    0x15..=0x19 | 0x36..=0x3a | opcodes::RET => 2,
                    _ => {
                        return Err(DecodeError::UnknownOpcode {
                            opcode: widened,
                            offset: pc as u32 + 1,
                        })
                    }
                };
                let mut operands = vec![widened];
                operands.extend_from_slice(r.take(len)?);
                Instruction::Plain { opcode, operands }
            }
        };
        out.push((pc as u32, insn));
    }

    Ok(out)
}

fn decode_code_attribute(
    name_index: u16,
    payload: &[u8],
    pool: &ConstantPool,
) -> Result<CodeAttribute, DecodeError> {
    let name = pool.utf8(name_index)?;
    let attribute = match name.as_str() {
        "LineNumberTable" => {
            let mut r = Reader::new(payload);
            let n = r.u16()?;
            let entries = (0..n)
                .map(|_| {
                    Ok(LineNumber {
                        start: Label(r.u16()? as u32),
                        line: r.u16()?,
                    })
                })
                .collect::<Result<Vec<_>, DecodeError>>()?;
            expect_consumed(&r, "LineNumberTable")?;
            CodeAttribute::LineNumbers {
                name_index,
                entries,
            }
        }
        "LocalVariableTable" | "LocalVariableTypeTable" => {
            let mut r = Reader::new(payload);
            let n = r.u16()?;
            let entries = (0..n)
                .map(|_| {
                    let start = r.u16()? as u32;
                    let length = r.u16()? as u32;
                    Ok(LocalVariable {
                        start: Label(start),
                        end: Label(start + length),
                        name: r.u16()?,
                        descriptor: r.u16()?,
                        index: r.u16()?,
                    })
                })
                .collect::<Result<Vec<_>, DecodeError>>()?;
            expect_consumed(&r, "LocalVariableTable")?;
            CodeAttribute::LocalVariables {
                name_index,
                generic: name == "LocalVariableTypeTable",
                entries,
            }
        }
        "StackMapTable" => CodeAttribute::StackMap {
            name_index,
            frames: frames::decode(payload)?,
        },
        "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
            CodeAttribute::TypeAnnotations {
                name_index,
                data: payload.to_vec(),
            }
        }
        _ => CodeAttribute::Raw {
            name_index,
            data: payload.to_vec(),
        },
    };
    Ok(attribute)
}

fn expect_consumed(r: &Reader<'_>, attribute: &'static str) -> Result<(), DecodeError> {
    if r.remaining() == 0 {
        Ok(())
    } else {
        Err(DecodeError::MalformedAttribute {
            attribute,
            reason: format!("{} unread bytes", r.remaining()),
        })
    }
}

fn encode_code_attribute(
    attribute: &CodeAttribute,
    offsets: &HashMap<Label, u32>,
) -> Result<(u16, Vec<u8>), EncodeError> {
    let at = |label: Label| -> Result<u32, EncodeError> {
        offsets
            .get(&label)
            .copied()
            .ok_or(EncodeError::UnresolvedLabel(label.0))
    };

    match attribute {
        CodeAttribute::LineNumbers {
            name_index,
            entries,
        } => {
            let mut w = Writer::new();
            w.count("line numbers", entries.len())?;
            for entry in entries {
                w.u16(at(entry.start)? as u16);
                w.u16(entry.line);
            }
            Ok((*name_index, w.into_bytes()))
        }
        CodeAttribute::LocalVariables {
            name_index,
            entries,
            ..
        } => {
            let mut w = Writer::new();
            w.count("local variables", entries.len())?;
            for entry in entries {
                let start = at(entry.start)?;
                let end = at(entry.end)?;
                w.u16(start as u16);
                w.u16(end.saturating_sub(start) as u16);
                w.u16(entry.name);
                w.u16(entry.descriptor);
                w.u16(entry.index);
            }
            Ok((*name_index, w.into_bytes()))
        }
        CodeAttribute::StackMap { name_index, frames } => {
            Ok((*name_index, frames::encode(frames, offsets)?))
        }
        CodeAttribute::TypeAnnotations { name_index, data }
        | CodeAttribute::Raw { name_index, data } => Ok((*name_index, data.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;

    fn pool_with(names: &[&str]) -> (ConstantPool, Vec<u16>) {
        let mut pool = ConstantPool::new();
        let indexes = names.iter().map(|n| pool.add_utf8(n).unwrap()).collect();
        (pool, indexes)
    }

    fn code_payload(max_stack: u16, max_locals: u16, bytecode: &[u8], tail: &[u8]) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(max_stack);
        w.u16(max_locals);
        w.u32(bytecode.len() as u32);
        w.bytes(bytecode);
        w.bytes(tail);
        w.into_bytes()
    }

    // static int abs(int x) { return x < 0 ? -x : x; } written with two returns
    const ABS: [u8; 9] = [0x1a, IFEQ + 3, 0x00, 0x06, 0x1a, 0x74, IRETURN, 0x1a, IRETURN];

    #[test]
    fn test_branch_targets_become_labels() {
        let (pool, _) = pool_with(&[]);
        let payload = code_payload(1, 1, &ABS, &[0, 0, 0, 0]);
        let code = Code::decode(&payload, &pool).unwrap();

        assert!(code.nodes.contains(&Node::Label(Label(7))));
        let branch = code.instructions().nth(1).unwrap();
        assert_eq!(
            branch,
            &Instruction::Branch {
                opcode: IFEQ + 3,
                target: Label(7)
            }
        );
    }

    #[test]
    fn test_unmodified_code_encodes_identically() {
        let (pool, idx) = pool_with(&["LineNumberTable"]);
        let mut tail = Writer::new();
        tail.u16(0); // no handlers
        tail.u16(1);
        tail.u16(idx[0]);
        tail.u32(2 + 4 * 2);
        tail.u16(2);
        tail.u16(0);
        tail.u16(10);
        tail.u16(7);
        tail.u16(12);
        let payload = code_payload(1, 1, &ABS, &tail.into_bytes());

        let code = Code::decode(&payload, &pool).unwrap();
        assert_eq!(code.encode().unwrap(), payload);
    }

    #[test]
    fn test_insertion_shifts_branches_and_line_numbers() {
        let (pool, idx) = pool_with(&["LineNumberTable"]);
        let mut tail = Writer::new();
        tail.u16(0);
        tail.u16(1);
        tail.u16(idx[0]);
        tail.u32(6);
        tail.u16(1);
        tail.u16(7);
        tail.u16(12);
        let payload = code_payload(1, 1, &ABS, &tail.into_bytes());
        let mut code = Code::decode(&payload, &pool).unwrap();

        // Two nops right before the instruction at offset 4
        let pos = code
            .nodes
            .iter()
            .position(|n| matches!(n, Node::Insn(i) if i.opcode() == 0x74))
            .unwrap()
            - 1;
        code.nodes.insert(pos, Node::Insn(Instruction::plain(0x00, &[])));
        code.nodes.insert(pos, Node::Insn(Instruction::plain(0x00, &[])));

        let encoded = code.encode().unwrap();
        let reparsed = Code::decode(&encoded, &pool).unwrap();
        let (offsets, len) = reparsed.layout();
        assert_eq!(len, 11);
        // Branch now jumps over the nops to offset 9
        assert!(offsets.contains_key(&Label(9)));
        match &reparsed.attributes[0] {
            CodeAttribute::LineNumbers { entries, .. } => assert_eq!(entries[0].start, Label(9)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tableswitch_padding_follows_position() {
        // iload_0; tableswitch 0..1 with every arm landing on the iload_0 at 24
        let mut bytecode = vec![0x1a, TABLESWITCH, 0x00, 0x00];
        for v in [23i32, 0, 1, 23, 23] {
            bytecode.extend_from_slice(&v.to_be_bytes());
        }
        bytecode.push(0x1a);
        bytecode.push(IRETURN);
        let (pool, _) = pool_with(&[]);
        let payload = code_payload(1, 1, &bytecode, &[0, 0, 0, 0]);
        let mut code = Code::decode(&payload, &pool).unwrap();
        assert_eq!(code.encode().unwrap(), payload);

        // Shift the switch by one byte: padding shrinks from 2 to 1
        code.nodes.insert(0, Node::Insn(Instruction::plain(0x00, &[])));
        let encoded = code.encode().unwrap();
        let reparsed = Code::decode(&encoded, &pool).unwrap();
        assert_eq!(reparsed.layout().1, code.layout().1);
        assert_eq!(reparsed.layout().1, bytecode.len() as u32);
    }

    #[test]
    fn test_branch_overflow_is_reported() {
        let (pool, _) = pool_with(&[]);
        // goto +3 (to the return)
        let payload = code_payload(0, 0, &[GOTO, 0x00, 0x03, RETURN], &[0, 0, 0, 0]);
        let mut code = Code::decode(&payload, &pool).unwrap();
        let filler = vec![Node::Insn(Instruction::plain(0x00, &[])); 40_000];
        code.nodes.splice(1..1, filler);
        assert!(matches!(
            code.encode(),
            Err(EncodeError::BranchOutOfRange { from: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let (pool, _) = pool_with(&[]);
        let payload = code_payload(0, 0, &[0xcb], &[0, 0, 0, 0]);
        assert_eq!(
            Code::decode(&payload, &pool),
            Err(DecodeError::UnknownOpcode {
                opcode: 0xcb,
                offset: 0
            })
        );
    }

    #[test]
    fn test_branch_into_instruction_middle_rejected() {
        let (pool, _) = pool_with(&[]);
        // goto +1 lands inside the goto operands
        let payload = code_payload(0, 0, &[GOTO, 0x00, 0x01, RETURN], &[0, 0, 0, 0]);
        assert_eq!(
            Code::decode(&payload, &pool),
            Err(DecodeError::BadOffset(1))
        );
    }

    #[test]
    fn test_wide_instructions_decode() {
        let (pool, _) = pool_with(&[]);
        let bytecode = [WIDE, IINC, 0x01, 0x00, 0xff, 0xff, WIDE, LLOAD, 0x01, 0x00, 0x58, RETURN];
        let payload = code_payload(2, 300, &bytecode, &[0, 0, 0, 0]);
        let code = Code::decode(&payload, &pool).unwrap();
        assert_eq!(code.instructions().count(), 4);
        assert_eq!(code.encode().unwrap(), payload);
    }
}
