//! Small hand-assembled classes for tests
//!
//! Compiled for unit tests and, with the `test-util` feature, for the
//! integration tests and benchmarks.

use super::code::{Code, CodeAttribute, Instruction, Label, Node};
use super::frames::{Frame, FrameKind};
use super::opcodes::*;
use super::{encode, ClassFile, Method, MethodAttribute};
use crate::classfile::constant_pool::ConstantPool;

const ACC_PUBLIC: u16 = 0x0001;
const ACC_STATIC: u16 = 0x0008;
const ACC_INTERFACE: u16 = 0x0200;
const ACC_ABSTRACT: u16 = 0x0400;

const ILOAD_0: u8 = 0x1a;
const ILOAD_1: u8 = 0x1b;
const ALOAD_0: u8 = 0x2a;
const IADD: u8 = 0x60;
const INEG: u8 = 0x74;
const IFGE: u8 = 0x9c;

pub struct ClassAssembler {
    class: ClassFile,
}

impl ClassAssembler {
    pub fn new(name: &str) -> Self {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(name).unwrap();
        let super_class = pool.add_class("java/lang/Object").unwrap();
        Self {
            class: ClassFile {
                minor_version: 0,
                major_version: 52,
                constant_pool: pool,
                access_flags: 0x0021,
                this_class,
                super_class,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                attributes: Vec::new(),
            },
        }
    }

    /// `public interface <name> { void run(); }`
    pub fn interface(name: &str) -> Self {
        let mut class = Self::new(name);
        class.access(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT);
        class.abstract_method("run", "()V");
        class
    }

    pub fn access(&mut self, flags: u16) {
        self.class.access_flags = flags;
    }

    pub fn pool(&mut self) -> &mut ConstantPool {
        &mut self.class.constant_pool
    }

    pub fn method(&mut self, access: u16, name: &str, descriptor: &str, code: Option<Code>) {
        let pool = &mut self.class.constant_pool;
        let name_index = pool.add_utf8(name).unwrap();
        let descriptor_index = pool.add_utf8(descriptor).unwrap();
        let attributes = match code {
            Some(code) => vec![MethodAttribute::Code {
                name_index: pool.add_utf8("Code").unwrap(),
                code,
            }],
            None => Vec::new(),
        };
        self.class.methods.push(Method {
            access_flags: access,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    /// `public <init>()V` calling `Object.<init>`
    pub fn default_constructor(&mut self) {
        let init = self
            .pool()
            .add_method_ref("java/lang/Object", "<init>", "()V")
            .unwrap();
        let code = Code {
            max_stack: 1,
            max_locals: 1,
            nodes: vec![
                insn(ALOAD_0, &[]),
                insn(INVOKESPECIAL, &init.to_be_bytes()),
                insn(RETURN, &[]),
            ],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        self.method(ACC_PUBLIC, "<init>", "()V", Some(code));
    }

    /// `static int add(int, int)`
    pub fn static_add(&mut self) {
        let code = Code {
            max_stack: 2,
            max_locals: 2,
            nodes: vec![
                insn(ILOAD_0, &[]),
                insn(ILOAD_1, &[]),
                insn(IADD, &[]),
                insn(IRETURN, &[]),
            ],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        self.method(ACC_PUBLIC | ACC_STATIC, "add", "(II)I", Some(code));
    }

    /// `static int <name>(int x) { return x; }`
    pub fn static_identity(&mut self, name: &str) {
        let code = Code {
            max_stack: 1,
            max_locals: 1,
            nodes: vec![insn(ILOAD_0, &[]), insn(IRETURN, &[])],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        self.method(ACC_PUBLIC | ACC_STATIC, name, "(I)I", Some(code));
    }

    /// `static int abs(int)` with two returns and a stack map frame at the join
    pub fn static_abs_with_frames(&mut self) {
        let stack_map = self.pool().add_utf8("StackMapTable").unwrap();
        let code = Code {
            max_stack: 1,
            max_locals: 1,
            nodes: vec![
                insn(ILOAD_0, &[]),
                Node::Insn(Instruction::Branch {
                    opcode: IFGE,
                    target: Label(7),
                }),
                insn(ILOAD_0, &[]),
                insn(INEG, &[]),
                insn(IRETURN, &[]),
                Node::Label(Label(7)),
                insn(ILOAD_0, &[]),
                insn(IRETURN, &[]),
            ],
            exception_table: Vec::new(),
            attributes: vec![CodeAttribute::StackMap {
                name_index: stack_map,
                frames: vec![Frame {
                    label: Label(7),
                    kind: FrameKind::Same,
                }],
            }],
        };
        self.method(ACC_PUBLIC | ACC_STATIC, "abs", "(I)I", Some(code));
    }

    pub fn abstract_method(&mut self, name: &str, descriptor: &str) {
        self.method(ACC_PUBLIC | ACC_ABSTRACT, name, descriptor, None);
    }

    pub fn finish(self) -> Vec<u8> {
        encode(&self.class).unwrap()
    }
}

pub fn insn(opcode: u8, operands: &[u8]) -> Node {
    Node::Insn(Instruction::plain(opcode, operands))
}
