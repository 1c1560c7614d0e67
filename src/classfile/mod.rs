//! JVM class file codec
//!
//! Decodes a compiled class into an owned structural model and encodes it
//! back. Only method bodies are modelled in depth (see [`code`]); fields,
//! class-level attributes and non-`Code` method attributes are carried as raw
//! bytes and re-emitted unchanged.

pub mod bytes;
pub mod code;
pub mod constant_pool;
pub mod descriptor;
pub mod frames;
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;
pub mod opcodes;

use bytes::{Reader, Writer};
use code::Code;
use constant_pool::ConstantPool;
use thiserror::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// Errors raised while decoding class file bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported constant pool tag {tag} at index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("invalid constant pool index {0}")]
    BadConstantIndex(u16),

    #[error("constant pool entry {0} is not valid modified UTF-8")]
    BadUtf8(u16),

    #[error("unsupported opcode {opcode:#04x} at bytecode offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u32 },

    #[error("bytecode offset {0} is not an instruction boundary")]
    BadOffset(u32),

    #[error("invalid stack map frame type {0}")]
    BadFrameType(u8),

    #[error("invalid verification type tag {0}")]
    BadVerificationType(u8),

    #[error("malformed method descriptor {0:?}")]
    BadDescriptor(String),

    #[error("malformed {attribute} attribute: {reason}")]
    MalformedAttribute {
        attribute: &'static str,
        reason: String,
    },

    #[error("{0} trailing bytes after class file")]
    TrailingBytes(usize),
}

/// Errors raised while encoding a (possibly rewritten) class model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("branch at offset {from} to {to} does not fit in 16 bits")]
    BranchOutOfRange { from: u32, to: u32 },

    #[error("code length {0} is outside 1..=65535 bytes")]
    CodeTooLarge(usize),

    #[error("label for original offset {0} is not placed in the code")]
    UnresolvedLabel(u32),

    #[error("stack map frame at offset {offset} is out of order")]
    FrameOrder { offset: u32 },

    #[error("{what} count {count} exceeds the class file limit")]
    TooMany { what: &'static str, count: usize },
}

/// An attribute kept as raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub data: Vec<u8>,
}

impl Attribute {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let name_index = r.u16()?;
        let len = r.u32()? as usize;
        Ok(Self {
            name_index,
            data: r.take(len)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodAttribute {
    Code { name_index: u16, code: Code },
    Other(Attribute),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<MethodAttribute>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    /// The method body, absent for abstract and native methods
    pub fn code(&self) -> Option<&Code> {
        self.attributes.iter().find_map(|a| match a {
            MethodAttribute::Code { code, .. } => Some(code),
            MethodAttribute::Other(_) => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut Code> {
        self.attributes.iter_mut().find_map(|a| match a {
            MethodAttribute::Code { code, .. } => Some(code),
            MethodAttribute::Other(_) => None,
        })
    }
}

/// Decoded structural model of one compiled class
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Internal name of the class, e.g. `com/example/MainActivity`
    pub fn name(&self) -> Result<String, DecodeError> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub fn method_name(&self, method: &Method) -> Result<String, DecodeError> {
        self.constant_pool.utf8(method.name_index)
    }

    pub fn method_descriptor(&self, method: &Method) -> Result<String, DecodeError> {
        self.constant_pool.utf8(method.descriptor_index)
    }
}

/// Decode class file bytes into a [`ClassFile`]
pub fn decode(data: &[u8]) -> Result<ClassFile, DecodeError> {
    let mut r = Reader::new(data);

    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let minor_version = r.u16()?;
    let major_version = r.u16()?;
    let constant_pool = ConstantPool::decode(&mut r)?;
    let access_flags = r.u16()?;
    let this_class = r.u16()?;
    let super_class = r.u16()?;

    let interface_count = r.u16()?;
    let interfaces = (0..interface_count)
        .map(|_| r.u16())
        .collect::<Result<Vec<_>, _>>()?;

    let field_count = r.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let access_flags = r.u16()?;
        let name_index = r.u16()?;
        let descriptor_index = r.u16()?;
        let attr_count = r.u16()?;
        let attributes = (0..attr_count)
            .map(|_| Attribute::decode(&mut r))
            .collect::<Result<Vec<_>, _>>()?;
        fields.push(Field {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    let method_count = r.u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        let access_flags = r.u16()?;
        let name_index = r.u16()?;
        let descriptor_index = r.u16()?;
        let attr_count = r.u16()?;
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            let raw = Attribute::decode(&mut r)?;
            if constant_pool.utf8(raw.name_index)? == "Code" {
                attributes.push(MethodAttribute::Code {
                    name_index: raw.name_index,
                    code: Code::decode(&raw.data, &constant_pool)?,
                });
            } else {
                attributes.push(MethodAttribute::Other(raw));
            }
        }
        methods.push(Method {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    let attr_count = r.u16()?;
    let attributes = (0..attr_count)
        .map(|_| Attribute::decode(&mut r))
        .collect::<Result<Vec<_>, _>>()?;

    if r.remaining() != 0 {
        return Err(DecodeError::TrailingBytes(r.remaining()));
    }

    let class = ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    };
    // A class without a resolvable name cannot be traced
    class.name()?;
    Ok(class)
}

/// Encode a [`ClassFile`] back into class file bytes
pub fn encode(class: &ClassFile) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::with_capacity(4096);
    w.u32(MAGIC);
    w.u16(class.minor_version);
    w.u16(class.major_version);
    class.constant_pool.encode(&mut w)?;
    w.u16(class.access_flags);
    w.u16(class.this_class);
    w.u16(class.super_class);

    w.count("interfaces", class.interfaces.len())?;
    for interface in &class.interfaces {
        w.u16(*interface);
    }

    w.count("fields", class.fields.len())?;
    for field in &class.fields {
        w.u16(field.access_flags);
        w.u16(field.name_index);
        w.u16(field.descriptor_index);
        w.count("field attributes", field.attributes.len())?;
        for attribute in &field.attributes {
            w.attribute(attribute.name_index, &attribute.data)?;
        }
    }

    w.count("methods", class.methods.len())?;
    for method in &class.methods {
        w.u16(method.access_flags);
        w.u16(method.name_index);
        w.u16(method.descriptor_index);
        w.count("method attributes", method.attributes.len())?;
        for attribute in &method.attributes {
            match attribute {
                MethodAttribute::Code { name_index, code } => {
                    w.attribute(*name_index, &code.encode()?)?;
                }
                MethodAttribute::Other(raw) => w.attribute(raw.name_index, &raw.data)?,
            }
        }
    }

    w.count("class attributes", class.attributes.len())?;
    for attribute in &class.attributes {
        w.attribute(attribute.name_index, &attribute.data)?;
    }

    Ok(w.into_bytes())
}
