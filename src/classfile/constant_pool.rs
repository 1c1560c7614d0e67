//! Constant pool with de-duplicating insertion
//!
//! Entries keep their raw representation (strings stay in modified UTF-8) so an
//! untouched pool re-encodes byte-for-byte. New entries appended by the
//! instrumentor reuse an existing slot whenever an identical constant exists.

use super::bytes::{Reader, Writer};
use super::{DecodeError, EncodeError};
use std::collections::HashMap;

/// One constant pool slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Modified UTF-8 bytes as stored in the class file
    Utf8(Vec<u8>),
    Integer(u32),
    /// IEEE bits, so NaN payloads survive and the enum stays `Eq`
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0 and the shadow slot after every Long/Double
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    /// Empty pool holding only the reserved slot 0
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            lookup: HashMap::new(),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = r.u16()?;
        let mut pool = Self::new();
        pool.entries.reserve(count as usize);

        let mut index: u16 = 1;
        while index < count {
            let tag = r.u8()?;
            let constant = match tag {
                1 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(r.take(len)?.to_vec())
                }
                3 => Constant::Integer(r.u32()?),
                4 => Constant::Float(r.u32()?),
                5 => Constant::Long(r.u64()?),
                6 => Constant::Double(r.u64()?),
                7 => Constant::Class(r.u16()?),
                8 => Constant::String(r.u16()?),
                9 => Constant::Fieldref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                10 => Constant::Methodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                11 => Constant::InterfaceMethodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                12 => Constant::NameAndType {
                    name: r.u16()?,
                    descriptor: r.u16()?,
                },
                15 => Constant::MethodHandle {
                    kind: r.u8()?,
                    reference: r.u16()?,
                },
                16 => Constant::MethodType(r.u16()?),
                17 => Constant::Dynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                18 => Constant::InvokeDynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                19 => Constant::Module(r.u16()?),
                20 => Constant::Package(r.u16()?),
                _ => return Err(DecodeError::UnknownConstantTag { tag, index }),
            };

            let wide = constant.is_wide();
            pool.lookup.entry(constant.clone()).or_insert(index);
            pool.entries.push(constant);
            index += 1;
            if wide {
                // A trailing Long/Double would claim a slot past the declared count
                if index >= count {
                    return Err(DecodeError::BadConstantIndex(index));
                }
                pool.entries.push(Constant::Unusable);
                index += 1;
            }
        }

        Ok(pool)
    }

    pub fn encode(&self, w: &mut Writer) -> Result<(), EncodeError> {
        w.count("constant pool entries", self.entries.len())?;
        for constant in &self.entries[1..] {
            match constant {
                Constant::Utf8(bytes) => {
                    w.u8(1);
                    w.count("utf8 bytes", bytes.len())?;
                    w.bytes(bytes);
                }
                Constant::Integer(v) => {
                    w.u8(3);
                    w.u32(*v);
                }
                Constant::Float(v) => {
                    w.u8(4);
                    w.u32(*v);
                }
                Constant::Long(v) => {
                    w.u8(5);
                    w.u64(*v);
                }
                Constant::Double(v) => {
                    w.u8(6);
                    w.u64(*v);
                }
                Constant::Class(i) => {
                    w.u8(7);
                    w.u16(*i);
                }
                Constant::String(i) => {
                    w.u8(8);
                    w.u16(*i);
                }
                Constant::Fieldref {
                    class,
                    name_and_type,
                } => {
                    w.u8(9);
                    w.u16(*class);
                    w.u16(*name_and_type);
                }
                Constant::Methodref {
                    class,
                    name_and_type,
                } => {
                    w.u8(10);
                    w.u16(*class);
                    w.u16(*name_and_type);
                }
                Constant::InterfaceMethodref {
                    class,
                    name_and_type,
                } => {
                    w.u8(11);
                    w.u16(*class);
                    w.u16(*name_and_type);
                }
                Constant::NameAndType { name, descriptor } => {
                    w.u8(12);
                    w.u16(*name);
                    w.u16(*descriptor);
                }
                Constant::MethodHandle { kind, reference } => {
                    w.u8(15);
                    w.u8(*kind);
                    w.u16(*reference);
                }
                Constant::MethodType(i) => {
                    w.u8(16);
                    w.u16(*i);
                }
                Constant::Dynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    w.u8(17);
                    w.u16(*bootstrap);
                    w.u16(*name_and_type);
                }
                Constant::InvokeDynamic {
                    bootstrap,
                    name_and_type,
                } => {
                    w.u8(18);
                    w.u16(*bootstrap);
                    w.u16(*name_and_type);
                }
                Constant::Module(i) => {
                    w.u8(19);
                    w.u16(*i);
                }
                Constant::Package(i) => {
                    w.u8(20);
                    w.u16(*i);
                }
                Constant::Unusable => {}
            }
        }
        Ok(())
    }

    /// Number of slots including the reserved slot 0 (the on-disk count)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Result<&Constant, DecodeError> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(DecodeError::BadConstantIndex(index)),
            Some(constant) => Ok(constant),
        }
    }

    /// Decode a Utf8 entry into a Rust string
    pub fn utf8(&self, index: u16) -> Result<String, DecodeError> {
        match self.get(index)? {
            Constant::Utf8(bytes) => {
                decode_modified_utf8(bytes).ok_or(DecodeError::BadUtf8(index))
            }
            _ => Err(DecodeError::BadConstantIndex(index)),
        }
    }

    /// Internal name behind a Class entry, e.g. `java/lang/Object`
    pub fn class_name(&self, index: u16) -> Result<String, DecodeError> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(DecodeError::BadConstantIndex(index)),
        }
    }

    /// Insert a constant, reusing an identical existing slot
    pub fn add(&mut self, constant: Constant) -> Result<u16, EncodeError> {
        if let Some(&index) = self.lookup.get(&constant) {
            return Ok(index);
        }
        let slots = if constant.is_wide() { 2 } else { 1 };
        let next = self.entries.len();
        if next + slots > u16::MAX as usize {
            return Err(EncodeError::TooMany {
                what: "constant pool entries",
                count: next + slots,
            });
        }
        let index = next as u16;
        let wide = constant.is_wide();
        self.lookup.insert(constant.clone(), index);
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16, EncodeError> {
        self.add(Constant::Utf8(encode_modified_utf8(value)))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16, EncodeError> {
        let name = self.add_utf8(internal_name)?;
        self.add(Constant::Class(name))
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16, EncodeError> {
        let utf8 = self.add_utf8(value)?;
        self.add(Constant::String(utf8))
    }

    pub fn add_long(&mut self, value: i64) -> Result<u16, EncodeError> {
        self.add(Constant::Long(value as u64))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, EncodeError> {
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType { name, descriptor })
    }

    pub fn add_field_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, EncodeError> {
        let class = self.add_class(class)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::Fieldref {
            class,
            name_and_type,
        })
    }

    pub fn add_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, EncodeError> {
        let class = self.add_class(class)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::Methodref {
            class,
            name_and_type,
        })
    }
}

/// Decode the JVM's modified UTF-8 (CESU-8 style surrogates, two-byte NUL)
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i] as u16;
        if b0 & 0x80 == 0 {
            if b0 == 0 {
                return None;
            }
            units.push(b0);
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = *bytes.get(i + 1)? as u16;
            if b1 & 0xC0 != 0x80 {
                return None;
            }
            units.push(((b0 & 0x1F) << 6) | (b1 & 0x3F));
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = *bytes.get(i + 1)? as u16;
            let b2 = *bytes.get(i + 2)? as u16;
            if b1 & 0xC0 != 0x80 || b2 & 0xC0 != 0x80 {
                return None;
            }
            units.push(((b0 & 0x0F) << 12) | ((b1 & 0x3F) << 6) | (b2 & 0x3F));
            i += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}

pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}
