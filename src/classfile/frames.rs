//! StackMapTable frames
//!
//! Frames are kept in their compressed kinds so an untouched method re-encodes
//! unchanged; [`expand`] turns a chain into self-contained full frames when a
//! rewrite has to change the locals every frame declares.

use super::bytes::{Reader, Writer};
use super::code::Label;
use super::{DecodeError, EncodeError};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Constant pool index of a Class entry
    Object(u16),
    /// Label of the `new` instruction that created the value
    Uninitialized(Label),
}

impl VerificationType {
    /// Local variable slots the type occupies
    pub fn slots(&self) -> usize {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let tag = r.u8()?;
        let vt = match tag {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(r.u16()?),
            8 => VerificationType::Uninitialized(Label(r.u16()? as u32)),
            _ => return Err(DecodeError::BadVerificationType(tag)),
        };
        Ok(vt)
    }

    fn encode(&self, w: &mut Writer, offsets: &HashMap<Label, u32>) -> Result<(), EncodeError> {
        match self {
            VerificationType::Top => w.u8(0),
            VerificationType::Integer => w.u8(1),
            VerificationType::Float => w.u8(2),
            VerificationType::Double => w.u8(3),
            VerificationType::Long => w.u8(4),
            VerificationType::Null => w.u8(5),
            VerificationType::UninitializedThis => w.u8(6),
            VerificationType::Object(class) => {
                w.u8(7);
                w.u16(*class);
            }
            VerificationType::Uninitialized(label) => {
                let offset = resolve(offsets, *label)?;
                w.u8(8);
                w.u16(offset as u16);
            }
        }
        Ok(())
    }

    pub(crate) fn label(&self) -> Option<Label> {
        match self {
            VerificationType::Uninitialized(label) => Some(*label),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    /// Drop the last `n` locals of the previous frame (1..=3)
    Chop(u8),
    /// Add up to three locals to the previous frame
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub label: Label,
    pub kind: FrameKind,
}

impl Frame {
    /// Every label the frame refers to, its own position first
    pub(crate) fn labels(&self) -> Vec<Label> {
        let mut labels = vec![self.label];
        let types: Vec<&VerificationType> = match &self.kind {
            FrameKind::Same | FrameKind::Chop(_) => Vec::new(),
            FrameKind::SameLocals1StackItem(vt) => vec![vt],
            FrameKind::Append(locals) => locals.iter().collect(),
            FrameKind::Full { locals, stack } => locals.iter().chain(stack.iter()).collect(),
        };
        labels.extend(types.into_iter().filter_map(VerificationType::label));
        labels
    }
}

pub fn decode(data: &[u8]) -> Result<Vec<Frame>, DecodeError> {
    let mut r = Reader::new(data);
    let count = r.u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = r.u8()?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u16, FrameKind::Same),
            64..=127 => (
                (frame_type - 64) as u16,
                FrameKind::SameLocals1StackItem(VerificationType::decode(&mut r)?),
            ),
            247 => {
                let delta = r.u16()?;
                (
                    delta,
                    FrameKind::SameLocals1StackItem(VerificationType::decode(&mut r)?),
                )
            }
            248..=250 => (r.u16()?, FrameKind::Chop(251 - frame_type)),
            251 => (r.u16()?, FrameKind::Same),
            252..=254 => {
                let delta = r.u16()?;
                let locals = (0..frame_type - 251)
                    .map(|_| VerificationType::decode(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = r.u16()?;
                let n_locals = r.u16()?;
                let locals = (0..n_locals)
                    .map(|_| VerificationType::decode(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                let n_stack = r.u16()?;
                let stack = (0..n_stack)
                    .map(|_| VerificationType::decode(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                (delta, FrameKind::Full { locals, stack })
            }
            _ => return Err(DecodeError::BadFrameType(frame_type)),
        };

        let offset = match previous {
            None => delta as u32,
            Some(prev) => prev + delta as u32 + 1,
        };
        previous = Some(offset);
        frames.push(Frame {
            label: Label(offset),
            kind,
        });
    }

    if r.remaining() != 0 {
        return Err(DecodeError::MalformedAttribute {
            attribute: "StackMapTable",
            reason: format!("{} unread bytes", r.remaining()),
        });
    }
    Ok(frames)
}

pub fn encode(frames: &[Frame], offsets: &HashMap<Label, u32>) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::new();
    w.count("stack map frames", frames.len())?;
    let mut previous: Option<u32> = None;

    for frame in frames {
        let offset = resolve(offsets, frame.label)?;
        let delta = match previous {
            None => offset,
            Some(prev) if offset > prev => offset - prev - 1,
            Some(_) => return Err(EncodeError::FrameOrder { offset }),
        };
        previous = Some(offset);
        let delta = u16::try_from(delta).map_err(|_| EncodeError::FrameOrder { offset })?;

        match &frame.kind {
            FrameKind::Same if delta <= 63 => w.u8(delta as u8),
            FrameKind::Same => {
                w.u8(251);
                w.u16(delta);
            }
            FrameKind::SameLocals1StackItem(vt) => {
                if delta <= 63 {
                    w.u8(64 + delta as u8);
                } else {
                    w.u8(247);
                    w.u16(delta);
                }
                vt.encode(&mut w, offsets)?;
            }
            FrameKind::Chop(n) => {
                w.u8(251 - n);
                w.u16(delta);
            }
            FrameKind::Append(locals) => {
                w.u8(251 + locals.len() as u8);
                w.u16(delta);
                for vt in locals {
                    vt.encode(&mut w, offsets)?;
                }
            }
            FrameKind::Full { locals, stack } => {
                w.u8(255);
                w.u16(delta);
                w.count("frame locals", locals.len())?;
                for vt in locals {
                    vt.encode(&mut w, offsets)?;
                }
                w.count("frame stack items", stack.len())?;
                for vt in stack {
                    vt.encode(&mut w, offsets)?;
                }
            }
        }
    }

    Ok(w.into_bytes())
}

/// Rewrite a compressed frame chain as full frames, starting from the
/// implicit frame derived from the method descriptor
pub fn expand(frames: &[Frame], initial: &[VerificationType]) -> Result<Vec<Frame>, DecodeError> {
    let mut locals = initial.to_vec();
    let mut expanded = Vec::with_capacity(frames.len());

    for frame in frames {
        let stack = match &frame.kind {
            FrameKind::Same => Vec::new(),
            FrameKind::SameLocals1StackItem(vt) => vec![vt.clone()],
            FrameKind::Chop(n) => {
                let n = *n as usize;
                if n > locals.len() {
                    return Err(DecodeError::MalformedAttribute {
                        attribute: "StackMapTable",
                        reason: format!(
                            "chop of {n} locals at offset {} with only {} present",
                            frame.label.0,
                            locals.len()
                        ),
                    });
                }
                locals.truncate(locals.len() - n);
                Vec::new()
            }
            FrameKind::Append(extra) => {
                locals.extend(extra.iter().cloned());
                Vec::new()
            }
            FrameKind::Full {
                locals: full,
                stack,
            } => {
                locals = full.clone();
                stack.clone()
            }
        };
        expanded.push(Frame {
            label: frame.label,
            kind: FrameKind::Full {
                locals: locals.clone(),
                stack,
            },
        });
    }

    Ok(expanded)
}

fn resolve(offsets: &HashMap<Label, u32>, label: Label) -> Result<u32, EncodeError> {
    offsets
        .get(&label)
        .copied()
        .ok_or(EncodeError::UnresolvedLabel(label.0))
}
