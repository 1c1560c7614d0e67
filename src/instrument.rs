//! Method timing probes
//!
//! Every concrete method of a class gets two probes:
//!
//! - at entry, `System.nanoTime()` is stored into a long local placed right
//!   after the method's original locals;
//! - before each normal return (`ireturn` .. `return`), the clock is read
//!   again and `System.out.println` prints
//!   `Time of method calling: <ms>ms, name[<class>#<method>]`.
//!
//! Exits through `athrow` are not timed, so the emitted records measure
//! successful-path latency only.
//!
//! Each method is rewritten on a copy and committed only once the copy has
//! been encoded successfully; a unit either gets all of its methods
//! instrumented or is left untouched.

use crate::classfile::code::{Code, CodeAttribute, Instruction, Node};
use crate::classfile::constant_pool::ConstantPool;
use crate::classfile::descriptor::{self, ParameterType};
use crate::classfile::frames::{self, FrameKind, VerificationType};
use crate::classfile::opcodes::*;
use crate::classfile::{ClassFile, DecodeError, EncodeError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Prefix of every timing record
pub const RECORD_PREFIX: &str = "Time of method calling: ";

/// Extra operand stack slots the exit probe needs on top of a return value
const PROBE_STACK: u16 = 4;
/// Entry timestamp plus elapsed time, two longs
const PROBE_LOCALS: u16 = 4;

/// Shared count of instrumented methods across a whole build
///
/// Cloning shares the underlying counter. Increments use relaxed ordering:
/// the value is diagnostic and nothing synchronises on it.
#[derive(Debug, Clone, Default)]
pub struct InstrumentationCounter {
    count: Arc<AtomicU64>,
}

impl InstrumentationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `methods` newly instrumented methods, returning the new total
    pub fn add(&self, methods: u64) -> u64 {
        self.count.fetch_add(methods, Ordering::Relaxed) + methods
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstrumentError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("method {method}: {reason}")]
    Unsupported { method: String, reason: String },
}

/// What happened to one class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Probes were inserted into this many methods (possibly zero)
    Instrumented { methods: usize },
    /// Interfaces and abstract classes are left alone as a whole
    SkippedUnit,
}

/// Pool indexes shared by every probe in one class
struct ProbeRefs {
    nano_time: u16,
    million: u16,
    system_out: u16,
    builder: u16,
    builder_init: u16,
    append_string: u16,
    append_long: u16,
    to_string: u16,
    println: u16,
    prefix: u16,
}

impl ProbeRefs {
    fn add_to(pool: &mut ConstantPool) -> Result<Self, EncodeError> {
        const BUILDER: &str = "java/lang/StringBuilder";
        Ok(Self {
            nano_time: pool.add_method_ref("java/lang/System", "nanoTime", "()J")?,
            million: pool.add_long(1_000_000)?,
            system_out: pool.add_field_ref("java/lang/System", "out", "Ljava/io/PrintStream;")?,
            builder: pool.add_class(BUILDER)?,
            builder_init: pool.add_method_ref(BUILDER, "<init>", "()V")?,
            append_string: pool.add_method_ref(
                BUILDER,
                "append",
                "(Ljava/lang/String;)Ljava/lang/StringBuilder;",
            )?,
            append_long: pool.add_method_ref(BUILDER, "append", "(J)Ljava/lang/StringBuilder;")?,
            to_string: pool.add_method_ref(BUILDER, "toString", "()Ljava/lang/String;")?,
            println: pool.add_method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V")?,
            prefix: pool.add_string(RECORD_PREFIX)?,
        })
    }
}

/// Insert timing probes into every concrete method of `class`
///
/// On error `class` may hold extra constant pool entries but no method has
/// been modified and `counter` is unchanged.
pub fn instrument(
    class: &mut ClassFile,
    counter: &InstrumentationCounter,
) -> Result<Outcome, InstrumentError> {
    if class.is_interface() || class.is_abstract() {
        return Ok(Outcome::SkippedUnit);
    }

    let class_name = class.name()?;
    if !class.methods.iter().any(|m| m.code().is_some()) {
        return Ok(Outcome::Instrumented { methods: 0 });
    }
    let refs = ProbeRefs::add_to(&mut class.constant_pool)?;

    let mut rewritten = Vec::new();
    for (index, method) in class.methods.iter().enumerate() {
        let Some(code) = method.code() else {
            continue;
        };
        let name = class.method_name(method)?;
        let descriptor = class.method_descriptor(method)?;
        let signature = format!("{class_name}#{name}");

        let target = MethodTarget {
            this_class: class.this_class,
            class_name: &class_name,
            name: &name,
            descriptor: &descriptor,
            is_static: method.is_static(),
        };
        let code = rewrite_method(code, &target, &refs, &mut class.constant_pool)
            .map_err(|e| annotate(e, &signature))?;
        // Encoding here catches branch overflow before anything is committed
        code.encode().map_err(|e| annotate(e.into(), &signature))?;

        trace!(method = %signature, "probes inserted");
        rewritten.push((index, code));
    }

    let methods = rewritten.len();
    for (index, code) in rewritten {
        if let Some(slot) = class.methods[index].code_mut() {
            *slot = code;
        }
    }
    counter.add(methods as u64);
    Ok(Outcome::Instrumented { methods })
}

fn annotate(error: InstrumentError, method: &str) -> InstrumentError {
    match error {
        InstrumentError::Unsupported { .. } => error,
        other => InstrumentError::Unsupported {
            method: method.to_string(),
            reason: other.to_string(),
        },
    }
}

struct MethodTarget<'a> {
    this_class: u16,
    class_name: &'a str,
    name: &'a str,
    descriptor: &'a str,
    is_static: bool,
}

fn rewrite_method(
    original: &Code,
    target: &MethodTarget<'_>,
    refs: &ProbeRefs,
    pool: &mut ConstantPool,
) -> Result<Code, InstrumentError> {
    let unsupported = |reason: &str| InstrumentError::Unsupported {
        method: format!("{}#{}", target.class_name, target.name),
        reason: reason.to_string(),
    };

    let start_slot = original.max_locals;
    let elapsed_slot = start_slot + 2;
    let max_locals = start_slot
        .checked_add(PROBE_LOCALS)
        .ok_or_else(|| unsupported("no free local variable slots"))?;
    let max_stack = original
        .max_stack
        .checked_add(PROBE_STACK)
        .ok_or_else(|| unsupported("operand stack too deep"))?;

    let suffix = pool.add_string(&format!("ms, name[{}#{}]", target.class_name, target.name))?;
    let exit_probe = exit_probe(refs, suffix, start_slot, elapsed_slot);

    let mut nodes = Vec::with_capacity(original.nodes.len() + 8);
    nodes.push(Node::Insn(Instruction::plain(
        INVOKESTATIC,
        &refs.nano_time.to_be_bytes(),
    )));
    nodes.push(Node::Insn(local(LSTORE, start_slot)));
    for node in &original.nodes {
        if let Node::Insn(insn) = node {
            if is_return(insn.opcode()) {
                nodes.extend(exit_probe.iter().cloned());
            }
        }
        nodes.push(node.clone());
    }

    let mut attributes = Vec::with_capacity(original.attributes.len());
    for attribute in &original.attributes {
        match attribute {
            CodeAttribute::StackMap { name_index, frames } => {
                let initial = initial_locals(target, pool)?;
                let expanded = frames::expand(frames, &initial)?;
                let frames = expanded
                    .into_iter()
                    .map(|mut frame| {
                        if let FrameKind::Full { locals, .. } = &mut frame.kind {
                            reserve_timestamp(locals, start_slot)
                                .ok_or_else(|| unsupported("frame declares more locals than max_locals"))?;
                        }
                        Ok(frame)
                    })
                    .collect::<Result<Vec<_>, InstrumentError>>()?;
                attributes.push(CodeAttribute::StackMap {
                    name_index: *name_index,
                    frames,
                });
            }
            // Their targets are raw offsets that no longer hold
            CodeAttribute::TypeAnnotations { .. } => {}
            other => attributes.push(other.clone()),
        }
    }

    Ok(Code {
        max_stack,
        max_locals,
        nodes,
        exception_table: original.exception_table.clone(),
        attributes,
    })
}

/// Instructions printing the elapsed time, run with the return value (if any)
/// still on the stack
fn exit_probe(refs: &ProbeRefs, suffix: u16, start_slot: u16, elapsed_slot: u16) -> Vec<Node> {
    let u16_op = |opcode: u8, index: u16| Instruction::plain(opcode, &index.to_be_bytes());
    [
        u16_op(INVOKESTATIC, refs.nano_time),
        local(LLOAD, start_slot),
        Instruction::plain(LSUB, &[]),
        u16_op(LDC2_W, refs.million),
        Instruction::plain(LDIV, &[]),
        local(LSTORE, elapsed_slot),
        u16_op(GETSTATIC, refs.system_out),
        u16_op(NEW, refs.builder),
        Instruction::plain(DUP, &[]),
        u16_op(INVOKESPECIAL, refs.builder_init),
        ldc(refs.prefix),
        u16_op(INVOKEVIRTUAL, refs.append_string),
        local(LLOAD, elapsed_slot),
        u16_op(INVOKEVIRTUAL, refs.append_long),
        ldc(suffix),
        u16_op(INVOKEVIRTUAL, refs.append_string),
        u16_op(INVOKEVIRTUAL, refs.to_string),
        u16_op(INVOKEVIRTUAL, refs.println),
    ]
    .into_iter()
    .map(Node::Insn)
    .collect()
}

/// `lload`/`lstore`, widened when the slot does not fit in a byte
fn local(opcode: u8, slot: u16) -> Instruction {
    match u8::try_from(slot) {
        Ok(slot) => Instruction::plain(opcode, &[slot]),
        Err(_) => {
            let [hi, lo] = slot.to_be_bytes();
            Instruction::plain(WIDE, &[opcode, hi, lo])
        }
    }
}

fn ldc(index: u16) -> Instruction {
    match u8::try_from(index) {
        Ok(index) => Instruction::plain(LDC, &[index]),
        Err(_) => Instruction::plain(LDC_W, &index.to_be_bytes()),
    }
}

/// The frame the verifier assumes at offset 0
fn initial_locals(
    target: &MethodTarget<'_>,
    pool: &mut ConstantPool,
) -> Result<Vec<VerificationType>, InstrumentError> {
    let mut locals = Vec::new();
    if !target.is_static {
        if target.name == "<init>" && target.class_name != "java/lang/Object" {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(target.this_class));
        }
    }
    for param in descriptor::parameter_types(target.descriptor)? {
        locals.push(match param {
            ParameterType::Int => VerificationType::Integer,
            ParameterType::Float => VerificationType::Float,
            ParameterType::Long => VerificationType::Long,
            ParameterType::Double => VerificationType::Double,
            ParameterType::Reference(name) => VerificationType::Object(pool.add_class(&name)?),
        });
    }
    Ok(locals)
}

/// Pad `locals` with `Top` up to `start_slot` slots and declare the entry
/// timestamp there; `None` when the frame already reaches past it
fn reserve_timestamp(locals: &mut Vec<VerificationType>, start_slot: u16) -> Option<()> {
    let used: usize = locals.iter().map(VerificationType::slots).sum();
    let missing = (start_slot as usize).checked_sub(used)?;
    locals.extend(std::iter::repeat(VerificationType::Top).take(missing));
    locals.push(VerificationType::Long);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::code::Label;
    use crate::classfile::constant_pool::Constant;
    use crate::classfile::fixtures::{insn, ClassAssembler};
    use crate::classfile::{decode, encode, ACC_ABSTRACT, ACC_INTERFACE};

    fn instrumented(bytes: &[u8]) -> (ClassFile, Outcome, u64) {
        let mut class = decode(bytes).unwrap();
        let counter = InstrumentationCounter::new();
        let outcome = instrument(&mut class, &counter).unwrap();
        let reparsed = decode(&encode(&class).unwrap()).unwrap();
        (reparsed, outcome, counter.get())
    }

    fn method<'a>(class: &'a ClassFile, name: &str) -> &'a Code {
        class
            .methods
            .iter()
            .find(|m| class.method_name(m).unwrap() == name)
            .and_then(|m| m.code())
            .unwrap()
    }

    fn opcodes(code: &Code) -> Vec<u8> {
        code.instructions().map(Instruction::opcode).collect()
    }

    fn strings(class: &ClassFile) -> Vec<String> {
        (1..class.constant_pool.len() as u16)
            .filter_map(|i| match class.constant_pool.get(i) {
                Ok(Constant::String(utf8)) => class.constant_pool.utf8(*utf8).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_counter_is_shared_between_clones() {
        let counter = InstrumentationCounter::new();
        let clone = counter.clone();
        assert_eq!(clone.add(3), 3);
        assert_eq!(counter.add(2), 5);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_counter_concurrent_increments() {
        let counter = InstrumentationCounter::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.add(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn test_every_concrete_method_is_counted() {
        let mut asm = ClassAssembler::new("app/MainActivity");
        asm.default_constructor();
        asm.static_add();
        asm.static_abs_with_frames();
        let (_, outcome, count) = instrumented(&asm.finish());
        assert_eq!(outcome, Outcome::Instrumented { methods: 3 });
        assert_eq!(count, 3);
    }

    #[test]
    fn test_interface_and_abstract_units_are_skipped() {
        for flags in [ACC_INTERFACE | ACC_ABSTRACT, ACC_ABSTRACT | 0x0001] {
            let mut asm = ClassAssembler::new("app/Shape");
            asm.access(flags);
            asm.abstract_method("area", "()D");
            let mut class = decode(&asm.finish()).unwrap();
            let before = class.constant_pool.len();
            let counter = InstrumentationCounter::new();

            assert_eq!(instrument(&mut class, &counter).unwrap(), Outcome::SkippedUnit);
            assert_eq!(counter.get(), 0);
            assert_eq!(class.constant_pool.len(), before);
        }
    }

    #[test]
    fn test_entry_probe_precedes_original_code() {
        let mut asm = ClassAssembler::new("app/Calc");
        asm.static_add();
        let (class, _, _) = instrumented(&asm.finish());
        let code = method(&class, "add");

        let ops = opcodes(code);
        assert_eq!(&ops[..2], &[INVOKESTATIC, LSTORE]);
        // Original body follows: iload_0, iload_1, iadd
        assert_eq!(&ops[2..5], &[0x1a, 0x1b, 0x60]);
        assert_eq!(code.max_locals, 2 + 4);
        assert_eq!(code.max_stack, 2 + 4);
    }

    #[test]
    fn test_one_exit_probe_per_return() {
        let mut asm = ClassAssembler::new("app/Calc");
        asm.static_abs_with_frames();
        let (class, _, _) = instrumented(&asm.finish());
        let ops = opcodes(method(&class, "abs"));

        let returns = ops.iter().filter(|&&op| is_return(op)).count();
        let printlns = ops
            .windows(2)
            .filter(|w| w[0] == INVOKEVIRTUAL && is_return(w[1]))
            .count();
        let clock_reads = ops.iter().filter(|&&op| op == INVOKESTATIC).count();
        assert_eq!(returns, 2);
        assert_eq!(printlns, 2);
        assert_eq!(clock_reads, 3);
    }

    #[test]
    fn test_record_names_class_and_method() {
        let mut asm = ClassAssembler::new("com/example/MainActivity");
        asm.default_constructor();
        asm.static_add();
        let (class, _, _) = instrumented(&asm.finish());
        let strings = strings(&class);

        assert!(strings.contains(&RECORD_PREFIX.to_string()));
        assert!(strings.contains(&"ms, name[com/example/MainActivity#<init>]".to_string()));
        assert!(strings.contains(&"ms, name[com/example/MainActivity#add]".to_string()));
    }

    #[test]
    fn test_branch_to_return_runs_probe() {
        let mut asm = ClassAssembler::new("app/Calc");
        asm.static_abs_with_frames();
        let (class, _, _) = instrumented(&asm.finish());
        let code = method(&class, "abs");

        // The ifge target is followed by iload_0 then the exit probe
        let target = code
            .instructions()
            .find_map(|i| match i {
                Instruction::Branch { target, .. } => Some(*target),
                _ => None,
            })
            .unwrap();
        let (offsets, _) = code.layout();
        let at = offsets[&target];
        let after: Vec<u8> = code
            .nodes
            .iter()
            .skip_while(|n| **n != Node::Label(Label(at)))
            .filter_map(|n| match n {
                Node::Insn(i) => Some(i.opcode()),
                Node::Label(_) => None,
            })
            .take(2)
            .collect();
        assert_eq!(after, vec![0x1a, INVOKESTATIC]);
    }

    #[test]
    fn test_frames_declare_timestamp_local() {
        let mut asm = ClassAssembler::new("app/Calc");
        asm.static_abs_with_frames();
        let (class, _, _) = instrumented(&asm.finish());
        let code = method(&class, "abs");

        let frames = code
            .attributes
            .iter()
            .find_map(|a| match a {
                CodeAttribute::StackMap { frames, .. } => Some(frames),
                _ => None,
            })
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].kind,
            FrameKind::Full {
                locals: vec![VerificationType::Integer, VerificationType::Long],
                stack: vec![],
            }
        );
    }

    #[test]
    fn test_frames_pad_unused_slots_with_top() {
        let mut locals = vec![VerificationType::Object(3), VerificationType::Long];
        reserve_timestamp(&mut locals, 5).unwrap();
        assert_eq!(
            locals,
            vec![
                VerificationType::Object(3),
                VerificationType::Long,
                VerificationType::Top,
                VerificationType::Top,
                VerificationType::Long,
            ]
        );
        let mut too_many = vec![VerificationType::Double];
        assert!(reserve_timestamp(&mut too_many, 1).is_none());
    }

    #[test]
    fn test_constructor_frame_starts_uninitialized() {
        let target = MethodTarget {
            this_class: 2,
            class_name: "app/Main",
            name: "<init>",
            descriptor: "(J[I)V",
            is_static: false,
        };
        let mut pool = ConstantPool::new();
        let locals = initial_locals(&target, &mut pool).unwrap();
        assert_eq!(locals[0], VerificationType::UninitializedThis);
        assert_eq!(locals[1], VerificationType::Long);
        assert!(matches!(locals[2], VerificationType::Object(_)));
    }

    #[test]
    fn test_wide_locals_use_wide_form() {
        assert_eq!(local(LSTORE, 4), Instruction::plain(LSTORE, &[4]));
        assert_eq!(
            local(LSTORE, 300),
            Instruction::plain(WIDE, &[LSTORE, 0x01, 0x2c])
        );
        assert_eq!(ldc(300), Instruction::plain(LDC_W, &[0x01, 0x2c]));
    }

    #[test]
    fn test_athrow_is_not_instrumented() {
        let mut asm = ClassAssembler::new("app/Fail");
        let code = Code {
            max_stack: 1,
            max_locals: 1,
            nodes: vec![insn(0x2a, &[]), insn(ATHROW, &[])],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        asm.method(0x0009, "rethrow", "(Ljava/lang/Throwable;)V", Some(code));
        let (class, outcome, _) = instrumented(&asm.finish());

        assert_eq!(outcome, Outcome::Instrumented { methods: 1 });
        let ops = opcodes(method(&class, "rethrow"));
        assert_eq!(ops, vec![INVOKESTATIC, LSTORE, 0x2a, ATHROW]);
    }

    #[test]
    fn test_oversized_method_leaves_class_untouched() {
        let mut asm = ClassAssembler::new("app/Huge");
        asm.static_add();
        // goto over ~32 KiB of nops: the exit probe pushes the target out of range
        let mut nodes = vec![Node::Insn(Instruction::Branch {
            opcode: GOTO,
            target: Label(32_760),
        })];
        nodes.extend(std::iter::repeat(insn(0x00, &[])).take(32_757));
        nodes.push(insn(RETURN, &[]));
        nodes.push(Node::Label(Label(32_760)));
        nodes.push(insn(RETURN, &[]));
        let code = Code {
            max_stack: 0,
            max_locals: 0,
            nodes,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        asm.method(0x0009, "huge", "()V", Some(code));

        let mut class = decode(&asm.finish()).unwrap();
        let original_add = method(&class, "add").clone();
        let counter = InstrumentationCounter::new();
        let err = instrument(&mut class, &counter).unwrap_err();

        assert!(matches!(err, InstrumentError::Unsupported { ref method, .. } if method == "app/Huge#huge"));
        assert_eq!(counter.get(), 0);
        assert_eq!(method(&class, "add"), &original_add);
    }
}
