//! Method and bytecode model.
//!
//! The engine never interprets bytecode; it only needs to know, for a given
//! resume offset, which instruction sits there, how deep the operand stack is
//! at that point, and how long the instruction is. [`Method`] carries exactly
//! that per-offset table plus the frame-shape numbers (argument, temp and
//! operand-stack counts) used to size interpreter frames.

use std::fmt;

use rustc_hash::FxHashMap;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl MethodId {
    /// Encode as a stack word (saved constant-pool slots carry method ids).
    #[inline]
    pub const fn to_word(self) -> crate::value::Word {
        self.0 as crate::value::Word
    }

    /// Decode a stack word written by [`MethodId::to_word`].
    #[inline]
    pub const fn from_word(word: crate::value::Word) -> Self {
        Self(word as u32)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// Identifier of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

bitflags::bitflags! {
    /// Method modifiers relevant to frame reconstruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u32 {
        /// Method acquires its receiver (or class) monitor on entry.
        const SYNCHRONIZED = 1 << 0;
        /// Method has no receiver.
        const STATIC = 1 << 1;
        /// Method body is native code.
        const NATIVE = 1 << 2;
        /// Non-empty `Object.<init>`, which keeps a hidden copy of the receiver.
        const NON_EMPTY_OBJECT_CONSTRUCTOR = 1 << 3;
    }
}

// =============================================================================
// Return Kind
// =============================================================================

/// Category of a method's declared return value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// No value.
    Void = 0,
    /// 32-bit integer (also boolean, byte, char, short).
    Int = 1,
    /// 64-bit integer.
    Long = 2,
    /// 32-bit float.
    Float = 3,
    /// 64-bit float.
    Double = 4,
    /// Object or array reference.
    Reference = 5,
}

impl ReturnKind {
    /// Convert from a raw discriminant.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Void),
            1 => Some(Self::Int),
            2 => Some(Self::Long),
            3 => Some(Self::Float),
            4 => Some(Self::Double),
            5 => Some(Self::Reference),
            _ => None,
        }
    }

    /// Map a descriptor return character (`V`, `I`, `J`, `[`, ...).
    pub const fn from_descriptor(c: u8) -> Self {
        match c {
            b'V' => Self::Void,
            b'J' => Self::Long,
            b'F' => Self::Float,
            b'D' => Self::Double,
            b'L' | b'[' => Self::Reference,
            _ => Self::Int,
        }
    }

    /// Operand-stack slots occupied by a value of this kind.
    #[inline]
    pub const fn slot_count(self) -> usize {
        match self {
            Self::Void => 0,
            Self::Int | Self::Float | Self::Reference => 1,
            Self::Long | Self::Double => 2,
        }
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Void => "void",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Reference => "reference",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Bytecode
// =============================================================================

/// Flavour of an invoke instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    /// `invokevirtual`
    Virtual,
    /// `invokespecial`
    Special,
    /// `invokeinterface`
    Interface,
    /// Method-handle invoke.
    Handle,
    /// `invokestatic`
    Static,
    /// `invokedynamic`
    Dynamic,
}

impl InvokeKind {
    /// Whether the call site pushes an implicit receiver.
    #[inline]
    pub const fn has_receiver(self) -> bool {
        matches!(
            self,
            Self::Virtual | Self::Special | Self::Interface | Self::Handle
        )
    }
}

/// The instruction found at a resume offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bytecode {
    /// A call site.
    Invoke {
        /// Dispatch flavour.
        kind: InvokeKind,
        /// Argument slots, excluding the receiver.
        arg_slots: u16,
        /// Declared return category of the callee.
        returns: ReturnKind,
    },
    /// `monitorenter`
    MonitorEnter,
    /// `new`
    New,
    /// `newarray`
    NewArray,
    /// `anewarray`
    ANewArray,
    /// `multianewarray` with its dimension count.
    MultiANewArray {
        /// Number of stacked dimension sizes.
        dimensions: u8,
    },
    /// Anything else, with its encoded length.
    Other {
        /// Instruction length in bytes.
        length: u8,
    },
}

impl Bytecode {
    /// Encoded instruction length in bytes.
    pub const fn length(self) -> u32 {
        match self {
            Self::Invoke { .. } | Self::New | Self::ANewArray => 3,
            Self::MonitorEnter => 1,
            Self::NewArray => 2,
            Self::MultiANewArray { .. } => 4,
            Self::Other { length } => length as u32,
        }
    }
}

/// Per-offset facts the stack mapper knows about a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytecodeInfo {
    /// Instruction at this offset.
    pub op: Bytecode,
    /// Operand-stack depth before the instruction executes.
    pub stack_depth: u16,
}

// =============================================================================
// Method
// =============================================================================

/// Immutable shape of a method.
#[derive(Debug, Clone)]
pub struct Method {
    /// Method identity.
    pub id: MethodId,
    /// Declaring class.
    pub class: ClassId,
    /// Human-readable name for diagnostics.
    pub name: Box<str>,
    /// Argument slots, including the receiver.
    pub arg_count: u16,
    /// Temp slots, excluding any hidden slot.
    pub temp_count: u16,
    /// Maximum operand-stack depth.
    pub max_stack: u16,
    /// Modifiers.
    pub flags: MethodFlags,
    /// Declared return category.
    pub return_kind: ReturnKind,
    code: FxHashMap<u32, BytecodeInfo>,
}

impl Method {
    /// Start building a method.
    pub fn builder(id: MethodId, class: ClassId, name: &str) -> MethodBuilder {
        MethodBuilder {
            method: Method {
                id,
                class,
                name: name.into(),
                arg_count: 0,
                temp_count: 0,
                max_stack: 0,
                flags: MethodFlags::empty(),
                return_kind: ReturnKind::Void,
                code: FxHashMap::default(),
            },
        }
    }

    /// Whether the method is synchronized.
    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    /// Whether the method is static.
    #[inline]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Whether the method is native.
    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    /// Whether the interpreter frame carries one hidden temp.
    ///
    /// Synchronized methods keep the sync object there; a non-empty
    /// `Object.<init>` keeps a copy of the receiver.
    #[inline]
    pub fn has_hidden_slot(&self) -> bool {
        self.flags
            .intersects(MethodFlags::SYNCHRONIZED | MethodFlags::NON_EMPTY_OBJECT_CONSTRUCTOR)
    }

    /// Interpreter-visible locals: arguments, temps and any hidden slot.
    #[inline]
    pub fn frame_locals(&self) -> usize {
        self.arg_count as usize + self.temp_count as usize + usize::from(self.has_hidden_slot())
    }

    /// Stack-mapper entry at `offset`.
    #[inline]
    pub fn bytecode_at(&self, offset: u32) -> Option<&BytecodeInfo> {
        self.code.get(&offset)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Builder for [`Method`].
#[derive(Debug)]
pub struct MethodBuilder {
    method: Method,
}

impl MethodBuilder {
    /// Argument slot count, including the receiver.
    pub fn args(mut self, count: u16) -> Self {
        self.method.arg_count = count;
        self
    }

    /// Temp slot count.
    pub fn temps(mut self, count: u16) -> Self {
        self.method.temp_count = count;
        self
    }

    /// Maximum operand-stack depth.
    pub fn max_stack(mut self, depth: u16) -> Self {
        self.method.max_stack = depth;
        self
    }

    /// Add modifiers.
    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.method.flags |= flags;
        self
    }

    /// Declared return category.
    pub fn returns(mut self, kind: ReturnKind) -> Self {
        self.method.return_kind = kind;
        self
    }

    /// Record the instruction and stack depth at `offset`.
    pub fn bytecode(mut self, offset: u32, op: Bytecode, stack_depth: u16) -> Self {
        self.method.code.insert(offset, BytecodeInfo { op, stack_depth });
        self
    }

    /// Finish building.
    pub fn build(self) -> Method {
        self.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(flags: MethodFlags) -> Method {
        Method::builder(MethodId(1), ClassId(1), "sample")
            .args(2)
            .temps(3)
            .max_stack(4)
            .flags(flags)
            .bytecode(0, Bytecode::Other { length: 1 }, 0)
            .build()
    }

    #[test]
    fn test_frame_locals_without_hidden_slot() {
        assert_eq!(sample(MethodFlags::empty()).frame_locals(), 5);
    }

    #[test]
    fn test_frame_locals_with_hidden_slot() {
        assert_eq!(sample(MethodFlags::SYNCHRONIZED).frame_locals(), 6);
        assert_eq!(
            sample(MethodFlags::NON_EMPTY_OBJECT_CONSTRUCTOR).frame_locals(),
            6
        );
    }

    #[test]
    fn test_return_kind_slots() {
        assert_eq!(ReturnKind::Void.slot_count(), 0);
        assert_eq!(ReturnKind::Reference.slot_count(), 1);
        assert_eq!(ReturnKind::Double.slot_count(), 2);
        assert_eq!(ReturnKind::from_descriptor(b'['), ReturnKind::Reference);
        assert_eq!(ReturnKind::from_descriptor(b'Z'), ReturnKind::Int);
        assert_eq!(ReturnKind::from_u8(4), Some(ReturnKind::Double));
        assert_eq!(ReturnKind::from_u8(6), None);
    }

    #[test]
    fn test_invoke_receiver() {
        assert!(InvokeKind::Interface.has_receiver());
        assert!(!InvokeKind::Static.has_receiver());
        assert!(!InvokeKind::Dynamic.has_receiver());
    }

    #[test]
    fn test_bytecode_lengths() {
        let invoke = Bytecode::Invoke {
            kind: InvokeKind::Virtual,
            arg_slots: 1,
            returns: ReturnKind::Int,
        };
        assert_eq!(invoke.length(), 3);
        assert_eq!(Bytecode::MonitorEnter.length(), 1);
        assert_eq!(Bytecode::NewArray.length(), 2);
        assert_eq!(Bytecode::MultiANewArray { dimensions: 2 }.length(), 4);
    }

    #[test]
    fn test_bytecode_lookup() {
        let method = sample(MethodFlags::empty());
        assert!(method.bytecode_at(0).is_some());
        assert!(method.bytecode_at(1).is_none());
    }
}
