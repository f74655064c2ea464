//! Bytecode instruction set and code objects.
//!
//! The translator targets a stack machine with structured instructions:
//! every instruction is an [`Opcode`] plus one `u32` operand. Jump
//! operands are absolute instruction indexes, which keeps the simulator's
//! `lasti` bookkeeping and the code generator's label patching simple.
//!
//! The module also carries the static analyses the break protocols need:
//! per-opcode stack effects (for balancing a loop body) and backward
//! live-variable analysis (for computing resume-function inputs).

use ahash::AHashSet;
use strum::{Display, IntoStaticStr};

use crate::host::HostValue;

/// `MAKE_FUNCTION` flag bits.
pub mod make_function_flags {
    /// A tuple of positional default values is on the stack.
    pub const HAS_DEFAULTS: u32 = 0x01;
    /// A dict of keyword-only defaults is on the stack (not translatable).
    pub const HAS_KWDEFAULTS: u32 = 0x02;
    /// An annotations mapping is on the stack (consumed and ignored).
    pub const HAS_ANNOTATIONS: u32 = 0x04;
    /// A tuple of closure cells is on the stack.
    pub const HAS_CLOSURE: u32 = 0x08;
}

/// `FORMAT_VALUE` flag bits.
pub mod format_value_flags {
    /// Mask selecting the conversion kind.
    pub const FVC_MASK: u32 = 0x3;
    pub const FVC_NONE: u32 = 0x0;
    pub const FVC_STR: u32 = 0x1;
    pub const FVC_REPR: u32 = 0x2;
    pub const FVC_ASCII: u32 = 0x3;
    /// Set when a format spec is on the stack above the value.
    pub const FVS_HAVE_SPEC: u32 = 0x4;
}

/// `CALL_FUNCTION_EX` flag bits.
pub mod call_function_ex_flags {
    /// Set when a kwargs dict is on the stack above the args tuple.
    pub const HAS_KWARGS: u32 = 0x01;
}

/// The instruction set the simulator models.
///
/// Opcodes not present here cannot be represented at all; opcodes present
/// here but outside the simulator's dispatch table graph-break when
/// encountered. `CallSegment` is a pseudo-op that only the code generator
/// emits; it calls a compiled graph segment by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum Opcode {
    // Scope loads and stores. Operand indexes the matching name table.
    LoadFast,
    LoadGlobal,
    LoadConst,
    LoadName,
    LoadBuiltin,
    StoreFast,
    StoreName,

    // Attribute and method access. Operand indexes `names`.
    LoadAttr,
    LoadMethod,

    // Unary operators.
    UnaryPositive,
    UnaryNegative,
    UnaryInvert,

    // Binary operators.
    BinaryPower,
    BinaryMultiply,
    BinaryMatrixMultiply,
    BinaryFloorDivide,
    BinaryTrueDivide,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryOr,
    BinaryXor,

    // Inplace operators (same host semantics, result keeps the LHS name).
    InplacePower,
    InplaceMultiply,
    InplaceMatrixMultiply,
    InplaceFloorDivide,
    InplaceTrueDivide,
    InplaceModulo,
    InplaceAdd,
    InplaceSubtract,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceOr,
    InplaceXor,

    // Subscripts.
    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,

    // Comparisons. `CompareOp`'s operand encodes a [`CmpOp`](crate::ops::CmpOp).
    CompareOp,
    IsOp,

    // Container construction.
    BuildList,
    BuildTuple,
    BuildSet,
    BuildMap,
    BuildConstKeyMap,
    BuildString,
    BuildSlice,
    BuildListUnpack,
    BuildTupleUnpack,
    BuildTupleUnpackWithCall,
    BuildMapUnpack,
    BuildMapUnpackWithCall,

    // Calls.
    CallFunction,
    CallFunctionKw,
    CallFunctionEx,
    CallMethod,
    MakeFunction,

    // Iteration.
    GetIter,
    ForIter,
    UnpackSequence,

    // String formatting.
    FormatValue,

    // Jumps. Operand is an absolute instruction index.
    JumpForward,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,

    // Returns and pure stack manipulation.
    ReturnValue,
    Nop,
    PopTop,
    RotTwo,
    RotThree,
    RotFour,
    /// Rotate the top `arg` values (generated code only; the simulator
    /// never sees it because rewritten bodies are executed, not re-traced).
    RotN,
    DupTop,
    DupTopTwo,

    // In-place container updates.
    DictUpdate,
    DictMerge,
    ListExtend,
    ListToTuple,

    // Pseudo-op emitted by the code generator: call the compiled graph
    // segment named by the operand. Never appears in source code objects.
    CallSegment,
}

impl Opcode {
    /// Whether the operand is an absolute jump target.
    #[must_use]
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::JumpForward
                | Self::JumpAbsolute
                | Self::PopJumpIfFalse
                | Self::PopJumpIfTrue
                | Self::JumpIfFalseOrPop
                | Self::JumpIfTrueOrPop
                | Self::ForIter
        )
    }

    /// Whether control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::JumpForward | Self::JumpAbsolute | Self::ReturnValue)
    }

    /// Net stack effect of executing this opcode with operand `arg`.
    ///
    /// `jump` selects the branch taken for conditional-effect opcodes
    /// (`ForIter` and the or-pop jumps). `CallSegment`'s effect depends on
    /// its segment and is reported as 0; segment calls only appear in
    /// generated code, which is never re-scanned for stack balance.
    #[must_use]
    pub fn stack_effect(self, arg: u32, jump: bool) -> i32 {
        let arg_i = arg as i32;
        match self {
            Self::LoadFast | Self::LoadGlobal | Self::LoadConst | Self::LoadName | Self::LoadBuiltin => 1,
            Self::StoreFast | Self::StoreName => -1,
            Self::LoadAttr => 0,
            Self::LoadMethod => 1,
            Self::UnaryPositive | Self::UnaryNegative | Self::UnaryInvert => 0,
            Self::BinaryPower
            | Self::BinaryMultiply
            | Self::BinaryMatrixMultiply
            | Self::BinaryFloorDivide
            | Self::BinaryTrueDivide
            | Self::BinaryModulo
            | Self::BinaryAdd
            | Self::BinarySubtract
            | Self::BinaryLshift
            | Self::BinaryRshift
            | Self::BinaryAnd
            | Self::BinaryOr
            | Self::BinaryXor
            | Self::InplacePower
            | Self::InplaceMultiply
            | Self::InplaceMatrixMultiply
            | Self::InplaceFloorDivide
            | Self::InplaceTrueDivide
            | Self::InplaceModulo
            | Self::InplaceAdd
            | Self::InplaceSubtract
            | Self::InplaceLshift
            | Self::InplaceRshift
            | Self::InplaceAnd
            | Self::InplaceOr
            | Self::InplaceXor => -1,
            Self::BinarySubscr => -1,
            Self::StoreSubscr => -3,
            Self::DeleteSubscr => -2,
            Self::CompareOp | Self::IsOp => -1,
            Self::BuildList | Self::BuildTuple | Self::BuildSet | Self::BuildString => 1 - arg_i,
            Self::BuildMap => 1 - 2 * arg_i,
            Self::BuildConstKeyMap => -arg_i,
            Self::BuildSlice => 1 - arg_i,
            Self::BuildListUnpack
            | Self::BuildTupleUnpack
            | Self::BuildTupleUnpackWithCall
            | Self::BuildMapUnpack
            | Self::BuildMapUnpackWithCall => 1 - arg_i,
            Self::CallFunction => -arg_i,
            Self::CallFunctionKw | Self::CallMethod => -arg_i - 1,
            Self::CallFunctionEx => {
                if arg & call_function_ex_flags::HAS_KWARGS != 0 {
                    -2
                } else {
                    -1
                }
            }
            Self::MakeFunction => -1 - (arg & 0xf).count_ones() as i32,
            Self::GetIter | Self::ListToTuple => 0,
            Self::ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            Self::UnpackSequence => arg_i - 1,
            Self::FormatValue => {
                if arg & format_value_flags::FVS_HAVE_SPEC != 0 {
                    -1
                } else {
                    0
                }
            }
            Self::JumpForward | Self::JumpAbsolute => 0,
            Self::PopJumpIfFalse | Self::PopJumpIfTrue => -1,
            Self::JumpIfFalseOrPop | Self::JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            Self::ReturnValue | Self::PopTop => -1,
            Self::Nop | Self::RotTwo | Self::RotThree | Self::RotFour | Self::RotN => 0,
            Self::DupTop => 1,
            Self::DupTopTwo => 2,
            Self::DictUpdate | Self::DictMerge | Self::ListExtend => -1,
            Self::CallSegment => 0,
        }
    }
}

/// What table an opcode's operand indexes, for instruction copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Indexes `varnames`.
    Varname,
    /// Indexes `names`.
    Name,
    /// Indexes `consts`.
    Const,
    /// An absolute jump target.
    Jump,
    /// A plain count or flag word.
    Raw,
}

impl Opcode {
    /// The operand's table, so copied instructions can be re-interned.
    #[must_use]
    pub fn arg_kind(self) -> ArgKind {
        match self {
            Self::LoadFast | Self::StoreFast => ArgKind::Varname,
            Self::LoadGlobal
            | Self::LoadName
            | Self::LoadBuiltin
            | Self::StoreName
            | Self::LoadAttr
            | Self::LoadMethod => ArgKind::Name,
            Self::LoadConst => ArgKind::Const,
            op if op.is_jump() => ArgKind::Jump,
            _ => ArgKind::Raw,
        }
    }
}

/// One instruction: opcode, operand, and the source line it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: u32,
    pub line: u32,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, arg: u32) -> Self {
        Self { opcode, arg, line: 0 }
    }

    /// The absolute jump target, for jump opcodes.
    #[must_use]
    pub fn jump_target(&self) -> Option<usize> {
        self.opcode.is_jump().then_some(self.arg as usize)
    }
}

/// A compiled function body: instructions plus its constant/name tables.
///
/// `varnames` lists local variable names with parameters first; when
/// `has_varargs`/`has_varkw` are set the `*args`/`**kwargs` slots follow
/// the declared parameters in that order.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub consts: Vec<HostValue>,
    /// Global, attribute, and method names.
    pub names: Vec<String>,
    /// Local variable names; the first `argcount` are parameters.
    pub varnames: Vec<String>,
    pub argcount: usize,
    pub has_varargs: bool,
    pub has_varkw: bool,
    pub first_line: u32,
}

impl CodeObject {
    /// Resolves a `varnames` operand to its name.
    pub fn varname(&self, arg: u32) -> Option<&str> {
        self.varnames.get(arg as usize).map(String::as_str)
    }

    /// Resolves a `names` operand to its name.
    pub fn name_at(&self, arg: u32) -> Option<&str> {
        self.names.get(arg as usize).map(String::as_str)
    }

    /// Source line of the instruction at `index`, for diagnostics.
    #[must_use]
    pub fn line_of(&self, index: usize) -> u32 {
        self.instructions.get(index).map_or(self.first_line, |i| i.line)
    }

    /// Total number of parameter slots, including `*args`/`**kwargs`.
    #[must_use]
    pub fn param_slots(&self) -> usize {
        self.argcount + usize::from(self.has_varargs) + usize::from(self.has_varkw)
    }
}

/// Computes the local names a resume point reads before writing.
///
/// Backward may-liveness over the instruction list: a name is live at
/// `start` if some path from `start` reads it before any write. The result
/// drives resume-function parameter lists, so the order is normalized to
/// the code object's `varnames` order (names outside `varnames` follow,
/// sorted).
#[must_use]
pub fn analysis_inputs(code: &CodeObject, start: usize) -> Vec<String> {
    let instrs = &code.instructions;
    let mut live_in: Vec<AHashSet<String>> = vec![AHashSet::new(); instrs.len() + 1];

    // Fixpoint: instruction count is small, so simple iteration suffices.
    let mut changed = true;
    while changed {
        changed = false;
        for idx in (0..instrs.len()).rev() {
            let instr = &instrs[idx];
            let mut out: AHashSet<String> = AHashSet::new();
            if !instr.opcode.is_terminal() {
                out.extend(live_in[idx + 1].iter().cloned());
            }
            if let Some(target) = instr.jump_target() {
                if let Some(set) = live_in.get(target) {
                    out.extend(set.iter().cloned());
                }
            }
            match instr.opcode {
                Opcode::StoreFast => {
                    if let Some(name) = code.varname(instr.arg) {
                        out.remove(name);
                    }
                }
                Opcode::StoreName => {
                    if let Some(name) = code.name_at(instr.arg) {
                        out.remove(name);
                    }
                }
                Opcode::LoadFast => {
                    if let Some(name) = code.varname(instr.arg) {
                        out.insert(name.to_string());
                    }
                }
                Opcode::LoadName => {
                    if let Some(name) = code.name_at(instr.arg) {
                        out.insert(name.to_string());
                    }
                }
                _ => {}
            }
            if out != live_in[idx] {
                live_in[idx] = out;
                changed = true;
            }
        }
    }

    let live = live_in.get(start).cloned().unwrap_or_default();
    let mut ordered: Vec<String> = code.varnames.iter().filter(|n| live.contains(*n)).cloned().collect();
    let mut rest: Vec<String> = live
        .into_iter()
        .filter(|n| !code.varnames.contains(n))
        .collect();
    rest.sort();
    ordered.extend(rest);
    ordered
}

/// Renders an instruction listing for trace logs.
#[must_use]
pub fn instrs_info(code: &CodeObject) -> String {
    use std::fmt::Write;

    let targets: AHashSet<usize> = code.instructions.iter().filter_map(Instruction::jump_target).collect();
    let mut out = String::new();
    for (idx, instr) in code.instructions.iter().enumerate() {
        let marker = if targets.contains(&idx) { ">>" } else { "  " };
        let _ = writeln!(out, "{marker} {idx:>4} {:<24} {}", instr.opcode.to_string(), instr.arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_with(instructions: Vec<Instruction>, varnames: Vec<&str>) -> CodeObject {
        CodeObject {
            name: "test".to_string(),
            instructions,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: varnames.into_iter().map(str::to_string).collect(),
            argcount: 0,
            has_varargs: false,
            has_varkw: false,
            first_line: 1,
        }
    }

    #[test]
    fn test_stack_effect_calls() {
        assert_eq!(Opcode::CallFunction.stack_effect(2, false), -2);
        assert_eq!(Opcode::CallMethod.stack_effect(1, false), -2);
        assert_eq!(Opcode::CallFunctionKw.stack_effect(3, false), -4);
        assert_eq!(Opcode::CallFunctionEx.stack_effect(1, false), -2);
    }

    #[test]
    fn test_stack_effect_for_iter_branches() {
        assert_eq!(Opcode::ForIter.stack_effect(0, false), 1);
        assert_eq!(Opcode::ForIter.stack_effect(0, true), -1);
    }

    #[test]
    fn test_make_function_effect_counts_flag_pops() {
        // code + name always popped; defaults and closure add one pop each.
        assert_eq!(Opcode::MakeFunction.stack_effect(0, false), -1);
        assert_eq!(
            Opcode::MakeFunction
                .stack_effect(make_function_flags::HAS_DEFAULTS | make_function_flags::HAS_CLOSURE, false),
            -3
        );
    }

    #[test]
    fn test_analysis_inputs_reads_before_writes() {
        // 0: LoadFast x      (reads x)
        // 1: StoreFast y     (writes y)
        // 2: LoadFast y      (reads y, already written)
        // 3: ReturnValue
        let code = code_with(
            vec![
                Instruction::new(Opcode::LoadFast, 0),
                Instruction::new(Opcode::StoreFast, 1),
                Instruction::new(Opcode::LoadFast, 1),
                Instruction::new(Opcode::ReturnValue, 0),
            ],
            vec!["x", "y"],
        );
        assert_eq!(analysis_inputs(&code, 0), vec!["x".to_string()]);
        // From index 2, only y is read.
        assert_eq!(analysis_inputs(&code, 2), vec!["y".to_string()]);
    }

    #[test]
    fn test_analysis_inputs_follows_branches() {
        // 0: PopJumpIfFalse -> 3
        // 1: LoadFast a
        // 2: ReturnValue
        // 3: LoadFast b
        // 4: ReturnValue
        let code = code_with(
            vec![
                Instruction::new(Opcode::PopJumpIfFalse, 3),
                Instruction::new(Opcode::LoadFast, 0),
                Instruction::new(Opcode::ReturnValue, 0),
                Instruction::new(Opcode::LoadFast, 1),
                Instruction::new(Opcode::ReturnValue, 0),
            ],
            vec!["a", "b"],
        );
        assert_eq!(analysis_inputs(&code, 0), vec!["a".to_string(), "b".to_string()]);
    }
}
