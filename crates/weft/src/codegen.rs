//! Bytecode emission.
//!
//! `CodeGen` builds rewritten function bodies: plain instruction emission
//! with label-patched jumps, plus the structured extractions the break
//! protocols need (resume functions, loop bodies, whole-loop functions)
//! and the dummy-variable fallback.
//!
//! Jump operands are absolute instruction indexes in the emitted list;
//! forward references go through [`LabelId`]s resolved at `gen_code` time.

use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use crate::{
    bytecode::{analysis_inputs, ArgKind, CodeObject, Instruction, Opcode},
    error::{ExecError, ExecResult},
    guard::Guard,
    host::{values_equal, Frame, FunctionObject, HostValue},
};

/// A forward-reference jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(usize);

/// Where a copied jump should land in the emitted code.
#[derive(Debug, Clone, Copy)]
pub enum JumpTarget {
    /// An absolute index already known.
    Absolute(usize),
    /// A label bound later.
    Label(LabelId),
}

#[derive(Debug, Clone, Copy)]
enum GenArg {
    Raw(u32),
    Label(LabelId),
}

#[derive(Debug, Clone, Copy)]
struct GenInstr {
    opcode: Opcode,
    arg: GenArg,
    line: u32,
}

/// The original frame context resume functions are cut from.
#[derive(Debug, Clone)]
struct SourceContext {
    code: Rc<CodeObject>,
    globals: Rc<RefCell<IndexMap<String, HostValue>>>,
}

/// Emits instructions and assembles code objects.
#[derive(Debug)]
pub struct CodeGen {
    name: String,
    source: Option<SourceContext>,
    instrs: Vec<GenInstr>,
    consts: Vec<HostValue>,
    names: Vec<String>,
    varnames: Vec<String>,
    /// Parameter names; must stay a prefix of `varnames`.
    params: Vec<String>,
    labels: Vec<Option<usize>>,
    current_line: u32,
}

impl CodeGen {
    /// Creates a bare generator emitting under `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            instrs: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            params: Vec::new(),
            labels: Vec::new(),
            current_line: 0,
        }
    }

    /// Creates a generator for assembling a standalone function body with
    /// the given parameters.
    #[must_use]
    pub fn new_function(name: &str, params: &[&str]) -> Self {
        let mut gen = Self::new(name);
        gen.set_params(params.iter().map(|p| (*p).to_string()).collect());
        gen
    }

    /// Attaches the original frame so resume extraction can see it.
    pub fn set_frame(&mut self, frame: &Frame) {
        self.source = Some(SourceContext {
            code: Rc::clone(&frame.code),
            globals: Rc::clone(&frame.globals),
        });
    }

    /// Declares the parameter list; parameters occupy the leading
    /// `varnames` slots.
    fn set_params(&mut self, params: Vec<String>) {
        assert!(self.instrs.is_empty(), "declare parameters before emitting");
        for name in &params {
            self.intern_varname(name);
        }
        self.params = params;
    }

    /// Sets the source line recorded on subsequent instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Current number of emitted instructions.
    #[must_use]
    pub fn instr_count(&self) -> usize {
        self.instrs.len()
    }

    fn intern_varname(&mut self, name: &str) -> u32 {
        intern(&mut self.varnames, name)
    }

    fn intern_name(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    fn add_const(&mut self, value: HostValue) -> u32 {
        if value.is_literal() {
            if let Some(idx) = self.consts.iter().position(|c| c.is_literal() && values_equal(c, &value)) {
                return u32::try_from(idx).expect("const index fits u32");
            }
        }
        let idx = u32::try_from(self.consts.len()).expect("const pool fits u32");
        self.consts.push(value);
        idx
    }

    /// Appends an instruction, returning its index.
    pub fn add_instr(&mut self, opcode: Opcode, arg: u32) -> usize {
        self.instrs.push(GenInstr {
            opcode,
            arg: GenArg::Raw(arg),
            line: self.current_line,
        });
        self.instrs.len() - 1
    }

    /// Appends a jump whose target is a label.
    pub fn add_jump(&mut self, opcode: Opcode, label: LabelId) -> usize {
        debug_assert!(opcode.is_jump(), "label operands are only valid on jumps");
        self.instrs.push(GenInstr {
            opcode,
            arg: GenArg::Label(label),
            line: self.current_line,
        });
        self.instrs.len() - 1
    }

    /// Removes the most recently emitted instruction.
    pub fn pop_instr(&mut self) {
        self.instrs.pop();
    }

    /// Allocates an unbound label.
    #[must_use]
    pub fn new_label(&mut self) -> LabelId {
        self.labels.push(None);
        LabelId(self.labels.len() - 1)
    }

    /// Binds a label to the next emitted instruction.
    pub fn bind_label(&mut self, label: LabelId) {
        self.labels[label.0] = Some(self.instrs.len());
    }

    pub fn gen_load_const(&mut self, value: HostValue) {
        let idx = self.add_const(value);
        self.add_instr(Opcode::LoadConst, idx);
    }

    /// Loads an arbitrary object through the constant pool. The name is
    /// a debugging courtesy and does not affect emission.
    pub fn gen_load_object(&mut self, value: HostValue, _name: &str) {
        self.gen_load_const(value);
    }

    pub fn gen_load_fast(&mut self, name: &str) {
        let idx = self.intern_varname(name);
        self.add_instr(Opcode::LoadFast, idx);
    }

    pub fn gen_store_fast(&mut self, name: &str) {
        let idx = self.intern_varname(name);
        self.add_instr(Opcode::StoreFast, idx);
    }

    pub fn gen_load_global(&mut self, name: &str) {
        let idx = self.intern_name(name);
        self.add_instr(Opcode::LoadGlobal, idx);
    }

    pub fn gen_load_builtin(&mut self, name: &str) {
        let idx = self.intern_name(name);
        self.add_instr(Opcode::LoadBuiltin, idx);
    }

    pub fn gen_load_attr(&mut self, name: &str) {
        let idx = self.intern_name(name);
        self.add_instr(Opcode::LoadAttr, idx);
    }

    pub fn gen_load_method(&mut self, name: &str) {
        let idx = self.intern_name(name);
        self.add_instr(Opcode::LoadMethod, idx);
    }

    /// `TOS1[TOS]`.
    pub fn gen_subscribe(&mut self) {
        self.add_instr(Opcode::BinarySubscr, 0);
    }

    pub fn gen_call_function(&mut self, argc: u32) {
        self.add_instr(Opcode::CallFunction, argc);
    }

    pub fn gen_return(&mut self) {
        self.add_instr(Opcode::ReturnValue, 0);
    }

    pub fn gen_pop_top(&mut self) {
        self.add_instr(Opcode::PopTop, 0);
    }

    pub fn gen_unpack_sequence(&mut self, count: u32) {
        self.add_instr(Opcode::UnpackSequence, count);
    }

    pub fn gen_build_tuple(&mut self, count: u32) {
        self.add_instr(Opcode::BuildTuple, count);
    }

    /// Rotates the top `n` stack entries (TOS moves below the other n-1).
    pub fn gen_rot_n(&mut self, n: u32) {
        match n {
            0 | 1 => {}
            2 => {
                self.add_instr(Opcode::RotTwo, 0);
            }
            3 => {
                self.add_instr(Opcode::RotThree, 0);
            }
            4 => {
                self.add_instr(Opcode::RotFour, 0);
            }
            _ => {
                self.add_instr(Opcode::RotN, n);
            }
        }
    }

    /// Copies instructions verbatim (counts and flags only; operands
    /// indexing the source tables must go through [`Self::copy_instr`]).
    pub fn add_pure_instructions(&mut self, instrs: &[Instruction]) {
        for instr in instrs {
            debug_assert_eq!(instr.opcode.arg_kind(), ArgKind::Raw, "pure copies cannot reference tables");
            self.instrs.push(GenInstr {
                opcode: instr.opcode,
                arg: GenArg::Raw(instr.arg),
                line: instr.line,
            });
        }
    }

    /// Copies one instruction from `src`, re-interning table operands.
    ///
    /// Jump operands must be supplied by the caller since only it knows
    /// where copied control flow should land.
    pub fn copy_instr(&mut self, instr: Instruction, src: &CodeObject, jump: Option<JumpTarget>) -> ExecResult<()> {
        let arg = match instr.opcode.arg_kind() {
            ArgKind::Varname => {
                let name = src
                    .varname(instr.arg)
                    .ok_or_else(|| ExecError::inner("copied instruction has a bad varname operand"))?;
                GenArg::Raw(self.intern_varname(name))
            }
            ArgKind::Name => {
                let name = src
                    .name_at(instr.arg)
                    .ok_or_else(|| ExecError::inner("copied instruction has a bad name operand"))?;
                GenArg::Raw(self.intern_name(name))
            }
            ArgKind::Const => {
                let value = src
                    .consts
                    .get(instr.arg as usize)
                    .ok_or_else(|| ExecError::inner("copied instruction has a bad const operand"))?;
                GenArg::Raw(self.add_const(value.clone()))
            }
            ArgKind::Jump => match jump.ok_or_else(|| ExecError::inner("copied jump needs a remapped target"))? {
                JumpTarget::Absolute(index) => {
                    GenArg::Raw(u32::try_from(index).map_err(|_| ExecError::inner("jump target overflows u32"))?)
                }
                JumpTarget::Label(label) => GenArg::Label(label),
            },
            ArgKind::Raw => GenArg::Raw(instr.arg),
        };
        self.instrs.push(GenInstr {
            opcode: instr.opcode,
            arg,
            line: instr.line,
        });
        Ok(())
    }

    /// Assembles the emitted instructions into a code object.
    ///
    /// # Panics
    ///
    /// Panics if a label was never bound; that is a bug at the emission
    /// site, not a runtime condition.
    #[must_use]
    pub fn gen_code(&self) -> CodeObject {
        let instructions: Vec<Instruction> = self
            .instrs
            .iter()
            .map(|gi| {
                let arg = match gi.arg {
                    GenArg::Raw(arg) => arg,
                    GenArg::Label(label) => {
                        let index = self.labels[label.0].expect("unbound label at assembly");
                        u32::try_from(index).expect("label index fits u32")
                    }
                };
                Instruction {
                    opcode: gi.opcode,
                    arg,
                    line: gi.line,
                }
            })
            .collect();
        CodeObject {
            name: self.name.clone(),
            instructions,
            consts: self.consts.clone(),
            names: self.names.clone(),
            varnames: self.varnames.clone(),
            argcount: self.params.len(),
            has_varargs: false,
            has_varkw: false,
            first_line: 0,
        }
    }

    fn require_source(&self) -> ExecResult<&SourceContext> {
        self.source
            .as_ref()
            .ok_or_else(|| ExecError::inner("code generator has no source frame attached"))
    }

    /// Builds the resume function continuing the original code at
    /// `index` with `stack_size` values handed in as leading parameters.
    ///
    /// Returns `None` when the tail is a bare return of the stack top;
    /// the caller then returns in place instead of calling a resume
    /// function. The second element is the list of live local names the
    /// resume function takes after the stack parameters.
    pub fn gen_resume_fn_at(
        &self,
        index: usize,
        stack_size: usize,
    ) -> ExecResult<Option<(Rc<FunctionObject>, Vec<String>)>> {
        let src = self.require_source()?;
        let code = &src.code;
        if index >= code.instructions.len() {
            return Ok(None);
        }
        if code.instructions[index].opcode == Opcode::ReturnValue && stack_size == 1 {
            return Ok(None);
        }

        let inputs = analysis_inputs(code, index);
        let stack_params: Vec<String> = (0..stack_size).map(|i| format!("#stack_{i}")).collect();
        let mut gen = Self::new(&format!("{}_resume_{index}", code.name));
        let mut params = stack_params.clone();
        params.extend(inputs.iter().cloned());
        gen.set_params(params);

        for name in &stack_params {
            gen.gen_load_fast(name);
        }
        // Jump over the copied body to the resume point.
        let prefix = stack_size + 1;
        gen.add_instr(Opcode::JumpAbsolute, u32::try_from(prefix + index).expect("resume target fits u32"));
        for instr in &code.instructions {
            let jump = instr
                .jump_target()
                .map(|target| JumpTarget::Absolute(prefix + target));
            gen.copy_instr(*instr, code, jump)?;
        }

        let function = Rc::new(FunctionObject {
            name: gen.name.clone(),
            code: Rc::new(gen.gen_code()),
            globals: Rc::clone(&src.globals),
            defaults: Vec::new(),
            closure: Vec::new(),
        });
        Ok(Some((function, inputs)))
    }

    /// Builds the loop-body function for the for-loop break protocol.
    ///
    /// The function takes the loop's read/written locals plus a break
    /// flag, runs one iteration body, and returns the same tuple with the
    /// flag indicating continue (`True`) or break (`False`).
    pub fn gen_loop_body_between(
        &self,
        for_iter: usize,
        body_start: usize,
        loop_end: usize,
    ) -> ExecResult<(Rc<FunctionObject>, Vec<String>)> {
        let src = self.require_source()?;
        let code = &src.code;
        let locals = rw_locals(code, body_start, loop_end);

        let mut gen = Self::new(&format!("{}_loop_body", code.name));
        let mut params = locals.clone();
        params.push("#break_flag".to_string());
        gen.set_params(params);

        let continue_label = gen.new_label();
        let break_label = gen.new_label();
        for instr in &code.instructions[body_start..loop_end] {
            let jump = match instr.jump_target() {
                None => None,
                Some(target) if target == for_iter => Some(JumpTarget::Label(continue_label)),
                Some(target) if target == loop_end => Some(JumpTarget::Label(break_label)),
                Some(target) if (body_start..loop_end).contains(&target) => {
                    Some(JumpTarget::Absolute(target - body_start))
                }
                Some(_) => {
                    return Err(ExecError::not_implemented(
                        "loop body jumps outside the loop",
                    ))
                }
            };
            gen.copy_instr(*instr, code, jump)?;
        }

        // Continue path: return (locals..., True).
        gen.bind_label(continue_label);
        for name in &locals {
            gen.gen_load_fast(name);
        }
        gen.gen_load_fast("#break_flag");
        gen.gen_build_tuple(u32::try_from(locals.len() + 1).expect("tuple arity fits u32"));
        gen.gen_return();

        // Break path: return (locals..., False).
        gen.bind_label(break_label);
        for name in &locals {
            gen.gen_load_fast(name);
        }
        gen.gen_load_const(HostValue::Bool(false));
        gen.gen_build_tuple(u32::try_from(locals.len() + 1).expect("tuple arity fits u32"));
        gen.gen_return();

        let function = Rc::new(FunctionObject {
            name: gen.name.clone(),
            code: Rc::new(gen.gen_code()),
            globals: Rc::clone(&src.globals),
            defaults: Vec::new(),
            closure: Vec::new(),
        });
        let mut inputs = locals;
        inputs.push("#break_flag".to_string());
        Ok((function, inputs))
    }

    /// Builds a function wrapping the whole loop `[for_iter, end)` for
    /// inline execution: parameters are the loop's locals plus the
    /// iterator, and the function returns the locals as a tuple.
    pub fn gen_for_loop_fn_between(&self, for_iter: usize, end: usize) -> ExecResult<(Rc<FunctionObject>, Vec<String>)> {
        let src = self.require_source()?;
        let code = &src.code;
        let locals = rw_locals(code, for_iter, end);

        let mut gen = Self::new(&format!("{}_for_loop", code.name));
        let mut params = locals.clone();
        params.push("#iter".to_string());
        gen.set_params(params);

        gen.gen_load_fast("#iter");
        let exit_label = gen.new_label();
        let prefix = 1usize;
        for instr in &code.instructions[for_iter..end] {
            let jump = match instr.jump_target() {
                None => None,
                Some(target) if target == end => Some(JumpTarget::Label(exit_label)),
                Some(target) if (for_iter..end).contains(&target) => {
                    Some(JumpTarget::Absolute(target - for_iter + prefix))
                }
                Some(_) => {
                    return Err(ExecError::not_implemented(
                        "loop jumps outside the extracted range",
                    ))
                }
            };
            gen.copy_instr(*instr, code, jump)?;
        }

        gen.bind_label(exit_label);
        for name in &locals {
            gen.gen_load_fast(name);
        }
        gen.gen_build_tuple(u32::try_from(locals.len()).expect("tuple arity fits u32"));
        gen.gen_return();

        let function = Rc::new(FunctionObject {
            name: gen.name.clone(),
            code: Rc::new(gen.gen_code()),
            globals: Rc::clone(&src.globals),
            defaults: Vec::new(),
            closure: Vec::new(),
        });
        let mut inputs = locals;
        inputs.push("#iter".to_string());
        Ok((function, inputs))
    }

    /// The fallback body used when translation gives up: a fresh copy of
    /// the original code under an always-true guard. Running it replays
    /// original semantics; calls inside it still reach the eval hook.
    pub fn replace_dummy_variable(&self) -> ExecResult<(Rc<CodeObject>, Guard)> {
        let src = self.require_source()?;
        Ok((Rc::new((*src.code).clone()), Guard::always_true()))
    }
}

fn intern(table: &mut Vec<String>, name: &str) -> u32 {
    if let Some(idx) = table.iter().position(|existing| existing == name) {
        return u32::try_from(idx).expect("table index fits u32");
    }
    table.push(name.to_string());
    u32::try_from(table.len() - 1).expect("table fits u32")
}

/// Local names read or written in `[start, end)`, in `varnames` order.
fn rw_locals(code: &CodeObject, start: usize, end: usize) -> Vec<String> {
    let mut used: Vec<&str> = Vec::new();
    for instr in &code.instructions[start..end] {
        if matches!(instr.opcode, Opcode::LoadFast | Opcode::StoreFast) {
            if let Some(name) = code.varname(instr.arg) {
                if !used.contains(&name) {
                    used.push(name);
                }
            }
        }
    }
    code.varnames
        .iter()
        .filter(|name| used.contains(&name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_assemble() {
        let mut gen = CodeGen::new("f");
        gen.gen_load_const(HostValue::Int(1));
        gen.gen_load_fast("x");
        gen.add_instr(Opcode::BinaryAdd, 0);
        gen.gen_return();
        let code = gen.gen_code();
        assert_eq!(code.instructions.len(), 4);
        assert_eq!(code.instructions[0].opcode, Opcode::LoadConst);
        assert_eq!(code.varnames, vec!["x".to_string()]);
        assert!(values_equal(&code.consts[0], &HostValue::Int(1)));
    }

    #[test]
    fn test_labels_resolve_forward() {
        let mut gen = CodeGen::new("f");
        let label = gen.new_label();
        gen.add_jump(Opcode::JumpAbsolute, label);
        gen.gen_load_const(HostValue::None);
        gen.bind_label(label);
        gen.gen_return();
        let code = gen.gen_code();
        assert_eq!(code.instructions[0].arg, 2);
    }

    #[test]
    fn test_literal_consts_are_deduplicated() {
        let mut gen = CodeGen::new("f");
        gen.gen_load_const(HostValue::Int(7));
        gen.gen_load_const(HostValue::Int(7));
        let code = gen.gen_code();
        assert_eq!(code.consts.len(), 1);
        assert_eq!(code.instructions[0].arg, code.instructions[1].arg);
    }

    #[test]
    fn test_rot_n_uses_dedicated_ops_when_small() {
        let mut gen = CodeGen::new("f");
        gen.gen_rot_n(2);
        gen.gen_rot_n(6);
        let code = gen.gen_code();
        assert_eq!(code.instructions[0].opcode, Opcode::RotTwo);
        assert_eq!(code.instructions[1].opcode, Opcode::RotN);
        assert_eq!(code.instructions[1].arg, 6);
    }
}
