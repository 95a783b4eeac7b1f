//! The planter lowers a declarative instruction list into a threaded code
//! stream.
//!
//! One pass over the instructions: each one maps to its `(strict, lazy)`
//! opcode pair, the lazy column is chosen when the instruction references a
//! dependency declared lazy in the bundle, and an opcode-specific method
//! appends the opcode word plus its materialised operands. Labels emit no
//! code; they record the current offset and patch any pending forward
//! references. A `HALT` guard terminates every stream.

use std::collections::HashMap;

use bytecode::{FunctionSource, Opcode, SourceInstruction};
use object::Cell;
use tracing::{debug, trace};

use crate::error::{Result, VmError};
use crate::machine::Machine;
use crate::sys;

/// A compiled function, ready to be moved into the heap.
#[derive(Debug, Clone)]
pub struct PlantedFunction {
    pub nlocals: u16,
    pub nparams: u16,
    pub code: Vec<Cell>,
}

/// Compile `source` against the global table and the dependency-laziness
/// map of the binding being planted.
pub fn plant(
    machine: &mut Machine,
    idname: &str,
    deps: &HashMap<String, bool>,
    source: &FunctionSource,
) -> Result<PlantedFunction> {
    debug!(binding = idname, "planting instructions");

    if source.nlocals < 0
        || source.nlocals > u16::MAX as i64
        || source.nparams < 0
        || source.nparams > source.nlocals
    {
        return Err(VmError::BadFunctionHeader {
            nlocals: source.nlocals,
            nparams: source.nparams,
        });
    }

    let mut planter = Planter {
        machine,
        deps,
        nlocals: source.nlocals,
        code: Vec::new(),
        labels: HashMap::new(),
        forward_refs: HashMap::new(),
    };

    for inst in &source.instructions {
        planter.plant_instruction(inst)?;
    }
    planter.validate_forward_references()?;

    // Guard the end of the stream.
    planter.code.push(Cell::from_raw(Opcode::Halt.word()));

    Ok(PlantedFunction {
        nlocals: source.nlocals as u16,
        nparams: source.nparams as u16,
        code: planter.code,
    })
}

struct Planter<'a> {
    machine: &'a mut Machine,
    deps: &'a HashMap<String, bool>,
    nlocals: i64,
    code: Vec<Cell>,
    /// Label name → code offset of the word it targets.
    labels: HashMap<String, usize>,
    /// Label name → offsets of placeholder operands awaiting that label.
    forward_refs: HashMap<String, Vec<usize>>,
}

impl Planter<'_> {
    fn plant_instruction(&mut self, inst: &SourceInstruction) -> Result<()> {
        let (strict, lazy) = Opcode::from_spelling(&inst.kind)
            .ok_or_else(|| VmError::UnknownInstruction(inst.kind.clone()))?;

        let is_lazy = inst
            .name
            .as_deref()
            .is_some_and(|name| self.deps.get(name).copied().unwrap_or(false));
        let opcode = if is_lazy { lazy } else { strict };
        trace!(?opcode, kind = %inst.kind, "plant");

        // LABEL only records a position.
        if opcode == Opcode::Label {
            return self.plant_label(inst);
        }

        self.code.push(Cell::from_raw(opcode.word()));

        match opcode {
            Opcode::PushInt => self.plant_push_int(inst),
            Opcode::PushBool => self.plant_push_bool(inst),
            Opcode::PushString => self.plant_push_string(inst),
            Opcode::PopLocal
            | Opcode::PushLocal
            | Opcode::StackLength
            | Opcode::CheckBool => self.plant_local_offset(inst, opcode),
            Opcode::PushGlobal | Opcode::PushGlobalLazy => {
                self.plant_push_global(inst)
            }
            Opcode::CallGlobalCounted
            | Opcode::CallGlobalCountedLazy
            | Opcode::Done => self.plant_counted_global(inst, opcode),
            Opcode::SyscallCounted => self.plant_syscall(inst),
            Opcode::Goto | Opcode::IfNot => self.plant_jump(inst, opcode),
            Opcode::Return | Opcode::Halt => Ok(()),
            // LAUNCH is driver-only and LABEL was handled above.
            Opcode::Launch | Opcode::Label => {
                Err(VmError::UnknownInstruction(inst.kind.clone()))
            }
        }
    }

    /// Local slot `index` as a return-stack offset. The `+2` skips the
    /// return-address and function-object slots of the frame.
    fn local_offset(&self, index: i64) -> i64 {
        self.nlocals - index + 2
    }

    fn plant_label(&mut self, inst: &SourceInstruction) -> Result<()> {
        let name = require_value(inst, "label")?;
        let position = self.code.len();
        if self.labels.insert(name.to_string(), position).is_some() {
            return Err(VmError::DuplicateLabel(name.to_string()));
        }

        // Patch every forward reference that was waiting on this label.
        if let Some(refs) = self.forward_refs.remove(name) {
            for ref_pos in refs {
                let offset = position as i64 - (ref_pos as i64 + 1);
                self.code[ref_pos] = Cell::from_raw_i64(offset);
            }
        }
        Ok(())
    }

    fn plant_push_int(&mut self, inst: &SourceInstruction) -> Result<()> {
        let ivalue = inst.ivalue.ok_or(VmError::MissingOperand {
            opcode: "push.int",
            field: "ivalue",
        })?;
        self.code.push(Cell::from_i64(ivalue));
        Ok(())
    }

    fn plant_push_bool(&mut self, inst: &SourceInstruction) -> Result<()> {
        let spelling = require_value(inst, "push.bool")?;
        let value = match spelling {
            "true" => Cell::TRUE,
            "false" => Cell::FALSE,
            other => return Err(VmError::InvalidBoolLiteral(other.to_string())),
        };
        self.code.push(value);
        Ok(())
    }

    fn plant_push_string(&mut self, inst: &SourceInstruction) -> Result<()> {
        let literal = require_value(inst, "push.string")?;
        let cell = self.machine.allocate_string(literal)?;
        self.code.push(cell);
        Ok(())
    }

    fn plant_local_offset(
        &mut self,
        inst: &SourceInstruction,
        opcode: Opcode,
    ) -> Result<()> {
        let index = require_index(inst, opcode)?;
        self.code.push(Cell::from_raw_i64(self.local_offset(index)));
        Ok(())
    }

    fn plant_push_global(&mut self, inst: &SourceInstruction) -> Result<()> {
        let name = inst.name.as_deref().ok_or(VmError::MissingOperand {
            opcode: "push.global",
            field: "name",
        })?;
        let ident = self
            .machine
            .ident_address(name)
            .ok_or_else(|| VmError::UnknownGlobal(name.to_string()))?;
        self.code.push(Cell::from_raw_ptr(ident));
        Ok(())
    }

    fn plant_counted_global(
        &mut self,
        inst: &SourceInstruction,
        opcode: Opcode,
    ) -> Result<()> {
        let index = require_index(inst, opcode)?;
        let name = inst.name.as_deref().ok_or(VmError::MissingOperand {
            opcode: opcode_spelling(opcode),
            field: "name",
        })?;
        let ident = self
            .machine
            .ident_address(name)
            .ok_or_else(|| VmError::UnknownGlobal(name.to_string()))?;

        self.code.push(Cell::from_raw_i64(self.local_offset(index)));
        self.code.push(Cell::from_raw_ptr(ident));
        Ok(())
    }

    fn plant_syscall(&mut self, inst: &SourceInstruction) -> Result<()> {
        let index = require_index(inst, Opcode::SyscallCounted)?;
        let name = inst.name.as_deref().ok_or(VmError::MissingOperand {
            opcode: "syscall.counted",
            field: "name",
        })?;
        let sys_fn = sys::lookup(name)
            .ok_or_else(|| VmError::UnknownSysFunction(name.to_string()))?;

        self.code.push(Cell::from_raw_i64(self.local_offset(index)));
        self.code.push(Cell::from_raw(sys_fn as usize as u64));
        Ok(())
    }

    fn plant_jump(
        &mut self,
        inst: &SourceInstruction,
        opcode: Opcode,
    ) -> Result<()> {
        let label = require_value(inst, opcode_spelling(opcode))?;

        let operand_pos = self.code.len();
        self.code.push(Cell::from_raw_i64(0));

        match self.labels.get(label) {
            Some(&target) => {
                // Backward jump: resolve immediately.
                let offset = target as i64 - (operand_pos as i64 + 1);
                self.code[operand_pos] = Cell::from_raw_i64(offset);
            }
            None => {
                // Forward jump: leave the placeholder for plant_label.
                self.forward_refs
                    .entry(label.to_string())
                    .or_default()
                    .push(operand_pos);
            }
        }
        Ok(())
    }

    fn validate_forward_references(&self) -> Result<()> {
        if self.forward_refs.is_empty() {
            return Ok(());
        }
        let mut unresolved: Vec<&str> =
            self.forward_refs.keys().map(String::as_str).collect();
        unresolved.sort_unstable();
        Err(VmError::UnresolvedLabels(unresolved.join(", ")))
    }
}

fn require_value<'i>(
    inst: &'i SourceInstruction,
    opcode: &'static str,
) -> Result<&'i str> {
    inst.value.as_deref().ok_or(VmError::MissingOperand {
        opcode,
        field: "value",
    })
}

fn require_index(inst: &SourceInstruction, opcode: Opcode) -> Result<i64> {
    inst.index.ok_or(VmError::MissingOperand {
        opcode: opcode_spelling(opcode),
        field: "index",
    })
}

fn opcode_spelling(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Done => "done",
        Opcode::PushInt => "push.int",
        Opcode::PushString => "push.string",
        Opcode::PushBool => "push.bool",
        Opcode::PopLocal => "pop.local",
        Opcode::PushLocal => "push.local",
        Opcode::PushGlobal | Opcode::PushGlobalLazy => "push.global",
        Opcode::Launch => "launch",
        Opcode::CallGlobalCounted | Opcode::CallGlobalCountedLazy => {
            "call.global.counted"
        }
        Opcode::SyscallCounted => "syscall.counted",
        Opcode::StackLength => "stack.length",
        Opcode::CheckBool => "check.bool",
        Opcode::Goto => "goto",
        Opcode::IfNot => "if.not",
        Opcode::Return => "return",
        Opcode::Halt => "halt",
        Opcode::Label => "label",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineSettings;

    fn machine() -> Machine {
        Machine::new(MachineSettings::default()).unwrap()
    }

    fn plant_doc(
        machine: &mut Machine,
        deps: &HashMap<String, bool>,
        doc: serde_json::Value,
    ) -> Result<PlantedFunction> {
        let source: FunctionSource = serde_json::from_value(doc).unwrap();
        plant(machine, "test", deps, &source)
    }

    /// Walk the stream opcode by opcode; each word must decode and carry
    /// exactly its declared operand cells.
    fn walk(code: &[Cell]) -> Vec<Opcode> {
        let mut ops = Vec::new();
        let mut pos = 0;
        while pos < code.len() {
            let op = Opcode::try_from(code[pos].raw()).expect("opcode word");
            ops.push(op);
            pos += 1 + op.operand_count();
        }
        assert_eq!(pos, code.len(), "stream ends mid-instruction");
        ops
    }

    #[test]
    fn every_stream_ends_with_a_halt_guard() {
        let mut m = machine();
        let planted = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [{"type": "push.int", "ivalue": 1}]
            }),
        )
        .unwrap();
        let ops = walk(&planted.code);
        assert_eq!(ops, vec![Opcode::PushInt, Opcode::Halt]);
        assert_eq!(planted.code[1].to_i64(), 1);
    }

    #[test]
    fn camel_case_spellings_plant_identically() {
        let mut m = machine();
        let dotted = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 1, "nparams": 0,
                "instructions": [
                    {"type": "push.int", "ivalue": 3},
                    {"type": "pop.local", "index": 0}
                ]
            }),
        )
        .unwrap();
        let camel = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 1, "nparams": 0,
                "instructions": [
                    {"type": "PushInt", "ivalue": 3},
                    {"type": "PopLocal", "index": 0}
                ]
            }),
        )
        .unwrap();
        let raw = |p: &PlantedFunction| {
            p.code.iter().map(|c| c.raw()).collect::<Vec<_>>()
        };
        assert_eq!(raw(&dotted), raw(&camel));
    }

    #[test]
    fn local_offsets_fold_in_the_frame_slots() {
        let mut m = machine();
        let planted = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 4, "nparams": 0,
                "instructions": [
                    {"type": "push.local", "index": 0},
                    {"type": "push.local", "index": 3}
                ]
            }),
        )
        .unwrap();
        // offset = nlocals - index + 2
        assert_eq!(planted.code[1].raw_i64(), 6);
        assert_eq!(planted.code[3].raw_i64(), 3);
    }

    #[test]
    fn forward_jump_patches_relative_offset() {
        let mut m = machine();
        let planted = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [
                    {"type": "push.int", "ivalue": 1},
                    {"type": "goto", "value": "skip"},
                    {"type": "push.int", "ivalue": 999},
                    {"type": "label", "value": "skip"},
                    {"type": "push.int", "ivalue": 2}
                ]
            }),
        )
        .unwrap();
        // Layout: 0 PushInt, 1 (1), 2 Goto, 3 rel, 4 PushInt, 5 (999),
        // 6 PushInt (the label target), 7 (2), 8 Halt.
        // rel = target - (ref + 1) = 6 - 4 = 2.
        assert_eq!(planted.code[3].raw_i64(), 2);
    }

    #[test]
    fn backward_jump_emits_negative_offset() {
        let mut m = machine();
        let planted = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [
                    {"type": "label", "value": "top"},
                    {"type": "push.int", "ivalue": 1},
                    {"type": "goto", "value": "top"}
                ]
            }),
        )
        .unwrap();
        // Layout: 0 PushInt, 1 (1), 2 Goto, 3 rel; target 0, ref 3 → -4.
        assert_eq!(planted.code[3].raw_i64(), -4);
    }

    #[test]
    fn push_string_materialises_a_heap_object() {
        let mut m = machine();
        let planted = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [{"type": "push.string", "value": "lit"}]
            }),
        )
        .unwrap();
        let cell = planted.code[1];
        assert!(cell.is_ptr());
        assert_eq!(m.string_value(cell).unwrap(), "lit");
    }

    #[test]
    fn push_bool_accepts_only_canonical_spellings() {
        let mut m = machine();
        for (spelling, cell) in [("true", Cell::TRUE), ("false", Cell::FALSE)] {
            let planted = plant_doc(
                &mut m,
                &HashMap::new(),
                serde_json::json!({
                    "nlocals": 0, "nparams": 0,
                    "instructions": [{"type": "push.bool", "value": spelling}]
                }),
            )
            .unwrap();
            assert_eq!(planted.code[1], cell);
        }

        let err = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [{"type": "push.bool", "value": "True"}]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::InvalidBoolLiteral(s) if s == "True"));
    }

    #[test]
    fn lazy_column_follows_the_dependency_map() {
        let mut m = machine();
        m.define_global("f", Cell::UNDEF, false);

        let lazy_deps = HashMap::from([("f".to_string(), true)]);
        let planted = plant_doc(
            &mut m,
            &lazy_deps,
            serde_json::json!({
                "nlocals": 1, "nparams": 0,
                "instructions": [
                    {"type": "push.global", "name": "f"},
                    {"type": "call.global.counted", "index": 0, "name": "f"}
                ]
            }),
        )
        .unwrap();
        let ops = walk(&planted.code);
        assert_eq!(
            ops,
            vec![
                Opcode::PushGlobalLazy,
                Opcode::CallGlobalCountedLazy,
                Opcode::Halt
            ]
        );

        let strict_deps = HashMap::from([("f".to_string(), false)]);
        let planted = plant_doc(
            &mut m,
            &strict_deps,
            serde_json::json!({
                "nlocals": 1, "nparams": 0,
                "instructions": [
                    {"type": "push.global", "name": "f"},
                    {"type": "call.global.counted", "index": 0, "name": "f"}
                ]
            }),
        )
        .unwrap();
        let ops = walk(&planted.code);
        assert_eq!(
            ops,
            vec![
                Opcode::PushGlobal,
                Opcode::CallGlobalCounted,
                Opcode::Halt
            ]
        );
    }

    #[test]
    fn ident_operand_is_the_stable_global_address() {
        let mut m = machine();
        m.define_global("g", Cell::UNDEF, false);
        let expected = m.ident_address("g").unwrap();

        let planted = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [{"type": "push.global", "name": "g"}]
            }),
        )
        .unwrap();
        assert_eq!(planted.code[1].raw_ptr::<object::Ident>(), expected);
    }

    #[test]
    fn unknown_spelling_fails() {
        let mut m = machine();
        let err = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [{"type": "push.intt", "ivalue": 1}]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::UnknownInstruction(s) if s == "push.intt"));
    }

    #[test]
    fn missing_operands_fail() {
        let mut m = machine();
        let cases = [
            serde_json::json!({"type": "push.int"}),
            serde_json::json!({"type": "push.bool"}),
            serde_json::json!({"type": "push.string"}),
            serde_json::json!({"type": "push.local"}),
            serde_json::json!({"type": "push.global"}),
            serde_json::json!({"type": "call.global.counted", "name": "f"}),
            serde_json::json!({"type": "syscall.counted", "index": 0}),
            serde_json::json!({"type": "done", "index": 0}),
            serde_json::json!({"type": "goto"}),
            serde_json::json!({"type": "label"}),
        ];
        for inst in cases {
            let err = plant_doc(
                &mut m,
                &HashMap::new(),
                serde_json::json!({
                    "nlocals": 1, "nparams": 0,
                    "instructions": [inst.clone()]
                }),
            )
            .unwrap_err();
            assert!(
                matches!(err, VmError::MissingOperand { .. }),
                "{inst}: {err}"
            );
        }
    }

    #[test]
    fn unknown_global_fails() {
        let mut m = machine();
        let err = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [{"type": "push.global", "name": "ghost"}]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::UnknownGlobal(s) if s == "ghost"));
    }

    #[test]
    fn unknown_sys_function_fails() {
        let mut m = machine();
        let err = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 1, "nparams": 0,
                "instructions": [
                    {"type": "syscall.counted", "index": 0, "name": "frobnicate"}
                ]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::UnknownSysFunction(s) if s == "frobnicate"));
    }

    #[test]
    fn duplicate_label_fails() {
        let mut m = machine();
        let err = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [
                    {"type": "label", "value": "x"},
                    {"type": "label", "value": "x"}
                ]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::DuplicateLabel(s) if s == "x"));
    }

    #[test]
    fn unresolved_labels_fail_after_the_pass() {
        let mut m = machine();
        let err = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [
                    {"type": "goto", "value": "nowhere"},
                    {"type": "if.not", "value": "also-nowhere"}
                ]
            }),
        )
        .unwrap_err();
        assert!(
            matches!(err, VmError::UnresolvedLabels(s) if s == "also-nowhere, nowhere")
        );
    }

    #[test]
    fn header_out_of_range_fails() {
        let mut m = machine();
        for (nlocals, nparams) in [(-1, 0), (0, -1), (1, 2), (70000, 0)] {
            let err = plant_doc(
                &mut m,
                &HashMap::new(),
                serde_json::json!({
                    "nlocals": nlocals, "nparams": nparams,
                    "instructions": []
                }),
            )
            .unwrap_err();
            assert!(matches!(err, VmError::BadFunctionHeader { .. }));
        }
    }

    #[test]
    fn launch_cannot_be_spelled_in_source() {
        let mut m = machine();
        let err = plant_doc(
            &mut m,
            &HashMap::new(),
            serde_json::json!({
                "nlocals": 0, "nparams": 0,
                "instructions": [{"type": "launch"}]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::UnknownInstruction(_)));
    }
}
