use serde::Deserialize;

/// The declarative form of a compiled function, as stored in a binding's
/// `value` column.
///
/// The schema is strict: unknown fields anywhere in the document are a
/// deserialization error.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSource {
    pub nlocals: i64,
    pub nparams: i64,
    pub instructions: Vec<SourceInstruction>,
}

/// One declarative instruction.
///
/// `kind` selects the opcode through [`crate::Opcode::from_spelling`]; the
/// remaining fields are operands and only the ones the opcode requires may
/// be present:
///
/// - `index`: local slot (`push.local`, `pop.local`, `stack.length`,
///   `check.bool`) or snapshot slot (`call.global.counted`,
///   `syscall.counted`, `done`)
/// - `ivalue`: integer literal (`push.int`)
/// - `value`: string literal (`push.string`), bool spelling (`push.bool`),
///   or label name (`label`, `goto`, `if.not`)
/// - `name`: global or sys-function name (`push.global`,
///   `call.global.counted`, `syscall.counted`, `done`)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceInstruction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub index: Option<i64>,
    #[serde(default)]
    pub ivalue: Option<i64>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_binding_document() {
        let doc = r#"{
            "nlocals": 2,
            "nparams": 1,
            "instructions": [
                {"type": "push.int", "ivalue": 42},
                {"type": "push.local", "index": 0},
                {"type": "stack.length", "index": 1},
                {"type": "call.global.counted", "index": 1, "name": "f"},
                {"type": "return"}
            ]
        }"#;
        let source: FunctionSource = serde_json::from_str(doc).unwrap();
        assert_eq!(source.nlocals, 2);
        assert_eq!(source.nparams, 1);
        assert_eq!(source.instructions.len(), 5);
        assert_eq!(source.instructions[0].kind, "push.int");
        assert_eq!(source.instructions[0].ivalue, Some(42));
        assert_eq!(source.instructions[3].name.as_deref(), Some("f"));
        assert_eq!(source.instructions[4].index, None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let doc = r#"{"nlocals": 0, "nparams": 0, "instructions": [], "extra": 1}"#;
        assert!(serde_json::from_str::<FunctionSource>(doc).is_err());

        let doc = r#"{
            "nlocals": 0, "nparams": 0,
            "instructions": [{"type": "halt", "weight": 9}]
        }"#;
        assert!(serde_json::from_str::<FunctionSource>(doc).is_err());
    }

    #[test]
    fn missing_header_fields_are_rejected() {
        assert!(serde_json::from_str::<FunctionSource>(r#"{"nparams": 0, "instructions": []}"#).is_err());
        assert!(serde_json::from_str::<FunctionSource>(r#"{"nlocals": 0, "instructions": []}"#).is_err());
        assert!(serde_json::from_str::<FunctionSource>(r#"{"nlocals": 0, "nparams": 0}"#).is_err());
    }
}
