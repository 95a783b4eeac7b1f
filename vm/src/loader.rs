//! Load a bundle entry point into the machine and run it.
//!
//! Loading happens in two waves so that compiled code can embed global
//! handles before the globals themselves are compiled: first every name in
//! the entry point's dependency closure is declared `UNDEF`, then each
//! binding is planted, allocated, and its global re-defined with the real
//! function pointer and the bundle's lazy bit.

use bundle::BundleReader;
use bytecode::FunctionSource;
use object::Cell;
use tracing::debug;

use crate::error::{Result, VmError};
use crate::interpreter;
use crate::machine::Machine;
use crate::planter;

/// Pick the entry point to run: an explicit request must name a declared
/// entry point; otherwise the bundle must declare exactly one.
pub fn select_entry_point(
    reader: &BundleReader,
    requested: Option<&str>,
) -> Result<String> {
    let mut entry_points = reader.entry_points()?;

    if let Some(name) = requested {
        if entry_points.iter().any(|p| p == name) {
            return Ok(name.to_string());
        }
        return Err(VmError::EntryPointNotFound(name.to_string()));
    }

    match entry_points.len() {
        0 => Err(VmError::NoEntryPoints),
        1 => Ok(entry_points.remove(0)),
        _ => {
            entry_points.sort_unstable();
            Err(VmError::MultipleEntryPoints(entry_points.join(", ")))
        }
    }
}

/// Load the entry point's dependency closure and execute it.
pub fn run_entry(
    machine: &mut Machine,
    reader: &BundleReader,
    entry: &str,
) -> Result<()> {
    let deps = reader.dependencies(entry)?;

    // Wave one: declare, so every Ident address exists before planting.
    for name in deps.keys() {
        machine.define_global(name, Cell::UNDEF, false);
    }

    // Wave two: plant and install.
    for name in deps.keys() {
        let binding = reader.binding(name)?;
        let source: FunctionSource = serde_json::from_str(&binding.value)
            .map_err(|source| VmError::MalformedBinding {
                name: name.clone(),
                source,
            })?;
        let planted = planter::plant(machine, name, &deps, &source)?;
        let func = machine.allocate_function(&planted)?;
        machine.define_global(name, Cell::from_ptr(func), binding.lazy);
        debug!(
            binding = %name,
            lazy = binding.lazy,
            words = planted.code.len(),
            "installed"
        );
    }

    let ident = machine
        .ident(entry)
        .ok_or_else(|| VmError::EntryPointNotFound(entry.to_string()))?;
    let func = machine.object_identity(ident.cell)?;
    interpreter::execute(machine, func)
}
