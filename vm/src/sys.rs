//! Built-in sys-functions.
//!
//! A sys-function receives the machine and the argument count the call site
//! derived from its stack-length snapshot. The planter resolves names
//! through [`lookup`] at plant time and embeds the function pointer itself
//! as the operand, so a syscall is one indirect call with no table lookup
//! at run time.

use object::Cell;

use crate::error::{Result, VmError};
use crate::machine::Machine;

pub type SysFunction = fn(&mut Machine, u64) -> Result<()>;

/// The fixed name table. Unknown names fail at plant time.
pub fn lookup(name: &str) -> Option<SysFunction> {
    let f: SysFunction = match name {
        "println" => sys_println,
        "+" => sys_add,
        "-" => sys_subtract,
        "*" => sys_multiply,
        "/" => sys_divide,
        "negate" => sys_negate,
        "<" => sys_less_than,
        ">" => sys_greater_than,
        "<=" => sys_less_than_or_equal_to,
        ">=" => sys_greater_than_or_equal_to,
        "==" => sys_equal,
        "!=" => sys_not_equal,
        "===" => sys_identical,
        "!==" => sys_not_identical,
        _ => return None,
    };
    Some(f)
}

/// Binary integer operations share one shape: two arguments, pop the right
/// operand, peek the left, demand tagged ints, overwrite the top with the
/// result.
fn binary_int_operation(
    machine: &mut Machine,
    nargs: u64,
    name: &'static str,
    op: impl FnOnce(i64, i64) -> Result<Cell>,
) -> Result<()> {
    if nargs != 2 {
        return Err(VmError::SysArity {
            name,
            expected: 2,
            got: nargs,
        });
    }

    let n = machine.pop()?;
    let m = machine.peek()?;
    if !n.is_int() || !m.is_int() {
        return Err(VmError::TypeMismatch {
            context: name,
            expected: "two integers",
        });
    }

    *machine.peek_mut()? = op(m.to_i64(), n.to_i64())?;
    Ok(())
}

/// Identity comparisons work on raw cells; no type demands.
fn identity_operation(
    machine: &mut Machine,
    nargs: u64,
    name: &'static str,
    negate: bool,
) -> Result<()> {
    if nargs != 2 {
        return Err(VmError::SysArity {
            name,
            expected: 2,
            got: nargs,
        });
    }
    let n = machine.pop()?;
    let m = machine.peek()?;
    *machine.peek_mut()? = Cell::from_bool((m.raw() == n.raw()) != negate);
    Ok(())
}

fn sys_add(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "add (+)", |a, b| {
        Ok(Cell::from_i64(a.wrapping_add(b)))
    })
}

fn sys_subtract(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "subtract (-)", |a, b| {
        Ok(Cell::from_i64(a.wrapping_sub(b)))
    })
}

fn sys_multiply(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "multiply (*)", |a, b| {
        Ok(Cell::from_i64(a.wrapping_mul(b)))
    })
}

fn sys_divide(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "divide (/)", |a, b| {
        if b == 0 {
            return Err(VmError::DivisionByZero);
        }
        Ok(Cell::from_i64(a.wrapping_div(b)))
    })
}

fn sys_less_than(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "less_than (<)", |a, b| {
        Ok(Cell::from_bool(a < b))
    })
}

fn sys_greater_than(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "greater_than (>)", |a, b| {
        Ok(Cell::from_bool(a > b))
    })
}

fn sys_less_than_or_equal_to(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "less_equal (<=)", |a, b| {
        Ok(Cell::from_bool(a <= b))
    })
}

fn sys_greater_than_or_equal_to(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "greater_equal (>=)", |a, b| {
        Ok(Cell::from_bool(a >= b))
    })
}

fn sys_equal(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "equal (==)", |a, b| {
        Ok(Cell::from_bool(a == b))
    })
}

fn sys_not_equal(machine: &mut Machine, nargs: u64) -> Result<()> {
    binary_int_operation(machine, nargs, "not_equal (!=)", |a, b| {
        Ok(Cell::from_bool(a != b))
    })
}

fn sys_identical(machine: &mut Machine, nargs: u64) -> Result<()> {
    identity_operation(machine, nargs, "identical (===)", false)
}

fn sys_not_identical(machine: &mut Machine, nargs: u64) -> Result<()> {
    identity_operation(machine, nargs, "not_identical (!==)", true)
}

fn sys_negate(machine: &mut Machine, nargs: u64) -> Result<()> {
    if nargs != 1 {
        return Err(VmError::SysArity {
            name: "negate",
            expected: 1,
            got: nargs,
        });
    }
    let x = machine.peek()?;
    if !x.is_int() {
        return Err(VmError::TypeMismatch {
            context: "negate",
            expected: "an integer",
        });
    }
    *machine.peek_mut()? = Cell::from_i64(x.to_i64().wrapping_neg());
    Ok(())
}

/// Print `nargs` values from the stack, space-separated and followed by a
/// newline, then remove them.
fn sys_println(machine: &mut Machine, nargs: u64) -> Result<()> {
    let count = nargs as usize;
    if machine.stack_size() < count {
        return Err(VmError::StackUnderflow);
    }

    let base = machine.stack_size() - count;
    let mut line = String::new();
    for i in 0..count {
        if i > 0 {
            line.push(' ');
        }
        let value = machine.peek_at(base + i)?;
        line.push_str(&machine.format_cell(value));
    }
    println!("{line}");

    machine.pop_multiple(nargs)
}
