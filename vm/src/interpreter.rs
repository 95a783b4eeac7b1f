//! The threaded-code interpreter.
//!
//! Compiled code is a flat run of cells: an opcode word followed by that
//! opcode's fixed operand cells. `pc` is a raw pointer into the stream and
//! always rests on an opcode word between steps; the loop decodes the word
//! and dispatches through a dense `match`.
//!
//! Lazy→strict promotion mutates the stream itself: the first time a
//! `*_LAZY` site observes its global already realised, it overwrites its
//! own handler word with the strict opcode and rewinds `pc` by one cell, so
//! every later pass through the site dispatches straight to the strict
//! handler. The write goes through a raw pointer into the heap pool, which
//! is also where the dispatcher reads from.

use bytecode::Opcode;
use object::{Cell, Ident};
use tracing::trace;

use crate::error::{Result, VmError};
use crate::machine::Machine;
use crate::sys::SysFunction;

/// Run a function object to completion through a `LAUNCH f ; HALT` driver
/// stream.
pub fn execute(machine: &mut Machine, func: *mut Cell) -> Result<()> {
    let mut driver = [
        Cell::from_raw(Opcode::Launch.word()),
        Cell::from_raw_ptr(func),
        Cell::from_raw(Opcode::Halt.word()),
    ];
    // The entry frame's return address points at the driver's HALT, so the
    // driver must stay alive for the whole run; it does, it lives in this
    // frame.
    run(machine, driver.as_mut_ptr())
}

fn run(machine: &mut Machine, entry: *mut Cell) -> Result<()> {
    let mut pc = entry;

    loop {
        // SAFETY: pc always points at an opcode word of a live code stream:
        // it starts on the driver, and every handler leaves it on the next
        // handler word, jumps and calls included; the planter terminates
        // every function with a HALT guard.
        let word = unsafe { (*pc).raw() };
        let op = Opcode::try_from(word).map_err(VmError::InvalidOpcode)?;
        let site = pc;
        pc = unsafe { pc.add(1) };
        trace!(?op, "dispatch");

        match op {
            // One handler serves all three literal pushes; they differ only
            // in how the planter materialised the operand.
            Opcode::PushInt | Opcode::PushString | Opcode::PushBool => {
                let value = unsafe { fetch(&mut pc) };
                machine.push(value)?;
            }

            Opcode::PushLocal => {
                let offset = unsafe { fetch(&mut pc) }.raw_i64();
                let value = machine.local(offset)?;
                machine.push(value)?;
            }

            Opcode::PopLocal => {
                let offset = unsafe { fetch(&mut pc) }.raw_i64();
                let value = machine.pop()?;
                machine.set_local(offset, value)?;
            }

            Opcode::StackLength => {
                let offset = unsafe { fetch(&mut pc) }.raw_i64();
                let length = Cell::from_i64(machine.stack_size() as i64);
                machine.set_local(offset, length)?;
            }

            Opcode::CheckBool => {
                let offset = unsafe { fetch(&mut pc) }.raw_i64();
                let before = snapshot_value(machine, offset)?;
                let current = machine.stack_size() as i64;
                if current != before + 1 {
                    return Err(VmError::CheckBoolDepth {
                        expected: before + 1,
                        got: current,
                    });
                }
                if !machine.peek()?.is_bool() {
                    return Err(VmError::CheckBoolValue);
                }
            }

            Opcode::PushGlobal => {
                let ident = unsafe { fetch(&mut pc) }.raw_ptr::<Ident>();
                // SAFETY: ident operands are addresses of boxed Idents the
                // global table never drops.
                let value = unsafe { (*ident).cell };
                machine.push(value)?;
            }

            Opcode::PushGlobalLazy => {
                let ident = unsafe { fetch(&mut pc) }.raw_ptr::<Ident>();
                // SAFETY: as for PushGlobal.
                if unsafe { (*ident).lazy } {
                    let thunk = machine.object_identity(unsafe { (*ident).cell })?;
                    begin_lazy_evaluation(ident)?;
                    pc = call_function(machine, pc, thunk, 0)?;
                } else {
                    // The global is realised: rewrite this site to the
                    // strict variant and re-execute it.
                    unsafe { *site = Cell::from_raw(Opcode::PushGlobal.word()) };
                    pc = site;
                }
            }

            Opcode::CallGlobalCounted => {
                let offset = unsafe { fetch(&mut pc) }.raw_i64();
                let ident = unsafe { fetch(&mut pc) }.raw_ptr::<Ident>();
                let count = counted_args(machine, offset)?;
                // SAFETY: as for PushGlobal.
                let func = machine.object_identity(unsafe { (*ident).cell })?;
                pc = call_function(machine, pc, func, count)?;
            }

            Opcode::CallGlobalCountedLazy => {
                let _snapshot_offset = unsafe { fetch(&mut pc) }.raw_i64();
                let ident = unsafe { fetch(&mut pc) }.raw_ptr::<Ident>();
                // SAFETY: as for PushGlobal.
                if unsafe { (*ident).lazy } {
                    // The thunk takes no parameters; the snapshot is not
                    // consulted until the strict variant runs.
                    let thunk = machine.object_identity(unsafe { (*ident).cell })?;
                    begin_lazy_evaluation(ident)?;
                    pc = call_function(machine, pc, thunk, 0)?;
                } else {
                    unsafe {
                        *site = Cell::from_raw(Opcode::CallGlobalCounted.word())
                    };
                    pc = site;
                }
            }

            Opcode::SyscallCounted => {
                let offset = unsafe { fetch(&mut pc) }.raw_i64();
                let raw_fn = unsafe { fetch(&mut pc) }.raw();
                let count = counted_args(machine, offset)?;
                // SAFETY: the operand was written by the planter from a
                // SysFunction in the fixed table; fn pointers and usize have
                // the same size and validity here.
                let sys_fn: SysFunction =
                    unsafe { std::mem::transmute::<usize, SysFunction>(raw_fn as usize) };
                sys_fn(machine, count as u64)?;
            }

            Opcode::Done => {
                let offset = unsafe { fetch(&mut pc) }.raw_i64();
                let ident = unsafe { fetch(&mut pc) }.raw_ptr::<Ident>();
                let count = counted_args(machine, offset)?;
                if count != 1 {
                    return Err(VmError::DoneArity(count));
                }
                let value = machine.peek()?;
                // SAFETY: as for PushGlobal. The realised value is installed
                // before the thunk returns, so every later dispatch through
                // this ident sees it.
                unsafe {
                    (*ident).cell = value;
                    (*ident).in_progress = false;
                    (*ident).lazy = false;
                }
            }

            Opcode::Goto => {
                let rel = unsafe { fetch(&mut pc) }.raw_i64();
                // SAFETY: the planter resolved rel against this stream, so
                // the target is an opcode word of the same function.
                pc = unsafe { pc.offset(rel as isize) };
            }

            Opcode::IfNot => {
                let rel = unsafe { fetch(&mut pc) }.raw_i64();
                let condition = machine.pop()?;
                if condition == Cell::FALSE {
                    // SAFETY: as for Goto.
                    pc = unsafe { pc.offset(rel as isize) };
                }
            }

            Opcode::Return => {
                let return_address = machine.pop_return()?;
                let func = machine.pop_return()?.raw_ptr::<Cell>();
                // SAFETY: the frame stored this function identity when the
                // call was made.
                let nlocals = unsafe { machine.heap().function_nlocals(func) };
                machine.pop_return_frame(nlocals as usize)?;
                pc = return_address.raw_ptr::<Cell>();
            }

            Opcode::Launch => {
                let func = unsafe { fetch(&mut pc) }.raw_ptr::<Cell>();
                pc = build_frame(machine, pc, func)?;
            }

            Opcode::Halt => return Ok(()),

            Opcode::Label => return Err(VmError::InvalidOpcode(word)),
        }
    }
}

/// Read the cell under `pc` and advance past it.
///
/// # Safety
///
/// `pc` must point at an operand cell of a live code stream.
#[inline(always)]
unsafe fn fetch(pc: &mut *mut Cell) -> Cell {
    let cell = **pc;
    *pc = pc.add(1);
    cell
}

fn snapshot_value(machine: &Machine, offset: i64) -> Result<i64> {
    let snapshot = machine.local(offset)?;
    if !snapshot.is_int() {
        return Err(VmError::TypeMismatch {
            context: "call-site snapshot",
            expected: "a stack-length integer",
        });
    }
    Ok(snapshot.to_i64())
}

/// Arguments at a counted call site: the operand stack's growth since the
/// `STACK_LENGTH` snapshot.
fn counted_args(machine: &Machine, offset: i64) -> Result<i64> {
    let before = snapshot_value(machine, offset)?;
    let count = machine.stack_size() as i64 - before;
    if count < 0 {
        return Err(VmError::StackUnderflow);
    }
    Ok(count)
}

/// Guard a thunk invocation against re-entry.
fn begin_lazy_evaluation(ident: *mut Ident) -> Result<()> {
    // SAFETY: ident operands are addresses of boxed Idents the global table
    // never drops.
    unsafe {
        if (*ident).in_progress {
            return Err(VmError::RecursiveLazyEvaluation);
        }
        (*ident).in_progress = true;
    }
    Ok(())
}

/// Verify the callee and its arity, then transfer control into it.
fn call_function(
    machine: &mut Machine,
    return_pc: *mut Cell,
    func: *mut Cell,
    arg_count: i64,
) -> Result<*mut Cell> {
    // SAFETY: func came out of object_identity on a tagged pointer; reading
    // its identity cell is valid for any heap object.
    if !unsafe { machine.heap().is_function_object(func) } {
        return Err(VmError::NotAFunction);
    }
    // SAFETY: just verified to be a function object.
    let nparams = unsafe { machine.heap().function_nparams(func) };
    if arg_count != nparams as i64 {
        return Err(VmError::ArityMismatch {
            expected: nparams,
            got: arg_count,
        });
    }
    build_frame(machine, return_pc, func)
}

/// Push a frame for `func` and return its first code word.
///
/// Bottom to top the frame is: `nlocals − nparams` extras initialised to
/// `NIL`, the parameters in declaration order (first parameter lowest), the
/// function identity, the caller's resume address.
fn build_frame(
    machine: &mut Machine,
    return_pc: *mut Cell,
    func: *mut Cell,
) -> Result<*mut Cell> {
    // SAFETY: callers pass a verified function object (the driver's LAUNCH
    // operand is built by the loader from a planted function).
    let (nlocals, nparams) = unsafe {
        (
            machine.heap().function_nlocals(func),
            machine.heap().function_nparams(func),
        )
    };

    for _ in nparams..nlocals {
        machine.push_return(Cell::NIL)?;
    }

    // The operand stack holds the last argument on top; refill in reverse
    // so the first declared parameter lands lowest in the frame.
    let mut params = vec![Cell::NIL; nparams as usize];
    for slot in params.iter_mut().rev() {
        *slot = machine.pop()?;
    }
    for param in params {
        machine.push_return(param)?;
    }

    machine.push_return(Cell::from_raw_ptr(func))?;
    machine.push_return(Cell::from_raw_ptr(return_pc))?;

    // SAFETY: function objects carry their code inline from offset +2.
    Ok(unsafe { machine.heap().function_code(func) })
}
