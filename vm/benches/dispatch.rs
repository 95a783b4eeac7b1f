//! Run with:
//!   cargo bench --bench dispatch

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytecode::FunctionSource;
use object::Cell;
use vm::{interpreter, planter, Machine, MachineSettings};

/// A counted-down loop: locals, backward jumps, and two syscalls per
/// iteration. Exercises the dispatch loop end to end.
fn countdown_source(n: i64) -> FunctionSource {
    serde_json::from_value(serde_json::json!({
        "nlocals": 2, "nparams": 0,
        "instructions": [
            {"type": "push.int", "ivalue": n},
            {"type": "pop.local", "index": 0},
            {"type": "label", "value": "loop"},
            {"type": "stack.length", "index": 1},
            {"type": "push.local", "index": 0},
            {"type": "push.int", "ivalue": 0},
            {"type": "syscall.counted", "index": 1, "name": ">"},
            {"type": "if.not", "value": "end"},
            {"type": "stack.length", "index": 1},
            {"type": "push.local", "index": 0},
            {"type": "push.int", "ivalue": 1},
            {"type": "syscall.counted", "index": 1, "name": "-"},
            {"type": "pop.local", "index": 0},
            {"type": "goto", "value": "loop"},
            {"type": "label", "value": "end"},
            {"type": "return"}
        ]
    }))
    .expect("countdown source")
}

fn bench_countdown(c: &mut Criterion) {
    let mut machine = Machine::new(MachineSettings::default()).expect("machine");
    let source = countdown_source(1000);
    let planted = planter::plant(&mut machine, "countdown", &HashMap::new(), &source)
        .expect("plant countdown");
    let func: *mut Cell = machine.allocate_function(&planted).expect("allocate");

    c.bench_function("countdown_1000", |b| {
        b.iter(|| {
            interpreter::execute(&mut machine, black_box(func)).expect("run");
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_countdown
}

criterion_main!(benches);
