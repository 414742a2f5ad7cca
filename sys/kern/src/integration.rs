// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios across the whole engine: loader in, scheduler
//! around, program semantics out the process image.

use crate::hal::Hal;
use crate::memory::{IPI_BASE, OPI_BASE};
use crate::policy::Policy;
use crate::runtime::Runtime;
use crate::sched::Poll;
use crate::test_util::{build_image, run_to_halt, FakeHal, Prog};
use zplc_abi::{op, Priority, TaskDef, TaskType};

#[test]
fn arithmetic_program() {
    let vm = run_to_halt(
        &Prog::new().push32(10).push32(20).op(op::ADD).op(op::HALT),
    );
    assert!(vm.is_halted());
    assert_eq!(vm.sp(), 1);
    assert_eq!(vm.top(), Some(30));
}

#[test]
fn control_flow_skips_the_untaken_arm() {
    // PUSH32 0; JZ @L; PUSH32 100; L: PUSH32 42; HALT
    let vm = run_to_halt(
        &Prog::new()
            .push32(0) // 0..5
            .jz(13) // 5..8
            .push32(100) // 8..13
            .push32(42) // 13..18
            .op(op::HALT),
    );
    assert!(vm.is_halted());
    assert_eq!(vm.sp(), 1);
    assert_eq!(vm.top(), Some(42));
}

/// Celsius in IPI[0..2], Fahrenheit out OPI[0..2], through the float
/// pipeline: F = (C * 9 / 5) + 32.
fn fahrenheit_program() -> Prog {
    Prog::new()
        .load16(IPI_BASE)
        .op(op::I2F)
        .pushf(9.0)
        .op(op::MULF)
        .pushf(5.0)
        .op(op::DIVF)
        .pushf(32.0)
        .op(op::ADDF)
        .op(op::F2I)
        .store16(OPI_BASE)
        .op(op::HALT)
}

#[test]
fn fahrenheit_conversion_end_to_end() {
    let def = TaskDef::new(0, TaskType::Cyclic, Priority(0), 10_000, 0, 0);
    let image = build_image(fahrenheit_program().bytes(), &[def]);

    for (celsius, fahrenheit) in [(25u16, 77u16), (0, 32), (100, 212)] {
        let mut rt = Box::new(Runtime::new(Policy::default()));
        let mut hal = FakeHal::default();
        rt.load(&image, &mut hal).unwrap();
        rt.memory_mut().write_u16(IPI_BASE, celsius).unwrap();
        rt.start(&mut hal);
        match rt.poll(&mut hal) {
            Poll::Ran { slot } => assert_eq!(slot, 0),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            rt.memory().read_u16(OPI_BASE).unwrap(),
            fahrenheit,
            "{celsius} C"
        );
    }
}

#[test]
fn two_tasks_from_one_image_run_independently() {
    // Task 0 writes 0xA1 to OPI[0]; task 1 writes 0xB2 to OPI[1]. One
    // image, two entry points, two isolated VMs.
    let code = Prog::new()
        .push8(0xA1) // 0..2
        .store8(OPI_BASE) // 2..5
        .op(op::HALT) // 5
        .push8(0xB2) // 6..8
        .store8(OPI_BASE + 1) // 8..11
        .op(op::HALT); // 11
    let defs = [
        TaskDef::new(0, TaskType::Cyclic, Priority(0), 10_000, 0, 0),
        TaskDef::new(1, TaskType::Cyclic, Priority(1), 10_000, 6, 0),
    ];
    let image = build_image(code.bytes(), &defs);

    let mut rt = Box::new(Runtime::new(Policy::default()));
    let mut hal = FakeHal::default();
    assert_eq!(rt.load(&image, &mut hal).unwrap(), 2);
    rt.start(&mut hal);

    // Both due at start; priority order runs slot 0 then slot 1.
    match rt.poll(&mut hal) {
        Poll::Ran { slot } => assert_eq!(slot, 0),
        other => panic!("unexpected {other:?}"),
    }
    // Task 1 hasn't run yet; its VM is untouched.
    {
        let s1 = rt.scheduler().slot(1).unwrap();
        assert_eq!(s1.vm().sp(), 0);
        assert!(!s1.vm().is_halted());
    }
    match rt.poll(&mut hal) {
        Poll::Ran { slot } => assert_eq!(slot, 1),
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(rt.memory().read_u8(OPI_BASE).unwrap(), 0xA1);
    assert_eq!(rt.memory().read_u8(OPI_BASE + 1).unwrap(), 0xB2);
    // Each VM halted on its own program; entry points differ.
    assert_eq!(rt.scheduler().slot(0).unwrap().vm().entry_point(), 0);
    assert_eq!(rt.scheduler().slot(1).unwrap().vm().entry_point(), 6);
}

#[test]
fn get_ticks_is_monotonic_across_cycles() {
    // Each cycle stores GET_TICKS to OPI[0..4]; successive cycles must
    // not observe time going backwards.
    let code = Prog::new()
        .op(op::GET_TICKS)
        .store32(OPI_BASE)
        .op(op::HALT);
    let def = TaskDef::new(0, TaskType::Cyclic, Priority(0), 10_000, 0, 0);
    let image = build_image(code.bytes(), &[def]);

    let mut rt = Box::new(Runtime::new(Policy::default()));
    let mut hal = FakeHal::default();
    rt.load(&image, &mut hal).unwrap();
    rt.start(&mut hal);

    let mut last = 0u32;
    for _ in 0..10 {
        loop {
            match rt.poll(&mut hal) {
                Poll::Ran { .. } => break,
                Poll::Sleep { until } => hal.sleep_until(until),
                Poll::Idle => panic!("should be running"),
            }
        }
        let ticks = rt.memory().read_u32(OPI_BASE).unwrap();
        assert!(ticks >= last, "ticks went backwards: {last} -> {ticks}");
        last = ticks;
    }
    assert!(last >= 90, "10 cycles at 10 ms should pass ~90 ms");
}
