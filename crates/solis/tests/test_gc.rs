//! Collector behavior observed end-to-end: transient garbage is
//! reclaimed, live data survives, and interned survivors keep their
//! identity.

use solis::{InterpretResult, Value, Vm, VmOptions};

fn run(vm: &mut Vm, source: &str) {
    assert_eq!(
        vm.interpret("test", source),
        InterpretResult::Ok,
        "script failed:\n{source}"
    );
}

#[test]
fn transient_strings_do_not_accumulate() {
    let mut vm = Vm::with_options(VmOptions {
        gc_stress: true,
        ..VmOptions::default()
    });

    run(
        &mut vm,
        "\
var i = 0
while i < 2000 do
  var s = i.toString() + \"-suffix\"
  i = i + 1
end
",
    );

    vm.collect();
    // The live set after the loop is the core module plus a handful of
    // globals; a small fixed bound catches any leak of the 2000 strings.
    assert!(
        vm.live_object_count() < 200,
        "live objects after stress loop: {}",
        vm.live_object_count()
    );
}

#[test]
fn heap_stays_bounded_under_allocation_pressure() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
var i = 0
while i < 100000 do
  var s = i.toString() + \"x\"
  i = i + 1
end
",
    );

    vm.collect();
    assert!(
        vm.allocated_bytes() < 1024 * 1024,
        "allocated after loop: {} bytes",
        vm.allocated_bytes()
    );
}

#[test]
fn reachable_data_survives_collections() {
    let mut vm = Vm::with_options(VmOptions {
        gc_stress: true,
        ..VmOptions::default()
    });

    run(
        &mut vm,
        "\
var keep = []
var i = 0
while i < 100 do
  keep.append(i.toString())
  i = i + 1
end
var n = keep.length()
var first = keep[0]
var last = keep[99]
",
    );

    assert_eq!(vm.get_global("n"), Some(Value::number(100.0)));
    let first = vm.get_global("first").expect("first");
    let last = vm.get_global("last").expect("last");
    assert_eq!(vm.string_chars(first), "0");
    assert_eq!(vm.string_chars(last), "99");
}

#[test]
fn interned_survivors_match_fresh_requests() {
    let mut vm = Vm::with_options(VmOptions {
        gc_stress: true,
        ..VmOptions::default()
    });
    run(&mut vm, "var s = \"sur\" + \"vivor\"");

    vm.collect();
    let stored = vm.get_global("s").expect("s");
    let fresh = vm.string_value("survivor");
    assert!(stored.same(fresh), "interned survivor lost its identity");
}

#[test]
fn closures_and_upvalues_survive_stress() {
    let mut vm = Vm::with_options(VmOptions {
        gc_stress: true,
        ..VmOptions::default()
    });
    run(
        &mut vm,
        "\
function makeCounter()
  var n = 0
  function step() n = n + 1; return n end
  return step
end
var c = makeCounter()
c(); c()
var v = c()
",
    );
    assert_eq!(vm.get_global("v"), Some(Value::number(3.0)));
}

#[test]
fn collection_is_idempotent_when_nothing_changes() {
    let mut vm = Vm::new();
    run(&mut vm, "var keep = [1, 2, 3]\n");

    vm.collect();
    let live = vm.live_object_count();
    let bytes = vm.allocated_bytes();
    vm.collect();
    assert_eq!(vm.live_object_count(), live);
    assert_eq!(vm.allocated_bytes(), bytes);
}
