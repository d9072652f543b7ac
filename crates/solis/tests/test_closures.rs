//! Closure and upvalue behavior: capture, closing on scope exit, and
//! sharing of the canonical cell between sibling closures.

use solis::{InterpretResult, Vm};

fn run(vm: &mut Vm, source: &str) {
    assert_eq!(
        vm.interpret("test", source),
        InterpretResult::Ok,
        "script failed:\n{source}"
    );
}

fn number_global(vm: &mut Vm, name: &str) -> f64 {
    vm.get_global(name).expect("global").as_number()
}

#[test]
fn counter_keeps_state_across_calls() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
function makeCounter()
  var n = 0
  function step() n = n + 1; return n end
  return step
end
var c = makeCounter()
var a = c(); var b = c(); var d = c()
",
    );
    assert_eq!(number_global(&mut vm, "a"), 1.0);
    assert_eq!(number_global(&mut vm, "b"), 2.0);
    assert_eq!(number_global(&mut vm, "d"), 3.0);
}

#[test]
fn independent_counters_do_not_share_cells() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
function makeCounter()
  var n = 0
  function step() n = n + 1; return n end
  return step
end
var c1 = makeCounter()
var c2 = makeCounter()
c1(); c1()
var a = c1()
var b = c2()
",
    );
    assert_eq!(number_global(&mut vm, "a"), 3.0);
    assert_eq!(number_global(&mut vm, "b"), 1.0);
}

#[test]
fn sibling_closures_share_one_cell() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
function makePair()
  var n = 0
  function inc() n = n + 1; return n end
  function get() return n end
  var pair = [inc, get]
  return pair
end
var pair = makePair()
var inc = pair[0]
var get = pair[1]
inc(); inc()
var seen = get()
",
    );
    assert_eq!(number_global(&mut vm, "seen"), 2.0);
}

#[test]
fn loop_variable_is_captured_per_iteration() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
var fns = []
for i in 1..3 do
  function cap() return i end
  fns.append(cap)
end
var a = fns[0]()
var b = fns[1]()
var c = fns[2]()
",
    );
    // Each iteration binds a fresh `i`, so each closure sees its own.
    assert_eq!(number_global(&mut vm, "a"), 1.0);
    assert_eq!(number_global(&mut vm, "b"), 2.0);
    assert_eq!(number_global(&mut vm, "c"), 3.0);
}

#[test]
fn nested_closures_resolve_through_intermediates() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
function outer()
  var x = 10
  function middle()
    function inner()
      x = x + 1
      return x
    end
    return inner
  end
  return middle()
end
var f = outer()
f()
var r = f()
",
    );
    assert_eq!(number_global(&mut vm, "r"), 12.0);
}

#[test]
fn assignment_through_upvalue_is_visible_before_close() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
function observeWhileOpen()
  var v = 1
  function set() v = 99 end
  set()
  return v
end
var r = observeWhileOpen()
",
    );
    assert_eq!(number_global(&mut vm, "r"), 99.0);
}
