//! End-to-end language tests: arithmetic, globals, strings, control
//! flow, lists, enums and ranges, all observed through the embedding
//! API.

use solis::{InterpretResult, Value, Vm};

fn run(vm: &mut Vm, source: &str) {
    assert_eq!(
        vm.interpret("test", source),
        InterpretResult::Ok,
        "script failed:\n{source}"
    );
}

fn number_global(vm: &mut Vm, name: &str) -> f64 {
    let value = vm.get_global(name).unwrap_or_else(|| panic!("global '{name}' missing"));
    assert!(value.is_number(), "global '{name}' is not a number");
    value.as_number()
}

#[test]
fn arithmetic_and_globals() {
    let mut vm = Vm::new();
    run(&mut vm, "var x = 25 + 5; var y = x + 2;");
    assert_eq!(number_global(&mut vm, "y"), 32.0);
}

#[test]
fn operator_precedence() {
    let mut vm = Vm::new();
    run(&mut vm, "var a = 1 + 2 * 3\nvar b = (1 + 2) * 3\nvar c = 2 ** 3\nvar d = 7 // 2\n");
    assert_eq!(number_global(&mut vm, "a"), 7.0);
    assert_eq!(number_global(&mut vm, "b"), 9.0);
    assert_eq!(number_global(&mut vm, "c"), 8.0);
    assert_eq!(number_global(&mut vm, "d"), 3.0);
}

#[test]
fn unary_and_comparisons() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var a = -5\nvar b = !true\nvar c = 2 < 3\nvar d = 2 >= 3\nvar e = 2 == 2\nvar f = 2 != 2\n",
    );
    assert_eq!(number_global(&mut vm, "a"), -5.0);
    assert_eq!(vm.get_global("b"), Some(Value::FALSE));
    assert_eq!(vm.get_global("c"), Some(Value::TRUE));
    assert_eq!(vm.get_global("d"), Some(Value::FALSE));
    assert_eq!(vm.get_global("e"), Some(Value::TRUE));
    assert_eq!(vm.get_global("f"), Some(Value::FALSE));
}

#[test]
fn string_concat_interns_the_result() {
    let mut vm = Vm::new();
    run(&mut vm, "var s = \"Hello\" + \" World\"");
    let s = vm.get_global("s").expect("s");
    assert_eq!(vm.string_chars(s), "Hello World");

    // Interning: an equal string from the host is the same object.
    let fresh = vm.string_value("Hello World");
    assert!(s.same(fresh));
}

#[test]
fn string_methods() {
    let mut vm = Vm::new();
    run(&mut vm, "var n = \"solis\".length()");
    assert_eq!(number_global(&mut vm, "n"), 5.0);
}

#[test]
fn number_methods_and_statics() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var s = 3.75.truncate()\nvar pi = Number.PI\nvar str = 42.toString()\n",
    );
    assert_eq!(number_global(&mut vm, "s"), 3.0);
    assert!((number_global(&mut vm, "pi") - std::f64::consts::PI).abs() < 1e-12);
    let s = vm.get_global("str").expect("str");
    assert_eq!(vm.string_chars(s), "42");
}

#[test]
fn if_else_branches() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var a = 0\nif 1 < 2 then\na = 1\nelse\na = 2\nend\nvar b = 0\nif false then\nb = 1\nelse\nb = 2\nend\n",
    );
    assert_eq!(number_global(&mut vm, "a"), 1.0);
    assert_eq!(number_global(&mut vm, "b"), 2.0);
}

#[test]
fn logical_operators_short_circuit() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var hits = 0\nfunction bump() hits = hits + 1; return true end\nvar a = false and bump()\nvar b = true or bump()\nvar c = null or 7\n",
    );
    assert_eq!(number_global(&mut vm, "hits"), 0.0);
    assert_eq!(vm.get_global("a"), Some(Value::FALSE));
    assert_eq!(vm.get_global("b"), Some(Value::TRUE));
    assert_eq!(number_global(&mut vm, "c"), 7.0);
}

#[test]
fn while_loop_with_break() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var i = 0\nvar s = 0\nwhile true do\ni = i + 1\nif i > 10 then\nbreak\nend\ns = s + i\nend\n",
    );
    assert_eq!(number_global(&mut vm, "s"), 55.0);
}

#[test]
fn for_over_inclusive_range() {
    let mut vm = Vm::new();
    run(&mut vm, "var s = 0; for i in 1..5 do s = s + i end");
    assert_eq!(number_global(&mut vm, "s"), 15.0);
}

#[test]
fn empty_range_never_runs() {
    let mut vm = Vm::new();
    run(&mut vm, "var s = 0\nfor i in 5..1 do\ns = s + 1\nend\n");
    assert_eq!(number_global(&mut vm, "s"), 0.0);
}

#[test]
fn for_over_list() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var l = [10, 20, 30]\nvar s = 0\nfor v in l do\ns = s + v\nend\n",
    );
    assert_eq!(number_global(&mut vm, "s"), 60.0);
}

#[test]
fn list_methods_and_subscripts() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var l = [1, 2, 3]\nl.append(4)\nl.insert(0, 0)\nvar a = l[0]\nvar b = l.at(4)\nl[1] = 9\nvar c = l[1]\nvar n = l.length()\nvar r = l.removeAt(0)\nvar m = l.length()\n",
    );
    assert_eq!(number_global(&mut vm, "a"), 0.0);
    assert_eq!(number_global(&mut vm, "b"), 3.0);
    assert_eq!(number_global(&mut vm, "c"), 9.0);
    assert_eq!(number_global(&mut vm, "n"), 5.0);
    assert_eq!(number_global(&mut vm, "r"), 0.0);
    assert_eq!(number_global(&mut vm, "m"), 4.0);
}

#[test]
fn list_subscript_out_of_bounds_is_a_runtime_error() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("test", "var l = [1]\nvar a = l[3]\n"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn enums_expose_ordinal_members() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "enum Color\nRed\nGreen\nBlue\nend\nvar g = Color.Green\nvar b = Color.Blue\n",
    );
    assert_eq!(number_global(&mut vm, "g"), 1.0);
    assert_eq!(number_global(&mut vm, "b"), 2.0);
}

#[test]
fn is_tests_builtin_types() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var a = 1 is number\nvar b = \"x\" is string\nvar c = true is bool\nvar d = null is null\nvar e = 1 is string\nvar f = [1] is List\n",
    );
    for (name, expected) in [
        ("a", Value::TRUE),
        ("b", Value::TRUE),
        ("c", Value::TRUE),
        ("d", Value::TRUE),
        ("e", Value::FALSE),
        ("f", Value::TRUE),
    ] {
        assert_eq!(vm.get_global(name), Some(expected), "global {name}");
    }
}

#[test]
fn determinism_across_runs() {
    let source = "\
var acc = 0
function mix(n)
  return n * 31 + 7
end
for i in 1..50 do
  acc = mix(acc) // 2
end
var out = acc.toString()
";
    let mut first = Vm::new();
    run(&mut first, source);
    let mut second = Vm::new();
    run(&mut second, source);

    let a = first.get_global("out").expect("out");
    let b = second.get_global("out").expect("out");
    assert_eq!(first.string_chars(a), second.string_chars(b));
    assert_eq!(
        first.get_global("acc").map(|v| v.to_bits()),
        second.get_global("acc").map(|v| v.to_bits())
    );
}

#[test]
fn runtime_errors_do_not_poison_the_vm() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("test", "var x = 1 + \"one\"\n"),
        InterpretResult::RuntimeError
    );
    // The same VM keeps working afterwards.
    run(&mut vm, "var y = 2 + 2\n");
    assert_eq!(number_global(&mut vm, "y"), 4.0);
}

#[test]
fn missing_operator_is_reported() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("test", "class Empty\nend\nvar e = Empty()\nvar x = e + 1\n"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("test", "function f(a, b) return a end\nvar x = f(1)\n"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("test", "function f(n) return f(n + 1) end\nvar x = f(0)\n"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn compile_errors_report_without_running() {
    let mut vm = Vm::new();
    for source in [
        "var = 3\n",
        "if 1 then\n",
        "var a = (1 + 2\n",
        "\"unterminated\n",
        "var a = @\n",
    ] {
        assert_eq!(
            vm.interpret("test", source),
            InterpretResult::CompileError,
            "source should not compile: {source:?}"
        );
    }
}
