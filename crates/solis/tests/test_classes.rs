//! Classes: fields, methods, statics, constructors, inheritance, bound
//! methods and the field-shape rule.

use solis::{InterpretResult, Value, Vm};

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
fn inheritance_and_method_override() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class A
  var v = 10
  function get() return self.v end
end
class B inherits A
  function get() return self.v + 1 end
end
var o = B(); var r = o.get()
var isA = o is A
var isB = o is B
",
    );
    assert_eq!(number_global(&mut vm, "r"), 11.0);
    assert_eq!(vm.get_global("isA"), Some(Value::TRUE));
    assert_eq!(vm.get_global("isB"), Some(Value::TRUE));
}

#[test]
fn base_class_methods_are_copied_down() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class A
  var v = 5
  function get() return self.v end
end
class B inherits A
end
var o = B()
var r = o.get()
var backwards = A() is B
",
    );
    assert_eq!(number_global(&mut vm, "r"), 5.0);
    assert_eq!(vm.get_global("backwards"), Some(Value::FALSE));
}

#[test]
fn constructor_initializes_fields() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class Point
  var x = 0
  var y = 0
  function Point(x, y)
    self.x = x
    self.y = y
  end
  function sum() return self.x + self.y end
end
var p = Point(3, 4)
var s = p.sum()
",
    );
    assert_eq!(number_global(&mut vm, "s"), 7.0);
}

#[test]
fn constructor_returns_the_instance_implicitly() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class Flag
  var on = false
  function Flag()
    self.on = true
    return
  end
end
var f = Flag()
var on = f.on
",
    );
    assert_eq!(vm.get_global("on"), Some(Value::TRUE));
}

#[test]
fn constructor_arity_is_checked() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret(
            "test",
            "class P\nfunction P(x) self.x = x end\nvar x = 0\nend\nvar p = P()\n"
        ),
        InterpretResult::RuntimeError
    );
}

#[test]
fn plain_class_call_takes_no_arguments() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("test", "class A\nend\nvar a = A(1)\n"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn field_shape_is_fixed_at_construction() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret(
            "test",
            "class A\nvar x = 1\nend\nvar a = A()\na.unknown = 5\n"
        ),
        InterpretResult::RuntimeError
    );
}

#[test]
fn missing_field_read_is_a_runtime_error() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("test", "class A\nend\nvar a = A()\nvar x = a.nope\n"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn statics_live_on_the_class() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class Counter
  static var total = 0
  static function bump()
    Counter.total = Counter.total + 1
    return Counter.total
  end
end
Counter.bump()
Counter.bump()
var t = Counter.total
",
    );
    assert_eq!(number_global(&mut vm, "t"), 2.0);
}

#[test]
fn statics_are_reachable_through_instances() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class A
  static var shared = 42
end
var a = A()
var s = a.shared
",
    );
    assert_eq!(number_global(&mut vm, "s"), 42.0);
}

#[test]
fn statics_are_not_inherited() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret(
            "test",
            "class A\nstatic var s = 1\nend\nclass B inherits A\nend\nvar x = B.s\n"
        ),
        InterpretResult::RuntimeError
    );
}

#[test]
fn bound_methods_carry_their_receiver() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class Greeter
  var name = \"world\"
  function greet() return \"hi \" + self.name end
end
var g = Greeter()
var m = g.greet
var r = m()
",
    );
    let r = vm.get_global("r").expect("r");
    assert_eq!(vm.string_chars(r), "hi world");
}

#[test]
fn fields_shadow_methods() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
function shadow() return 1 end
class A
  var f = null
  function f() return 2 end
  function A()
    self.f = shadow
  end
end
var a = A()
var r = a.f()
",
    );
    assert_eq!(number_global(&mut vm, "r"), 1.0);
}

#[test]
fn instances_of_different_classes_do_not_cross() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
class A
  var v = 1
end
class B
  var v = 2
end
var a = A()
var b = B()
var r = a.v + b.v
var cross = a is B
",
    );
    assert_eq!(number_global(&mut vm, "r"), 3.0);
    assert_eq!(vm.get_global("cross"), Some(Value::FALSE));
}

#[test]
fn methods_on_primitives_dispatch_through_builtin_classes() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "var n = 3.9.truncate()\nvar is_num = 5 is Number\nvar is_str = \"a\" is String\n",
    );
    assert_eq!(number_global(&mut vm, "n"), 3.0);
    assert_eq!(vm.get_global("is_num"), Some(Value::TRUE));
    assert_eq!(vm.get_global("is_str"), Some(Value::TRUE));
}

#[test]
fn local_classes_work_inside_blocks() {
    let mut vm = Vm::new();
    run(
        &mut vm,
        "\
var r = 0
do
  class Local
    var v = 9
  end
  var l = Local()
  r = l.v
end
",
    );
    assert_eq!(number_global(&mut vm, "r"), 9.0);
}
