//! The core module
//!
//! Registers the built-in classes through the embedding API at VM
//! construction: `Number`, `String`, `Bool`, `List`, `Range` and the
//! `print` global. Operator slots on the built-in classes are what make
//! plain arithmetic work, since the VM dispatches every operator through
//! the receiver's class. A sandboxed VM skips the OS surface.

use crate::heap::Heap;
use crate::object::{Instance, ObjectKind, Operator};
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn initialize(vm: &mut Vm) {
    vm.push_global_native("print", core_print, 1);

    let number = vm.create_class("Number");
    vm.add_class_field(number, "MIN", true, Value::number(f64::MIN_POSITIVE));
    vm.add_class_field(number, "MAX", true, Value::number(f64::MAX));
    vm.add_class_field(number, "PI", true, Value::number(std::f64::consts::PI));
    vm.add_class_field(number, "TAU", true, Value::number(std::f64::consts::TAU));
    vm.add_class_native_method(number, "toString", num_to_string, 0);
    vm.add_class_native_method(number, "truncate", num_truncate, 0);
    vm.add_class_native_operator(number, Operator::Add, num_add);
    vm.add_class_native_operator(number, Operator::Subtract, num_subtract);
    vm.add_class_native_operator(number, Operator::Multiply, num_multiply);
    vm.add_class_native_operator(number, Operator::Divide, num_divide);
    vm.add_class_native_operator(number, Operator::FloorDivide, num_floor_divide);
    vm.add_class_native_operator(number, Operator::Power, num_power);
    vm.add_class_native_operator(number, Operator::DotDot, num_dotdot);

    let string = vm.create_class("String");
    vm.add_class_native_method(string, "length", string_length, 0);
    vm.add_class_native_operator(string, Operator::Add, string_add);

    let bool_class = vm.create_class("Bool");

    let list = vm.create_class("List");
    vm.add_class_native_method(list, "at", list_at, 1);
    vm.add_class_native_method(list, "length", list_length, 0);
    vm.add_class_native_method(list, "append", list_append, 1);
    vm.add_class_native_method(list, "insert", list_insert, 2);
    vm.add_class_native_method(list, "removeAt", list_remove_at, 1);
    vm.add_class_native_method(list, "iterate", list_iterate, 1);
    vm.add_class_native_method(list, "iteratorValue", list_iterator_value, 1);
    vm.add_class_native_operator(list, Operator::SubscriptGet, list_subscript_get);
    vm.add_class_native_operator(list, Operator::SubscriptSet, list_subscript_set);

    let range = vm.create_class("Range");
    vm.add_class_field(range, "min", false, Value::NULL);
    vm.add_class_field(range, "max", false, Value::NULL);
    vm.add_class_native_method(range, "iterate", range_iterate, 1);
    vm.add_class_native_method(range, "iteratorValue", range_iterator_value, 1);

    vm.builtins.number = Some(number.as_object());
    vm.builtins.string = Some(string.as_object());
    vm.builtins.bool_class = Some(bool_class.as_object());
    vm.builtins.list = Some(list.as_object());

    if !vm.options().sandboxed {
        let os = vm.create_class("OS");
        vm.add_class_native_static_method(os, "getPlatformString", os_platform_string, 0);
    }
}

fn core_print(vm: &mut Vm) -> bool {
    let value = vm.get_argument(0);
    println!("{}", vm.display(value));
    vm.set_return_value(Value::NULL);
    true
}

// ---- Number ----

fn num_to_string(vm: &mut Vm) -> bool {
    let text = Heap::format_number(vm.get_self().as_number());
    let result = vm.string_value(&text);
    vm.set_return_value(result);
    true
}

fn num_truncate(vm: &mut Vm) -> bool {
    let value = vm.get_self().as_number();
    vm.set_return_value(Value::number(value.trunc()));
    true
}

fn num_binary(vm: &mut Vm, op: Operator, apply: fn(f64, f64) -> f64) -> bool {
    let Some(rhs) = vm.arg_number(0) else {
        vm.raise_error(format!(
            "Right operand of '{}' must be a number.",
            op.symbol()
        ));
        return false;
    };
    let lhs = vm.get_self().as_number();
    vm.set_return_value(Value::number(apply(lhs, rhs)));
    true
}

fn num_add(vm: &mut Vm) -> bool {
    num_binary(vm, Operator::Add, |a, b| a + b)
}

fn num_subtract(vm: &mut Vm) -> bool {
    num_binary(vm, Operator::Subtract, |a, b| a - b)
}

fn num_multiply(vm: &mut Vm) -> bool {
    num_binary(vm, Operator::Multiply, |a, b| a * b)
}

fn num_divide(vm: &mut Vm) -> bool {
    num_binary(vm, Operator::Divide, |a, b| a / b)
}

fn num_floor_divide(vm: &mut Vm) -> bool {
    num_binary(vm, Operator::FloorDivide, |a, b| (a / b).floor())
}

fn num_power(vm: &mut Vm) -> bool {
    num_binary(vm, Operator::Power, f64::powf)
}

/// `min..max` builds a Range instance with inclusive bounds.
fn num_dotdot(vm: &mut Vm) -> bool {
    let Some(max) = vm.arg_number(0) else {
        vm.raise_error("Right operand of '..' must be a number.");
        return false;
    };
    let min = vm.get_self().as_number();

    let Some(range_class) = vm.get_global("Range") else {
        vm.raise_error("Range class is not registered.");
        return false;
    };
    let class_id = range_class.as_object();
    let fields = vm.heap.class(class_id).fields.clone();
    let instance = vm.alloc(ObjectKind::Instance(Instance {
        class: class_id,
        fields,
    }));
    vm.heap.get_mut(instance).class = Some(class_id);

    let range = Value::object(instance);
    // The return slot roots the instance while the fields are written.
    vm.set_return_value(range);
    vm.set_instance_field(range, "min", Value::number(min));
    vm.set_instance_field(range, "max", Value::number(max));
    true
}

// ---- String ----

fn string_length(vm: &mut Vm) -> bool {
    let this = vm.get_self();
    let length = vm.string_chars(this).len() as f64;
    vm.set_return_value(Value::number(length));
    true
}

fn string_add(vm: &mut Vm) -> bool {
    let Some(rhs) = vm.arg_string(0) else {
        vm.raise_error("Can only concatenate a string to a string.");
        return false;
    };
    let lhs = vm.get_self().as_object();
    let joined = vm.concatenate(lhs, rhs);
    vm.set_return_value(Value::object(joined));
    true
}

// ---- List ----

fn list_bounds(vm: &mut Vm, index: f64, len: usize) -> Option<usize> {
    if index < 0.0 || index.fract() != 0.0 || index as usize >= len {
        vm.raise_error("List index out of bounds.");
        return None;
    }
    Some(index as usize)
}

fn list_at(vm: &mut Vm) -> bool {
    let Some(index) = vm.arg_number(0) else {
        return false;
    };
    let this = vm.get_self().as_object();
    let len = vm.heap.list(this).values.len();
    let Some(index) = list_bounds(vm, index, len) else {
        return false;
    };
    let value = vm.heap.list(this).values[index];
    vm.set_return_value(value);
    true
}

fn list_length(vm: &mut Vm) -> bool {
    let this = vm.get_self().as_object();
    let length = vm.heap.list(this).values.len() as f64;
    vm.set_return_value(Value::number(length));
    true
}

fn list_append(vm: &mut Vm) -> bool {
    let value = vm.get_argument(0);
    let this = vm.get_self().as_object();
    vm.heap.list_mut(this).values.push(value);
    vm.set_return_value(Value::NULL);
    true
}

fn list_insert(vm: &mut Vm) -> bool {
    let Some(index) = vm.arg_number(0) else {
        return false;
    };
    let value = vm.get_argument(1);
    let this = vm.get_self().as_object();
    let len = vm.heap.list(this).values.len();
    // Inserting at the end is allowed.
    if index < 0.0 || index.fract() != 0.0 || index as usize > len {
        vm.raise_error("List index out of bounds.");
        return false;
    }
    vm.heap.list_mut(this).values.insert(index as usize, value);
    vm.set_return_value(Value::NULL);
    true
}

fn list_remove_at(vm: &mut Vm) -> bool {
    let Some(index) = vm.arg_number(0) else {
        return false;
    };
    let this = vm.get_self().as_object();
    let len = vm.heap.list(this).values.len();
    let Some(index) = list_bounds(vm, index, len) else {
        return false;
    };
    let removed = vm.heap.list_mut(this).values.remove(index);
    vm.set_return_value(removed);
    true
}

fn list_subscript_get(vm: &mut Vm) -> bool {
    list_at(vm)
}

fn list_subscript_set(vm: &mut Vm) -> bool {
    let Some(index) = vm.arg_number(0) else {
        return false;
    };
    let value = vm.get_argument(1);
    let this = vm.get_self().as_object();
    let len = vm.heap.list(this).values.len();
    let Some(index) = list_bounds(vm, index, len) else {
        return false;
    };
    vm.heap.list_mut(this).values[index] = value;
    vm.set_return_value(Value::NULL);
    true
}

fn list_iterate(vm: &mut Vm) -> bool {
    let iterator = vm.get_argument(0);
    let this = vm.get_self().as_object();
    let len = vm.heap.list(this).values.len();

    let next = if iterator.is_null() {
        if len == 0 { None } else { Some(0.0) }
    } else if iterator.is_number() {
        let next = iterator.as_number() + 1.0;
        if (next as usize) < len { Some(next) } else { None }
    } else {
        vm.raise_error("Iterator must be null or a number.");
        return false;
    };

    vm.set_return_value(next.map_or(Value::FALSE, Value::number));
    true
}

fn list_iterator_value(vm: &mut Vm) -> bool {
    let Some(index) = vm.arg_number(0) else {
        return false;
    };
    let this = vm.get_self().as_object();
    let len = vm.heap.list(this).values.len();
    let Some(index) = list_bounds(vm, index, len) else {
        return false;
    };
    let value = vm.heap.list(this).values[index];
    vm.set_return_value(value);
    true
}

// ---- Range ----

fn range_bounds(vm: &mut Vm) -> Option<(f64, f64)> {
    let this = vm.get_self();
    let min = vm.get_instance_field(this, "min")?;
    let max = vm.get_instance_field(this, "max")?;
    if !min.is_number() || !max.is_number() {
        vm.raise_error("Range bounds must be numbers.");
        return None;
    }
    Some((min.as_number(), max.as_number()))
}

/// Inclusive iteration: null starts at `min`, `false` ends the loop.
fn range_iterate(vm: &mut Vm) -> bool {
    let Some((min, max)) = range_bounds(vm) else {
        return false;
    };
    let iterator = vm.get_argument(0);

    let next = if iterator.is_null() {
        if min <= max { Some(min) } else { None }
    } else if iterator.is_number() {
        let next = iterator.as_number() + 1.0;
        if next <= max { Some(next) } else { None }
    } else {
        vm.raise_error("Iterator must be null or a number.");
        return false;
    };

    vm.set_return_value(next.map_or(Value::FALSE, Value::number));
    true
}

fn range_iterator_value(vm: &mut Vm) -> bool {
    let value = vm.get_argument(0);
    vm.set_return_value(value);
    true
}

// ---- OS ----

fn os_platform_string(vm: &mut Vm) -> bool {
    let platform = vm.string_value(std::env::consts::OS);
    vm.set_return_value(platform);
    true
}
