//! Mark-sweep garbage collection
//!
//! Tri-color over the slot heap: roots go grey, the worklist drains by
//! blackening (marking each object's outgoing references), then the
//! intern table drops unmarked strings and the sweep frees the rest.
//! The next collection is scheduled at twice the surviving byte count.
//!
//! Roots: the value stack, every frame's closure, the module (globals,
//! name map and top-level closure), the open-upvalue list, the built-in
//! class handles and any temporaries pinned through the embedding API.

use crate::heap::ObjId;
use crate::object::ObjectKind;
use crate::value::Value;
use crate::vm::Vm;

const HEAP_GROW_FACTOR: usize = 2;

impl Vm {
    pub(crate) fn collect_garbage(&mut self) {
        let before = self.heap.allocated_bytes;
        if self.options.gc_log {
            eprintln!("-- gc begin ({before} bytes)");
        }

        self.mark_roots();
        self.trace_references();
        self.heap.sweep_intern_table();
        let freed = self.heap.sweep();

        self.heap.next_gc = self.heap.allocated_bytes * HEAP_GROW_FACTOR;

        if self.options.gc_log {
            eprintln!(
                "-- gc end ({} bytes, {freed} freed, next at {})",
                self.heap.allocated_bytes, self.heap.next_gc
            );
        }
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.mark_value(value);
        }

        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.mark_object(closure);
        }

        self.mark_object(self.module);

        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.mark_object(upvalue);
        }

        let pinned: Vec<Value> = self.heap.temp_roots().to_vec();
        for value in pinned {
            self.mark_value(value);
        }

        for class in [
            self.builtins.number,
            self.builtins.string,
            self.builtins.bool_class,
            self.builtins.list,
        ]
        .into_iter()
        .flatten()
        {
            self.mark_object(class);
        }
    }

    fn mark_value(&mut self, value: Value) {
        if value.is_object() {
            self.mark_object(value.as_object());
        }
    }

    fn mark_object(&mut self, id: ObjId) {
        let object = self.heap.get_mut(id);
        if object.marked {
            return;
        }
        object.marked = true;
        self.heap.grey.push(id);
    }

    fn trace_references(&mut self) {
        while let Some(id) = self.heap.grey.pop() {
            self.blacken(id);
        }
    }

    /// Mark everything `id` points at, by object type.
    fn blacken(&mut self, id: ObjId) {
        let mut references: Vec<Value> = Vec::new();
        let object = self.heap.get(id);
        if let Some(class) = object.class {
            references.push(Value::object(class));
        }

        match &object.kind {
            ObjectKind::Str(_) | ObjectKind::Native(_) | ObjectKind::Userdata(_) => {}
            ObjectKind::Function(function) => {
                if let Some(name) = function.name {
                    references.push(Value::object(name));
                }
                references.extend_from_slice(&function.chunk.constants);
            }
            ObjectKind::Closure(closure) => {
                references.push(Value::object(closure.function));
                references.extend(closure.upvalues.iter().map(|&u| Value::object(u)));
            }
            ObjectKind::Upvalue(upvalue) => {
                if let crate::object::UpvalueState::Closed(value) = upvalue.state {
                    references.push(value);
                }
            }
            ObjectKind::Class(class) => {
                references.push(Value::object(class.name));
                for (key, value) in class
                    .fields
                    .iter()
                    .chain(class.methods.iter())
                    .chain(class.statics.iter())
                {
                    references.push(Value::object(key));
                    references.push(value);
                }
                if let Some(constructor) = class.constructor {
                    references.push(Value::object(constructor));
                }
                references.extend(class.operators.iter().flatten().map(|&o| Value::object(o)));
                if let Some(parent) = class.parent {
                    references.push(Value::object(parent));
                }
            }
            ObjectKind::Instance(instance) => {
                references.push(Value::object(instance.class));
                for (key, value) in instance.fields.iter() {
                    references.push(Value::object(key));
                    references.push(value);
                }
            }
            ObjectKind::BoundMethod(bound) => {
                references.push(bound.receiver);
                references.push(Value::object(bound.method));
            }
            ObjectKind::List(list) => {
                references.extend_from_slice(&list.values);
            }
            ObjectKind::Enum(members) => {
                for (key, value) in members.members.iter() {
                    references.push(Value::object(key));
                    references.push(value);
                }
            }
            ObjectKind::Module(module) => {
                if let Some(closure) = module.closure {
                    references.push(Value::object(closure));
                }
                for (key, value) in module.global_map.iter() {
                    references.push(Value::object(key));
                    references.push(value);
                }
                references.extend_from_slice(&module.globals);
            }
        }

        for value in references {
            self.mark_value(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::List;

    #[test]
    fn unreachable_objects_are_swept() {
        let mut vm = Vm::new();
        let garbage = vm.heap.alloc(ObjectKind::List(List::default()));
        assert!(vm.heap.is_live(garbage));

        vm.collect_garbage();
        assert!(!vm.heap.is_live(garbage));
    }

    #[test]
    fn rooted_objects_survive() {
        let mut vm = Vm::new();
        let list = vm.heap.alloc(ObjectKind::List(List::default()));
        vm.push(Value::object(list));

        vm.collect_garbage();
        assert!(vm.heap.is_live(list));

        vm.pop();
        vm.collect_garbage();
        assert!(!vm.heap.is_live(list));
    }

    #[test]
    fn intern_table_is_weak() {
        let mut vm = Vm::new();
        let hello = vm.heap.intern("a string nothing references");
        assert!(vm.heap.is_live(hello));

        vm.collect_garbage();
        assert!(!vm.heap.is_live(hello));

        // Re-interning after collection builds a fresh object.
        let again = vm.heap.intern("a string nothing references");
        assert!(vm.heap.is_live(again));
    }

    #[test]
    fn interned_survivor_keeps_its_identity() {
        let mut vm = Vm::new();
        let kept = vm.heap.intern("kept");
        vm.push(Value::object(kept));

        vm.collect_garbage();
        assert_eq!(vm.heap.intern("kept"), kept);
    }

    #[test]
    fn reachability_is_transitive() {
        let mut vm = Vm::new();
        let inner = vm.heap.alloc(ObjectKind::List(List::default()));
        let outer = vm.heap.alloc(ObjectKind::List(List {
            values: vec![Value::object(inner)],
        }));
        vm.push(Value::object(outer));

        vm.collect_garbage();
        assert!(vm.heap.is_live(outer));
        assert!(vm.heap.is_live(inner));
    }

    #[test]
    fn temp_roots_pin_values() {
        let mut vm = Vm::new();
        let pinned = vm.heap.alloc(ObjectKind::List(List::default()));
        vm.heap.push_root(Value::object(pinned));

        vm.collect_garbage();
        assert!(vm.heap.is_live(pinned));

        vm.heap.pop_root();
        vm.collect_garbage();
        assert!(!vm.heap.is_live(pinned));
    }

    #[test]
    fn collection_reschedules_the_threshold() {
        let mut vm = Vm::new();
        vm.collect_garbage();
        assert_eq!(vm.heap.next_gc, vm.heap.allocated_bytes * 2);
    }
}
