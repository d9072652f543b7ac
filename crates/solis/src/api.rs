//! Embedding API
//!
//! The host-facing surface: stack access, argument and return slots for
//! native callbacks, global and class registration, and scripted
//! invocation from host code. Every entry point that allocates while
//! holding raw values pins them first so a collection scheduled by that
//! allocation cannot free them out from under the caller.
//!
//! Inside a native callback the VM exposes a window onto the stack:
//! slot 0 is the receiver (or the callee itself) and doubles as the
//! return slot; arguments follow at slots 1..=arity.

use std::any::Any;

use crate::heap::ObjId;
use crate::object::{
    BoundMethod, Class, EnumObject, Instance, NativeFn, NativeFunction, ObjectKind, Operator,
    Userdata, UserdataDrop,
};
use crate::value::Value;
use crate::vm::Vm;

const MAX_CALL_ARGS: usize = 16;

impl Vm {
    // ---- native-call window ----

    /// Argument `index` of the running native call (zero-based).
    pub fn get_argument(&self, index: usize) -> Value {
        let base = self.api_stack.expect("not inside a native call");
        self.stack[base + index + 1]
    }

    /// The receiver of the running native call.
    pub fn get_self(&self) -> Value {
        let base = self.api_stack.expect("not inside a native call");
        self.stack[base]
    }

    /// Write the native call's result into the return slot.
    pub fn set_return_value(&mut self, value: Value) {
        let base = self.api_stack.expect("not inside a native call");
        self.stack[base] = value;
    }

    /// Fetch a numeric argument, arming an error when the type is wrong.
    pub fn arg_number(&mut self, index: usize) -> Option<f64> {
        let value = self.get_argument(index);
        if value.is_number() {
            return Some(value.as_number());
        }
        self.raise_error(format!("Argument {index} must be a number."));
        None
    }

    /// Fetch a string argument, arming an error when the type is wrong.
    pub fn arg_string(&mut self, index: usize) -> Option<ObjId> {
        let value = self.get_argument(index);
        if value.is_object()
            && matches!(self.heap.get(value.as_object()).kind, ObjectKind::Str(_))
        {
            return Some(value.as_object());
        }
        self.raise_error(format!("Argument {index} must be a string."));
        None
    }

    /// Arm the error state; the dispatch loop unwinds with this message
    /// when the native returns `false`.
    pub fn raise_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    // ---- globals ----

    /// Define (or overwrite) a module global.
    pub fn push_global(&mut self, name: &str, value: Value) {
        self.heap.push_root(value);
        let name_id = self.intern(name);
        self.heap.push_root(Value::object(name_id));

        let hash = self.heap.str_hash(name_id);
        let module = self.heap.module_mut(self.module);
        let index = match module.global_map.get(name_id, hash) {
            Some(existing) => existing.as_number() as usize,
            None => {
                // The name map, not the dense array, is the slot
                // authority: the compiler reserves entries ahead of
                // materializing their storage.
                let index = module.global_map.len();
                module
                    .global_map
                    .insert(name_id, hash, Value::number(index as f64));
                index
            }
        };
        if module.globals.len() <= index {
            module.globals.resize(index + 1, Value::NULL);
        }
        module.globals[index] = value;

        self.heap.pop_root();
        self.heap.pop_root();
    }

    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);
        let module = self.heap.module(self.module);
        module.global_map.get(name_id, hash).map(|index| {
            module
                .globals
                .get(index.as_number() as usize)
                .copied()
                .unwrap_or(Value::NULL)
        })
    }

    pub fn global_exists(&mut self, name: &str) -> bool {
        self.get_global(name).is_some()
    }

    /// Register a host function as a global.
    pub fn push_global_native(&mut self, name: &str, function: NativeFn, arity: u8) {
        let native = self.alloc(ObjectKind::Native(NativeFunction { function, arity }));
        self.heap.push_root(Value::object(native));
        self.push_global(name, Value::object(native));
        self.heap.pop_root();
    }

    // ---- class sculpting ----

    /// Create a class and expose it as a global of the same name.
    pub fn create_class(&mut self, name: &str) -> Value {
        let name_id = self.intern(name);
        self.heap.push_root(Value::object(name_id));
        let class = self.alloc(ObjectKind::Class(Class::new(name_id)));
        self.heap.pop_root();

        self.heap.push_root(Value::object(class));
        self.push_global(name, Value::object(class));
        self.heap.pop_root();
        Value::object(class)
    }

    /// Instantiate `class` and expose the instance as a global.
    pub fn create_class_instance(&mut self, name: &str, class: Value) -> Value {
        let class_id = class.as_object();
        self.heap.push_root(class);
        let fields = self.heap.class(class_id).fields.clone();
        let instance = self.alloc(ObjectKind::Instance(Instance {
            class: class_id,
            fields,
        }));
        self.heap.get_mut(instance).class = Some(class_id);
        self.heap.pop_root();

        self.heap.push_root(Value::object(instance));
        self.push_global(name, Value::object(instance));
        self.heap.pop_root();
        Value::object(instance)
    }

    /// Add an instance field default (or a static member) to a class.
    pub fn add_class_field(&mut self, class: Value, name: &str, is_static: bool, default: Value) {
        self.heap.push_root(class);
        self.heap.push_root(default);
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);

        let class_obj = self.heap.class_mut(class.as_object());
        let table = if is_static {
            &mut class_obj.statics
        } else {
            &mut class_obj.fields
        };
        table.insert(name_id, hash, default);

        self.heap.pop_root();
        self.heap.pop_root();
    }

    pub fn add_class_native_method(
        &mut self,
        class: Value,
        name: &str,
        function: NativeFn,
        arity: u8,
    ) {
        self.add_native_member(class, name, function, arity, false);
    }

    pub fn add_class_native_static_method(
        &mut self,
        class: Value,
        name: &str,
        function: NativeFn,
        arity: u8,
    ) {
        self.add_native_member(class, name, function, arity, true);
    }

    fn add_native_member(
        &mut self,
        class: Value,
        name: &str,
        function: NativeFn,
        arity: u8,
        is_static: bool,
    ) {
        self.heap.push_root(class);
        let name_id = self.intern(name);
        self.heap.push_root(Value::object(name_id));
        let native = self.alloc(ObjectKind::Native(NativeFunction { function, arity }));
        let hash = self.heap.str_hash(name_id);

        let class_obj = self.heap.class_mut(class.as_object());
        let table = if is_static {
            &mut class_obj.statics
        } else {
            &mut class_obj.methods
        };
        table.insert(name_id, hash, Value::object(native));

        self.heap.pop_root();
        self.heap.pop_root();
    }

    /// Bind a host function into one of the class's operator slots. The
    /// callable's arity comes from the operator.
    pub fn add_class_native_operator(&mut self, class: Value, op: Operator, function: NativeFn) {
        self.heap.push_root(class);
        let native = self.alloc(ObjectKind::Native(NativeFunction {
            function,
            arity: op.arity(),
        }));
        self.heap.class_mut(class.as_object()).operators[op as usize] = Some(native);
        self.heap.pop_root();
    }

    /// Bind any callable (closure or native) into an operator slot.
    /// Returns false when `callable` is not a heap object.
    pub fn add_class_operator(&mut self, class: Value, op: Operator, callable: Value) -> bool {
        if !callable.is_object() {
            return false;
        }
        self.heap.class_mut(class.as_object()).operators[op as usize] =
            Some(callable.as_object());
        true
    }

    // ---- instance and static fields ----

    /// Write an existing instance field. Unknown names are refused, which
    /// preserves the field shape fixed at construction.
    pub fn set_instance_field(&mut self, instance: Value, name: &str, value: Value) -> bool {
        self.heap.push_root(instance);
        self.heap.push_root(value);
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);
        let stored = self
            .heap
            .instance_mut(instance.as_object())
            .fields
            .set_existing(name_id, hash, value);
        self.heap.pop_root();
        self.heap.pop_root();
        stored
    }

    pub fn get_instance_field(&mut self, instance: Value, name: &str) -> Option<Value> {
        self.heap.push_root(instance);
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);
        let value = self
            .heap
            .instance(instance.as_object())
            .fields
            .get(name_id, hash);
        self.heap.pop_root();
        value
    }

    fn class_of(&self, value: Value) -> Option<ObjId> {
        if !value.is_object() {
            return None;
        }
        let id = value.as_object();
        match &self.heap.get(id).kind {
            ObjectKind::Class(_) => Some(id),
            ObjectKind::Instance(instance) => Some(instance.class),
            _ => None,
        }
    }

    /// Write an existing static member, through a class or an instance.
    pub fn set_static_field(&mut self, class_or_instance: Value, name: &str, value: Value) -> bool {
        let Some(class) = self.class_of(class_or_instance) else {
            return false;
        };
        self.heap.push_root(class_or_instance);
        self.heap.push_root(value);
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);
        let stored = self
            .heap
            .class_mut(class)
            .statics
            .set_existing(name_id, hash, value);
        self.heap.pop_root();
        self.heap.pop_root();
        stored
    }

    pub fn get_static_field(&mut self, class_or_instance: Value, name: &str) -> Option<Value> {
        let class = self.class_of(class_or_instance)?;
        self.heap.push_root(class_or_instance);
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);
        let value = self.heap.class(class).statics.get(name_id, hash);
        self.heap.pop_root();
        value
    }

    // ---- enums ----

    /// Create an enum object and expose it as a global.
    pub fn create_enum(&mut self, name: &str) -> Value {
        let enum_obj = self.alloc(ObjectKind::Enum(EnumObject::default()));
        self.heap.push_root(Value::object(enum_obj));
        self.push_global(name, Value::object(enum_obj));
        self.heap.pop_root();
        Value::object(enum_obj)
    }

    /// Append a member to an enum; values count up from zero.
    pub fn bind_enum_entry(&mut self, enum_value: Value, name: &str) {
        self.heap.push_root(enum_value);
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);

        let members = self.heap.enum_obj_mut(enum_value.as_object());
        let value = Value::number(members.count as f64);
        if members.members.insert(name_id, hash, value) {
            members.count += 1;
        }
        self.heap.pop_root();
    }

    // ---- userdata ----

    /// Wrap an opaque host value; `cleanup` runs when the object is
    /// freed (by the collector or VM teardown).
    pub fn create_userdata(&mut self, data: Box<dyn Any>, cleanup: Option<UserdataDrop>) -> Value {
        let id = self.alloc(ObjectKind::Userdata(Userdata { data, cleanup }));
        Value::object(id)
    }

    // ---- convenience constructors ----

    /// Intern a string and hand back its value.
    pub fn string_value(&mut self, chars: &str) -> Value {
        Value::object(self.intern(chars))
    }

    pub fn string_chars(&self, value: Value) -> &str {
        self.heap.str_chars(value.as_object())
    }

    /// Render any value the way `print` would.
    pub fn display(&self, value: Value) -> String {
        self.heap.format_value(value)
    }

    // ---- heap control ----

    /// Force a full collection.
    pub fn collect(&mut self) {
        self.collect_garbage();
    }

    /// Bytes currently attributed to live objects.
    pub fn allocated_bytes(&self) -> usize {
        self.heap.allocated_bytes
    }

    /// Number of live heap objects.
    pub fn live_object_count(&self) -> usize {
        self.heap.live_objects().count()
    }

    // ---- scripted invocation ----

    /// Call a scripted (or native) callable from host code, reusing the
    /// dispatch loop. Refused while a native callback is running, since
    /// that would clobber the call window.
    pub fn call_function(&mut self, callable: Value, args: &[Value]) -> Result<Value, String> {
        if self.api_stack.is_some() {
            return Err("Re-entrant native call.".to_string());
        }
        if args.len() > MAX_CALL_ARGS {
            return Err(format!("Can't pass more than {MAX_CALL_ARGS} arguments."));
        }

        let base = self.stack.len();
        self.push(callable);
        for &arg in args {
            self.push(arg);
        }

        let entry_frames = self.frames.len();
        if let Err(err) = self.call_value(callable, args.len() as u8) {
            self.stack.truncate(base);
            return Err(err.message);
        }

        if self.frames.len() > entry_frames {
            match self.run(entry_frames) {
                Ok(value) => Ok(value),
                Err(err) => {
                    // Unwind whatever the failed run left behind.
                    self.frames.truncate(entry_frames);
                    self.stack.truncate(base);
                    self.open_upvalues
                        .retain(|&u| match self.heap.upvalue(u).state {
                            crate::object::UpvalueState::Open(slot) => slot < base,
                            crate::object::UpvalueState::Closed(_) => false,
                        });
                    Err(err.message)
                }
            }
        } else {
            // Natives and argument-less constructions finish in place.
            Ok(self.pop())
        }
    }

    /// Look up `name` on an instance (or any receiver's class) and call
    /// it with the receiver in place.
    pub fn call_instance_method(
        &mut self,
        receiver: Value,
        name: &str,
        args: &[Value],
    ) -> Result<Value, String> {
        if self.api_stack.is_some() {
            return Err("Re-entrant native call.".to_string());
        }
        if args.len() > MAX_CALL_ARGS {
            return Err(format!("Can't pass more than {MAX_CALL_ARGS} arguments."));
        }

        self.heap.push_root(receiver);
        let name_id = self.intern(name);
        let hash = self.heap.str_hash(name_id);
        self.heap.pop_root();

        let Some(class) = self.class_for_value(receiver) else {
            return Err(format!("Undefined method '{name}'."));
        };
        let method = {
            let class_obj = self.heap.class(class);
            class_obj
                .methods
                .get(name_id, hash)
                .or_else(|| class_obj.statics.get(name_id, hash))
        };
        let Some(method) = method else {
            return Err(format!("Undefined method '{name}'."));
        };
        if !method.is_object() {
            return Err("Can only call functions and classes.".to_string());
        }

        // Field-shaped members holding callables go through call_function
        // with an explicit bound method instead.
        self.heap.push_root(receiver);
        let bound = self.alloc(ObjectKind::BoundMethod(BoundMethod {
            receiver,
            method: method.as_object(),
        }));
        self.heap.pop_root();
        self.call_function(Value::object(bound), args)
    }
}
