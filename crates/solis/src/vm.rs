//! The virtual machine
//!
//! A stack machine driving the opcode set emitted by the compiler. The VM
//! owns the heap, the value and call-frame stacks, the current module and
//! the open-upvalue list. Arithmetic, subscripting and `..` dispatch
//! through the receiver class's operator slots, so built-ins and user
//! classes share one calling path; `==`, `!=` and `!` are handled
//! directly.
//!
//! Runtime tuning follows environment variables: `SOLIS_TRACE=1` dumps
//! the stack and each instruction as it executes, `SOLIS_GC_STRESS=1`
//! collects on every allocation, `SOLIS_GC_LOG=1` logs collections.

use crate::chunk::OpCode;
use crate::compiler::compile;
use crate::error::{InterpretResult, runtime_error_report};
use crate::heap::{Heap, ObjId};
use crate::object::{
    BoundMethod, Class, Closure, Instance, List, Module, ObjectKind, Operator, Upvalue,
    UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

pub(crate) const FRAMES_MAX: usize = 64;
pub(crate) const STACK_MAX: usize = FRAMES_MAX * 256;

/// Host-tunable VM behavior. Environment variables override whatever the
/// embedder passes in.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Skip registration of the OS surface.
    pub sandboxed: bool,
    /// Collect on every allocation instead of on the byte threshold.
    pub gc_stress: bool,
    /// Log collections to stderr.
    pub gc_log: bool,
    /// Trace execution to stderr, one instruction per line.
    pub trace: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl VmOptions {
    /// Apply `SOLIS_SANDBOX`, `SOLIS_GC_STRESS`, `SOLIS_GC_LOG` and
    /// `SOLIS_TRACE` on top of the configured options.
    pub fn from_env(mut self) -> VmOptions {
        self.sandboxed |= env_flag("SOLIS_SANDBOX");
        self.gc_stress |= env_flag("SOLIS_GC_STRESS");
        self.gc_log |= env_flag("SOLIS_GC_LOG");
        self.trace |= env_flag("SOLIS_TRACE");
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    pub closure: ObjId,
    /// The closure's function, cached so the dispatch loop takes one hop.
    pub function: ObjId,
    pub ip: usize,
    /// Stack index of slot zero (the callee or receiver).
    pub slots: usize,
}

#[derive(Debug)]
pub(crate) struct RuntimeError {
    pub message: String,
    pub line: u32,
}

/// Built-in class handles, filled in by the core module.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Builtins {
    pub number: Option<ObjId>,
    pub string: Option<ObjId>,
    pub bool_class: Option<ObjId>,
    pub list: Option<ObjId>,
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) heap: Heap,
    pub(crate) module: ObjId,
    /// Open upvalues ordered by strictly decreasing stack slot.
    pub(crate) open_upvalues: Vec<ObjId>,
    /// Base of the native-call window while a host callback runs.
    pub(crate) api_stack: Option<usize>,
    /// Message armed by `raise_error` inside a native callback.
    pub(crate) error: Option<String>,
    pub(crate) options: VmOptions,
    pub(crate) builtins: Builtins,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default().from_env())
    }

    pub fn with_options(options: VmOptions) -> Vm {
        let mut heap = Heap::new();
        let module = heap.alloc(ObjectKind::Module(Module {
            name: "main".to_string(),
            source: String::new(),
            closure: None,
            global_map: Table::new(),
            globals: Vec::new(),
        }));

        let mut vm = Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::new(),
            heap,
            module,
            open_upvalues: Vec::new(),
            api_stack: None,
            error: None,
            options,
            builtins: Builtins::default(),
        };
        crate::core::initialize(&mut vm);
        vm
    }

    pub fn options(&self) -> VmOptions {
        self.options
    }

    /// Compile and run `source` against the persistent module.
    pub fn interpret(&mut self, module_name: &str, source: &str) -> InterpretResult {
        {
            let module = self.heap.module_mut(self.module);
            module.name = module_name.to_string();
            module.source = source.to_string();
        }

        let Some(function) = compile(&mut self.heap, self.module, source) else {
            return InterpretResult::CompileError;
        };

        // The compiler reserved global slots; make the dense array match.
        let global_count = self.heap.module(self.module).global_map.len();
        self.heap
            .module_mut(self.module)
            .globals
            .resize(global_count, Value::NULL);

        self.push(Value::object(function));
        let closure = self.alloc(ObjectKind::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::object(closure));
        self.heap.module_mut(self.module).closure = Some(closure);

        if let Err(err) = self.call_closure(closure, 0) {
            self.report_runtime_error(&err);
            self.reset();
            return InterpretResult::RuntimeError;
        }

        match self.run(0) {
            Ok(_) => InterpretResult::Ok,
            Err(err) => {
                self.report_runtime_error(&err);
                self.reset();
                InterpretResult::RuntimeError
            }
        }
    }

    fn report_runtime_error(&self, err: &RuntimeError) {
        let module = self.heap.module(self.module);
        eprint!(
            "{}",
            runtime_error_report(&err.message, err.line, &module.name, &module.source)
        );
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.api_stack = None;
        self.error = None;
    }

    // ---- stack primitives ----

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    pub fn peek(&self, offset: usize) -> Value {
        self.stack[self.stack.len() - 1 - offset]
    }

    #[inline]
    fn peek_mut(&mut self, offset: usize) -> &mut Value {
        let index = self.stack.len() - 1 - offset;
        &mut self.stack[index]
    }

    // ---- allocation (GC-aware) ----

    /// All VM-side allocation funnels through here so the collector can
    /// run while the full root set is visible.
    pub(crate) fn alloc(&mut self, kind: ObjectKind) -> ObjId {
        self.maybe_collect();
        self.heap.alloc(kind)
    }

    pub(crate) fn intern(&mut self, chars: &str) -> ObjId {
        self.maybe_collect();
        self.heap.intern(chars)
    }

    /// Concatenate two interned strings; both operands must be rooted by
    /// the caller (natives have them on the api window).
    pub(crate) fn concatenate(&mut self, a: ObjId, b: ObjId) -> ObjId {
        self.heap.push_root(Value::object(a));
        self.heap.push_root(Value::object(b));
        self.maybe_collect();
        let joined = self.heap.concatenate(a, b);
        self.heap.pop_root();
        self.heap.pop_root();
        joined
    }

    fn maybe_collect(&mut self) {
        if self.options.gc_stress || self.heap.allocated_bytes > self.heap.next_gc {
            self.collect_garbage();
        }
    }

    // ---- errors ----

    pub(crate) fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let line = self
            .frames
            .last()
            .map(|frame| {
                let chunk = &self.heap.function(frame.function).chunk;
                chunk.line_at(frame.ip.saturating_sub(1))
            })
            .unwrap_or(0);
        RuntimeError {
            message: message.into(),
            line,
        }
    }

    // ---- instruction reading ----

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last().expect("no active call frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        self.frames.last_mut().expect("no active call frame").ip += 1;
        byte
    }

    #[inline]
    fn read_short(&mut self) -> u16 {
        (self.read_byte() as u16) << 8 | self.read_byte() as u16
    }

    #[inline]
    fn read_constant(&mut self, index: u16) -> Value {
        let frame = self.frames.last().expect("no active call frame");
        self.heap.function(frame.function).chunk.constants[index as usize]
    }

    fn read_string_constant(&mut self, index: u16) -> ObjId {
        self.read_constant(index).as_object()
    }

    // ---- the dispatch loop ----

    /// Run until the frame stack shrinks back to `exit_frames`, returning
    /// the value produced by the frame that closed the run.
    pub(crate) fn run(&mut self, exit_frames: usize) -> Result<Value, RuntimeError> {
        loop {
            if self.options.trace {
                self.trace_instruction();
            }

            let op = OpCode::from_byte(self.read_byte());
            match op {
                OpCode::Constant => {
                    let index = self.read_byte() as u16;
                    let value = self.read_constant(index);
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let index = self.read_short();
                    let value = self.read_constant(index);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::NULL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),

                OpCode::Negate => {
                    let top = self.peek(0);
                    if !top.is_number() {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                    *self.peek_mut(0) = Value::number(-top.as_number());
                }
                OpCode::Not => {
                    let top = self.peek(0);
                    *self.peek_mut(0) = Value::boolean(top.is_falsy());
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.peek(0);
                    *self.peek_mut(0) = Value::boolean(a.same(b));
                }
                OpCode::Greater => {
                    let b = self.pop();
                    let a = self.peek(0);
                    if !a.is_number() || !b.is_number() {
                        return Err(self.runtime_error("Operands must be numbers."));
                    }
                    *self.peek_mut(0) = Value::boolean(a.as_number() > b.as_number());
                }
                OpCode::Less => {
                    let b = self.pop();
                    let a = self.peek(0);
                    if !a.is_number() || !b.is_number() {
                        return Err(self.runtime_error("Operands must be numbers."));
                    }
                    *self.peek_mut(0) = Value::boolean(a.as_number() < b.as_number());
                }

                OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::FloorDivide
                | OpCode::Power
                | OpCode::DotDot
                | OpCode::SubscriptGet
                | OpCode::SubscriptSet => {
                    let operator = op.operator().expect("operator opcode");
                    self.dispatch_operator(operator)?;
                }

                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_short() as usize;
                    let base = self.frames.last().expect("no active call frame").slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_short() as usize;
                    let base = self.frames.last().expect("no active call frame").slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let index = self.read_short() as usize;
                    let value = self.heap.module(self.module).globals[index];
                    self.push(value);
                }
                OpCode::SetGlobal => {
                    let index = self.read_short() as usize;
                    let value = self.peek(0);
                    self.heap.module_mut(self.module).globals[index] = value;
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_short() as usize;
                    let frame = self.frames.last().expect("no active call frame");
                    let upvalue = self.heap.closure(frame.closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(index) => self.stack[index],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_short() as usize;
                    let value = self.peek(0);
                    let frame = self.frames.last().expect("no active call frame");
                    let upvalue = self.heap.closure(frame.closure).upvalues[slot];
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(index) => self.stack[index] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsy() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }

                OpCode::CreateList => {
                    let list = self.alloc(ObjectKind::List(List::default()));
                    self.push(Value::object(list));
                }
                OpCode::AppendList => {
                    let value = self.pop();
                    let list = self.peek(0).as_object();
                    self.heap.list_mut(list).values.push(value);
                }

                OpCode::Closure => {
                    let index = self.read_short();
                    let function = self.read_constant(index).as_object();
                    let upvalue_count = self.heap.function(function).upvalue_count;

                    let closure = self.alloc(ObjectKind::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack before capture so a collection mid-way
                    // keeps it alive.
                    self.push(Value::object(closure));

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let slot = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().expect("no active call frame").slots;
                            self.capture_upvalue(base + slot)
                        } else {
                            let frame = self.frames.last().expect("no active call frame");
                            self.heap.closure(frame.closure).upvalues[slot]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }

                OpCode::Call0
                | OpCode::Call1
                | OpCode::Call2
                | OpCode::Call3
                | OpCode::Call4
                | OpCode::Call5
                | OpCode::Call6
                | OpCode::Call7
                | OpCode::Call8
                | OpCode::Call9
                | OpCode::Call10
                | OpCode::Call11
                | OpCode::Call12
                | OpCode::Call13
                | OpCode::Call14
                | OpCode::Call15
                | OpCode::Call16 => {
                    let arg_count = op.call_arity().expect("call opcode");
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.slots);

                    if self.frames.len() == exit_frames {
                        self.stack.truncate(frame.slots);
                        return Ok(result);
                    }

                    self.stack.truncate(frame.slots);
                    self.push(result);
                }

                OpCode::Class => {
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    let class = self.alloc(ObjectKind::Class(Class::new(name)));
                    self.push(Value::object(class));
                }
                OpCode::Inherit => {
                    self.inherit()?;
                }
                OpCode::DefineField => {
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    let value = self.pop();
                    let class = self.peek(0).as_object();
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).fields.insert(name, hash, value);
                }
                OpCode::DefineStatic => {
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    let value = self.pop();
                    let class = self.peek(0).as_object();
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).statics.insert(name, hash, value);
                }
                OpCode::DefineMethod => {
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    let method = self.pop();
                    let class = self.peek(0).as_object();
                    let hash = self.heap.str_hash(name);
                    self.heap
                        .class_mut(class)
                        .methods
                        .insert(name, hash, method);
                }
                OpCode::DefineConstructor => {
                    let index = self.read_short();
                    let _name = self.read_string_constant(index);
                    let constructor = self.pop();
                    let class = self.peek(0).as_object();
                    self.heap.class_mut(class).constructor = Some(constructor.as_object());
                }

                OpCode::GetField => {
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    self.get_field(name)?;
                }
                OpCode::SetField => {
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    self.set_field(name)?;
                }
                OpCode::Invoke => {
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::Is => {
                    let tag = self.read_byte();
                    let index = self.read_short();
                    let name = self.read_string_constant(index);
                    let value = self.pop();
                    let result = self.value_is(value, tag, name);
                    self.push(Value::boolean(result));
                }
            }
        }
    }

    fn trace_instruction(&self) {
        let Some(frame) = self.frames.last() else {
            return;
        };
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", self.heap.format_value(*value)));
        }
        eprintln!("{line}");
        let chunk = &self.heap.function(frame.function).chunk;
        let mut rendered = String::new();
        chunk.disassemble_instruction(&self.heap, frame.ip, &mut rendered);
        eprint!("{rendered}");
    }

    // ---- upvalues ----

    fn open_upvalue_slot(&self, upvalue: ObjId) -> usize {
        match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => slot,
            UpvalueState::Closed(_) => panic!("closed upvalue on the open list"),
        }
    }

    /// Find or create the upvalue for a stack slot, keeping the list
    /// sorted by strictly decreasing slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> ObjId {
        let mut index = 0;
        while index < self.open_upvalues.len()
            && self.open_upvalue_slot(self.open_upvalues[index]) > slot
        {
            index += 1;
        }

        if index < self.open_upvalues.len()
            && self.open_upvalue_slot(self.open_upvalues[index]) == slot
        {
            return self.open_upvalues[index];
        }

        let created = self.alloc(ObjectKind::Upvalue(Upvalue {
            state: UpvalueState::Open(slot),
        }));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Close every open upvalue at or above `last`, copying the stack
    /// value into the cell.
    pub(crate) fn close_upvalues(&mut self, last: usize) {
        while let Some(&head) = self.open_upvalues.first() {
            let slot = self.open_upvalue_slot(head);
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(head).state = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ---- calls ----

    /// Dispatch a call to whatever `callee` is, with the stack already in
    /// calling position: `[.., callee, a1, .., aN]`.
    pub(crate) fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        if !callee.is_object() {
            return Err(self.runtime_error("Can only call functions and classes."));
        }

        let id = callee.as_object();
        match &self.heap.get(id).kind {
            ObjectKind::Closure(_) => self.call_closure(id, arg_count),
            ObjectKind::Native(_) => self.call_native(id, arg_count),
            ObjectKind::Class(_) => self.call_class(id, arg_count),
            ObjectKind::BoundMethod(_) => {
                let bound = self.heap.bound_method(id);
                let receiver = bound.receiver;
                let method = bound.method;
                let base = self.stack.len() - arg_count as usize - 1;
                self.stack[base] = receiver;
                self.call_callable(Value::object(method), arg_count)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    /// Call a closure or native that is already positioned with its
    /// receiver (or itself) in slot zero.
    pub(crate) fn call_callable(&mut self, method: Value, arg_count: u8) -> Result<(), RuntimeError> {
        if !method.is_object() {
            return Err(self.runtime_error("Can only call functions and classes."));
        }
        let id = method.as_object();
        match &self.heap.get(id).kind {
            ObjectKind::Closure(_) => self.call_closure(id, arg_count),
            ObjectKind::Native(_) => self.call_native(id, arg_count),
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    pub(crate) fn call_closure(&mut self, closure: ObjId, arg_count: u8) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arity != arg_count {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - arg_count as usize - 1,
        });
        Ok(())
    }

    pub(crate) fn call_native(&mut self, native: ObjId, arg_count: u8) -> Result<(), RuntimeError> {
        if self.api_stack.is_some() {
            return Err(self.runtime_error("Re-entrant native call."));
        }

        let declared = self.heap.native(native).arity;
        if declared != arg_count {
            return Err(self.runtime_error(format!(
                "Expected {declared} arguments but got {arg_count}."
            )));
        }

        let base = self.stack.len() - arg_count as usize - 1;
        self.api_stack = Some(base);
        self.error = None;

        let function = self.heap.native(native).function;
        let ok = function(self);

        self.stack.truncate(base + 1);
        self.api_stack = None;

        if !ok {
            let message = self
                .error
                .take()
                .unwrap_or_else(|| "Native function error.".to_string());
            return Err(self.runtime_error(message));
        }
        Ok(())
    }

    fn call_class(&mut self, class: ObjId, arg_count: u8) -> Result<(), RuntimeError> {
        let fields = self.heap.class(class).fields.clone();
        let instance = self.alloc(ObjectKind::Instance(Instance {
            class,
            fields,
        }));
        self.heap.get_mut(instance).class = Some(class);

        let base = self.stack.len() - arg_count as usize - 1;
        self.stack[base] = Value::object(instance);

        match self.heap.class(class).constructor {
            Some(constructor) => self.call_closure(constructor, arg_count),
            None => {
                if arg_count != 0 {
                    return Err(self.runtime_error(format!(
                        "Expected 0 arguments but got {arg_count}."
                    )));
                }
                Ok(())
            }
        }
    }

    // ---- operator dispatch ----

    /// The class that answers for `value` in operator and method
    /// dispatch.
    pub(crate) fn class_for_value(&self, value: Value) -> Option<ObjId> {
        if value.is_number() {
            return self.builtins.number;
        }
        if value.is_bool() {
            return self.builtins.bool_class;
        }
        if !value.is_object() {
            return None;
        }

        let id = value.as_object();
        match &self.heap.get(id).kind {
            ObjectKind::Class(_) => Some(id),
            ObjectKind::Str(_) => self.builtins.string,
            ObjectKind::List(_) => self.builtins.list,
            ObjectKind::Instance(instance) => Some(instance.class),
            _ => self.heap.get(id).class,
        }
    }

    fn dispatch_operator(&mut self, operator: Operator) -> Result<(), RuntimeError> {
        let arg_count = operator.arity();
        let receiver = self.peek(arg_count as usize);

        let slot = self
            .class_for_value(receiver)
            .and_then(|class| self.heap.class(class).operators[operator as usize]);
        let Some(callable) = slot else {
            return Err(self.runtime_error(format!(
                "Object does not contain operator {}.",
                operator.symbol()
            )));
        };

        self.call_callable(Value::object(callable), arg_count)
    }

    // ---- fields and methods ----

    fn lookup_class_entry(&self, class: ObjId, name: ObjId) -> (Option<Value>, Option<Value>) {
        let hash = self.heap.str_hash(name);
        let class = self.heap.class(class);
        (
            class.methods.get(name, hash),
            class.statics.get(name, hash),
        )
    }

    fn bind_method(&mut self, receiver: Value, method: Value) -> Value {
        let bound = self.alloc(ObjectKind::BoundMethod(BoundMethod {
            receiver,
            method: method.as_object(),
        }));
        Value::object(bound)
    }

    fn get_field(&mut self, name: ObjId) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        let hash = self.heap.str_hash(name);
        let field_name = self.heap.str_chars(name).to_string();

        if receiver.is_object() {
            let id = receiver.as_object();
            match &self.heap.get(id).kind {
                ObjectKind::Enum(members) => {
                    let Some(value) = members.members.get(name, hash) else {
                        return Err(self.runtime_error(format!(
                            "Enum does not contain value '{field_name}'."
                        )));
                    };
                    self.pop();
                    self.push(value);
                    return Ok(());
                }
                ObjectKind::Instance(instance) => {
                    if let Some(value) = instance.fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    let (method, static_value) = self.lookup_class_entry(instance.class, name);
                    if let Some(method) = method {
                        let bound = self.bind_method(receiver, method);
                        self.pop();
                        self.push(bound);
                        return Ok(());
                    }
                    if let Some(value) = static_value {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    return Err(
                        self.runtime_error(format!("Undefined field '{field_name}'."))
                    );
                }
                ObjectKind::Class(_) => {
                    let (method, static_value) = self.lookup_class_entry(id, name);
                    if let Some(value) = static_value {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    if let Some(method) = method {
                        let bound = self.bind_method(receiver, method);
                        self.pop();
                        self.push(bound);
                        return Ok(());
                    }
                    return Err(
                        self.runtime_error(format!("Undefined field '{field_name}'."))
                    );
                }
                _ => {}
            }
        }

        // Primitives dispatch through their built-in class.
        if let Some(class) = self.class_for_value(receiver) {
            let (method, static_value) = self.lookup_class_entry(class, name);
            if let Some(method) = method {
                let bound = self.bind_method(receiver, method);
                self.pop();
                self.push(bound);
                return Ok(());
            }
            if let Some(value) = static_value {
                self.pop();
                self.push(value);
                return Ok(());
            }
            return Err(self.runtime_error(format!("Undefined field '{field_name}'.")));
        }

        Err(self.runtime_error("Object does not have fields."))
    }

    /// Assignment preserves the field shape fixed by the class body: only
    /// names that already exist can be written.
    fn set_field(&mut self, name: ObjId) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let receiver = self.peek(1);
        let hash = self.heap.str_hash(name);
        let field_name = self.heap.str_chars(name).to_string();

        if !receiver.is_object() {
            return Err(self.runtime_error("Only instances and classes have fields."));
        }

        enum Target {
            Instance(ObjId),
            Class,
            Enum,
            Other,
        }

        let id = receiver.as_object();
        let target = match &self.heap.get(id).kind {
            ObjectKind::Instance(instance) => Target::Instance(instance.class),
            ObjectKind::Class(_) => Target::Class,
            ObjectKind::Enum(_) => Target::Enum,
            _ => Target::Other,
        };

        let stored = match target {
            Target::Instance(class) => {
                // Instance fields first, then the class statics fallback.
                self.heap
                    .instance_mut(id)
                    .fields
                    .set_existing(name, hash, value)
                    || self
                        .heap
                        .class_mut(class)
                        .statics
                        .set_existing(name, hash, value)
            }
            Target::Class => self
                .heap
                .class_mut(id)
                .statics
                .set_existing(name, hash, value),
            Target::Enum => {
                return Err(self.runtime_error("Can't set enum value."));
            }
            Target::Other => {
                return Err(self.runtime_error("Only instances and classes have fields."));
            }
        };

        if !stored {
            return Err(self.runtime_error(format!("Undefined field '{field_name}'.")));
        }

        // Leave the assigned value as the expression result.
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// Fused field-get + call for `x.m(...)`.
    fn invoke(&mut self, name: ObjId, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count as usize);
        let hash = self.heap.str_hash(name);
        let method_name = self.heap.str_chars(name).to_string();
        let base = self.stack.len() - arg_count as usize - 1;

        if receiver.is_object() {
            let id = receiver.as_object();
            match &self.heap.get(id).kind {
                ObjectKind::Instance(instance) => {
                    // Fields shadow methods, same as GET_FIELD.
                    if let Some(field) = instance.fields.get(name, hash) {
                        self.stack[base] = field;
                        return self.call_value(field, arg_count);
                    }
                    let (method, static_value) = self.lookup_class_entry(instance.class, name);
                    if let Some(method) = method {
                        return self.call_callable(method, arg_count);
                    }
                    if let Some(value) = static_value {
                        self.stack[base] = value;
                        return self.call_value(value, arg_count);
                    }
                    return Err(
                        self.runtime_error(format!("Undefined method '{method_name}'."))
                    );
                }
                ObjectKind::Class(_) => {
                    let (method, static_value) = self.lookup_class_entry(id, name);
                    if let Some(value) = static_value {
                        return self.call_callable(value, arg_count);
                    }
                    if let Some(method) = method {
                        return self.call_callable(method, arg_count);
                    }
                    return Err(
                        self.runtime_error(format!("Undefined method '{method_name}'."))
                    );
                }
                ObjectKind::Enum(members) => {
                    if let Some(value) = members.members.get(name, hash) {
                        self.stack[base] = value;
                        return self.call_value(value, arg_count);
                    }
                    return Err(self.runtime_error(format!(
                        "Enum does not contain value '{method_name}'."
                    )));
                }
                _ => {}
            }
        }

        if let Some(class) = self.class_for_value(receiver) {
            let (method, static_value) = self.lookup_class_entry(class, name);
            if let Some(method) = method {
                return self.call_callable(method, arg_count);
            }
            if let Some(value) = static_value {
                self.stack[base] = value;
                return self.call_value(value, arg_count);
            }
            return Err(self.runtime_error(format!("Undefined method '{method_name}'.")));
        }

        Err(self.runtime_error(format!("Undefined method '{method_name}'.")))
    }

    // ---- type tests ----

    fn value_is(&self, value: Value, tag: u8, name: ObjId) -> bool {
        match tag {
            1 => value.is_number(),
            2 => value.is_bool(),
            3 => value.is_null(),
            4 => value.is_object() && matches!(self.heap.get(value.as_object()).kind, ObjectKind::Str(_)),
            _ => {
                let wanted = self.heap.str_chars(name);
                let mut class = self.class_for_value(value);
                while let Some(id) = class {
                    let c = self.heap.class(id);
                    if self.heap.str_chars(c.name) == wanted {
                        return true;
                    }
                    class = c.parent;
                }
                false
            }
        }
    }

    // ---- inheritance ----

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let parent_value = self.pop();
        let child_value = self.peek(0);

        if !parent_value.is_object()
            || !matches!(self.heap.get(parent_value.as_object()).kind, ObjectKind::Class(_))
        {
            return Err(self.runtime_error("Can only inherit from a class."));
        }
        let parent = parent_value.as_object();
        let child = child_value.as_object();

        let (fields, methods, operators) = {
            let parent_class = self.heap.class(parent);
            (
                parent_class.fields.clone(),
                parent_class.methods.clone(),
                parent_class.operators,
            )
        };

        let child_class = self.heap.class_mut(child);
        fields.copy_into(&mut child_class.fields);
        methods.copy_into(&mut child_class.methods);
        child_class.operators = operators;
        child_class.parent = Some(parent);
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Userdata cleanup hooks run on teardown as well as on sweep.
        let ids: Vec<ObjId> = self.heap.live_objects().collect();
        for id in ids {
            self.heap.free(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn options_pick_up_environment_flags() {
        unsafe {
            std::env::set_var("SOLIS_GC_LOG", "1");
            std::env::set_var("SOLIS_SANDBOX", "true");
        }
        let options = VmOptions::default().from_env();
        unsafe {
            std::env::remove_var("SOLIS_GC_LOG");
            std::env::remove_var("SOLIS_SANDBOX");
        }
        assert!(options.gc_log);
        assert!(options.sandboxed);
        assert!(!options.gc_stress);
        assert!(!options.trace);
    }

    #[test]
    fn stack_primitives() {
        let mut vm = Vm::new();
        vm.push(Value::number(1.0));
        vm.push(Value::number(2.0));
        assert_eq!(vm.peek(0), Value::number(2.0));
        assert_eq!(vm.peek(1), Value::number(1.0));
        assert_eq!(vm.pop(), Value::number(2.0));
        assert_eq!(vm.pop(), Value::number(1.0));
    }

    #[test]
    fn open_upvalues_stay_sorted_descending() {
        let mut vm = Vm::new();
        vm.push(Value::number(0.0));
        vm.push(Value::number(1.0));
        vm.push(Value::number(2.0));

        vm.capture_upvalue(1);
        vm.capture_upvalue(0);
        vm.capture_upvalue(2);

        let slots: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|&u| vm.open_upvalue_slot(u))
            .collect();
        assert_eq!(slots, vec![2, 1, 0]);

        // Capturing an already-open slot reuses the cell.
        let existing = vm.capture_upvalue(1);
        assert_eq!(vm.open_upvalues.len(), 3);
        assert_eq!(vm.open_upvalue_slot(existing), 1);
    }

    #[test]
    fn closing_promotes_from_the_head() {
        let mut vm = Vm::new();
        vm.push(Value::number(10.0));
        vm.push(Value::number(20.0));
        let low = vm.capture_upvalue(0);
        let high = vm.capture_upvalue(1);

        vm.close_upvalues(1);
        assert_eq!(vm.open_upvalues.len(), 1);
        assert!(matches!(
            vm.heap.upvalue(high).state,
            UpvalueState::Closed(v) if v == Value::number(20.0)
        ));
        assert!(matches!(vm.heap.upvalue(low).state, UpvalueState::Open(0)));

        vm.close_upvalues(0);
        assert!(vm.open_upvalues.is_empty());
    }
}
