//! The object heap
//!
//! One heap per VM owns every runtime object. Objects live in a slot
//! vector and are addressed by [`ObjId`] indices; freed slots go on a free
//! list and are reused by later allocations. The heap also owns the string
//! intern table (weak: the GC's intern pass drops entries whose strings
//! did not survive marking) and the allocator bookkeeping that schedules
//! collections.
//!
//! The heap itself never collects. The VM drives collection from its
//! allocation wrappers, where the full root set is in reach; compilation
//! allocates through the heap directly and any pending collection happens
//! on the first execution step instead.

use crate::object::{Class, Function, Instance, Module, Object, ObjectKind, StrObject, hash_string};
use crate::table::Table;
use crate::value::Value;

/// Index of an object slot in the heap. Valid for the owning VM's
/// lifetime, or until the object is proven unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(pub u32);

/// First collection triggers after a megabyte, like the reference
/// allocator; afterwards the sweep doubles the threshold.
const FIRST_GC: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Heap {
    objects: Vec<Option<Object>>,
    free: Vec<u32>,
    /// Interned strings; keys double as the set members, values are null.
    pub(crate) strings: Table,
    pub(crate) allocated_bytes: usize,
    pub(crate) next_gc: usize,
    /// Grey worklist, reused across collections.
    pub(crate) grey: Vec<ObjId>,
    /// Values pinned by API code while it builds multi-object structures.
    temp_roots: Vec<Value>,
}

macro_rules! typed_accessors {
    ($(($variant:ident, $ty:ty, $get:ident, $get_mut:ident)),* $(,)?) => {
        $(
            pub fn $get(&self, id: ObjId) -> &$ty {
                match &self.get(id).kind {
                    ObjectKind::$variant(inner) => inner,
                    other => panic!(
                        "heap slot {} holds {:?}, expected {}",
                        id.0, std::mem::discriminant(other), stringify!($variant)
                    ),
                }
            }

            pub fn $get_mut(&mut self, id: ObjId) -> &mut $ty {
                match &mut self.get_mut(id).kind {
                    ObjectKind::$variant(inner) => inner,
                    _ => panic!("heap slot {} is not a {}", id.0, stringify!($variant)),
                }
            }
        )*
    };
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            allocated_bytes: 0,
            next_gc: FIRST_GC,
            grey: Vec::new(),
            temp_roots: Vec::new(),
        }
    }

    /// Place a new object in a slot and account for its size.
    pub fn alloc(&mut self, kind: ObjectKind) -> ObjId {
        let object = Object::new(kind);
        self.allocated_bytes += object.byte_size();

        match self.free.pop() {
            Some(slot) => {
                self.objects[slot as usize] = Some(object);
                ObjId(slot)
            }
            None => {
                self.objects.push(Some(object));
                ObjId((self.objects.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: ObjId) -> &Object {
        self.objects[id.0 as usize]
            .as_ref()
            .expect("use of freed heap slot")
    }

    pub fn get_mut(&mut self, id: ObjId) -> &mut Object {
        self.objects[id.0 as usize]
            .as_mut()
            .expect("use of freed heap slot")
    }

    pub(crate) fn is_live(&self, id: ObjId) -> bool {
        self.objects
            .get(id.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }

    /// Drop the object in `id`, running a userdata cleanup hook if one is
    /// registered. The slot becomes reusable.
    pub(crate) fn free(&mut self, id: ObjId) {
        let mut object = self.objects[id.0 as usize]
            .take()
            .expect("double free of heap slot");
        if let ObjectKind::Userdata(userdata) = &mut object.kind {
            if let Some(cleanup) = userdata.cleanup {
                cleanup(userdata.data.as_mut());
            }
        }
        self.free.push(id.0);
    }

    pub(crate) fn live_objects(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| ObjId(i as u32)))
    }

    // ---- strings ----

    /// Look up an already-interned string by content.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<ObjId> {
        let entries = self.strings.raw_entries();
        if entries.is_empty() {
            return None;
        }

        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value.is_null() {
                        return None;
                    }
                }
                Some(id) => {
                    let string = self.str_obj(id);
                    if string.hash == hash && string.chars == chars {
                        return Some(id);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Intern `chars`, returning the canonical string object.
    pub fn intern(&mut self, chars: &str) -> ObjId {
        let hash = hash_string(chars);
        if let Some(existing) = self.find_string(chars, hash) {
            return existing;
        }

        let id = self.alloc(ObjectKind::Str(StrObject {
            chars: chars.to_string(),
            hash,
        }));
        self.strings.insert(id, hash, Value::NULL);
        id
    }

    /// Intern an owned string without re-copying when it is new.
    pub fn intern_owned(&mut self, chars: String) -> ObjId {
        let hash = hash_string(&chars);
        if let Some(existing) = self.find_string(&chars, hash) {
            return existing;
        }

        let id = self.alloc(ObjectKind::Str(StrObject { chars, hash }));
        self.strings.insert(id, hash, Value::NULL);
        id
    }

    pub fn concatenate(&mut self, a: ObjId, b: ObjId) -> ObjId {
        let mut chars = String::with_capacity(self.str_obj(a).chars.len() + self.str_obj(b).chars.len());
        chars.push_str(&self.str_obj(a).chars);
        chars.push_str(&self.str_obj(b).chars);
        self.intern_owned(chars)
    }

    pub fn str_chars(&self, id: ObjId) -> &str {
        &self.str_obj(id).chars
    }

    pub fn str_hash(&self, id: ObjId) -> u32 {
        self.str_obj(id).hash
    }

    // ---- collection passes ----

    /// The weak pass: interned strings survive only if marking reached
    /// them through some other root.
    pub(crate) fn sweep_intern_table(&mut self) {
        let mut strings = std::mem::take(&mut self.strings);
        strings.retain_keys(|id| self.get(id).marked);
        self.strings = strings;
    }

    /// Free every unmarked object, clear surviving marks, and re-tally
    /// the allocated byte count from the survivors.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut live_bytes = 0;
        let mut freed = 0;
        for i in 0..self.objects.len() {
            let marked = match &self.objects[i] {
                Some(object) => object.marked,
                None => continue,
            };
            if marked {
                let object = self.objects[i].as_mut().expect("live slot");
                object.marked = false;
                live_bytes += object.byte_size();
            } else {
                self.free(ObjId(i as u32));
                freed += 1;
            }
        }
        self.allocated_bytes = live_bytes;
        freed
    }

    // ---- temporary roots ----

    /// Pin a value against collection while host code builds structures
    /// the roots cannot see yet. Pair with [`Heap::pop_root`].
    pub fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    pub(crate) fn temp_roots(&self) -> &[Value] {
        &self.temp_roots
    }

    // ---- printing ----

    pub fn format_number(n: f64) -> String {
        if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
            format!("{}", n as i64)
        } else {
            format!("{n}")
        }
    }

    /// Human-readable rendering, used by `print`, the disassembler and
    /// error messages.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_number() {
            return Heap::format_number(value.as_number());
        }
        if value.is_null() {
            return "null".to_string();
        }
        if value.is_bool() {
            return if value.as_bool() { "true" } else { "false" }.to_string();
        }

        let id = value.as_object();
        if !self.is_live(id) {
            return "<freed>".to_string();
        }
        match &self.get(id).kind {
            ObjectKind::Str(s) => s.chars.clone(),
            ObjectKind::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.str_chars(name)),
                None => "<script>".to_string(),
            },
            ObjectKind::Closure(c) => {
                let function = self.function(c.function);
                match function.name {
                    Some(name) => format!("<fn {}>", self.str_chars(name)),
                    None => "<script>".to_string(),
                }
            }
            ObjectKind::Upvalue(_) => "<upvalue>".to_string(),
            ObjectKind::Native(_) => "<native fn>".to_string(),
            ObjectKind::Class(c) => format!("<class {}>", self.str_chars(c.name)),
            ObjectKind::Instance(i) => {
                format!("{} instance", self.str_chars(self.class(i.class).name))
            }
            ObjectKind::BoundMethod(_) => "<bound method>".to_string(),
            ObjectKind::List(l) => {
                let items: Vec<String> =
                    l.values.iter().map(|v| self.format_value(*v)).collect();
                format!("[{}]", items.join(", "))
            }
            ObjectKind::Enum(_) => "<enum>".to_string(),
            ObjectKind::Userdata(_) => "<userdata>".to_string(),
            ObjectKind::Module(m) => format!("<module {}>", m.name),
        }
    }

    fn str_obj(&self, id: ObjId) -> &StrObject {
        match &self.get(id).kind {
            ObjectKind::Str(s) => s,
            _ => panic!("heap slot {} is not a string", id.0),
        }
    }

    typed_accessors![
        (Function, Function, function, function_mut),
        (Closure, crate::object::Closure, closure, closure_mut),
        (Upvalue, crate::object::Upvalue, upvalue, upvalue_mut),
        (Native, crate::object::NativeFunction, native, native_mut),
        (Class, Class, class, class_mut),
        (Instance, Instance, instance, instance_mut),
        (BoundMethod, crate::object::BoundMethod, bound_method, bound_method_mut),
        (List, crate::object::List, list, list_mut),
        (Enum, crate::object::EnumObject, enum_obj, enum_obj_mut),
        (Userdata, crate::object::Userdata, userdata, userdata_mut),
        (Module, Module, module, module_mut),
    ];
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_by_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_chars(a), "hello");
    }

    #[test]
    fn concatenation_interns_the_result() {
        let mut heap = Heap::new();
        let a = heap.intern("Hello");
        let b = heap.intern(" World");
        let joined = heap.concatenate(a, b);
        assert_eq!(heap.str_chars(joined), "Hello World");
        assert_eq!(heap.find_string("Hello World", hash_string("Hello World")), Some(joined));
        // A second concatenation reuses the interned object.
        assert_eq!(heap.concatenate(a, b), joined);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc(ObjectKind::List(crate::object::List::default()));
        heap.free(a);
        let b = heap.alloc(ObjectKind::List(crate::object::List::default()));
        assert_eq!(a, b);
    }

    #[test]
    fn userdata_cleanup_runs_on_free() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        fn cleanup(_: &mut dyn std::any::Any) {
            DROPPED.fetch_add(1, Ordering::SeqCst);
        }

        let mut heap = Heap::new();
        let id = heap.alloc(ObjectKind::Userdata(crate::object::Userdata {
            data: Box::new(7u32),
            cleanup: Some(cleanup),
        }));
        heap.free(id);
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allocation_bytes_grow() {
        let mut heap = Heap::new();
        let before = heap.allocated_bytes;
        heap.intern("a somewhat longer string to account for");
        assert!(heap.allocated_bytes > before);
    }
}
