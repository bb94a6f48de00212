use std::collections::HashSet;

use crate::{
    call_frame::CallFrame,
    objects::{
        object::{Object, ObjectType},
        object_manager::{free_object, ObjectManager},
        object_string::ObjectString,
        object_upvalue::ObjectUpvalue,
    },
    table::Table,
    value::{as_object, is_object, Value},
};

/// Tri-color mark-sweep collector. Set membership encodes the color: every
/// heap object starts white, roots and traced references move to gray, and
/// fully scanned objects end up black. Whatever is still white after tracing
/// is unreachable and gets swept.
pub struct GarbageCollector {
    white_set: HashSet<*mut Object>,
    gray_set: HashSet<*mut Object>,
    black_set: HashSet<*mut Object>,
    stats: GCStats,
}

/// Aggregated GC statistics (does not include currently-live total bytes; the
/// VM tracks that).
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace {
    ($($arg:tt)*) => {};
}
pub(crate) use gc_trace;

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            white_set: HashSet::new(),
            gray_set: HashSet::new(),
            black_set: HashSet::new(),
            stats: GCStats::default(),
        }
    }

    /// Initialize the collector with all objects in the white set.
    pub fn prepare_collection(&mut self, object_manager: &ObjectManager) {
        self.reset();
        for &obj_ptr in object_manager.iter() {
            self.white_set.insert(obj_ptr);
        }
    }

    /// Mark a single object as gray (moves from white to gray set).
    pub fn mark_object(&mut self, obj: *mut Object) {
        if obj.is_null() || self.black_set.contains(&obj) {
            return;
        }

        if self.white_set.remove(&obj) {
            self.gray_set.insert(obj);
            gc_trace!("mark_object enqueue gray ptr={:p}", obj);
        }
    }

    /// Mark a value (if it's an object).
    pub fn mark_value(&mut self, value: &Value) {
        if !is_object(value) {
            return;
        }
        self.mark_object(as_object(value));
    }

    fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key as *mut Object);
            self.mark_value(value);
        }
    }

    /// Mark the precise roots provided by the VM: live stack slots, each
    /// frame's closure, the open-upvalue list (walked from its head via the
    /// intrusive `next` links), the globals table (keys and values), and the
    /// interned `"init"` handle. The interning table is deliberately not a
    /// root; see `purge_unmarked_strings`.
    pub fn mark_roots(
        &mut self,
        stack: &[Value],
        stack_top: usize,
        globals: &Table,
        frames: &[CallFrame],
        open_upvalues: *mut ObjectUpvalue,
        init_string: *mut ObjectString,
    ) {
        for value in &stack[0..stack_top] {
            self.mark_value(value);
        }

        for frame in frames {
            self.mark_object(frame.closure as *mut Object);
        }

        let mut upvalue = open_upvalues;
        while !upvalue.is_null() {
            self.mark_object(upvalue as *mut Object);
            upvalue = unsafe { (*upvalue).next };
        }

        self.mark_table(globals);
        self.mark_object(init_string as *mut Object);
    }

    /// Process gray objects until none remain.
    pub fn trace_references(&mut self) {
        while !self.gray_set.is_empty() {
            let obj = *self.gray_set.iter().next().expect("gray set is non-empty");
            self.gray_set.remove(&obj);
            self.black_set.insert(obj);

            unsafe {
                gc_trace!("trace gray -> black ptr={:p}", obj);
                self.blacken_object(obj);
            }
        }
    }

    /// Darken everything an object references.
    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).obj_type {
            ObjectType::ObjString => {}
            ObjectType::ObjNativeFunction => {}
            ObjectType::ObjFunction => {
                let function = (*object).as_function();
                for constant in function.chunk.iter_constants() {
                    self.mark_value(constant);
                }
            }
            ObjectType::ObjClosure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for upvalue in &closure.upvalues {
                    self.mark_object(*upvalue as *mut Object);
                }
            }
            ObjectType::ObjUpvalue => {
                let upvalue = (*object).as_upvalue();
                self.mark_value(&upvalue.closed);
            }
            ObjectType::ObjClass => {
                let class = (*object).as_class();
                self.mark_object(class.name as *mut Object);
                self.mark_table(&class.methods);
            }
            ObjectType::ObjInstance => {
                let instance = (*object).as_instance();
                self.mark_object(instance.class as *mut Object);
                self.mark_table(&instance.fields);
            }
            ObjectType::ObjBoundMethod => {
                let bound = (*object).as_bound_method();
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method as *mut Object);
            }
        }
    }

    /// The interning table holds its keys weakly: between mark and sweep,
    /// entries whose key strings were never marked are removed so the sweep
    /// can reclaim them.
    pub fn purge_unmarked_strings(&mut self, intern_strings: &mut Table) {
        let doomed: Vec<*mut ObjectString> = intern_strings
            .iter()
            .filter(|(key, _)| self.white_set.contains(&(*key as *mut Object)))
            .map(|(key, _)| key)
            .collect();

        for key in doomed {
            gc_trace!("purge interned string ptr={:p}", key);
            intern_strings.delete(key);
        }
    }

    /// Sweep phase: free every object still white. Returns freed bytes.
    pub fn sweep(&mut self, object_manager: &mut ObjectManager) -> usize {
        let mut freed_bytes = 0;
        for &obj_ptr in self.white_set.iter() {
            unsafe {
                freed_bytes += (*obj_ptr).deep_size();
            }
            object_manager.remove_object(obj_ptr);
            unsafe {
                free_object(obj_ptr);
            }
        }
        self.white_set.clear();
        gc_trace!("sweep freed_bytes={}", freed_bytes);
        freed_bytes
    }

    /// Reset collector state.
    pub fn reset(&mut self) {
        self.white_set.clear();
        self.gray_set.clear();
        self.black_set.clear();
    }

    /// Record a completed GC cycle (invoked by the VM, which knows bytes
    /// before/after and the next trigger).
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_function::ObjectFunction;
    use crate::objects::object_manager::ObjectManager;
    use crate::value::{make_nil_value, make_object_value, Value};

    fn no_open_upvalues() -> *mut ObjectUpvalue {
        std::ptr::null_mut()
    }

    /// Run one full collection against an explicit root set and return the
    /// freed byte count.
    fn run_cycle(
        manager: &mut ObjectManager,
        stack: &[Value],
        stack_top: usize,
        globals: &Table,
        frames: &[CallFrame],
        open_upvalues: *mut ObjectUpvalue,
    ) -> usize {
        let mut gc = GarbageCollector::new();
        gc.prepare_collection(manager);
        gc.mark_roots(
            stack,
            stack_top,
            globals,
            frames,
            open_upvalues,
            std::ptr::null_mut(),
        );
        gc.trace_references();
        gc.sweep(manager)
    }

    #[test]
    fn sweep_reclaims_everything_without_roots() {
        let mut manager = ObjectManager::new();
        manager.alloc_string("one");
        manager.alloc_string("two");
        manager.alloc_string("three");

        let globals = Table::new();
        let freed = run_cycle(&mut manager, &[], 0, &globals, &[], no_open_upvalues());
        assert!(freed > 0);
        assert_eq!(manager.iter().count(), 0);
    }

    #[test]
    fn globals_table_roots_both_keys_and_values() {
        let mut manager = ObjectManager::new();
        let (key, _) = manager.alloc_string("answer");
        let (value, _) = manager.alloc_string("forty-two");
        manager.alloc_string("stray");
        let mut globals = Table::new();
        globals.set(key, make_object_value(value as *mut Object));

        run_cycle(&mut manager, &[], 0, &globals, &[], no_open_upvalues());
        assert_eq!(manager.iter().count(), 2);
        assert!(globals.get(key).is_some());
    }

    #[test]
    fn trace_reaches_constants_of_a_stacked_closure() {
        let mut manager = ObjectManager::new();
        let (embedded, _) = manager.alloc_string("embedded");
        let mut function = Box::new(ObjectFunction::new(0, "worker".to_string()));
        function
            .chunk
            .add_constant(make_object_value(embedded as *mut Object));
        let (function_ptr, _) = manager.adopt_function(function);
        let (closure, _) = manager.alloc_closure(function_ptr);
        manager.alloc_string("unreferenced");

        let stack = [make_object_value(closure as *mut Object)];
        let globals = Table::new();
        run_cycle(&mut manager, &stack, 1, &globals, &[], no_open_upvalues());
        // The chain closure -> function -> constant string survives; the
        // string nothing points at does not.
        assert_eq!(manager.iter().count(), 3);
    }

    #[test]
    fn frame_closures_are_roots_without_a_stack_slot() {
        let mut manager = ObjectManager::new();
        let function = Box::new(ObjectFunction::new(0, "active".to_string()));
        let (function_ptr, _) = manager.adopt_function(function);
        let (closure, _) = manager.alloc_closure(function_ptr);
        manager.alloc_string("collectable");

        let frames = vec![CallFrame::new(closure, 0)];
        let globals = Table::new();
        run_cycle(&mut manager, &[], 0, &globals, &frames, no_open_upvalues());
        assert_eq!(manager.iter().count(), 2);
    }

    #[test]
    fn open_upvalue_list_is_walked_through_next_links() {
        let mut manager = ObjectManager::new();
        let (first_payload, _) = manager.alloc_string("slot-nine");
        let (second_payload, _) = manager.alloc_string("slot-four");
        manager.alloc_string("off-list");

        // Two closed upvalues chained the way the VM links them, head first.
        let (head, _) = manager.alloc_upvalue(std::ptr::null_mut(), 9);
        let (tail, _) = manager.alloc_upvalue(std::ptr::null_mut(), 4);
        unsafe {
            (*head).closed = make_object_value(first_payload as *mut Object);
            (*head).location = &mut (*head).closed as *mut Value;
            (*head).next = tail;
            (*tail).closed = make_object_value(second_payload as *mut Object);
            (*tail).location = &mut (*tail).closed as *mut Value;
        }

        let globals = Table::new();
        run_cycle(&mut manager, &[], 0, &globals, &[], head);
        // Both upvalues plus both payloads survive; only the stray string
        // is reclaimed.
        assert_eq!(manager.iter().count(), 4);
    }

    #[test]
    fn gc_marks_class_graph() {
        let mut manager = ObjectManager::new();
        let (class_name, _) = manager.alloc_string("Widget");
        let (class_ptr, _) = manager.alloc_class(class_name);
        let (instance_ptr, _) = manager.alloc_instance(class_ptr);
        let (field_name, _) = manager.alloc_string("label");
        let (field_value, _) = manager.alloc_string("knob");
        unsafe {
            (*instance_ptr)
                .fields
                .set(field_name, make_object_value(field_value as *mut Object));
        }
        let (_garbage, _) = manager.alloc_string("garbage");

        let stack = [make_object_value(instance_ptr as *mut Object)];
        let globals = Table::new();
        run_cycle(&mut manager, &stack, 1, &globals, &[], no_open_upvalues());
        // instance + class + class name + field key + field value survive
        assert_eq!(manager.iter().count(), 5);
    }

    #[test]
    fn gc_purges_unmarked_interned_strings() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let (kept, _) = manager.alloc_string("kept");
        let (doomed, _) = manager.alloc_string("doomed");
        intern_strings.set(kept, make_nil_value());
        intern_strings.set(doomed, make_nil_value());

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(kept as *mut Object)];
        let globals = Table::new();

        gc.prepare_collection(&manager);
        gc.mark_roots(&stack, 1, &globals, &[], no_open_upvalues(), std::ptr::null_mut());
        gc.trace_references();
        gc.purge_unmarked_strings(&mut intern_strings);
        gc.sweep(&mut manager);

        assert_eq!(intern_strings.len(), 1);
        assert_eq!(manager.iter().count(), 1);
        assert!(intern_strings.get(kept).is_some());
    }

    #[test]
    fn stats_accumulate_across_cycles() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);

        gc.record_cycle(2048, 512, 1536, 3072);
        gc.record_cycle(4096, 96, 4000, 8000);

        let stats = gc.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.total_freed_bytes, 608);
        assert_eq!(stats.last_before_bytes, 4096);
        assert_eq!(stats.last_freed_bytes, 96);
        assert_eq!(stats.last_after_bytes, 4000);
        assert_eq!(stats.last_next_trigger_bytes, 8000);
    }
}
