use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

/// A captured variable. While *open*, `location` aliases a live value-stack
/// slot, `stack_slot` records its index, and `next` threads the upvalue into
/// the VM's intrusive open-upvalue list (ordered by descending slot).
/// Closing copies the slot into `closed`, retargets `location` at that
/// field, and unlinks the upvalue; the transition happens exactly once.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
    pub stack_slot: usize,
    pub next: *mut ObjectUpvalue,
}

impl ObjectUpvalue {
    pub fn new(location: *mut Value, stack_slot: usize) -> ObjectUpvalue {
        ObjectUpvalue {
            object: Object::new(ObjectType::ObjUpvalue),
            location,
            closed: make_nil_value(),
            stack_slot,
            next: std::ptr::null_mut(),
        }
    }
}
