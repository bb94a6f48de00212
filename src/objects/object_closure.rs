use crate::objects::object::{Object, ObjectType};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_upvalue::ObjectUpvalue;

#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    /// The upvalue vector is filled by the `CLOSURE` instruction; its final
    /// length always equals `function.upvalue_count`.
    pub fn new(function: *mut ObjectFunction) -> ObjectClosure {
        let upvalue_count = unsafe { (*function).upvalue_count };
        ObjectClosure {
            object: Object::new(ObjectType::ObjClosure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectClosure;

    impl Drop for ObjectClosure {
        fn drop(&mut self) {
            println!("drop object: type=ObjectClosure");
        }
    }
}
