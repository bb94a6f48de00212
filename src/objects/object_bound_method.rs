use crate::objects::object::{Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::value::Value;

/// A method value that captured its receiver at property-access time.
#[repr(C)]
pub struct ObjectBoundMethod {
    pub object: Object,
    pub receiver: Value,
    pub method: *mut ObjectClosure,
}

impl ObjectBoundMethod {
    pub fn new(receiver: Value, method: *mut ObjectClosure) -> ObjectBoundMethod {
        ObjectBoundMethod {
            object: Object::new(ObjectType::ObjBoundMethod),
            receiver,
            method,
        }
    }
}
