use crate::objects::object::{Object, ObjectType};
use crate::objects::object_string::ObjectString;
use crate::table::Table;

/// Method values in the table are always closures. `INHERIT` bulk-copies a
/// superclass's table into a new subclass before the subclass's own methods
/// are added, so local definitions overwrite inherited ones.
#[repr(C)]
pub struct ObjectClass {
    pub object: Object,
    pub name: *mut ObjectString,
    pub methods: Table,
}

impl ObjectClass {
    pub fn new(name: *mut ObjectString) -> ObjectClass {
        ObjectClass {
            object: Object::new(ObjectType::ObjClass),
            name,
            methods: Table::new(),
        }
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectClass;

    impl Drop for ObjectClass {
        fn drop(&mut self) {
            println!("drop object: type=ObjectClass");
        }
    }
}
