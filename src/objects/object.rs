use std::mem;

use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_string::ObjectString;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::value::Value;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ObjectType {
    ObjString,
    ObjFunction,
    ObjNativeFunction,
    ObjClosure,
    ObjUpvalue,
    ObjClass,
    ObjInstance,
    ObjBoundMethod,
}

/// Common header embedded (via `#[repr(C)]`) as the first field of every
/// heap object, so a `*mut Object` can be downcast once the discriminator
/// has been inspected.
#[repr(C)]
#[derive(Clone)]
pub struct Object {
    pub obj_type: ObjectType,
}

impl Object {
    pub fn new(obj_type: ObjectType) -> Object {
        Object { obj_type }
    }

    pub unsafe fn as_string(&self) -> &ObjectString {
        debug_assert!(self.obj_type == ObjectType::ObjString);
        &*(self as *const Object as *const ObjectString)
    }

    pub unsafe fn as_function(&self) -> &ObjectFunction {
        debug_assert!(self.obj_type == ObjectType::ObjFunction);
        &*(self as *const Object as *const ObjectFunction)
    }

    pub unsafe fn as_native_function(&self) -> &ObjectNativeFunction {
        debug_assert!(self.obj_type == ObjectType::ObjNativeFunction);
        &*(self as *const Object as *const ObjectNativeFunction)
    }

    pub unsafe fn as_closure(&self) -> &ObjectClosure {
        debug_assert!(self.obj_type == ObjectType::ObjClosure);
        &*(self as *const Object as *const ObjectClosure)
    }

    pub unsafe fn as_upvalue(&self) -> &ObjectUpvalue {
        debug_assert!(self.obj_type == ObjectType::ObjUpvalue);
        &*(self as *const Object as *const ObjectUpvalue)
    }

    pub unsafe fn as_class(&self) -> &ObjectClass {
        debug_assert!(self.obj_type == ObjectType::ObjClass);
        &*(self as *const Object as *const ObjectClass)
    }

    pub unsafe fn as_instance(&self) -> &ObjectInstance {
        debug_assert!(self.obj_type == ObjectType::ObjInstance);
        &*(self as *const Object as *const ObjectInstance)
    }

    pub unsafe fn as_bound_method(&self) -> &ObjectBoundMethod {
        debug_assert!(self.obj_type == ObjectType::ObjBoundMethod);
        &*(self as *const Object as *const ObjectBoundMethod)
    }

    /// Approximate byte footprint of the object and the buffers it owns.
    /// The VM's allocation accounting and the sweep phase both use this.
    pub unsafe fn deep_size(&self) -> usize {
        match self.obj_type {
            ObjectType::ObjString => {
                let string = self.as_string();
                mem::size_of::<ObjectString>() + string.content.capacity()
            }
            ObjectType::ObjFunction => {
                let function = self.as_function();
                mem::size_of::<ObjectFunction>()
                    + function.name.capacity()
                    + function.chunk.code.capacity()
                    + function.chunk.lines.capacity() * mem::size_of::<u32>()
                    + function.chunk.constants.capacity() * mem::size_of::<Value>()
            }
            ObjectType::ObjNativeFunction => {
                let native = self.as_native_function();
                mem::size_of::<ObjectNativeFunction>() + native.name.capacity()
            }
            ObjectType::ObjClosure => {
                let closure = self.as_closure();
                mem::size_of::<ObjectClosure>()
                    + closure.upvalues.capacity() * mem::size_of::<*mut ObjectUpvalue>()
            }
            ObjectType::ObjUpvalue => mem::size_of::<ObjectUpvalue>(),
            ObjectType::ObjClass => {
                let class = self.as_class();
                mem::size_of::<ObjectClass>() + class.methods.entries_size()
            }
            ObjectType::ObjInstance => {
                let instance = self.as_instance();
                mem::size_of::<ObjectInstance>() + instance.fields.entries_size()
            }
            ObjectType::ObjBoundMethod => mem::size_of::<ObjectBoundMethod>(),
        }
    }
}

/// Host-provided callable registered through `VM::define_native`.
pub trait NativeObject {
    fn call(&self, args: &[Value]) -> Result<Value, String>;
}

pub unsafe fn format_object(object: *mut Object) -> String {
    match (*object).obj_type {
        ObjectType::ObjString => (*object).as_string().content.clone(),
        ObjectType::ObjFunction => format_function(&*(object as *mut ObjectFunction)),
        ObjectType::ObjNativeFunction => "<native fn>".to_string(),
        ObjectType::ObjClosure => {
            let closure = (*object).as_closure();
            format_function(&*closure.function)
        }
        ObjectType::ObjUpvalue => "upvalue".to_string(),
        ObjectType::ObjClass => (*(*object).as_class().name).content.clone(),
        ObjectType::ObjInstance => {
            let instance = (*object).as_instance();
            format!("{} instance", (*(*instance.class).name).content)
        }
        ObjectType::ObjBoundMethod => {
            let bound = (*object).as_bound_method();
            format_function(&*(*bound.method).function)
        }
    }
}

fn format_function(function: &ObjectFunction) -> String {
    if function.name.is_empty() {
        "<script>".to_string()
    } else {
        format!("<fn {}>", function.name)
    }
}
