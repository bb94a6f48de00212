use crate::objects::object::{NativeObject, Object};
use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_string::ObjectString;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::value::Value;

/// Owns every heap object in a VM. All allocation goes through the `alloc_*`
/// functions, which box the object, record its deep size, and remember the
/// raw pointer so the collector can walk the whole heap. Objects are freed
/// either by the sweep phase or by `Drop` at VM teardown.
pub struct ObjectManager {
    objects: Vec<*mut Object>,
    // Bytes allocated since last drain (deep size of each object when added)
    pending_bytes: usize,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Drain and return bytes allocated since last call.
    pub fn drain_pending_bytes(&mut self) -> usize {
        let bytes = self.pending_bytes;
        self.pending_bytes = 0;
        bytes
    }

    /// Push a newly allocated object pointer, record its deep size, and
    /// return that size.
    fn push_object(&mut self, obj: *mut Object) -> usize {
        let size = unsafe { (*obj).deep_size() };
        self.pending_bytes += size;
        self.objects.push(obj);
        size
    }

    pub fn alloc_string(&mut self, content: &str) -> (*mut ObjectString, usize) {
        let ptr = Box::into_raw(Box::new(ObjectString::new(content)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    /// Register a function finished by the compiler. The compiler owns
    /// functions while they are being built; the heap takes over here.
    pub fn adopt_function(&mut self, function: Box<ObjectFunction>) -> (*mut ObjectFunction, usize) {
        let ptr = Box::into_raw(function);
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_closure(&mut self, function: *mut ObjectFunction) -> (*mut ObjectClosure, usize) {
        let ptr = Box::into_raw(Box::new(ObjectClosure::new(function)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_native_function(
        &mut self,
        name: String,
        arity: usize,
        native_object: impl NativeObject + 'static,
    ) -> (*mut ObjectNativeFunction, usize) {
        let ptr = Box::into_raw(Box::new(ObjectNativeFunction::new(name, arity, native_object)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_upvalue(
        &mut self,
        location: *mut Value,
        stack_slot: usize,
    ) -> (*mut ObjectUpvalue, usize) {
        let ptr = Box::into_raw(Box::new(ObjectUpvalue::new(location, stack_slot)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_class(&mut self, name: *mut ObjectString) -> (*mut ObjectClass, usize) {
        let ptr = Box::into_raw(Box::new(ObjectClass::new(name)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_instance(&mut self, class: *mut ObjectClass) -> (*mut ObjectInstance, usize) {
        let ptr = Box::into_raw(Box::new(ObjectInstance::new(class)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: *mut ObjectClosure,
    ) -> (*mut ObjectBoundMethod, usize) {
        let ptr = Box::into_raw(Box::new(ObjectBoundMethod::new(receiver, method)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    /// Iterate over all managed objects (for GC mark/sweep)
    pub fn iter(&self) -> impl Iterator<Item = &*mut Object> {
        self.objects.iter()
    }

    /// Remove a pointer from the manager without freeing it. The sweep
    /// phase frees the object after unlinking it here.
    pub fn remove_object(&mut self, ptr: *mut Object) {
        if let Some(pos) = self.objects.iter().position(|&p| p == ptr) {
            self.objects.swap_remove(pos);
        }
    }

    /// Deallocate all objects (for VM shutdown or full sweep)
    pub unsafe fn free_all(&mut self) {
        for &ptr in &self.objects {
            if !ptr.is_null() {
                free_object(ptr);
            }
        }
        self.objects.clear();
    }
}

/// Reconstruct the owning box for a header pointer and drop it. The cast
/// back must use the concrete type so the right destructor runs.
pub unsafe fn free_object(ptr: *mut Object) {
    use crate::objects::object::ObjectType;

    match (*ptr).obj_type {
        ObjectType::ObjString => drop(Box::from_raw(ptr as *mut ObjectString)),
        ObjectType::ObjFunction => drop(Box::from_raw(ptr as *mut ObjectFunction)),
        ObjectType::ObjNativeFunction => drop(Box::from_raw(ptr as *mut ObjectNativeFunction)),
        ObjectType::ObjClosure => drop(Box::from_raw(ptr as *mut ObjectClosure)),
        ObjectType::ObjUpvalue => drop(Box::from_raw(ptr as *mut ObjectUpvalue)),
        ObjectType::ObjClass => drop(Box::from_raw(ptr as *mut ObjectClass)),
        ObjectType::ObjInstance => drop(Box::from_raw(ptr as *mut ObjectInstance)),
        ObjectType::ObjBoundMethod => drop(Box::from_raw(ptr as *mut ObjectBoundMethod)),
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        unsafe {
            self.free_all();
        }
    }
}
