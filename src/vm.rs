use std::mem;

use crate::{
    call_frame::CallFrame,
    chunk::OpCode,
    compiler::Parser,
    constants::{FRAMES_MAX, GC_HEAP_GROW_FACTOR, GC_INITIAL_THRESHOLD, STACK_MAX},
    gc::GarbageCollector,
    objects::{
        object::{NativeObject, Object, ObjectType},
        object_bound_method::ObjectBoundMethod,
        object_class::ObjectClass,
        object_closure::ObjectClosure,
        object_function::ObjectFunction,
        object_instance::ObjectInstance,
        object_manager::ObjectManager,
        object_native_function::ObjectNativeFunction,
        object_string::ObjectString,
        object_upvalue::ObjectUpvalue,
    },
    table::Table,
    value::{
        as_bool, as_number, as_object, format_value, is_bool, is_nil, is_number, is_object,
        is_object_type, is_string, make_bool_value, make_number_value, make_object_value,
        make_string_value, Value,
    },
};

#[derive(Debug, PartialEq, Eq)]
pub enum InterpretResult {
    InterpretOk,
    InterpretCompileError,
    InterpretRuntimeError,
}

/// Where `print` writes. Embedders (and tests) can swap the sink for a
/// buffer; diagnostics always go to stderr regardless.
pub enum OutputSink {
    Stdout,
    Capture(String),
}

pub struct VM {
    stack: [Value; STACK_MAX],
    stack_top_pos: usize,
    frames: Vec<CallFrame>,
    /// Head of the intrusive open-upvalue list, threaded through
    /// `ObjectUpvalue::next` and ordered by descending stack slot; the head
    /// is always the innermost capture still on the stack.
    open_upvalues: *mut ObjectUpvalue,
    globals: Table,
    intern_strings: Table,
    init_string: *mut ObjectString,
    object_manager: ObjectManager,
    gc: GarbageCollector,
    bytes_allocated: usize,
    next_gc: usize,
    out: OutputSink,
}

impl VM {
    pub fn new() -> Box<VM> {
        let mut vm = Box::new(VM {
            stack: [Value::new(); STACK_MAX],
            stack_top_pos: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: std::ptr::null_mut(),
            globals: Table::new(),
            intern_strings: Table::new(),
            init_string: std::ptr::null_mut(),
            object_manager: ObjectManager::new(),
            gc: GarbageCollector::new(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            out: OutputSink::Stdout,
        });

        // The interned "init" handle lives for the whole VM; initializer
        // lookups at call sites go through it without re-hashing.
        let init_value = make_string_value(&mut vm.object_manager, &mut vm.intern_strings, "init");
        vm.init_string = as_object(&init_value) as *mut ObjectString;
        vm
    }

    /// Register a host callable under a global name with a fixed arity.
    pub fn define_native(
        &mut self,
        name: &str,
        arity: usize,
        native_object: impl NativeObject + 'static,
    ) {
        // Both the name string and the native object are parked on the stack
        // until the global entry holds them.
        let name_value = make_string_value(&mut self.object_manager, &mut self.intern_strings, name);
        self.push(name_value);
        let (native_ptr, _) =
            self.object_manager
                .alloc_native_function(name.to_string(), arity, native_object);
        self.push(make_object_value(native_ptr as *mut Object));

        let key = as_object(&self.stack[self.stack_top_pos - 2]) as *mut ObjectString;
        let value = self.stack[self.stack_top_pos - 1];
        self.globals.set(key, value);
        self.pop();
        self.pop();
        self.collect_if_needed();
    }

    pub fn capture_output(&mut self) {
        self.out = OutputSink::Capture(String::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutputSink::Capture(buffer) => mem::take(buffer),
            OutputSink::Stdout => String::new(),
        }
    }

    fn write_line(&mut self, text: &str) {
        match &mut self.out {
            OutputSink::Stdout => println!("{}", text),
            OutputSink::Capture(buffer) => {
                buffer.push_str(text);
                buffer.push('\n');
            }
        }
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = {
            let mut parser = Parser::new(&mut self.object_manager, &mut self.intern_strings);
            parser.compile(source)
        };

        let function = match function {
            Some(function) => function,
            None => return InterpretResult::InterpretCompileError,
        };

        let (function_ptr, _) = self.object_manager.adopt_function(function);
        self.push(make_object_value(function_ptr as *mut Object));
        let (closure_ptr, _) = self.object_manager.alloc_closure(function_ptr);
        self.pop();
        self.push(make_object_value(closure_ptr as *mut Object));

        if !self.call(closure_ptr, 0) {
            return InterpretResult::InterpretRuntimeError;
        }

        self.run()
    }

    pub fn push(&mut self, value: Value) {
        if self.stack_top_pos < STACK_MAX {
            self.stack[self.stack_top_pos] = value;
            self.stack_top_pos += 1;
        } else {
            panic!("Value stack overflow");
        }
    }

    pub fn pop(&mut self) -> Value {
        if self.stack_top_pos > 0 {
            self.stack_top_pos -= 1;
            self.stack[self.stack_top_pos]
        } else {
            panic!("Value stack underflow");
        }
    }

    fn peek_steps(&self, distance: usize) -> Value {
        self.stack[self.stack_top_pos - distance - 1]
    }

    fn is_falsey(value: &Value) -> bool {
        is_nil(value) || (is_bool(value) && !as_bool(value))
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no call frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no call frame");
        let byte = unsafe { (&(*(*frame.closure).function).chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no call frame");
        unsafe { *(*(*frame.closure).function).chunk.get_constant(index) }
    }

    fn read_string(&mut self) -> *mut ObjectString {
        let value = self.read_constant();
        as_object(&value) as *mut ObjectString
    }

    fn run(&mut self) -> InterpretResult {
        loop {
            debug_feature::trace_execution(self);

            let instruction = OpCode::from_byte(self.read_byte());

            match instruction {
                Some(OpCode::Constant) => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Some(OpCode::Nil) => {
                    self.push(crate::value::make_nil_value());
                }
                Some(OpCode::True) => {
                    self.push(make_bool_value(true));
                }
                Some(OpCode::False) => {
                    self.push(make_bool_value(false));
                }
                Some(OpCode::Pop) => {
                    self.pop();
                }
                Some(OpCode::GetLocal) => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().stack_base;
                    self.push(self.stack[base + slot]);
                }
                Some(OpCode::SetLocal) => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().stack_base;
                    self.stack[base + slot] = self.peek_steps(0);
                }
                Some(OpCode::DefineGlobal) => {
                    let name = self.read_string();
                    let value = self.peek_steps(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                Some(OpCode::GetGlobal) => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", unsafe { &(*name).content });
                            self.runtime_error(&message);
                            return InterpretResult::InterpretRuntimeError;
                        }
                    }
                }
                Some(OpCode::SetGlobal) => {
                    let name = self.read_string();
                    let value = self.peek_steps(0);
                    // A fresh insertion means the global never existed;
                    // undo it and report.
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        let message =
                            format!("Undefined variable '{}'.", unsafe { &(*name).content });
                        self.runtime_error(&message);
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::GetUpvalue) => {
                    let index = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let value = unsafe { *(*(&(*closure).upvalues)[index]).location };
                    self.push(value);
                }
                Some(OpCode::SetUpvalue) => {
                    let index = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let value = self.peek_steps(0);
                    unsafe {
                        *(*(&mut (*closure).upvalues)[index]).location = value;
                    }
                }
                Some(OpCode::GetProperty) => {
                    let name = self.read_string();
                    let receiver = self.peek_steps(0);
                    if !is_object_type(&receiver, ObjectType::ObjInstance) {
                        self.runtime_error("Only instances have properties.");
                        return InterpretResult::InterpretRuntimeError;
                    }

                    let instance = as_object(&receiver) as *mut ObjectInstance;
                    if let Some(value) = unsafe { (*instance).fields.get(name) } {
                        self.pop(); // the instance
                        self.push(value);
                    } else {
                        let class = unsafe { (*instance).class };
                        if !self.bind_method(class, name) {
                            return InterpretResult::InterpretRuntimeError;
                        }
                    }
                }
                Some(OpCode::SetProperty) => {
                    let name = self.read_string();
                    let receiver = self.peek_steps(1);
                    if !is_object_type(&receiver, ObjectType::ObjInstance) {
                        self.runtime_error("Only instances have fields.");
                        return InterpretResult::InterpretRuntimeError;
                    }

                    let instance = as_object(&receiver) as *mut ObjectInstance;
                    let value = self.peek_steps(0);
                    unsafe {
                        (*instance).fields.set(name, value);
                    }
                    let value = self.pop();
                    self.pop(); // the instance
                    self.push(value);
                }
                Some(OpCode::GetSuper) => {
                    let name = self.read_string();
                    let superclass_value = self.pop();
                    let superclass = as_object(&superclass_value) as *mut ObjectClass;
                    if !self.bind_method(superclass, name) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Equal) => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(make_bool_value(a == b));
                }
                Some(OpCode::Greater) => {
                    if !self.binary_op(OpCode::Greater) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Less) => {
                    if !self.binary_op(OpCode::Less) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Add) => {
                    let value_b = self.peek_steps(0);
                    let value_a = self.peek_steps(1);
                    if is_string(&value_a) && is_string(&value_b) {
                        self.concatenate();
                    } else if is_number(&value_a) && is_number(&value_b) {
                        let number_b = as_number(&self.pop());
                        let number_a = as_number(&self.pop());
                        self.push(make_number_value(number_a + number_b));
                    } else {
                        self.runtime_error("Operands must be two numbers or two strings.");
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Subtract) => {
                    if !self.binary_op(OpCode::Subtract) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Multiply) => {
                    if !self.binary_op(OpCode::Multiply) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Divide) => {
                    if !self.binary_op(OpCode::Divide) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Not) => {
                    let value = self.pop();
                    self.push(make_bool_value(Self::is_falsey(&value)));
                }
                Some(OpCode::Negate) => {
                    if !is_number(&self.peek_steps(0)) {
                        self.runtime_error("Operand must be a number.");
                        return InterpretResult::InterpretRuntimeError;
                    }
                    let value = self.pop();
                    self.push(make_number_value(-as_number(&value)));
                }
                Some(OpCode::Print) => {
                    let value = self.pop();
                    let text = format_value(&value);
                    self.write_line(&text);
                }
                Some(OpCode::Jump) => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip += offset;
                }
                Some(OpCode::JumpIfFalse) => {
                    let offset = self.read_short() as usize;
                    if Self::is_falsey(&self.peek_steps(0)) {
                        self.current_frame_mut().ip += offset;
                    }
                }
                Some(OpCode::Loop) => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip -= offset;
                }
                Some(OpCode::Call) => {
                    let argument_count = self.read_byte() as usize;
                    let callee = self.peek_steps(argument_count);
                    if !self.call_value(callee, argument_count) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Invoke) => {
                    let method_name = self.read_string();
                    let argument_count = self.read_byte() as usize;
                    if !self.invoke(method_name, argument_count) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::SuperInvoke) => {
                    let method_name = self.read_string();
                    let argument_count = self.read_byte() as usize;
                    let superclass_value = self.pop();
                    let superclass = as_object(&superclass_value) as *mut ObjectClass;
                    if !self.invoke_from_class(superclass, method_name, argument_count) {
                        return InterpretResult::InterpretRuntimeError;
                    }
                }
                Some(OpCode::Closure) => {
                    let function_value = self.read_constant();
                    let function = as_object(&function_value) as *mut ObjectFunction;
                    let (closure, _) = self.object_manager.alloc_closure(function);
                    self.push(make_object_value(closure as *mut Object));

                    let upvalue_count = unsafe { (*function).upvalue_count };
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let stack_base = self.current_frame().stack_base;
                            self.capture_upvalue(stack_base + index)
                        } else {
                            let enclosing = self.current_frame().closure;
                            unsafe { (&(*enclosing).upvalues)[index] }
                        };
                        unsafe {
                            (*closure).upvalues.push(upvalue);
                        }
                    }
                    self.collect_if_needed();
                }
                Some(OpCode::CloseUpvalue) => {
                    self.close_upvalues(self.stack_top_pos - 1);
                    self.pop();
                }
                Some(OpCode::Class) => {
                    let name = self.read_string();
                    let (class, _) = self.object_manager.alloc_class(name);
                    self.push(make_object_value(class as *mut Object));
                    self.collect_if_needed();
                }
                Some(OpCode::Inherit) => {
                    let superclass_value = self.peek_steps(1);
                    if !is_object_type(&superclass_value, ObjectType::ObjClass) {
                        self.runtime_error("Superclass must be a class.");
                        return InterpretResult::InterpretRuntimeError;
                    }

                    let superclass = as_object(&superclass_value) as *mut ObjectClass;
                    let subclass = as_object(&self.peek_steps(0)) as *mut ObjectClass;
                    unsafe {
                        let methods = &(*superclass).methods;
                        (*subclass).methods.add_all(methods);
                    }
                    self.pop(); // the subclass
                }
                Some(OpCode::Method) => {
                    let name = self.read_string();
                    let method = self.peek_steps(0);
                    let class = as_object(&self.peek_steps(1)) as *mut ObjectClass;
                    unsafe {
                        (*class).methods.set(name, method);
                    }
                    self.pop();
                }
                Some(OpCode::Return) => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no call frame");
                    self.close_upvalues(frame.stack_base);

                    if self.frames.is_empty() {
                        self.pop(); // the script closure
                        return InterpretResult::InterpretOk;
                    }

                    self.stack_top_pos = frame.stack_base;
                    self.push(result);
                }
                None => {
                    self.runtime_error("Unknown opcode.");
                    return InterpretResult::InterpretRuntimeError;
                }
            }
        }
    }

    fn binary_op(&mut self, op_code: OpCode) -> bool {
        let value_b = self.peek_steps(0);
        let value_a = self.peek_steps(1);
        if !is_number(&value_a) || !is_number(&value_b) {
            self.runtime_error("Operands must be numbers.");
            return false;
        }

        let number_b = as_number(&self.pop());
        let number_a = as_number(&self.pop());
        match op_code {
            OpCode::Greater => self.push(make_bool_value(number_a > number_b)),
            OpCode::Less => self.push(make_bool_value(number_a < number_b)),
            OpCode::Subtract => self.push(make_number_value(number_a - number_b)),
            OpCode::Multiply => self.push(make_number_value(number_a * number_b)),
            OpCode::Divide => self.push(make_number_value(number_a / number_b)),
            _ => unreachable!("Unexpected binary operator: {}", op_code),
        };

        true
    }

    fn concatenate(&mut self) {
        // Both operands stay parked on the stack while the result string is
        // allocated, so a collection at the intern step cannot free them.
        let value_b = self.peek_steps(0);
        let value_a = self.peek_steps(1);
        let combination = unsafe {
            let string_b = (*as_object(&value_b)).as_string();
            let string_a = (*as_object(&value_a)).as_string();
            let mut combination =
                String::with_capacity(string_a.content.len() + string_b.content.len());
            combination.push_str(&string_a.content);
            combination.push_str(&string_b.content);
            combination
        };

        let combined =
            make_string_value(&mut self.object_manager, &mut self.intern_strings, &combination);
        self.pop();
        self.pop();
        self.push(combined);
        self.collect_if_needed();
    }

    fn call_value(&mut self, callee: Value, argument_count: usize) -> bool {
        if is_object(&callee) {
            match unsafe { (*as_object(&callee)).obj_type } {
                ObjectType::ObjClosure => {
                    return self.call(as_object(&callee) as *mut ObjectClosure, argument_count)
                }
                ObjectType::ObjBoundMethod => {
                    let bound = as_object(&callee) as *mut ObjectBoundMethod;
                    let receiver_slot = self.stack_top_pos - argument_count - 1;
                    unsafe {
                        self.stack[receiver_slot] = (*bound).receiver;
                        return self.call((*bound).method, argument_count);
                    }
                }
                ObjectType::ObjClass => {
                    let class = as_object(&callee) as *mut ObjectClass;
                    let (instance, _) = self.object_manager.alloc_instance(class);
                    let callee_slot = self.stack_top_pos - argument_count - 1;
                    self.stack[callee_slot] = make_object_value(instance as *mut Object);
                    self.collect_if_needed();

                    let initializer = unsafe { (*class).methods.get(self.init_string) };
                    if let Some(initializer) = initializer {
                        return self
                            .call(as_object(&initializer) as *mut ObjectClosure, argument_count);
                    } else if argument_count != 0 {
                        let message = format!("Expected 0 arguments but got {}.", argument_count);
                        self.runtime_error(&message);
                        return false;
                    }
                    return true;
                }
                ObjectType::ObjNativeFunction => {
                    let native = as_object(&callee) as *mut ObjectNativeFunction;
                    let arity = unsafe { (*native).arity };
                    if argument_count != arity {
                        let message =
                            format!("Expected {} arguments but got {}.", arity, argument_count);
                        self.runtime_error(&message);
                        return false;
                    }

                    let args_start = self.stack_top_pos - argument_count;
                    let result =
                        unsafe { (*native).invoke(&self.stack[args_start..self.stack_top_pos]) };
                    return match result {
                        Ok(value) => {
                            self.stack_top_pos -= argument_count + 1;
                            self.push(value);
                            true
                        }
                        Err(message) => {
                            self.runtime_error(&message);
                            false
                        }
                    };
                }
                _ => {}
            }
        }

        self.runtime_error("Can only call functions and classes.");
        false
    }

    fn call(&mut self, closure: *mut ObjectClosure, argument_count: usize) -> bool {
        let arity = unsafe { (*(*closure).function).arity };
        if argument_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, argument_count);
            self.runtime_error(&message);
            return false;
        }

        if self.frames.len() == FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }

        let stack_base = self.stack_top_pos - argument_count - 1;
        self.frames.push(CallFrame::new(closure, stack_base));
        true
    }

    fn invoke(&mut self, name: *mut ObjectString, argument_count: usize) -> bool {
        let receiver = self.peek_steps(argument_count);
        if !is_object_type(&receiver, ObjectType::ObjInstance) {
            self.runtime_error("Only instances have methods.");
            return false;
        }

        let instance = as_object(&receiver) as *mut ObjectInstance;
        // A field shadowing the method name is loaded and called as a plain
        // value, matching get-then-call semantics.
        if let Some(field) = unsafe { (*instance).fields.get(name) } {
            let callee_slot = self.stack_top_pos - argument_count - 1;
            self.stack[callee_slot] = field;
            return self.call_value(field, argument_count);
        }

        let class = unsafe { (*instance).class };
        self.invoke_from_class(class, name, argument_count)
    }

    fn invoke_from_class(
        &mut self,
        class: *mut ObjectClass,
        name: *mut ObjectString,
        argument_count: usize,
    ) -> bool {
        let method = unsafe { (*class).methods.get(name) };
        match method {
            Some(method) => self.call(as_object(&method) as *mut ObjectClosure, argument_count),
            None => {
                let message = format!("Undefined property '{}'.", unsafe { &(*name).content });
                self.runtime_error(&message);
                false
            }
        }
    }

    fn bind_method(&mut self, class: *mut ObjectClass, name: *mut ObjectString) -> bool {
        let method = unsafe { (*class).methods.get(name) };
        let method = match method {
            Some(method) => method,
            None => {
                let message = format!("Undefined property '{}'.", unsafe { &(*name).content });
                self.runtime_error(&message);
                return false;
            }
        };

        // The receiver stays parked at the stack top during allocation.
        let receiver = self.peek_steps(0);
        let (bound, _) = self
            .object_manager
            .alloc_bound_method(receiver, as_object(&method) as *mut ObjectClosure);
        self.pop();
        self.push(make_object_value(bound as *mut Object));
        self.collect_if_needed();
        true
    }

    /// Find or create the open upvalue for a stack slot. The descending
    /// slot order means the walk stops at the first entry at or below the
    /// target; a new upvalue is spliced in right there.
    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjectUpvalue {
        let mut previous: *mut ObjectUpvalue = std::ptr::null_mut();
        let mut current = self.open_upvalues;
        unsafe {
            while !current.is_null() && (*current).stack_slot > slot {
                previous = current;
                current = (*current).next;
            }

            if !current.is_null() && (*current).stack_slot == slot {
                return current;
            }
        }

        let location = &mut self.stack[slot] as *mut Value;
        let (upvalue, _) = self.object_manager.alloc_upvalue(location, slot);
        unsafe {
            (*upvalue).next = current;
            if previous.is_null() {
                self.open_upvalues = upvalue;
            } else {
                (*previous).next = upvalue;
            }
        }
        upvalue
    }

    /// Close every open upvalue at or above `from_slot`: the slot's current
    /// value moves into the upvalue, which then points at itself and leaves
    /// the list. Only a head prefix can qualify, so this truncates from the
    /// front.
    fn close_upvalues(&mut self, from_slot: usize) {
        unsafe {
            while !self.open_upvalues.is_null() && (*self.open_upvalues).stack_slot >= from_slot {
                let upvalue = self.open_upvalues;
                (*upvalue).closed = *(*upvalue).location;
                (*upvalue).location = &mut (*upvalue).closed as *mut Value;
                self.open_upvalues = (*upvalue).next;
                (*upvalue).next = std::ptr::null_mut();
            }
        }
    }

    /// Print the message and a stack trace (deepest frame first), then
    /// unwind completely so the VM is reusable.
    fn runtime_error(&mut self, message: &str) {
        eprintln!("{}", message);

        for frame in self.frames.iter().rev() {
            let function = unsafe { &*(*frame.closure).function };
            let instruction_offset = frame.ip.saturating_sub(1);
            let line = function.chunk.line_at(instruction_offset);
            if function.name.is_empty() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}()", line, function.name);
            }
        }

        self.reset_stack();
    }

    fn reset_stack(&mut self) {
        self.stack_top_pos = 0;
        self.frames.clear();
        self.open_upvalues = std::ptr::null_mut();
    }

    /// Allocation checkpoint: pull the freshly allocated bytes into the
    /// counter and collect once the threshold is crossed (or always, under
    /// gc_stress). Call sites guarantee every new object is rooted first.
    fn collect_if_needed(&mut self) {
        self.bytes_allocated += self.object_manager.drain_pending_bytes();
        if cfg!(feature = "gc_stress") || self.bytes_allocated > self.next_gc {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        self.bytes_allocated += self.object_manager.drain_pending_bytes();
        let before = self.bytes_allocated;

        let Self {
            gc,
            object_manager,
            stack,
            stack_top_pos,
            frames,
            globals,
            open_upvalues,
            intern_strings,
            init_string,
            ..
        } = self;

        gc.prepare_collection(object_manager);
        gc.mark_roots(
            &stack[..],
            *stack_top_pos,
            globals,
            frames,
            *open_upvalues,
            *init_string,
        );
        gc.trace_references();
        gc.purge_unmarked_strings(intern_strings);
        let freed = gc.sweep(object_manager);

        let bytes_allocated = before.saturating_sub(freed);
        let next_gc = bytes_allocated * GC_HEAP_GROW_FACTOR;
        gc.record_cycle(before, freed, bytes_allocated, next_gc);

        self.bytes_allocated = bytes_allocated;
        self.next_gc = next_gc;
    }

    pub fn gc_stats(&self) -> &crate::gc::GCStats {
        self.gc.stats()
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn trace_execution(vm: &VM) {
        print!("{: >10}", "");
        for slot in &vm.stack[0..vm.stack_top_pos] {
            print!(" [ {} ]", format_value(slot));
        }
        println!();
        let frame = vm.frames.last().expect("no call frame");
        debug::disassemble_instruction(&frame.function().chunk, frame.ip);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::*;

    pub fn trace_execution(_vm: &VM) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(source: &str) -> (InterpretResult, String) {
        let mut vm = VM::new();
        vm.capture_output();
        let result = vm.interpret(source);
        let output = vm.take_output();
        (result, output)
    }

    fn assert_prints(source: &str, expected: &str) {
        let (result, output) = run_source(source);
        assert_eq!(result, InterpretResult::InterpretOk, "source: {}", source);
        assert_eq!(output, expected, "source: {}", source);
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_prints("print 1 + 2 * 3;", "7\n");
        assert_prints("print (1 + 2) * 3;", "9\n");
        assert_prints("print 10 / 4;", "2.5\n");
        assert_prints("print -(3 - 5);", "2\n");
    }

    #[test]
    fn test_string_concatenation() {
        assert_prints("var a = \"foo\"; var b = \"bar\"; print a + b;", "foobar\n");
        assert_prints("print \"st\" + \"ri\" + \"ng\";", "string\n");
    }

    #[test]
    fn test_comparison_and_equality() {
        assert_prints("print !(5 - 4 > 3 * 2 == !nil);", "true\n");
        assert_prints("print 1 == 1.0;", "true\n");
        assert_prints("print \"a\" + \"b\" == \"ab\";", "true\n");
        assert_prints("print nil == false;", "false\n");
        assert_prints("print 2 >= 2;", "true\n");
        assert_prints("print 1 != 2;", "true\n");
    }

    #[test]
    fn test_truthiness() {
        // Only nil and false are falsy.
        assert_prints("if (0) print \"zero\"; else print \"no\";", "zero\n");
        assert_prints("if (\"\") print \"empty\"; else print \"no\";", "empty\n");
        assert_prints("if (nil) print \"yes\"; else print \"nil is falsy\";", "nil is falsy\n");
        assert_prints("print !false;", "true\n");
    }

    #[test]
    fn test_and_or_short_circuit() {
        assert_prints("print 1 and 2;", "2\n");
        assert_prints("print nil and 2;", "nil\n");
        assert_prints("print nil or 2;", "2\n");
        assert_prints("print 1 or 2;", "1\n");
        // The right side must not run when short-circuited.
        assert_prints(
            "var a = 0; fun touch() { a = a + 1; return true; } var _ = false and touch(); print a;",
            "0\n",
        );
    }

    #[test]
    fn test_globals_and_locals() {
        assert_prints("var a = 1; a = a + 2; print a;", "3\n");
        assert_prints("var a = 1; { var a = 2; print a; } print a;", "2\n1\n");
    }

    #[test]
    fn test_if_else() {
        assert_prints("if (1 < 2) print \"then\"; else print \"else\";", "then\n");
        assert_prints("if (1 > 2) print \"then\"; else print \"else\";", "else\n");
    }

    #[test]
    fn test_while_loop() {
        assert_prints(
            "var i = 0; while (i < 3) { print i; i = i + 1; }",
            "0\n1\n2\n",
        );
    }

    #[test]
    fn test_for_loop() {
        assert_prints("for (var i = 0; i < 3; i = i + 1) print i;", "0\n1\n2\n");
        assert_prints(
            "var i = 0; for (; i < 2; i = i + 1) print i;",
            "0\n1\n",
        );
    }

    #[test]
    fn test_function_calls() {
        assert_prints(
            "fun sum(a, b, c) { return a + b + c; } print 4 + sum(5, 6, 7);",
            "22\n",
        );
        assert_prints("fun greet() { print \"hello\"; } greet();", "hello\n");
        assert_prints("fun value() { return 42; } print value();", "42\n");
        assert_prints("fun nothing() {} print nothing();", "nil\n");
    }

    #[test]
    fn test_closure_counter() {
        assert_prints(
            "fun counter() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }
             var c = counter();
             print c(); print c(); print c();",
            "1\n2\n3\n",
        );
    }

    #[test]
    fn test_independent_closures() {
        assert_prints(
            "fun counter() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }
             var a = counter(); var b = counter();
             print a(); print a(); print b();",
            "1\n2\n1\n",
        );
    }

    #[test]
    fn test_closures_share_captured_variable() {
        assert_prints(
            "fun pair() {
                 var shared = 0;
                 fun bump() { shared = shared + 1; }
                 fun read() { return shared; }
                 bump();
                 bump();
                 return read;
             }
             var read = pair();
             print read();",
            "2\n",
        );
    }

    #[test]
    fn test_close_upvalue_on_scope_exit() {
        assert_prints(
            "var keep;
             {
                 var captured = \"inner\";
                 fun grab() { return captured; }
                 keep = grab;
             }
             print keep();",
            "inner\n",
        );
    }

    #[test]
    fn test_classes_and_methods() {
        assert_prints(
            "class Greeter { greet(who) { print \"hi \" + who; } } Greeter().greet(\"world\");",
            "hi world\n",
        );
    }

    #[test]
    fn test_instance_fields() {
        assert_prints(
            "class Box {} var box = Box(); box.payload = 7; print box.payload;",
            "7\n",
        );
        assert_prints(
            "class Point { init(x, y) { this.x = x; this.y = y; } }
             var point = Point(3, 4);
             print point.x + point.y;",
            "7\n",
        );
    }

    #[test]
    fn test_initializer_returns_instance() {
        assert_prints(
            "class Thing { init() { this.tag = \"ok\"; } }
             print Thing().tag;",
            "ok\n",
        );
        // Explicit bare return still yields the instance.
        assert_prints(
            "class Early { init() { this.tag = \"set\"; return; } }
             print Early().tag;",
            "set\n",
        );
    }

    #[test]
    fn test_bound_methods() {
        assert_prints(
            "class Speaker { init(word) { this.word = word; } say() { print this.word; } }
             var method = Speaker(\"bound\").say;
             method();",
            "bound\n",
        );
    }

    #[test]
    fn test_inheritance_and_super() {
        assert_prints(
            "class A { m() { print \"A\"; } }
             class B < A { m() { super.m(); print \"B\"; } }
             B().m();",
            "A\nB\n",
        );
        // Inherited method without override.
        assert_prints(
            "class A { m() { print \"base\"; } }
             class B < A {}
             B().m();",
            "base\n",
        );
    }

    #[test]
    fn test_super_binds_current_receiver() {
        assert_prints(
            "class A { name() { return \"A\"; } describe() { print \"I am \" + this.name(); } }
             class B < A { name() { return \"B\"; } describe() { super.describe(); } }
             B().describe();",
            "I am B\n",
        );
    }

    #[test]
    fn test_field_shadows_method_on_invoke() {
        assert_prints(
            "class Host { act() { print \"method\"; } }
             fun replacement() { print \"field\"; }
             var host = Host();
             host.act = replacement;
             host.act();",
            "field\n",
        );
    }

    #[test]
    fn test_method_overrides_copied_superclass_entry() {
        assert_prints(
            "class A { m() { print \"A\"; } }
             class B < A { m() { print \"B\"; } }
             B().m(); A().m();",
            "B\nA\n",
        );
    }

    #[test]
    fn test_native_function() {
        struct Doubler;
        impl NativeObject for Doubler {
            fn call(&self, args: &[Value]) -> Result<Value, String> {
                Ok(make_number_value(as_number(&args[0]) * 2.0))
            }
        }

        let mut vm = VM::new();
        vm.capture_output();
        vm.define_native("double", 1, Doubler);
        let result = vm.interpret("print double(21);");
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.take_output(), "42\n");
    }

    #[test]
    fn test_native_arity_mismatch() {
        struct NoArgs;
        impl NativeObject for NoArgs {
            fn call(&self, _args: &[Value]) -> Result<Value, String> {
                Ok(crate::value::make_nil_value())
            }
        }

        let mut vm = VM::new();
        vm.define_native("noargs", 0, NoArgs);
        assert_eq!(
            vm.interpret("noargs(1);"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_native_error_becomes_runtime_error() {
        struct Failing;
        impl NativeObject for Failing {
            fn call(&self, _args: &[Value]) -> Result<Value, String> {
                Err("native exploded".to_string())
            }
        }

        let mut vm = VM::new();
        vm.define_native("fail", 0, Failing);
        assert_eq!(
            vm.interpret("fail();"),
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_undefined_variable_is_runtime_error() {
        let (result, _) = run_source("print a;");
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_assign_undefined_global_is_runtime_error() {
        let (result, _) = run_source("a = 1;");
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_operand_type_errors() {
        assert_eq!(
            run_source("print 1 + \"one\";").0,
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            run_source("print -\"x\";").0,
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            run_source("print 1 < \"two\";").0,
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_not_callable_is_runtime_error() {
        assert_eq!(
            run_source("var x = 1; x();").0,
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            run_source("\"text\"();").0,
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_arity_mismatch_is_runtime_error() {
        assert_eq!(
            run_source("fun two(a, b) {} two(1);").0,
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            run_source("class NoInit {} NoInit(1);").0,
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_property_errors() {
        assert_eq!(
            run_source("print 4.x;").0,
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            run_source("class Empty {} print Empty().missing;").0,
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            run_source("var s = \"str\"; s.field = 1;").0,
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(
            run_source("class Empty {} Empty().missing();").0,
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_inherit_from_non_class_is_runtime_error() {
        assert_eq!(
            run_source("var NotClass = 1; class Sub < NotClass {}").0,
            InterpretResult::InterpretRuntimeError
        );
    }

    #[test]
    fn test_deep_recursion_overflows_frames() {
        let (result, _) = run_source("fun forever() { forever(); } forever();");
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_vm_reusable_after_runtime_error() {
        let mut vm = VM::new();
        vm.capture_output();
        assert_eq!(
            vm.interpret("print missing;"),
            InterpretResult::InterpretRuntimeError
        );
        assert_eq!(vm.interpret("print 1;"), InterpretResult::InterpretOk);
        assert_eq!(vm.take_output(), "1\n");
    }

    #[test]
    fn test_compile_error_result() {
        let mut vm = VM::new();
        assert_eq!(
            vm.interpret("class X < X {}"),
            InterpretResult::InterpretCompileError
        );
        assert_eq!(vm.interpret("print 1 +;"), InterpretResult::InterpretCompileError);
    }

    #[test]
    fn test_interning_across_runtime_concat() {
        let mut vm = VM::new();
        vm.capture_output();
        // "ab" built at runtime must be the same object as the literal.
        assert_eq!(
            vm.interpret("print (\"a\" + \"b\") == \"ab\";"),
            InterpretResult::InterpretOk
        );
        assert_eq!(vm.take_output(), "true\n");
    }

    // Under gc_stress the checkpoints already purged everything mid-run,
    // so the before/after comparison below would see no change.
    #[test]
    #[cfg_attr(feature = "gc_stress", ignore)]
    fn test_collect_garbage_reclaims_unreachable_strings() {
        let mut vm = VM::new();
        vm.capture_output();
        assert_eq!(
            vm.interpret(
                "var keep = \"keep-me\" + \"-suffix\";
                 { var local = \"throwaway\" + \"-garbage\"; print local; }
                 print keep;"
            ),
            InterpretResult::InterpretOk
        );

        let interned_before = vm.intern_strings.len();
        vm.collect_garbage();
        let interned_after = vm.intern_strings.len();
        assert!(
            interned_after < interned_before,
            "unreachable interned strings should be purged ({} -> {})",
            interned_before,
            interned_after
        );

        // The global survivor is still intact and usable.
        assert_eq!(
            vm.interpret("print keep;"),
            InterpretResult::InterpretOk
        );
        assert_eq!(vm.take_output(), "throwaway-garbage\nkeep-me-suffix\nkeep-me-suffix\n");
        assert!(vm.gc_stats().cycles >= 1);
    }

    #[test]
    fn test_collect_garbage_keeps_reachable_graph() {
        let mut vm = VM::new();
        vm.capture_output();
        assert_eq!(
            vm.interpret(
                "class Node { init(label) { this.label = label; } }
                 var root = Node(\"root\");
                 fun counter() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }
                 var tick = counter();
                 tick();"
            ),
            InterpretResult::InterpretOk
        );

        vm.collect_garbage();

        assert_eq!(
            vm.interpret("print root.label; print tick();"),
            InterpretResult::InterpretOk
        );
        assert_eq!(vm.take_output(), "root\n2\n");
    }

    #[test]
    fn test_print_function_values() {
        assert_prints("fun named() {} print named;", "<fn named>\n");
        assert_prints("class Widget {} print Widget;", "Widget\n");
        assert_prints("class Widget {} print Widget();", "Widget instance\n");
    }

    #[test]
    fn test_push_pop_host_api() {
        let mut vm = VM::new();
        vm.push(make_number_value(9.0));
        let value = vm.pop();
        assert_eq!(as_number(&value), 9.0);
    }
}
