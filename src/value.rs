use crate::objects::object::{format_object, Object, ObjectType};
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_string::hash_string;
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    ValueBool,
    ValueNil,
    ValueNumber,
    ValueObject,
}

#[derive(Clone, Copy)]
pub union ValueUnion {
    pub boolean: bool,
    pub number: f64,
    pub object: *mut Object,
}

#[derive(Clone, Copy)]
pub struct Value {
    pub value_type: ValueType,
    pub value_as: ValueUnion,
}

pub type ValueArray = Vec<Value>;

impl Value {
    pub fn new() -> Value {
        make_nil_value()
    }
}

impl Default for Value {
    fn default() -> Value {
        make_nil_value()
    }
}

pub fn make_nil_value() -> Value {
    Value {
        value_type: ValueType::ValueNil,
        value_as: ValueUnion { number: 0.0 },
    }
}

pub fn make_bool_value(boolean: bool) -> Value {
    Value {
        value_type: ValueType::ValueBool,
        value_as: ValueUnion { boolean },
    }
}

pub fn make_number_value(number: f64) -> Value {
    Value {
        value_type: ValueType::ValueNumber,
        value_as: ValueUnion { number },
    }
}

pub fn make_object_value(object: *mut Object) -> Value {
    Value {
        value_type: ValueType::ValueObject,
        value_as: ValueUnion { object },
    }
}

pub fn is_nil(value: &Value) -> bool {
    value.value_type == ValueType::ValueNil
}

pub fn is_bool(value: &Value) -> bool {
    value.value_type == ValueType::ValueBool
}

pub fn is_number(value: &Value) -> bool {
    value.value_type == ValueType::ValueNumber
}

pub fn is_object(value: &Value) -> bool {
    value.value_type == ValueType::ValueObject
}

pub fn is_object_type(value: &Value, obj_type: ObjectType) -> bool {
    is_object(value) && unsafe { (*as_object(value)).obj_type == obj_type }
}

pub fn is_string(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjString)
}

pub fn as_bool(value: &Value) -> bool {
    unsafe { value.value_as.boolean }
}

pub fn as_number(value: &Value) -> f64 {
    unsafe { value.value_as.number }
}

pub fn as_object(value: &Value) -> *mut Object {
    unsafe { value.value_as.object }
}

/// Equality follows the variant: numbers compare by value, heap references by
/// identity. Interning makes identity equality coincide with byte equality
/// for strings.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if self.value_type != other.value_type {
            return false;
        }

        match self.value_type {
            ValueType::ValueNil => true,
            ValueType::ValueBool => as_bool(self) == as_bool(other),
            ValueType::ValueNumber => as_number(self) == as_number(other),
            ValueType::ValueObject => std::ptr::eq(as_object(self), as_object(other)),
        }
    }
}

/// Produce a string value, interning through the VM's intern table. Equal
/// byte sequences always come back as the same object, which is what makes
/// identity comparison in `Value::eq` correct for strings.
pub fn make_string_value(
    object_manager: &mut ObjectManager,
    intern_strings: &mut Table,
    content: &str,
) -> Value {
    let hash = hash_string(content);
    if let Some(existing) = intern_strings.find_string(content, hash) {
        return make_object_value(existing as *mut Object);
    }

    let (ptr, _) = object_manager.alloc_string(content);
    intern_strings.set(ptr, make_nil_value());
    make_object_value(ptr as *mut Object)
}

pub fn format_value(value: &Value) -> String {
    match value.value_type {
        ValueType::ValueNil => "nil".to_string(),
        ValueType::ValueBool => {
            if as_bool(value) {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        ValueType::ValueNumber => format_number(as_number(value)),
        ValueType::ValueObject => unsafe { format_object(as_object(value)) },
    }
}

fn format_number(number: f64) -> String {
    if !number.is_finite() {
        return format!("{}", number);
    }

    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        let formatted = format!("{:.10}", number);
        let formatted = formatted.trim_end_matches('0').trim_end_matches('.');
        formatted.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_manager::ObjectManager;

    #[test]
    fn test_scalar_equality() {
        assert!(make_nil_value() == make_nil_value());
        assert!(make_bool_value(true) == make_bool_value(true));
        assert!(make_bool_value(true) != make_bool_value(false));
        assert!(make_number_value(1.5) == make_number_value(1.5));
        assert!(make_number_value(0.0) != make_nil_value());
        assert!(make_bool_value(false) != make_nil_value());
    }

    #[test]
    fn test_object_equality_is_identity() {
        let mut manager = ObjectManager::new();
        let (first, _) = manager.alloc_string("abc");
        let (second, _) = manager.alloc_string("abc");

        let value_a = make_object_value(first as *mut Object);
        let value_b = make_object_value(first as *mut Object);
        let value_c = make_object_value(second as *mut Object);
        assert!(value_a == value_b);
        assert!(value_a != value_c);
    }

    #[test]
    fn test_format_numbers() {
        assert_eq!(format_value(&make_number_value(7.0)), "7");
        assert_eq!(format_value(&make_number_value(-3.0)), "-3");
        assert_eq!(format_value(&make_number_value(2.5)), "2.5");
        assert_eq!(format_value(&make_number_value(0.1)), "0.1");
    }

    #[test]
    fn test_format_scalars() {
        assert_eq!(format_value(&make_nil_value()), "nil");
        assert_eq!(format_value(&make_bool_value(true)), "true");
        assert_eq!(format_value(&make_bool_value(false)), "false");
    }
}
