//! Runtime value type for VM slots.

use std::fmt;
use std::rc::Rc;

use crate::object::{ClassRef, ClosureRef, InstanceRef, NativeClosureRef, TableRef, UserDataRef};

/// Identity token stamped on classes and user data.
///
/// The VM never interprets a tag; it only compares them when the host asks
/// for a tag-checked instance pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeTag(pub u64);

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Null,
    Integer,
    Float,
    Bool,
    String,
    Table,
    Class,
    Instance,
    UserData,
    NativeClosure,
    Closure,
}

impl ObjectType {
    /// Script-visible type name, as returned by `type(v)`.
    pub fn name(self) -> &'static str {
        match self {
            ObjectType::Null => "null",
            ObjectType::Integer => "integer",
            ObjectType::Float => "float",
            ObjectType::Bool => "bool",
            ObjectType::String => "string",
            ObjectType::Table => "table",
            ObjectType::Class => "class",
            ObjectType::Instance => "instance",
            ObjectType::UserData => "userdata",
            ObjectType::NativeClosure => "native function",
            ObjectType::Closure => "function",
        }
    }
}

/// A dynamically typed VM value.
///
/// Cloning an object value adds a reference; dropping it releases one.
/// Equality is by value for primitives and by identity for objects.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    Bool(bool),
    String(Rc<str>),
    Table(TableRef),
    Class(ClassRef),
    Instance(InstanceRef),
    UserData(UserDataRef),
    NativeClosure(NativeClosureRef),
    Closure(ClosureRef),
}

impl Value {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Value::Null => ObjectType::Null,
            Value::Integer(_) => ObjectType::Integer,
            Value::Float(_) => ObjectType::Float,
            Value::Bool(_) => ObjectType::Bool,
            Value::String(_) => ObjectType::String,
            Value::Table(_) => ObjectType::Table,
            Value::Class(_) => ObjectType::Class,
            Value::Instance(_) => ObjectType::Instance,
            Value::UserData(_) => ObjectType::UserData,
            Value::NativeClosure(_) => ObjectType::NativeClosure,
            Value::Closure(_) => ObjectType::Closure,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.object_type().name()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::NativeClosure(_) | Value::Closure(_) | Value::Class(_)
        )
    }

    /// Script truthiness: `null`, `false`, `0` and `0.0` are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Identity comparison for objects, value comparison for primitives.
    ///
    /// Integers and floats compare numerically with each other.
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::UserData(a), Value::UserData(b)) => Rc::ptr_eq(a, b),
            (Value::NativeClosure(a), Value::NativeClosure(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equals(other)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Rc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(Rc::from(value))
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Integer(i) => Value::Integer(i),
            Key::String(s) => Value::String(s),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Integer(v) => write!(f, "Integer({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Table(t) => write!(f, "Table({:p})", Rc::as_ptr(t)),
            Value::Class(c) => write!(f, "Class({:p})", Rc::as_ptr(c)),
            Value::Instance(i) => write!(f, "Instance({:p})", Rc::as_ptr(i)),
            Value::UserData(u) => write!(f, "UserData({:p})", Rc::as_ptr(u)),
            Value::NativeClosure(c) => write!(f, "NativeClosure({})", c.name()),
            Value::Closure(c) => write!(f, "Closure({})", c.name()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Table(t) => write!(f, "(table : {:p})", Rc::as_ptr(t)),
            Value::Class(c) => write!(f, "(class : {:p})", Rc::as_ptr(c)),
            Value::Instance(i) => write!(f, "(instance : {:p})", Rc::as_ptr(i)),
            Value::UserData(u) => write!(f, "(userdata : {:p})", Rc::as_ptr(u)),
            Value::NativeClosure(c) => write!(f, "(native function : {})", c.name()),
            Value::Closure(c) => write!(f, "(function : {})", c.name()),
        }
    }
}

/// A table or class slot key.
///
/// Only integers and strings can be used as keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Integer(i64),
    String(Rc<str>),
}

impl Key {
    /// Convert a value into a key, `None` if the value is not usable as one.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Integer(i) => Some(Key::Integer(*i)),
            Value::String(s) => Some(Key::String(s.clone())),
            _ => None,
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::String(Rc::from(value))
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Integer(value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Integer(i) => write!(f, "{}", i),
            Key::String(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Table;

    #[test]
    fn value_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Integer(0).type_name(), "integer");
        assert_eq!(Value::Float(0.0).type_name(), "float");
        assert_eq!(Value::Bool(false).type_name(), "bool");
        assert_eq!(Value::from("x").type_name(), "string");
        assert_eq!(Value::Table(Rc::new(Table::new())).type_name(), "table");
    }

    #[test]
    fn value_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Integer(-1).is_truthy());
        assert!(Value::from("").is_truthy());
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert_eq!(Value::Integer(2), Value::Float(2.0));
        assert_ne!(Value::Integer(2), Value::from("2"));
    }

    #[test]
    fn tables_compare_by_identity() {
        let a = Rc::new(Table::new());
        let b = Rc::new(Table::new());
        assert_eq!(Value::Table(a.clone()), Value::Table(a));
        assert_ne!(Value::Table(b), Value::Table(Rc::new(Table::new())));
    }

    #[test]
    fn key_from_value() {
        assert_eq!(Key::from_value(&Value::Integer(3)), Some(Key::Integer(3)));
        assert_eq!(Key::from_value(&Value::from("a")), Some(Key::from("a")));
        assert_eq!(Key::from_value(&Value::Float(1.0)), None);
        assert_eq!(Key::from_value(&Value::Null), None);
    }

    #[test]
    fn display_primitives() {
        assert_eq!(Value::Integer(15).to_string(), "15");
        assert_eq!(Value::Float(1.5).to_string(), "1.5");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
