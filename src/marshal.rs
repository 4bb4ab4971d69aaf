//! Value marshalling between native values and VM stack slots.
//!
//! [`GetValue`] reads a native value out of a stack slot and [`PutValue`]
//! pushes one. Each supported primitive has its own implementation and
//! there is no generic fallback: using an unsupported type in a method
//! signature is a compile error.
//!
//! [`Arguments`] and [`ReturnValue`] lift these to whole call signatures and
//! are what the method and constructor trampolines are written against.

use std::fmt::Display;
use std::rc::Rc;

use sqrew_vm::{StackIndex, UserDataRef, Value, Vm, VmError, VmResult};
use thiserror::Error;

/// Errors that can occur when converting a VM value to a native value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The VM integer does not fit the native integer type.
    #[error("value {value} does not fit in {target_type}")]
    IntegerOverflow {
        value: i64,
        target_type: &'static str,
    },

    /// A finite VM float outside the range of `f32`.
    #[error("value {value} does not fit in f32")]
    FloatOverflow { value: f64 },

    #[error("stack index {0} is out of range")]
    BadIndex(StackIndex),
}

impl From<ConversionError> for VmError {
    fn from(error: ConversionError) -> Self {
        VmError::new(format!("Invalid argument type: {}", error))
    }
}

/// Read a native value from a VM stack slot.
pub trait GetValue: Sized {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError>;
}

/// Push a native value onto the VM stack.
pub trait PutValue {
    fn put_value(self, vm: &mut Vm);
}

fn slot(vm: &Vm, idx: StackIndex) -> Result<Value, ConversionError> {
    vm.get_stack_object(idx)
        .map_err(|_| ConversionError::BadIndex(idx))
}

fn mismatch<T>(expected: &'static str, actual: &Value) -> Result<T, ConversionError> {
    Err(ConversionError::TypeMismatch {
        expected,
        actual: actual.type_name(),
    })
}

// =========================================
// Integers
// =========================================

impl GetValue for i64 {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        match slot(vm, idx)? {
            Value::Integer(i) => Ok(i),
            other => mismatch("integer", &other),
        }
    }
}

impl PutValue for i64 {
    fn put_value(self, vm: &mut Vm) {
        vm.push_integer(self);
    }
}

macro_rules! impl_narrow_integer {
    ($($t:ty),* $(,)?) => {
        $(
            impl GetValue for $t {
                fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
                    let value = i64::get_value(vm, idx)?;
                    <$t>::try_from(value).map_err(|_| ConversionError::IntegerOverflow {
                        value,
                        target_type: stringify!($t),
                    })
                }
            }

            impl PutValue for $t {
                fn put_value(self, vm: &mut Vm) {
                    vm.push_integer(i64::from(self));
                }
            }
        )*
    };
}

impl_narrow_integer!(i8, i16, i32, u8, u16, u32);

// =========================================
// Floats
// =========================================

/// Integers are accepted where a float is expected.
impl GetValue for f64 {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        match slot(vm, idx)? {
            Value::Float(f) => Ok(f),
            Value::Integer(i) => Ok(i as f64),
            other => mismatch("float", &other),
        }
    }
}

impl PutValue for f64 {
    fn put_value(self, vm: &mut Vm) {
        vm.push_float(self);
    }
}

/// Infinities and NaN pass through; finite values must fit.
impl GetValue for f32 {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        let value = f64::get_value(vm, idx)?;
        let narrowed = value as f32;
        if value.is_finite() && narrowed.is_infinite() {
            return Err(ConversionError::FloatOverflow { value });
        }
        Ok(narrowed)
    }
}

impl PutValue for f32 {
    fn put_value(self, vm: &mut Vm) {
        vm.push_float(f64::from(self));
    }
}

// =========================================
// Bool, strings, user data and raw values
// =========================================

impl GetValue for bool {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        match slot(vm, idx)? {
            Value::Bool(b) => Ok(b),
            other => mismatch("bool", &other),
        }
    }
}

impl PutValue for bool {
    fn put_value(self, vm: &mut Vm) {
        vm.push_bool(self);
    }
}

impl GetValue for Rc<str> {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        match slot(vm, idx)? {
            Value::String(s) => Ok(s),
            other => mismatch("string", &other),
        }
    }
}

impl PutValue for Rc<str> {
    fn put_value(self, vm: &mut Vm) {
        vm.push_value(Value::String(self));
    }
}

impl GetValue for String {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        Ok(Rc::<str>::get_value(vm, idx)?.to_string())
    }
}

impl PutValue for String {
    fn put_value(self, vm: &mut Vm) {
        vm.push_string(&self);
    }
}

impl PutValue for &str {
    fn put_value(self, vm: &mut Vm) {
        vm.push_string(self);
    }
}

impl GetValue for UserDataRef {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        match slot(vm, idx)? {
            Value::UserData(data) => Ok(data),
            other => mismatch("userdata", &other),
        }
    }
}

impl PutValue for UserDataRef {
    fn put_value(self, vm: &mut Vm) {
        vm.push_value(Value::UserData(self));
    }
}

/// Any value, unconverted.
impl GetValue for Value {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        slot(vm, idx)
    }
}

impl PutValue for Value {
    fn put_value(self, vm: &mut Vm) {
        vm.push_value(self);
    }
}

/// `null` maps to `None`.
impl<T: GetValue> GetValue for Option<T> {
    fn get_value(vm: &Vm, idx: StackIndex) -> Result<Self, ConversionError> {
        if slot(vm, idx)?.is_null() {
            return Ok(None);
        }
        T::get_value(vm, idx).map(Some)
    }
}

impl<T: PutValue> PutValue for Option<T> {
    fn put_value(self, vm: &mut Vm) {
        match self {
            Some(value) => value.put_value(vm),
            None => vm.push_null(),
        }
    }
}

// =========================================
// Call signatures
// =========================================

/// A tuple of parameters pulled from consecutive stack slots.
pub trait Arguments: Sized {
    const COUNT: usize;

    /// Read every parameter, the first one from slot `first`.
    fn pull(vm: &Vm, first: StackIndex) -> Result<Self, ConversionError>;
}

impl Arguments for () {
    const COUNT: usize = 0;

    fn pull(_vm: &Vm, _first: StackIndex) -> Result<Self, ConversionError> {
        Ok(())
    }
}

macro_rules! impl_arguments {
    ($count:expr; $($name:ident => $offset:expr),+) => {
        impl<$($name: GetValue),+> Arguments for ($($name,)+) {
            const COUNT: usize = $count;

            fn pull(vm: &Vm, first: StackIndex) -> Result<Self, ConversionError> {
                Ok(($($name::get_value(vm, first + $offset)?,)+))
            }
        }
    };
}

impl_arguments!(1; A => 0);
impl_arguments!(2; A => 0, B => 1);
impl_arguments!(3; A => 0, B => 1, C => 2);
impl_arguments!(4; A => 0, B => 1, C => 2, D => 3);
impl_arguments!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_arguments!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

/// A native return value, pushed back to the VM.
pub trait ReturnValue {
    /// Push the value and report how many results the VM should see.
    fn push_return(self, vm: &mut Vm) -> VmResult<u32>;
}

impl ReturnValue for () {
    fn push_return(self, _vm: &mut Vm) -> VmResult<u32> {
        Ok(0)
    }
}

macro_rules! impl_return_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl ReturnValue for $t {
                fn push_return(self, vm: &mut Vm) -> VmResult<u32> {
                    self.put_value(vm);
                    Ok(1)
                }
            }
        )*
    };
}

impl_return_value!(
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    bool,
    String,
    Rc<str>,
    &'static str,
    UserDataRef,
    Value,
);

impl<T: PutValue> ReturnValue for Option<T> {
    fn push_return(self, vm: &mut Vm) -> VmResult<u32> {
        self.put_value(vm);
        Ok(1)
    }
}

/// An `Err` becomes a script error carrying its message.
impl<T: ReturnValue, E: Display> ReturnValue for Result<T, E> {
    fn push_return(self, vm: &mut Vm) -> VmResult<u32> {
        match self {
            Ok(value) => value.push_return(vm),
            Err(error) => Err(vm.throw_error(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip<T: GetValue + PutValue + Clone>(value: T) -> T {
        let mut vm = Vm::open(16);
        value.put_value(&mut vm);
        T::get_value(&vm, -1).unwrap()
    }

    #[test]
    fn integer_rejects_float() {
        let mut vm = Vm::open(16);
        vm.push_float(1.5);
        assert_eq!(
            i64::get_value(&vm, -1),
            Err(ConversionError::TypeMismatch {
                expected: "integer",
                actual: "float"
            })
        );
    }

    #[test]
    fn f32_rejects_out_of_range() {
        let mut vm = Vm::open(16);
        vm.push_float(1e300);
        assert_eq!(
            f32::get_value(&vm, -1),
            Err(ConversionError::FloatOverflow { value: 1e300 })
        );
        vm.push_float(-1e39);
        assert!(f32::get_value(&vm, -1).is_err());
        vm.push_float(f64::from(f32::MAX));
        assert_eq!(f32::get_value(&vm, -1), Ok(f32::MAX));
        vm.push_float(f64::INFINITY);
        assert_eq!(f32::get_value(&vm, -1), Ok(f32::INFINITY));
    }

    #[test]
    fn float_accepts_integer() {
        let mut vm = Vm::open(16);
        vm.push_integer(3);
        assert_eq!(f64::get_value(&vm, -1), Ok(3.0));
    }

    #[test]
    fn narrow_integer_overflow() {
        let mut vm = Vm::open(16);
        vm.push_integer(300);
        assert_eq!(
            u8::get_value(&vm, -1),
            Err(ConversionError::IntegerOverflow {
                value: 300,
                target_type: "u8"
            })
        );
        assert_eq!(i16::get_value(&vm, -1), Ok(300));
    }

    #[test]
    fn option_maps_null() {
        let mut vm = Vm::open(16);
        vm.push_null();
        vm.push_integer(4);
        assert_eq!(Option::<i64>::get_value(&vm, 1), Ok(None));
        assert_eq!(Option::<i64>::get_value(&vm, 2), Ok(Some(4)));
    }

    #[test]
    fn bad_index() {
        let vm = Vm::open(16);
        assert_eq!(bool::get_value(&vm, 3), Err(ConversionError::BadIndex(3)));
    }

    #[test]
    fn conversion_error_becomes_script_error() {
        let error: VmError = ConversionError::TypeMismatch {
            expected: "string",
            actual: "null",
        }
        .into();
        assert_eq!(
            error.message(),
            "Invalid argument type: expected string, got null"
        );
    }

    #[test]
    fn pull_reads_consecutive_slots() {
        let mut vm = Vm::open(16);
        vm.push_null();
        vm.push_integer(7);
        vm.push_string("seven");
        vm.push_bool(true);
        let (a, b, c) = <(i32, String, bool)>::pull(&vm, 2).unwrap();
        assert_eq!((a, b.as_str(), c), (7, "seven", true));
        assert_eq!(<(i32, String, bool)>::COUNT, 3);
    }

    #[test]
    fn pull_stops_at_first_mismatch() {
        let mut vm = Vm::open(16);
        vm.push_null();
        vm.push_string("x");
        assert!(<(i64,)>::pull(&vm, 2).is_err());
    }

    #[test]
    fn return_value_counts() {
        let mut vm = Vm::open(16);
        assert_eq!(().push_return(&mut vm).unwrap(), 0);
        assert_eq!(5i32.push_return(&mut vm).unwrap(), 1);
        assert_eq!(vm.get_integer(-1).unwrap(), 5);
        let failed: Result<i32, String> = Err("nope".to_string());
        assert_eq!(failed.push_return(&mut vm).unwrap_err().message(), "nope");
    }

    proptest! {
        #[test]
        fn integers_round_trip(v in any::<i64>()) {
            prop_assert_eq!(round_trip(v), v);
        }

        #[test]
        fn narrow_integers_round_trip(a in any::<i32>(), b in any::<u16>(), c in any::<i8>()) {
            prop_assert_eq!(round_trip(a), a);
            prop_assert_eq!(round_trip(b), b);
            prop_assert_eq!(round_trip(c), c);
        }

        #[test]
        fn floats_round_trip(v in any::<f64>().prop_filter("NaN never compares equal", |f| !f.is_nan())) {
            prop_assert_eq!(round_trip(v), v);
        }

        #[test]
        fn f32_round_trip(v in any::<f32>().prop_filter("NaN never compares equal", |f| !f.is_nan())) {
            prop_assert_eq!(round_trip(v), v);
        }

        #[test]
        fn strings_round_trip(s in ".*") {
            prop_assert_eq!(round_trip(s.clone()), s);
        }

        #[test]
        fn bools_round_trip(b in any::<bool>()) {
            prop_assert_eq!(round_trip(b), b);
        }
    }
}
