//! Base, math and string libraries.
//!
//! The base library is always present in the root table. The math and
//! string libraries are registered on demand into the table at the top of
//! the stack.

use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::object::{NativeClosure, NativeFunction, Table, TableRef};
use crate::value::{Key, Value};
use crate::vm::Vm;

fn register(table: &Table, name: &str, function: NativeFunction) {
    let closure = NativeClosure::new(function, Vec::new());
    closure.set_name(name);
    table.insert(Key::from(name), Value::NativeClosure(Rc::new(closure)));
}

fn target_table(vm: &Vm) -> VmResult<TableRef> {
    match vm.get_stack_object(-1)? {
        Value::Table(table) => Ok(table),
        other => Err(VmError::new(format!(
            "cannot register a library into '{}'",
            other.type_name()
        ))),
    }
}

/// Fail unless exactly `count` arguments follow `this`.
fn expect_args(vm: &Vm, count: usize) -> VmResult<()> {
    if vm.top() != count + 1 {
        return Err(VmError::new("wrong number of parameters"));
    }
    Ok(())
}

// =========================================
// Base library
// =========================================

pub(crate) fn register_baselib(root: &Table) {
    register(root, "print", base_print);
    register(root, "error", base_error);
    register(root, "type", base_type);
}

fn base_print(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let text = vm.get_stack_object(2)?.to_string();
    vm.print(&text);
    Ok(0)
}

fn base_error(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let text = vm.get_stack_object(2)?.to_string();
    vm.print_error(&text);
    Ok(0)
}

fn base_type(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let name = vm.get_stack_object(2)?.type_name();
    vm.push_string(name);
    Ok(1)
}

// =========================================
// Math library
// =========================================

/// Register `abs`, `fabs`, `sqrt`, `floor`, `ceil`, `pow`, `min`, `max` and
/// `PI` into the table at the top of the stack.
pub fn register_mathlib(vm: &mut Vm) -> VmResult<()> {
    let table = target_table(vm)?;
    register(&table, "abs", math_abs);
    register(&table, "fabs", math_fabs);
    register(&table, "sqrt", math_sqrt);
    register(&table, "floor", math_floor);
    register(&table, "ceil", math_ceil);
    register(&table, "pow", math_pow);
    register(&table, "min", math_min);
    register(&table, "max", math_max);
    table.insert(Key::from("PI"), Value::Float(std::f64::consts::PI));
    Ok(())
}

fn math_abs(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let value = vm.get_integer(2)?;
    vm.push_integer(value.wrapping_abs());
    Ok(1)
}

fn float_fn(vm: &mut Vm, f: fn(f64) -> f64) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let value = vm.get_float(2)?;
    vm.push_float(f(value));
    Ok(1)
}

fn math_fabs(vm: &mut Vm) -> VmResult<u32> {
    float_fn(vm, f64::abs)
}

fn math_sqrt(vm: &mut Vm) -> VmResult<u32> {
    float_fn(vm, f64::sqrt)
}

fn math_floor(vm: &mut Vm) -> VmResult<u32> {
    float_fn(vm, f64::floor)
}

fn math_ceil(vm: &mut Vm) -> VmResult<u32> {
    float_fn(vm, f64::ceil)
}

fn math_pow(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 2)?;
    let base = vm.get_float(2)?;
    let exponent = vm.get_float(3)?;
    vm.push_float(base.powf(exponent));
    Ok(1)
}

/// Integers stay integers when both operands are integers.
fn min_max(vm: &mut Vm, pick_greater: bool) -> VmResult<u32> {
    expect_args(vm, 2)?;
    let a = vm.get_stack_object(2)?;
    let b = vm.get_stack_object(3)?;
    let result = match (&a, &b) {
        (Value::Integer(x), Value::Integer(y)) => {
            Value::Integer(if pick_greater { *x.max(y) } else { *x.min(y) })
        }
        _ => {
            let x = vm.get_float(2)?;
            let y = vm.get_float(3)?;
            Value::Float(if pick_greater { x.max(y) } else { x.min(y) })
        }
    };
    vm.push_value(result);
    Ok(1)
}

fn math_min(vm: &mut Vm) -> VmResult<u32> {
    min_max(vm, false)
}

fn math_max(vm: &mut Vm) -> VmResult<u32> {
    min_max(vm, true)
}

// =========================================
// String library
// =========================================

/// Register `strlen`, `upper`, `lower` and `tostring` into the table at the
/// top of the stack.
pub fn register_stringlib(vm: &mut Vm) -> VmResult<()> {
    let table = target_table(vm)?;
    register(&table, "strlen", string_len);
    register(&table, "upper", string_upper);
    register(&table, "lower", string_lower);
    register(&table, "tostring", string_tostring);
    Ok(())
}

fn string_len(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let text = vm.get_string(2)?;
    vm.push_integer(text.len() as i64);
    Ok(1)
}

fn string_upper(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let text = vm.get_string(2)?;
    vm.push_string(&text.to_uppercase());
    Ok(1)
}

fn string_lower(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let text = vm.get_string(2)?;
    vm.push_string(&text.to_lowercase());
    Ok(1)
}

fn string_tostring(vm: &mut Vm) -> VmResult<u32> {
    expect_args(vm, 1)?;
    let text = vm.get_stack_object(2)?.to_string();
    vm.push_string(&text);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static OUTPUT: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    fn capture(_: &mut Vm, text: &str) {
        OUTPUT.with(|o| o.borrow_mut().push(text.to_string()));
    }

    fn run_with_libs(source: &str) -> Vec<String> {
        OUTPUT.with(|o| o.borrow_mut().clear());
        let mut vm = Vm::open(256);
        vm.set_print_func(Some(capture), Some(capture));
        vm.push_root_table();
        register_mathlib(&mut vm).unwrap();
        register_stringlib(&mut vm).unwrap();
        vm.pop(1);
        vm.compile_buffer(source, "libs", false).unwrap();
        vm.push_root_table();
        vm.call(1, false, false).unwrap();
        OUTPUT.with(|o| std::mem::take(&mut *o.borrow_mut()))
    }

    #[test]
    fn math_functions() {
        assert_eq!(
            run_with_libs("print(abs(-3))\nprint(sqrt(16))\nprint(floor(2.7))\nprint(pow(2, 10))\nprint(min(3, 1))\nprint(max(1.5, 2))"),
            vec!["3", "4", "2", "1024", "1", "2"]
        );
    }

    #[test]
    fn string_functions() {
        assert_eq!(
            run_with_libs("print(strlen(\"abc\"))\nprint(upper(\"abc\"))\nprint(lower(\"ABC\"))\nprint(tostring(12) + \"!\")"),
            vec!["3", "ABC", "abc", "12!"]
        );
    }

    #[test]
    fn base_library_is_always_present() {
        OUTPUT.with(|o| o.borrow_mut().clear());
        let mut vm = Vm::open(64);
        vm.set_print_func(Some(capture), Some(capture));
        vm.compile_buffer("print(type({}))\nerror(\"bad\")", "base", false)
            .unwrap();
        vm.push_root_table();
        vm.call(1, false, false).unwrap();
        assert_eq!(
            OUTPUT.with(|o| o.borrow().clone()),
            vec!["table".to_string(), "bad".to_string()]
        );
    }

    #[test]
    fn registering_into_non_table_fails() {
        let mut vm = Vm::open(64);
        vm.push_integer(1);
        assert!(register_mathlib(&mut vm).is_err());
    }
}
