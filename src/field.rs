//! Field accessors routed through class meta-methods.
//!
//! VM classes cannot declare a field with a native hook. Instead each class
//! that exposes fields gets two dispatch tables, `set` and `get`, keyed by
//! field name, and two meta-methods closing over them: `_set(key, value)`
//! and `_get(key)`. The VM calls the meta-methods for any member an
//! instance's class does not define, and they forward to the accessor
//! registered under `key`.

use std::rc::Rc;

use sqrew_vm::{ClassRef, Key, NativeFunction, TableRef, Value, Vm, VmError, VmResult};

use crate::stack::StackGuard;

/// The per-class `set`/`get` dispatch tables.
#[derive(Clone)]
pub(crate) struct FieldTables {
    pub(crate) set: TableRef,
    pub(crate) get: TableRef,
}

impl FieldTables {
    /// Create both tables and install `_set`/`_get` on `class`.
    pub(crate) fn install(vm: &mut Vm, class: &ClassRef) -> VmResult<Self> {
        let mut vm = StackGuard::new(vm);
        vm.push_value(Value::Class(Rc::clone(class)));
        let set = install_meta_method(&mut vm, "_set", dispatch_field_set)?;
        let get = install_meta_method(&mut vm, "_get", dispatch_field_get)?;
        Ok(Self { set, get })
    }
}

/// Bind `function` under `name` on the class at -1, with a fresh dispatch
/// table as its free variable.
fn install_meta_method(vm: &mut Vm, name: &str, function: NativeFunction) -> VmResult<TableRef> {
    let table = vm.create_table();
    vm.push_string(name);
    vm.push_value(Value::Table(Rc::clone(&table)));
    vm.new_closure(function, 1)?;
    vm.set_native_closure_name(-1, name)?;
    vm.new_slot(-3)?;
    Ok(table)
}

/// The accessor for the key at slot 2, from the dispatch table at -1.
fn lookup_accessor(vm: &Vm) -> VmResult<Value> {
    let table = match vm.get_stack_object(-1)? {
        Value::Table(table) => table,
        _ => return Err(VmError::new("invalid field table")),
    };
    let key = vm.get_stack_object(2)?;
    Key::from_value(&key)
        .and_then(|key| table.get(&key))
        .ok_or_else(|| VmError::new(format!("field '{}' does not exist", key)))
}

/// `_set(key, value)`
fn dispatch_field_set(vm: &mut Vm) -> VmResult<u32> {
    if vm.top() != 4 {
        return Err(VmError::new("wrong number of parameters"));
    }
    let setter = lookup_accessor(vm)?;
    let this = vm.get_stack_object(1)?;
    let value = vm.get_stack_object(3)?;
    vm.call_value(&setter, this, vec![value])?;
    Ok(0)
}

/// `_get(key)`
fn dispatch_field_get(vm: &mut Vm) -> VmResult<u32> {
    if vm.top() != 3 {
        return Err(VmError::new("wrong number of parameters"));
    }
    let getter = lookup_accessor(vm)?;
    let this = vm.get_stack_object(1)?;
    let value = vm.call_value(&getter, this, Vec::new())?;
    vm.push_value(value);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static CALLS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    fn record_set(vm: &mut Vm) -> VmResult<u32> {
        let value = vm.get_integer(2)?;
        CALLS.with(|c| c.borrow_mut().push(format!("set {}", value)));
        Ok(0)
    }

    fn record_get(vm: &mut Vm) -> VmResult<u32> {
        CALLS.with(|c| c.borrow_mut().push("get".to_string()));
        vm.push_integer(42);
        Ok(1)
    }

    fn class_with_field(vm: &mut Vm) -> Value {
        let class: ClassRef = vm.create_class();
        let tables = FieldTables::install(vm, &class).unwrap();
        for (table, function) in [
            (&tables.set, record_set as NativeFunction),
            (&tables.get, record_get as NativeFunction),
        ] {
            vm.push_value(Value::Table(Rc::clone(table)));
            vm.push_string("level");
            vm.new_closure(function, 0).unwrap();
            vm.new_slot(-3).unwrap();
            vm.pop(1);
        }
        Value::Class(class)
    }

    fn run(vm: &mut Vm, source: &str) -> VmResult<()> {
        vm.compile_buffer(source, "fields", false).unwrap();
        vm.push_root_table();
        let result = vm.call(1, false, false);
        vm.pop(1);
        result
    }

    #[test]
    fn install_adds_meta_methods() {
        let mut vm = Vm::open(64);
        let class: ClassRef = vm.create_class();
        FieldTables::install(&mut vm, &class).unwrap();
        assert!(class.has_member(&Key::from("_set")));
        assert!(class.has_member(&Key::from("_get")));
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn accesses_route_to_accessors_once() {
        CALLS.with(|c| c.borrow_mut().clear());
        let mut vm = Vm::open(64);
        let class = class_with_field(&mut vm);
        vm.root_table().insert(Key::from("Thing"), class);
        run(&mut vm, "local t = Thing()\nt.level = 7\n::seen <- t.level").unwrap();
        assert_eq!(
            CALLS.with(|c| c.borrow().clone()),
            vec!["set 7".to_string(), "get".to_string()]
        );
        assert_eq!(
            vm.root_table().get(&Key::from("seen")),
            Some(Value::Integer(42))
        );
    }

    #[test]
    fn unknown_field_is_an_error() {
        let mut vm = Vm::open(64);
        let class = class_with_field(&mut vm);
        vm.root_table().insert(Key::from("Thing"), class);
        let err = run(&mut vm, "Thing().speed = 1").unwrap_err();
        assert_eq!(err.message(), "field 'speed' does not exist");
        let err = run(&mut vm, "local s = Thing().speed").unwrap_err();
        assert_eq!(err.message(), "field 'speed' does not exist");
    }
}
