//! The virtual machine and its stack API.
//!
//! Stack indices follow the usual embedding convention: positive indices
//! count from the bottom of the current frame (1 is the first slot),
//! negative indices count from the top (-1 is the topmost value). Index 0 is
//! never valid.

use std::any::Any;
use std::rc::Rc;

use log::{trace, warn};

use crate::error::{CompileError, TraceFrame, VmError, VmResult};
use crate::object::{
    Class, ClassRef, Closure, Heap, Instance, InstanceRef, NativeClosure, NativeClosureRef,
    NativeFunction, ReleaseHook, Table, TableRef, UserData, UserDataRef,
};
use crate::parser;
use crate::stdlib;
use crate::value::{Key, ObjectType, TypeTag, Value};

/// A position on the VM stack. See the module docs.
pub type StackIndex = isize;

/// Host hook receiving text printed by scripts.
pub type PrintFunction = fn(&mut Vm, &str);

/// Host hook receiving compile errors for buffers compiled with
/// `raise_error` set.
pub type CompilerErrorHandler = fn(&mut Vm, &CompileError);

const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Native stack, in bytes, that nested script calls may use. Fits within the
/// 2 MiB stack of spawned threads.
pub const DEFAULT_NATIVE_STACK_LIMIT: usize = 1024 * 1024;

/// An embedded virtual machine.
pub struct Vm {
    stack: Vec<Value>,
    /// Vector index of slot 1 of the current frame.
    base: usize,
    stack_size: usize,
    call_depth: usize,
    max_call_depth: usize,
    native_stack_limit: usize,
    /// Native stack position of the outermost running call.
    stack_origin: usize,
    root: TableRef,
    registry: TableRef,
    consts: TableRef,
    heap: Heap,
    print_fn: Option<PrintFunction>,
    error_fn: Option<PrintFunction>,
    compiler_error_handler: Option<CompilerErrorHandler>,
    error_handler: Option<Value>,
    last_error: Option<VmError>,
    in_error_handler: bool,
}

impl Vm {
    /// Create a VM whose value stack holds at most `stack_size` slots.
    ///
    /// The base library (`print`, `error`, `type`) is registered in the root
    /// table.
    pub fn open(stack_size: usize) -> Self {
        let vm = Self {
            stack: Vec::with_capacity(stack_size),
            base: 0,
            stack_size,
            call_depth: 0,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            native_stack_limit: DEFAULT_NATIVE_STACK_LIMIT,
            stack_origin: 0,
            root: Rc::new(Table::new()),
            registry: Rc::new(Table::new()),
            consts: Rc::new(Table::new()),
            heap: Heap::default(),
            print_fn: None,
            error_fn: None,
            compiler_error_handler: None,
            error_handler: None,
            last_error: None,
            in_error_handler: false,
        };
        stdlib::register_baselib(&vm.root);
        trace!("opened vm with stack size {}", stack_size);
        vm
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    pub fn native_stack_limit(&self) -> usize {
        self.native_stack_limit
    }

    /// Bound the native stack used by nested calls. A call that would start
    /// beyond `bytes` from the outermost call fails with "stack overflow".
    pub fn set_native_stack_limit(&mut self, bytes: usize) {
        self.native_stack_limit = bytes;
    }

    pub fn root_table(&self) -> &TableRef {
        &self.root
    }

    pub fn registry_table(&self) -> &TableRef {
        &self.registry
    }

    pub fn const_table(&self) -> &TableRef {
        &self.consts
    }

    // =========================================
    // Stack access
    // =========================================

    fn resolve(&self, idx: StackIndex) -> VmResult<usize> {
        let len = self.stack.len();
        let slot = if idx > 0 {
            Some(self.base + idx as usize - 1)
        } else if idx < 0 {
            len.checked_sub(idx.unsigned_abs())
        } else {
            None
        };
        match slot {
            Some(slot) if slot >= self.base && slot < len => Ok(slot),
            _ => Err(VmError::new(format!("invalid stack index {}", idx))),
        }
    }

    fn value_at(&self, idx: StackIndex) -> VmResult<&Value> {
        let slot = self.resolve(idx)?;
        Ok(&self.stack[slot])
    }

    fn pop_value(&mut self) -> VmResult<Value> {
        if self.stack.len() <= self.base {
            return Err(VmError::new("stack underflow"));
        }
        Ok(self.stack.pop().unwrap_or_default())
    }

    /// Number of values in the current frame.
    pub fn top(&self) -> usize {
        self.stack.len() - self.base
    }

    /// Shrink the frame to `top` values, or grow it with nulls.
    pub fn set_top(&mut self, top: usize) {
        let target = self.base + top;
        if target <= self.stack.len() {
            self.stack.truncate(target);
        } else {
            self.stack.resize(target, Value::Null);
        }
    }

    /// Pop `count` values. Never pops below the current frame.
    pub fn pop(&mut self, count: usize) {
        let len = self.stack.len().saturating_sub(count).max(self.base);
        self.stack.truncate(len);
    }

    /// Copy of the value at `idx`.
    pub fn get_stack_object(&self, idx: StackIndex) -> VmResult<Value> {
        self.value_at(idx).cloned()
    }

    pub fn object_type(&self, idx: StackIndex) -> VmResult<ObjectType> {
        Ok(self.value_at(idx)?.object_type())
    }

    pub fn push_value(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Push a copy of the value at `idx`.
    pub fn push(&mut self, idx: StackIndex) -> VmResult<()> {
        let value = self.get_stack_object(idx)?;
        self.stack.push(value);
        Ok(())
    }

    pub fn push_null(&mut self) {
        self.stack.push(Value::Null);
    }

    pub fn push_integer(&mut self, value: i64) {
        self.stack.push(Value::Integer(value));
    }

    pub fn push_float(&mut self, value: f64) {
        self.stack.push(Value::Float(value));
    }

    pub fn push_bool(&mut self, value: bool) {
        self.stack.push(Value::Bool(value));
    }

    pub fn push_string(&mut self, value: &str) {
        self.stack.push(Value::from(value));
    }

    pub fn push_root_table(&mut self) {
        self.stack.push(Value::Table(self.root.clone()));
    }

    pub fn push_registry_table(&mut self) {
        self.stack.push(Value::Table(self.registry.clone()));
    }

    pub fn push_const_table(&mut self) {
        self.stack.push(Value::Table(self.consts.clone()));
    }

    // =========================================
    // Object creation
    // =========================================

    /// Allocate an empty table owned by this VM.
    ///
    /// Tables reachable only through reference cycles are emptied when the
    /// VM closes, so containers must be allocated here rather than with
    /// [`Table::new`].
    pub fn create_table(&mut self) -> TableRef {
        let table = Rc::new(Table::new());
        self.heap.track_table(&table);
        table
    }

    /// Allocate an empty class owned by this VM. See [`Vm::create_table`].
    pub fn create_class(&mut self) -> ClassRef {
        let class = Rc::new(Class::new());
        self.heap.track_class(&class);
        class
    }

    fn create_instance_of(&mut self, class: ClassRef) -> InstanceRef {
        let instance = Rc::new(Instance::new(class));
        self.heap.track_instance(&instance);
        instance
    }

    /// Number of tables, classes and instances allocated by this VM that
    /// are still alive.
    pub fn live_objects(&self) -> usize {
        self.heap.live_count()
    }

    pub fn new_table(&mut self) {
        let table = self.create_table();
        self.stack.push(Value::Table(table));
    }

    pub fn new_class(&mut self) {
        let class = self.create_class();
        self.stack.push(Value::Class(class));
    }

    /// Push a user-data object owning `data`.
    pub fn new_userdata(&mut self, data: Box<dyn Any>) {
        self.stack.push(Value::UserData(Rc::new(UserData::new(data))));
    }

    /// Push a bare instance of the class at `idx` without running its
    /// constructor.
    pub fn create_instance(&mut self, idx: StackIndex) -> VmResult<()> {
        let class = self.class_at(idx)?;
        let instance = self.create_instance_of(class);
        self.stack.push(Value::Instance(instance));
        Ok(())
    }

    /// Pop `free_vars` values and push a native closure binding them.
    ///
    /// The free variables are pushed after the call arguments whenever the
    /// closure runs, in the order they were on the stack.
    pub fn new_closure(&mut self, function: NativeFunction, free_vars: usize) -> VmResult<()> {
        if free_vars > self.top() {
            return Err(VmError::new("not enough values for free variables"));
        }
        let bound = self.stack.split_off(self.stack.len() - free_vars);
        let closure = NativeClosure::new(function, bound);
        self.stack.push(Value::NativeClosure(Rc::new(closure)));
        Ok(())
    }

    pub fn set_native_closure_name(&mut self, idx: StackIndex, name: &str) -> VmResult<()> {
        match self.value_at(idx)? {
            Value::NativeClosure(closure) => {
                closure.set_name(name);
                Ok(())
            }
            other => Err(wrong_type("native function", other)),
        }
    }

    // =========================================
    // Slots
    // =========================================

    /// Pop a key and a value and create the slot in the table or class at
    /// `idx`.
    pub fn new_slot(&mut self, idx: StackIndex) -> VmResult<()> {
        let target = self.get_stack_object(idx)?;
        let (key, value) = self.pop_key_value()?;
        self.set_member(&target, key, value, true)
    }

    /// Pop a key and a value and assign an existing slot of the object at
    /// `idx`.
    pub fn set(&mut self, idx: StackIndex) -> VmResult<()> {
        let target = self.get_stack_object(idx)?;
        let (key, value) = self.pop_key_value()?;
        self.set_member(&target, key, value, false)
    }

    /// Pop a key and push the matching slot of the object at `idx`.
    pub fn get(&mut self, idx: StackIndex) -> VmResult<()> {
        let target = self.get_stack_object(idx)?;
        let key = self.pop_value()?;
        let value = self.get_member(&target, &key)?;
        self.stack.push(value);
        Ok(())
    }

    fn pop_key_value(&mut self) -> VmResult<(Value, Value)> {
        if self.top() < 2 {
            return Err(VmError::new("stack underflow"));
        }
        let value = self.pop_value()?;
        let key = self.pop_value()?;
        Ok((key, value))
    }

    /// Read `object[key]`, dispatching to `_get` on instances.
    pub(crate) fn get_member(&mut self, object: &Value, key: &Value) -> VmResult<Value> {
        match object {
            Value::Table(table) => {
                let key = key_of(key)?;
                table.get(&key).ok_or_else(|| missing_index(&key))
            }
            Value::Class(class) => {
                let key = key_of(key)?;
                class.member(&key).ok_or_else(|| missing_index(&key))
            }
            Value::Instance(instance) => {
                let slot = key_of(key)?;
                if let Some(member) = instance.class().member(&slot) {
                    return Ok(member);
                }
                match instance.class().member(&Key::from("_get")) {
                    Some(meta) => self.call_value(&meta, object.clone(), vec![key.clone()]),
                    None => Err(missing_index(&slot)),
                }
            }
            other => Err(VmError::new(format!(
                "trying to get a slot of '{}'",
                other.type_name()
            ))),
        }
    }

    /// Write `object[key]`, dispatching to `_set` on instances.
    ///
    /// With `new_slot` unset the slot must already exist.
    pub(crate) fn set_member(
        &mut self,
        object: &Value,
        key: Value,
        value: Value,
        new_slot: bool,
    ) -> VmResult<()> {
        match object {
            Value::Table(table) => {
                let key = key_of(&key)?;
                if new_slot {
                    table.insert(key, value);
                    Ok(())
                } else if table.set_existing(&key, value) {
                    Ok(())
                } else {
                    Err(missing_index(&key))
                }
            }
            Value::Class(class) => {
                let key = key_of(&key)?;
                if new_slot || class.has_member(&key) {
                    class.set_member(key, value);
                    Ok(())
                } else {
                    Err(missing_index(&key))
                }
            }
            Value::Instance(instance) => {
                let slot = key_of(&key)?;
                if new_slot {
                    return Err(VmError::new(
                        "class instances do not support the new slot operator",
                    ));
                }
                match instance.class().member(&Key::from("_set")) {
                    Some(meta) => self
                        .call_value(&meta, object.clone(), vec![key, value])
                        .map(|_| ()),
                    None => Err(missing_index(&slot)),
                }
            }
            other => Err(VmError::new(format!(
                "trying to set a slot of '{}'",
                other.type_name()
            ))),
        }
    }

    // =========================================
    // Typed getters
    // =========================================

    /// Integers, and floats truncated toward zero.
    pub fn get_integer(&self, idx: StackIndex) -> VmResult<i64> {
        match self.value_at(idx)? {
            Value::Integer(i) => Ok(*i),
            Value::Float(f) => Ok(*f as i64),
            other => Err(wrong_type("integer", other)),
        }
    }

    /// Floats, and integers widened.
    pub fn get_float(&self, idx: StackIndex) -> VmResult<f64> {
        match self.value_at(idx)? {
            Value::Float(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(wrong_type("float", other)),
        }
    }

    pub fn get_bool(&self, idx: StackIndex) -> VmResult<bool> {
        match self.value_at(idx)? {
            Value::Bool(b) => Ok(*b),
            other => Err(wrong_type("bool", other)),
        }
    }

    pub fn get_string(&self, idx: StackIndex) -> VmResult<Rc<str>> {
        match self.value_at(idx)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(wrong_type("string", other)),
        }
    }

    pub fn get_userdata(&self, idx: StackIndex) -> VmResult<UserDataRef> {
        match self.value_at(idx)? {
            Value::UserData(data) => Ok(data.clone()),
            other => Err(wrong_type("userdata", other)),
        }
    }

    fn class_at(&self, idx: StackIndex) -> VmResult<ClassRef> {
        match self.value_at(idx)? {
            Value::Class(class) => Ok(class.clone()),
            other => Err(wrong_type("class", other)),
        }
    }

    // =========================================
    // Type tags, release hooks and instance pointers
    // =========================================

    /// Tag the class or user data at `idx`.
    pub fn set_type_tag(&mut self, idx: StackIndex, tag: TypeTag) -> VmResult<()> {
        match self.value_at(idx)? {
            Value::Class(class) => class.set_type_tag(tag),
            Value::UserData(data) => data.set_type_tag(tag),
            other => return Err(wrong_type("class or userdata", other)),
        }
        Ok(())
    }

    /// Tag of the class, instance (its class's tag) or user data at `idx`.
    pub fn get_type_tag(&self, idx: StackIndex) -> VmResult<Option<TypeTag>> {
        match self.value_at(idx)? {
            Value::Class(class) => Ok(class.type_tag()),
            Value::Instance(instance) => Ok(instance.type_tag()),
            Value::UserData(data) => Ok(data.type_tag()),
            other => Err(wrong_type("class, instance or userdata", other)),
        }
    }

    /// Install the hook run when the instance or user data at `idx` dies.
    pub fn set_release_hook(&mut self, idx: StackIndex, hook: ReleaseHook) -> VmResult<()> {
        match self.value_at(idx)? {
            Value::Instance(instance) => instance.set_release_hook(hook),
            Value::UserData(data) => data.set_release_hook(hook),
            other => return Err(wrong_type("instance or userdata", other)),
        }
        Ok(())
    }

    /// Attach host data to the instance at `idx`.
    pub fn set_instance_up(&mut self, idx: StackIndex, pointer: Box<dyn Any>) -> VmResult<()> {
        match self.value_at(idx)? {
            Value::Instance(instance) => {
                instance.set_user_pointer(pointer);
                Ok(())
            }
            other => Err(wrong_type("instance", other)),
        }
    }

    /// The instance at `idx`, verified against `expected` when given.
    pub fn get_instance_up(
        &self,
        idx: StackIndex,
        expected: Option<TypeTag>,
    ) -> VmResult<InstanceRef> {
        match self.value_at(idx)? {
            Value::Instance(instance) => match expected {
                Some(tag) if instance.type_tag() != Some(tag) => {
                    Err(VmError::new("invalid type tag"))
                }
                _ => Ok(instance.clone()),
            },
            other => Err(wrong_type("instance", other)),
        }
    }

    // =========================================
    // Calls
    // =========================================

    /// Build an error to return from a native function.
    pub fn throw_error(&mut self, message: impl Into<String>) -> VmError {
        VmError::new(message)
    }

    /// Call the closure below `params` values (`this` plus arguments).
    ///
    /// The parameters are popped and the callee is left on the stack. With
    /// `retval` set the result is pushed. With `raise_error` set a failure is
    /// reported to the error handler before being returned.
    pub fn call(&mut self, params: usize, retval: bool, raise_error: bool) -> VmResult<()> {
        if params == 0 || params >= self.top() {
            return Err(VmError::new("invalid number of call parameters"));
        }
        let mut args = self.stack.split_off(self.stack.len() - params);
        let callee = self.stack.last().cloned().unwrap_or_default();
        let this = args.remove(0);
        match self.call_value(&callee, this, args) {
            Ok(result) => {
                if retval {
                    self.stack.push(result);
                }
                Ok(())
            }
            Err(error) => {
                self.last_error = Some(error.clone());
                if raise_error {
                    self.invoke_error_handler(&error);
                }
                Err(error)
            }
        }
    }

    /// Call any callable value with an explicit `this`.
    pub fn call_value(&mut self, callee: &Value, this: Value, args: Vec<Value>) -> VmResult<Value> {
        if self.call_depth >= self.max_call_depth {
            return Err(VmError::new("stack overflow"));
        }
        if self.call_depth == 0 {
            self.stack_origin = stack_position();
        } else if self.stack_origin.abs_diff(stack_position()) > self.native_stack_limit {
            return Err(VmError::new("stack overflow"));
        }
        self.call_depth += 1;
        let result = match callee {
            Value::NativeClosure(closure) => self.call_native(closure, this, args),
            Value::Closure(closure) => self.call_closure(closure, this, args),
            Value::Class(class) => self.instantiate(class, args),
            other => Err(VmError::new(format!(
                "attempt to call '{}'",
                other.type_name()
            ))),
        };
        self.call_depth -= 1;
        result
    }

    fn call_native(
        &mut self,
        closure: &NativeClosureRef,
        this: Value,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let needed = 1 + args.len() + closure.free_vars.len();
        if self.stack.len() + needed > self.stack_size {
            return Err(VmError::new("stack overflow"));
        }

        let saved_base = self.base;
        let frame_base = self.stack.len();
        self.stack.push(this);
        self.stack.extend(args);
        self.stack.extend(closure.free_vars.iter().cloned());
        self.base = frame_base;

        let result = match (closure.function)(self) {
            Ok(0) => Ok(Value::Null),
            Ok(_) if self.stack.len() > frame_base => {
                Ok(self.stack.last().cloned().unwrap_or_default())
            }
            Ok(_) => Ok(Value::Null),
            Err(mut error) => {
                error.push_frame(TraceFrame::native(closure.name().as_ref()));
                Err(error)
            }
        };

        self.stack.truncate(frame_base);
        self.base = saved_base;
        result
    }

    fn instantiate(&mut self, class: &ClassRef, args: Vec<Value>) -> VmResult<Value> {
        let instance = Value::Instance(self.create_instance_of(class.clone()));
        if let Some(constructor) = class.member(&Key::from("constructor")) {
            self.call_value(&constructor, instance.clone(), args)?;
        }
        Ok(instance)
    }

    // =========================================
    // Compilation
    // =========================================

    /// Compile `source` and push the resulting closure.
    ///
    /// With `raise_error` set a failure is also passed to the compiler error
    /// handler.
    pub fn compile_buffer(
        &mut self,
        source: &str,
        source_name: &str,
        raise_error: bool,
    ) -> Result<(), CompileError> {
        match parser::parse(source, source_name) {
            Ok(proto) => {
                self.stack.push(Value::Closure(Rc::new(Closure::new(proto))));
                Ok(())
            }
            Err(error) => {
                if raise_error {
                    if let Some(handler) = self.compiler_error_handler {
                        handler(self, &error);
                    }
                }
                Err(error)
            }
        }
    }

    // =========================================
    // Host hooks
    // =========================================

    pub fn set_print_func(&mut self, print: Option<PrintFunction>, error: Option<PrintFunction>) {
        self.print_fn = print;
        self.error_fn = error;
    }

    pub fn set_compiler_error_handler(&mut self, handler: Option<CompilerErrorHandler>) {
        self.compiler_error_handler = handler;
    }

    /// Pop a closure and install it as the runtime error handler.
    ///
    /// The handler is called with the root table as `this` and the thrown
    /// value as its argument; [`Vm::last_error`] holds the full error.
    pub fn set_error_handler(&mut self) -> VmResult<()> {
        let handler = self.pop_value()?;
        if !handler.is_callable() {
            return Err(wrong_type("closure", &handler));
        }
        self.error_handler = Some(handler);
        Ok(())
    }

    /// Send text to the print hook.
    pub fn print(&mut self, text: &str) {
        if let Some(print) = self.print_fn {
            print(self, text);
        }
    }

    /// Send text to the error print hook.
    pub fn print_error(&mut self, text: &str) {
        if let Some(print) = self.error_fn {
            print(self, text);
        }
    }

    /// The most recent error returned by [`Vm::call`].
    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    fn invoke_error_handler(&mut self, error: &VmError) {
        if self.in_error_handler {
            return;
        }
        let Some(handler) = self.error_handler.clone() else {
            return;
        };
        self.in_error_handler = true;
        let root = Value::Table(self.root.clone());
        if let Err(failure) = self.call_value(&handler, root, vec![error.value().clone()]) {
            warn!("error handler failed: {}", failure);
        }
        self.in_error_handler = false;
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.error_handler = None;
        self.stack.clear();
        self.consts.clear();
        self.registry.clear();
        self.root.clear();
        let remaining = self.heap.close();
        trace!("closed vm, emptied {} objects held by cycles or the host", remaining);
    }
}

/// Address of a frame on the current native stack.
#[inline(never)]
fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker as *const u8) as usize
}

pub(crate) fn key_of(value: &Value) -> VmResult<Key> {
    Key::from_value(value)
        .ok_or_else(|| VmError::new(format!("invalid key type '{}'", value.type_name())))
}

pub(crate) fn missing_index(key: &Key) -> VmError {
    VmError::new(format!("the index '{}' does not exist", key))
}

fn wrong_type(expected: &str, found: &Value) -> VmError {
    VmError::new(format!(
        "wrong argument type, expected '{}' got '{}'",
        expected,
        found.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    thread_local! {
        static OUTPUT: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
        static RELEASED: Cell<u32> = const { Cell::new(0) };
    }

    fn capture(_: &mut Vm, text: &str) {
        OUTPUT.with(|o| o.borrow_mut().push(text.to_string()));
    }

    fn take_output() -> Vec<String> {
        OUTPUT.with(|o| std::mem::take(&mut *o.borrow_mut()))
    }

    fn count_release(_: Box<dyn Any>) {
        RELEASED.with(|r| r.set(r.get() + 1));
    }

    fn add(vm: &mut Vm) -> VmResult<u32> {
        let a = vm.get_integer(2)?;
        let b = vm.get_integer(3)?;
        vm.push_integer(a + b);
        Ok(1)
    }

    fn free_var_echo(vm: &mut Vm) -> VmResult<u32> {
        vm.push(-1)?;
        Ok(1)
    }

    fn fail(vm: &mut Vm) -> VmResult<u32> {
        Err(vm.throw_error("native failure"))
    }

    fn register(vm: &mut Vm, name: &str, function: NativeFunction) {
        vm.push_root_table();
        vm.push_string(name);
        vm.new_closure(function, 0).unwrap();
        vm.set_native_closure_name(-1, name).unwrap();
        vm.new_slot(-3).unwrap();
        vm.pop(1);
    }

    #[test]
    fn stack_indices() {
        let mut vm = Vm::open(64);
        vm.push_integer(1);
        vm.push_integer(2);
        vm.push_integer(3);
        assert_eq!(vm.top(), 3);
        assert_eq!(vm.get_integer(1).unwrap(), 1);
        assert_eq!(vm.get_integer(-1).unwrap(), 3);
        assert!(vm.get_integer(0).is_err());
        assert!(vm.get_integer(4).is_err());
        assert!(vm.get_integer(-4).is_err());
        vm.pop(1);
        assert_eq!(vm.top(), 2);
        vm.set_top(4);
        assert_eq!(vm.object_type(-1).unwrap(), ObjectType::Null);
        vm.set_top(0);
        assert_eq!(vm.top(), 0);
        vm.pop(5);
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn typed_getters_convert_numbers() {
        let mut vm = Vm::open(64);
        vm.push_float(2.9);
        vm.push_integer(3);
        vm.push_string("s");
        assert_eq!(vm.get_integer(1).unwrap(), 2);
        assert_eq!(vm.get_float(2).unwrap(), 3.0);
        assert!(vm.get_integer(3).is_err());
        assert!(vm.get_bool(2).is_err());
        assert_eq!(&*vm.get_string(3).unwrap(), "s");
    }

    #[test]
    fn new_slot_and_get() {
        let mut vm = Vm::open(64);
        vm.new_table();
        vm.push_string("answer");
        vm.push_integer(42);
        vm.new_slot(-3).unwrap();
        assert_eq!(vm.top(), 1);
        vm.push_string("answer");
        vm.get(-2).unwrap();
        assert_eq!(vm.get_integer(-1).unwrap(), 42);
        vm.pop(1);
        vm.push_string("missing");
        let err = vm.get(-2).unwrap_err();
        assert_eq!(err.message(), "the index 'missing' does not exist");
        assert_eq!(vm.top(), 1);
    }

    #[test]
    fn set_requires_existing_slot() {
        let mut vm = Vm::open(64);
        vm.new_table();
        vm.push_string("x");
        vm.push_integer(1);
        assert!(vm.set(-3).is_err());
        vm.push_string("x");
        vm.push_integer(1);
        vm.new_slot(-3).unwrap();
        vm.push_string("x");
        vm.push_integer(2);
        vm.set(-3).unwrap();
        vm.push_string("x");
        vm.get(-2).unwrap();
        assert_eq!(vm.get_integer(-1).unwrap(), 2);
    }

    #[test]
    fn call_native_function() {
        let mut vm = Vm::open(64);
        register(&mut vm, "add", add);
        vm.push_root_table();
        vm.push_string("add");
        vm.get(-2).unwrap();
        vm.push_root_table();
        vm.push_integer(2);
        vm.push_integer(40);
        vm.call(3, true, false).unwrap();
        assert_eq!(vm.get_integer(-1).unwrap(), 42);
        // result, callee, root
        assert_eq!(vm.top(), 3);
    }

    #[test]
    fn free_variables_follow_arguments() {
        let mut vm = Vm::open(64);
        vm.push_string("bound");
        vm.new_closure(free_var_echo, 1).unwrap();
        assert_eq!(vm.top(), 1);
        vm.push_root_table();
        vm.push_integer(7);
        vm.call(2, true, false).unwrap();
        assert_eq!(&*vm.get_string(-1).unwrap(), "bound");
    }

    #[test]
    fn native_errors_capture_trace() {
        let mut vm = Vm::open(64);
        vm.new_closure(fail, 0).unwrap();
        vm.set_native_closure_name(-1, "fail").unwrap();
        vm.push_root_table();
        let err = vm.call(1, false, false).unwrap_err();
        assert_eq!(err.message(), "native failure");
        assert_eq!(err.trace()[0].function, "fail");
        assert_eq!(vm.last_error().map(|e| e.message()), Some("native failure"));
        assert_eq!(vm.top(), 1);
    }

    #[test]
    fn release_hook_runs_when_last_reference_drops() {
        RELEASED.with(|r| r.set(0));
        let mut vm = Vm::open(64);
        vm.new_userdata(Box::new(5u8));
        vm.set_release_hook(-1, count_release).unwrap();
        vm.push(-1).unwrap();
        vm.pop(1);
        assert_eq!(RELEASED.with(|r| r.get()), 0);
        vm.pop(1);
        assert_eq!(RELEASED.with(|r| r.get()), 1);
    }

    #[test]
    fn instance_type_tag_check() {
        let mut vm = Vm::open(64);
        vm.new_class();
        vm.set_type_tag(-1, TypeTag(1)).unwrap();
        vm.create_instance(-1).unwrap();
        assert_eq!(vm.get_type_tag(-1).unwrap(), Some(TypeTag(1)));
        assert!(vm.get_instance_up(-1, Some(TypeTag(1))).is_ok());
        assert!(vm.get_instance_up(-1, None).is_ok());
        let err = vm.get_instance_up(-1, Some(TypeTag(2))).unwrap_err();
        assert_eq!(err.message(), "invalid type tag");
        assert!(vm.get_instance_up(-2, None).is_err());
    }

    #[test]
    fn instance_without_meta_methods_rejects_unknown_members() {
        let mut vm = Vm::open(64);
        vm.new_class();
        vm.create_instance(-1).unwrap();
        vm.push_string("x");
        let err = vm.get(-2).unwrap_err();
        assert_eq!(err.message(), "the index 'x' does not exist");
        vm.push_string("x");
        vm.push_integer(1);
        assert!(vm.set(-3).is_err());
    }

    #[test]
    fn compiler_error_handler_sees_errors() {
        fn on_error(vm: &mut Vm, error: &CompileError) {
            let text = format!("{}:{}", error.source_name, error.line);
            vm.print(&text);
        }
        take_output();
        let mut vm = Vm::open(64);
        vm.set_print_func(Some(capture), None);
        vm.set_compiler_error_handler(Some(on_error));
        assert!(vm.compile_buffer("local = 1", "bad.nut", true).is_err());
        assert!(vm.compile_buffer("local = 1", "quiet.nut", false).is_err());
        assert_eq!(take_output(), vec!["bad.nut:1".to_string()]);
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn error_handler_runs_on_raised_errors() {
        fn handler(vm: &mut Vm) -> VmResult<u32> {
            let message = vm.get_stack_object(2)?.to_string();
            vm.print_error(&format!("handled: {}", message));
            Ok(0)
        }
        take_output();
        let mut vm = Vm::open(64);
        vm.set_print_func(None, Some(capture));
        vm.new_closure(handler, 0).unwrap();
        vm.set_error_handler().unwrap();

        vm.new_closure(fail, 0).unwrap();
        vm.push_root_table();
        assert!(vm.call(1, false, true).is_err());
        vm.push_root_table();
        assert!(vm.call(1, false, false).is_err());
        assert_eq!(take_output(), vec!["handled: native failure".to_string()]);
    }

    #[test]
    fn call_depth_is_bounded() {
        let mut vm = Vm::open(256);
        vm.set_max_call_depth(8);
        vm.compile_buffer("function f() { return f() }\nf()", "deep", false)
            .unwrap();
        vm.push_root_table();
        let err = vm.call(1, false, false).unwrap_err();
        assert_eq!(err.message(), "stack overflow");
    }

    #[test]
    fn native_stack_is_bounded() {
        let mut vm = Vm::open(256);
        vm.set_native_stack_limit(16 * 1024);
        vm.compile_buffer("function f(n) { return f(n + 1) }\nf(0)", "deep", false)
            .unwrap();
        vm.push_root_table();
        let err = vm.call(1, false, false).unwrap_err();
        assert_eq!(err.message(), "stack overflow");
        assert!(err.trace().len() < DEFAULT_MAX_CALL_DEPTH);
    }

    #[test]
    fn default_limits_hold_on_a_spawned_thread() {
        let message = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let mut vm = Vm::open(1024);
                vm.set_max_call_depth(usize::MAX);
                vm.compile_buffer("function f(n) { return f(n + 1) }\nf(0)", "deep", false)
                    .unwrap();
                vm.push_root_table();
                vm.call(1, false, false).unwrap_err().message().to_string()
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(message, "stack overflow");
    }

    #[test]
    fn dropping_vm_releases_globals() {
        RELEASED.with(|r| r.set(0));
        let mut vm = Vm::open(64);
        vm.push_root_table();
        vm.push_string("data");
        vm.new_userdata(Box::new(1u8));
        vm.set_release_hook(-1, count_release).unwrap();
        vm.new_slot(-3).unwrap();
        vm.pop(1);
        assert_eq!(RELEASED.with(|r| r.get()), 0);
        drop(vm);
        assert_eq!(RELEASED.with(|r| r.get()), 1);
    }

    #[test]
    fn dropping_vm_frees_reference_cycles() {
        RELEASED.with(|r| r.set(0));
        let mut vm = Vm::open(64);
        let source = "::g <- {}\n::g.inner <- {}\n::g.inner.back <- ::g\n\
                      local t = {}\nt.me <- t\n::keep <- t";
        vm.compile_buffer(source, "cycles", false).unwrap();
        vm.push_root_table();
        vm.call(1, false, false).unwrap();
        vm.pop(1);

        for global in ["g", "keep"] {
            vm.push_root_table();
            vm.push_string(global);
            vm.get(-2).unwrap();
            vm.push_string("data");
            vm.new_userdata(Box::new(0u8));
            vm.set_release_hook(-1, count_release).unwrap();
            vm.new_slot(-3).unwrap();
            vm.pop(2);
        }
        vm.push_root_table();
        vm.push_string("g");
        vm.push_null();
        vm.set(-3).unwrap();
        vm.push_string("keep");
        vm.push_null();
        vm.set(-3).unwrap();
        vm.pop(1);

        assert!(vm.live_objects() >= 3);
        assert_eq!(RELEASED.with(|r| r.get()), 0);
        drop(vm);
        assert_eq!(RELEASED.with(|r| r.get()), 2);
    }

    #[test]
    fn dropping_vm_releases_instances_in_cycles() {
        RELEASED.with(|r| r.set(0));
        let mut vm = Vm::open(64);
        vm.new_class();
        vm.create_instance(-1).unwrap();
        let instance = vm.get_instance_up(-1, None).unwrap();
        instance.set_user_pointer(Box::new(1u8));
        instance.set_release_hook(count_release);
        drop(instance);
        vm.push_string("self");
        vm.push(-2).unwrap();
        vm.new_slot(-4).unwrap();
        vm.pop(2);
        assert_eq!(vm.live_objects(), 2);
        drop(vm);
        assert_eq!(RELEASED.with(|r| r.get()), 1);
    }
}
