//! Reference-counted VM objects.
//!
//! Every container and callable lives behind an `Rc`. The VM, the stack and
//! the host all hold plain `Rc` clones, so "add ref" is a clone and "release"
//! is a drop. Objects owning host data (instances and user data) run their
//! release hook from `Drop`, which makes the hook fire exactly once.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;

use crate::ast::FunctionProto;
use crate::error::VmResult;
use crate::value::{Key, TypeTag, Value};
use crate::vm::Vm;

/// A function implemented by the host. See the crate docs for the calling
/// convention.
pub type NativeFunction = fn(&mut Vm) -> VmResult<u32>;

/// Called with the owned host data when the owning object is destroyed.
pub type ReleaseHook = fn(Box<dyn Any>);

pub type TableRef = Rc<Table>;
pub type ClassRef = Rc<Class>;
pub type InstanceRef = Rc<Instance>;
pub type UserDataRef = Rc<UserData>;
pub type NativeClosureRef = Rc<NativeClosure>;
pub type ClosureRef = Rc<Closure>;

// ============================================================================
// Table
// ============================================================================

/// A hash table keyed by integers and strings.
#[derive(Default)]
pub struct Table {
    slots: RefCell<FxHashMap<Key, Value>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.slots.borrow().get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.slots.borrow().contains_key(key)
    }

    /// Insert or replace a slot, returning the previous value.
    pub fn insert(&self, key: Key, value: Value) -> Option<Value> {
        self.slots.borrow_mut().insert(key, value)
    }

    /// Overwrite an existing slot. Returns `false` if the slot does not exist.
    pub fn set_existing(&self, key: &Key, value: Value) -> bool {
        let previous = {
            let mut slots = self.slots.borrow_mut();
            match slots.get_mut(key) {
                Some(slot) => std::mem::replace(slot, value),
                None => return false,
            }
        };
        drop(previous);
        true
    }

    pub fn remove(&self, key: &Key) -> Option<Value> {
        self.slots.borrow_mut().remove(key)
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.slots.borrow().keys().cloned().collect()
    }

    /// Drop every slot. Values are released after the borrow ends so release
    /// hooks never observe a borrowed table.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut *self.slots.borrow_mut());
        drop(slots);
    }
}

// ============================================================================
// Class / Instance
// ============================================================================

/// A class object: a member table plus an optional type tag.
#[derive(Default)]
pub struct Class {
    members: Table,
    type_tag: Cell<Option<TypeTag>>,
}

impl Class {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(&self, key: &Key) -> Option<Value> {
        self.members.get(key)
    }

    pub fn has_member(&self, key: &Key) -> bool {
        self.members.contains(key)
    }

    pub fn set_member(&self, key: Key, value: Value) {
        let previous = self.members.insert(key, value);
        drop(previous);
    }

    pub fn members(&self) -> &Table {
        &self.members
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        self.type_tag.get()
    }

    pub fn set_type_tag(&self, tag: TypeTag) {
        self.type_tag.set(Some(tag));
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("type_tag", &self.type_tag())
            .field("members", &self.members.len())
            .finish()
    }
}

/// An instance of a [`Class`], optionally owning a host pointer.
pub struct Instance {
    class: ClassRef,
    user_pointer: RefCell<Option<Box<dyn Any>>>,
    release_hook: Cell<Option<ReleaseHook>>,
}

impl Instance {
    pub fn new(class: ClassRef) -> Self {
        Self {
            class,
            user_pointer: RefCell::new(None),
            release_hook: Cell::new(None),
        }
    }

    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        self.class.type_tag()
    }

    pub fn has_user_pointer(&self) -> bool {
        self.user_pointer.borrow().is_some()
    }

    /// Attach host data. Data already attached is released through the
    /// current hook first.
    pub fn set_user_pointer(&self, pointer: Box<dyn Any>) {
        let previous = self.user_pointer.borrow_mut().replace(pointer);
        if let Some(previous) = previous {
            release(previous, self.release_hook.get());
        }
    }

    pub fn set_release_hook(&self, hook: ReleaseHook) {
        self.release_hook.set(Some(hook));
    }

    /// Mutable access to the host data.
    ///
    /// `None` if nothing is attached or the data is already borrowed.
    pub fn user_pointer_mut(&self) -> Option<RefMut<'_, Box<dyn Any>>> {
        let slot = self.user_pointer.try_borrow_mut().ok()?;
        RefMut::filter_map(slot, |slot| slot.as_mut()).ok()
    }

    /// Detach and release the host data now instead of on drop.
    ///
    /// Returns `false` if nothing was attached or the data is borrowed.
    pub fn release_user_pointer(&self) -> bool {
        let Ok(mut slot) = self.user_pointer.try_borrow_mut() else {
            return false;
        };
        let Some(pointer) = slot.take() else {
            return false;
        };
        drop(slot);
        release(pointer, self.release_hook.get());
        true
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type_tag", &self.type_tag())
            .field("has_user_pointer", &self.has_user_pointer())
            .finish()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(pointer) = self.user_pointer.get_mut().take() {
            release(pointer, self.release_hook.get());
        }
    }
}

// ============================================================================
// UserData
// ============================================================================

/// An opaque block of host data with an optional release hook and type tag.
pub struct UserData {
    data: RefCell<Option<Box<dyn Any>>>,
    release_hook: Cell<Option<ReleaseHook>>,
    type_tag: Cell<Option<TypeTag>>,
}

impl UserData {
    pub fn new(data: Box<dyn Any>) -> Self {
        Self {
            data: RefCell::new(Some(data)),
            release_hook: Cell::new(None),
            type_tag: Cell::new(None),
        }
    }

    pub fn set_release_hook(&self, hook: ReleaseHook) {
        self.release_hook.set(Some(hook));
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        self.type_tag.get()
    }

    pub fn set_type_tag(&self, tag: TypeTag) {
        self.type_tag.set(Some(tag));
    }

    /// Borrow the data as `T`, `None` on a type mismatch.
    pub fn downcast_ref<T: Any>(&self) -> Option<Ref<'_, T>> {
        let data = self.data.try_borrow().ok()?;
        Ref::filter_map(data, |data| data.as_ref()?.downcast_ref::<T>()).ok()
    }

    /// Mutably borrow the data as `T`, `None` on a type mismatch.
    pub fn downcast_mut<T: Any>(&self) -> Option<RefMut<'_, T>> {
        let data = self.data.try_borrow_mut().ok()?;
        RefMut::filter_map(data, |data| data.as_mut()?.downcast_mut::<T>()).ok()
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        if let Some(data) = self.data.get_mut().take() {
            release(data, self.release_hook.get());
        }
    }
}

fn release(data: Box<dyn Any>, hook: Option<ReleaseHook>) {
    match hook {
        Some(hook) => hook(data),
        None => drop(data),
    }
}

// ============================================================================
// Heap
// ============================================================================

const MIN_SWEEP: usize = 64;

/// Weak handles to every table, class and instance a VM allocated.
///
/// Reference counting cannot free cycles, so closing the VM walks the live
/// handles and empties them, which drops whatever the cycle kept alive.
#[derive(Default)]
pub(crate) struct Heap {
    tables: Vec<Weak<Table>>,
    classes: Vec<Weak<Class>>,
    instances: Vec<Weak<Instance>>,
    /// Handle count that triggers the next pruning of dead handles.
    sweep_at: usize,
}

impl Heap {
    pub(crate) fn track_table(&mut self, table: &TableRef) {
        self.tables.push(Rc::downgrade(table));
        self.maybe_sweep();
    }

    pub(crate) fn track_class(&mut self, class: &ClassRef) {
        self.classes.push(Rc::downgrade(class));
        self.maybe_sweep();
    }

    pub(crate) fn track_instance(&mut self, instance: &InstanceRef) {
        self.instances.push(Rc::downgrade(instance));
        self.maybe_sweep();
    }

    /// Number of tracked objects still alive.
    pub(crate) fn live_count(&self) -> usize {
        let tables = self.tables.iter().filter(|w| w.strong_count() > 0).count();
        let classes = self.classes.iter().filter(|w| w.strong_count() > 0).count();
        let instances = self.instances.iter().filter(|w| w.strong_count() > 0).count();
        tables + classes + instances
    }

    fn handle_count(&self) -> usize {
        self.tables.len() + self.classes.len() + self.instances.len()
    }

    fn maybe_sweep(&mut self) {
        if self.handle_count() < self.sweep_at.max(MIN_SWEEP) {
            return;
        }
        self.tables.retain(|w| w.strong_count() > 0);
        self.classes.retain(|w| w.strong_count() > 0);
        self.instances.retain(|w| w.strong_count() > 0);
        self.sweep_at = self.handle_count() * 2;
    }

    /// Release host data of live instances and empty every live table and
    /// class. Returns how many live objects were found.
    pub(crate) fn close(&mut self) -> usize {
        let instances: Vec<InstanceRef> =
            self.instances.drain(..).filter_map(|w| w.upgrade()).collect();
        let classes: Vec<ClassRef> = self.classes.drain(..).filter_map(|w| w.upgrade()).collect();
        let tables: Vec<TableRef> = self.tables.drain(..).filter_map(|w| w.upgrade()).collect();
        let count = instances.len() + classes.len() + tables.len();

        for instance in &instances {
            instance.release_user_pointer();
        }
        for class in &classes {
            class.members().clear();
        }
        for table in &tables {
            table.clear();
        }
        count
    }
}

// ============================================================================
// Closures
// ============================================================================

/// A host function plus the free variables bound to it.
pub struct NativeClosure {
    pub(crate) function: NativeFunction,
    pub(crate) free_vars: Vec<Value>,
    name: RefCell<Option<Rc<str>>>,
}

impl NativeClosure {
    pub fn new(function: NativeFunction, free_vars: Vec<Value>) -> Self {
        Self {
            function,
            free_vars,
            name: RefCell::new(None),
        }
    }

    pub fn name(&self) -> Rc<str> {
        self.name
            .borrow()
            .clone()
            .unwrap_or_else(|| Rc::from("unknown"))
    }

    pub fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = Some(Rc::from(name));
    }

    pub fn free_vars(&self) -> &[Value] {
        &self.free_vars
    }
}

/// A compiled script function.
pub struct Closure {
    pub(crate) proto: Rc<FunctionProto>,
}

impl Closure {
    pub(crate) fn new(proto: Rc<FunctionProto>) -> Self {
        Self { proto }
    }

    pub fn name(&self) -> Rc<str> {
        self.proto.name.clone()
    }

    pub fn param_count(&self) -> usize {
        self.proto.params.len()
    }
}
