//! Namespace tables addressed by dotted paths.
//!
//! A [`Table`] is a handle to one VM table inside one of the three root
//! domains. Handles are either valid or invalid; lookups never fail loudly,
//! they hand back an invalid table that every later operation treats as a
//! no-op.

use std::fmt;
use std::rc::Rc;

use log::debug;
use sqrew_vm::{Key, ObjectType, TableRef, Value, Vm};

use crate::context::Context;
use crate::delegate::{FunctionDelegate, IntoFunction, call_function};
use crate::error::{Error, Result};
use crate::marshal::{Arguments, GetValue, PutValue, ReturnValue};
use crate::stack::StackGuard;

/// Root namespace a path is resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TableDomain {
    /// The script-visible root table.
    #[default]
    Script,
    /// Host-private storage scripts cannot name.
    Registry,
    /// Constants, resolved by scripts before the root table.
    Const,
}

impl TableDomain {
    fn root(self, vm: &Vm) -> TableRef {
        match self {
            TableDomain::Script => Rc::clone(vm.root_table()),
            TableDomain::Registry => Rc::clone(vm.registry_table()),
            TableDomain::Const => Rc::clone(vm.const_table()),
        }
    }
}

/// Handle to a VM table, or an invalid handle.
///
/// Two handles compare equal when they refer to the same table.
#[derive(Clone)]
pub struct Table<'ctx> {
    context: &'ctx Context,
    object: Option<TableRef>,
}

impl<'ctx> Table<'ctx> {
    /// The root table of `domain`.
    pub fn root(context: &'ctx Context, domain: TableDomain) -> Result<Self> {
        let vm = context.vm()?;
        Ok(Self::bound(context, domain.root(&vm)))
    }

    /// Resolve `path` without creating anything. Invalid if a component is
    /// missing or is not a table.
    pub fn get(context: &'ctx Context, path: &str, domain: TableDomain) -> Self {
        let object = context.vm().ok().and_then(|mut vm| {
            let start = domain.root(&vm);
            walk(&mut vm, &start, path, false).ok().flatten()
        });
        Self { context, object }
    }

    /// Resolve `path`, creating missing tables along the way.
    ///
    /// Creating an existing path hands back the same table. A component that
    /// exists but is not a table is [`Error::PathConflict`].
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn create(context: &'ctx Context, path: &str, domain: TableDomain) -> Result<Self> {
        let mut vm = context.vm()?;
        let start = domain.root(&vm);
        match walk(&mut vm, &start, path, true)? {
            Some(object) => Ok(Self::bound(context, object)),
            None => Err(Error::InvalidTable),
        }
    }

    fn bound(context: &'ctx Context, object: TableRef) -> Self {
        Self {
            context,
            object: Some(object),
        }
    }

    fn invalid(context: &'ctx Context) -> Self {
        Self {
            context,
            object: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.object.is_some()
    }

    /// The underlying VM table, if valid.
    pub fn object(&self) -> Option<&TableRef> {
        self.object.as_ref()
    }

    pub fn context(&self) -> &'ctx Context {
        self.context
    }

    /// Create `path` below this table. An invalid table stays invalid.
    pub fn create_table(&self, path: &str) -> Result<Table<'ctx>> {
        let Some(start) = &self.object else {
            return Ok(Self::invalid(self.context));
        };
        let mut vm = self.context.vm()?;
        match walk(&mut vm, start, path, true)? {
            Some(object) => Ok(Self::bound(self.context, object)),
            None => Err(Error::InvalidTable),
        }
    }

    /// Resolve `path` below this table without creating anything.
    pub fn get_table(&self, path: &str) -> Table<'ctx> {
        let object = self.object.as_ref().and_then(|start| {
            let mut vm = self.context.vm().ok()?;
            walk(&mut vm, start, path, false).ok().flatten()
        });
        Self {
            context: self.context,
            object,
        }
    }

    /// Whether the slot `name` exists. False on an invalid table.
    pub fn contains(&self, name: &str) -> bool {
        self.object
            .as_ref()
            .is_some_and(|table| table.contains(&Key::from(name)))
    }

    /// Create or overwrite the slot `name`.
    pub fn set_value<V: PutValue>(&self, name: &str, value: V) -> Result<()> {
        let table = self.object.as_ref().ok_or(Error::InvalidTable)?;
        let mut vm = self.context.vm()?;
        let mut vm = StackGuard::new(&mut vm);
        vm.push_value(Value::Table(Rc::clone(table)));
        vm.push_string(name);
        value.put_value(&mut vm);
        vm.new_slot(-3)?;
        Ok(())
    }

    /// Read the slot `name` as `V`.
    pub fn get_value<V: GetValue>(&self, name: &str) -> Result<V> {
        let table = self.object.as_ref().ok_or(Error::InvalidTable)?;
        let mut vm = self.context.vm()?;
        let mut vm = StackGuard::new(&mut vm);
        vm.push_value(Value::Table(Rc::clone(table)));
        vm.push_string(name);
        if vm.get(-2).is_err() {
            return Err(Error::MissingSlot(name.to_string()));
        }
        Ok(V::get_value(&vm, -1)?)
    }

    /// Bind a native function under `name`.
    pub fn set_function<F, A, R>(&self, name: &str, function: F) -> Result<()>
    where
        F: IntoFunction<A, R>,
        A: Arguments + 'static,
        R: ReturnValue + 'static,
    {
        let table = self.object.as_ref().ok_or(Error::InvalidTable)?;
        let mut vm = self.context.vm()?;
        let mut vm = StackGuard::new(&mut vm);
        vm.push_value(Value::Table(Rc::clone(table)));
        vm.push_string(name);
        vm.new_userdata(Box::new(FunctionDelegate::new(function.into_function())));
        vm.new_closure(call_function::<A, R>, 1)?;
        vm.set_native_closure_name(-1, name)?;
        vm.new_slot(-3)?;
        debug!("bound function '{}'", name);
        Ok(())
    }
}

impl PartialEq for Table<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.object, &other.object) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Table<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(table) => write!(f, "Table({:p})", Rc::as_ptr(table)),
            None => write!(f, "Table(invalid)"),
        }
    }
}

/// Non-empty components of a dotted path.
pub(crate) fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|component| !component.is_empty())
}

/// Walk `path` from `start`. `Ok(None)` when a lookup misses; with `create`
/// set, missing components are created and a non-table component is a
/// conflict.
fn walk(vm: &mut Vm, start: &TableRef, path: &str, create: bool) -> Result<Option<TableRef>> {
    let mut vm = StackGuard::new(vm);
    vm.push_value(Value::Table(Rc::clone(start)));

    for component in path_components(path) {
        vm.push_string(component);
        if vm.get(-2).is_ok() {
            if vm.object_type(-1)? != ObjectType::Table {
                if !create {
                    return Ok(None);
                }
                return Err(Error::PathConflict {
                    path: path.to_string(),
                    component: component.to_string(),
                });
            }
        } else if create {
            vm.push_string(component);
            vm.new_table();
            vm.new_slot(-3)?;
            vm.push_string(component);
            vm.get(-2)?;
            debug!("created table '{}' of '{}'", component, path);
        } else {
            return Ok(None);
        }
    }

    Ok(vm.get_stack_object(-1)?.as_table().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Context {
        let context = Context::new();
        context.initialize().unwrap();
        context
    }

    #[test]
    fn path_components_skip_empty() {
        let parts: Vec<_> = path_components(".a..b.").collect();
        assert_eq!(parts, vec!["a", "b"]);
        assert_eq!(path_components("").count(), 0);
    }

    #[test]
    fn create_is_idempotent() {
        let ctx = context();
        let first = Table::create(&ctx, "a.b.c", TableDomain::Script).unwrap();
        let second = Table::create(&ctx, "a.b.c", TableDomain::Script).unwrap();
        assert!(first.is_valid());
        assert_eq!(first, second);
        assert_eq!(first, Table::get(&ctx, "a.b.c", TableDomain::Script));
    }

    #[test]
    fn empty_path_is_the_root() {
        let ctx = context();
        let root = Table::root(&ctx, TableDomain::Script).unwrap();
        assert_eq!(Table::create(&ctx, "", TableDomain::Script).unwrap(), root);
    }

    #[test]
    fn get_missing_is_invalid() {
        let ctx = context();
        let table = Table::get(&ctx, "nope.deeper", TableDomain::Script);
        assert!(!table.is_valid());
        assert!(!table.contains("x"));
        assert!(!table.get_table("y").is_valid());
        assert!(!table.create_table("z").unwrap().is_valid());
        assert!(matches!(table.set_value("x", 1), Err(Error::InvalidTable)));
        assert!(matches!(table.get_value::<i64>("x"), Err(Error::InvalidTable)));
    }

    #[test]
    fn conflict_on_non_table_component() {
        let ctx = context();
        let a = Table::create(&ctx, "a", TableDomain::Script).unwrap();
        a.set_value("b", 3).unwrap();
        let err = Table::create(&ctx, "a.b", TableDomain::Script).unwrap_err();
        assert!(matches!(
            err,
            Error::PathConflict { ref component, .. } if component == "b"
        ));
        assert!(!Table::get(&ctx, "a.b", TableDomain::Script).is_valid());
    }

    #[test]
    fn domains_are_separate() {
        let ctx = context();
        let script = Table::create(&ctx, "shared", TableDomain::Script).unwrap();
        let registry = Table::create(&ctx, "shared", TableDomain::Registry).unwrap();
        let consts = Table::create(&ctx, "shared", TableDomain::Const).unwrap();
        assert_ne!(script, registry);
        assert_ne!(registry, consts);
        assert!(!Table::get(&ctx, "shared.x", TableDomain::Registry).is_valid());
    }

    #[test]
    fn relative_tables() {
        let ctx = context();
        let game = Table::create(&ctx, "game", TableDomain::Script).unwrap();
        let units = game.create_table("world.units").unwrap();
        assert_eq!(units, Table::get(&ctx, "game.world.units", TableDomain::Script));
        assert_eq!(units, game.get_table("world.units"));
        assert!(game.contains("world"));
        assert!(!game.contains("units"));
    }

    #[test]
    fn values_round_trip_through_slots() {
        let ctx = context();
        let config = Table::create(&ctx, "config", TableDomain::Script).unwrap();
        config.set_value("name", "sqrew").unwrap();
        config.set_value("scale", 1.5).unwrap();
        assert_eq!(config.get_value::<String>("name").unwrap(), "sqrew");
        assert_eq!(config.get_value::<f64>("scale").unwrap(), 1.5);
        assert!(matches!(
            config.get_value::<i64>("name"),
            Err(Error::Conversion(_))
        ));
        assert!(matches!(
            config.get_value::<i64>("missing"),
            Err(Error::MissingSlot(ref name)) if name == "missing"
        ));
    }

    #[test]
    fn script_sees_created_tables_and_functions() {
        let ctx = context();
        let math = Table::create(&ctx, "util.math", TableDomain::Script).unwrap();
        math.set_function("add", |a: i64, b: i64| a + b).unwrap();
        assert!(ctx.execute_buffer("::util.math.result <- util.math.add(2, 3)"));
        assert_eq!(math.get_value::<i64>("result").unwrap(), 5);
    }

    #[test]
    fn registry_is_hidden_from_scripts() {
        let ctx = context();
        Table::create(&ctx, "secret", TableDomain::Registry).unwrap();
        assert!(!ctx.execute_buffer("local x = secret"));
    }

    #[test]
    fn stack_is_balanced_after_operations() {
        let ctx = context();
        let before = ctx.vm().unwrap().top();
        let table = Table::create(&ctx, "x.y", TableDomain::Script).unwrap();
        table.set_value("v", 1).unwrap();
        let _ = table.get_value::<bool>("v");
        let _ = Table::create(&ctx, "x.y.v", TableDomain::Script);
        assert_eq!(ctx.vm().unwrap().top(), before);
    }

    #[test]
    fn uninitialized_context_is_rejected() {
        let ctx = Context::new();
        assert!(matches!(
            Table::create(&ctx, "a", TableDomain::Script),
            Err(Error::NotInitialized)
        ));
        assert!(!Table::get(&ctx, "a", TableDomain::Script).is_valid());
    }
}
