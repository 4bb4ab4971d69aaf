//! Exposing native types as VM classes.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use log::debug;
use sqrew_vm::{ClassRef, Key, NativeFunction, TypeTag, Value};

use crate::allocator::{Allocator, DirectAllocator, release_instance};
use crate::context::{CLASS_INDEX, Context};
use crate::delegate::{
    Callable, ConstructorDelegate, IntoConstructor, IntoMethod, MethodDelegate, call_constructor,
    call_method,
};
use crate::error::{Error, Result};
use crate::field::FieldTables;
use crate::marshal::{Arguments, GetValue, ReturnValue};
use crate::stack::StackGuard;
use crate::table::{Table, TableDomain};
use crate::type_tag::type_tag_of;

/// Binding between the native type `T` and one VM class.
///
/// Created with [`Class::expose`], then configured with the by-value
/// builder methods. Every registration takes effect in the VM immediately;
/// dropping the binding leaves the script-visible class in place.
///
/// ```
/// use sqrew::{Class, Context};
///
/// struct Counter {
///     f: i32,
/// }
///
/// impl Counter {
///     fn new(f: i32) -> Self {
///         Self { f }
///     }
///
///     fn get_f(&self) -> i32 {
///         self.f
///     }
///
///     fn set_f(&mut self, f: i32) {
///         self.f = f;
///     }
/// }
///
/// let context = Context::new();
/// context.initialize()?;
///
/// Class::<Counter>::expose(&context, "Counter")?
///     .set_constructor(Counter::new)?
///     .set_method("getF", Counter::get_f)?
///     .set_method("setF", Counter::set_f)?
///     .set_field_accessors("f", Counter::set_f, Counter::get_f)?;
///
/// assert!(context.execute_buffer("local c = Counter(5); c.f = c.f + 10; print(c.f)"));
/// # Ok::<(), sqrew::Error>(())
/// ```
pub struct Class<'ctx, T: 'static, Al: Allocator<T> = DirectAllocator> {
    context: &'ctx Context,
    name: String,
    class: ClassRef,
    namespace: Table<'ctx>,
    type_tag: TypeTag,
    has_constructor: bool,
    fields: Option<FieldTables>,
    _marker: PhantomData<fn() -> (T, Al)>,
}

impl<'ctx, T: 'static, Al: Allocator<T>> Class<'ctx, T, Al> {
    /// Create the class at `full_name` in the script root, creating the
    /// enclosing namespace tables (`"game.units.Tank"`) as needed.
    pub fn expose(context: &'ctx Context, full_name: &str) -> Result<Self> {
        let (path, name) = full_name.rsplit_once('.').unwrap_or(("", full_name));
        if name.is_empty() {
            return Err(Error::InvalidClassName {
                name: full_name.to_string(),
            });
        }
        let namespace = Table::create(context, path, TableDomain::Script)?;
        let namespace_object = namespace.object().cloned().ok_or(Error::InvalidTable)?;
        let type_tag = type_tag_of::<T>();
        let tag_index = type_tag.0 as i64;

        let class: ClassRef = context.vm()?.create_class();
        class.set_type_tag(type_tag);
        {
            let mut vm = context.vm()?;
            let mut vm = StackGuard::new(&mut vm);

            vm.push_registry_table();
            vm.push_string(CLASS_INDEX);
            vm.get(-2)?;
            let index = vm.get_stack_object(-1)?;
            let exposed = index
                .as_table()
                .is_some_and(|index| index.contains(&Key::Integer(tag_index)));
            if exposed {
                return Err(Error::TypeAlreadyExposed {
                    name: full_name.to_string(),
                });
            }
            if namespace_object.contains(&Key::from(name)) {
                return Err(Error::ClassAlreadyExists {
                    name: full_name.to_string(),
                });
            }

            vm.push_integer(tag_index);
            vm.push_value(Value::Class(Rc::clone(&class)));
            vm.new_slot(-3)?;

            vm.push_value(Value::Table(namespace_object));
            vm.push_string(name);
            vm.push_value(Value::Class(Rc::clone(&class)));
            vm.new_slot(-3)?;
        }

        debug!(
            "exposed {} as '{}' (tag {})",
            std::any::type_name::<T>(),
            full_name,
            type_tag
        );
        Ok(Self {
            context,
            name: full_name.to_string(),
            class,
            namespace,
            type_tag,
            has_constructor: false,
            fields: None,
            _marker: PhantomData,
        })
    }

    /// Register the constructor. A class has at most one.
    pub fn set_constructor<F, A>(mut self, constructor: F) -> Result<Self>
    where
        F: IntoConstructor<T, A>,
        A: Arguments + 'static,
    {
        if self.has_constructor {
            return Err(Error::ConstructorAlreadySet {
                class: self.name.clone(),
            });
        }
        let delegate = ConstructorDelegate::<T, Al, A>::new(constructor.into_constructor());
        self.bind_closure(
            &Value::Class(Rc::clone(&self.class)),
            "constructor",
            call_constructor::<T, Al, A>,
            Box::new(delegate),
        )?;
        self.has_constructor = true;
        debug!("{}: constructor with {} arguments", self.name, A::COUNT);
        Ok(self)
    }

    /// Register a method. `method` is `fn(&mut T, ...)`, `fn(&T, ...)` or an
    /// extension function taking the allocator handle.
    pub fn set_method<F, A, R, M>(self, name: &str, method: F) -> Result<Self>
    where
        F: IntoMethod<T, Al::Handle, A, R, M>,
        A: Arguments + 'static,
        R: ReturnValue + 'static,
    {
        self.bind_callable(
            &Value::Class(Rc::clone(&self.class)),
            name,
            method.into_callable(),
        )?;
        debug!("{}: method '{}'", self.name, name);
        Ok(self)
    }

    /// Expose a data member through a projection to it.
    ///
    /// ```
    /// # use sqrew::{Class, Context};
    /// struct Point { x: f64 }
    /// # let context = Context::new();
    /// # context.initialize()?;
    /// Class::<Point>::expose(&context, "Point")?
    ///     .set_constructor(|| Point { x: 0.0 })?
    ///     .set_field("x", |p: &mut Point| &mut p.x)?;
    /// # Ok::<(), sqrew::Error>(())
    /// ```
    pub fn set_field<V, P>(self, name: &str, project: P) -> Result<Self>
    where
        V: GetValue + ReturnValue + Clone + 'static,
        P: Fn(&mut T) -> &mut V + 'static,
    {
        let project = Rc::new(project);
        let read = Rc::clone(&project);
        self.register_field(
            name,
            Callable::Method(Box::new(move |this: &mut T, (value,): (V,)| {
                *(*project)(this) = value;
            })),
            Callable::Method(Box::new(move |this: &mut T, (): ()| (*read)(this).clone())),
        )
    }

    /// Expose a field through a setter and a getter, in any method shape.
    ///
    /// Re-registering a name replaces both accessors.
    pub fn set_field_accessors<S, SA, SR, SM, G, GR, GM>(
        self,
        name: &str,
        setter: S,
        getter: G,
    ) -> Result<Self>
    where
        S: IntoMethod<T, Al::Handle, SA, SR, SM>,
        SA: Arguments + 'static,
        SR: ReturnValue + 'static,
        G: IntoMethod<T, Al::Handle, (), GR, GM>,
        GR: ReturnValue + 'static,
    {
        self.register_field(name, setter.into_callable(), getter.into_callable())
    }

    fn register_field<SA, SR, GR>(
        mut self,
        name: &str,
        setter: Callable<T, Al::Handle, SA, SR>,
        getter: Callable<T, Al::Handle, (), GR>,
    ) -> Result<Self>
    where
        SA: Arguments + 'static,
        SR: ReturnValue + 'static,
        GR: ReturnValue + 'static,
    {
        let tables = self.field_tables()?;
        self.bind_callable(&Value::Table(tables.set), name, setter)?;
        self.bind_callable(&Value::Table(tables.get), name, getter)?;
        debug!("{}: field '{}'", self.name, name);
        Ok(self)
    }

    /// Publish a host-created object under `name` in the class's namespace.
    ///
    /// With [`SharedAllocator`](crate::SharedAllocator) the host can keep a
    /// clone of `handle` and observe what scripts do to the object.
    pub fn bind_instance(&self, name: &str, handle: Al::Handle) -> Result<()> {
        let namespace = self.namespace.object().cloned().ok_or(Error::InvalidTable)?;
        let mut vm = self.context.vm()?;
        let mut vm = StackGuard::new(&mut vm);
        vm.push_value(Value::Class(Rc::clone(&self.class)));
        vm.push_value(Value::Table(namespace));
        vm.push_string(name);
        vm.create_instance(-3)?;
        vm.set_release_hook(-1, release_instance::<T, Al>)?;
        vm.set_instance_up(-1, Box::new(handle))?;
        vm.new_slot(-3)?;
        debug!("{}: bound instance '{}'", self.name, name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// The VM class object.
    pub fn class_object(&self) -> &ClassRef {
        &self.class
    }

    /// The table the class was inserted into.
    pub fn namespace(&self) -> &Table<'ctx> {
        &self.namespace
    }

    fn field_tables(&mut self) -> Result<FieldTables> {
        if let Some(tables) = &self.fields {
            return Ok(tables.clone());
        }
        let tables = FieldTables::install(&mut *self.context.vm()?, &self.class)?;
        self.fields = Some(tables.clone());
        Ok(tables)
    }

    fn bind_callable<A, R>(
        &self,
        target: &Value,
        name: &str,
        callable: Callable<T, Al::Handle, A, R>,
    ) -> Result<()>
    where
        A: Arguments + 'static,
        R: ReturnValue + 'static,
    {
        let delegate = MethodDelegate::<T, Al, A, R>::new(callable);
        self.bind_closure(target, name, call_method::<T, Al, A, R>, Box::new(delegate))
    }

    /// Set `target[name]` to a native closure over `delegate`.
    fn bind_closure(
        &self,
        target: &Value,
        name: &str,
        function: NativeFunction,
        delegate: Box<dyn Any>,
    ) -> Result<()> {
        let mut vm = self.context.vm()?;
        let mut vm = StackGuard::new(&mut vm);
        vm.push_value(target.clone());
        vm.push_string(name);
        vm.new_userdata(delegate);
        vm.set_type_tag(-1, self.type_tag)?;
        vm.new_closure(function, 1)?;
        vm.set_native_closure_name(-1, name)?;
        vm.new_slot(-3)?;
        Ok(())
    }
}

impl<T: 'static, Al: Allocator<T>> fmt::Debug for Class<'_, T, Al> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .field("type_tag", &self.type_tag)
            .field("has_constructor", &self.has_constructor)
            .finish_non_exhaustive()
    }
}
