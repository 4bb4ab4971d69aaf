//! Method delegates and the trampolines the VM calls them through.
//!
//! Every registered method becomes one native closure whose single free
//! variable is a user-data slot holding the delegate. The closure's function
//! is a monomorphized trampoline ([`call_method`]) that knows the native
//! types involved, so it can verify the instance's type tag, pull the
//! arguments, run the delegate and push the result.
//!
//! Native callables come in three shapes, told apart by a marker type:
//!
//! - `fn(&mut T, ...) -> R` ([`MethodMarker`])
//! - `fn(&T, ...) -> R` ([`ConstMethodMarker`])
//! - `fn(&mut Handle, ...) -> R` ([`ExtensionMarker`]), where `Handle` is
//!   the allocator's ownership handle. The function receives the handle
//!   itself rather than the value behind it.

use std::marker::PhantomData;

use sqrew_vm::{Vm, VmError, VmResult};

use crate::allocator::{Allocator, release_instance};
use crate::marshal::{Arguments, ReturnValue};
use crate::type_tag::type_tag_of;

/// Marker for `fn(&mut T, ...)`.
pub struct MethodMarker;
/// Marker for `fn(&T, ...)`.
pub struct ConstMethodMarker;
/// Marker for `fn(&mut Handle, ...)`.
pub struct ExtensionMarker;

/// One erased native callable over `T` (or its handle `H`).
pub enum Callable<T, H, A, R> {
    Method(Box<dyn Fn(&mut T, A) -> R>),
    ConstMethod(Box<dyn Fn(&T, A) -> R>),
    Extension(Box<dyn Fn(&mut H, A) -> R>),
}

/// Conversion of a native function into a [`Callable`].
///
/// `A` is the argument tuple (without the receiver) and `M` one of the
/// marker types.
pub trait IntoMethod<T, H, A, R, M> {
    fn into_callable(self) -> Callable<T, H, A, R>;
}

macro_rules! impl_into_method {
    ($($arg:ident),*) => {
        impl<T, H, R, F, $($arg),*> IntoMethod<T, H, ($($arg,)*), R, MethodMarker> for F
        where
            F: Fn(&mut T, $($arg),*) -> R + 'static,
            T: 'static,
            H: 'static,
            R: 'static,
            $($arg: 'static),*
        {
            #[allow(non_snake_case)]
            fn into_callable(self) -> Callable<T, H, ($($arg,)*), R> {
                Callable::Method(Box::new(move |this: &mut T, ($($arg,)*): ($($arg,)*)| {
                    self(this, $($arg),*)
                }))
            }
        }

        impl<T, H, R, F, $($arg),*> IntoMethod<T, H, ($($arg,)*), R, ConstMethodMarker> for F
        where
            F: Fn(&T, $($arg),*) -> R + 'static,
            T: 'static,
            H: 'static,
            R: 'static,
            $($arg: 'static),*
        {
            #[allow(non_snake_case)]
            fn into_callable(self) -> Callable<T, H, ($($arg,)*), R> {
                Callable::ConstMethod(Box::new(move |this: &T, ($($arg,)*): ($($arg,)*)| {
                    self(this, $($arg),*)
                }))
            }
        }

        impl<T, H, R, F, $($arg),*> IntoMethod<T, H, ($($arg,)*), R, ExtensionMarker> for F
        where
            F: Fn(&mut H, $($arg),*) -> R + 'static,
            T: 'static,
            H: 'static,
            R: 'static,
            $($arg: 'static),*
        {
            #[allow(non_snake_case)]
            fn into_callable(self) -> Callable<T, H, ($($arg,)*), R> {
                Callable::Extension(Box::new(move |handle: &mut H, ($($arg,)*): ($($arg,)*)| {
                    self(handle, $($arg),*)
                }))
            }
        }
    };
}

impl_into_method!();
impl_into_method!(A1);
impl_into_method!(A1, A2);
impl_into_method!(A1, A2, A3);
impl_into_method!(A1, A2, A3, A4);
impl_into_method!(A1, A2, A3, A4, A5);
impl_into_method!(A1, A2, A3, A4, A5, A6);

/// A registered method, stored in the user-data free variable of its
/// trampoline closure.
pub(crate) struct MethodDelegate<T: 'static, Al: Allocator<T>, A, R> {
    callable: Callable<T, Al::Handle, A, R>,
    _allocator: PhantomData<fn() -> Al>,
}

impl<T: 'static, Al: Allocator<T>, A, R> MethodDelegate<T, Al, A, R> {
    pub(crate) fn new(callable: Callable<T, Al::Handle, A, R>) -> Self {
        Self {
            callable,
            _allocator: PhantomData,
        }
    }

    /// Run the callable against the instance behind `handle`. `None` when
    /// the allocator cannot reach the value.
    pub(crate) fn invoke(&self, handle: &mut Al::Handle, args: A) -> Option<R> {
        match &self.callable {
            Callable::Method(f) => Al::cast_instance(handle, |this| f(this, args)),
            Callable::ConstMethod(f) => Al::cast_instance(handle, |this| f(&*this, args)),
            Callable::Extension(f) => Some(f(handle, args)),
        }
    }
}

fn check_arity(vm: &Vm, count: usize) -> VmResult<()> {
    // this + arguments + one free variable
    if vm.top() != count + 2 {
        return Err(VmError::new("wrong number of parameters"));
    }
    Ok(())
}

/// Trampoline for every method registered on a class of `T`.
#[cfg_attr(feature = "profiling", profiling::function)]
pub(crate) fn call_method<T, Al, A, R>(vm: &mut Vm) -> VmResult<u32>
where
    T: 'static,
    Al: Allocator<T>,
    A: Arguments + 'static,
    R: ReturnValue + 'static,
{
    let instance = vm.get_instance_up(1, Some(type_tag_of::<T>()))?;
    let data = vm.get_userdata(-1)?;
    let delegate = data
        .downcast_ref::<MethodDelegate<T, Al, A, R>>()
        .ok_or_else(|| VmError::new("invalid method delegate"))?;
    check_arity(vm, A::COUNT)?;
    let args = A::pull(vm, 2)?;

    let result = {
        let mut pointer = instance
            .user_pointer_mut()
            .ok_or_else(|| VmError::new("instance has no native object or is in use"))?;
        let handle = (**pointer)
            .downcast_mut::<Al::Handle>()
            .ok_or_else(|| VmError::new("invalid type tag"))?;
        delegate
            .invoke(handle, args)
            .ok_or_else(|| VmError::new("native object is already borrowed"))?
    };
    result.push_return(vm)
}

// =========================================
// Constructors
// =========================================

/// Conversion of a native function `fn(...) -> T` into a constructor.
pub trait IntoConstructor<T, A> {
    fn into_constructor(self) -> Box<dyn Fn(A) -> T>;
}

/// Conversion of a native free function into a boxed callable.
pub trait IntoFunction<A, R> {
    fn into_function(self) -> Box<dyn Fn(A) -> R>;
}

macro_rules! impl_into_function {
    ($($arg:ident),*) => {
        impl<T, F, $($arg),*> IntoConstructor<T, ($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> T + 'static,
            T: 'static,
            $($arg: 'static),*
        {
            #[allow(non_snake_case)]
            fn into_constructor(self) -> Box<dyn Fn(($($arg,)*)) -> T> {
                Box::new(move |($($arg,)*): ($($arg,)*)| self($($arg),*))
            }
        }

        impl<R, F, $($arg),*> IntoFunction<($($arg,)*), R> for F
        where
            F: Fn($($arg),*) -> R + 'static,
            R: 'static,
            $($arg: 'static),*
        {
            #[allow(non_snake_case)]
            fn into_function(self) -> Box<dyn Fn(($($arg,)*)) -> R> {
                Box::new(move |($($arg,)*): ($($arg,)*)| self($($arg),*))
            }
        }
    };
}

impl_into_function!();
impl_into_function!(A1);
impl_into_function!(A1, A2);
impl_into_function!(A1, A2, A3);
impl_into_function!(A1, A2, A3, A4);
impl_into_function!(A1, A2, A3, A4, A5);
impl_into_function!(A1, A2, A3, A4, A5, A6);

pub(crate) struct ConstructorDelegate<T: 'static, Al: Allocator<T>, A> {
    construct: Box<dyn Fn(A) -> T>,
    _allocator: PhantomData<fn() -> Al>,
}

impl<T: 'static, Al: Allocator<T>, A> ConstructorDelegate<T, Al, A> {
    pub(crate) fn new(construct: Box<dyn Fn(A) -> T>) -> Self {
        Self {
            construct,
            _allocator: PhantomData,
        }
    }
}

/// Trampoline installed as the class `constructor`.
///
/// Builds the native value, wraps it with the allocator and hands the handle
/// to the instance together with the release hook that destroys it.
pub(crate) fn call_constructor<T, Al, A>(vm: &mut Vm) -> VmResult<u32>
where
    T: 'static,
    Al: Allocator<T>,
    A: Arguments + 'static,
{
    vm.get_instance_up(1, Some(type_tag_of::<T>()))?;
    let data = vm.get_userdata(-1)?;
    let delegate = data
        .downcast_ref::<ConstructorDelegate<T, Al, A>>()
        .ok_or_else(|| VmError::new("invalid constructor delegate"))?;
    check_arity(vm, A::COUNT)?;
    let args = A::pull(vm, 2)?;

    let handle = Al::create_instance((delegate.construct)(args));
    vm.set_release_hook(1, release_instance::<T, Al>)?;
    vm.set_instance_up(1, Box::new(handle))?;
    Ok(0)
}

// =========================================
// Free functions
// =========================================

pub(crate) struct FunctionDelegate<A, R> {
    function: Box<dyn Fn(A) -> R>,
}

impl<A, R> FunctionDelegate<A, R> {
    pub(crate) fn new(function: Box<dyn Fn(A) -> R>) -> Self {
        Self { function }
    }
}

/// Trampoline for native free functions. `this` is ignored.
pub(crate) fn call_function<A, R>(vm: &mut Vm) -> VmResult<u32>
where
    A: Arguments + 'static,
    R: ReturnValue + 'static,
{
    let data = vm.get_userdata(-1)?;
    let delegate = data
        .downcast_ref::<FunctionDelegate<A, R>>()
        .ok_or_else(|| VmError::new("invalid function delegate"))?;
    check_arity(vm, A::COUNT)?;
    let args = A::pull(vm, 2)?;
    (delegate.function)(args).push_return(vm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{DirectAllocator, SharedAllocator};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Gauge {
        level: i32,
    }

    impl Gauge {
        fn raise(&mut self, by: i32) -> i32 {
            self.level += by;
            self.level
        }

        fn level(&self) -> i32 {
            self.level
        }
    }

    fn callable<M, A, R>(
        f: impl IntoMethod<Gauge, Box<Gauge>, A, R, M>,
    ) -> MethodDelegate<Gauge, DirectAllocator, A, R> {
        MethodDelegate::new(f.into_callable())
    }

    #[test]
    fn method_shape() {
        let delegate = callable(Gauge::raise);
        let mut handle = Box::new(Gauge { level: 1 });
        assert_eq!(delegate.invoke(&mut handle, (4,)), Some(5));
        assert_eq!(handle.level, 5);
    }

    #[test]
    fn const_method_shape() {
        let delegate = callable(Gauge::level);
        let mut handle = Box::new(Gauge { level: 9 });
        assert_eq!(delegate.invoke(&mut handle, ()), Some(9));
    }

    #[test]
    fn extension_shape_receives_handle() {
        fn reset(handle: &mut Box<Gauge>, to: i32) {
            **handle = Gauge { level: to };
        }
        let delegate = callable(reset);
        assert!(matches!(delegate.callable, Callable::Extension(_)));
        let mut handle = Box::new(Gauge { level: 9 });
        delegate.invoke(&mut handle, (2,));
        assert_eq!(handle.level, 2);
    }

    #[test]
    fn shared_extension_can_keep_the_handle() {
        let kept: Rc<RefCell<Option<Rc<RefCell<Gauge>>>>> = Rc::default();
        let sink = Rc::clone(&kept);
        let delegate: MethodDelegate<Gauge, SharedAllocator, (), ()> = MethodDelegate::new(
            (move |handle: &mut Rc<RefCell<Gauge>>| {
                *sink.borrow_mut() = Some(Rc::clone(handle));
            })
            .into_callable(),
        );
        let mut handle = Rc::new(RefCell::new(Gauge { level: 3 }));
        delegate.invoke(&mut handle, ());
        assert!(Rc::ptr_eq(kept.borrow().as_ref().unwrap(), &handle));
    }

    #[test]
    fn constructor_and_function_conversion() {
        let construct = (|level: i32| Gauge { level }).into_constructor();
        assert_eq!(construct((7,)).level, 7);
        let function = (|a: i64, b: i64, c: i64| a * b + c).into_function();
        assert_eq!(function((2, 3, 4)), 10);
    }
}
