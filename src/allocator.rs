//! Allocator policies for exposed native instances.
//!
//! An [`Allocator`] decides what the VM instance actually owns (the
//! "handle"), how that handle is destroyed when the instance is collected,
//! and how to reach the native value through it. The exposition layer only
//! ever stores handles and calls [`Allocator::cast_instance`] right before
//! invoking a delegate.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

/// Ownership strategy for instances of `T`.
pub trait Allocator<T: 'static>: 'static {
    /// What the VM instance owns.
    type Handle: 'static;

    fn create_instance(value: T) -> Self::Handle;

    /// Called exactly once, when the owning VM instance dies.
    fn destroy_instance(handle: Self::Handle) {
        drop(handle);
    }

    /// Run `f` against the native value. `None` if the value is not
    /// reachable right now (e.g. already borrowed).
    fn cast_instance<R>(handle: &mut Self::Handle, f: impl FnOnce(&mut T) -> R) -> Option<R>;
}

/// Boxes the value; the VM instance is its only owner.
pub struct DirectAllocator;

impl<T: 'static> Allocator<T> for DirectAllocator {
    type Handle = Box<T>;

    fn create_instance(value: T) -> Box<T> {
        Box::new(value)
    }

    fn cast_instance<R>(handle: &mut Box<T>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        Some(f(&mut **handle))
    }
}

/// Wraps the value in `Rc<RefCell<T>>` so the host can keep its own handle
/// to an object scripts also use.
pub struct SharedAllocator;

impl<T: 'static> Allocator<T> for SharedAllocator {
    type Handle = Rc<RefCell<T>>;

    fn create_instance(value: T) -> Rc<RefCell<T>> {
        Rc::new(RefCell::new(value))
    }

    fn cast_instance<R>(handle: &mut Rc<RefCell<T>>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut value = handle.try_borrow_mut().ok()?;
        Some(f(&mut *value))
    }
}

/// Release hook installed on every constructed instance.
pub(crate) fn release_instance<T: 'static, Al: Allocator<T>>(pointer: Box<dyn Any>) {
    match pointer.downcast::<Al::Handle>() {
        Ok(handle) => {
            trace!("releasing {}", std::any::type_name::<T>());
            Al::destroy_instance(*handle);
        }
        Err(_) => trace!(
            "release hook for {} got a foreign pointer",
            std::any::type_name::<T>()
        ),
    }
}
