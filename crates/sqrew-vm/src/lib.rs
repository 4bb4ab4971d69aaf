//! Embedded scripting VM for sqrew.
//!
//! A small Squirrel-flavoured virtual machine with a stack-based embedding
//! API. Values are reference counted: an object is destroyed, and its release
//! hook run, as soon as the last reference held by the script, the stack or
//! the host drops.
//!
//! ## Key Types
//!
//! - [`Vm`]: the machine and its stack API
//! - [`Value`]: a dynamically typed VM value
//! - [`VmError`]: a raised script error, with the call stack it unwound
//! - [`CompileError`]: a lexer/parser failure
//!
//! ## Native calling convention
//!
//! A native function has the signature [`NativeFunction`]. While it runs,
//! stack slot 1 holds `this`, the call arguments start at slot 2 and the
//! closure's free variables follow the arguments (slot -1 is the last free
//! variable). It returns the number of results it left on the stack (0 or 1).
//!
//! ```
//! use sqrew_vm::{Vm, VmResult};
//!
//! fn double(vm: &mut Vm) -> VmResult<u32> {
//!     let value = vm.get_integer(2)?;
//!     vm.push_integer(value * 2);
//!     Ok(1)
//! }
//!
//! let mut vm = Vm::open(1024);
//! vm.push_root_table();
//! vm.push_string("double");
//! vm.new_closure(double, 0).unwrap();
//! vm.new_slot(-3).unwrap();
//! vm.pop(1);
//! ```

mod ast;
mod error;
mod exec;
mod lexer;
mod object;
mod parser;
mod stdlib;
mod value;
mod vm;

pub use error::{CompileError, TraceFrame, VmError, VmResult};
pub use object::{
    Class, ClassRef, Closure, ClosureRef, Instance, InstanceRef, NativeClosure, NativeClosureRef,
    NativeFunction, ReleaseHook, Table, TableRef, UserData, UserDataRef,
};
pub use stdlib::{register_mathlib, register_stringlib};
pub use value::{Key, ObjectType, TypeTag, Value};
pub use vm::{CompilerErrorHandler, DEFAULT_NATIVE_STACK_LIMIT, PrintFunction, StackIndex, Vm};
