//! Expose native Rust types to an embedded Squirrel-style VM.
//!
//! sqrew binds native types, methods, free functions and data fields to
//! [`sqrew_vm`], so scripts can construct instances, call methods and read
//! or write fields as if they were script objects. The native side keeps
//! control of ownership (through an [`Allocator`] policy) and of type
//! identity (every exposed class carries a type tag that is checked before
//! any instance is used).
//!
//! ## Key Types
//!
//! - [`Context`]: owns the VM, routes output to an [`Interface`], runs
//!   script buffers
//! - [`Class`]: builder binding one native type to one VM class
//! - [`Table`]: handle to a namespace table addressed by a dotted path
//! - [`GetValue`] / [`PutValue`]: value marshalling between native values
//!   and VM stack slots
//!
//! ## Example
//!
//! ```
//! use sqrew::prelude::*;
//!
//! struct Vec2 {
//!     x: f64,
//!     y: f64,
//! }
//!
//! impl Vec2 {
//!     fn length(&self) -> f64 {
//!         (self.x * self.x + self.y * self.y).sqrt()
//!     }
//! }
//!
//! let context = Context::new();
//! context.initialize()?;
//!
//! Class::<Vec2>::expose(&context, "math.Vec2")?
//!     .set_constructor(|x: f64, y: f64| Vec2 { x, y })?
//!     .set_method("length", Vec2::length)?
//!     .set_field("x", |v: &mut Vec2| &mut v.x)?;
//!
//! assert!(context.execute_buffer("::len <- math.Vec2(3, 4).length()"));
//! let root = Table::root(&context, TableDomain::Script)?;
//! assert_eq!(root.get_value::<f64>("len")?, 5.0);
//! # Ok::<(), sqrew::Error>(())
//! ```

mod allocator;
mod class;
mod context;
mod delegate;
mod error;
mod field;
mod interface;
mod marshal;
mod stack;
mod table;
mod type_tag;

pub use allocator::{Allocator, DirectAllocator, SharedAllocator};
pub use class::Class;
pub use context::{Context, ContextConfig};
pub use delegate::{
    Callable, ConstMethodMarker, ExtensionMarker, IntoConstructor, IntoFunction, IntoMethod,
    MethodMarker,
};
pub use error::{Error, Result};
pub use interface::Interface;
pub use marshal::{Arguments, ConversionError, GetValue, PutValue, ReturnValue};
pub use stack::StackGuard;
pub use table::{Table, TableDomain};
pub use type_tag::type_tag_of;

pub use sqrew_vm;

/// Everything needed to expose types and run scripts.
pub mod prelude {
    pub use crate::{
        Allocator, Class, Context, ContextConfig, DirectAllocator, Error, GetValue, Interface,
        PutValue, SharedAllocator, Table, TableDomain,
    };
}
