//! Execution context owning one VM.
//!
//! A `Context` owns its VM for its whole lifetime, routes script output to
//! the host [`Interface`] and runs script buffers.
//!
//! # Example
//!
//! ```
//! use sqrew::{Context, Interface};
//!
//! struct Stdout;
//!
//! impl Interface for Stdout {
//!     fn print(&mut self, message: &str) {
//!         println!("{}", message);
//!     }
//! }
//!
//! let context = Context::new();
//! context.initialize()?;
//! context.set_interface(Stdout)?;
//! assert!(context.execute_buffer("print(\"hello\")"));
//! # Ok::<(), sqrew::Error>(())
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;

use log::{debug, warn};
use sqrew_vm::{
    CompileError, DEFAULT_NATIVE_STACK_LIMIT, Key, UserData, Value, Vm, VmResult,
    register_mathlib, register_stringlib,
};

use crate::error::{Error, Result};
use crate::interface::Interface;
use crate::stack::StackGuard;
use crate::table::{Table, TableDomain};

/// Registry table mapping type tags to exposed classes.
pub(crate) const CLASS_INDEX: &str = "__sqrew_classes";

/// Registry slot holding the [`HostBridge`].
const HOST_KEY: &str = "__sqrew_host";

/// Settings applied when a [`Context`] opens its VM.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Value stack size in slots.
    pub stack_size: usize,
    pub max_call_depth: usize,
    /// Native stack in bytes that nested script calls may use. Must stay
    /// below the stack size of the thread running scripts.
    pub max_native_stack: usize,
    /// Register the math and string libraries into the root table.
    pub register_std_libs: bool,
    /// Source name used by [`Context::execute_buffer`].
    pub default_source_name: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            stack_size: 1024,
            max_call_depth: 200,
            max_native_stack: DEFAULT_NATIVE_STACK_LIMIT,
            register_std_libs: true,
            default_source_name: "?".to_string(),
        }
    }
}

impl ContextConfig {
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_native_stack(mut self, bytes: usize) -> Self {
        self.max_native_stack = bytes;
        self
    }

    pub fn with_std_libs(mut self, register: bool) -> Self {
        self.register_std_libs = register;
        self
    }

    pub fn with_default_source_name(mut self, name: impl Into<String>) -> Self {
        self.default_source_name = name.into();
        self
    }
}

/// Where the VM's print and error hooks find the host interface.
///
/// A clone of the bridge lives in the VM registry, so the plain function
/// hooks can reach it from the `Vm` alone.
#[derive(Default)]
struct HostBridge {
    interface: RefCell<Option<Box<dyn Interface>>>,
}

impl HostBridge {
    fn lookup(vm: &Vm) -> Option<Rc<HostBridge>> {
        let Value::UserData(data) = vm.registry_table().get(&Key::from(HOST_KEY))? else {
            return None;
        };
        let bridge = data.downcast_ref::<Rc<HostBridge>>()?;
        Some(Rc::clone(&bridge))
    }

    /// Run `f` with the interface. Dropped silently when none is set.
    fn with_interface(&self, f: impl FnOnce(&mut dyn Interface)) {
        if let Ok(mut interface) = self.interface.try_borrow_mut() {
            if let Some(interface) = interface.as_mut() {
                f(&mut **interface);
            }
        }
    }
}

fn host_print(vm: &mut Vm, text: &str) {
    if let Some(bridge) = HostBridge::lookup(vm) {
        bridge.with_interface(|interface| interface.print(text));
    }
}

fn host_print_error(vm: &mut Vm, text: &str) {
    if let Some(bridge) = HostBridge::lookup(vm) {
        bridge.with_interface(|interface| interface.print_error(text));
    }
}

fn host_compiler_error(vm: &mut Vm, error: &CompileError) {
    if let Some(bridge) = HostBridge::lookup(vm) {
        bridge.with_interface(|interface| {
            interface.handle_compiler_error(
                &error.message,
                &error.source_name,
                error.line,
                error.column,
            )
        });
    }
}

/// Runtime error handler: prints `[message]` and the call stack.
fn handle_runtime_error(vm: &mut Vm) -> VmResult<u32> {
    let message = match vm.get_stack_object(2) {
        Ok(Value::String(text)) => format!("[{}]", text),
        Ok(value) if !value.is_null() => format!("[{}]", value),
        _ => "unknown".to_string(),
    };
    vm.print_error(&message);

    let frames: Vec<String> = vm
        .last_error()
        .map(|error| error.trace().iter().map(ToString::to_string).collect())
        .unwrap_or_default();
    if !frames.is_empty() {
        vm.print_error("CALLSTACK");
        for frame in &frames {
            vm.print_error(frame);
        }
    }
    Ok(0)
}

/// Owner of one VM instance.
///
/// Call [`initialize`](Context::initialize) before exposing types or running
/// scripts. Dropping the context closes the VM, which releases every native
/// instance and delegate still alive in it.
pub struct Context {
    vm: RefCell<Vm>,
    host: Rc<HostBridge>,
    config: ContextConfig,
    initialized: Cell<bool>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_stack_size(stack_size: usize) -> Self {
        Self::with_config(ContextConfig::default().with_stack_size(stack_size))
    }

    pub fn with_config(config: ContextConfig) -> Self {
        let mut vm = Vm::open(config.stack_size);
        vm.set_max_call_depth(config.max_call_depth);
        vm.set_native_stack_limit(config.max_native_stack);

        let host = Rc::new(HostBridge::default());
        let bridge: Box<dyn Any> = Box::new(Rc::clone(&host));
        vm.registry_table().insert(
            Key::from(HOST_KEY),
            Value::UserData(Rc::new(UserData::new(bridge))),
        );

        Self {
            vm: RefCell::new(vm),
            host,
            config,
            initialized: Cell::new(false),
        }
    }

    /// Install the print, error and compiler hooks, register the standard
    /// libraries and create the class index. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.get() {
            return Ok(());
        }
        {
            let mut vm = self.vm.try_borrow_mut().map_err(|_| Error::ContextBusy)?;
            let mut vm = StackGuard::new(&mut vm);

            vm.set_print_func(Some(host_print), Some(host_print_error));
            vm.set_compiler_error_handler(Some(host_compiler_error));

            if self.config.register_std_libs {
                vm.push_root_table();
                register_mathlib(&mut vm)?;
                register_stringlib(&mut vm)?;
                vm.pop(1);
            }

            vm.new_closure(handle_runtime_error, 0)?;
            vm.set_native_closure_name(-1, "error_handler")?;
            vm.set_error_handler()?;
        }
        self.initialized.set(true);

        Table::create(self, CLASS_INDEX, TableDomain::Registry)?;
        debug!(
            "context initialized (stack {}, call depth {})",
            self.config.stack_size, self.config.max_call_depth
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Route script output to `interface`, replacing any previous one.
    pub fn set_interface(&self, interface: impl Interface + 'static) -> Result<()> {
        let mut slot = self
            .host
            .interface
            .try_borrow_mut()
            .map_err(|_| Error::ContextBusy)?;
        *slot = Some(Box::new(interface));
        Ok(())
    }

    /// Compile and run `source` against the root table.
    ///
    /// Compile and runtime errors are reported through the [`Interface`];
    /// the return value only says whether the buffer ran to completion.
    pub fn execute_buffer(&self, source: &str) -> bool {
        self.execute_buffer_named(source, &self.config.default_source_name)
    }

    /// [`execute_buffer`](Context::execute_buffer) with an explicit source
    /// name for error messages.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn execute_buffer_named(&self, source: &str, source_name: &str) -> bool {
        match self.run_buffer(source, source_name) {
            Ok(()) => true,
            Err(error) => {
                warn!("'{}' failed: {}", source_name, error);
                false
            }
        }
    }

    fn run_buffer(&self, source: &str, source_name: &str) -> Result<()> {
        let mut vm = self.vm()?;
        let mut vm = StackGuard::new(&mut vm);
        vm.compile_buffer(source, source_name, true)?;
        vm.push_root_table();
        vm.call(1, false, true)?;
        Ok(())
    }

    /// Direct access to the VM.
    ///
    /// Fails with [`Error::ContextBusy`] while a script is running, e.g. when
    /// called from inside a native method.
    pub fn vm(&self) -> Result<RefMut<'_, Vm>> {
        if !self.initialized.get() {
            return Err(Error::NotInitialized);
        }
        self.vm.try_borrow_mut().map_err(|_| Error::ContextBusy)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<String>>>);

    impl Capture {
        fn lines(&self) -> Vec<String> {
            self.0.borrow().clone()
        }
    }

    impl Interface for Capture {
        fn print(&mut self, message: &str) {
            self.0.borrow_mut().push(message.to_string());
        }
    }

    fn context_with_capture() -> (Context, Capture) {
        let context = Context::new();
        context.initialize().unwrap();
        let capture = Capture::default();
        context.set_interface(capture.clone()).unwrap();
        (context, capture)
    }

    #[test]
    fn context_new_is_uninitialized() {
        let context = Context::new();
        assert!(!context.is_initialized());
        assert!(matches!(context.vm(), Err(Error::NotInitialized)));
        assert!(!context.execute_buffer("print(1)"));
    }

    #[test]
    fn context_initialize_is_idempotent() {
        let context = Context::default();
        context.initialize().unwrap();
        context.initialize().unwrap();
        assert!(context.is_initialized());
        assert!(Table::get(&context, CLASS_INDEX, TableDomain::Registry).is_valid());
    }

    #[test]
    fn print_reaches_interface() {
        let (context, capture) = context_with_capture();
        assert!(context.execute_buffer("print(\"hi\")\nprint(1 + 2)"));
        assert_eq!(capture.lines(), vec!["hi", "3"]);
    }

    #[test]
    fn output_without_interface_is_dropped() {
        let context = Context::new();
        context.initialize().unwrap();
        assert!(context.execute_buffer("print(\"nobody listens\")"));
    }

    #[test]
    fn compile_error_is_reported() {
        let (context, capture) = context_with_capture();
        assert!(!context.execute_buffer_named("local = 1", "broken.nut"));
        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("compile error: broken.nut:1:"));
        assert!(lines[0].ends_with("expected 'IDENTIFIER'"));
    }

    #[test]
    fn runtime_error_prints_message_and_callstack() {
        let (context, capture) = context_with_capture();
        assert!(!context.execute_buffer_named(
            "function explode() { throw \"boom\" }\nexplode()",
            "boom.nut"
        ));
        let lines = capture.lines();
        assert_eq!(lines[0], "[boom]");
        assert_eq!(lines[1], "CALLSTACK");
        assert!(lines.len() > 2);
    }

    #[test]
    fn default_source_name_is_used() {
        let config = ContextConfig::default().with_default_source_name("init");
        let context = Context::with_config(config);
        context.initialize().unwrap();
        let capture = Capture::default();
        context.set_interface(capture.clone()).unwrap();
        assert!(!context.execute_buffer("}"));
        assert!(capture.lines()[0].starts_with("compile error: init:"));
    }

    #[test]
    fn std_libs_are_optional() {
        let context = Context::with_config(ContextConfig::default().with_std_libs(false));
        context.initialize().unwrap();
        assert!(!context.execute_buffer("sqrt(4)"));

        let (context, _) = context_with_capture();
        assert!(context.execute_buffer("sqrt(4)"));
    }

    #[test]
    fn call_depth_is_bounded() {
        let context = Context::with_config(ContextConfig::default().with_max_call_depth(16));
        context.initialize().unwrap();
        assert!(!context.execute_buffer("function f(n) { return f(n + 1) }\nf(0)"));
        assert!(
            context.execute_buffer("function g(n) { if (n > 0) return g(n - 1)\nreturn 0 }\ng(10)")
        );
    }

    #[test]
    fn runaway_recursion_fails_on_a_standard_thread() {
        let lines = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let (context, capture) = context_with_capture();
                assert!(!context.execute_buffer("function f(n) { return f(n + 1) }\nf(0)"));
                capture.lines()
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(lines[0], "[stack overflow]");
    }

    #[test]
    fn stack_is_balanced_after_execution() {
        let (context, _) = context_with_capture();
        let before = context.vm().unwrap().top();
        assert!(context.execute_buffer("local x = 1"));
        assert!(!context.execute_buffer("local y = undefined_name"));
        assert!(!context.execute_buffer("local ="));
        assert_eq!(context.vm().unwrap().top(), before);
    }

    #[test]
    fn interface_can_be_replaced() {
        let (context, first) = context_with_capture();
        let second = Capture::default();
        context.set_interface(second.clone()).unwrap();
        assert!(context.execute_buffer("print(\"x\")"));
        assert!(first.lines().is_empty());
        assert_eq!(second.lines(), vec!["x"]);
    }
}
