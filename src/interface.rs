//! Host callbacks for script output.

/// Receives what scripts print and the errors they raise.
///
/// Only [`print`](Interface::print) is required. Without an interface set on
/// the [`Context`](crate::Context) all output is dropped.
pub trait Interface {
    fn print(&mut self, message: &str);

    /// Runtime errors and `error()` output.
    fn print_error(&mut self, message: &str) {
        self.print(message);
    }

    fn handle_compiler_error(&mut self, error: &str, source: &str, line: u32, column: u32) {
        let message = format!("compile error: {}:{}:{}. {}", source, line, column, error);
        self.print_error(&message);
    }
}
