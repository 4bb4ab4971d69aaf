//! Scoped stack discipline.

use std::ops::{Deref, DerefMut};

use log::trace;
use sqrew_vm::Vm;

/// Restores the VM stack height it captured when dropped.
///
/// Every exposition and table operation runs its stack work through a
/// guard, so an early `?` return cannot leave values behind.
pub struct StackGuard<'a> {
    vm: &'a mut Vm,
    top: usize,
}

impl<'a> StackGuard<'a> {
    pub fn new(vm: &'a mut Vm) -> Self {
        let top = vm.top();
        Self { vm, top }
    }
}

impl Deref for StackGuard<'_> {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        self.vm
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut Vm {
        self.vm
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        let top = self.vm.top();
        if top != self.top {
            trace!("stack guard restoring top {} -> {}", top, self.top);
            self.vm.set_top(self.top);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqrew_vm::VmResult;

    fn push_then_fail(vm: &mut Vm) -> VmResult<()> {
        let mut guard = StackGuard::new(vm);
        guard.push_integer(1);
        guard.push_integer(2);
        guard.get_string(-1)?;
        Ok(())
    }

    #[test]
    fn restores_on_scope_exit() {
        let mut vm = Vm::open(16);
        vm.push_null();
        {
            let mut guard = StackGuard::new(&mut vm);
            guard.new_table();
            guard.push_string("x");
            assert_eq!(guard.top(), 3);
        }
        assert_eq!(vm.top(), 1);
    }

    #[test]
    fn restores_on_early_error() {
        let mut vm = Vm::open(16);
        assert!(push_then_fail(&mut vm).is_err());
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn restores_after_pops() {
        let mut vm = Vm::open(16);
        vm.push_integer(1);
        vm.push_integer(2);
        {
            let mut guard = StackGuard::new(&mut vm);
            guard.pop(2);
        }
        assert_eq!(vm.top(), 2);
        assert!(vm.get_stack_object(2).unwrap().is_null());
    }
}
