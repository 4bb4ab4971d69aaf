//! Tree-walking evaluation of compiled script functions.
//!
//! Identifiers resolve to locals first, then the const table, then `this`,
//! then the root table. Script closures do not capture enclosing locals.

use std::rc::Rc;
use std::slice;

use crate::ast::{AssignOp, BinaryOp, Expr, Stmt, StmtKind, UnaryOp};
use crate::error::{TraceFrame, VmError, VmResult};
use crate::object::{Closure, ClosureRef};
use crate::value::{Key, Value};
use crate::vm::{Vm, key_of, missing_index};

/// Activation record of a running script function.
struct Frame {
    locals: Vec<(Rc<str>, Value)>,
    this: Value,
    /// Line of the statement being executed.
    line: u32,
}

impl Frame {
    fn find_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|(local, _)| &**local == name)
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// An assignable location, resolved once so compound assignments evaluate
/// their operands a single time.
enum Place {
    Local(usize),
    Variable(Rc<str>),
    Root(Rc<str>),
    Slot { object: Value, key: Value },
}

impl Vm {
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn call_closure(
        &mut self,
        closure: &ClosureRef,
        this: Value,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let proto = closure.proto.clone();
        if args.len() != proto.params.len() {
            return Err(VmError::new("wrong number of parameters"));
        }
        let mut frame = Frame {
            locals: proto.params.iter().cloned().zip(args).collect(),
            this,
            line: proto.line,
        };
        match self.exec_block(&proto.body, &mut frame) {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::Null),
            Err(mut error) => {
                error.push_frame(TraceFrame::script(
                    proto.name.as_ref(),
                    proto.source.as_ref(),
                    frame.line,
                ));
                Err(error)
            }
        }
    }

    // =========================================
    // Statements
    // =========================================

    /// Run statements in a new scope; locals declared inside are dropped on
    /// exit.
    fn exec_block(&mut self, stmts: &[Stmt], frame: &mut Frame) -> VmResult<Flow> {
        let mark = frame.locals.len();
        let result = self.exec_stmts(stmts, frame);
        frame.locals.truncate(mark);
        result
    }

    fn exec_stmts(&mut self, stmts: &[Stmt], frame: &mut Frame) -> VmResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt, frame)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, frame: &mut Frame) -> VmResult<Flow> {
        frame.line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, frame)?;
            }
            StmtKind::Local(bindings) => {
                for (name, init) in bindings {
                    let value = match init {
                        Some(expr) => self.eval(expr, frame)?,
                        None => Value::Null,
                    };
                    frame.locals.push((name.clone(), value));
                }
            }
            StmtKind::Block(body) => return self.exec_block(body, frame),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition, frame)?.is_truthy() {
                    return self.exec_block(slice::from_ref(&**then_branch), frame);
                } else if let Some(else_branch) = else_branch {
                    return self.exec_block(slice::from_ref(&**else_branch), frame);
                }
            }
            StmtKind::While { condition, body } => {
                while self.eval(condition, frame)?.is_truthy() {
                    match self.exec_block(slice::from_ref(&**body), frame)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For {
                init,
                condition,
                step,
                body,
            } => {
                let mark = frame.locals.len();
                let flow =
                    self.exec_for(init.as_deref(), condition.as_ref(), step.as_ref(), body, frame);
                frame.locals.truncate(mark);
                return flow;
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, frame)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Throw(expr) => {
                let value = self.eval(expr, frame)?;
                return Err(VmError::from_value(value));
            }
            StmtKind::Try {
                body,
                binding,
                handler,
            } => {
                let mark = frame.locals.len();
                match self.exec_block(slice::from_ref(&**body), frame) {
                    Ok(flow) => return Ok(flow),
                    Err(error) => {
                        frame.locals.truncate(mark);
                        frame.locals.push((binding.clone(), error.value().clone()));
                        let flow = self.exec_block(slice::from_ref(&**handler), frame);
                        frame.locals.truncate(mark);
                        return flow;
                    }
                }
            }
            StmtKind::Empty => {}
        }
        Ok(Flow::Normal)
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
        frame: &mut Frame,
    ) -> VmResult<Flow> {
        if let Some(init) = init {
            self.exec_stmt(init, frame)?;
        }
        loop {
            if let Some(condition) = condition {
                if !self.eval(condition, frame)?.is_truthy() {
                    break;
                }
            }
            match self.exec_block(slice::from_ref(body), frame)? {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
            if let Some(step) = step {
                self.eval(step, frame)?;
            }
        }
        Ok(Flow::Normal)
    }

    // =========================================
    // Expressions
    // =========================================

    fn eval(&mut self, expr: &Expr, frame: &mut Frame) -> VmResult<Value> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Integer(i) => Ok(Value::Integer(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::This => Ok(frame.this.clone()),
            Expr::Ident(name) => self.lookup(name, frame),
            Expr::Root(name) => {
                let key = Key::String(name.clone());
                self.root_table().get(&key).ok_or_else(|| missing_index(&key))
            }
            Expr::Table(fields) => {
                let table = self.create_table();
                for (key, value) in fields {
                    let key = self.eval(key, frame)?;
                    let value = self.eval(value, frame)?;
                    table.insert(key_of(&key)?, value);
                }
                Ok(Value::Table(table))
            }
            Expr::Function(proto) => Ok(Value::Closure(Rc::new(Closure::new(proto.clone())))),
            Expr::Member { object, name } => {
                let object = self.eval(object, frame)?;
                self.get_member(&object, &Value::String(name.clone()))
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, frame)?;
                let index = self.eval(index, frame)?;
                self.get_member(&object, &index)
            }
            Expr::Call { callee, args } => self.eval_call(callee, args, frame),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, frame)?;
                unary(*op, value)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, frame)?;
                let rhs = self.eval(rhs, frame)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::And(lhs, rhs) => {
                let lhs = self.eval(lhs, frame)?;
                if lhs.is_truthy() {
                    self.eval(rhs, frame)
                } else {
                    Ok(lhs)
                }
            }
            Expr::Or(lhs, rhs) => {
                let lhs = self.eval(lhs, frame)?;
                if lhs.is_truthy() {
                    Ok(lhs)
                } else {
                    self.eval(rhs, frame)
                }
            }
            Expr::Ternary {
                condition,
                then_value,
                else_value,
            } => {
                if self.eval(condition, frame)?.is_truthy() {
                    self.eval(then_value, frame)
                } else {
                    self.eval(else_value, frame)
                }
            }
            Expr::Assign { target, op, value } => {
                let place = self.place(target, frame)?;
                let value = match op {
                    AssignOp::Set | AssignOp::NewSlot => self.eval(value, frame)?,
                    AssignOp::Compound(op) => {
                        let current = self.read_place(&place, frame)?;
                        let rhs = self.eval(value, frame)?;
                        binary(*op, &current, &rhs)?
                    }
                };
                self.write_place(place, value.clone(), *op == AssignOp::NewSlot, frame)?;
                Ok(value)
            }
            Expr::Increment {
                target,
                delta,
                prefix,
            } => {
                let place = self.place(target, frame)?;
                let old = self.read_place(&place, frame)?;
                let new = binary(BinaryOp::Add, &old, &Value::Integer(*delta))?;
                self.write_place(place, new.clone(), false, frame)?;
                Ok(if *prefix { new } else { old })
            }
        }
    }

    /// Method calls bind `this` to the receiver; plain calls pass the
    /// caller's `this`.
    fn eval_call(&mut self, callee: &Expr, args: &[Expr], frame: &mut Frame) -> VmResult<Value> {
        let (function, this) = match callee {
            Expr::Member { object, name } => {
                let object = self.eval(object, frame)?;
                let function = self.get_member(&object, &Value::String(name.clone()))?;
                (function, object)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, frame)?;
                let index = self.eval(index, frame)?;
                let function = self.get_member(&object, &index)?;
                (function, object)
            }
            Expr::Root(_) => {
                let function = self.eval(callee, frame)?;
                (function, Value::Table(self.root_table().clone()))
            }
            _ => (self.eval(callee, frame)?, frame.this.clone()),
        };
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, frame)?);
        }
        self.call_value(&function, this, values)
    }

    // =========================================
    // Name resolution
    // =========================================

    fn lookup(&mut self, name: &Rc<str>, frame: &Frame) -> VmResult<Value> {
        if let Some(index) = frame.find_local(name) {
            return Ok(frame.locals[index].1.clone());
        }
        let key = Key::String(name.clone());
        if let Some(value) = self.const_table().get(&key) {
            return Ok(value);
        }
        let from_this = match &frame.this {
            Value::Table(table) => table.get(&key),
            Value::Class(class) => class.member(&key),
            Value::Instance(instance) => instance.class().member(&key),
            _ => None,
        };
        if let Some(value) = from_this {
            return Ok(value);
        }
        self.root_table()
            .get(&key)
            .ok_or_else(|| missing_index(&key))
    }

    fn place(&mut self, target: &Expr, frame: &mut Frame) -> VmResult<Place> {
        match target {
            Expr::Ident(name) => Ok(match frame.find_local(name) {
                Some(index) => Place::Local(index),
                None => Place::Variable(name.clone()),
            }),
            Expr::Root(name) => Ok(Place::Root(name.clone())),
            Expr::Member { object, name } => Ok(Place::Slot {
                object: self.eval(object, frame)?,
                key: Value::String(name.clone()),
            }),
            Expr::Index { object, index } => {
                let object = self.eval(object, frame)?;
                let key = self.eval(index, frame)?;
                Ok(Place::Slot { object, key })
            }
            _ => Err(VmError::new("can't assign expression")),
        }
    }

    fn read_place(&mut self, place: &Place, frame: &Frame) -> VmResult<Value> {
        match place {
            Place::Local(index) => Ok(frame.locals[*index].1.clone()),
            Place::Variable(name) => self.lookup(name, frame),
            Place::Root(name) => {
                let key = Key::String(name.clone());
                self.root_table().get(&key).ok_or_else(|| missing_index(&key))
            }
            Place::Slot { object, key } => self.get_member(object, key),
        }
    }

    fn write_place(
        &mut self,
        place: Place,
        value: Value,
        new_slot: bool,
        frame: &mut Frame,
    ) -> VmResult<()> {
        match place {
            Place::Local(index) => {
                frame.locals[index].1 = value;
                Ok(())
            }
            Place::Variable(name) => {
                let key = Value::String(name.clone());
                if new_slot {
                    let env = match &frame.this {
                        Value::Table(_) | Value::Class(_) => frame.this.clone(),
                        _ => Value::Table(self.root_table().clone()),
                    };
                    return self.set_member(&env, key, value, true);
                }
                let slot = Key::String(name);
                let env = match &frame.this {
                    Value::Table(table) if table.contains(&slot) => frame.this.clone(),
                    Value::Class(class) if class.has_member(&slot) => frame.this.clone(),
                    _ => Value::Table(self.root_table().clone()),
                };
                self.set_member(&env, key, value, false)
            }
            Place::Root(name) => {
                let root = Value::Table(self.root_table().clone());
                self.set_member(&root, Value::String(name), value, new_slot)
            }
            Place::Slot { object, key } => self.set_member(&object, key, value, new_slot),
        }
    }
}

// =========================================
// Operators
// =========================================

fn unary(op: UnaryOp, value: Value) -> VmResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Typeof => Ok(Value::from(value.type_name())),
        UnaryOp::Negate => match value {
            Value::Integer(i) => Ok(Value::Integer(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(VmError::new(format!(
                "attempt to negate a {}",
                other.type_name()
            ))),
        },
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    match op {
        BinaryOp::Equal => return Ok(Value::Bool(lhs.raw_equals(rhs))),
        BinaryOp::NotEqual => return Ok(Value::Bool(!lhs.raw_equals(rhs))),
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            return compare(op, lhs, rhs);
        }
        _ => {}
    }

    if op == BinaryOp::Add
        && (matches!(lhs, Value::String(_)) || matches!(rhs, Value::String(_)))
    {
        return Ok(Value::from(format!("{}{}", lhs, rhs)));
    }

    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => integer_arith(op, *a, *b),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let a = as_float(lhs);
            let b = as_float(rhs);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Mod => a % b,
                _ => unreachable!("comparison operators handled above"),
            };
            Ok(Value::Float(result))
        }
        _ => Err(VmError::new(format!(
            "arith op {} on between '{}' and '{}'",
            symbol(op),
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn integer_arith(op: BinaryOp, a: i64, b: i64) -> VmResult<Value> {
    let result = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div | BinaryOp::Mod if b == 0 => {
            return Err(VmError::new("division by zero"));
        }
        BinaryOp::Div => a.wrapping_div(b),
        BinaryOp::Mod => a.wrapping_rem(b),
        _ => unreachable!("comparison operators handled above"),
    };
    Ok(Value::Integer(result))
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            as_float(lhs).partial_cmp(&as_float(rhs))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(VmError::new(format!(
                "comparison between '{}' and '{}'",
                lhs.type_name(),
                rhs.type_name()
            )));
        }
    };
    let result = match ordering {
        None => false,
        Some(ordering) => match op {
            BinaryOp::Less => ordering == Ordering::Less,
            BinaryOp::LessEqual => ordering != Ordering::Greater,
            BinaryOp::Greater => ordering == Ordering::Greater,
            _ => ordering != Ordering::Less,
        },
    };
    Ok(Value::Bool(result))
}

fn as_float(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Equal => "==",
        BinaryOp::NotEqual => "!=",
        BinaryOp::Less => "<",
        BinaryOp::LessEqual => "<=",
        BinaryOp::Greater => ">",
        BinaryOp::GreaterEqual => ">=",
    }
}
