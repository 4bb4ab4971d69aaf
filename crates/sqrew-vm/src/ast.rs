//! Syntax tree produced by the parser and walked by the evaluator.

use std::rc::Rc;

/// A compiled function body.
#[derive(Debug)]
pub struct FunctionProto {
    /// Declared name, `"unknown"` for anonymous functions and `"main"` for
    /// the top level of a buffer.
    pub name: Rc<str>,
    pub params: Vec<Rc<str>>,
    pub body: Vec<Stmt>,
    /// Source name of the compiled buffer.
    pub source: Rc<str>,
    pub line: u32,
}

#[derive(Debug)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug)]
pub enum StmtKind {
    Expr(Expr),
    Local(Vec<(Rc<str>, Option<Expr>)>),
    Block(Vec<Stmt>),
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Throw(Expr),
    Try {
        body: Box<Stmt>,
        binding: Rc<str>,
        handler: Box<Stmt>,
    },
    Empty,
}

#[derive(Debug)]
pub enum Expr {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(Rc<str>),
    This,
    Ident(Rc<str>),
    /// `::name`
    Root(Rc<str>),
    Table(Vec<(Expr, Expr)>),
    Function(Rc<FunctionProto>),
    Member {
        object: Box<Expr>,
        name: Rc<str>,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary {
        condition: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        op: AssignOp,
        value: Box<Expr>,
    },
    /// `++x`, `x++`, `--x`, `x--`
    Increment {
        target: Box<Expr>,
        delta: i64,
        prefix: bool,
    },
}

impl Expr {
    /// Whether the expression can appear on the left of an assignment.
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Expr::Ident(_) | Expr::Root(_) | Expr::Member { .. } | Expr::Index { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`: the slot must already exist (locals are always assignable).
    Set,
    /// `<-`: create the slot.
    NewSlot,
    Compound(BinaryOp),
}
