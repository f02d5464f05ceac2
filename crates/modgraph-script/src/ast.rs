//! Abstract syntax tree for module script source.
//!
//! A parsed [`Program`] is a flat list of module items: import declarations,
//! export declarations and ordinary statements, in source order.

use std::rc::Rc;

use crate::lexer::Span;

/// Root node: one module's source text
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Top-level items in source order
    pub items: Vec<ModuleItem>,
}

/// Top-level module item
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleItem {
    Import(ImportDecl),
    Export(ExportDecl),
    Stmt(Stmt),
}

/// `import ... from "specifier"` or `import "specifier"`
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    /// Module specifier string
    pub specifier: String,
    /// Local name of the default import, if any
    pub default: Option<String>,
    /// Local name of a namespace import (`* as ns`), if any
    pub namespace: Option<String>,
    /// Named imports (`{ a, b as c }`)
    pub named: Vec<ImportSpecifier>,
    pub span: Span,
}

/// One `imported as local` pair inside braces
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSpecifier {
    pub imported: String,
    pub local: String,
}

/// Export declaration forms
#[derive(Debug, Clone, PartialEq)]
pub enum ExportDecl {
    /// `export const|let ...` or `export function ...`
    Declaration(Stmt),

    /// `export default function [name](...) {}`
    DefaultFunction(Rc<FunctionDecl>),

    /// `export default <expr>`
    DefaultExpr(Expr),

    /// `export { a, b as c } [from "specifier"]`
    Named {
        specifiers: Vec<ExportSpecifier>,
        from: Option<String>,
        span: Span,
    },
}

/// One `local as exported` pair inside export braces
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSpecifier {
    pub local: String,
    pub exported: String,
}

/// Variable declaration kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Const,
    Let,
}

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `const a = 1, b = 2;`
    VarDecl {
        kind: VarKind,
        declarations: Vec<(String, Option<Expr>)>,
    },

    /// Hoisted function declaration
    Function(Rc<FunctionDecl>),

    If {
        test: Expr,
        consequent: Box<Stmt>,
        alternate: Option<Box<Stmt>>,
    },

    While {
        test: Expr,
        body: Box<Stmt>,
    },

    Block(Vec<Stmt>),

    Return(Option<Expr>),

    Throw(Expr),

    Expr(Expr),

    Empty,
}

impl Stmt {
    /// Names bound by this statement in its enclosing scope
    pub fn declared_names(&self) -> Vec<String> {
        match self {
            Stmt::VarDecl { declarations, .. } => {
                declarations.iter().map(|(name, _)| name.clone()).collect()
            }
            Stmt::Function(func) => func.name.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

/// Function declaration or expression
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
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
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Equal,
    NotEqual,
    StrictEqual,
    StrictNotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    String(Rc<str>),
    Bool(bool),
    Null,
    Undefined,

    Ident(String),

    Array(Vec<Expr>),

    /// Object literal with keys in source order
    Object(Vec<(String, Expr)>),

    /// `object.property`
    Member {
        object: Box<Expr>,
        property: String,
    },

    /// `object[index]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },

    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `target = value`; the target is an identifier, member or index expression
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Function(Rc<FunctionDecl>),

    /// `import.meta`
    ImportMeta,

    /// `import(specifier)`
    DynamicImport(Box<Expr>),
}
