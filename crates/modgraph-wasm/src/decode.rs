//! Decoding a binary module into an executable form.
//!
//! The binary is validated with `wasmparser`, then each function body is
//! lowered into an owned instruction list whose structured control
//! instructions carry precomputed jump targets.

use thiserror::Error;
use tracing::debug;
use wasmparser::{BlockType, ExternalKind, Operator, Parser, Payload, TypeRef, Validator};

use crate::instr::{Instr, NumOp};
use crate::Val;

/// Errors produced while decoding a binary module
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Malformed or invalid binary
    #[error("invalid binary module: {0}")]
    Invalid(#[from] wasmparser::BinaryReaderError),

    /// Instruction outside the supported subset
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),

    /// Value type outside i32/i64/f32/f64
    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    /// Import of something other than a function
    #[error("unsupported {kind} import {module}.{name}")]
    UnsupportedImport {
        module: String,
        name: String,
        kind: &'static str,
    },

    /// Structural inconsistency not caught by validation
    #[error("malformed binary module: {0}")]
    Malformed(String),
}

/// Numeric value types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    fn from_wasm(ty: wasmparser::ValType) -> Result<Self, DecodeError> {
        match ty {
            wasmparser::ValType::I32 => Ok(ValType::I32),
            wasmparser::ValType::I64 => Ok(ValType::I64),
            wasmparser::ValType::F32 => Ok(ValType::F32),
            wasmparser::ValType::F64 => Ok(ValType::F64),
            other => Err(DecodeError::UnsupportedType(format!("{:?}", other))),
        }
    }

    /// Zero value of this type
    pub fn zero(self) -> Val {
        match self {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0.0),
            ValType::F64 => Val::F64(0.0),
        }
    }
}

/// Function signature
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

/// A function import
#[derive(Debug, Clone)]
pub struct Import {
    /// Import namespace (the module name)
    pub module: String,
    pub name: String,
    pub ty: FuncType,
}

/// Kind of an exported entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
    Tag,
}

/// An export entry
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// A module-defined global
#[derive(Debug, Clone)]
pub(crate) struct Global {
    pub mutable: bool,
    pub init: Val,
}

/// A module-defined function
#[derive(Debug, Clone)]
pub(crate) struct FunctionBody {
    pub type_index: u32,
    pub locals: Vec<ValType>,
    pub code: Vec<Instr>,
}

/// A decoded, validated binary module
#[derive(Debug, Clone, Default)]
pub struct BinaryModule {
    types: Vec<FuncType>,
    imports: Vec<Import>,
    pub(crate) functions: Vec<FunctionBody>,
    exports: Vec<Export>,
    pub(crate) globals: Vec<Global>,
    pub(crate) start: Option<u32>,
}

impl BinaryModule {
    /// Validate and decode a binary module
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Validator::new().validate_all(bytes)?;

        let mut module = BinaryModule::default();
        let mut function_types: Vec<u32> = Vec::new();
        let mut next_body = 0usize;

        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::TypeSection(reader) => {
                    for ty in reader.into_iter_err_on_gc_types() {
                        let ty = ty?;
                        module.types.push(FuncType {
                            params: ty
                                .params()
                                .iter()
                                .map(|t| ValType::from_wasm(*t))
                                .collect::<Result<_, _>>()?,
                            results: ty
                                .results()
                                .iter()
                                .map(|t| ValType::from_wasm(*t))
                                .collect::<Result<_, _>>()?,
                        });
                    }
                }
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import?;
                        let kind = match import.ty {
                            TypeRef::Func(type_index) => {
                                let ty = module.func_type_at(type_index)?.clone();
                                module.imports.push(Import {
                                    module: import.module.to_string(),
                                    name: import.name.to_string(),
                                    ty,
                                });
                                continue;
                            }
                            TypeRef::Table(_) => "table",
                            TypeRef::Memory(_) => "memory",
                            TypeRef::Global(_) => "global",
                            TypeRef::Tag(_) => "tag",
                        };
                        return Err(DecodeError::UnsupportedImport {
                            module: import.module.to_string(),
                            name: import.name.to_string(),
                            kind,
                        });
                    }
                }
                Payload::FunctionSection(reader) => {
                    for type_index in reader {
                        function_types.push(type_index?);
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        let global = global?;
                        let ty = ValType::from_wasm(global.ty.content_type)?;
                        let init = const_expr(&global.init_expr, ty)?;
                        module.globals.push(Global {
                            mutable: global.ty.mutable,
                            init,
                        });
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        let kind = match export.kind {
                            ExternalKind::Func => ExportKind::Func,
                            ExternalKind::Table => ExportKind::Table,
                            ExternalKind::Memory => ExportKind::Memory,
                            ExternalKind::Global => ExportKind::Global,
                            ExternalKind::Tag => ExportKind::Tag,
                        };
                        module.exports.push(Export {
                            name: export.name.to_string(),
                            kind,
                            index: export.index,
                        });
                    }
                }
                Payload::StartSection { func, .. } => module.start = Some(func),
                Payload::CodeSectionEntry(body) => {
                    let type_index = *function_types.get(next_body).ok_or_else(|| {
                        DecodeError::Malformed("code entry without function declaration".into())
                    })?;
                    next_body += 1;

                    let mut locals = Vec::new();
                    for entry in body.get_locals_reader()? {
                        let (count, ty) = entry?;
                        let ty = ValType::from_wasm(ty)?;
                        locals.extend(std::iter::repeat(ty).take(count as usize));
                    }

                    let mut operators = Vec::new();
                    for op in body.get_operators_reader()? {
                        operators.push(op?);
                    }
                    let code = lower(&operators, &module.types)?;
                    module.functions.push(FunctionBody {
                        type_index,
                        locals,
                        code,
                    });
                }
                _ => {}
            }
        }

        debug!(
            imports = module.imports.len(),
            functions = module.functions.len(),
            exports = module.exports.len(),
            "decoded binary module"
        );
        Ok(module)
    }

    fn func_type_at(&self, index: u32) -> Result<&FuncType, DecodeError> {
        self.types
            .get(index as usize)
            .ok_or_else(|| DecodeError::Malformed(format!("type index {} out of range", index)))
    }

    /// Function imports in declaration order
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// All exports in declaration order
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Signature of the function at `index` in the function index space
    /// (imports first, then module-defined functions)
    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let index = index as usize;
        if index < self.imports.len() {
            return Some(&self.imports[index].ty);
        }
        let body = self.functions.get(index - self.imports.len())?;
        self.types.get(body.type_index as usize)
    }

    /// Signature of an exported function
    pub fn export_func_type(&self, name: &str) -> Option<&FuncType> {
        let export = self
            .exports
            .iter()
            .find(|e| e.name == name && e.kind == ExportKind::Func)?;
        self.func_type(export.index)
    }
}

fn const_expr(expr: &wasmparser::ConstExpr<'_>, ty: ValType) -> Result<Val, DecodeError> {
    let mut reader = expr.get_operators_reader();
    let value = match reader.read()? {
        Operator::I32Const { value } => Val::I32(value),
        Operator::I64Const { value } => Val::I64(value),
        Operator::F32Const { value } => Val::F32(f32::from_bits(value.bits())),
        Operator::F64Const { value } => Val::F64(f64::from_bits(value.bits())),
        other => {
            return Err(DecodeError::UnsupportedInstruction(format!(
                "{:?} in constant expression",
                other
            )))
        }
    };
    if value.ty() != ty {
        return Err(DecodeError::Malformed("constant expression type mismatch".into()));
    }
    Ok(value)
}

fn block_arity(blockty: BlockType, types: &[FuncType]) -> Result<usize, DecodeError> {
    match blockty {
        BlockType::Empty => Ok(0),
        BlockType::Type(_) => Ok(1),
        BlockType::FuncType(index) => {
            let ty = types
                .get(index as usize)
                .ok_or_else(|| DecodeError::Malformed(format!("type index {} out of range", index)))?;
            if !ty.params.is_empty() {
                return Err(DecodeError::UnsupportedInstruction(
                    "block with parameters".into(),
                ));
            }
            Ok(ty.results.len())
        }
    }
}

/// Lower operators into instructions, patching block, if and else targets
fn lower(operators: &[Operator<'_>], types: &[FuncType]) -> Result<Vec<Instr>, DecodeError> {
    let mut code = Vec::with_capacity(operators.len());
    // Indices of open block/loop/if instructions
    let mut open: Vec<usize> = Vec::new();
    // Pending `else` index per open if
    let mut elses: Vec<Option<usize>> = Vec::new();

    for op in operators {
        let pc = code.len();
        let instr = match op {
            Operator::Unreachable => Instr::Unreachable,
            Operator::Nop => Instr::Nop,
            Operator::Block { blockty } => {
                open.push(pc);
                elses.push(None);
                Instr::Block {
                    end: 0,
                    arity: block_arity(*blockty, types)?,
                }
            }
            Operator::Loop { blockty } => {
                open.push(pc);
                elses.push(None);
                block_arity(*blockty, types)?;
                Instr::Loop
            }
            Operator::If { blockty } => {
                open.push(pc);
                elses.push(None);
                Instr::If {
                    else_at: None,
                    end: 0,
                    arity: block_arity(*blockty, types)?,
                }
            }
            Operator::Else => {
                let slot = elses
                    .last_mut()
                    .ok_or_else(|| DecodeError::Malformed("else outside if".into()))?;
                *slot = Some(pc);
                Instr::Else { end: 0 }
            }
            Operator::End => {
                if let Some(start) = open.pop() {
                    let else_at = elses.pop().flatten();
                    match &mut code[start] {
                        Instr::Block { end, .. } => *end = pc,
                        Instr::If {
                            end,
                            else_at: target,
                            ..
                        } => {
                            *end = pc;
                            *target = else_at;
                        }
                        _ => {}
                    }
                    if let Some(else_pc) = else_at {
                        if let Instr::Else { end } = &mut code[else_pc] {
                            *end = pc;
                        }
                    }
                }
                Instr::End
            }
            Operator::Br { relative_depth } => Instr::Br(*relative_depth),
            Operator::BrIf { relative_depth } => Instr::BrIf(*relative_depth),
            Operator::Return => Instr::Return,
            Operator::Call { function_index } => Instr::Call(*function_index),
            Operator::Drop => Instr::Drop,
            Operator::Select => Instr::Select,
            Operator::LocalGet { local_index } => Instr::LocalGet(*local_index),
            Operator::LocalSet { local_index } => Instr::LocalSet(*local_index),
            Operator::LocalTee { local_index } => Instr::LocalTee(*local_index),
            Operator::GlobalGet { global_index } => Instr::GlobalGet(*global_index),
            Operator::GlobalSet { global_index } => Instr::GlobalSet(*global_index),
            Operator::I32Const { value } => Instr::Const(Val::I32(*value)),
            Operator::I64Const { value } => Instr::Const(Val::I64(*value)),
            Operator::F32Const { value } => Instr::Const(Val::F32(f32::from_bits(value.bits()))),
            Operator::F64Const { value } => Instr::Const(Val::F64(f64::from_bits(value.bits()))),
            other => match NumOp::from_operator(other) {
                Some(num) => Instr::Num(num),
                None => return Err(DecodeError::UnsupportedInstruction(format!("{:?}", other))),
            },
        };
        code.push(instr);
    }

    Ok(code)
}
