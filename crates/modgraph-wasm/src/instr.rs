//! Lowered instruction set
//!
//! Control instructions carry the indices of their matching `else`/`end`
//! so execution never scans for block boundaries.

use wasmparser::Operator;

use crate::{Trap, Val};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Instr {
    Unreachable,
    Nop,
    Block { end: usize, arity: usize },
    Loop,
    If { else_at: Option<usize>, end: usize, arity: usize },
    Else { end: usize },
    End,
    Br(u32),
    BrIf(u32),
    Return,
    Call(u32),
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Const(Val),
    Num(NumOp),
}

/// Numeric operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumOp {
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I64Eqz,
    I64Eq,
    I64Ne,
    I64LtS,
    I64GtS,
    I64LeS,
    I64GeS,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64RemS,
    I64And,
    I64Or,
    I64Xor,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Neg,
    F64Sqrt,
    I32WrapI64,
    I64ExtendI32S,
    I64ExtendI32U,
    F64ConvertI32S,
    F64ConvertI64S,
    F64PromoteF32,
    F32DemoteF64,
    I32TruncF64S,
}

impl NumOp {
    pub(crate) fn from_operator(op: &Operator<'_>) -> Option<Self> {
        use NumOp::*;
        let num = match op {
            Operator::I32Eqz => I32Eqz,
            Operator::I32Eq => I32Eq,
            Operator::I32Ne => I32Ne,
            Operator::I32LtS => I32LtS,
            Operator::I32LtU => I32LtU,
            Operator::I32GtS => I32GtS,
            Operator::I32GtU => I32GtU,
            Operator::I32LeS => I32LeS,
            Operator::I32LeU => I32LeU,
            Operator::I32GeS => I32GeS,
            Operator::I32GeU => I32GeU,
            Operator::I32Add => I32Add,
            Operator::I32Sub => I32Sub,
            Operator::I32Mul => I32Mul,
            Operator::I32DivS => I32DivS,
            Operator::I32DivU => I32DivU,
            Operator::I32RemS => I32RemS,
            Operator::I32RemU => I32RemU,
            Operator::I32And => I32And,
            Operator::I32Or => I32Or,
            Operator::I32Xor => I32Xor,
            Operator::I32Shl => I32Shl,
            Operator::I32ShrS => I32ShrS,
            Operator::I32ShrU => I32ShrU,
            Operator::I64Eqz => I64Eqz,
            Operator::I64Eq => I64Eq,
            Operator::I64Ne => I64Ne,
            Operator::I64LtS => I64LtS,
            Operator::I64GtS => I64GtS,
            Operator::I64LeS => I64LeS,
            Operator::I64GeS => I64GeS,
            Operator::I64Add => I64Add,
            Operator::I64Sub => I64Sub,
            Operator::I64Mul => I64Mul,
            Operator::I64DivS => I64DivS,
            Operator::I64RemS => I64RemS,
            Operator::I64And => I64And,
            Operator::I64Or => I64Or,
            Operator::I64Xor => I64Xor,
            Operator::F32Add => F32Add,
            Operator::F32Sub => F32Sub,
            Operator::F32Mul => F32Mul,
            Operator::F32Div => F32Div,
            Operator::F64Eq => F64Eq,
            Operator::F64Ne => F64Ne,
            Operator::F64Lt => F64Lt,
            Operator::F64Gt => F64Gt,
            Operator::F64Le => F64Le,
            Operator::F64Ge => F64Ge,
            Operator::F64Add => F64Add,
            Operator::F64Sub => F64Sub,
            Operator::F64Mul => F64Mul,
            Operator::F64Div => F64Div,
            Operator::F64Neg => F64Neg,
            Operator::F64Sqrt => F64Sqrt,
            Operator::I32WrapI64 => I32WrapI64,
            Operator::I64ExtendI32S => I64ExtendI32S,
            Operator::I64ExtendI32U => I64ExtendI32U,
            Operator::F64ConvertI32S => F64ConvertI32S,
            Operator::F64ConvertI64S => F64ConvertI64S,
            Operator::F64PromoteF32 => F64PromoteF32,
            Operator::F32DemoteF64 => F32DemoteF64,
            Operator::I32TruncF64S => I32TruncF64S,
            _ => return None,
        };
        Some(num)
    }

    /// Apply the operator to the value stack
    pub(crate) fn apply(self, stack: &mut Vec<Val>) -> Result<(), Trap> {
        use NumOp::*;
        let result = match self {
            I32Eqz => Val::from(pop_i32(stack)? == 0),
            I64Eqz => Val::from(pop_i64(stack)? == 0),
            F64Neg => Val::F64(-pop_f64(stack)?),
            F64Sqrt => Val::F64(pop_f64(stack)?.sqrt()),
            I32WrapI64 => Val::I32(pop_i64(stack)? as i32),
            I64ExtendI32S => Val::I64(pop_i32(stack)? as i64),
            I64ExtendI32U => Val::I64(pop_i32(stack)? as u32 as i64),
            F64ConvertI32S => Val::F64(pop_i32(stack)? as f64),
            F64ConvertI64S => Val::F64(pop_i64(stack)? as f64),
            F64PromoteF32 => Val::F64(pop_f32(stack)? as f64),
            F32DemoteF64 => Val::F32(pop_f64(stack)? as f32),
            I32TruncF64S => {
                let v = pop_f64(stack)?;
                if v.is_nan() {
                    return Err(Trap::InvalidConversion);
                }
                let t = v.trunc();
                if t < i32::MIN as f64 || t > i32::MAX as f64 {
                    return Err(Trap::IntegerOverflow);
                }
                Val::I32(t as i32)
            }
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
            | I32GeU | I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU
            | I32And | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU => {
                let b = pop_i32(stack)?;
                let a = pop_i32(stack)?;
                i32_binary(self, a, b)?
            }
            I64Eq | I64Ne | I64LtS | I64GtS | I64LeS | I64GeS | I64Add | I64Sub | I64Mul
            | I64DivS | I64RemS | I64And | I64Or | I64Xor => {
                let b = pop_i64(stack)?;
                let a = pop_i64(stack)?;
                i64_binary(self, a, b)?
            }
            F32Add | F32Sub | F32Mul | F32Div => {
                let b = pop_f32(stack)?;
                let a = pop_f32(stack)?;
                Val::F32(match self {
                    F32Add => a + b,
                    F32Sub => a - b,
                    F32Mul => a * b,
                    _ => a / b,
                })
            }
            F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge | F64Add | F64Sub | F64Mul | F64Div => {
                let b = pop_f64(stack)?;
                let a = pop_f64(stack)?;
                match self {
                    F64Eq => Val::from(a == b),
                    F64Ne => Val::from(a != b),
                    F64Lt => Val::from(a < b),
                    F64Gt => Val::from(a > b),
                    F64Le => Val::from(a <= b),
                    F64Ge => Val::from(a >= b),
                    F64Add => Val::F64(a + b),
                    F64Sub => Val::F64(a - b),
                    F64Mul => Val::F64(a * b),
                    _ => Val::F64(a / b),
                }
            }
        };
        stack.push(result);
        Ok(())
    }
}

fn i32_binary(op: NumOp, a: i32, b: i32) -> Result<Val, Trap> {
    use NumOp::*;
    let (ua, ub) = (a as u32, b as u32);
    Ok(match op {
        I32Eq => Val::from(a == b),
        I32Ne => Val::from(a != b),
        I32LtS => Val::from(a < b),
        I32LtU => Val::from(ua < ub),
        I32GtS => Val::from(a > b),
        I32GtU => Val::from(ua > ub),
        I32LeS => Val::from(a <= b),
        I32LeU => Val::from(ua <= ub),
        I32GeS => Val::from(a >= b),
        I32GeU => Val::from(ua >= ub),
        I32Add => Val::I32(a.wrapping_add(b)),
        I32Sub => Val::I32(a.wrapping_sub(b)),
        I32Mul => Val::I32(a.wrapping_mul(b)),
        I32DivS => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            Val::I32(a.checked_div(b).ok_or(Trap::IntegerOverflow)?)
        }
        I32DivU => Val::I32(ua.checked_div(ub).ok_or(Trap::DivisionByZero)? as i32),
        I32RemS => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            Val::I32(a.wrapping_rem(b))
        }
        I32RemU => Val::I32(ua.checked_rem(ub).ok_or(Trap::DivisionByZero)? as i32),
        I32And => Val::I32(a & b),
        I32Or => Val::I32(a | b),
        I32Xor => Val::I32(a ^ b),
        I32Shl => Val::I32(a.wrapping_shl(ub)),
        I32ShrS => Val::I32(a.wrapping_shr(ub)),
        I32ShrU => Val::I32(ua.wrapping_shr(ub) as i32),
        _ => return Err(Trap::TypeMismatch),
    })
}

fn i64_binary(op: NumOp, a: i64, b: i64) -> Result<Val, Trap> {
    use NumOp::*;
    Ok(match op {
        I64Eq => Val::from(a == b),
        I64Ne => Val::from(a != b),
        I64LtS => Val::from(a < b),
        I64GtS => Val::from(a > b),
        I64LeS => Val::from(a <= b),
        I64GeS => Val::from(a >= b),
        I64Add => Val::I64(a.wrapping_add(b)),
        I64Sub => Val::I64(a.wrapping_sub(b)),
        I64Mul => Val::I64(a.wrapping_mul(b)),
        I64DivS => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            Val::I64(a.checked_div(b).ok_or(Trap::IntegerOverflow)?)
        }
        I64RemS => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            Val::I64(a.wrapping_rem(b))
        }
        I64And => Val::I64(a & b),
        I64Or => Val::I64(a | b),
        I64Xor => Val::I64(a ^ b),
        _ => return Err(Trap::TypeMismatch),
    })
}

pub(crate) fn pop(stack: &mut Vec<Val>) -> Result<Val, Trap> {
    stack.pop().ok_or(Trap::StackUnderflow)
}

pub(crate) fn pop_i32(stack: &mut Vec<Val>) -> Result<i32, Trap> {
    match pop(stack)? {
        Val::I32(v) => Ok(v),
        _ => Err(Trap::TypeMismatch),
    }
}

fn pop_i64(stack: &mut Vec<Val>) -> Result<i64, Trap> {
    match pop(stack)? {
        Val::I64(v) => Ok(v),
        _ => Err(Trap::TypeMismatch),
    }
}

fn pop_f32(stack: &mut Vec<Val>) -> Result<f32, Trap> {
    match pop(stack)? {
        Val::F32(v) => Ok(v),
        _ => Err(Trap::TypeMismatch),
    }
}

fn pop_f64(stack: &mut Vec<Val>) -> Result<f64, Trap> {
    match pop(stack)? {
        Val::F64(v) => Ok(v),
        _ => Err(Trap::TypeMismatch),
    }
}
