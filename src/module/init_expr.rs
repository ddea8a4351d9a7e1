//! Initializer expressions: a miniature stack machine evaluated at load
//! time to produce a single offset for data and element segment placement.
//!
//! There are no combining operators, so a well-formed expression is one
//! producing opcode with an optional terminating `END`. Two const-load
//! encodings exist in the wild: the short `0x01` form and the `LDC.I32.IMM`
//! form some encoders emit.

use crate::{Error, Value};
use core::ops::Range;

const OP_PUSH_I32: u8 = 0x01;
const OP_PUSH_GLOBAL: u8 = 0x02;
const OP_LDC_I32: u8 = 0x18;
const OP_END: u8 = 0x0F;

/// Finds the extent of the initializer expression starting at `start`.
///
/// Used by the parser to step over an expression without evaluating it.
pub(crate) fn skip_init_expr(bytes: &[u8], start: usize) -> Result<Range<usize>, Error> {
    let err = || Error::Format("truncated initializer expression".into());
    let mut pos = start;
    let op = *bytes.get(pos).ok_or_else(err)?;
    pos += 1;
    match op {
        OP_PUSH_I32 => {
            pos = pos.checked_add(4).filter(|&p| p <= bytes.len()).ok_or_else(err)?;
            if bytes.get(pos) == Some(&OP_END) {
                pos += 1;
            }
        }
        OP_PUSH_GLOBAL => {
            pos = pos.checked_add(4).filter(|&p| p <= bytes.len()).ok_or_else(err)?;
            if bytes.get(pos) == Some(&OP_END) {
                pos += 1;
            }
        }
        OP_LDC_I32 => {
            // rd byte, imm32, mandatory END.
            pos = pos.checked_add(5).filter(|&p| p <= bytes.len()).ok_or_else(err)?;
            if bytes.get(pos) != Some(&OP_END) {
                return Err(Error::Format(
                    "LDC.I32.IMM initializer not terminated by END".into(),
                ));
            }
            pos += 1;
        }
        other => {
            return Err(Error::Format(format!(
                "invalid initializer opcode {:#04x}",
                other
            )))
        }
    }
    Ok(start..pos)
}

/// Evaluates an initializer expression to a `u32` offset.
///
/// `global_value` resolves a global index to its current value; it is only
/// consulted for the `0x02` form. The evaluation stack must hold exactly one
/// I32/U32/PTR value afterwards.
pub(crate) fn eval_init_expr(
    expr: &[u8],
    global_value: &dyn Fn(u32) -> Option<Value>,
) -> Result<u32, Error> {
    let err = || Error::Format("truncated initializer expression".into());
    let op = *expr.first().ok_or_else(err)?;
    let result = match op {
        OP_PUSH_I32 => {
            let imm = expr.get(1..5).ok_or_else(err)?;
            Value::I32(i32::from_le_bytes(imm.try_into().unwrap()))
        }
        OP_PUSH_GLOBAL => {
            let idx_bytes = expr.get(1..5).ok_or_else(err)?;
            let idx = u32::from_le_bytes(idx_bytes.try_into().unwrap());
            global_value(idx).ok_or_else(|| {
                Error::Format(format!("initializer references unknown global {}", idx))
            })?
        }
        OP_LDC_I32 => {
            let imm = expr.get(2..6).ok_or_else(err)?;
            Value::I32(i32::from_le_bytes(imm.try_into().unwrap()))
        }
        other => {
            return Err(Error::Format(format!(
                "invalid initializer opcode {:#04x}",
                other
            )))
        }
    };

    match result {
        Value::I32(v) => Ok(v as u32),
        Value::U32(v) => Ok(v),
        Value::Ptr(v) => Ok(v as u32),
        other => Err(Error::Format(format!(
            "initializer evaluated to non-i32 value {:?}",
            other
        ))),
    }
}
