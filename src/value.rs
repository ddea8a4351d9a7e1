use crate::nan_preserving_float::{F32, F64};
use crate::TrapCode;
use num_enum::TryFromPrimitive;

/// Type tag of a [`Value`].
///
/// The numeric discriminants are the on-wire encoding used by the Types,
/// Globals and metadata sections.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum ValueType {
    /// 8-bit signed integer.
    I8 = 0,
    /// 8-bit unsigned integer.
    U8 = 1,
    /// 16-bit signed integer.
    I16 = 2,
    /// 16-bit unsigned integer.
    U16 = 3,
    /// 32-bit signed integer.
    I32 = 4,
    /// 32-bit unsigned integer.
    U32 = 5,
    /// 64-bit signed integer.
    I64 = 6,
    /// 64-bit unsigned integer.
    U64 = 7,
    /// 32-bit IEEE 754 floating point number.
    F32 = 8,
    /// 64-bit IEEE 754 floating point number.
    F64 = 9,
    /// Module-memory offset or host address.
    Ptr = 10,
    /// Boolean, stored as one byte.
    Bool = 11,
    /// 128-bit SIMD vector.
    V128 = 12,
    /// Index of a function local to the module.
    FuncIdx = 13,
    /// No value. Not a legal parameter or return element.
    Void = 14,
}

impl ValueType {
    /// Storage size in bytes, as laid out in globals and linear memory.
    pub fn size(self) -> usize {
        match self {
            ValueType::I8 | ValueType::U8 | ValueType::Bool => 1,
            ValueType::I16 | ValueType::U16 => 2,
            ValueType::I32 | ValueType::U32 | ValueType::F32 | ValueType::Ptr => 4,
            ValueType::I64 | ValueType::U64 | ValueType::F64 => 8,
            ValueType::V128 => 16,
            ValueType::FuncIdx => 4,
            ValueType::Void => 0,
        }
    }

    /// Natural alignment in bytes.
    pub fn alignment(self) -> usize {
        self.size().max(1)
    }

    /// Whether this is one of the integer tags (pointers and booleans are
    /// not integers).
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueType::I8
                | ValueType::U8
                | ValueType::I16
                | ValueType::U16
                | ValueType::I32
                | ValueType::U32
                | ValueType::I64
                | ValueType::U64
        )
    }

    /// Whether this is a signed integer tag.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ValueType::I8 | ValueType::I16 | ValueType::I32 | ValueType::I64
        )
    }

    /// Whether this is a float tag.
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }
}

/// Runtime representation of a value: a type tag plus a payload wide enough
/// for the widest scalar.
///
/// Unlike WebAssembly, integers carry their signedness and width in the tag;
/// respective operations trap with [`TrapCode::TypeMismatch`] when both
/// operands do not carry the same tag.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    /// 8-bit signed integer.
    I8(i8),
    /// 8-bit unsigned integer.
    U8(u8),
    /// 16-bit signed integer.
    I16(i16),
    /// 16-bit unsigned integer.
    U16(u16),
    /// 32-bit signed integer.
    I32(i32),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit signed integer.
    I64(i64),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 32-bit float.
    F32(F32),
    /// 64-bit float.
    F64(F64),
    /// Module-memory offset, tagged function reference, or a host address
    /// produced by the FFI layer. Stored zero-extended.
    Ptr(u64),
    /// Boolean.
    Bool(bool),
    /// 128-bit vector.
    V128([u8; 16]),
    /// Module-local function index.
    FuncIdx(u32),
}

/// Trait for creating a native value from a [`Value`].
///
/// Returns `None` if the [`Value`] carries a tag different from the one the
/// conversion expects.
pub trait FromValue
where
    Self: Sized,
{
    /// Create a value of type `Self` from a given [`Value`].
    fn from_value(val: Value) -> Option<Self>;
}

/// Convert from and to little endian.
pub trait LittleEndianConvert
where
    Self: Sized,
{
    /// Convert to little endian buffer.
    fn into_little_endian(self, buffer: &mut [u8]);
    /// Convert from little endian buffer.
    fn from_little_endian(buffer: &[u8]) -> Self;
}

macro_rules! impl_little_endian_convert {
    ($($t:ty),*) => {
        $(
            impl LittleEndianConvert for $t {
                fn into_little_endian(self, buffer: &mut [u8]) {
                    buffer.copy_from_slice(&self.to_le_bytes());
                }

                fn from_little_endian(buffer: &[u8]) -> Self {
                    let mut bytes = [0u8; core::mem::size_of::<$t>()];
                    bytes.copy_from_slice(buffer);
                    Self::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_little_endian_convert!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

impl Value {
    /// Creates the zero value of the given type.
    ///
    /// # Panics
    ///
    /// Panics if `value_type` is [`ValueType::Void`], which has no values.
    pub fn default_of(value_type: ValueType) -> Value {
        match value_type {
            ValueType::I8 => Value::I8(0),
            ValueType::U8 => Value::U8(0),
            ValueType::I16 => Value::I16(0),
            ValueType::U16 => Value::U16(0),
            ValueType::I32 => Value::I32(0),
            ValueType::U32 => Value::U32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::U64 => Value::U64(0),
            ValueType::F32 => Value::F32(F32::from_bits(0)),
            ValueType::F64 => Value::F64(F64::from_bits(0)),
            ValueType::Ptr => Value::Ptr(0),
            ValueType::Bool => Value::Bool(false),
            ValueType::V128 => Value::V128([0; 16]),
            ValueType::FuncIdx => Value::FuncIdx(0),
            ValueType::Void => panic!("Void has no values"),
        }
    }

    /// Get the type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match *self {
            Value::I8(_) => ValueType::I8,
            Value::U8(_) => ValueType::U8,
            Value::I16(_) => ValueType::I16,
            Value::U16(_) => ValueType::U16,
            Value::I32(_) => ValueType::I32,
            Value::U32(_) => ValueType::U32,
            Value::I64(_) => ValueType::I64,
            Value::U64(_) => ValueType::U64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Ptr(_) => ValueType::Ptr,
            Value::Bool(_) => ValueType::Bool,
            Value::V128(_) => ValueType::V128,
            Value::FuncIdx(_) => ValueType::FuncIdx,
        }
    }

    /// Raw payload, zero-extended from its natural width.
    ///
    /// # Panics
    ///
    /// Panics for [`Value::V128`], which does not fit 64 bits; vector values
    /// never flow through the scalar paths that call this.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Value::I8(v) => v as u8 as u64,
            Value::U8(v) => v as u64,
            Value::I16(v) => v as u16 as u64,
            Value::U16(v) => v as u64,
            Value::I32(v) => v as u32 as u64,
            Value::U32(v) => v as u64,
            Value::I64(v) => v as u64,
            Value::U64(v) => v,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
            Value::Ptr(v) => v,
            Value::Bool(v) => v as u64,
            Value::V128(_) => panic!("V128 payload does not fit 64 bits"),
            Value::FuncIdx(v) => v as u64,
        }
    }

    /// Reconstructs a value of type `ty` from a raw payload, truncating to
    /// the type's width.
    pub fn from_bits(ty: ValueType, bits: u64) -> Value {
        match ty {
            ValueType::I8 => Value::I8(bits as i8),
            ValueType::U8 => Value::U8(bits as u8),
            ValueType::I16 => Value::I16(bits as i16),
            ValueType::U16 => Value::U16(bits as u16),
            ValueType::I32 => Value::I32(bits as i32),
            ValueType::U32 => Value::U32(bits as u32),
            ValueType::I64 => Value::I64(bits as i64),
            ValueType::U64 => Value::U64(bits),
            ValueType::F32 => Value::F32(F32::from_bits(bits as u32)),
            ValueType::F64 => Value::F64(F64::from_bits(bits)),
            ValueType::Ptr => Value::Ptr(bits),
            ValueType::Bool => Value::Bool(bits != 0),
            ValueType::V128 => {
                let mut v = [0u8; 16];
                v[..8].copy_from_slice(&bits.to_le_bytes());
                Value::V128(v)
            }
            ValueType::FuncIdx => Value::FuncIdx(bits as u32),
            ValueType::Void => panic!("Void has no values"),
        }
    }

    /// Reads a value of type `ty` from a little-endian byte slice of exactly
    /// `ty.size()` bytes.
    pub fn from_le_slice(ty: ValueType, bytes: &[u8]) -> Value {
        debug_assert_eq!(bytes.len(), ty.size());
        if ty == ValueType::V128 {
            let mut v = [0u8; 16];
            v.copy_from_slice(bytes);
            return Value::V128(v);
        }
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        let mut bits = u64::from_le_bytes(raw);
        // Narrow signed reads sign-extend into the payload.
        if ty.is_signed() {
            let width = ty.size() * 8;
            if width < 64 {
                let shift = 64 - width;
                bits = (((bits << shift) as i64) >> shift) as u64;
            }
        }
        Value::from_bits(ty, bits)
    }

    /// Writes this value little-endian into a slice of exactly
    /// `self.value_type().size()` bytes.
    pub fn write_le(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.value_type().size());
        if let Value::V128(v) = self {
            out.copy_from_slice(v);
            return;
        }
        let bits = self.to_bits().to_le_bytes();
        out.copy_from_slice(&bits[..out.len()]);
    }

    /// Branch-condition view: nonzero integers, pointers, function indices
    /// and `true` are truthy; floats compare against positive zero.
    pub fn is_truthy(&self) -> bool {
        match *self {
            Value::F32(v) => v.to_float() != 0.0,
            Value::F64(v) => v.to_float() != 0.0,
            Value::V128(v) => v != [0; 16],
            ref other => other.to_bits() != 0,
        }
    }

    /// Returns `T` if this particular [`Value`] contains the appropriate
    /// type. See [`FromValue`] for details.
    pub fn try_into<T: FromValue>(self) -> Option<T> {
        FromValue::from_value(self)
    }
}

macro_rules! impl_from_primitive {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl From<$t> for Value {
                fn from(val: $t) -> Self {
                    Value::$variant(val)
                }
            }
        )*
    };
}

impl_from_primitive!(
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32,
    i64 => I64, u64 => U64, bool => Bool, F32 => F32, F64 => F64
);

impl From<f32> for Value {
    fn from(val: f32) -> Self {
        Value::F32(val.into())
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Self {
        Value::F64(val.into())
    }
}

macro_rules! impl_from_value {
    ($($variant:ident => $t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(val: Value) -> Option<Self> {
                    match val {
                        Value::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_from_value!(
    I8 => i8, U8 => u8, I16 => i16, U16 => u16, I32 => i32, U32 => u32,
    I64 => i64, U64 => u64, Bool => bool
);

impl FromValue for f32 {
    fn from_value(val: Value) -> Option<Self> {
        match val {
            Value::F32(v) => Some(v.to_float()),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(val: Value) -> Option<Self> {
        match val {
            Value::F64(v) => Some(v.to_float()),
            _ => None,
        }
    }
}

/// Arithmetic operations.
pub trait ArithmeticOps<T> {
    /// Add two values.
    fn add(self, other: T) -> T;
    /// Subtract two values.
    fn sub(self, other: T) -> T;
    /// Multiply two values.
    fn mul(self, other: T) -> T;
    /// Divide two values.
    fn div(self, other: T) -> Result<T, TrapCode>;
}

/// Integer value.
pub trait Integer<T>: ArithmeticOps<T> {
    /// Get division remainder.
    fn rem(self, other: T) -> Result<T, TrapCode>;
}

macro_rules! impl_integer_arithmetic_ops {
    ($($t:ty),*) => {
        $(
            impl ArithmeticOps<$t> for $t {
                fn add(self, other: $t) -> $t {
                    self.wrapping_add(other)
                }
                fn sub(self, other: $t) -> $t {
                    self.wrapping_sub(other)
                }
                fn mul(self, other: $t) -> $t {
                    self.wrapping_mul(other)
                }
                fn div(self, other: $t) -> Result<$t, TrapCode> {
                    if other == 0 {
                        return Err(TrapCode::DivisionByZero);
                    }
                    let (result, overflow) = self.overflowing_div(other);
                    if overflow {
                        return Err(TrapCode::IntegerOverflow);
                    }
                    Ok(result)
                }
            }

            impl Integer<$t> for $t {
                fn rem(self, other: $t) -> Result<$t, TrapCode> {
                    if other == 0 {
                        return Err(TrapCode::DivisionByZero);
                    }
                    Ok(self.wrapping_rem(other))
                }
            }
        )*
    };
}

impl_integer_arithmetic_ops!(i8, u8, i16, u16, i32, u32, i64, u64);

macro_rules! impl_float_arithmetic_ops {
    ($($t:ty),*) => {
        $(
            impl ArithmeticOps<$t> for $t {
                fn add(self, other: $t) -> $t {
                    self + other
                }
                fn sub(self, other: $t) -> $t {
                    self - other
                }
                fn mul(self, other: $t) -> $t {
                    self * other
                }
                fn div(self, other: $t) -> Result<$t, TrapCode> {
                    Ok(self / other)
                }
            }
        )*
    };
}

impl_float_arithmetic_ops!(F32, F64);

macro_rules! value_arith {
    ($name:ident) => {
        /// Tag-preserving arithmetic; both operands must carry the same tag.
        pub fn $name(self, rhs: Value) -> Result<Value, TrapCode> {
            use Value::*;
            match (self, rhs) {
                (I8(a), I8(b)) => Ok(I8(ArithmeticOps::$name(a, b))),
                (U8(a), U8(b)) => Ok(U8(ArithmeticOps::$name(a, b))),
                (I16(a), I16(b)) => Ok(I16(ArithmeticOps::$name(a, b))),
                (U16(a), U16(b)) => Ok(U16(ArithmeticOps::$name(a, b))),
                (I32(a), I32(b)) => Ok(I32(ArithmeticOps::$name(a, b))),
                (U32(a), U32(b)) => Ok(U32(ArithmeticOps::$name(a, b))),
                (I64(a), I64(b)) => Ok(I64(ArithmeticOps::$name(a, b))),
                (U64(a), U64(b)) => Ok(U64(ArithmeticOps::$name(a, b))),
                (F32(a), F32(b)) => Ok(F32(ArithmeticOps::$name(a, b))),
                (F64(a), F64(b)) => Ok(F64(ArithmeticOps::$name(a, b))),
                (Ptr(a), Ptr(b)) => Ok(Ptr(ArithmeticOps::$name(a, b))),
                _ => Err(TrapCode::TypeMismatch),
            }
        }
    };
}

macro_rules! value_div {
    () => {
        /// Tag-preserving division; integer dividers trap on zero and on
        /// signed overflow, float division follows IEEE semantics.
        pub fn div(self, rhs: Value) -> Result<Value, TrapCode> {
            use Value::*;
            match (self, rhs) {
                (I8(a), I8(b)) => Ok(I8(ArithmeticOps::div(a, b)?)),
                (U8(a), U8(b)) => Ok(U8(ArithmeticOps::div(a, b)?)),
                (I16(a), I16(b)) => Ok(I16(ArithmeticOps::div(a, b)?)),
                (U16(a), U16(b)) => Ok(U16(ArithmeticOps::div(a, b)?)),
                (I32(a), I32(b)) => Ok(I32(ArithmeticOps::div(a, b)?)),
                (U32(a), U32(b)) => Ok(U32(ArithmeticOps::div(a, b)?)),
                (I64(a), I64(b)) => Ok(I64(ArithmeticOps::div(a, b)?)),
                (U64(a), U64(b)) => Ok(U64(ArithmeticOps::div(a, b)?)),
                (F32(a), F32(b)) => Ok(F32(ArithmeticOps::div(a, b)?)),
                (F64(a), F64(b)) => Ok(F64(ArithmeticOps::div(a, b)?)),
                _ => Err(TrapCode::TypeMismatch),
            }
        }

        /// Tag-preserving remainder on integer tags.
        pub fn rem(self, rhs: Value) -> Result<Value, TrapCode> {
            use Value::*;
            match (self, rhs) {
                (I8(a), I8(b)) => Ok(I8(Integer::rem(a, b)?)),
                (U8(a), U8(b)) => Ok(U8(Integer::rem(a, b)?)),
                (I16(a), I16(b)) => Ok(I16(Integer::rem(a, b)?)),
                (U16(a), U16(b)) => Ok(U16(Integer::rem(a, b)?)),
                (I32(a), I32(b)) => Ok(I32(Integer::rem(a, b)?)),
                (U32(a), U32(b)) => Ok(U32(Integer::rem(a, b)?)),
                (I64(a), I64(b)) => Ok(I64(Integer::rem(a, b)?)),
                (U64(a), U64(b)) => Ok(U64(Integer::rem(a, b)?)),
                _ => Err(TrapCode::TypeMismatch),
            }
        }
    };
}

macro_rules! value_bitop {
    ($name:ident, $op:tt) => {
        /// Tag-preserving bitwise operation on integers and booleans.
        pub fn $name(self, rhs: Value) -> Result<Value, TrapCode> {
            use Value::*;
            match (self, rhs) {
                (I8(a), I8(b)) => Ok(I8(a $op b)),
                (U8(a), U8(b)) => Ok(U8(a $op b)),
                (I16(a), I16(b)) => Ok(I16(a $op b)),
                (U16(a), U16(b)) => Ok(U16(a $op b)),
                (I32(a), I32(b)) => Ok(I32(a $op b)),
                (U32(a), U32(b)) => Ok(U32(a $op b)),
                (I64(a), I64(b)) => Ok(I64(a $op b)),
                (U64(a), U64(b)) => Ok(U64(a $op b)),
                (Bool(a), Bool(b)) => Ok(Bool(a $op b)),
                _ => Err(TrapCode::TypeMismatch),
            }
        }
    };
}

macro_rules! value_shift {
    ($name:ident, $method:ident) => {
        /// Tag-preserving shift; the amount is masked by the operand width.
        pub fn $name(self, rhs: Value) -> Result<Value, TrapCode> {
            use Value::*;
            let amount = (rhs.value_type().is_integer())
                .then(|| rhs.to_bits() as u32)
                .ok_or(TrapCode::TypeMismatch)?;
            match self {
                I8(a) => Ok(I8(a.$method(amount % 8))),
                U8(a) => Ok(U8(a.$method(amount % 8))),
                I16(a) => Ok(I16(a.$method(amount % 16))),
                U16(a) => Ok(U16(a.$method(amount % 16))),
                I32(a) => Ok(I32(a.$method(amount % 32))),
                U32(a) => Ok(U32(a.$method(amount % 32))),
                I64(a) => Ok(I64(a.$method(amount % 64))),
                U64(a) => Ok(U64(a.$method(amount % 64))),
                _ => Err(TrapCode::TypeMismatch),
            }
        }
    };
}

macro_rules! value_compare {
    ($name:ident, $op:tt) => {
        /// Tag-checked ordered comparison producing a [`Value::Bool`].
        pub fn $name(self, rhs: Value) -> Result<Value, TrapCode> {
            use Value::*;
            match (self, rhs) {
                (I8(a), I8(b)) => Ok(Bool(a $op b)),
                (U8(a), U8(b)) => Ok(Bool(a $op b)),
                (I16(a), I16(b)) => Ok(Bool(a $op b)),
                (U16(a), U16(b)) => Ok(Bool(a $op b)),
                (I32(a), I32(b)) => Ok(Bool(a $op b)),
                (U32(a), U32(b)) => Ok(Bool(a $op b)),
                (I64(a), I64(b)) => Ok(Bool(a $op b)),
                (U64(a), U64(b)) => Ok(Bool(a $op b)),
                (F32(a), F32(b)) => Ok(Bool(a.to_float() $op b.to_float())),
                (F64(a), F64(b)) => Ok(Bool(a.to_float() $op b.to_float())),
                (Ptr(a), Ptr(b)) => Ok(Bool(a $op b)),
                _ => Err(TrapCode::TypeMismatch),
            }
        }
    };
}

impl Value {
    value_arith!(add);
    value_arith!(sub);
    value_arith!(mul);
    value_div!();

    value_bitop!(bitand, &);
    value_bitop!(bitor, |);
    value_bitop!(bitxor, ^);

    value_shift!(shl, wrapping_shl);
    value_shift!(shr, wrapping_shr);

    value_compare!(lt, <);
    value_compare!(gt, >);
    value_compare!(le, <=);
    value_compare!(ge, >=);

    /// Equality comparison producing a [`Value::Bool`].
    ///
    /// Floats compare by IEEE semantics (NaN is not equal to itself); all
    /// other tags compare by payload.
    pub fn val_eq(self, rhs: Value) -> Result<Value, TrapCode> {
        use Value::*;
        match (self, rhs) {
            (F32(a), F32(b)) => Ok(Bool(a.to_float() == b.to_float())),
            (F64(a), F64(b)) => Ok(Bool(a.to_float() == b.to_float())),
            (V128(a), V128(b)) => Ok(Bool(a == b)),
            (a, b) if a.value_type() == b.value_type() => Ok(Bool(a.to_bits() == b.to_bits())),
            _ => Err(TrapCode::TypeMismatch),
        }
    }

    /// Inequality comparison producing a [`Value::Bool`].
    pub fn val_ne(self, rhs: Value) -> Result<Value, TrapCode> {
        match self.val_eq(rhs)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            _ => unreachable!(),
        }
    }

    /// Arithmetic negation. Unsigned tags reject negation.
    pub fn neg(self) -> Result<Value, TrapCode> {
        use Value::*;
        match self {
            I8(a) => Ok(I8(a.wrapping_neg())),
            I16(a) => Ok(I16(a.wrapping_neg())),
            I32(a) => Ok(I32(a.wrapping_neg())),
            I64(a) => Ok(I64(a.wrapping_neg())),
            F32(a) => Ok(F32(-a)),
            F64(a) => Ok(F64(-a)),
            _ => Err(TrapCode::TypeMismatch),
        }
    }

    /// Tests for zero, producing a [`Value::Bool`].
    pub fn eqz(self) -> Result<Value, TrapCode> {
        use Value::*;
        match self {
            F32(_) | F64(_) | V128(_) => Err(TrapCode::TypeMismatch),
            other => Ok(Bool(other.to_bits() == 0)),
        }
    }

    /// Bitwise complement on integers, logical negation on booleans.
    pub fn not(self) -> Result<Value, TrapCode> {
        use Value::*;
        match self {
            I8(a) => Ok(I8(!a)),
            U8(a) => Ok(U8(!a)),
            I16(a) => Ok(I16(!a)),
            U16(a) => Ok(U16(!a)),
            I32(a) => Ok(I32(!a)),
            U32(a) => Ok(U32(!a)),
            I64(a) => Ok(I64(!a)),
            U64(a) => Ok(U64(!a)),
            Bool(a) => Ok(Bool(!a)),
            _ => Err(TrapCode::TypeMismatch),
        }
    }

    /// Widened signed view of the payload, honoring the tag's signedness.
    fn as_i128(&self) -> Result<i128, TrapCode> {
        use Value::*;
        Ok(match *self {
            I8(v) => v as i128,
            U8(v) => v as i128,
            I16(v) => v as i128,
            U16(v) => v as i128,
            I32(v) => v as i128,
            U32(v) => v as i128,
            I64(v) => v as i128,
            U64(v) => v as i128,
            Ptr(v) => v as i128,
            Bool(v) => v as i128,
            FuncIdx(v) => v as i128,
            F32(_) | F64(_) | V128(_) => return Err(TrapCode::TypeMismatch),
        })
    }

    /// Converts this value to the target type.
    ///
    /// Integer-to-integer conversions truncate or sign/zero-extend following
    /// the source signedness; float-to-integer conversions truncate toward
    /// zero and trap with [`TrapCode::IntegerOverflow`] when the result does
    /// not fit; integer-to-float conversions round to nearest.
    pub fn convert(self, to: ValueType) -> Result<Value, TrapCode> {
        use Value::*;

        if self.value_type() == to {
            return Ok(self);
        }

        match (self, to) {
            // Float-to-float.
            (F32(v), ValueType::F64) => Ok(F64((v.to_float() as f64).into())),
            (F64(v), ValueType::F32) => Ok(F32((v.to_float() as f32).into())),

            // Float-to-integer, truncating, trapping when out of range.
            (F32(v), ty) => float_to_int(v.to_float().trunc() as f64, ty),
            (F64(v), ty) => float_to_int(v.to_float().trunc(), ty),

            // Integer-to-float.
            (v, ValueType::F32) => {
                let wide = v.as_i128()?;
                Ok(F32((wide as f32).into()))
            }
            (v, ValueType::F64) => {
                let wide = v.as_i128()?;
                Ok(F64((wide as f64).into()))
            }

            // Integer/pointer/boolean to integer-like: widen with the source
            // signedness, then truncate to the destination width.
            (v, ty) => {
                let wide = v.as_i128()?;
                Ok(match ty {
                    ValueType::I8 => I8(wide as i8),
                    ValueType::U8 => U8(wide as u8),
                    ValueType::I16 => I16(wide as i16),
                    ValueType::U16 => U16(wide as u16),
                    ValueType::I32 => I32(wide as i32),
                    ValueType::U32 => U32(wide as u32),
                    ValueType::I64 => I64(wide as i64),
                    ValueType::U64 => U64(wide as u64),
                    ValueType::Ptr => Ptr(wide as u32 as u64),
                    ValueType::Bool => Bool(wide != 0),
                    ValueType::FuncIdx => FuncIdx(wide as u32),
                    _ => return Err(TrapCode::TypeMismatch),
                })
            }
        }
    }
}

fn float_to_int(t: f64, ty: ValueType) -> Result<Value, TrapCode> {
    use num_traits::cast::ToPrimitive;
    use Value::*;
    if t.is_nan() {
        return Err(TrapCode::IntegerOverflow);
    }
    Ok(match ty {
        ValueType::I8 => I8(t.to_i8().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::U8 => U8(t.to_u8().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::I16 => I16(t.to_i16().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::U16 => U16(t.to_u16().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::I32 => I32(t.to_i32().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::U32 => U32(t.to_u32().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::I64 => I64(t.to_i64().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::U64 => U64(t.to_u64().ok_or(TrapCode::IntegerOverflow)?),
        ValueType::Ptr => Ptr(t.to_u32().ok_or(TrapCode::IntegerOverflow)? as u64),
        _ => return Err(TrapCode::TypeMismatch),
    })
}
