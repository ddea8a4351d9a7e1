use crate::{Error, ValueType};
use std::borrow::Cow;

/// Signature of a function.
///
/// A signature consists of zero or more parameter types and a vector of
/// return types. Unless the module carries the multi-return feature bit the
/// return vector holds at most one element.
///
/// Two signatures are considered equal if they have equal parameter lists and
/// equal return lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    params: Cow<'static, [ValueType]>,
    returns: Cow<'static, [ValueType]>,
}

impl Signature {
    /// Creates a new signature from parameter and return types.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use espb::{Signature, ValueType};
    ///
    /// const NONE: &[ValueType] = &[];
    ///
    /// // s1: (i32) -> ()
    /// let s1 = Signature::new(&[ValueType::I32][..], NONE);
    ///
    /// // s2: () -> i32
    /// let s2 = Signature::new(NONE, &[ValueType::I32][..]);
    /// ```
    pub fn new<P, R>(params: P, returns: R) -> Signature
    where
        P: Into<Cow<'static, [ValueType]>>,
        R: Into<Cow<'static, [ValueType]>>,
    {
        Signature {
            params: params.into(),
            returns: returns.into(),
        }
    }

    /// Returns parameter types of this signature.
    pub fn params(&self) -> &[ValueType] {
        self.params.as_ref()
    }

    /// Returns return types of this signature.
    pub fn returns(&self) -> &[ValueType] {
        self.returns.as_ref()
    }

    /// Returns the sole return type, or `None` for a void function.
    pub fn return_type(&self) -> Option<ValueType> {
        self.returns.first().copied()
    }
}

/// Size limits of a table or a linear memory.
///
/// `initial` is mandatory; `maximum` is present when the limits header had
/// the `has_max` flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    initial: u32,
    maximum: Option<u32>,
    shared: bool,
}

impl Limits {
    /// Creates limits from an initial size and an optional maximum.
    pub fn new(initial: u32, maximum: Option<u32>, shared: bool) -> Limits {
        Limits {
            initial,
            maximum,
            shared,
        }
    }

    /// Initial size, in the unit of the described entity.
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Optional maximum size.
    pub fn maximum(&self) -> Option<u32> {
        self.maximum
    }

    /// Whether the entity is marked shared.
    pub fn shared(&self) -> bool {
        self.shared
    }
}

/// Description of a global variable, as seen across the import boundary.
#[derive(Debug, Clone, Copy)]
pub struct GlobalDescriptor {
    value_type: ValueType,
    mutable: bool,
    shared: bool,
}

impl GlobalDescriptor {
    pub(crate) fn new(value_type: ValueType, mutable: bool, shared: bool) -> GlobalDescriptor {
        GlobalDescriptor {
            value_type,
            mutable,
            shared,
        }
    }

    /// Returns the [`ValueType`] of the described global.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Returns whether the described global is mutable.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Returns whether the described global is marked shared.
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

/// Description of a table, as seen across the import boundary.
#[derive(Debug, Clone, Copy)]
pub struct TableDescriptor {
    limits: Limits,
}

impl TableDescriptor {
    pub(crate) fn new(limits: Limits) -> TableDescriptor {
        TableDescriptor { limits }
    }

    /// Returns the initial size of the described table.
    pub fn initial(&self) -> u32 {
        self.limits.initial()
    }

    /// Returns the maximum size of the described table.
    pub fn maximum(&self) -> Option<u32> {
        self.limits.maximum()
    }
}

/// Description of a linear memory, as seen across the import boundary.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    limits: Limits,
}

impl MemoryDescriptor {
    pub(crate) fn new(limits: Limits) -> MemoryDescriptor {
        MemoryDescriptor { limits }
    }

    /// Returns the initial size (in pages) of the described memory.
    pub fn initial(&self) -> u32 {
        self.limits.initial()
    }

    /// Returns the maximum size (in pages) of the described memory.
    pub fn maximum(&self) -> Option<u32> {
        self.limits.maximum()
    }

    /// Returns whether the described memory is marked shared.
    pub fn is_shared(&self) -> bool {
        self.limits.shared()
    }
}

pub(crate) fn check_limits(limits: &Limits) -> Result<(), Error> {
    if let Some(maximum) = limits.maximum() {
        if maximum < limits.initial() {
            return Err(Error::Instantiation(format!(
                "maximum limit {} is less than minimum {}",
                maximum,
                limits.initial()
            )));
        }
    }

    Ok(())
}
