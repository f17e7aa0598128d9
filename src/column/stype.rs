//! Storage types and their NA sentinels.

use serde::{Deserialize, Serialize};

/// Storage type of a column's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SType {
    Void,
    Bool8,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Str32,
    Str64,
}

/// Logical type class, a coarser bucket over stypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LType {
    Void,
    Bool,
    Int,
    Real,
    Str,
}

impl SType {
    /// Size of one element in the data buffer. For string columns this is
    /// the size of one offset entry.
    pub fn elemsize(self) -> usize {
        match self {
            SType::Void => 0,
            SType::Bool8 | SType::Int8 => 1,
            SType::Int16 => 2,
            SType::Int32 | SType::Float32 | SType::Str32 => 4,
            SType::Int64 | SType::Float64 | SType::Str64 => 8,
        }
    }

    pub fn ltype(self) -> LType {
        match self {
            SType::Void => LType::Void,
            SType::Bool8 => LType::Bool,
            SType::Int8 | SType::Int16 | SType::Int32 | SType::Int64 => LType::Int,
            SType::Float32 | SType::Float64 => LType::Real,
            SType::Str32 | SType::Str64 => LType::Str,
        }
    }

    pub fn is_string(self) -> bool {
        self.ltype() == LType::Str
    }

    pub fn is_numeric(self) -> bool {
        matches!(self.ltype(), LType::Bool | LType::Int | LType::Real)
    }

    pub fn name(self) -> &'static str {
        match self {
            SType::Void => "void",
            SType::Bool8 => "bool8",
            SType::Int8 => "int8",
            SType::Int16 => "int16",
            SType::Int32 => "int32",
            SType::Int64 => "int64",
            SType::Float32 => "float32",
            SType::Float64 => "float64",
            SType::Str32 => "str32",
            SType::Str64 => "str64",
        }
    }
}

impl std::fmt::Display for SType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-width element of a column, tied to its canonical NA sentinel.
pub trait Element:
    Copy + PartialEq + PartialOrd + bytemuck::AnyBitPattern + bytemuck::NoUninit + Send + Sync
{
    /// The stype this element type naturally materializes as.
    const STYPE: SType;

    fn na() -> Self;
    fn is_na(self) -> bool;

    /// Plain narrowing with wraparound (range columns).
    fn wrap_from_i64(v: i64) -> Self;

    /// Narrowing with saturation into the non-NA domain (cast columns).
    fn saturate_from_i64(v: i64) -> Self;

    /// Float-to-target conversion: truncation toward zero with saturation
    /// for integer targets.
    fn from_f64_cast(v: f64) -> Self;

    fn to_f64(self) -> f64;
}

macro_rules! int_element {
    ($t:ty, $stype:expr) => {
        impl Element for $t {
            const STYPE: SType = $stype;
            fn na() -> Self {
                <$t>::MIN
            }
            fn is_na(self) -> bool {
                self == <$t>::MIN
            }
            fn wrap_from_i64(v: i64) -> Self {
                v as $t
            }
            fn saturate_from_i64(v: i64) -> Self {
                // MIN is the NA sentinel, so the valid domain starts above it
                if v <= <$t>::MIN as i64 {
                    <$t>::MIN.wrapping_add(1)
                } else if v >= <$t>::MAX as i64 {
                    <$t>::MAX
                } else {
                    v as $t
                }
            }
            fn from_f64_cast(v: f64) -> Self {
                let r = v as $t;
                if r == <$t>::MIN { <$t>::MIN.wrapping_add(1) } else { r }
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

int_element!(i8, SType::Int8);
int_element!(i16, SType::Int16);
int_element!(i32, SType::Int32);
int_element!(i64, SType::Int64);

macro_rules! float_element {
    ($t:ty, $stype:expr) => {
        impl Element for $t {
            const STYPE: SType = $stype;
            fn na() -> Self {
                <$t>::NAN
            }
            fn is_na(self) -> bool {
                self.is_nan()
            }
            fn wrap_from_i64(v: i64) -> Self {
                v as $t
            }
            fn saturate_from_i64(v: i64) -> Self {
                v as $t
            }
            fn from_f64_cast(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

float_element!(f32, SType::Float32);
float_element!(f64, SType::Float64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elemsize() {
        assert_eq!(SType::Void.elemsize(), 0);
        assert_eq!(SType::Bool8.elemsize(), 1);
        assert_eq!(SType::Int16.elemsize(), 2);
        assert_eq!(SType::Str32.elemsize(), 4);
        assert_eq!(SType::Str64.elemsize(), 8);
    }

    #[test]
    fn test_na_sentinels() {
        assert!(<i32 as Element>::na().is_na());
        assert!(<f64 as Element>::na().is_na());
        assert!(!0i64.is_na());
        assert!(!0.0f32.is_na());
    }
}
