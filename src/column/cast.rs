//! Cast kernels used by the `Cast` virtual column.
//!
//! Numeric-to-numeric casts saturate on signed narrowing and truncate on
//! float-to-int; NA always propagates. String sources parse (a non-parseable
//! token becomes NA); string targets format.

use std::borrow::Cow;

use crate::column::stype::{Element, LType, SType};
use crate::column::{Column, Value};

/// Read element `i` of `arg` converted to the fixed-width type `T` of the
/// cast target `target_stype`.
pub(crate) fn cast_get<T: Element>(arg: &Column, i: usize, target_stype: SType) -> Option<T> {
    let v: T = match arg.stype().ltype() {
        LType::Void => return None,
        LType::Bool | LType::Int => {
            let v = arg.get_i64_any(i)?;
            if target_stype == SType::Bool8 {
                T::wrap_from_i64((v != 0) as i64)
            } else {
                T::saturate_from_i64(v)
            }
        }
        LType::Real => {
            let f = arg.get_f64_any(i)?;
            if f.is_nan() {
                return None;
            }
            if target_stype == SType::Bool8 {
                T::wrap_from_i64((f != 0.0) as i64)
            } else {
                T::from_f64_cast(f)
            }
        }
        LType::Str => {
            let s = arg.get_str(i)?;
            let s = s.trim();
            match target_stype.ltype() {
                LType::Bool => match s {
                    "true" | "True" | "TRUE" | "1" => T::wrap_from_i64(1),
                    "false" | "False" | "FALSE" | "0" => T::wrap_from_i64(0),
                    _ => return None,
                },
                LType::Int => T::saturate_from_i64(s.parse::<i64>().ok()?),
                LType::Real => T::from_f64_cast(s.parse::<f64>().ok()?),
                _ => return None,
            }
        }
    };
    Some(v)
}

/// Read element `i` of `arg` formatted for a string cast target.
pub(crate) fn cast_get_str(arg: &Column, i: usize) -> Option<Cow<'_, str>> {
    if arg.stype().is_string() {
        return arg.get_str(i);
    }
    match arg.value(i) {
        Value::Na => None,
        Value::Bool(b) => Some(Cow::Borrowed(if b { "True" } else { "False" })),
        Value::Int(v) => Some(Cow::Owned(v.to_string())),
        Value::Float(f) => Some(Cow::Owned(format_f64(f))),
        Value::Str(s) => Some(Cow::Owned(s)),
    }
}

/// Shortest representation that still roundtrips through `parse::<f64>()`.
pub(crate) fn format_f64(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// The smallest stype that can represent both inputs without loss,
/// used by rbind-style promotions.
pub fn common_stype(a: SType, b: SType) -> SType {
    use SType::*;
    if a == b {
        return a;
    }
    fn rank(s: SType) -> u8 {
        match s {
            Void => 0,
            Bool8 => 1,
            Int8 => 2,
            Int16 => 3,
            Int32 => 4,
            Int64 => 5,
            Float32 => 6,
            Float64 => 7,
            Str32 => 8,
            Str64 => 9,
        }
    }
    let (lo, hi) = if rank(a) < rank(b) { (a, b) } else { (b, a) };
    if lo == Void {
        return hi;
    }
    // an int64 cannot fit in a float32
    if hi == Float32 && lo == Int64 {
        return Float64;
    }
    // numeric and string only meet at string
    if hi.is_string() && !lo.is_string() {
        return hi;
    }
    hi
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::storage::StorageColumn;

    #[test]
    fn test_saturating_narrow() {
        let c = Column::Storage(StorageColumn::from_values::<i64>(&[
            Some(1_000_000),
            Some(-1_000_000),
            Some(42),
            None,
        ]));
        let narrow = c.cast(SType::Int16);
        assert_eq!(narrow.get::<i16>(0), Some(i16::MAX));
        assert_eq!(narrow.get::<i16>(1), Some(i16::MIN + 1));
        assert_eq!(narrow.get::<i16>(2), Some(42));
        assert_eq!(narrow.get::<i16>(3), None);
    }

    #[test]
    fn test_float_to_int_truncates() {
        let c = Column::Storage(StorageColumn::from_values::<f64>(&[
            Some(3.9),
            Some(-3.9),
            Some(f64::NAN),
        ]));
        let ints = c.cast(SType::Int32);
        assert_eq!(ints.get::<i32>(0), Some(3));
        assert_eq!(ints.get::<i32>(1), Some(-3));
        assert_eq!(ints.get::<i32>(2), None);
    }

    #[test]
    fn test_string_parse_cast() {
        let c = Column::Storage(StorageColumn::from_strs(&[
            Some("12"),
            Some(" -7 "),
            Some("oops"),
            None,
        ]));
        let ints = c.cast(SType::Int32);
        assert_eq!(ints.get::<i32>(0), Some(12));
        assert_eq!(ints.get::<i32>(1), Some(-7));
        assert_eq!(ints.get::<i32>(2), None);
        assert_eq!(ints.get::<i32>(3), None);
    }

    #[test]
    fn test_number_to_string_cast() {
        let c = Column::Storage(StorageColumn::from_values::<i32>(&[Some(5), None]));
        let s = c.cast(SType::Str32);
        assert_eq!(s.get_str(0).as_deref(), Some("5"));
        assert_eq!(s.get_str(1), None);
    }

    #[test]
    fn test_bool_cast_is_truthiness() {
        let c = Column::Storage(StorageColumn::from_values::<i32>(&[
            Some(5),
            Some(0),
            None,
        ]));
        let b = c.cast(SType::Bool8);
        assert_eq!(b.get::<i8>(0), Some(1));
        assert_eq!(b.get::<i8>(1), Some(0));
        assert_eq!(b.get::<i8>(2), None);
    }

    #[test]
    fn test_common_stype() {
        assert_eq!(common_stype(SType::Int32, SType::Int64), SType::Int64);
        assert_eq!(common_stype(SType::Int64, SType::Float32), SType::Float64);
        assert_eq!(common_stype(SType::Bool8, SType::Float32), SType::Float32);
        assert_eq!(common_stype(SType::Int32, SType::Str32), SType::Str32);
        assert_eq!(common_stype(SType::Void, SType::Int8), SType::Int8);
    }
}
