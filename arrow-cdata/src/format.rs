//! Format strings of the C data interface and their arrow-rs `DataType`s.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Fields, IntervalUnit, TimeUnit, UnionFields, UnionMode};

use crate::error::{Error, Result};

/// Parses a format string given the already-parsed child fields.
///
/// Dictionary encoding is not expressed by the format string (it names the
/// index type); callers wrap the result in `DataType::Dictionary`.
pub fn parse_format(format: &str, children: &[Field]) -> Result<DataType> {
    let leaf = |dt: DataType| -> Result<DataType> {
        if children.is_empty() {
            Ok(dt)
        } else {
            Err(Error::invalid_format(
                format,
                format!("leaf type cannot have {} children", children.len()),
            ))
        }
    };
    let exactly = |n: usize| -> Result<()> {
        if children.len() == n {
            Ok(())
        } else {
            Err(Error::invalid_format(
                format,
                format!("expected {n} children but found {}", children.len()),
            ))
        }
    };

    let dt = match format {
        "n" => leaf(DataType::Null)?,
        "b" => leaf(DataType::Boolean)?,
        "c" => leaf(DataType::Int8)?,
        "C" => leaf(DataType::UInt8)?,
        "s" => leaf(DataType::Int16)?,
        "S" => leaf(DataType::UInt16)?,
        "i" => leaf(DataType::Int32)?,
        "I" => leaf(DataType::UInt32)?,
        "l" => leaf(DataType::Int64)?,
        "L" => leaf(DataType::UInt64)?,
        "e" => leaf(DataType::Float16)?,
        "f" => leaf(DataType::Float32)?,
        "g" => leaf(DataType::Float64)?,
        "z" => leaf(DataType::Binary)?,
        "Z" => leaf(DataType::LargeBinary)?,
        "u" => leaf(DataType::Utf8)?,
        "U" => leaf(DataType::LargeUtf8)?,
        "tdD" => leaf(DataType::Date32)?,
        "tdm" => leaf(DataType::Date64)?,
        "tts" => leaf(DataType::Time32(TimeUnit::Second))?,
        "ttm" => leaf(DataType::Time32(TimeUnit::Millisecond))?,
        "ttu" => leaf(DataType::Time64(TimeUnit::Microsecond))?,
        "ttn" => leaf(DataType::Time64(TimeUnit::Nanosecond))?,
        "tDs" => leaf(DataType::Duration(TimeUnit::Second))?,
        "tDm" => leaf(DataType::Duration(TimeUnit::Millisecond))?,
        "tDu" => leaf(DataType::Duration(TimeUnit::Microsecond))?,
        "tDn" => leaf(DataType::Duration(TimeUnit::Nanosecond))?,
        "tiM" => leaf(DataType::Interval(IntervalUnit::YearMonth))?,
        "tiD" => leaf(DataType::Interval(IntervalUnit::DayTime))?,
        "tin" => leaf(DataType::Interval(IntervalUnit::MonthDayNano))?,
        "+l" => {
            exactly(1)?;
            DataType::List(Arc::new(children[0].clone()))
        }
        "+L" => {
            exactly(1)?;
            DataType::LargeList(Arc::new(children[0].clone()))
        }
        "+s" => DataType::Struct(Fields::from(children.to_vec())),
        "+m" => {
            exactly(1)?;
            DataType::Map(Arc::new(children[0].clone()), false)
        }
        "+r" => {
            exactly(2)?;
            DataType::RunEndEncoded(
                Arc::new(children[0].clone()),
                Arc::new(children[1].clone()),
            )
        }
        other => parse_parameterized(other, children)?,
    };
    Ok(dt)
}

fn parse_parameterized(format: &str, children: &[Field]) -> Result<DataType> {
    let bad = |msg: &str| Error::invalid_format(format, msg);

    if let Some(rest) = format.strip_prefix("w:") {
        let width: i32 = rest.parse().map_err(|_| bad("invalid fixed width"))?;
        if width <= 0 {
            return Err(bad("fixed width must be positive"));
        }
        return Ok(DataType::FixedSizeBinary(width));
    }
    if let Some(rest) = format.strip_prefix("+w:") {
        let size: i32 = rest.parse().map_err(|_| bad("invalid list size"))?;
        if size <= 0 {
            return Err(bad("fixed-size list size must be positive"));
        }
        if children.len() != 1 {
            return Err(bad("fixed-size list needs exactly one child"));
        }
        return Ok(DataType::FixedSizeList(Arc::new(children[0].clone()), size));
    }
    if let Some(rest) = format.strip_prefix("d:") {
        let parts: Vec<&str> = rest.split(',').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(bad("decimal needs precision,scale[,bitwidth]"));
        }
        let precision: u8 = parts[0].parse().map_err(|_| bad("invalid precision"))?;
        let scale: i8 = parts[1].parse().map_err(|_| bad("invalid scale"))?;
        let bits = parts.get(2).copied().unwrap_or("128");
        return match bits {
            "128" => Ok(DataType::Decimal128(precision, scale)),
            "256" => Ok(DataType::Decimal256(precision, scale)),
            _ => Err(bad("unsupported decimal bit width")),
        };
    }
    if format.len() >= 4 && format.starts_with("ts") && format.as_bytes()[3] == b':' {
        let unit = time_unit(format.as_bytes()[2]).ok_or_else(|| bad("invalid timestamp unit"))?;
        let tz = &format[4..];
        let tz = (!tz.is_empty()).then(|| Arc::<str>::from(tz));
        return Ok(DataType::Timestamp(unit, tz));
    }
    for (prefix, mode) in [("+ud:", UnionMode::Dense), ("+us:", UnionMode::Sparse)] {
        if let Some(rest) = format.strip_prefix(prefix) {
            let ids = if rest.is_empty() {
                Vec::new()
            } else {
                rest.split(',')
                    .map(|id| id.parse::<i8>().map_err(|_| bad("invalid union type id")))
                    .collect::<Result<Vec<_>>>()?
            };
            if ids.len() != children.len() {
                return Err(bad("union type ids do not match children"));
            }
            let mut seen = [false; 128];
            for &id in &ids {
                if id < 0 {
                    return Err(bad("union type id out of range"));
                }
                if std::mem::replace(&mut seen[id as usize], true) {
                    return Err(bad("duplicate union type id"));
                }
            }
            let fields = UnionFields::new(ids, children.iter().cloned());
            return Ok(DataType::Union(fields, mode));
        }
    }
    Err(bad("unsupported format"))
}

fn time_unit(code: u8) -> Option<TimeUnit> {
    match code {
        b's' => Some(TimeUnit::Second),
        b'm' => Some(TimeUnit::Millisecond),
        b'u' => Some(TimeUnit::Microsecond),
        b'n' => Some(TimeUnit::Nanosecond),
        _ => None,
    }
}

fn unit_code(unit: &TimeUnit) -> char {
    match unit {
        TimeUnit::Second => 's',
        TimeUnit::Millisecond => 'm',
        TimeUnit::Microsecond => 'u',
        TimeUnit::Nanosecond => 'n',
    }
}

/// The format string of a data type. Children are described separately.
pub fn format_of(dt: &DataType) -> Result<String> {
    let s = match dt {
        DataType::Null => "n".to_string(),
        DataType::Boolean => "b".to_string(),
        DataType::Int8 => "c".to_string(),
        DataType::UInt8 => "C".to_string(),
        DataType::Int16 => "s".to_string(),
        DataType::UInt16 => "S".to_string(),
        DataType::Int32 => "i".to_string(),
        DataType::UInt32 => "I".to_string(),
        DataType::Int64 => "l".to_string(),
        DataType::UInt64 => "L".to_string(),
        DataType::Float16 => "e".to_string(),
        DataType::Float32 => "f".to_string(),
        DataType::Float64 => "g".to_string(),
        DataType::Binary => "z".to_string(),
        DataType::LargeBinary => "Z".to_string(),
        DataType::Utf8 => "u".to_string(),
        DataType::LargeUtf8 => "U".to_string(),
        DataType::FixedSizeBinary(n) => format!("w:{n}"),
        DataType::Decimal128(p, s) => format!("d:{p},{s}"),
        DataType::Decimal256(p, s) => format!("d:{p},{s},256"),
        DataType::Date32 => "tdD".to_string(),
        DataType::Date64 => "tdm".to_string(),
        DataType::Time32(u) | DataType::Time64(u) => format!("tt{}", unit_code(u)),
        DataType::Duration(u) => format!("tD{}", unit_code(u)),
        DataType::Timestamp(u, tz) => {
            format!("ts{}:{}", unit_code(u), tz.as_deref().unwrap_or(""))
        }
        DataType::Interval(IntervalUnit::YearMonth) => "tiM".to_string(),
        DataType::Interval(IntervalUnit::DayTime) => "tiD".to_string(),
        DataType::Interval(IntervalUnit::MonthDayNano) => "tin".to_string(),
        DataType::List(_) => "+l".to_string(),
        DataType::LargeList(_) => "+L".to_string(),
        DataType::FixedSizeList(_, n) => format!("+w:{n}"),
        DataType::Struct(_) => "+s".to_string(),
        DataType::Map(_, _) => "+m".to_string(),
        DataType::RunEndEncoded(_, _) => "+r".to_string(),
        DataType::Union(fields, mode) => {
            let ids: Vec<String> = fields.iter().map(|(id, _)| id.to_string()).collect();
            let prefix = match mode {
                UnionMode::Dense => "+ud:",
                UnionMode::Sparse => "+us:",
            };
            format!("{prefix}{}", ids.join(","))
        }
        DataType::Dictionary(key, _) => format_of(key)?,
        other => {
            return Err(Error::invalid_format(
                &format!("{other:?}"),
                "type has no C data interface format",
            ))
        }
    };
    Ok(s)
}

/// Short readable name of a data type, used by `Schema::format_recursive`.
pub fn type_name(dt: &DataType) -> String {
    match dt {
        DataType::Null => "na".into(),
        DataType::Boolean => "bool".into(),
        DataType::Int8 => "int8".into(),
        DataType::UInt8 => "uint8".into(),
        DataType::Int16 => "int16".into(),
        DataType::UInt16 => "uint16".into(),
        DataType::Int32 => "int32".into(),
        DataType::UInt32 => "uint32".into(),
        DataType::Int64 => "int64".into(),
        DataType::UInt64 => "uint64".into(),
        DataType::Float16 => "half_float".into(),
        DataType::Float32 => "float".into(),
        DataType::Float64 => "double".into(),
        DataType::Binary => "binary".into(),
        DataType::LargeBinary => "large_binary".into(),
        DataType::Utf8 => "string".into(),
        DataType::LargeUtf8 => "large_string".into(),
        DataType::FixedSizeBinary(n) => format!("fixed_size_binary({n})"),
        DataType::Decimal128(p, s) => format!("decimal128({p}, {s})"),
        DataType::Decimal256(p, s) => format!("decimal256({p}, {s})"),
        DataType::Date32 => "date32".into(),
        DataType::Date64 => "date64".into(),
        DataType::Time32(u) => format!("time32('{}')", unit_code(u)),
        DataType::Time64(u) => format!("time64('{}')", unit_code(u)),
        DataType::Duration(u) => format!("duration('{}')", unit_code(u)),
        DataType::Timestamp(u, tz) => {
            format!("timestamp('{}', '{}')", unit_code(u), tz.as_deref().unwrap_or(""))
        }
        DataType::Interval(IntervalUnit::YearMonth) => "interval_months".into(),
        DataType::Interval(IntervalUnit::DayTime) => "interval_day_time".into(),
        DataType::Interval(IntervalUnit::MonthDayNano) => "interval_month_day_nano".into(),
        DataType::List(_) => "list".into(),
        DataType::LargeList(_) => "large_list".into(),
        DataType::FixedSizeList(_, n) => format!("fixed_size_list({n})"),
        DataType::Struct(_) => "struct".into(),
        DataType::Map(_, _) => "map".into(),
        DataType::RunEndEncoded(_, _) => "run_end_encoded".into(),
        DataType::Union(_, UnionMode::Dense) => "dense_union".into(),
        DataType::Union(_, UnionMode::Sparse) => "sparse_union".into(),
        DataType::Dictionary(_, _) => "dictionary".into(),
        other => format!("{other:?}").to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        for dt in [
            DataType::Int32,
            DataType::UInt64,
            DataType::Float64,
            DataType::Utf8,
            DataType::LargeBinary,
            DataType::Date32,
            DataType::Decimal128(10, 2),
            DataType::Decimal256(40, -3),
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            DataType::Timestamp(TimeUnit::Second, None),
            DataType::Interval(IntervalUnit::MonthDayNano),
            DataType::FixedSizeBinary(16),
        ] {
            let format = format_of(&dt).unwrap();
            assert_eq!(parse_format(&format, &[]).unwrap(), dt, "format {format}");
        }
    }

    #[test]
    fn nested_types_take_children() {
        let item = Field::new("item", DataType::Int32, true);
        assert_eq!(
            parse_format("+l", &[item.clone()]).unwrap(),
            DataType::List(Arc::new(item.clone()))
        );
        assert_eq!(
            parse_format("+w:3", &[item.clone()]).unwrap(),
            DataType::FixedSizeList(Arc::new(item), 3)
        );
        let a = Field::new("a", DataType::Utf8, true);
        let b = Field::new("b", DataType::Float64, false);
        let dt = parse_format("+us:0,5", &[a, b]).unwrap();
        match dt {
            DataType::Union(fields, UnionMode::Sparse) => {
                let ids: Vec<i8> = fields.iter().map(|(id, _)| id).collect();
                assert_eq!(ids, vec![0, 5]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_formats() {
        assert!(parse_format("+l", &[]).is_err());
        assert!(parse_format("q", &[]).is_err());
        assert!(parse_format("d:10", &[]).is_err());
        assert!(parse_format("w:abc", &[]).is_err());
        assert!(parse_format("i", &[Field::new("x", DataType::Int8, true)]).is_err());
    }

    #[test]
    fn rejects_bad_union_ids() {
        let child = |name: &str| Field::new(name, DataType::Int32, true);
        let two = [child("a"), child("b")];
        for format in ["+us:1,1", "+ud:-1,2", "+us:0,128", "+us:0"] {
            assert!(
                matches!(parse_format(format, &two), Err(Error::InvalidFormat { .. })),
                "format {format}"
            );
        }
        assert!(parse_format("+ud:0,127", &two).is_ok());
    }

    #[test]
    fn rejects_non_positive_widths() {
        let item = Field::new("item", DataType::Int32, true);
        for format in ["w:0", "w:-1"] {
            assert!(matches!(parse_format(format, &[]), Err(Error::InvalidFormat { .. })));
        }
        for format in ["+w:0", "+w:-4"] {
            assert!(matches!(
                parse_format(format, &[item.clone()]),
                Err(Error::InvalidFormat { .. })
            ));
        }
    }

    #[test]
    fn dictionary_uses_index_format() {
        let dt = DataType::Dictionary(Box::new(DataType::Int16), Box::new(DataType::Utf8));
        assert_eq!(format_of(&dt).unwrap(), "s");
    }
}
