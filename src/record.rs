//! Single-line JSON encoding of records and manifest lines.
//!
//! Lines are written the way the original Python tooling wrote them: object
//! keys sorted, `", "` and `": "` separators, non-ASCII escaped as `\uXXXX`.
//! Files produced by either side are therefore byte-identical for the same
//! values. Non-finite floats are rejected rather than silently turned into
//! `null`.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::ser;
use serde_json::Value;
use serde_json::ser::Formatter;
use std::fmt;
use std::io;

/// One datastore record: a JSON object with sorted keys.
pub type Record = serde_json::Map<String, Value>;

/// Encode `record` as one JSON object line (no trailing newline).
pub fn encode_record<T: Serialize + ?Sized>(record: &T) -> Result<String> {
    ensure_finite(record)?;
    let value = serde_json::to_value(record)?;
    if !value.is_object() {
        return Err(Error::serialization(format!(
            "record must serialize to a JSON object, got {}",
            kind_of(&value)
        )));
    }
    to_line(&value)
}

/// Decode one record line.
pub fn decode_record(line: &str) -> Result<Record> {
    decode_record_bytes(line.as_bytes())
}

/// [`decode_record`] for a line that may not be valid UTF-8.
pub fn decode_record_bytes(line: &[u8]) -> Result<Record> {
    match serde_json::from_slice::<Value>(line)? {
        Value::Object(record) => Ok(record),
        other => Err(Error::serialization(format!(
            "record line is not a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

/// Serialize any value as one line with the datastore's separators.
pub fn to_line<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut out = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, LineFormatter);
    value.serialize(&mut serializer)?;
    // The formatter only ever emits ASCII.
    String::from_utf8(out).map_err(|err| Error::serialization(err.to_string()))
}

/// Fail if `value` contains a NaN or infinite float anywhere.
pub fn ensure_finite<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    value
        .serialize(&mut FiniteProbe)
        .map_err(|err| Error::serialization(err.0))
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct LineFormatter;

impl Formatter for LineFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut ascii_start = 0;
        for (offset, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[ascii_start..offset])?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            ascii_start = offset + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[ascii_start..])
    }
}

#[derive(Debug)]
struct NonFinite(String);

impl fmt::Display for NonFinite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NonFinite {}

impl ser::Error for NonFinite {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Serializer that produces nothing and only checks floats.
struct FiniteProbe;

impl FiniteProbe {
    fn check(value: f64) -> std::result::Result<(), NonFinite> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(NonFinite(format!(
                "out of range float values are not JSON compliant: {value}"
            )))
        }
    }
}

macro_rules! accept {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, _value: $ty) -> std::result::Result<(), NonFinite> {
                Ok(())
            }
        )*
    };
}

impl ser::Serializer for &mut FiniteProbe {
    type Ok = ();
    type Error = NonFinite;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    accept!(
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_i128(i128),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_u128(u128),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
        serialize_unit_struct(&'static str),
    );

    fn serialize_f32(self, value: f32) -> std::result::Result<(), NonFinite> {
        FiniteProbe::check(f64::from(value))
    }

    fn serialize_f64(self, value: f64) -> std::result::Result<(), NonFinite> {
        FiniteProbe::check(value)
    }

    fn serialize_none(self) -> std::result::Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(
        self,
        value: &T,
    ) -> std::result::Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> std::result::Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> std::result::Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> std::result::Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> std::result::Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> std::result::Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> std::result::Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> std::result::Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, NonFinite> {
        Ok(self)
    }
}

macro_rules! probe_elements {
    ($($trait:ident :: $method:ident),* $(,)?) => {
        $(
            impl ser::$trait for &mut FiniteProbe {
                type Ok = ();
                type Error = NonFinite;

                fn $method<T: ?Sized + Serialize>(
                    &mut self,
                    value: &T,
                ) -> std::result::Result<(), NonFinite> {
                    value.serialize(&mut **self)
                }

                fn end(self) -> std::result::Result<(), NonFinite> {
                    Ok(())
                }
            }
        )*
    };
}

probe_elements!(
    SerializeSeq::serialize_element,
    SerializeTuple::serialize_element,
    SerializeTupleStruct::serialize_field,
    SerializeTupleVariant::serialize_field,
);

macro_rules! probe_fields {
    ($($trait:ident),* $(,)?) => {
        $(
            impl ser::$trait for &mut FiniteProbe {
                type Ok = ();
                type Error = NonFinite;

                fn serialize_field<T: ?Sized + Serialize>(
                    &mut self,
                    _key: &'static str,
                    value: &T,
                ) -> std::result::Result<(), NonFinite> {
                    value.serialize(&mut **self)
                }

                fn end(self) -> std::result::Result<(), NonFinite> {
                    Ok(())
                }
            }
        )*
    };
}

probe_fields!(SerializeStruct, SerializeStructVariant);

impl ser::SerializeMap for &mut FiniteProbe {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_key<T: ?Sized + Serialize>(
        &mut self,
        key: &T,
    ) -> std::result::Result<(), NonFinite> {
        key.serialize(&mut **self)
    }

    fn serialize_value<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> std::result::Result<(), NonFinite> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct Telemetry {
        throttle: f32,
        angle: f64,
        mode: &'static str,
    }

    #[test]
    fn keys_are_sorted_with_spaced_separators() {
        let line = encode_record(&json!({
            "user/throttle": 0.5,
            "cam/image_array": "3_cam_image_array_.jpg",
            "user/angle": -0.25,
            "imu": [1, 2.5, {"z": 1, "a": null}],
        }))
        .unwrap();
        assert_eq!(
            line,
            r#"{"cam/image_array": "3_cam_image_array_.jpg", "imu": [1, 2.5, {"a": null, "z": 1}], "user/angle": -0.25, "user/throttle": 0.5}"#
        );
    }

    #[test]
    fn structs_are_written_with_sorted_keys() {
        let line = encode_record(&Telemetry {
            throttle: 0.25,
            angle: 0.1,
            mode: "user",
        })
        .unwrap();
        assert_eq!(line, r#"{"angle": 0.1, "mode": "user", "throttle": 0.25}"#);
    }

    #[test]
    fn non_ascii_is_escaped_and_decodes_back() {
        let line = encode_record(&json!({"label": "café 🚗"})).unwrap();
        assert_eq!(line, r#"{"label": "caf\u00e9 \ud83d\ude97"}"#);
        let record = decode_record(&line).unwrap();
        assert_eq!(record["label"], "café 🚗");
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let err = encode_record(&Telemetry {
            throttle: f32::INFINITY,
            angle: 0.0,
            mode: "user",
        })
        .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let mut nested: HashMap<&str, Vec<Option<f64>>> = HashMap::new();
        nested.insert("samples", vec![Some(1.0), None, Some(f64::NAN)]);
        assert!(matches!(
            encode_record(&nested),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn records_must_be_objects() {
        assert!(matches!(
            encode_record(&json!([1, 2, 3])),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            decode_record("[1, 2]"),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(decode_record("{\"cut"), Err(Error::Json(_))));
    }

    #[test]
    fn floats_round_trip() {
        let values = [0.1, 0.2, 0.30000000000000004, 1e-7, 123_456.789, -0.0];
        for value in values {
            let line = encode_record(&json!({ "v": value })).unwrap();
            let record = decode_record(&line).unwrap();
            assert_eq!(record["v"].as_f64(), Some(value));
        }
    }
}
