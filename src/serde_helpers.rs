//! Serde helpers for the loosely-typed JSON chat servers emit.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::{self, SeqAccess, Visitor};

/// A `serde_as` type that deserializes strings or integers as `String`.
///
/// Use with `#[serde_as(as = "StringFromAny")]` for `String` fields
/// or `#[serde_as(as = "Option<StringFromAny>")]` for `Option<String>`.
pub struct StringFromAny;

impl<'de> serde_with::DeserializeAs<'de, String> for StringFromAny {
    fn deserialize_as<D>(deserializer: D) -> std::result::Result<String, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct StringOrNumberVisitor;

        impl Visitor<'_> for StringOrNumberVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("string or integer")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_owned())
            }

            fn visit_string<E>(self, v: String) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v)
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_string())
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_string())
            }
        }

        deserializer.deserialize_any(StringOrNumberVisitor)
    }
}

impl serde_with::SerializeAs<String> for StringFromAny {
    fn serialize_as<S>(source: &String, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(source)
    }
}

/// A `serde_as` type for timestamps in whatever shape the server picked.
///
/// Accepts RFC 3339 strings, zone-less `YYYY-MM-DDTHH:MM:SS[.f]` strings
/// (read as UTC), epoch milliseconds, and `[y, m, d, h, min, s, nanos]`
/// arrays. Always serializes as RFC 3339.
pub struct TimestampFromAny;

impl<'de> serde_with::DeserializeAs<'de, DateTime<Utc>> for TimestampFromAny {
    fn deserialize_as<D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct TimestampVisitor;

        impl<'de> Visitor<'de> for TimestampVisitor {
            type Value = DateTime<Utc>;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("timestamp string, epoch milliseconds or date-time array")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                parse_timestamp(v).ok_or_else(|| E::custom(format!("invalid timestamp: {v}")))
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                DateTime::from_timestamp_millis(v)
                    .ok_or_else(|| E::custom(format!("timestamp out of range: {v}")))
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                let millis = i64::try_from(v).map_err(E::custom)?;
                self.visit_i64(millis)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut parts = [0_u32; 7];
                let mut len = 0;
                while let Some(part) = seq.next_element::<u32>()? {
                    let Some(slot) = parts.get_mut(len) else {
                        return Err(de::Error::invalid_length(len + 1, &self));
                    };
                    *slot = part;
                    len += 1;
                }
                if len < 3 {
                    return Err(de::Error::invalid_length(len, &self));
                }

                let [year, month, day, hour, minute, second, nanos] = parts;
                let year = i32::try_from(year).map_err(de::Error::custom)?;
                NaiveDate::from_ymd_opt(year, month, day)
                    .and_then(|date| date.and_hms_nano_opt(hour, minute, second, nanos))
                    .map(|naive| naive.and_utc())
                    .ok_or_else(|| de::Error::custom("invalid date-time array"))
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}

impl serde_with::SerializeAs<DateTime<Utc>> for TimestampFromAny {
    fn serialize_as<S>(source: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&source.to_rfc3339())
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_with::serde_as;

    use super::*;

    #[serde_as]
    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde_as(as = "StringFromAny")]
        id: String,
        #[serde_as(as = "TimestampFromAny")]
        at: DateTime<Utc>,
    }

    #[test]
    fn string_from_any_accepts_numbers() {
        let sample: Sample =
            serde_json::from_str(r#"{"id": 7, "at": "2024-05-01T10:00:00Z"}"#).unwrap();
        assert_eq!(sample.id, "7");

        let sample: Sample =
            serde_json::from_str(r#"{"id": "abc", "at": "2024-05-01T10:00:00Z"}"#).unwrap();
        assert_eq!(sample.id, "abc");
    }

    #[test]
    fn timestamp_shapes_agree() {
        let expected = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);

        for at in [
            r#""2024-05-01T10:00:00.5Z""#,
            r#""2024-05-01T12:00:00.5+02:00""#,
            r#""2024-05-01T10:00:00.500""#,
            "1714557600500",
            "[2024, 5, 1, 10, 0, 0, 500000000]",
        ] {
            let sample: Sample = serde_json::from_str(&format!(r#"{{"id": 1, "at": {at}}}"#))
                .unwrap_or_else(|e| panic!("{at}: {e}"));
            assert_eq!(sample.at, expected, "shape {at}");
        }
    }

    #[test]
    fn short_arrays_default_the_time() {
        let sample: Sample = serde_json::from_str(r#"{"id": 1, "at": [2024, 5, 1]}"#).unwrap();
        assert_eq!(sample.at.to_rfc3339(), "2024-05-01T00:00:00+00:00");
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        assert!(serde_json::from_str::<Sample>(r#"{"id": 1, "at": "yesterday"}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"id": 1, "at": [2024, 13, 1]}"#).is_err());
    }
}
