use serde::Serializer;
use sqlx::types::time;

fn to_unix_millis(x: &time::OffsetDateTime) -> u64 {
    (x.unix_timestamp_nanos() / 1_000_000) as u64
}

pub fn serialize_timestamp<S>(x: &time::OffsetDateTime, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(to_unix_millis(x))
}

pub fn serialize_datetime<S>(x: &Option<time::OffsetDateTime>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if let Some(x) = x {
        s.serialize_u64(to_unix_millis(x))
    } else {
        s.serialize_none()
    }
}
