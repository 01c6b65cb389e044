//! Serde support for configuration types

/// Serializes a `Duration` as a fractional number of seconds, the unit
/// timeouts and intervals are written in throughout the configuration
///
/// For use with `#[serde(with = "...")]`. Deserialization rejects
/// negative, non-finite, and overflowing values; a zero interval is left
/// to [`ConnectorConfig::validate`] since some options legitimately
/// allow it.
///
/// [`ConnectorConfig::validate`]: super::ConnectorConfig::validate
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!(
                "interval must be a non-negative number of seconds, not {secs}"
            ))
        })
    }
}
