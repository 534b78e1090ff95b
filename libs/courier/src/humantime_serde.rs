//! Serde mapping between `Duration` and humantime strings such as `"30s"` or
//! `"1m 30s"`.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Limits {
//!     #[serde(with = "crate::humantime_serde")]
//!     timeout: Duration,
//! }
//! ```

use serde::{Deserialize, Deserializer, Serializer, de};
use std::time::Duration;

pub(crate) fn serialize<S: Serializer>(
    value: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*value))
}

pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(|_| {
        de::Error::invalid_value(de::Unexpected::Str(&raw), &"a duration like \"30s\"")
    })
}

pub(crate) mod option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] Duration);

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(d)| d))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Limits {
        #[serde(with = "super")]
        timeout: Duration,
        #[serde(with = "super::option", default)]
        idle: Option<Duration>,
    }

    #[test]
    fn test_round_trip() {
        let parsed: Limits =
            serde_json::from_str(r#"{"timeout": "1m 30s", "idle": "90s"}"#).unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(90));
        assert_eq!(parsed.idle, Some(Duration::from_secs(90)));
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"{"timeout":"1m 30s","idle":"1m 30s"}"#
        );
    }

    #[test]
    fn test_missing_and_null_option() {
        let parsed: Limits = serde_json::from_str(r#"{"timeout": "5s"}"#).unwrap();
        assert_eq!(parsed.idle, None);
        let parsed: Limits = serde_json::from_str(r#"{"timeout": "5s", "idle": null}"#).unwrap();
        assert_eq!(parsed.idle, None);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = serde_json::from_str::<Limits>(r#"{"timeout": "soon"}"#).unwrap_err();
        assert!(err.to_string().contains("soon"));
    }
}
