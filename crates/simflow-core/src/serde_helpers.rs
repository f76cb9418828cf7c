// Serde helpers shared by configuration types
//
// Durations are written as integer milliseconds so config files and env
// values stay human-editable.

/// `Duration` as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// `Option<Duration>` as optional milliseconds
pub mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timing {
        #[serde(with = "super::duration_millis")]
        delay: Duration,
        #[serde(with = "super::option_duration_millis")]
        limit: Option<Duration>,
    }

    #[test]
    fn test_durations_as_millis() {
        let timing = Timing {
            delay: Duration::from_millis(1500),
            limit: None,
        };
        let json = serde_json::to_value(&timing).unwrap();
        assert_eq!(json, serde_json::json!({"delay": 1500, "limit": null}));

        let parsed: Timing = serde_json::from_str(r#"{"delay": 20, "limit": 5000}"#).unwrap();
        assert_eq!(parsed.delay, Duration::from_millis(20));
        assert_eq!(parsed.limit, Some(Duration::from_secs(5)));
    }
}
