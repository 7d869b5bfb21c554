use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::user::{Properties, UserPropertyOpts};

/// User correlation event linking an anonymous ID with a login ID.
pub const EVENT_IDENTIFY: &str = "$Identify";
/// A/B exposure event emitted after gate/config/experiment evaluation.
pub const EVENT_AB_IMPRESS: &str = "$ABImpress";
/// User-profile operation event.
pub const EVENT_USER_SET: &str = "$UserSet";

/// Property carrying the profile operation type on `$UserSet` events.
pub const PROP_USER_SET_TYPE: &str = "$user_set_type";

pub const USER_SET_TYPE_SET: &str = "user_set";
pub const USER_SET_TYPE_SET_ONCE: &str = "user_set_once";
pub const USER_SET_TYPE_INCREMENT: &str = "user_increment";
pub const USER_SET_TYPE_APPEND: &str = "user_append";
pub const USER_SET_TYPE_UNION: &str = "user_union";
pub const USER_SET_TYPE_UNSET: &str = "user_unset";
pub const USER_SET_TYPE_DELETE: &str = "user_delete";

pub(crate) const MAX_EVENT_NAME_LEN: usize = 128;
pub(crate) const MAX_PROPERTY_KEY_LEN: usize = 128;

/// Return the user property name recording the variant of spec `id`,
/// in the unified `$ab_{id}` format.
pub fn format_ab_property_name(id: i64) -> String {
    format!("$ab_{id}")
}

/// A single tracking event or user-profile update.
///
/// Example JSON representation:
///
/// ```json
/// {
///     "anon_id": "0f485d4d12345e5f",
///     "login_id": "130xxxx1234",
///     "time": 1434557935000,
///     "event": "$page_view",
///     "trace_id": "0190d6b8-5d3a-7c5e-b3a7-9f6d7c1e2a3b",
///     "properties": { "$os": "iOS", "$app_version": "1.3" },
///     "user_properties": { "$set": { "$model": "iPhone5,2" } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Anonymous user ID.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub anon_id: String,
    /// Login user ID.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub login_id: String,
    /// Event timestamp in milliseconds.
    #[serde(default)]
    pub time: i64,
    /// Event trace ID.
    #[serde(default)]
    pub trace_id: String,
    /// Event name.
    #[serde(default)]
    pub event: String,
    /// Event properties.
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
    /// User-profile operations.
    #[serde(default, skip_serializing_if = "UserPropertyOpts::is_empty")]
    pub user_properties: UserPropertyOpts,
}

impl Event {
    pub fn new(
        anon_id: impl Into<String>,
        login_id: impl Into<String>,
        event: impl Into<String>,
    ) -> Event {
        Event {
            anon_id: anon_id.into(),
            login_id: login_id.into(),
            time: Utc::now().timestamp_millis(),
            trace_id: new_trace_id(),
            event: event.into(),
            ..Event::default()
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Event {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_time(mut self, ms: i64) -> Event {
        self.time = ms;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Event {
        self.properties = properties;
        self
    }

    pub fn with_user_properties(mut self, opts: UserPropertyOpts) -> Event {
        self.user_properties = opts;
        self
    }

    /// Validate the event and fill the trace ID and timestamp when absent.
    pub(crate) fn normalize(&mut self) -> Result<()> {
        if self.anon_id.is_empty() && self.login_id.is_empty() {
            return Err(Error::EmptyUserIds);
        }
        if self.event.is_empty() {
            return Err(Error::EventNameEmpty);
        }
        if self.event.len() > MAX_EVENT_NAME_LEN {
            return Err(Error::EventNameTooLong);
        }
        if self.properties.keys().any(|k| k.len() > MAX_PROPERTY_KEY_LEN) {
            return Err(Error::PropertyKeyTooLong);
        }
        if self.trace_id.is_empty() {
            self.trace_id = new_trace_id();
        }
        if self.time == 0 {
            self.time = Utc::now().timestamp_millis();
        }
        Ok(())
    }
}

/// Time-ordered UUID (v7) for event tracing.
pub(crate) fn new_trace_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_fills_trace_id_and_time() {
        let mut event = Event {
            login_id: "u1".to_owned(),
            event: "$click".to_owned(),
            ..Event::default()
        };
        event.normalize().unwrap();
        assert!(!event.trace_id.is_empty());
        assert!(event.time > 0);
    }

    #[test]
    fn normalize_rejects_missing_ids() {
        let mut event = Event {
            event: "$click".to_owned(),
            ..Event::default()
        };
        assert!(matches!(event.normalize(), Err(Error::EmptyUserIds)));
    }

    #[test]
    fn normalize_rejects_empty_name() {
        let mut event = Event {
            login_id: "u1".to_owned(),
            ..Event::default()
        };
        assert!(matches!(event.normalize(), Err(Error::EventNameEmpty)));
    }

    #[test]
    fn normalize_rejects_oversized_name_and_keys() {
        let mut event = Event {
            login_id: "u1".to_owned(),
            event: "e".repeat(MAX_EVENT_NAME_LEN + 1),
            ..Event::default()
        };
        assert!(matches!(event.normalize(), Err(Error::EventNameTooLong)));

        let mut event = Event {
            login_id: "u1".to_owned(),
            event: "$click".to_owned(),
            ..Event::default()
        };
        event
            .properties
            .insert("k".repeat(MAX_PROPERTY_KEY_LEN + 1), json!(1));
        assert!(matches!(event.normalize(), Err(Error::PropertyKeyTooLong)));
    }

    #[test]
    fn empty_fields_are_omitted_from_json() {
        let event = Event::new("", "u1", "$click").with_time(1).with_trace_id("t");
        let encoded = serde_json::to_string(&event).unwrap();
        assert_eq!(
            encoded,
            r#"{"login_id":"u1","time":1,"trace_id":"t","event":"$click"}"#
        );
    }

    #[test]
    fn ab_property_name_format() {
        assert_eq!(format_ab_property_name(42), "$ab_42");
    }
}
