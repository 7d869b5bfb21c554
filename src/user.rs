use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event or user-profile attributes, keyed by property name.
pub type Properties = Map<String, Value>;

/// A unified user identity for both A/B evaluation and event tracking.
///
/// At least one of `anon_id` / `login_id` must be non-empty for any API
/// call; [`crate::Client::identify`] requires both.
#[derive(Debug, Clone, Default)]
pub struct User {
    /// Anonymous or device ID.
    pub anon_id: String,
    /// Login user ID.
    pub login_id: String,
    /// Properties used for A/B targeting and bucketing.
    pub ab_properties: Properties,
}

impl User {
    /// Create a user from a login ID.
    pub fn with_login_id(login_id: impl Into<String>) -> User {
        User {
            login_id: login_id.into(),
            ..User::default()
        }
    }

    /// Create a user from an anonymous ID.
    pub fn with_anon_id(anon_id: impl Into<String>) -> User {
        User {
            anon_id: anon_id.into(),
            ..User::default()
        }
    }

    /// Return a new user with a single A/B targeting property added. The
    /// original user is left untouched.
    pub fn with_ab_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> User {
        self.ab_properties.insert(key.into(), value.into());
        self
    }

    /// Return a new user with all of `properties` merged in.
    pub fn with_ab_properties(mut self, properties: Properties) -> User {
        self.ab_properties.extend(properties);
        self
    }

    pub(crate) fn has_identity(&self) -> bool {
        !self.anon_id.is_empty() || !self.login_id.is_empty()
    }
}

/// User-profile operations carried in an event's `user_properties` field.
///
/// Each builder method files the value under the matching profile operator:
///
/// ```json
/// "user_properties": {
///     "$set": { "$model": "iPhone5,2" },
///     "$set_once": { "register_time": "2025-06-09 10:11:20" },
///     "$delete": true
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserPropertyOpts(Map<String, Value>);

impl UserPropertyOpts {
    pub fn new() -> UserPropertyOpts {
        UserPropertyOpts::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Set a user property (`$set`).
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> UserPropertyOpts {
        self.bucket("$set").insert(key.into(), value.into());
        self
    }

    /// Set a user property only if it does not exist yet (`$set_once`).
    pub fn set_once(mut self, key: impl Into<String>, value: impl Into<Value>) -> UserPropertyOpts {
        self.bucket("$set_once").insert(key.into(), value.into());
        self
    }

    /// Increment a numeric user property (`$increment`). Non-numeric values
    /// are ignored.
    pub fn increment(mut self, key: impl Into<String>, value: impl Into<Value>) -> UserPropertyOpts {
        let value = value.into();
        if value.is_number() {
            self.bucket("$increment").insert(key.into(), value);
        }
        self
    }

    /// Append values to a list user property (`$append`). Duplicates are
    /// allowed.
    pub fn append(mut self, key: impl Into<String>, value: impl Into<Value>) -> UserPropertyOpts {
        let key = key.into();
        let bucket = self.bucket("$append");
        let list = list_entry(bucket, key);
        match value.into() {
            Value::Array(values) => list.extend(values),
            value => list.push(value),
        }
        self
    }

    /// Add unique values to a list user property (`$union`).
    pub fn union(mut self, key: impl Into<String>, value: impl Into<Value>) -> UserPropertyOpts {
        let key = key.into();
        let bucket = self.bucket("$union");
        let list = list_entry(bucket, key);
        let mut push_unique = |item: Value| {
            if !list.contains(&item) {
                list.push(item);
            }
        };
        match value.into() {
            Value::Array(values) => values.into_iter().for_each(push_unique),
            value => push_unique(value),
        }
        self
    }

    /// Remove a user property (`$unset`).
    pub fn unset(mut self, key: impl Into<String>) -> UserPropertyOpts {
        self.bucket("$unset").insert(key.into(), Value::Null);
        self
    }

    /// Delete the entire user profile (`$delete`).
    pub fn delete(mut self) -> UserPropertyOpts {
        self.0.insert("$delete".to_owned(), Value::Bool(true));
        self
    }

    pub(crate) fn get(&self, op: &str) -> Option<&Value> {
        self.0.get(op)
    }

    fn bucket(&mut self, op: &str) -> &mut Map<String, Value> {
        let slot = self
            .0
            .entry(op.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        slot.as_object_mut().unwrap()
    }
}

fn list_entry(bucket: &mut Map<String, Value>, key: String) -> &mut Vec<Value> {
    let slot = bucket.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut().unwrap()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn with_ab_property_does_not_mutate_original() {
        let user = User::with_login_id("u1").with_ab_property("plan", "pro");
        let extended = user.clone().with_ab_property("age", 42);

        assert_eq!(user.ab_properties.len(), 1);
        assert_eq!(extended.ab_properties.len(), 2);
        assert_eq!(extended.ab_properties["plan"], json!("pro"));
    }

    #[test]
    fn set_nests_under_operator() {
        let opts = UserPropertyOpts::new().set("$model", "Pixel").set("$os", "android");
        assert_eq!(opts.get("$set").unwrap()["$model"], json!("Pixel"));
        assert_eq!(opts.get("$set").unwrap()["$os"], json!("android"));
    }

    #[test]
    fn increment_ignores_non_numeric() {
        let opts = UserPropertyOpts::new()
            .increment("logins", 1)
            .increment("name", "oops");
        let bucket = opts.get("$increment").unwrap().as_object().unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket["logins"], json!(1));
    }

    #[test]
    fn append_keeps_duplicates() {
        let opts = UserPropertyOpts::new()
            .append("tags", "a")
            .append("tags", json!(["a", "b"]));
        assert_eq!(opts.get("$append").unwrap()["tags"], json!(["a", "a", "b"]));
    }

    #[test]
    fn union_deduplicates() {
        let opts = UserPropertyOpts::new()
            .union("tags", "a")
            .union("tags", json!(["a", "b", "b"]));
        assert_eq!(opts.get("$union").unwrap()["tags"], json!(["a", "b"]));
    }

    #[test]
    fn unset_and_delete() {
        let opts = UserPropertyOpts::new().unset("$ab_7").delete();
        assert_eq!(opts.get("$unset").unwrap()["$ab_7"], Value::Null);
        assert_eq!(opts.get("$delete"), Some(&json!(true)));
    }

    #[test]
    fn serializes_transparently() {
        let opts = UserPropertyOpts::new().set("$ab_42", "v1");
        let encoded = serde_json::to_string(&opts).unwrap();
        assert_eq!(encoded, r#"{"$set":{"$ab_42":"v1"}}"#);
    }
}
