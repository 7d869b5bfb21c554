//! The SDK façade: event tracking, user-profile operations and A/B
//! evaluation with automatic exposure events.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ab::models::{AbResult, SpecType};
use crate::ab::AbCore;
use crate::config::{normalize_endpoint, Config, MAX_HTTP_BODY_SIZE};
use crate::error::{Error, Result};
use crate::event::{
    format_ab_property_name, Event, EVENT_AB_IMPRESS, EVENT_IDENTIFY, EVENT_USER_SET,
    PROP_USER_SET_TYPE, USER_SET_TYPE_APPEND, USER_SET_TYPE_DELETE, USER_SET_TYPE_INCREMENT,
    USER_SET_TYPE_SET, USER_SET_TYPE_SET_ONCE, USER_SET_TYPE_UNION, USER_SET_TYPE_UNSET,
};
use crate::http::HttpClient;
use crate::pipeline::{EventPipeline, PipelineConfig};
use crate::user::{Properties, User, UserPropertyOpts};

/// The main entry point of the SDK.
///
/// A client owns the event pipeline and, when configured, the A/B core with
/// its metadata refresh loop. All methods are callable from any number of
/// threads concurrently. Call [`Client::close`] to flush pending events and
/// stop the background work; events tracked after close are rejected with
/// an error.
impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

pub struct Client {
    source_token: String,
    tracking_enabled: bool,
    pipeline: EventPipeline,
    ab_core: Option<Arc<AbCore>>,
    closed: AtomicBool,
}

impl Client {
    /// Create a client with the default configuration.
    pub fn new(endpoint: &str, source_token: &str) -> Result<Client> {
        Client::with_config(endpoint, source_token, Config::default())
    }

    /// Create a client with the specified configuration and start its
    /// background work.
    pub fn with_config(endpoint: &str, source_token: &str, mut config: Config) -> Result<Client> {
        config.normalize();
        let endpoint = normalize_endpoint(endpoint).map_err(|err| {
            log::error!(target: "abflow", "endpoint normalize error: {err}");
            err
        })?;
        if endpoint.is_empty() {
            let ab_usable = config
                .ab
                .as_ref()
                .is_some_and(|ab| ab.meta_loader.is_some() || !ab.meta_endpoint.is_empty());
            if !ab_usable {
                return Err(Error::EndpointRequired);
            }
            log::warn!(target: "abflow", "endpoint is empty; tracking is disabled");
        }

        let ab_core = match &config.ab {
            Some(ab_config) => {
                let core = Arc::new(AbCore::new(&endpoint, source_token, ab_config)?);
                core.start();
                Some(core)
            }
            None => None,
        };

        let pipeline = EventPipeline::start(
            PipelineConfig::from_config(&endpoint, source_token, &config),
            HttpClient::new(),
        )?;

        if ab_core.is_some() {
            log::info!(target: "abflow", "sdk client initialized with A/B evaluation");
        } else {
            log::info!(target: "abflow", "sdk client initialized");
        }

        Ok(Client {
            source_token: source_token.to_owned(),
            tracking_enabled: !endpoint.is_empty(),
            pipeline,
            ab_core,
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shut down the client, flushing any pending events and
    /// stopping the metadata refresh loop. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pipeline.close();
        if let Some(core) = &self.ab_core {
            core.stop();
        }
        log::debug!(target: "abflow", "[{}] sdk client closed", self.source_token);
    }

    // ========== User Identity ==========

    /// Link an anonymous ID with a login ID. Both must be non-empty.
    pub fn identify(&self, user: &User) -> Result<()> {
        if user.anon_id.is_empty() || user.login_id.is_empty() {
            return Err(Error::IdentifyRequiresBothIds);
        }
        self.track(Event::new(&*user.anon_id, &*user.login_id, EVENT_IDENTIFY))
    }

    // ========== Event Tracking ==========

    /// Track a custom event with properties.
    pub fn track_event(&self, user: &User, event: &str, properties: Properties) -> Result<()> {
        self.validate_user(user)?;
        self.track(Event::new(&*user.anon_id, &*user.login_id, event).with_properties(properties))
    }

    /// Submit a fully populated [`Event`] directly. Prefer
    /// [`Client::track_event`] for normal usage.
    pub fn track(&self, mut event: Event) -> Result<()> {
        if event.anon_id.is_empty() && event.login_id.is_empty() {
            return Err(Error::EmptyUserIds);
        }
        event.normalize().map_err(|err| {
            log::error!(target: "abflow", "event normalize error: {err}");
            err
        })?;

        let msg = serde_json::to_vec(&event)?;
        if msg.len() >= MAX_HTTP_BODY_SIZE {
            return Err(Error::MessageTooBig);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.pipeline.submit(msg)
    }

    // ========== User Profile Operations ==========

    /// Set user profile properties (`$set`).
    pub fn profile_set(&self, user: &User, properties: Properties) -> Result<()> {
        self.profile_op(user, properties.into_iter(), USER_SET_TYPE_SET, UserPropertyOpts::set)
    }

    /// Set user profile properties only if they don't exist yet
    /// (`$set_once`).
    pub fn profile_set_once(&self, user: &User, properties: Properties) -> Result<()> {
        self.profile_op(
            user,
            properties.into_iter(),
            USER_SET_TYPE_SET_ONCE,
            UserPropertyOpts::set_once,
        )
    }

    /// Increment numeric user profile properties (`$increment`).
    pub fn profile_increment(&self, user: &User, properties: Properties) -> Result<()> {
        self.profile_op(
            user,
            properties.into_iter(),
            USER_SET_TYPE_INCREMENT,
            UserPropertyOpts::increment,
        )
    }

    /// Append values to list user profile properties (`$append`).
    /// Duplicates are kept.
    pub fn profile_append(&self, user: &User, properties: Properties) -> Result<()> {
        self.profile_op(
            user,
            properties.into_iter(),
            USER_SET_TYPE_APPEND,
            UserPropertyOpts::append,
        )
    }

    /// Add unique values to list user profile properties (`$union`).
    pub fn profile_union(&self, user: &User, properties: Properties) -> Result<()> {
        self.profile_op(
            user,
            properties.into_iter(),
            USER_SET_TYPE_UNION,
            UserPropertyOpts::union,
        )
    }

    /// Remove user profile properties (`$unset`).
    pub fn profile_unset(&self, user: &User, property_keys: &[&str]) -> Result<()> {
        self.validate_user(user)?;
        let mut opts = UserPropertyOpts::new();
        for key in property_keys {
            opts = opts.unset(*key);
        }
        self.track_profile_event(user, opts, USER_SET_TYPE_UNSET)
    }

    /// Delete the entire user profile (`$delete`).
    pub fn profile_delete(&self, user: &User) -> Result<()> {
        self.validate_user(user)?;
        self.track_profile_event(user, UserPropertyOpts::new().delete(), USER_SET_TYPE_DELETE)
    }

    fn profile_op(
        &self,
        user: &User,
        properties: impl Iterator<Item = (String, serde_json::Value)>,
        set_type: &str,
        apply: impl Fn(UserPropertyOpts, String, serde_json::Value) -> UserPropertyOpts,
    ) -> Result<()> {
        self.validate_user(user)?;
        let mut opts = UserPropertyOpts::new();
        for (key, value) in properties {
            opts = apply(opts, key, value);
        }
        self.track_profile_event(user, opts, set_type)
    }

    fn track_profile_event(
        &self,
        user: &User,
        opts: UserPropertyOpts,
        set_type: &str,
    ) -> Result<()> {
        let mut properties = Properties::new();
        properties.insert(PROP_USER_SET_TYPE.to_owned(), set_type.into());
        self.track(
            Event::new(&*user.anon_id, &*user.login_id, EVENT_USER_SET)
                .with_user_properties(opts)
                .with_properties(properties),
        )
    }

    // ========== A/B Evaluation ==========

    /// Evaluate a feature gate. Returns `Ok(false)` when the key is unknown
    /// or not a gate.
    pub fn check_feature_gate(&self, user: &User, key: &str) -> Result<bool> {
        let result = self.eval_ab(user, key, SpecType::Gate)?;
        Ok(result.check_feature_gate())
    }

    /// Evaluate a dynamic config. Returns an empty result when the key is
    /// unknown or not a config.
    pub fn get_feature_config(&self, user: &User, key: &str) -> Result<AbResult> {
        self.eval_ab(user, key, SpecType::Config)
    }

    /// Evaluate an experiment. Returns an empty result when the key is
    /// unknown or not an experiment.
    pub fn get_experiment(&self, user: &User, key: &str) -> Result<AbResult> {
        self.eval_ab(user, key, SpecType::Experiment)
    }

    /// Export the current A/B snapshot for faster startup in a future
    /// session (see [`crate::AbConfig::fast_boot_snapshot`]).
    pub fn get_ab_specs(&self) -> Result<Vec<u8>> {
        let core = self.ab_core.as_ref().ok_or(Error::AbNotInited)?;
        core.storage_snapshot()
    }

    fn eval_ab(&self, user: &User, key: &str, typ: SpecType) -> Result<AbResult> {
        let core = self.ab_core.as_ref().ok_or(Error::AbNotInited)?;
        if core.snapshot().is_none() {
            return Err(Error::AbNotReady);
        }
        self.validate_user(user)?;

        let result = core.evaluate(user, key, Some(typ)).map_err(|err| {
            log::error!(target: "abflow", "{typ} {key} evaluation error: {err}");
            err
        })?;

        if !result.disable_impress && !result.key.is_empty() {
            self.log_ab_impression(user, &result);
        }
        Ok(result)
    }

    /// Emit the `$ABImpress` exposure event recording the chosen variant
    /// under the `$ab_{id}` user property. Pipeline failures are logged,
    /// never surfaced to the evaluating caller.
    fn log_ab_impression(&self, user: &User, result: &AbResult) {
        if !self.tracking_enabled {
            return;
        }
        if let Err(err) = self.track(build_impression_event(user, result)) {
            log::error!(target: "abflow", "A/B impression tracking error: {err}");
        }
    }

    fn validate_user(&self, user: &User) -> Result<()> {
        if !user.has_identity() {
            return Err(Error::EmptyUserIds);
        }
        Ok(())
    }
}

fn build_impression_event(user: &User, result: &AbResult) -> Event {
    let property_key = format_ab_property_name(result.id);
    let opts = match &result.variant_id {
        Some(variant_id) => UserPropertyOpts::new().set(property_key, variant_id.clone()),
        None => UserPropertyOpts::new().unset(property_key),
    };
    Event::new(&*user.anon_id, &*user.login_id, EVENT_AB_IMPRESS).with_user_properties(opts)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::ab::models::MetaEnvelope;
    use crate::config::AbConfig;
    use crate::meta_loader::MetaLoader;

    struct EnvelopeLoader(MetaEnvelope);

    impl MetaLoader for EnvelopeLoader {
        fn load_meta(&self) -> crate::Result<MetaEnvelope> {
            Ok(self.0.clone())
        }
    }

    fn gate_envelope() -> MetaEnvelope {
        serde_json::from_value(json!({
            "update": true,
            "update_time": 100,
            "ab_specs": [{
                "id": 7,
                "key": "TestGate",
                "typ": 1,
                "subject_id": "login_id",
                "enabled": true,
                "salt": "s",
                "rules": {"GATE": [{
                    "id": "r1",
                    "rollout": 100.0,
                    "conditions": [{"field_class": "COMMON", "field": "public", "opt": "IS_TRUE"}]
                }]}
            }]
        }))
        .unwrap()
    }

    fn client_with_gate(server_url: &str) -> Client {
        let config = Config::new()
            .with_flush_interval(Duration::from_millis(50))
            .with_ab(AbConfig::new().with_meta_loader(Arc::new(EnvelopeLoader(gate_envelope()))));
        Client::with_config(server_url, "test-token", config).unwrap()
    }

    #[test]
    fn requires_endpoint_unless_ab_only() {
        let err = Client::new("", "tok").unwrap_err();
        assert!(matches!(err, Error::EndpointRequired));

        // a meta loader makes a tracking-free client legal
        let config = Config::new()
            .with_ab(AbConfig::new().with_meta_loader(Arc::new(EnvelopeLoader(gate_envelope()))));
        let client = Client::with_config("", "tok", config).unwrap();
        assert!(client
            .check_feature_gate(&User::with_login_id("u"), "TestGate")
            .unwrap());
        client.close();
    }

    #[test]
    fn identify_requires_both_ids() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/in/track").with_status(200).create();
        let client = Client::new(&server.url(), "tok").unwrap();

        let err = client.identify(&User::with_login_id("u")).unwrap_err();
        assert!(matches!(err, Error::IdentifyRequiresBothIds));

        let user = User {
            anon_id: "a".to_owned(),
            login_id: "l".to_owned(),
            ..User::default()
        };
        client.identify(&user).unwrap();
        client.close();
    }

    #[test]
    fn track_validates_user_and_size() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/in/track").with_status(200).create();
        let client = Client::new(&server.url(), "tok").unwrap();

        let err = client
            .track_event(&User::default(), "$click", Properties::new())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyUserIds));

        let mut big = Properties::new();
        big.insert("blob".to_owned(), json!("x".repeat(MAX_HTTP_BODY_SIZE)));
        let err = client
            .track_event(&User::with_login_id("u"), "$click", big)
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooBig));

        client.close();
    }

    #[test]
    fn track_after_close_errors_instead_of_panicking() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/in/track").with_status(200).create();
        let client = Client::new(&server.url(), "tok").unwrap();
        client.close();

        let err = client
            .track_event(&User::with_login_id("u"), "$click", Properties::new())
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn ab_apis_gate_on_state() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/in/track").with_status(200).create();

        // no AB config at all
        let client = Client::new(&server.url(), "tok").unwrap();
        let err = client
            .check_feature_gate(&User::with_login_id("u"), "TestGate")
            .unwrap_err();
        assert!(matches!(err, Error::AbNotInited));
        client.close();

        // AB config whose loader serves nothing: no snapshot yet
        struct EmptyLoader;
        impl MetaLoader for EmptyLoader {
            fn load_meta(&self) -> crate::Result<MetaEnvelope> {
                Err(Error::HttpStatus(500))
            }
        }
        let config =
            Config::new().with_ab(AbConfig::new().with_meta_loader(Arc::new(EmptyLoader)));
        let client = Client::with_config(&server.url(), "tok", config).unwrap();
        let err = client
            .check_feature_gate(&User::with_login_id("u"), "TestGate")
            .unwrap_err();
        assert!(matches!(err, Error::AbNotReady));
        client.close();
    }

    #[test]
    fn gate_check_emits_exposure_event() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/in/track")
            .match_body(mockito::Matcher::Regex(r#"\$ABImpress"#.to_owned()))
            .with_status(200)
            .expect_at_least(1)
            .create();

        let client = client_with_gate(&server.url());
        assert!(client
            .check_feature_gate(&User::with_login_id("u"), "TestGate")
            .unwrap());
        client.close();
        mock.assert();
    }

    #[test]
    fn impression_event_shape() {
        let user = User::with_login_id("u1");

        let chosen = AbResult {
            id: 7,
            key: "k".to_owned(),
            typ: 3,
            variant_id: Some("v2".to_owned()),
            ..AbResult::default()
        };
        let event = build_impression_event(&user, &chosen);
        assert_eq!(event.event, EVENT_AB_IMPRESS);
        assert_eq!(event.login_id, "u1");
        assert_eq!(event.user_properties.get("$set").unwrap()["$ab_7"], json!("v2"));

        let unchosen = AbResult {
            id: 7,
            key: "k".to_owned(),
            typ: 2,
            ..AbResult::default()
        };
        let event = build_impression_event(&user, &unchosen);
        assert_eq!(
            event.user_properties.get("$unset").unwrap()["$ab_7"],
            serde_json::Value::Null
        );
    }

    #[test]
    fn profile_ops_build_user_set_events() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/in/track").with_status(200).create();
        let client = Client::new(&server.url(), "tok").unwrap();
        let user = User::with_login_id("u");

        let mut props = Properties::new();
        props.insert("plan".to_owned(), json!("pro"));
        client.profile_set(&user, props.clone()).unwrap();
        client.profile_set_once(&user, props.clone()).unwrap();
        client.profile_increment(&user, props.clone()).unwrap();
        client.profile_append(&user, props.clone()).unwrap();
        client.profile_union(&user, props).unwrap();
        client.profile_unset(&user, &["plan"]).unwrap();
        client.profile_delete(&user).unwrap();
        client.close();
    }

    #[test]
    fn snapshot_export_requires_ab() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/in/track").with_status(200).create();

        let client = Client::new(&server.url(), "tok").unwrap();
        assert!(matches!(client.get_ab_specs(), Err(Error::AbNotInited)));
        client.close();

        let client = client_with_gate(&server.url());
        let exported = client.get_ab_specs().unwrap();
        assert!(!exported.is_empty());
        client.close();
    }
}
