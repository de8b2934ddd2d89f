use crate::error::{Error, Result};
use crate::reading::EntityKind;

/// Default Home Assistant discovery prefix.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// Default prefix for state topics.
pub const STATE_PREFIX: &str = "otodata";

/// Prefix of device identifiers and unique IDs.
pub const DEVICE_ID_PREFIX: &str = "otodata";

/// Builder for the bridge's MQTT topics.
///
/// Topics follow the pattern:
/// - `<discovery_prefix>/sensor/<serial>/<entity>/config`
/// - `<state_prefix>/sensor/<serial>/<entity>/state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    discovery_prefix: String,
    state_prefix: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DISCOVERY_PREFIX, STATE_PREFIX)
    }
}

impl TopicBuilder {
    /// Create a builder with custom prefixes.
    pub fn new(discovery_prefix: impl Into<String>, state_prefix: impl Into<String>) -> Self {
        Self {
            discovery_prefix: discovery_prefix.into().trim_end_matches('/').to_string(),
            state_prefix: state_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Discovery prefix without trailing slash.
    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    /// Retained discovery config topic for one entity.
    ///
    /// # Example
    /// ```
    /// use otobridge_common::{EntityKind, TopicBuilder};
    ///
    /// let topics = TopicBuilder::default();
    /// assert_eq!(
    ///     topics.config_topic("A1B2C3", EntityKind::Level),
    ///     "homeassistant/sensor/A1B2C3/level/config"
    /// );
    /// ```
    pub fn config_topic(&self, serial: &str, kind: EntityKind) -> String {
        format!(
            "{}/sensor/{}/{}/config",
            self.discovery_prefix,
            serial,
            kind.as_str()
        )
    }

    /// State topic for one entity.
    ///
    /// # Example
    /// ```
    /// use otobridge_common::{EntityKind, TopicBuilder};
    ///
    /// let topics = TopicBuilder::default();
    /// assert_eq!(
    ///     topics.state_topic("A1B2C3", EntityKind::Battery),
    ///     "otodata/sensor/A1B2C3/battery/state"
    /// );
    /// ```
    pub fn state_topic(&self, serial: &str, kind: EntityKind) -> String {
        format!(
            "{}/sensor/{}/{}/state",
            self.state_prefix,
            serial,
            kind.as_str()
        )
    }

    /// Topic on which the hub announces its own restarts.
    pub fn birth_topic(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }
}

/// Device identifier shared by every entity of a tank.
pub fn device_id(serial: &str) -> String {
    format!("{}_{}", DEVICE_ID_PREFIX, serial)
}

/// Deterministic unique ID for one entity of a tank.
///
/// # Example
/// ```
/// use otobridge_common::{EntityKind, topics::unique_id};
///
/// assert_eq!(unique_id("A1B2C3", EntityKind::Level), "otodata_A1B2C3_level");
/// ```
pub fn unique_id(serial: &str, kind: EntityKind) -> String {
    format!("{}_{}", device_id(serial), kind.as_str())
}

/// Check that a topic can be published to.
pub fn validate_publish_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Topic("topic must not be empty".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::Topic(format!(
            "'{}' contains MQTT wildcards",
            topic
        )));
    }
    if topic.contains('\0') {
        return Err(Error::Topic(format!("'{}' contains NUL", topic)));
    }
    Ok(())
}
