use crate::error::{Error, Result};

/// Default topic prefix for everything published by the bridge.
pub const TOPIC_PREFIX: &str = "sunspec";

/// Builder for the bridge's MQTT topics.
///
/// Topics follow the pattern:
/// `<prefix>/<device>/<model>_<index>/<point>`
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    prefix: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(TOPIC_PREFIX)
    }
}

impl TopicBuilder {
    /// Create a builder with a custom prefix.
    ///
    /// Trailing slashes are stripped from the prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The topic prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a topic below a device.
    ///
    /// # Example
    /// ```
    /// use sunspec_common::topic::TopicBuilder;
    ///
    /// let builder = TopicBuilder::new("sunspec");
    /// let topic = builder.device("inverter", &["common_0", "Mn"]);
    /// assert_eq!(topic, "sunspec/inverter/common_0/Mn");
    /// ```
    pub fn device(&self, device: &str, path: &[&str]) -> String {
        let mut topic = format!("{}/{}", self.prefix, sanitize_segment(device));
        for segment in path {
            topic.push('/');
            topic.push_str(&sanitize_segment(segment));
        }
        topic
    }

    /// Topic carrying the full data tree of a device.
    ///
    /// # Example
    /// ```
    /// use sunspec_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::default().data("inverter"), "sunspec/inverter/data");
    /// ```
    pub fn data(&self, device: &str) -> String {
        self.device(device, &["data"])
    }

    /// Topic carrying the device identification (manufacturer, model, ...).
    pub fn info(&self, device: &str) -> String {
        self.device(device, &["info"])
    }

    /// Wildcard subscription matching everything published for a device.
    ///
    /// # Example
    /// ```
    /// use sunspec_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::default().device_wildcard("meter"), "sunspec/meter/#");
    /// ```
    pub fn device_wildcard(&self, device: &str) -> String {
        format!("{}/{}/#", self.prefix, sanitize_segment(device))
    }

    /// Topic for bridge status messages.
    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }
}

/// Replace characters that are not allowed (or have a special meaning) in
/// an MQTT topic level.
pub fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' | '\0' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Check that a topic prefix can be used to publish.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.trim_matches('/').is_empty() {
        return Err(Error::Topic("topic prefix cannot be empty".to_string()));
    }
    if prefix.contains(['+', '#']) {
        return Err(Error::Topic(format!(
            "topic prefix '{}' cannot contain wildcards",
            prefix
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builder() {
        let builder = TopicBuilder::new("solar/");

        assert_eq!(builder.prefix(), "solar");
        assert_eq!(
            builder.device("roof", &["inverter_three_phase_0", "W"]),
            "solar/roof/inverter_three_phase_0/W"
        );
        assert_eq!(builder.data("roof"), "solar/roof/data");
        assert_eq!(builder.info("roof"), "solar/roof/info");
        assert_eq!(builder.status(), "solar/status");
    }

    #[test]
    fn test_nested_group_topic() {
        let topic = TopicBuilder::default().device("pv", &["mppt_0", "module_1", "DCW"]);
        assert_eq!(topic, "sunspec/pv/mppt_0/module_1/DCW");
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("a/b"), "a_b");
        assert_eq!(sanitize_segment("x+y#z"), "x_y_z");
        assert_eq!(sanitize_segment("my device"), "my_device");
        assert_eq!(sanitize_segment("inverter-01"), "inverter-01");
    }

    #[test]
    fn test_validate_prefix() {
        assert!(validate_prefix("sunspec").is_ok());
        assert!(validate_prefix("home/solar").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("/").is_err());
        assert!(validate_prefix("sunspec/#").is_err());
    }
}
