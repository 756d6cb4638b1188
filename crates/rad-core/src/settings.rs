//! Effective values of the display's user-facing settings.
//!
//! A setting can be answered by four sources, checked strictly in order:
//! live coordinator data, the last value written to the in-memory attribute,
//! the default-options table seeded at startup, and a hard-coded fallback.

use crate::value_path::ValuePath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const MAX_DISPLAY_CHARS: usize = 255;
pub const ELLIPSIS: &str = "...";

pub const DEFAULT_HOME_ASSISTANT_DASHBOARD: &str = "lovelace";
pub const DEFAULT_DEVICE_NAME_STORAGE_KEY: &str = "browser_mod-browser-id";

/// Persisted section holding the hub connection and display settings.
pub const PERSIST_SECTION: &str = "HomeAssistant";
/// Persisted section the default-options table is seeded from.
pub const DEFAULT_OPTIONS_SECTION: &str = "DefaultDisplayOptions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingName {
    DefaultDashboard,
    DeviceNameStorageKey,
    AssistEntity,
}

impl SettingName {
    pub const ALL: [SettingName; 3] = [
        SettingName::DefaultDashboard,
        SettingName::DeviceNameStorageKey,
        SettingName::AssistEntity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingName::DefaultDashboard => "default_dashboard",
            SettingName::DeviceNameStorageKey => "device_name_storage_key",
            SettingName::AssistEntity => "assist_entity",
        }
    }

    /// Key inside [`PERSIST_SECTION`].
    pub fn persisted_key(&self) -> &'static str {
        match self {
            SettingName::DefaultDashboard => "default_dashboard_path",
            SettingName::DeviceNameStorageKey => "device_name_storage_key",
            SettingName::AssistEntity => "assist_entity",
        }
    }

    pub fn default_option_key(&self) -> &'static str {
        match self {
            SettingName::DefaultDashboard => "default_dashboard_path",
            SettingName::DeviceNameStorageKey => "device_name_storage_key",
            SettingName::AssistEntity => "assist_entity",
        }
    }

    pub fn fallback(&self) -> &'static str {
        match self {
            SettingName::DefaultDashboard => DEFAULT_HOME_ASSISTANT_DASHBOARD,
            SettingName::DeviceNameStorageKey => DEFAULT_DEVICE_NAME_STORAGE_KEY,
            SettingName::AssistEntity => "",
        }
    }

    /// `settings.<name>` in coordinator data.
    pub fn settings_path(&self) -> ValuePath {
        match self {
            SettingName::DefaultDashboard => ValuePath::new(&["settings", "default_dashboard"]),
            SettingName::DeviceNameStorageKey => {
                ValuePath::new(&["settings", "device_name_storage_key"])
            }
            SettingName::AssistEntity => ValuePath::new(&["settings", "assist_entity"]),
        }
    }

    /// `display.<name>` in coordinator data.
    pub fn display_path(&self) -> ValuePath {
        match self {
            SettingName::DefaultDashboard => ValuePath::new(&["display", "default_dashboard"]),
            SettingName::DeviceNameStorageKey => {
                ValuePath::new(&["display", "device_name_storage_key"])
            }
            SettingName::AssistEntity => ValuePath::new(&["display", "assist_entity"]),
        }
    }
}

impl fmt::Display for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "default_dashboard" | "default_dashboard_path" => Ok(SettingName::DefaultDashboard),
            "device_name_storage_key" | "device_storage_key" => {
                Ok(SettingName::DeviceNameStorageKey)
            }
            "assist_entity" => Ok(SettingName::AssistEntity),
            _ => Err(format!("unknown setting: {s}")),
        }
    }
}

/// Static table seeded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultOptions(BTreeMap<String, String>);

impl DefaultOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DefaultOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Settings,
    Attribute,
    DefaultOptions,
    Hardcoded,
}

impl ValueSource {
    /// Lookup order, highest priority first. `Hardcoded` always answers and
    /// is not part of the chain.
    pub const CHAIN: [ValueSource; 3] = [
        ValueSource::Settings,
        ValueSource::Attribute,
        ValueSource::DefaultOptions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueSource::Settings => "settings",
            ValueSource::Attribute => "attribute",
            ValueSource::DefaultOptions => "default_options",
            ValueSource::Hardcoded => "hardcoded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub source: ValueSource,
}

impl Resolved {
    pub fn display_value(&self) -> String {
        truncate_for_display(&self.value)
    }
}

pub fn resolve(
    name: SettingName,
    coordinator_data: &Value,
    attr_value: Option<&str>,
    default_options: &DefaultOptions,
    hardcoded_default: &str,
) -> Resolved {
    let lookup = |source: ValueSource| -> Option<String> {
        match source {
            ValueSource::Settings => name.settings_path().lookup_text(coordinator_data),
            ValueSource::Attribute => attr_value.map(str::to_string),
            ValueSource::DefaultOptions => default_options
                .get(name.default_option_key())
                .map(str::to_string),
            ValueSource::Hardcoded => Some(hardcoded_default.to_string()),
        }
    };
    ValueSource::CHAIN
        .iter()
        .find_map(|source| lookup(*source).map(|value| Resolved { value, source: *source }))
        .unwrap_or_else(|| Resolved {
            value: hardcoded_default.to_string(),
            source: ValueSource::Hardcoded,
        })
}

/// Caps a value at [`MAX_DISPLAY_CHARS`] characters. A shortened value keeps
/// its leading characters and ends in [`ELLIPSIS`], still within the cap.
pub fn truncate_for_display(value: &str) -> String {
    if value.chars().count() <= MAX_DISPLAY_CHARS {
        return value.to_string();
    }
    let keep = MAX_DISPLAY_CHARS - ELLIPSIS.len();
    let mut truncated: String = value.chars().take(keep).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> DefaultOptions {
        [("default_dashboard_path", "/test-dashboard")]
            .into_iter()
            .collect()
    }

    #[test]
    fn settings_map_wins_over_everything() {
        let data = json!({ "settings": { "default_dashboard": "/lovelace/test" } });
        let resolved = resolve(
            SettingName::DefaultDashboard,
            &data,
            Some("/lovelace/attr"),
            &options(),
            DEFAULT_HOME_ASSISTANT_DASHBOARD,
        );
        assert_eq!(resolved.value, "/lovelace/test");
        assert_eq!(resolved.source, ValueSource::Settings);
    }

    #[test]
    fn attribute_answers_when_settings_lack_the_key() {
        let data = json!({ "settings": { "device_name_storage_key": "other" } });
        let resolved = resolve(
            SettingName::DefaultDashboard,
            &data,
            Some("/lovelace/fallback"),
            &options(),
            DEFAULT_HOME_ASSISTANT_DASHBOARD,
        );
        assert_eq!(resolved.value, "/lovelace/fallback");
        assert_eq!(resolved.source, ValueSource::Attribute);
    }

    #[test]
    fn null_settings_value_counts_as_absent() {
        let data = json!({ "settings": { "default_dashboard": null } });
        let resolved = resolve(
            SettingName::DefaultDashboard,
            &data,
            None,
            &options(),
            DEFAULT_HOME_ASSISTANT_DASHBOARD,
        );
        assert_eq!(resolved.value, "/test-dashboard");
        assert_eq!(resolved.source, ValueSource::DefaultOptions);
    }

    #[test]
    fn hardcoded_default_is_last_resort() {
        let resolved = resolve(
            SettingName::DeviceNameStorageKey,
            &json!({}),
            None,
            &options(),
            SettingName::DeviceNameStorageKey.fallback(),
        );
        assert_eq!(resolved.value, DEFAULT_DEVICE_NAME_STORAGE_KEY);
        assert_eq!(resolved.source, ValueSource::Hardcoded);
    }

    #[test]
    fn empty_string_is_a_present_value() {
        let data = json!({ "settings": { "default_dashboard": "" } });
        let resolved = resolve(
            SettingName::DefaultDashboard,
            &data,
            Some("/lovelace/attr"),
            &options(),
            DEFAULT_HOME_ASSISTANT_DASHBOARD,
        );
        assert_eq!(resolved.value, "");
        assert_eq!(resolved.source, ValueSource::Settings);
    }

    #[test]
    fn long_values_are_truncated_with_ellipsis() {
        let long_path = format!("/lovelace/{}", "x".repeat(300));
        assert_eq!(long_path.chars().count(), 310);
        let shown = truncate_for_display(&long_path);
        assert_eq!(shown.chars().count(), MAX_DISPLAY_CHARS);
        assert!(shown.ends_with(ELLIPSIS));
        assert_eq!(shown[..252], long_path[..252]);
        assert!(shown.starts_with("/lovelace/"));
    }

    #[test]
    fn short_values_pass_through_untouched() {
        assert_eq!(truncate_for_display("/lovelace/test"), "/lovelace/test");
        let exact = "y".repeat(MAX_DISPLAY_CHARS);
        assert_eq!(truncate_for_display(&exact), exact);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let wide = "é".repeat(300);
        let shown = truncate_for_display(&wide);
        assert_eq!(shown.chars().count(), MAX_DISPLAY_CHARS);
        assert!(shown.starts_with(&"é".repeat(252)));
    }

    #[test]
    fn resolved_display_value_applies_truncation() {
        let data = json!({ "settings": { "default_dashboard": "z".repeat(400) } });
        let resolved = resolve(
            SettingName::DefaultDashboard,
            &data,
            None,
            &DefaultOptions::new(),
            DEFAULT_HOME_ASSISTANT_DASHBOARD,
        );
        assert_eq!(resolved.value.len(), 400);
        assert_eq!(resolved.display_value().len(), MAX_DISPLAY_CHARS);
    }

    #[test]
    fn setting_names_parse_from_cli_spellings() {
        assert_eq!("default-dashboard".parse::<SettingName>(), Ok(SettingName::DefaultDashboard));
        assert_eq!("default_dashboard_path".parse::<SettingName>(), Ok(SettingName::DefaultDashboard));
        assert_eq!("Assist_Entity".parse::<SettingName>(), Ok(SettingName::AssistEntity));
        assert!("volume".parse::<SettingName>().is_err());
        for name in SettingName::ALL {
            assert_eq!(name.as_str().parse::<SettingName>(), Ok(name));
        }
    }
}
