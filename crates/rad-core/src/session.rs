use crate::hub_protocol::HubEvent;
use crate::value_path::ValuePath;

pub const CARD_TITLE_PATH: ValuePath =
    ValuePath::new(&["data", "result", "response", "card", "dashboard", "title"]);

/// One physical display and the hub entity it mirrors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplaySession {
    pub display_id: String,
    pub watched_entity_id: String,
    pub hub_base_url: String,
    pub default_dashboard_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Default,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationTarget {
    pub url: String,
    pub kind: TargetKind,
}

impl NavigationTarget {
    pub fn default_view(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: TargetKind::Default,
        }
    }

    pub fn transient(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: TargetKind::Transient,
        }
    }

    pub fn is_default(&self) -> bool {
        self.kind == TargetKind::Default
    }
}

impl DisplaySession {
    /// Events are only acted on once both the watched entity and the default
    /// dashboard are known.
    pub fn is_configured(&self) -> bool {
        !self.watched_entity_id.trim().is_empty() && !self.default_dashboard_path.trim().is_empty()
    }

    pub fn default_target(&self) -> Option<NavigationTarget> {
        if !self.is_configured() {
            return None;
        }
        Some(NavigationTarget::default_view(join_url(
            &self.hub_base_url,
            &self.default_dashboard_path,
        )))
    }

    pub fn is_relevant(&self, event: &HubEvent) -> bool {
        self.is_configured() && event.device_id.as_deref() == Some(self.watched_entity_id.as_str())
    }

    /// Relevance test plus payload extraction. A relevant event without a
    /// card title yields `None` the same way an irrelevant one does.
    ///
    /// The title is trimmed of surrounding whitespace and joined to the hub
    /// base URL with exactly one `/`, so `" /energy "` under
    /// `http://hub.local/` becomes `http://hub.local/energy`. A title that
    /// is blank after trimming counts as missing.
    pub fn handle(&self, event: &HubEvent) -> Option<NavigationTarget> {
        if !self.is_relevant(event) {
            return None;
        }
        let title = card_title(event)?;
        Some(NavigationTarget::transient(join_url(&self.hub_base_url, title)))
    }
}

pub fn card_title(event: &HubEvent) -> Option<&str> {
    event
        .field_str(CARD_TITLE_PATH)
        .map(str::trim)
        .filter(|title| !title.is_empty())
}

/// Joins a base URL and a dashboard path with exactly one `/` between them.
/// Trailing slashes on `base` and leading slashes on `segment` are dropped;
/// everything else is kept verbatim.
pub fn join_url(base: &str, segment: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        segment.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> DisplaySession {
        DisplaySession {
            display_id: "kitchen".to_string(),
            watched_entity_id: "assist_1".to_string(),
            hub_base_url: "http://hub.local".to_string(),
            default_dashboard_path: "lovelace/home".to_string(),
        }
    }

    fn card_event(device_id: &str, title: Option<&str>) -> HubEvent {
        let mut payload = json!({
            "event_type": "assist_card",
            "data": { "device_id": device_id }
        });
        if let Some(title) = title {
            payload["data"]["result"] = json!({
                "response": { "card": { "dashboard": { "title": title } } }
            });
        }
        HubEvent::from_payload(payload)
    }

    #[test]
    fn matching_event_with_title_yields_transient_target() {
        let target = session()
            .handle(&card_event("assist_1", Some("energy")))
            .expect("target");
        assert_eq!(target, NavigationTarget::transient("http://hub.local/energy"));
        assert!(!target.is_default());
    }

    #[test]
    fn other_devices_are_ignored() {
        assert_eq!(session().handle(&card_event("assist_2", Some("energy"))), None);
        assert!(!session().is_relevant(&card_event("assist_2", None)));
    }

    #[test]
    fn relevant_event_without_card_yields_nothing() {
        let event = card_event("assist_1", None);
        assert!(session().is_relevant(&event));
        assert_eq!(session().handle(&event), None);
        assert_eq!(session().handle(&card_event("assist_1", Some("  "))), None);
    }

    #[test]
    fn partial_payloads_are_not_errors() {
        let event = HubEvent::from_payload(json!({
            "data": { "device_id": "assist_1", "result": { "response": "plain text" } }
        }));
        assert_eq!(session().handle(&event), None);

        let event = HubEvent::from_payload(json!({ "data": null }));
        assert_eq!(session().handle(&event), None);
    }

    #[test]
    fn unconfigured_session_discards_everything() {
        let mut unconfigured = session();
        unconfigured.default_dashboard_path.clear();
        assert!(!unconfigured.is_configured());
        assert_eq!(unconfigured.default_target(), None);
        assert_eq!(unconfigured.handle(&card_event("assist_1", Some("energy"))), None);

        let mut unwatched = session();
        unwatched.watched_entity_id = " ".to_string();
        assert!(!unwatched.is_relevant(&card_event(" ", Some("energy"))));
    }

    #[test]
    fn default_target_joins_dashboard_path() {
        let target = session().default_target().expect("default");
        assert_eq!(target, NavigationTarget::default_view("http://hub.local/lovelace/home"));
        assert!(target.is_default());
    }

    #[test]
    fn join_url_collapses_duplicate_slashes() {
        assert_eq!(join_url("http://hub.local/", "/energy"), "http://hub.local/energy");
        assert_eq!(join_url("http://hub.local", "energy"), "http://hub.local/energy");
    }

    #[test]
    fn padded_titles_and_slashes_are_normalized() {
        let mut padded = session();
        padded.hub_base_url = "http://hub.local/".to_string();
        let target = padded
            .handle(&card_event("assist_1", Some(" /energy ")))
            .expect("target");
        assert_eq!(target.url, "http://hub.local/energy");
        assert_eq!(card_title(&card_event("assist_1", Some("\tweather\n"))), Some("weather"));
    }
}
