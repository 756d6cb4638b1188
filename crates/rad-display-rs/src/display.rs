use crate::hub_client::EventHandler;
use crate::navigation::NavigationSink;
use crate::scheduler::{RevertScheduler, SchedulerState};
use rad_core::hub_protocol::HubEvent;
use rad_core::settings::{truncate_for_display, DEFAULT_OPTIONS_SECTION, PERSIST_SECTION};
use rad_core::value_path::ValuePath;
use rad_core::{resolve, DefaultOptions, DisplaySession, NavigationTarget, Resolved, SettingName};
use rad_storage::{SettingsStore, StorageError};
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex as WriteGate},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

pub const DEFAULT_CARD_EVENT: &str = "assist_card";
pub const DEFAULT_SETTINGS_EVENT: &str = "remote_assist_display_settings";

const CHANGE_CAPACITY: usize = 64;
const SETTINGS_DISPLAY_ID_PATH: ValuePath = ValuePath::new(&["data", "display_id"]);
const SETTINGS_MAP_PATH: ValuePath = ValuePath::new(&["data", "settings"]);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to persist {name}: {source}")]
    Persist {
        name: SettingName,
        #[source]
        source: StorageError,
    },
    #[error("write of {name} did not complete")]
    Interrupted { name: SettingName },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub name: SettingName,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct DisplayOptions {
    pub revert_delay: Duration,
    pub card_event_type: String,
    pub settings_event_type: String,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            revert_delay: crate::scheduler::REVERT_DELAY,
            card_event_type: DEFAULT_CARD_EVENT.to_string(),
            settings_event_type: DEFAULT_SETTINGS_EVENT.to_string(),
        }
    }
}

struct DisplayState {
    session: DisplaySession,
    coordinator: Value,
    attributes: BTreeMap<SettingName, String>,
    scheduler: RevertScheduler,
}

impl DisplayState {
    fn resolve(&self, name: SettingName, default_options: &DefaultOptions) -> Resolved {
        resolve(
            name,
            &self.coordinator,
            self.attributes.get(&name).map(String::as_str),
            default_options,
            name.fallback(),
        )
    }

    fn apply(&mut self, name: SettingName, value: &str) {
        name.settings_path()
            .insert(&mut self.coordinator, Value::String(value.to_string()));
        name.display_path()
            .insert(&mut self.coordinator, Value::String(value.to_string()));
        self.attributes.insert(name, value.to_string());
        match name {
            SettingName::DefaultDashboard => self.session.default_dashboard_path = value.to_string(),
            SettingName::AssistEntity => self.session.watched_entity_id = value.to_string(),
            SettingName::DeviceNameStorageKey => {}
        }
    }
}

struct Shared {
    state: Mutex<DisplayState>,
    sink: Arc<dyn NavigationSink>,
    store: Arc<dyn SettingsStore>,
    default_options: DefaultOptions,
    changes: broadcast::Sender<SettingChange>,
    options: DisplayOptions,
    writes: WriteGate<()>,
    pushes: mpsc::UnboundedSender<HubEvent>,
    queued_pushes: Mutex<Option<mpsc::UnboundedReceiver<HubEvent>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DisplayState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One physical display. Every read and write of its session, settings and
/// revert timer goes through a single lock, so a navigation decision never
/// sees a half-applied settings update and a firing timer never interleaves
/// with an arriving card. Store writes happen outside that lock on the
/// blocking pool, one at a time.
#[derive(Clone)]
pub struct Display {
    shared: Arc<Shared>,
}

impl Display {
    /// Seeds coordinator data from the persisted settings and the
    /// default-options table from its own section of the store.
    pub fn new(
        session: DisplaySession,
        store: Arc<dyn SettingsStore>,
        sink: Arc<dyn NavigationSink>,
        options: DisplayOptions,
    ) -> Self {
        let mut coordinator = json!({ "settings": {}, "display": {} });
        for name in SettingName::ALL {
            if let Some(value) = store.get(PERSIST_SECTION, name.persisted_key()) {
                name.settings_path()
                    .insert(&mut coordinator, Value::String(value));
            }
        }
        let default_options: DefaultOptions =
            store.entries(DEFAULT_OPTIONS_SECTION).into_iter().collect();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let (pushes, queued_pushes) = mpsc::unbounded_channel();
        let state = DisplayState {
            session,
            coordinator,
            attributes: BTreeMap::new(),
            scheduler: RevertScheduler::new(options.revert_delay),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                sink,
                store,
                default_options,
                changes,
                options,
                writes: WriteGate::new(()),
                pushes,
                queued_pushes: Mutex::new(Some(queued_pushes)),
            }),
        }
    }

    pub fn session(&self) -> DisplaySession {
        self.shared.lock().session.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.shared.lock().session.is_configured()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.shared.lock().scheduler.state()
    }

    /// Startup navigation. Does nothing for an unconfigured session.
    pub fn show_default(&self) -> bool {
        let state = self.shared.lock();
        match state.session.default_target() {
            Some(target) => {
                self.shared.sink.navigate(&target);
                true
            }
            None => false,
        }
    }

    pub fn handle_card_event(&self, event: &HubEvent) -> Option<NavigationTarget> {
        let mut state = self.shared.lock();
        if !state.session.is_configured() {
            debug!(event = "card_discarded_unconfigured", display_id = %state.session.display_id);
            return None;
        }
        if !state.session.is_relevant(event) {
            trace!(event = "card_ignored", device_id = ?event.device_id);
            return None;
        }
        let Some(transient) = state.session.handle(event) else {
            debug!(event = "card_without_dashboard", display_id = %state.session.display_id);
            return None;
        };
        let default_target = state.session.default_target()?;
        let weak = Arc::downgrade(&self.shared);
        state.scheduler.on_transient(
            self.shared.sink.as_ref(),
            &transient,
            default_target,
            move |generation| fire_revert(&weak, generation),
        );
        info!(event = "card_shown", url = %transient.url);
        Some(transient)
    }

    /// Starts the task that applies settings pushes in arrival order. Pushes
    /// delivered before the worker starts are queued. Returns `None` once a
    /// worker has already been started.
    pub fn spawn_settings_worker(&self) -> Option<JoinHandle<()>> {
        let mut queued = self
            .shared
            .queued_pushes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        let weak = Arc::downgrade(&self.shared);
        Some(tokio::spawn(async move {
            while let Some(event) = queued.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                Display { shared }.handle_settings_event(&event).await;
            }
        }))
    }

    /// Applies a settings push addressed to this display. Returns how many
    /// settings were stored.
    pub async fn handle_settings_event(&self, event: &HubEvent) -> usize {
        let display_id = self.shared.lock().session.display_id.clone();
        if event.field_str(SETTINGS_DISPLAY_ID_PATH) != Some(display_id.as_str()) {
            trace!(event = "settings_ignored", display_id = %display_id);
            return 0;
        }
        let Some(settings) = event.field(SETTINGS_MAP_PATH).and_then(Value::as_object) else {
            debug!(event = "settings_without_values", display_id = %display_id);
            return 0;
        };
        let mut applied = 0;
        for (key, value) in settings {
            let Ok(name) = key.parse::<SettingName>() else {
                debug!(event = "settings_unknown_key", key = %key);
                continue;
            };
            let text = match value {
                Value::String(text) => text.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            match self.set_value(name, &text).await {
                Ok(()) => applied += 1,
                Err(err) => warn!(event = "settings_push_failed", setting = %name, error = %err),
            }
        }
        applied
    }

    pub fn resolve(&self, name: SettingName) -> Resolved {
        self.shared.lock().resolve(name, &self.shared.default_options)
    }

    /// The value as presented to users: resolved, then capped in length.
    pub fn native_value(&self, name: SettingName) -> String {
        truncate_for_display(&self.resolve(name).value)
    }

    /// Persists first; in-memory state only changes once the store accepted
    /// the write. Observers are notified after both are in place. Writers
    /// queue behind each other, readers and card events do not wait on the
    /// store.
    pub async fn set_value(&self, name: SettingName, value: &str) -> Result<(), SyncError> {
        let _gate = self.shared.writes.lock().await;
        let store = Arc::clone(&self.shared.store);
        let owned = value.to_string();
        tokio::task::spawn_blocking(move || store.set(PERSIST_SECTION, name.persisted_key(), &owned))
            .await
            .map_err(|_| SyncError::Interrupted { name })?
            .map_err(|source| SyncError::Persist { name, source })?;
        self.shared.lock().apply(name, value);
        info!(event = "setting_updated", setting = %name, value = %truncate_for_display(value));
        let _ = self.shared.changes.send(SettingChange {
            name,
            value: value.to_string(),
        });
        Ok(())
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<SettingChange> {
        self.shared.changes.subscribe()
    }

    pub fn cancel_revert(&self) -> bool {
        self.shared.lock().scheduler.cancel()
    }
}

fn fire_revert(shared: &Weak<Shared>, generation: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.lock();
    if !state.scheduler.fire(generation, shared.sink.as_ref()) {
        debug!(event = "revert_superseded", generation);
    }
}

impl EventHandler for Display {
    fn on_event(&self, event: &HubEvent) {
        let options = &self.shared.options;
        if event.event_type == options.settings_event_type {
            if self.shared.pushes.send(event.clone()).is_err() {
                warn!(event = "settings_push_dropped", event_type = %event.event_type);
            }
        } else if event.event_type == options.card_event_type {
            self.handle_card_event(event);
        } else {
            trace!(event = "event_type_ignored", event_type = %event.event_type);
        }
    }
}
