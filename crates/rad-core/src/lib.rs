//! Shared domain types for the remote assist display.
//!
//! Everything in here is pure: no sockets, no timers, no files. The runtime
//! pieces live in `rad-display-rs` and the persistence collaborator lives in
//! `rad-storage`.

pub mod hub_protocol;
pub mod session;
pub mod settings;
pub mod value_path;

pub use hub_protocol::HubEvent;
pub use session::{DisplaySession, NavigationTarget, TargetKind};
pub use settings::{resolve, truncate_for_display, DefaultOptions, Resolved, SettingName, ValueSource};
pub use value_path::ValuePath;
