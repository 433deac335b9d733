//! Client configuration: settings record, defaults, and layered overrides.

mod merge;
mod schema;

pub use merge::merge_layers;
pub use schema::{
    BackpressureSettings, ClusterSettings, DelaySettings, HeartbeatSettings, OperationSettings,
    Settings, SettingsError, SettingsOverride,
};
