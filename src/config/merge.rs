use super::schema::{Settings, SettingsOverride};

/// Fold override layers onto the defaults, earliest layer first.
pub fn merge_layers(layers: impl IntoIterator<Item = SettingsOverride>) -> Settings {
    let mut settings = Settings::default();
    for layer in layers {
        layer.apply_to(&mut settings);
    }
    settings
}
