use std::time::Duration;

use serde::Deserialize;

/// Per-query tuning.
///
/// The default configuration makes every entry immediately stale, so each
/// mount and reload performs a fresh load while still de-duplicating
/// concurrent triggers.
///
/// The struct deserializes from host application config files; durations use
/// the humantime format (`"500ms"`, `"5s"`, `"2m"`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long a successfully loaded entry counts as fresh.
    ///
    /// While fresh, repeat mounts and reloads for the key are suppressed.
    /// Zero (the default) means the entry is stale as soon as it commits.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,
}
