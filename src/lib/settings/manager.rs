use std::{collections::HashSet, path::Path};

use anyhow::{anyhow, Context, Result};
use tracing::*;

use super::Settings;

/// Reads the settings file. A missing file gives the defaults, which are then
/// written out so there is something to edit; an unreadable file is an error.
#[instrument(level = "debug")]
pub fn load(path: &Path) -> Result<Settings> {
    let settings = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<Settings>(&content)
            .with_context(|| format!("Failed to parse settings file {path:?}"))?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            warn!("Settings file {path:?} not found, using defaults");
            let settings = Settings::default();
            if let Err(error) = save(path, &settings) {
                error!("Failed to save default settings: {error:#}");
            }
            settings
        }
        Err(error) => {
            return Err(error).with_context(|| format!("Failed to read settings file {path:?}"))
        }
    };

    validate(&settings)?;

    debug!("Using settings file: {path:?}");
    Ok(settings)
}

pub fn save(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings folder {parent:?}"))?;
        }
    }

    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {path:?}"))
}

pub fn validate(settings: &Settings) -> Result<()> {
    let mut ids = HashSet::new();
    for source in &settings.sources {
        if source.id.trim().is_empty() {
            return Err(anyhow!("Source {:?} has an empty id", source.name));
        }
        if !ids.insert(source.id.as_str()) {
            return Err(anyhow!("Source id {:?} is used more than once", source.id));
        }
    }

    for source in &settings.sources {
        let Some(original) = &source.mirror_of else {
            continue;
        };
        if original == &source.id {
            return Err(anyhow!("Source {:?} mirrors itself", source.id));
        }
        if !ids.contains(original.as_str()) {
            warn!(
                "Source {:?} mirrors {original:?}, which is not configured",
                source.id
            );
        }
    }

    if !(0.0..=1.0).contains(&settings.iou_threshold) {
        return Err(anyhow!(
            "iou_threshold must be within 0 and 1, got {}",
            settings.iou_threshold
        ));
    }

    if settings.history_capacity == 0 {
        return Err(anyhow!("history_capacity must be at least 1"));
    }

    if settings.process_interval_secs <= 0.0 {
        return Err(anyhow!(
            "process_interval_secs must be positive, got {}",
            settings.process_interval_secs
        ));
    }

    Ok(())
}
