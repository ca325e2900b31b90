use std::{
    fs,
    num::{NonZeroU32, NonZeroUsize},
    path::Path,
};

use anyhow::{bail, Context, Result};
use audit_core::WorkflowConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "audit_console.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_url: String,
    pub listing_page_size: u32,
    pub units_page_size: usize,
    pub findings_page_size: usize,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".into(),
            listing_page_size: 500,
            units_page_size: 5,
            findings_page_size: 5,
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    listing_page_size: Option<u32>,
    units_page_size: Option<usize>,
    findings_page_size: Option<usize>,
    log_level: Option<String>,
}

impl Settings {
    pub fn workflow_config(&self) -> Result<WorkflowConfig> {
        let listing_page_size = NonZeroU32::new(self.listing_page_size)
            .context("listing_page_size must be greater than zero")?;
        let units_page_size = NonZeroUsize::new(self.units_page_size)
            .context("units_page_size must be greater than zero")?;
        let findings_page_size = NonZeroUsize::new(self.findings_page_size)
            .context("findings_page_size must be greater than zero")?;
        Ok(WorkflowConfig {
            listing_page_size,
            units_page_size,
            findings_page_size,
        })
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if let Some(v) = file.listing_page_size {
            self.listing_page_size = v;
        }
        if let Some(v) = file.units_page_size {
            self.units_page_size = v;
        }
        if let Some(v) = file.findings_page_size {
            self.findings_page_size = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("AUDIT_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = var("APP__API_URL") {
            self.api_url = v;
        }
        if let Some(v) = var("APP__LISTING_PAGE_SIZE") {
            self.listing_page_size = parse_env("APP__LISTING_PAGE_SIZE", &v)?;
        }
        if let Some(v) = var("APP__UNITS_PAGE_SIZE") {
            self.units_page_size = parse_env("APP__UNITS_PAGE_SIZE", &v)?;
        }
        if let Some(v) = var("APP__FINDINGS_PAGE_SIZE") {
            self.findings_page_size = parse_env("APP__FINDINGS_PAGE_SIZE", &v)?;
        }
        if let Some(v) = var("APP__LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number, got '{raw}'"))
}

/// Defaults, then the TOML file, then environment overrides.
///
/// An explicitly requested file must exist; the default file is optional.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    load_settings_with(explicit, |key| std::env::var(key).ok())
}

fn load_settings_with(
    explicit: Option<&Path>,
    var: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    let mut settings = Settings::default();

    let path = explicit.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    match fs::read_to_string(path) {
        Ok(raw) => {
            let file: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid settings file '{}'", path.display()))?;
            settings.apply_file(file);
        }
        Err(err) if explicit.is_some() => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()));
        }
        Err(_) => {}
    }

    settings.apply_env(var)?;

    if settings.api_url.trim().is_empty() {
        bail!("api_url must not be empty");
    }
    settings.workflow_config()?;
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
