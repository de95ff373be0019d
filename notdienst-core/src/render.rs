use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, TimeZone};
use minijinja::{AutoEscape, Environment};
use serde::Serialize;
use std::{fmt::Display, fs, path::PathBuf};

use crate::{Config, model::PharmacyRecord};

/// Display format for duty window timestamps, e.g. `01.05.24 08:30`.
pub const DISPLAY_FORMAT: &str = "%d.%m.%y %H:%M";

const DEFAULT_TEMPLATE: &str = include_str!("../templates/notdienst.html.j2");

/// Format a feed timestamp in the local time zone.
pub fn display_timestamp(ts: &DateTime<FixedOffset>) -> String {
    display_timestamp_in(ts, &Local)
}

pub fn display_timestamp_in<Tz>(ts: &DateTime<FixedOffset>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    ts.with_timezone(tz).format(DISPLAY_FORMAT).to_string()
}

/// One table row as the template sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowView {
    pub name: String,
    pub address: String,
    pub phone: String,
    pub service_time: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub distance_text: String,
}

impl From<&PharmacyRecord> for RowView {
    fn from(record: &PharmacyRecord) -> Self {
        Self {
            name: record.name.clone(),
            address: record.address.clone(),
            phone: record.phone.clone(),
            service_time: record.service_time.clone(),
            from: record.on_duty_from.as_ref().map(display_timestamp),
            to: record.on_duty_to.as_ref().map(display_timestamp),
            distance_text: record.distance_text.clone(),
        }
    }
}

/// Everything the page template can refer to.
#[derive(Debug, Clone, Serialize)]
pub struct PageContext {
    pub title: String,
    pub logo_left: Option<String>,
    pub logo_right: Option<String>,
    pub refresh_secs: u64,
    pub previous: Vec<RowView>,
    pub current: Vec<RowView>,
    /// Separator text between the two tables, e.g. `ab 01.05.2024 08:30 Uhr`.
    pub changeover: String,
    pub generated_at: String,
}

/// Renders the signage page and writes it to the output path.
#[derive(Debug, Clone)]
pub struct PageRenderer {
    template: String,
    output: PathBuf,
    title: String,
    logo_left: Option<String>,
    logo_right: Option<String>,
    max_rows: usize,
    refresh_secs: u64,
    changeover_time: String,
}

impl PageRenderer {
    /// Build a renderer around `template`, rejecting templates that do not compile.
    pub fn new(template: String, output: impl Into<PathBuf>, title: impl Into<String>) -> Result<Self> {
        environment().template_from_str(&template).context("Invalid page template")?;

        Ok(Self {
            template,
            output: output.into(),
            title: title.into(),
            logo_left: None,
            logo_right: None,
            max_rows: 10,
            refresh_secs: 60,
            changeover_time: "08:30".to_string(),
        })
    }

    pub fn with_default_template(output: impl Into<PathBuf>, title: impl Into<String>) -> Result<Self> {
        Self::new(DEFAULT_TEMPLATE.to_string(), output, title)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let template = match &config.html_template {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read page template: {}", path.display()))?,
            None => DEFAULT_TEMPLATE.to_string(),
        };

        let mut renderer = Self::new(template, &config.html_page, &config.html_title)?;
        renderer.logo_left = config.html_logo_left.clone();
        renderer.logo_right = config.html_logo_right.clone();
        renderer.max_rows = config.max_table_rows;
        renderer.refresh_secs = config.refresh_secs;
        renderer.changeover_time = config.changeover_time.clone();
        Ok(renderer)
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn output(&self) -> &PathBuf {
        &self.output
    }

    pub fn context(
        &self,
        previous: &[PharmacyRecord],
        current: &[PharmacyRecord],
        now: DateTime<Local>,
    ) -> PageContext {
        let rows = |records: &[PharmacyRecord]| -> Vec<RowView> {
            records.iter().take(self.max_rows).map(RowView::from).collect()
        };

        PageContext {
            title: self.title.clone(),
            logo_left: self.logo_left.clone(),
            logo_right: self.logo_right.clone(),
            refresh_secs: self.refresh_secs,
            previous: rows(previous),
            current: rows(current),
            changeover: format!("ab {} {} Uhr", now.format("%d.%m.%Y"), self.changeover_time),
            generated_at: now.format("%d.%m.%Y %H:%M:%S").to_string(),
        }
    }

    pub fn render(&self, context: &PageContext) -> Result<String> {
        environment()
            .render_str(&self.template, context)
            .context("Failed to render page template")
    }

    pub fn write(&self, html: &str) -> Result<()> {
        if let Some(parent) = self.output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
        }

        fs::write(&self.output, html)
            .with_context(|| format!("Failed to write HTML page: {}", self.output.display()))?;

        tracing::info!(path = %self.output.display(), "HTML page written");
        Ok(())
    }
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::Html);
    env
}
