use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

use crate::{geo::Coordinate, source::SourceId};

/// Environment variable that points at an explicit TOML config file.
pub const CONFIG_PATH_VAR: &str = "NOTDIENST_CONFIG";

/// Runtime configuration.
///
/// Layers, lowest first: built-in defaults, an optional TOML file, then
/// environment variables (a `.env` file in the working directory is honored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data source, "feed" or "portal".
    pub source: String,
    pub api_url: Option<String>,
    pub portal_url: String,
    /// Location code passed to the portal search.
    pub location: Option<String>,
    /// WebDriver endpoint (chromedriver, geckodriver) that renders the portal page.
    pub webdriver_url: String,

    pub test_mode: bool,
    pub test_xml_file: Option<PathBuf>,
    /// Where the raw feed XML is archived after each fetch.
    pub xml_file: Option<PathBuf>,

    pub reference_lat: Option<f64>,
    pub reference_lon: Option<f64>,

    pub html_page: PathBuf,
    pub html_title: String,
    pub html_logo_left: Option<String>,
    pub html_logo_right: Option<String>,
    pub html_template: Option<PathBuf>,
    pub max_table_rows: usize,
    pub refresh_secs: u64,
    /// Time of day shown on the separator between the previous and current table.
    pub changeover_time: String,

    pub snapshot_previous: PathBuf,
    pub snapshot_current: PathBuf,

    pub fetch_timeout_secs: u64,
    /// Delay between runs; 0 runs once and exits.
    pub poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceId::Feed.as_str().to_string(),
            api_url: None,
            portal_url: "https://lak-bayern.notdienst-portal.de/blakportal/".to_string(),
            location: None,
            webdriver_url: "http://localhost:4444".to_string(),
            test_mode: false,
            test_xml_file: None,
            xml_file: None,
            reference_lat: None,
            reference_lon: None,
            html_page: PathBuf::from("notdienst.html"),
            html_title: "Apotheken-Notdienst".to_string(),
            html_logo_left: None,
            html_logo_right: None,
            html_template: None,
            max_table_rows: 10,
            refresh_secs: 60,
            changeover_time: "08:30".to_string(),
            snapshot_previous: PathBuf::from("yesterday.json"),
            snapshot_current: PathBuf::from("today.json"),
            fetch_timeout_secs: 10,
            poll_interval_secs: 300,
        }
    }
}

impl Config {
    /// Load all layers and validate the result.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let path = Self::config_file_path()?;
        let mut cfg = if path.exists() {
            Self::from_toml_file(&path)?
        } else {
            Self::default()
        };

        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Path to the config file: `$NOTDIENST_CONFIG`, else the platform config dir.
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(explicit) = env::var(CONFIG_PATH_VAR) {
            return Ok(PathBuf::from(explicit));
        }

        let dirs = ProjectDirs::from("de", "notdienst", "notdienst")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Override fields from environment-style keys. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("SOURCE") {
            self.source = v;
        }
        if let Some(v) = get("API_URL") {
            self.api_url = Some(v);
        }
        if let Some(v) = get("PORTAL_URL") {
            self.portal_url = v;
        }
        if let Some(v) = get("LOCATION") {
            self.location = Some(v);
        }
        if let Some(v) = get("WEBDRIVER_URL") {
            self.webdriver_url = v;
        }
        if let Some(v) = get("TEST_MODE") {
            self.test_mode = parse_flag(&v);
        }
        if let Some(v) = get("TEST_XML_FILE") {
            self.test_xml_file = Some(v.into());
        }
        if let Some(v) = get("XML_FILE") {
            self.xml_file = Some(v.into());
        }
        if let Some(v) = get("REFERENCE_LAT") {
            self.reference_lat = Some(parse_number("REFERENCE_LAT", &v)?);
        }
        if let Some(v) = get("REFERENCE_LON") {
            self.reference_lon = Some(parse_number("REFERENCE_LON", &v)?);
        }
        if let Some(v) = get("HTML_PAGE") {
            self.html_page = v.into();
        }
        if let Some(v) = get("HTML_TITLE") {
            self.html_title = v;
        }
        if let Some(v) = get("HTML_LOGO_LEFT").or_else(|| get("HTML_LOGO")) {
            self.html_logo_left = Some(v);
        }
        if let Some(v) = get("HTML_LOGO_RIGHT") {
            self.html_logo_right = Some(v);
        }
        if let Some(v) = get("HTML_TEMPLATE") {
            self.html_template = Some(v.into());
        }
        if let Some(v) = get("MAX_TABLE_ROWS") {
            self.max_table_rows = parse_number("MAX_TABLE_ROWS", &v)?;
        }
        if let Some(v) = get("REFRESH_SECS") {
            self.refresh_secs = parse_number("REFRESH_SECS", &v)?;
        }
        if let Some(v) = get("CHANGEOVER_TIME") {
            self.changeover_time = v;
        }
        if let Some(v) = get("SNAPSHOT_PREVIOUS") {
            self.snapshot_previous = v.into();
        }
        if let Some(v) = get("SNAPSHOT_CURRENT") {
            self.snapshot_current = v.into();
        }
        if let Some(v) = get("FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse_number("FETCH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_number("POLL_INTERVAL_SECS", &v)?;
        }

        Ok(())
    }

    /// Check that everything the selected source needs is present.
    pub fn validate(&self) -> Result<()> {
        match self.source_id()? {
            SourceId::Feed => {
                if self.test_mode {
                    if self.test_xml_file.is_none() {
                        return Err(anyhow!(
                            "TEST_MODE is set but no TEST_XML_FILE is configured.\n\
                             Hint: point TEST_XML_FILE at a local feed fixture."
                        ));
                    }
                } else if self.api_url.is_none() {
                    return Err(anyhow!(
                        "No API_URL configured for the feed source.\n\
                         Hint: set API_URL, or SOURCE=portal to scrape the portal page."
                    ));
                }
                self.reference()?;
            }
            SourceId::Portal => {
                if self.location.is_none() {
                    return Err(anyhow!(
                        "No LOCATION configured for the portal source.\n\
                         Hint: set LOCATION to the portal's location code."
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn source_id(&self) -> Result<SourceId> {
        SourceId::try_from(self.source.as_str())
    }

    /// The reference location distances are measured from.
    pub fn reference(&self) -> Result<Coordinate> {
        match (self.reference_lat, self.reference_lon) {
            (Some(lat), Some(lon)) => Ok(Coordinate::new(lat, lon)),
            _ => Err(anyhow!(
                "No reference location configured.\n\
                 Hint: set REFERENCE_LAT and REFERENCE_LON in decimal degrees."
            )),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("{key} must be a valid number, got '{value}'"))
}
