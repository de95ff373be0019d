use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use quick_xml::{Reader, events::Event};
use reqwest::Client;
use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use crate::{
    Config,
    geo::Coordinate,
    model::{PharmacyRecord, compose_address, format_distance},
    render::display_timestamp,
};

use super::{PharmacySource, SourceError, SourceId, get_text, truncate_body};

/// Where the feed document comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedOrigin {
    Url(String),
    /// Local fixture, used in test mode.
    File(PathBuf),
}

/// Pharmacy entries from the XML feed, with distances measured from a
/// reference coordinate.
#[derive(Debug, Clone)]
pub struct FeedSource {
    origin: FeedOrigin,
    reference: Coordinate,
    archive: Option<PathBuf>,
    timeout: Duration,
    http: Client,
}

impl FeedSource {
    pub fn new(origin: FeedOrigin, reference: Coordinate, timeout: Duration) -> Self {
        Self { origin, reference, archive: None, timeout, http: Client::new() }
    }

    /// Also write every fetched document to `path`.
    pub fn with_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive = Some(path.into());
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let origin = match (&config.test_xml_file, &config.api_url) {
            (Some(path), _) if config.test_mode => FeedOrigin::File(path.clone()),
            (_, Some(url)) => FeedOrigin::Url(url.clone()),
            _ => anyhow::bail!(
                "No feed location configured.\n\
                 Hint: set API_URL, or TEST_MODE=True with TEST_XML_FILE."
            ),
        };

        let reference = config.reference().context("The feed source needs a reference location")?;

        let mut source = Self::new(origin, reference, config.fetch_timeout());
        if let Some(path) = &config.xml_file {
            source = source.with_archive(path);
        }
        Ok(source)
    }

    async fn read_document(&self) -> Result<Option<String>, SourceError> {
        match &self.origin {
            FeedOrigin::File(path) => {
                tracing::info!(path = %path.display(), "Reading feed fixture");
                fs::read_to_string(path)
                    .map(Some)
                    .map_err(|source| SourceError::Io { path: path.clone(), source })
            }
            FeedOrigin::Url(url) => {
                tracing::info!(url = %url, "Requesting feed");
                let (status, body) = get_text(&self.http, url, &[], self.timeout).await?;

                if !status.is_success() {
                    tracing::warn!(
                        url = %url,
                        status = %status,
                        body = %truncate_body(&body),
                        "Feed request failed; no entries this run"
                    );
                    return Ok(None);
                }
                Ok(Some(body))
            }
        }
    }

    fn archive_document(&self, xml: &str) {
        let Some(path) = &self.archive else { return };

        match fs::write(path, xml) {
            Ok(()) => tracing::debug!(path = %path.display(), "Feed XML archived"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to archive feed XML"),
        }
    }
}

#[async_trait]
impl PharmacySource for FeedSource {
    fn id(&self) -> SourceId {
        SourceId::Feed
    }

    async fn fetch(&self) -> Result<Vec<PharmacyRecord>, SourceError> {
        let Some(xml) = self.read_document().await? else {
            return Ok(Vec::new());
        };

        self.archive_document(&xml);

        let records = parse_feed(&xml, self.reference)?;
        tracing::info!(count = records.len(), "Parsed feed entries");
        Ok(records)
    }
}

type RawEntry = HashMap<String, String>;

/// Parse every `entry` element directly under an `entries` element, at any
/// depth, into records measured from `reference`.
pub fn parse_feed(xml: &str, reference: Coordinate) -> Result<Vec<PharmacyRecord>, SourceError> {
    parse_raw_entries(xml)?
        .into_iter()
        .enumerate()
        .map(|(index, raw)| build_record(index, &raw, reference))
        .collect()
}

fn parse_raw_entries(xml: &str) -> Result<Vec<RawEntry>, SourceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut entries = Vec::new();
    // Depth of the open `entry` element and the fields collected so far.
    let mut open: Option<(usize, RawEntry)> = None;

    loop {
        let event = reader.read_event().map_err(|e| SourceError::Xml {
            position: reader.buffer_position(),
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if open.is_none() && name == "entry" && path.last().is_some_and(|p| p == "entries")
                {
                    open = Some((path.len(), RawEntry::new()));
                }
                path.push(name);
            }
            Event::Empty(e) => {
                if let Some((depth, fields)) = open.as_mut() {
                    if path.len() == *depth + 1 {
                        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                        fields.entry(name).or_default();
                    }
                }
            }
            Event::Text(t) => {
                if let Some((depth, fields)) = open.as_mut() {
                    if path.len() == *depth + 2 {
                        let text = t.unescape().map_err(|e| SourceError::Xml {
                            position: reader.buffer_position(),
                            message: e.to_string(),
                        })?;
                        if let Some(field) = path.last() {
                            fields.entry(field.clone()).or_default().push_str(&text);
                        }
                    }
                }
            }
            Event::CData(c) => {
                if let Some((depth, fields)) = open.as_mut() {
                    if path.len() == *depth + 2 {
                        if let Some(field) = path.last() {
                            fields
                                .entry(field.clone())
                                .or_default()
                                .push_str(&String::from_utf8_lossy(&c));
                        }
                    }
                }
            }
            Event::End(_) => {
                path.pop();
                if open.as_ref().is_some_and(|(depth, _)| *depth == path.len()) {
                    if let Some((_, fields)) = open.take() {
                        entries.push(fields);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

fn build_record(
    index: usize,
    raw: &RawEntry,
    reference: Coordinate,
) -> Result<PharmacyRecord, SourceError> {
    let text = |field: &'static str| -> Result<String, SourceError> {
        raw.get(field).map(|v| v.trim().to_string()).ok_or(SourceError::MissingField { index, field })
    };
    let optional = |field: &str| raw.get(field).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let number = |field: &'static str| -> Result<f64, SourceError> {
        let value = text(field)?;
        match value.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(n),
            _ => Err(SourceError::InvalidField { index, field, value }),
        }
    };
    let timestamp = |field: &'static str| -> Result<DateTime<FixedOffset>, SourceError> {
        let value = text(field)?;
        DateTime::parse_from_rfc3339(&value)
            .map_err(|_| SourceError::InvalidField { index, field, value })
    };

    let street = text("street")?;
    let zip_code = text("zipCode")?;
    let locality = text("location")?;
    let from = timestamp("from")?;
    let to = timestamp("to")?;
    let coordinate = Coordinate::new(number("lat")?, number("lon")?);
    let distance = reference.distance_km(&coordinate);

    Ok(PharmacyRecord {
        id: optional("id"),
        name: text("name")?,
        phone: text("phone")?,
        address: compose_address(&street, &zip_code, &locality),
        street,
        zip_code,
        locality,
        sub_locality: optional("subLocation"),
        service_time: format!("{} - {}", display_timestamp(&from), display_timestamp(&to)),
        on_duty_from: Some(from),
        on_duty_to: Some(to),
        latitude: Some(coordinate.latitude),
        longitude: Some(coordinate.longitude),
        distance,
        distance_text: format_distance(distance),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARIENPLATZ: Coordinate = Coordinate::new(48.1374, 11.5755);

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<response>
  <header><count>2</count></header>
  <entries>
    <entry>
      <id>4711</id>
      <from>2024-05-01T06:30:00.000+00:00</from>
      <to>2024-05-02T06:30:00.000+00:00</to>
      <name>Linden-Apotheke</name>
      <street>Lindenstr. 3</street>
      <zipCode>80331</zipCode>
      <location>München</location>
      <subLocation/>
      <phone>089 123456</phone>
      <lat>48.1374</lat>
      <lon>11.5755</lon>
    </entry>
    <entry>
      <id>4712</id>
      <from>2024-05-01T06:30:00.000+00:00</from>
      <to>2024-05-02T06:30:00.000+00:00</to>
      <name>Apotheke &amp; Drogerie am Tor</name>
      <street>Torweg 9</street>
      <zipCode>85221</zipCode>
      <location>Dachau</location>
      <subLocation>Altstadt</subLocation>
      <phone>08131 9876</phone>
      <lat>48.2600</lat>
      <lon>11.4340</lon>
    </entry>
  </entries>
</response>"#;

    #[test]
    fn parses_all_entries_in_document_order() {
        let records = parse_feed(FEED, MARIENPLATZ).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_deref(), Some("4711"));
        assert_eq!(records[0].name, "Linden-Apotheke");
        assert_eq!(records[0].address, "Lindenstr. 3, 80331, München");
        assert_eq!(records[0].sub_locality, None);
        assert_eq!(records[1].name, "Apotheke & Drogerie am Tor");
        assert_eq!(records[1].sub_locality.as_deref(), Some("Altstadt"));
    }

    #[test]
    fn computes_distance_from_reference() {
        let records = parse_feed(FEED, MARIENPLATZ).unwrap();

        assert_eq!(records[0].distance, 0.0);
        assert_eq!(records[0].distance_text, "0,0 km");
        assert!(records[1].distance > 16.0 && records[1].distance < 18.0);
        assert_eq!(records[1].coordinate(), Some(Coordinate::new(48.26, 11.434)));
    }

    #[test]
    fn keeps_duty_window_timestamps() {
        let records = parse_feed(FEED, MARIENPLATZ).unwrap();
        let from = records[0].on_duty_from.unwrap();

        assert_eq!(from.to_rfc3339(), "2024-05-01T06:30:00+00:00");
        assert!(records[0].service_time.contains(" - "));
    }

    #[test]
    fn missing_field_is_fatal() {
        let xml = "<entries><entry><name>X</name></entry></entries>";
        let err = parse_feed(xml, MARIENPLATZ).unwrap_err();
        assert!(matches!(err, SourceError::MissingField { index: 0, .. }));
    }

    #[test]
    fn unparsable_coordinate_is_fatal() {
        let xml = FEED.replace("<lat>48.2600</lat>", "<lat>north</lat>");
        let err = parse_feed(&xml, MARIENPLATZ).unwrap_err();
        assert!(matches!(err, SourceError::InvalidField { index: 1, field: "lat", .. }));
    }

    #[test]
    fn non_finite_coordinate_is_fatal() {
        let xml = FEED.replace("<lon>11.5755</lon>", "<lon>NaN</lon>");
        let err = parse_feed(&xml, MARIENPLATZ).unwrap_err();
        assert!(matches!(err, SourceError::InvalidField { index: 0, field: "lon", .. }));

        let xml = FEED.replace("<lat>48.2600</lat>", "<lat>inf</lat>");
        let err = parse_feed(&xml, MARIENPLATZ).unwrap_err();
        assert!(matches!(err, SourceError::InvalidField { index: 1, field: "lat", .. }));
    }

    #[test]
    fn entries_outside_entries_element_are_ignored() {
        let xml = "<root><entry><name>stray</name></entry><entries></entries></root>";
        assert!(parse_feed(xml, MARIENPLATZ).unwrap().is_empty());
    }

    #[test]
    fn malformed_xml_is_an_error() {
        let err = parse_feed("<entries><entry></entries>", MARIENPLATZ).unwrap_err();
        assert!(matches!(err, SourceError::Xml { .. }));
    }

    #[tokio::test]
    async fn test_mode_reads_fixture_and_archives_it() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("fixture.xml");
        let archive = dir.path().join("last.xml");
        fs::write(&fixture, FEED).unwrap();

        let source = FeedSource::new(
            FeedOrigin::File(fixture),
            MARIENPLATZ,
            Duration::from_secs(1),
        )
        .with_archive(&archive);

        let records = source.fetch().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(fs::read_to_string(&archive).unwrap(), FEED);
    }

    #[tokio::test]
    async fn missing_fixture_is_an_io_error() {
        let source = FeedSource::new(
            FeedOrigin::File("/nonexistent/feed.xml".into()),
            MARIENPLATZ,
            Duration::from_secs(1),
        );

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn from_config_prefers_fixture_in_test_mode() {
        let cfg = Config {
            api_url: Some("https://example.test/feed.xml".into()),
            test_mode: true,
            test_xml_file: Some("fixture.xml".into()),
            reference_lat: Some(48.0),
            reference_lon: Some(11.0),
            ..Config::default()
        };

        let source = FeedSource::from_config(&cfg).unwrap();
        assert_eq!(source.origin, FeedOrigin::File("fixture.xml".into()));
    }
}
