use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::FetchError;
use crate::model::GeoElement;

pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

/// Overpass QL that prints, for each building in the named area, the tagged
/// nodes inside it and then the building itself.
pub fn build_city_query(city: &str, server_timeout_secs: u64) -> String {
    let escaped = city.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"[out:json][timeout:{server_timeout_secs}];
area["name"="{escaped}"]->.searchArea;
(
  way["building"](area.searchArea);
  relation["building"](area.searchArea);
)->.all_buildings;
foreach.all_buildings -> .b {{
  (
    .b map_to_area -> .area;
    node(area.area)(if: count_tags() > 0);
    .b;
  );
  out;
}};
"#
    )
}

pub struct OverpassClient {
    client: Client,
    endpoint: String,
    http_timeout: Duration,
}

impl OverpassClient {
    pub fn new(endpoint: &str, http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .build()
            .context("failed to create Overpass HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            http_timeout,
        })
    }

    pub fn fetch_elements(&self, query: &str) -> Result<Vec<GeoElement>, FetchError> {
        let map_err = |err: reqwest::Error| {
            if err.is_timeout() {
                FetchError::Timeout {
                    ceiling: self.http_timeout,
                }
            } else {
                FetchError::Transport(err.to_string())
            }
        };

        info!(endpoint = %self.endpoint, "sending overpass query");
        let resp = self
            .client
            .post(&self.endpoint)
            .form(&[("data", query)])
            .send()
            .map_err(map_err)?;

        let status = resp.status();
        let body = resp.bytes().map_err(map_err)?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        parse_elements(&body)
    }
}

pub fn read_elements_file(path: &Path) -> Result<Vec<GeoElement>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_elements(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[derive(Deserialize)]
struct OverpassDocument {
    elements: Vec<serde_json::Value>,
    #[serde(default)]
    remark: Option<String>,
}

/// Decodes the Overpass JSON document. Elements are decoded one by one so a
/// malformed element is reported with its position; any malformed element
/// fails the whole document. A `remark` carrying a runtime error means the
/// element list is truncated, so it fails the document too.
pub fn parse_elements(body: &[u8]) -> Result<Vec<GeoElement>, FetchError> {
    let document: OverpassDocument =
        serde_json::from_slice(body).map_err(FetchError::MalformedJson)?;

    if let Some(remark) = document.remark {
        if remark.contains("runtime error") {
            return Err(FetchError::Remark(remark));
        }
        warn!(remark = %remark, "overpass remark");
    }

    document
        .elements
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value::<GeoElement>(value)
                .map_err(|source| FetchError::MalformedElement { index, source })
        })
        .collect()
}
