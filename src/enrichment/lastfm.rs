//! Last.fm API client for fetching artist tags and listener stats.

use super::{EnrichmentProvider, ProviderError};
use anyhow::Result;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const LASTFM_API_BASE: &str = "https://ws.audioscrobbler.com/2.0/";
const MAX_TAGS: usize = 5;
/// Last.fm's "artist not found" error code.
const LASTFM_INVALID_PARAMETERS: i64 = 6;

pub struct LastFmEnrichmentProvider {
    client: Client,
    api_key: String,
}

#[derive(Deserialize)]
struct ApiError {
    error: i64,
    message: Option<String>,
}

#[derive(Deserialize)]
struct TopTagsResponse {
    toptags: Option<TopTagsContainer>,
}

#[derive(Deserialize)]
struct TopTagsContainer {
    tag: Option<Vec<LastFmTag>>,
}

#[derive(Deserialize)]
struct LastFmTag {
    name: Option<String>,
}

#[derive(Deserialize)]
struct ArtistInfoResponse {
    artist: Option<ArtistInfo>,
}

#[derive(Deserialize)]
struct ArtistInfo {
    stats: Option<ArtistStats>,
}

#[derive(Deserialize)]
struct ArtistStats {
    listeners: Option<String>,
    playcount: Option<String>,
}

fn check_api_error(body: &Value) -> Result<()> {
    if let Ok(err) = serde_json::from_value::<ApiError>(body.clone()) {
        let message = err.message.unwrap_or_default();
        if err.error == LASTFM_INVALID_PARAMETERS {
            return Err(ProviderError::NotFound(message).into());
        }
        return Err(ProviderError::Api(format!("error {}: {}", err.error, message)).into());
    }
    Ok(())
}

fn parse_top_tags(body: Value) -> Result<Vec<String>> {
    check_api_error(&body)?;
    let response: TopTagsResponse = serde_json::from_value(body)
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    let tags = response
        .toptags
        .and_then(|t| t.tag)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| t.name)
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .take(MAX_TAGS)
        .collect();
    Ok(tags)
}

fn parse_artist_info(body: Value) -> Result<Option<Value>> {
    check_api_error(&body)?;
    let response: ArtistInfoResponse = serde_json::from_value(body)
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    let Some(stats) = response.artist.and_then(|a| a.stats) else {
        return Ok(None);
    };
    let parse = |s: Option<String>| s.and_then(|v| v.parse::<u64>().ok());
    Ok(Some(json!({
        "listeners": parse(stats.listeners),
        "playcount": parse(stats.playcount),
    })))
}

impl LastFmEnrichmentProvider {
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
        })
    }

    fn call(&self, method: &str, artist: &str) -> Result<Value> {
        let url = format!(
            "{}?method={}&artist={}&api_key={}&format=json&autocorrect=1",
            LASTFM_API_BASE,
            method,
            urlencoding::encode(artist),
            self.api_key
        );

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited.into());
        }
        // Last.fm reports unknown artists with a JSON error body
        if !status.is_success() && status.as_u16() != 400 && status.as_u16() != 404 {
            return Err(ProviderError::Status(status.as_u16()).into());
        }

        let body: Value = response
            .json()
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(body)
    }
}

impl EnrichmentProvider for LastFmEnrichmentProvider {
    fn fetch_tags(&self, name: &str) -> Result<Vec<String>> {
        parse_top_tags(self.call("artist.gettoptags", name)?)
    }

    fn fetch_features(&self, name: &str) -> Result<Option<Value>> {
        parse_artist_info(self.call("artist.getinfo", name)?)
    }
}
