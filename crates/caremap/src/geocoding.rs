use std::future::Future;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::types::Coordinates;

pub const KAKAO_ADDRESS_ENDPOINT: &str = "https://dapi.kakao.com/v2/local/search/address.json";

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Geocoding service answered with status {0}")]
    Status(u16),
    #[error("Malformed geocoding response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Invalid coordinate value '{0}'")]
    Coordinate(String),
    #[error("Invalid geocoding endpoint: {0}")]
    Endpoint(String),
    #[error("KAKAO_REST_API_KEY is not set")]
    MissingApiKey,
}

/// Resolves a free-text address. `Ok(None)` means the provider knows no match.
pub trait Geocoder: Send + Sync {
    fn geocode(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Option<Coordinates>, GeocodeError>> + Send;
}

#[derive(Debug, Deserialize)]
struct AddressSearchResponse {
    documents: Vec<AddressDocument>,
}

/// Kakao returns coordinates as decimal strings: `x` is longitude, `y` latitude.
#[derive(Debug, Deserialize)]
struct AddressDocument {
    x: String,
    y: String,
}

fn parse_coordinate(raw: &str) -> Result<f64, GeocodeError> {
    raw.trim()
        .parse()
        .map_err(|_| GeocodeError::Coordinate(raw.to_string()))
}

pub fn parse_address_search(body: &str) -> Result<Option<Coordinates>, GeocodeError> {
    let response: AddressSearchResponse = serde_json::from_str(body)?;
    let Some(first) = response.documents.first() else {
        return Ok(None);
    };
    Ok(Some(Coordinates {
        latitude: parse_coordinate(&first.y)?,
        longitude: parse_coordinate(&first.x)?,
    }))
}

pub struct KakaoGeocoder {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl KakaoGeocoder {
    pub fn new(api_key: Option<String>) -> Result<Self, GeocodeError> {
        Self::with_endpoint(KAKAO_ADDRESS_ENDPOINT, api_key)
    }

    pub fn with_endpoint(endpoint: &str, api_key: Option<String>) -> Result<Self, GeocodeError> {
        let endpoint = Url::parse(endpoint).map_err(|e| GeocodeError::Endpoint(e.to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }
}

impl Geocoder for KakaoGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let address = address.trim();
        if address.is_empty() {
            return Ok(None);
        }
        let api_key = self.api_key.as_deref().ok_or(GeocodeError::MissingApiKey)?;

        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("query", address);

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("KakaoAK {api_key}"))
            .send()
            .await
            .inspect_err(|e| log::error!("Geocoding request error: {e:?}"))?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Geocoding '{}' failed with status {}", address, status);
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let coordinates = parse_address_search(&body)?;
        if coordinates.is_none() {
            log::warn!("No geocoding match for '{}'", address);
        }
        Ok(coordinates)
    }
}
