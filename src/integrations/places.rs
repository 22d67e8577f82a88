use serde::Deserialize;

const DETAIL_FIELDS: &str =
    "formatted_phone_number,international_phone_number,name,formatted_address,website,opening_hours";

/// Google Places (legacy web service) text search and details.
pub struct PlacesClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlaceSummary {
    pub place_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub formatted_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlaceDetails {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub formatted_phone_number: Option<String>,
    #[serde(default)]
    pub international_phone_number: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Deserialize)]
struct TextSearchResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlaceSummary>,
}

#[derive(Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    result: Option<PlaceDetails>,
}

impl PlacesClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, "https://maps.googleapis.com/maps/api/place")
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, PlacesError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| PlacesError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlacesError::Api(format!("{status}: {body}")));
        }
        resp.json().await.map_err(|e| PlacesError::Request(e.to_string()))
    }

    /// Matches for a free-text query. Any status other than `OK` yields no
    /// results.
    pub async fn text_search(&self, query: &str) -> Result<Vec<PlaceSummary>, PlacesError> {
        let resp: TextSearchResponse = self.get("/textsearch/json", &[("query", query)]).await?;
        if resp.status != "OK" {
            tracing::debug!(status = %resp.status, query, "Places text search returned nothing");
            return Ok(Vec::new());
        }
        Ok(resp.results)
    }

    pub async fn details(&self, place_id: &str) -> Result<Option<PlaceDetails>, PlacesError> {
        let resp: DetailsResponse = self
            .get(
                "/details/json",
                &[("place_id", place_id), ("fields", DETAIL_FIELDS)],
            )
            .await?;
        Ok(resp.result)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlacesError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Places API error: {0}")]
    Api(String),
}
