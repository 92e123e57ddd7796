//! Bond lookup endpoints, called through [`AuthorizedClient`].

use serde::Deserialize;

use crate::authorized::{ApiRequest, AuthorizedClient};
use crate::error::SessionError;
use crate::history::HistorySync;

pub const BOND_SEARCH_PATH: &str = "/bonds/search/";
pub const BOND_MATCH_PATH: &str = "/bonds/match/";

#[derive(Debug, Deserialize)]
struct BondSearchResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct BondApi {
    client: AuthorizedClient,
    history: HistorySync,
}

impl BondApi {
    #[must_use]
    pub fn new(client: AuthorizedClient) -> Self {
        let history = HistorySync::new(client.clone());
        Self { client, history }
    }

    #[must_use]
    pub fn history(&self) -> &HistorySync {
        &self.history
    }

    /// Searches by free text and records the query in search history.
    pub async fn search_bonds(&self, query: &str) -> Result<Vec<serde_json::Value>, SessionError> {
        let query = non_blank(query, "search query")?;
        let response: BondSearchResponse = self
            .client
            .send_json(ApiRequest::get(BOND_SEARCH_PATH).with_query("query", query))
            .await?;

        if let Err(error) = self
            .history
            .record_search(query, response.results.len() as u64)
            .await
        {
            tracing::warn!(code = error.code(), error = %error, "failed to record search history");
        }
        Ok(response.results)
    }

    pub async fn match_bond(&self, bond_code: &str) -> Result<serde_json::Value, SessionError> {
        let bond_code = non_blank(bond_code, "bond code")?;
        self.client
            .send_json(ApiRequest::post(
                BOND_MATCH_PATH,
                serde_json::json!({ "bond_code": bond_code }),
            ))
            .await
    }

    pub async fn bond_details(&self, bond_code: &str) -> Result<serde_json::Value, SessionError> {
        let bond_code = non_blank(bond_code, "bond code")?;
        self.client
            .send_json(ApiRequest::get(bond_details_path(bond_code)))
            .await
    }
}

#[must_use]
pub fn bond_details_path(bond_code: &str) -> String {
    format!("/bonds/{}/", encode_path_component(bond_code.trim()))
}

fn non_blank<'a>(value: &'a str, field: &str) -> Result<&'a str, SessionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SessionError::InvalidInput {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(trimmed)
}

fn encode_path_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
