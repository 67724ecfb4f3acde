//! poe.ninja client: the river head probe and per-league exchange rates.

use std::collections::HashMap;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::PipelineError;

const STATS_URL: &str = "https://poe.ninja/api/data/getstats";
const CURRENCY_OVERVIEW_URL: &str = "https://poe.ninja/api/data/currencyoverview";

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    next_change_id: String,
}

/// Fetch the current head of the river as seen by poe.ninja.
pub async fn latest_change_id(client: &Client) -> Result<String, PipelineError> {
    let resp = client.get(STATS_URL).send().await?;
    if !resp.status().is_success() {
        return Err(PipelineError::BadStatus {
            endpoint: "getstats",
            status: resp.status(),
        });
    }

    let stats: StatsResponse = resp.json().await?;
    if stats.next_change_id.is_empty() {
        return Err(PipelineError::Decode(
            "getstats returned no next_change_id".to_string(),
        ));
    }
    Ok(stats.next_change_id)
}

#[derive(Debug, Deserialize)]
struct CurrencyOverview {
    #[serde(default)]
    lines: Vec<CurrencyLine>,
    #[serde(default, rename = "currencyDetails")]
    currency_details: Vec<CurrencyDetail>,
}

#[derive(Debug, Deserialize)]
struct CurrencyLine {
    #[serde(rename = "currencyTypeName")]
    currency_type_name: String,
    #[serde(rename = "chaosEquivalent")]
    chaos_equivalent: f64,
}

#[derive(Debug, Deserialize)]
struct CurrencyDetail {
    name: String,
    #[serde(default, rename = "tradeId")]
    trade_id: String,
}

/// Fetch chaos-equivalent exchange rates for a league, keyed by the
/// canonical short trade id (`divine`, `exalted`, ...).
pub async fn exchange_rates(
    client: &Client,
    league: &str,
) -> Result<HashMap<String, f64>, PipelineError> {
    debug!("fetching currency data for {league}");
    let resp = client
        .get(CURRENCY_OVERVIEW_URL)
        .query(&[("league", league), ("type", "Currency")])
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(PipelineError::BadStatus {
            endpoint: "currencyoverview",
            status: resp.status(),
        });
    }

    let overview: CurrencyOverview = resp.json().await?;
    Ok(rates_from_overview(overview))
}

/// Join the overview lines (keyed by display name) against the
/// currency-details table to produce `{trade id -> chaos rate}`. Details
/// without a trade id are dropped.
fn rates_from_overview(overview: CurrencyOverview) -> HashMap<String, f64> {
    let mut trade_ids = HashMap::with_capacity(overview.currency_details.len());
    for detail in overview.currency_details {
        if !detail.trade_id.is_empty() {
            trade_ids.insert(detail.name, detail.trade_id);
        }
    }

    let mut rates = HashMap::with_capacity(overview.lines.len());
    for line in overview.lines {
        if let Some(trade_id) = trade_ids.get(&line.currency_type_name) {
            rates.insert(trade_id.clone(), line.chaos_equivalent);
        }
    }

    rates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overview_joins_lines_with_trade_ids() {
        let body = r#"{
            "lines": [
                {"currencyTypeName": "Divine Orb", "chaosEquivalent": 180.5},
                {"currencyTypeName": "Mirror of Kalandra", "chaosEquivalent": 99000.0},
                {"currencyTypeName": "Unlisted Currency", "chaosEquivalent": 1.0}
            ],
            "currencyDetails": [
                {"name": "Divine Orb", "tradeId": "divine"},
                {"name": "Mirror of Kalandra", "tradeId": "mirror"},
                {"name": "Unlisted Currency"}
            ]
        }"#;

        let overview: CurrencyOverview = serde_json::from_str(body).unwrap();
        let rates = rates_from_overview(overview);

        assert_eq!(rates.get("divine"), Some(&180.5));
        assert_eq!(rates.get("mirror"), Some(&99000.0));
        assert_eq!(rates.len(), 2);
    }

    #[test]
    fn test_stats_response_shape() {
        let stats: StatsResponse = serde_json::from_str(r#"{"next_change_id": "1-2-3"}"#).unwrap();
        assert_eq!(stats.next_change_id, "1-2-3");
    }
}
