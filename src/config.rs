use std::env;

use crate::error::PipelineError;

/// Cluster size below which a price cluster is not considered an inlier set.
const DEFAULT_MIN_INLIER_CLUSTER_SIZE: usize = 3;

/// Process configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub db_connstr: String,
    pub oauth_token: String,
    pub user_agent: String,
    pub initial_change_id: Option<String>,
    pub leagues: Vec<String>,
    pub min_inlier_cluster_size: usize,
}

impl TrackerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenvy::dotenv().ok();

        let db_connstr = require("PG_DB_CONNSTR")?;
        let oauth_token = require("GGG_OAUTH_TOKEN")?;
        let user_agent = require("GGG_USERAGENT")?;

        let initial_change_id = env::var("INITIAL_CHANGE_ID")
            .ok()
            .filter(|v| !v.is_empty());

        let leagues = env::var("LEAGUES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        let min_inlier_cluster_size = match env::var("MIN_INLIER_CLUSTER_SIZE") {
            Ok(v) => v.parse().map_err(|_| {
                PipelineError::Config(format!(
                    "MIN_INLIER_CLUSTER_SIZE must be a positive integer, got {v:?}"
                ))
            })?,
            Err(_) => DEFAULT_MIN_INLIER_CLUSTER_SIZE,
        };

        Ok(Self {
            db_connstr,
            oauth_token,
            user_agent,
            initial_change_id,
            leagues,
            min_inlier_cluster_size,
        })
    }
}

fn require(key: &str) -> Result<String, PipelineError> {
    env::var(key).map_err(|_| PipelineError::Config(format!("{key} environment variable required")))
}
