//! The river consumer: a single sequential loop that follows the
//! public-stash-tabs stream as close to its head as the upstream rate limits
//! allow.
//!
//! Each iteration issues one request, streams the body through the
//! extractor, reconciles any extracted tabs inside one transaction, appends
//! a changeset record, and sleeps off the remainder of the decoded wait.
//! The only concurrency is a periodic side task probing the true head of
//! the river to measure how far behind we are running.

use std::io;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::TryStreamExt;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::cursor;
use crate::error::PipelineError;
use crate::ninja;
use crate::rate_limit;
use crate::reconcile;
use crate::stash_stream;
use crate::store::{NewChangeset, Store};

const RIVER_URL: &str = "https://api.pathofexile.com/public-stash-tabs";

/// Ceiling on the exponential backoff applied while parked at the head.
const MAX_BACKOFFS: u32 = 6;

/// Head-probe frequency: one poe.ninja drift sample every this many polls.
const POENINJA_POLL_RATE: u64 = 60;

pub struct RiverConsumer {
    client: Client,
    store: Store,
    config: TrackerConfig,
    cursor: String,
    backoffs: u32,
    poll_index: u64,
}

impl RiverConsumer {
    /// Resolve the starting cursor and build the consumer.
    ///
    /// Priority: `INITIAL_CHANGE_ID` from the environment, then the live
    /// head when `--startFromHead` was passed, then the newest persisted
    /// changeset. With none of the three there is nothing to resume from.
    pub async fn new(
        client: Client,
        store: Store,
        config: TrackerConfig,
        start_from_head: bool,
    ) -> Result<Self, PipelineError> {
        let cursor = match &config.initial_change_id {
            Some(id) => id.clone(),
            None if start_from_head => {
                info!("no change id in environment; fetching latest id from poe.ninja");
                ninja::latest_change_id(&client).await?
            }
            None => match store.latest_changeset().await? {
                Some(changeset) => changeset.next_change_id,
                None => {
                    return Err(PipelineError::Config(
                        "nothing to resume from: set INITIAL_CHANGE_ID, pass --startFromHead, \
                         or run against a database with processed changesets"
                            .to_string(),
                    ))
                }
            },
        };
        info!("starting change id: {cursor}");

        Ok(Self {
            client,
            store,
            config,
            cursor,
            backoffs: 0,
            poll_index: 0,
        })
    }

    /// Poll until an error terminates the loop. Every iteration is atomic:
    /// it either runs through to the changeset write or returns the error,
    /// and the next process start resumes from the persisted cursor.
    pub async fn run(mut self) -> Result<(), PipelineError> {
        loop {
            self.poll_once().await?;
        }
    }

    async fn poll_once(&mut self) -> Result<(), PipelineError> {
        let mut request = self
            .client
            .get(RIVER_URL)
            .bearer_auth(&self.config.oauth_token)
            .header(reqwest::header::USER_AGENT, &self.config.user_agent);
        if !self.cursor.is_empty() {
            request = request.query(&[("id", self.cursor.as_str())]);
        }

        debug!("sending request");
        let resp = request.send().await?;
        let req_start = Instant::now();
        let processed_at = Utc::now();

        let status = resp.status();
        let rate_limited = status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        if !rate_limited && status != reqwest::StatusCode::OK {
            return Err(PipelineError::BadStatus {
                endpoint: "public-stash-tabs",
                status,
            });
        }
        let mut wait_ms = rate_limit::decode_wait_ms(status, resp.headers())?;
        if rate_limited {
            // recovered by the sleep at the loop tail, not fatal
            warn!("{}", PipelineError::RateLimited(wait_ms));
        }

        let next_cursor = resp
            .headers()
            .get("x-next-change-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if next_cursor.is_empty() && wait_ms == 0 {
            // head of the river; re-poll shortly
            debug!("no next change id");
            wait_ms = 60;
        } else if !next_cursor.is_empty() {
            debug!("next stash change id: {next_cursor}");
        }

        // dispatch the head probe before body decoding, join it after
        let head_probe: Option<JoinHandle<Result<String, PipelineError>>> =
            if self.poll_index == 0 {
                let client = self.client.clone();
                Some(tokio::spawn(
                    async move { ninja::latest_change_id(&client).await },
                ))
            } else {
                None
            };
        self.poll_index = (self.poll_index + 1) % POENINJA_POLL_RATE;

        let decode_start = Instant::now();
        let tabs = {
            let change_id = self.cursor.clone();
            let body = StreamReader::new(Box::pin(resp.bytes_stream().map_err(io::Error::other)));
            let reader = SyncIoBridge::new(body);
            tokio::task::spawn_blocking(move || stash_stream::extract_stashes(reader, &change_id))
                .await
                .map_err(|e| PipelineError::Network(format!("extractor task died: {e}")))??
        };
        info!(
            "processed {} stash tabs in {:?}",
            tabs.len(),
            decode_start.elapsed()
        );

        if tabs.is_empty() && !rate_limited {
            // back off while parked at the front of the river
            wait_ms = wait_ms.saturating_mul(1 << self.backoffs);
            if self.backoffs < MAX_BACKOFFS {
                self.backoffs += 1;
            }
        } else if !tabs.is_empty() {
            self.backoffs = 0;
            let db_start = Instant::now();
            reconcile::apply(self.store.pool(), &tabs).await?;
            info!("database updated in {:?}", db_start.elapsed());
        }

        let drift = match head_probe {
            Some(handle) => {
                let head = handle
                    .await
                    .map_err(|e| PipelineError::Network(format!("head probe died: {e}")))??;
                match cursor::drift_between(&head, &self.cursor) {
                    Ok(drift) => {
                        info!("drift from head: {drift}");
                        Some(drift)
                    }
                    Err(e @ PipelineError::CursorShapeMismatch { .. }) => {
                        warn!("{e}; recording null drift");
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };

        let elapsed = req_start.elapsed();
        if !tabs.is_empty() {
            self.store
                .insert_changeset(&NewChangeset {
                    change_id: self.cursor.clone(),
                    next_change_id: next_cursor.clone(),
                    stash_count: tabs.len() as i32,
                    processed_at,
                    time_taken_ms: elapsed.as_millis() as i64,
                    drift_from_head: drift,
                })
                .await?;
        }

        let wait = Duration::from_millis(wait_ms).saturating_sub(elapsed);
        if !wait.is_zero() {
            debug!("waiting {wait:?}");
            sleep(wait).await;
        }

        self.cursor = next_cursor;
        Ok(())
    }
}
