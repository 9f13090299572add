//! Client for the Boskos resource broker.
//!
//! Projects can be leased from a shared pool instead of being listed
//! explicitly. A lease is held as long as the owner keeps heartbeating it;
//! released projects are marked dirty so the broker's janitor can clean them.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoConfig;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Broker settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KT2_BOSKOS",
    discovery(
        app_name = "kt2",
        env_var = "KT2_CONFIG_PATH",
        config_file_name = "kt2.toml",
        dotfile_name = ".kt2.toml",
        project_file_name = "kt2.toml"
    )
)]
pub struct BoskosConfig {
    /// Base URL of the broker, for example `http://boskos.test-pods`.
    pub location: Option<String>,
    /// Resource type to lease.
    #[ortho_config(default = "gke-project".to_owned())]
    pub resource_type: String,
    /// Owner name recorded on leases.
    #[ortho_config(default = "kt2".to_owned())]
    pub owner: String,
    /// How long to wait for a free resource.
    #[ortho_config(default = 300)]
    pub acquire_timeout_secs: u64,
    /// Interval between lease renewals.
    #[ortho_config(default = 300)]
    pub heartbeat_interval_secs: u64,
    /// Interval between acquisition attempts while the pool is empty.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
}

impl BoskosConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BoskosError::Config`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, BoskosError> {
        Self::load_from_iter([OsString::from("kt2")])
            .map_err(|err| BoskosError::Config(err.to_string()))
    }

    /// Rejects settings that would stall acquisition or stop lease renewal.
    ///
    /// # Errors
    ///
    /// Returns [`BoskosError::InvalidInterval`] naming the variable to fix.
    pub const fn validate(&self) -> Result<(), BoskosError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(BoskosError::InvalidInterval {
                env_var: "KT2_BOSKOS_HEARTBEAT_INTERVAL_SECS",
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(BoskosError::InvalidInterval {
                env_var: "KT2_BOSKOS_POLL_INTERVAL_SECS",
            });
        }
        Ok(())
    }

    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Errors raised while talking to the broker.
#[derive(Debug, Error)]
pub enum BoskosError {
    /// Broker settings could not be loaded.
    #[error("boskos configuration failed: {0}")]
    Config(String),
    /// An interval was configured as zero seconds.
    #[error("{env_var} must be at least one second")]
    InvalidInterval {
        /// Variable holding the interval.
        env_var: &'static str,
    },
    /// No broker location was configured.
    #[error("no boskos location: set --boskos-location or KT2_BOSKOS_LOCATION")]
    MissingLocation,
    /// The broker location is not a valid URL.
    #[error("invalid boskos location '{location}': {message}")]
    InvalidLocation {
        /// Location as configured.
        location: String,
        /// Parser message.
        message: String,
    },
    /// The request could not be sent or its body not read.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Request URL.
        url: String,
        /// Underlying error text.
        message: String,
    },
    /// The broker answered with an unexpected status.
    #[error("{url} returned {status}: {body}")]
    Status {
        /// Request URL.
        url: String,
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },
    /// No resource became free in time.
    #[error("no free {resource_type} resource within {waited:?}")]
    Timeout {
        /// Resource type requested.
        resource_type: String,
        /// How long acquisition waited.
        waited: Duration,
    },
}

/// A leased resource.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Resource {
    /// Resource name; for GKE project pools, the project id.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type", default)]
    pub resource_type: String,
    /// Broker-side state after the call.
    #[serde(default)]
    pub state: String,
}

/// Future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BoskosError>> + Send + 'a>>;

/// Lease operations offered by a resource broker.
pub trait ResourceBroker: Send + Sync {
    /// Leases one free resource of `resource_type`, waiting while none is free.
    fn acquire<'a>(&'a self, resource_type: &'a str) -> BrokerFuture<'a, Resource>;

    /// Renews the lease on `name`.
    fn heartbeat<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Returns `name` to the pool as dirty.
    fn release<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;
}

/// HTTP [`ResourceBroker`] speaking the Boskos REST API.
#[derive(Clone, Debug)]
pub struct BoskosClient {
    client: Client,
    base: Url,
    owner: String,
    acquire_timeout: Duration,
    poll_interval: Duration,
}

impl BoskosClient {
    /// Builds a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BoskosError::MissingLocation`] or
    /// [`BoskosError::InvalidLocation`] when the location is unusable.
    pub fn from_config(config: &BoskosConfig) -> Result<Self, BoskosError> {
        let location = config
            .location
            .as_deref()
            .map(str::trim)
            .filter(|location| !location.is_empty())
            .ok_or(BoskosError::MissingLocation)?;
        let base = Url::parse(location).map_err(|err| BoskosError::InvalidLocation {
            location: location.to_owned(),
            message: err.to_string(),
        })?;
        Ok(Self {
            client: Client::new(),
            base,
            owner: config.owner.clone(),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    /// URL for leasing a free resource.
    #[must_use]
    pub fn acquire_url(&self, resource_type: &str) -> Url {
        self.endpoint(
            "acquire",
            &[
                ("type", resource_type),
                ("state", "free"),
                ("dest", "busy"),
                ("owner", &self.owner),
            ],
        )
    }

    /// URL for renewing a lease.
    #[must_use]
    pub fn update_url(&self, name: &str) -> Url {
        self.endpoint(
            "update",
            &[("name", name), ("state", "busy"), ("owner", &self.owner)],
        )
    }

    /// URL for releasing a lease.
    #[must_use]
    pub fn release_url(&self, name: &str) -> Url {
        self.endpoint(
            "release",
            &[("name", name), ("dest", "dirty"), ("owner", &self.owner)],
        )
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        let base_path = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{base_path}/{path}"));
        url.query_pairs_mut().clear().extend_pairs(query);
        url
    }

    async fn post(&self, url: &Url) -> Result<(StatusCode, String), BoskosError> {
        debug!(%url, "boskos request");
        let transport = |err: reqwest::Error| BoskosError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        };
        let response = self
            .client
            .post(url.clone())
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        Ok((status, body))
    }

    async fn post_ok(&self, url: &Url) -> Result<(), BoskosError> {
        let (status, body) = self.post(url).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(BoskosError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn acquire_resource(&self, resource_type: &str) -> Result<Resource, BoskosError> {
        let url = self.acquire_url(resource_type);
        let started = Instant::now();
        loop {
            let (status, body) = self.post(&url).await?;
            if status.is_success() {
                let resource: Resource =
                    serde_json::from_str(&body).map_err(|err| BoskosError::Transport {
                        url: url.to_string(),
                        message: err.to_string(),
                    })?;
                info!(resource = %resource.name, %resource_type, "leased resource");
                return Ok(resource);
            }
            if status != StatusCode::NOT_FOUND {
                return Err(BoskosError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            let waited = started.elapsed();
            if waited + self.poll_interval > self.acquire_timeout {
                return Err(BoskosError::Timeout {
                    resource_type: resource_type.to_owned(),
                    waited,
                });
            }
            debug!(%resource_type, "no free resource yet");
            sleep(self.poll_interval).await;
        }
    }
}

impl ResourceBroker for BoskosClient {
    fn acquire<'a>(&'a self, resource_type: &'a str) -> BrokerFuture<'a, Resource> {
        Box::pin(async move { self.acquire_resource(resource_type).await })
    }

    fn heartbeat<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move { self.post_ok(&self.update_url(name)).await })
    }

    fn release<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.post_ok(&self.release_url(name)).await?;
            info!(resource = %name, "released resource");
            Ok(())
        })
    }
}

/// Leases `count` resources. On failure, resources already leased are
/// released before the error is returned.
///
/// # Errors
///
/// Returns the first [`BoskosError`] raised by acquisition.
pub async fn acquire_many(
    broker: &dyn ResourceBroker,
    resource_type: &str,
    count: usize,
) -> Result<Vec<Resource>, BoskosError> {
    let mut leased = Vec::with_capacity(count);
    for _ in 0..count {
        match broker.acquire(resource_type).await {
            Ok(resource) => leased.push(resource),
            Err(err) => {
                for resource in &leased {
                    if let Err(release_err) = broker.release(&resource.name).await {
                        warn!(resource = %resource.name, error = %release_err, "failed to release lease");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(leased)
}

/// Shortest renewal period the heartbeat task accepts.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Background task that renews leases until stopped.
#[derive(Debug)]
pub struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts renewing `names` every `period`.
    #[must_use]
    pub fn start(broker: Arc<dyn ResourceBroker>, names: Vec<String>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let child = token.child_token();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period.max(MIN_HEARTBEAT_INTERVAL));
            // The first tick completes immediately; leases are fresh.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => {
                        for name in &names {
                            if let Err(err) = broker.heartbeat(name).await {
                                warn!(resource = %name, error = %err, "lease heartbeat failed");
                            }
                        }
                    }
                }
            }
        });
        Self { token, handle }
    }

    /// Stops the task and waits for it to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "heartbeat task ended abnormally");
        }
    }
}
