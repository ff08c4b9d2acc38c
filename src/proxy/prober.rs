//! Probe executor: one network check of one proxy

use crate::proxy::models::{CheckResult, ProxyScheme, ProxyTarget};
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Proxy as ReqwestProxy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Default timeout for a single probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of concurrent probes for the synchronous path
const DEFAULT_CONCURRENCY: usize = 10;

/// Default URL to fetch through the proxy
const DEFAULT_TEST_URL: &str = "http://httpbin.org/ip";

/// Configuration for the probe executor
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Timeout for each probe
    pub timeout: Duration,
    /// Concurrent probes when checking a list synchronously
    pub concurrency: usize,
    /// URL to fetch through the proxy
    pub test_url: String,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            test_url: DEFAULT_TEST_URL.to_string(),
        }
    }
}

impl ProberConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }
}

/// One probe of one proxy. Implementations never fail the call itself:
/// every outcome, including transport errors, is a [`CheckResult`].
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &ProxyTarget) -> CheckResult;
}

/// Probe executor that fetches a test URL through the proxy
#[derive(Clone)]
pub struct HttpProber {
    config: ProberConfig,
}

impl HttpProber {
    pub fn new() -> Self {
        Self {
            config: ProberConfig::default(),
        }
    }

    pub fn with_config(config: ProberConfig) -> Self {
        Self { config }
    }

    /// Probe a list of targets with bounded concurrency. This is the
    /// synchronous small-batch path; session runs go through the
    /// orchestrator instead.
    pub async fn probe_many(&self, targets: Vec<ProxyTarget>) -> Vec<CheckResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        stream::iter(targets)
            .map(|target| {
                let sem = Arc::clone(&semaphore);
                let prober = self.clone();
                async move {
                    // Acquire only fails if the semaphore is closed, which
                    // cannot happen while we hold the Arc.
                    let _permit = sem
                        .acquire()
                        .await
                        .expect("Semaphore closed unexpectedly");
                    prober.probe(&target).await
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect::<Vec<_>>()
            .await
    }

    /// Create a reqwest client routed through the target proxy
    fn build_client(&self, target: &ProxyTarget) -> Result<Client> {
        let proxy_url = target.url();

        let reqwest_proxy = match target.scheme {
            ProxyScheme::Http | ProxyScheme::Https => ReqwestProxy::http(&proxy_url)?,
            ProxyScheme::Socks4 | ProxyScheme::Socks5 => ReqwestProxy::all(&proxy_url)?,
        };

        let client = Client::builder()
            .proxy(reqwest_proxy)
            .timeout(self.config.timeout)
            .build()?;

        Ok(client)
    }
}

#[async_trait]
impl Probe for HttpProber {
    async fn probe(&self, target: &ProxyTarget) -> CheckResult {
        let start = Instant::now();

        let client = match self.build_client(target) {
            Ok(client) => client,
            Err(e) => return CheckResult::offline(target.id, e.to_string()),
        };

        match tokio::time::timeout(self.config.timeout, client.get(&self.config.test_url).send())
            .await
        {
            Ok(Ok(response)) => {
                if response.status().is_success() {
                    let elapsed = start.elapsed().as_millis() as u64;
                    CheckResult::online(target.id, elapsed)
                } else {
                    CheckResult::offline(target.id, format!("HTTP status: {}", response.status()))
                }
            }
            Ok(Err(e)) => CheckResult::offline(target.id, e.to_string()),
            Err(_) => CheckResult::timed_out(target.id),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}
