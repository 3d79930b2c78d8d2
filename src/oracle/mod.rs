use std::{future::Future, time::Duration};

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

/// A USD price for one batch, and whether it came from the fallback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quote {
    pub price_usd: f64,
    pub fallback: bool,
}

pub trait PriceSource: Send + Sync + 'static {
    /// Never fails: any upstream problem resolves to the configured fallback.
    fn quote(&self) -> impl Future<Output = Quote> + Send;
}

#[derive(Clone, Debug)]
pub struct OracleConfig {
    pub base_url: String,
    pub mint: String,
    pub timeout: Duration,
    pub fallback_price_usd: f64,
}

/// DexScreener-style `latest/dex/tokens/{mint}` lookup.
#[derive(Clone)]
pub struct DexScreenerOracle {
    http: Client,
    config: OracleConfig,
}

#[derive(Deserialize)]
struct TokenPairs {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    price_usd: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum OracleError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("no usable priceUsd in response")]
    Malformed,
}

impl DexScreenerOracle {
    pub fn new(config: OracleConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    async fn fetch(&self) -> Result<f64, OracleError> {
        let url = format!(
            "{}/latest/dex/tokens/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.mint
        );
        let body: TokenPairs = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_price(body).ok_or(OracleError::Malformed)
    }
}

fn parse_price(body: TokenPairs) -> Option<f64> {
    let raw = body.pairs?.into_iter().next()?.price_usd?;
    let price: f64 = raw.trim().parse().ok()?;
    (price.is_finite() && price > 0.0).then_some(price)
}

impl PriceSource for DexScreenerOracle {
    async fn quote(&self) -> Quote {
        let limit = self.config.timeout;
        let outcome = match tokio::time::timeout(limit, self.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(limit)),
        };
        match outcome {
            Ok(price_usd) => {
                debug!(price_usd, "oracle price");
                Quote {
                    price_usd,
                    fallback: false,
                }
            }
            Err(err) => {
                warn!(error = %err, fallback = self.config.fallback_price_usd, "price oracle unavailable, using fallback");
                Quote {
                    price_usd: self.config.fallback_price_usd,
                    fallback: true,
                }
            }
        }
    }
}

/// Constant price, used offline and in tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedPrice(pub f64);

impl PriceSource for FixedPrice {
    async fn quote(&self) -> Quote {
        Quote {
            price_usd: self.0,
            fallback: false,
        }
    }
}
