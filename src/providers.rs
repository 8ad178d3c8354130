// src/providers.rs
use crate::config::Config;
use crate::error::AppError;
use crate::models::{MarketCoin, TokenHolding};
use async_trait::async_trait;
use log::{debug, error};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Current coin prices ordered by market cap.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_markets(&self) -> Result<Vec<MarketCoin>, AppError>;
}

/// Per-address balance lookups.
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    /// Total USD value held at `address`.
    async fn fetch_net_worth(&self, address: &str) -> Result<f64, AppError>;

    async fn fetch_tokens(&self, address: &str) -> Result<Vec<TokenHolding>, AppError>;
}

/// Single-turn text generation.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AppError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoogleIdentity {
    pub email: String,
    pub name: Option<String>,
}

/// Verifies third-party ID tokens used for social sign-in.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, AppError>;
}

pub fn http_client(config: &Config) -> Result<Client, AppError> {
    Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()
        .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))
}

async fn ensure_success(provider: &str, response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("{} responded with HTTP {}: {}", provider, status, body);
    Err(AppError::Provider(format!(
        "{} responded with HTTP {}",
        provider, status
    )))
}

/// Numbers arrive as JSON numbers or numeric strings depending on the field.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CoinGeckoClient {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.coingecko_base_url.trim_end_matches('/').to_string(),
            api_key: config.coingecko_api_key.clone(),
        }
    }
}

#[async_trait]
impl MarketDataProvider for CoinGeckoClient {
    async fn fetch_markets(&self) -> Result<Vec<MarketCoin>, AppError> {
        let url = format!("{}/coins/markets", self.base_url);
        debug!("Fetching markets from {}", url);
        let response = self
            .client
            .get(&url)
            .query(&[("vs_currency", "usd"), ("order", "market_cap_desc")])
            .header("x-cg-demo-api-key", &self.api_key)
            .send()
            .await?;
        let coins = ensure_success("CoinGecko", response)
            .await?
            .json::<Vec<MarketCoin>>()
            .await?;
        Ok(coins)
    }
}

#[derive(Deserialize)]
struct NetWorthResponse {
    total_networth_usd: Value,
}

#[derive(Deserialize)]
struct TokenListResponse {
    #[serde(default)]
    result: Vec<MoralisToken>,
}

#[derive(Deserialize)]
struct MoralisToken {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    balance_formatted: Value,
    #[serde(default)]
    usd_value: Value,
}

impl From<MoralisToken> for TokenHolding {
    fn from(token: MoralisToken) -> Self {
        TokenHolding {
            symbol: token.symbol.unwrap_or_default(),
            name: token.name.unwrap_or_default(),
            quantity: coerce_f64(&token.balance_formatted).unwrap_or(0.0),
            usd_value: coerce_f64(&token.usd_value).unwrap_or(0.0),
        }
    }
}

pub struct MoralisClient {
    client: Client,
    base_url: String,
    api_key: String,
    chain: String,
}

impl MoralisClient {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.moralis_base_url.trim_end_matches('/').to_string(),
            api_key: config.moralis_api_key.clone(),
            chain: config.moralis_chain.clone(),
        }
    }
}

#[async_trait]
impl BalanceProvider for MoralisClient {
    async fn fetch_net_worth(&self, address: &str) -> Result<f64, AppError> {
        let url = format!("{}/wallets/{}/net-worth", self.base_url, address);
        debug!("Fetching net worth for {}", address);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("chains", self.chain.as_str()),
                ("exclude_spam", "true"),
                ("exclude_unverified_contracts", "true"),
            ])
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let body = ensure_success("Moralis", response)
            .await?
            .json::<NetWorthResponse>()
            .await?;
        coerce_f64(&body.total_networth_usd).ok_or_else(|| {
            AppError::Provider(format!(
                "Unparseable net worth for {}: {}",
                address, body.total_networth_usd
            ))
        })
    }

    async fn fetch_tokens(&self, address: &str) -> Result<Vec<TokenHolding>, AppError> {
        let url = format!("{}/wallets/{}/tokens", self.base_url, address);
        debug!("Fetching tokens for {}", address);
        let response = self
            .client
            .get(&url)
            .query(&[("chain", self.chain.as_str())])
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let body = ensure_success("Moralis", response)
            .await?
            .json::<TokenListResponse>()
            .await?;
        Ok(body.result.into_iter().map(TokenHolding::from).collect())
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateContentResponse {
    fn into_text(self) -> Option<String> {
        let candidate = self.candidates.into_iter().next()?;
        let text: String = candidate
            .content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect();
        Some(text)
    }
}

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.gemini_base_url.trim_end_matches('/').to_string(),
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
        }
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        debug!("Requesting completion from {} ({} chars)", self.model, prompt.len());
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({ "contents": [{ "parts": [{ "text": prompt }] }] }))
            .send()
            .await?;
        let body = ensure_success("Gemini", response)
            .await?
            .json::<GenerateContentResponse>()
            .await?;
        body.into_text()
            .ok_or_else(|| AppError::Provider("Gemini returned no candidates".to_string()))
    }
}

#[derive(Deserialize)]
struct TokenInfo {
    #[serde(default)]
    aud: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email_verified: Value,
}

impl TokenInfo {
    fn into_identity(self, client_id: &str) -> Result<GoogleIdentity, AppError> {
        let invalid = || AppError::Unauthorized("Invalid Google token".to_string());
        if self.aud != client_id {
            return Err(invalid());
        }
        // tokeninfo reports the flag as the string "true"
        let verified = matches!(&self.email_verified, Value::Bool(true))
            || matches!(&self.email_verified, Value::String(s) if s == "true");
        if !verified {
            return Err(invalid());
        }
        let email = self.email.filter(|e| !e.is_empty()).ok_or_else(invalid)?;
        Ok(GoogleIdentity {
            email,
            name: self.name,
        })
    }
}

pub struct GoogleTokenVerifier {
    client: Client,
    client_id: String,
}

impl GoogleTokenVerifier {
    const TOKENINFO_URL: &'static str = "https://oauth2.googleapis.com/tokeninfo";

    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            client_id: config.google_client_id.clone(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for GoogleTokenVerifier {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, AppError> {
        let response = self
            .client
            .get(Self::TOKENINFO_URL)
            .query(&[("id_token", id_token)])
            .send()
            .await?;
        if response.status().is_client_error() {
            return Err(AppError::Unauthorized("Invalid Google token".to_string()));
        }
        let info = ensure_success("Google", response)
            .await?
            .json::<TokenInfo>()
            .await?;
        info.into_identity(&self.client_id)
    }
}
