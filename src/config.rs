// src/config.rs
use crate::error::AppError;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub scylla_uri: Option<String>,
    pub coingecko_api_key: String,
    pub coingecko_base_url: String,
    pub moralis_api_key: String,
    pub moralis_base_url: String,
    pub moralis_chain: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub google_client_id: String,
    /// Answer 201 instead of 200 when Google sign-in creates a new account.
    /// Off by default to keep the historical always-200 behavior.
    pub google_signin_created_status: bool,
    pub http_timeout_secs: u64,
    pub market_context_limit: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            bind_addr: parse_or("BIND_ADDR", IpAddr::from([127, 0, 0, 1]))?,
            port: parse_or("PORT", 3030)?,
            jwt_secret: required("JWT_SECRET")?,
            token_ttl_hours: parse_or("TOKEN_TTL_HOURS", 24)?,
            scylla_uri: optional("SCYLLA_URI"),
            coingecko_api_key: optional("COINGECKO_API_KEY").unwrap_or_default(),
            coingecko_base_url: optional("COINGECKO_BASE_URL")
                .unwrap_or_else(|| "https://api.coingecko.com/api/v3".to_string()),
            moralis_api_key: optional("MORALIS_API_KEY").unwrap_or_default(),
            moralis_base_url: optional("MORALIS_BASE_URL")
                .unwrap_or_else(|| "https://deep-index.moralis.io/api/v2.2".to_string()),
            moralis_chain: optional("MORALIS_CHAIN").unwrap_or_else(|| "eth".to_string()),
            gemini_api_key: optional("GEMINI_API_KEY").unwrap_or_default(),
            gemini_base_url: optional("GEMINI_BASE_URL").unwrap_or_else(|| {
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            }),
            gemini_model: optional("GEMINI_MODEL")
                .unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            google_client_id: optional("GOOGLE_CLIENT_ID").unwrap_or_default(),
            google_signin_created_status: parse_or("GOOGLE_SIGNIN_CREATED_STATUS", false)?,
            http_timeout_secs: parse_or("HTTP_TIMEOUT_SECS", 30)?,
            market_context_limit: parse_or("MARKET_CONTEXT_LIMIT", 20)?,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> Result<String, AppError> {
    optional(key).ok_or_else(|| AppError::Config(format!("{} must be set", key)))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Failed to parse {}: {:?}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            jwt_secret: "test_secret".to_string(),
            token_ttl_hours: 1,
            scylla_uri: None,
            coingecko_api_key: String::new(),
            coingecko_base_url: String::new(),
            moralis_api_key: String::new(),
            moralis_base_url: String::new(),
            moralis_chain: "eth".to_string(),
            gemini_api_key: String::new(),
            gemini_base_url: String::new(),
            gemini_model: "gemini-1.5-flash".to_string(),
            google_client_id: "client-id".to_string(),
            google_signin_created_status: false,
            http_timeout_secs: 5,
            market_context_limit: 5,
        }
    }
}
