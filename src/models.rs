// src/models.rs
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ADDRESS_HEX_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    /// bcrypt hash; `None` for accounts created through Google sign-in.
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub email: String,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.username.trim().is_empty() {
            return Err(AppError::Validation("Username is required".to_string()));
        }
        if self.email.trim().is_empty() {
            return Err(AppError::Validation("Email is required".to_string()));
        }
        if !is_valid_email(self.email.trim()) {
            return Err(AppError::Validation("Invalid email format".to_string()));
        }
        if self.password.is_empty() {
            return Err(AppError::Validation("Password is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GoogleSignInRequest {
    #[serde(rename = "googleToken")]
    pub google_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WalletRequest {
    pub name: String,
    pub address: String,
}

impl WalletRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("Wallet name is required".to_string()));
        }
        if self.address.trim().is_empty() {
            return Err(AppError::Validation("Wallet address is required".to_string()));
        }
        if !is_valid_address(self.address.trim()) {
            return Err(AppError::Validation("Invalid wallet address".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PortfolioQuery {
    pub wallets: Option<String>,
    /// Limit `holdings` to the largest `top` entries by USD value.
    pub top: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AiMarketRequest {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHolding {
    pub symbol: String,
    pub name: String,
    pub quantity: f64,
    pub usd_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub total_balance: f64,
    pub native_and_token: Vec<Vec<TokenHolding>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedHolding {
    pub name: String,
    pub symbol: String,
    pub quantity: f64,
    pub usd_value: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioResponse {
    #[serde(flatten)]
    pub snapshot: BalanceSnapshot,
    pub holdings: Vec<MergedHolding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCoin {
    pub id: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub market_cap_rank: Option<u32>,
    #[serde(default)]
    pub total_volume: Option<f64>,
    #[serde(default)]
    pub price_change_percentage_24h: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiQueryResult {
    pub formatted: bool,
    pub data: Vec<Value>,
    pub message: String,
    pub success: bool,
}

/// `0x`/`0X` followed by exactly 40 hex digits.
pub fn is_valid_address(address: &str) -> bool {
    let digits = match address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
    {
        Some(rest) => rest,
        None => return false,
    };
    digits.len() == ADDRESS_HEX_LEN && digits.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Splits the `wallets` query parameter on commas, dropping empty entries.
pub fn parse_wallet_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
