// src/portfolio.rs
use crate::error::AppError;
use crate::models::{BalanceSnapshot, MergedHolding, TokenHolding};
use crate::providers::BalanceProvider;
use futures::future::try_join_all;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

pub struct PortfolioAggregator {
    balances: Arc<dyn BalanceProvider>,
}

impl PortfolioAggregator {
    pub fn new(balances: Arc<dyn BalanceProvider>) -> Self {
        Self { balances }
    }

    /// Looks up net worth and holdings for every address concurrently.
    ///
    /// The first failing lookup fails the whole aggregation; no partial
    /// snapshot is ever returned. `native_and_token` keeps input order.
    pub async fn aggregate(&self, addresses: &[String]) -> Result<BalanceSnapshot, AppError> {
        if addresses.is_empty() {
            return Err(AppError::NotFound("No wallet connected".to_string()));
        }

        let lookups = addresses.iter().map(|address| async move {
            futures::try_join!(
                self.balances.fetch_net_worth(address),
                self.balances.fetch_tokens(address)
            )
        });
        let per_wallet = try_join_all(lookups).await?;

        let mut total_balance = 0.0;
        let mut native_and_token = Vec::with_capacity(per_wallet.len());
        for (net_worth, tokens) in per_wallet {
            total_balance += net_worth;
            native_and_token.push(tokens);
        }

        info!(
            "Aggregated {} wallets, total balance {:.2} USD",
            addresses.len(),
            total_balance
        );
        Ok(BalanceSnapshot {
            total_balance,
            native_and_token,
        })
    }
}

/// Flattens per-wallet holdings and sums them by case-insensitive symbol.
///
/// Groups come out in first-seen order and keep the first display name seen.
pub fn merge_holdings(per_wallet: &[Vec<TokenHolding>]) -> Vec<MergedHolding> {
    let mut merged: Vec<MergedHolding> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for holding in per_wallet.iter().flatten() {
        let symbol = holding.symbol.trim().to_uppercase();
        match index.get(&symbol) {
            Some(&i) => {
                merged[i].quantity += holding.quantity;
                merged[i].usd_value += holding.usd_value;
            }
            None => {
                index.insert(symbol.clone(), merged.len());
                merged.push(MergedHolding {
                    name: holding.name.clone(),
                    symbol,
                    quantity: holding.quantity,
                    usd_value: holding.usd_value,
                });
            }
        }
    }
    merged
}

/// The `n` largest holdings by USD value.
pub fn top_holdings(merged: &[MergedHolding], n: usize) -> Vec<MergedHolding> {
    let mut sorted = merged.to_vec();
    sorted.sort_by(|a, b| b.usd_value.total_cmp(&a.usd_value));
    sorted.truncate(n);
    sorted
}
