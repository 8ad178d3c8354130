// src/db.rs
use crate::error::AppError;
use crate::models::{User, Wallet};
use async_trait::async_trait;
use log::info;
use scylla::{frame::response::result::Row, query::Query, Session, SessionBuilder};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence for users and their wallet addresses.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with a validation error when the email is already taken.
    async fn create_user(&self, user: User) -> Result<User, AppError>;
    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, AppError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    async fn list_wallets(&self, user_id: &str) -> Result<Vec<Wallet>, AppError>;
    async fn find_wallet(&self, id: &str) -> Result<Option<Wallet>, AppError>;
    async fn add_wallet(&self, wallet: &Wallet) -> Result<(), AppError>;
    async fn update_wallet(&self, wallet: &Wallet) -> Result<(), AppError>;
    async fn delete_wallet(&self, id: &str) -> Result<(), AppError>;
}

fn db_err(e: impl std::fmt::Display) -> AppError {
    AppError::Database(e.to_string())
}

fn duplicate_email() -> AppError {
    AppError::Validation("Email must be unique".to_string())
}

pub struct ScyllaStore {
    session: Session,
}

impl ScyllaStore {
    pub async fn init(uri: &str) -> Result<Self, AppError> {
        let session = SessionBuilder::new()
            .known_node(uri)
            .build()
            .await
            .map_err(db_err)?;

        session.query("CREATE KEYSPACE IF NOT EXISTS crypto_tracker WITH REPLICATION = {'class': 'SimpleStrategy', 'replication_factor': 1}", &[]).await.map_err(db_err)?;
        session.query("CREATE TABLE IF NOT EXISTS crypto_tracker.users (id TEXT PRIMARY KEY, username TEXT, email TEXT, password TEXT)", &[]).await.map_err(db_err)?;
        session
            .query(
                "CREATE INDEX IF NOT EXISTS ON crypto_tracker.users (email)",
                &[],
            )
            .await
            .map_err(db_err)?;
        session.query("CREATE TABLE IF NOT EXISTS crypto_tracker.wallets (id TEXT PRIMARY KEY, user_id TEXT, name TEXT, address TEXT)", &[]).await.map_err(db_err)?;
        session
            .query(
                "CREATE INDEX IF NOT EXISTS ON crypto_tracker.wallets (user_id)",
                &[],
            )
            .await
            .map_err(db_err)?;

        info!("Successfully connected to ScyllaDB at {}.", uri);
        Ok(Self { session })
    }

    async fn select_users(&self, query: &str, key: &str) -> Result<Vec<User>, AppError> {
        let result = self
            .session
            .query(Query::new(query), (key,))
            .await
            .map_err(db_err)?;
        Ok(result
            .rows
            .unwrap_or_default()
            .iter()
            .filter_map(user_from_row)
            .collect())
    }

    async fn select_wallets(&self, query: &str, key: &str) -> Result<Vec<Wallet>, AppError> {
        let result = self
            .session
            .query(Query::new(query), (key,))
            .await
            .map_err(db_err)?;
        Ok(result
            .rows
            .unwrap_or_default()
            .iter()
            .filter_map(wallet_from_row)
            .collect())
    }
}

fn text(row: &Row, idx: usize) -> Option<String> {
    row.columns
        .get(idx)
        .and_then(|col| col.as_ref())
        .and_then(|v| v.as_text())
        .map(|s| s.to_string())
}

fn user_from_row(row: &Row) -> Option<User> {
    Some(User {
        id: text(row, 0)?,
        username: text(row, 1).unwrap_or_default(),
        email: text(row, 2)?,
        password: text(row, 3),
    })
}

fn wallet_from_row(row: &Row) -> Option<Wallet> {
    Some(Wallet {
        id: text(row, 0)?,
        user_id: text(row, 1)?,
        name: text(row, 2).unwrap_or_default(),
        address: text(row, 3)?,
    })
}

#[async_trait]
impl Store for ScyllaStore {
    // The email index is not a uniqueness constraint; two concurrent
    // registrations for one address can both pass the lookup.
    async fn create_user(&self, user: User) -> Result<User, AppError> {
        if self.find_user_by_email(&user.email).await?.is_some() {
            return Err(duplicate_email());
        }
        let query = Query::new(
            "INSERT INTO crypto_tracker.users (id, username, email, password) VALUES (?, ?, ?, ?)",
        );
        self.session
            .query(
                query,
                (
                    user.id.as_str(),
                    user.username.as_str(),
                    user.email.as_str(),
                    user.password.as_deref(),
                ),
            )
            .await
            .map_err(db_err)?;
        Ok(user)
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, AppError> {
        let users = self
            .select_users(
                "SELECT id, username, email, password FROM crypto_tracker.users WHERE id = ?",
                id,
            )
            .await?;
        Ok(users.into_iter().next())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let users = self
            .select_users(
                "SELECT id, username, email, password FROM crypto_tracker.users WHERE email = ?",
                email,
            )
            .await?;
        Ok(users.into_iter().next())
    }

    async fn list_wallets(&self, user_id: &str) -> Result<Vec<Wallet>, AppError> {
        self.select_wallets(
            "SELECT id, user_id, name, address FROM crypto_tracker.wallets WHERE user_id = ?",
            user_id,
        )
        .await
    }

    async fn find_wallet(&self, id: &str) -> Result<Option<Wallet>, AppError> {
        let wallets = self
            .select_wallets(
                "SELECT id, user_id, name, address FROM crypto_tracker.wallets WHERE id = ?",
                id,
            )
            .await?;
        Ok(wallets.into_iter().next())
    }

    async fn add_wallet(&self, wallet: &Wallet) -> Result<(), AppError> {
        let query = Query::new(
            "INSERT INTO crypto_tracker.wallets (id, user_id, name, address) VALUES (?, ?, ?, ?)",
        );
        self.session
            .query(
                query,
                (
                    wallet.id.as_str(),
                    wallet.user_id.as_str(),
                    wallet.name.as_str(),
                    wallet.address.as_str(),
                ),
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_wallet(&self, wallet: &Wallet) -> Result<(), AppError> {
        self.add_wallet(wallet).await
    }

    async fn delete_wallet(&self, id: &str) -> Result<(), AppError> {
        let query = Query::new("DELETE FROM crypto_tracker.wallets WHERE id = ?");
        self.session.query(query, (id,)).await.map_err(db_err)?;
        Ok(())
    }
}

/// Process-local store, used when no `SCYLLA_URI` is configured.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, User>>,
    wallets: RwLock<Vec<Wallet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: User) -> Result<User, AppError> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == user.email) {
            return Err(duplicate_email());
        }
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, AppError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn list_wallets(&self, user_id: &str) -> Result<Vec<Wallet>, AppError> {
        Ok(self
            .wallets
            .read()
            .await
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_wallet(&self, id: &str) -> Result<Option<Wallet>, AppError> {
        Ok(self.wallets.read().await.iter().find(|w| w.id == id).cloned())
    }

    async fn add_wallet(&self, wallet: &Wallet) -> Result<(), AppError> {
        self.wallets.write().await.push(wallet.clone());
        Ok(())
    }

    async fn update_wallet(&self, wallet: &Wallet) -> Result<(), AppError> {
        let mut wallets = self.wallets.write().await;
        match wallets.iter_mut().find(|w| w.id == wallet.id) {
            Some(existing) => {
                *existing = wallet.clone();
                Ok(())
            }
            None => Err(AppError::NotFound("Wallet not found".to_string())),
        }
    }

    async fn delete_wallet(&self, id: &str) -> Result<(), AppError> {
        self.wallets.write().await.retain(|w| w.id != id);
        Ok(())
    }
}
