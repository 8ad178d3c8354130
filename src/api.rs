// src/api.rs
use crate::auth::{create_token, hash_password, verify_password, with_auth, AuthUser};
use crate::config::Config;
use crate::db::Store;
use crate::error::{handle_rejection, AppError};
use crate::models::{
    is_valid_address, parse_wallet_list, AiMarketRequest, AiQueryResult, GoogleSignInRequest,
    LoginRequest, MarketCoin, PortfolioQuery, PortfolioResponse, PublicUser, RegisterRequest,
    TokenResponse, User, Wallet, WalletRequest,
};
use crate::normalizer::normalize;
use crate::portfolio::{merge_holdings, top_holdings, PortfolioAggregator};
use crate::providers::{BalanceProvider, IdentityVerifier, MarketDataProvider, TextGenerator};
use log::{error, info};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub markets: Arc<dyn MarketDataProvider>,
    pub aggregator: PortfolioAggregator,
    pub generator: Arc<dyn TextGenerator>,
    pub identity: Arc<dyn IdentityVerifier>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        markets: Arc<dyn MarketDataProvider>,
        balances: Arc<dyn BalanceProvider>,
        generator: Arc<dyn TextGenerator>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            config,
            store,
            markets,
            aggregator: PortfolioAggregator::new(balances),
            generator,
            identity,
        }
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let auth = with_auth(
        state.store.clone(),
        Arc::new(state.config.jwt_secret.clone()),
    );

    let register = warp::path!("register")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(register_handler);

    let login = warp::path!("login")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(login_handler);

    let google_sign_in = warp::path!("google-signin")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(google_sign_in_handler);

    let list_wallets = warp::path!("wallets")
        .and(warp::get())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .and_then(list_wallets_handler);

    let add_wallet = warp::path!("wallets")
        .and(warp::post())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(add_wallet_handler);

    let update_wallet = warp::path!("wallets" / String)
        .and(warp::put())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(update_wallet_handler);

    let delete_wallet = warp::path!("wallets" / String)
        .and(warp::delete())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .and_then(delete_wallet_handler);

    let markets = warp::path!("markets")
        .and(warp::get())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .and_then(markets_handler);

    let portfolio = warp::path!("portofolios")
        .and(warp::get())
        .and(auth.clone())
        .and(with_state(state.clone()))
        .and(warp::query::<PortfolioQuery>())
        .and_then(portfolio_handler);

    let ai_markets = warp::path!("ai-markets")
        .and(warp::post())
        .and(auth)
        .and(with_state(state))
        .and(warp::body::json())
        .and_then(ai_markets_handler);

    register
        .or(login)
        .or(google_sign_in)
        .or(list_wallets)
        .or(add_wallet)
        .or(update_wallet)
        .or(delete_wallet)
        .or(markets)
        .or(portfolio)
        .or(ai_markets)
        .recover(handle_rejection)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn fail(action: &str, e: AppError) -> Rejection {
    error!("Failed to {}: {}", action, e);
    warp::reject::custom(e)
}

async fn register(state: &AppState, req: RegisterRequest) -> Result<PublicUser, AppError> {
    req.validate()?;
    let user = User {
        id: Uuid::new_v4().to_string(),
        username: req.username.trim().to_string(),
        email: req.email.trim().to_lowercase(),
        password: Some(hash_password(req.password).await?),
    };
    let user = state.store.create_user(user).await?;
    Ok(PublicUser::from(&user))
}

async fn login(state: &AppState, req: LoginRequest) -> Result<TokenResponse, AppError> {
    if req.email.trim().is_empty() {
        return Err(AppError::BadRequest("Email is required".to_string()));
    }
    if req.password.is_empty() {
        return Err(AppError::BadRequest("Password is required".to_string()));
    }

    let invalid = || AppError::Unauthorized("Invalid email/password".to_string());
    let user = state
        .store
        .find_user_by_email(&req.email.trim().to_lowercase())
        .await?
        .ok_or_else(invalid)?;
    // Google-only accounts have no password to check against.
    let hash = user.password.clone().ok_or_else(invalid)?;
    if !verify_password(req.password, hash).await? {
        return Err(invalid());
    }

    let access_token = create_token(&user, &state.config.jwt_secret, state.config.token_ttl_hours)?;
    Ok(TokenResponse { access_token })
}

async fn google_sign_in(
    state: &AppState,
    req: GoogleSignInRequest,
) -> Result<(TokenResponse, bool), AppError> {
    if req.google_token.trim().is_empty() {
        return Err(AppError::BadRequest("Google token is required".to_string()));
    }
    let identity = state.identity.verify(req.google_token.trim()).await?;
    let email = identity.email.trim().to_lowercase();

    let (user, created) = match state.store.find_user_by_email(&email).await? {
        Some(user) => (user, false),
        None => {
            let username = identity
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
            let user = User {
                id: Uuid::new_v4().to_string(),
                username,
                email,
                password: None,
            };
            (state.store.create_user(user).await?, true)
        }
    };

    let access_token = create_token(&user, &state.config.jwt_secret, state.config.token_ttl_hours)?;
    Ok((TokenResponse { access_token }, created))
}

async fn owned_wallet(state: &AppState, user: &AuthUser, id: &str) -> Result<Wallet, AppError> {
    let wallet = state
        .store
        .find_wallet(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Wallet not found".to_string()))?;
    if wallet.user_id != user.id {
        return Err(AppError::Forbidden("Forbidden".to_string()));
    }
    Ok(wallet)
}

async fn add_wallet(
    state: &AppState,
    user: &AuthUser,
    req: WalletRequest,
) -> Result<Wallet, AppError> {
    req.validate()?;
    let wallet = Wallet {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        name: req.name.trim().to_string(),
        address: req.address.trim().to_string(),
    };
    state.store.add_wallet(&wallet).await?;
    Ok(wallet)
}

async fn update_wallet(
    state: &AppState,
    user: &AuthUser,
    id: &str,
    req: WalletRequest,
) -> Result<Wallet, AppError> {
    let wallet = owned_wallet(state, user, id).await?;
    req.validate()?;
    let updated = Wallet {
        name: req.name.trim().to_string(),
        address: req.address.trim().to_string(),
        ..wallet
    };
    state.store.update_wallet(&updated).await?;
    Ok(updated)
}

async fn delete_wallet(state: &AppState, user: &AuthUser, id: &str) -> Result<Wallet, AppError> {
    let wallet = owned_wallet(state, user, id).await?;
    state.store.delete_wallet(&wallet.id).await?;
    Ok(wallet)
}

async fn portfolio(
    state: &AppState,
    user: &AuthUser,
    query: PortfolioQuery,
) -> Result<PortfolioResponse, AppError> {
    let addresses = parse_wallet_list(query.wallets.as_deref());
    if let Some(bad) = addresses.iter().find(|a| !is_valid_address(a)) {
        return Err(AppError::BadRequest(format!("Invalid wallet address: {}", bad)));
    }
    if !addresses.is_empty() {
        let owned = state.store.list_wallets(&user.id).await?;
        let unowned = addresses.iter().find(|a| {
            !owned
                .iter()
                .any(|w| w.address.eq_ignore_ascii_case(a))
        });
        if let Some(address) = unowned {
            return Err(AppError::Forbidden(format!(
                "Wallet {} is not connected to this account",
                address
            )));
        }
    }

    let snapshot = state.aggregator.aggregate(&addresses).await?;
    let merged = merge_holdings(&snapshot.native_and_token);
    let holdings = match query.top {
        Some(n) => top_holdings(&merged, n),
        None => merged,
    };
    Ok(PortfolioResponse { snapshot, holdings })
}

fn build_market_prompt(query: &str, coins: &[MarketCoin]) -> Result<String, AppError> {
    let market_data = serde_json::to_string(coins)?;
    Ok(format!(
        r#"You are a cryptocurrency market analyst. Answer the question below using only the market data provided.

Market data (JSON, ordered by market cap):
{}

Question: {}

Respond with a JSON array of objects with the fields "id", "symbol", "name", "current_price", "price_change_percentage_24h" and "reason", inside a ```json code block, followed by a short explanation written in the same language as the question."#,
        market_data, query
    ))
}

async fn ai_markets(state: &AppState, req: AiMarketRequest) -> Result<AiQueryResult, AppError> {
    let query = req.query.trim();
    if query.is_empty() {
        return Err(AppError::BadRequest("Query is required".to_string()));
    }

    let mut coins = state.markets.fetch_markets().await?;
    coins.truncate(state.config.market_context_limit);
    let prompt = build_market_prompt(query, &coins)?;
    let text = state.generator.generate(&prompt).await?;
    tokio::task::spawn_blocking(move || normalize(&text))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn register_handler(
    state: Arc<AppState>,
    req: RegisterRequest,
) -> Result<impl Reply, Rejection> {
    match register(&state, req).await {
        Ok(user) => {
            info!("User {} registered.", user.email);
            Ok(warp::reply::with_status(
                warp::reply::json(&user),
                StatusCode::CREATED,
            ))
        }
        Err(e) => Err(fail("register user", e)),
    }
}

async fn login_handler(state: Arc<AppState>, req: LoginRequest) -> Result<impl Reply, Rejection> {
    match login(&state, req).await {
        Ok(token) => {
            info!("User logged in.");
            Ok(warp::reply::json(&token))
        }
        Err(e) => Err(fail("log in", e)),
    }
}

async fn google_sign_in_handler(
    state: Arc<AppState>,
    req: GoogleSignInRequest,
) -> Result<impl Reply, Rejection> {
    match google_sign_in(&state, req).await {
        Ok((token, created)) => {
            info!("Google sign-in succeeded (new account: {}).", created);
            let status = if created && state.config.google_signin_created_status {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            Ok(warp::reply::with_status(warp::reply::json(&token), status))
        }
        Err(e) => Err(fail("sign in with Google", e)),
    }
}

async fn list_wallets_handler(
    user: AuthUser,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    match state.store.list_wallets(&user.id).await {
        Ok(wallets) => {
            info!("Listed {} wallets for user {}.", wallets.len(), user.id);
            Ok(warp::reply::json(&wallets))
        }
        Err(e) => Err(fail("list wallets", e)),
    }
}

async fn add_wallet_handler(
    user: AuthUser,
    state: Arc<AppState>,
    req: WalletRequest,
) -> Result<impl Reply, Rejection> {
    match add_wallet(&state, &user, req).await {
        Ok(wallet) => {
            info!("Wallet {} added for user {}.", wallet.id, user.id);
            Ok(warp::reply::with_status(
                warp::reply::json(&wallet),
                StatusCode::CREATED,
            ))
        }
        Err(e) => Err(fail("add wallet", e)),
    }
}

async fn update_wallet_handler(
    id: String,
    user: AuthUser,
    state: Arc<AppState>,
    req: WalletRequest,
) -> Result<impl Reply, Rejection> {
    match update_wallet(&state, &user, &id, req).await {
        Ok(wallet) => {
            info!("Wallet {} updated.", wallet.id);
            Ok(warp::reply::json(&wallet))
        }
        Err(e) => Err(fail("update wallet", e)),
    }
}

async fn delete_wallet_handler(
    id: String,
    user: AuthUser,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    match delete_wallet(&state, &user, &id).await {
        Ok(wallet) => {
            info!("Wallet {} deleted.", wallet.id);
            Ok(warp::reply::json(
                &json!({ "message": format!("Wallet {} deleted", wallet.name) }),
            ))
        }
        Err(e) => Err(fail("delete wallet", e)),
    }
}

async fn markets_handler(_user: AuthUser, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    match state.markets.fetch_markets().await {
        Ok(coins) => {
            info!("Fetched {} market coins.", coins.len());
            Ok(warp::reply::json(&coins))
        }
        Err(e) => Err(fail("fetch markets", e)),
    }
}

async fn portfolio_handler(
    user: AuthUser,
    state: Arc<AppState>,
    query: PortfolioQuery,
) -> Result<impl Reply, Rejection> {
    match portfolio(&state, &user, query).await {
        Ok(response) => {
            info!("Portfolio computed for user {}.", user.id);
            Ok(warp::reply::json(&response))
        }
        Err(e) => Err(fail("compute portfolio", e)),
    }
}

async fn ai_markets_handler(
    user: AuthUser,
    state: Arc<AppState>,
    req: AiMarketRequest,
) -> Result<impl Reply, Rejection> {
    match ai_markets(&state, req).await {
        Ok(result) => {
            info!(
                "AI market query for user {} answered (formatted: {}).",
                user.id, result.formatted
            );
            Ok(warp::reply::json(&result))
        }
        Err(e) => Err(fail("answer AI market query", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::TokenHolding;
    use crate::providers::GoogleIdentity;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const WALLET_A: &str = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const WALLET_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const BROKEN_WALLET: &str = "0xdeaddeaddeaddeaddeaddeaddeaddeaddeaddead";

    struct FakeMarkets;

    #[async_trait]
    impl MarketDataProvider for FakeMarkets {
        async fn fetch_markets(&self) -> Result<Vec<MarketCoin>, AppError> {
            Ok(["bitcoin", "ethereum", "solana"]
                .iter()
                .enumerate()
                .map(|(i, id)| MarketCoin {
                    id: id.to_string(),
                    symbol: id[..3].to_string(),
                    name: id.to_string(),
                    image: None,
                    current_price: Some(100.0 / (i as f64 + 1.0)),
                    market_cap: None,
                    market_cap_rank: Some(i as u32 + 1),
                    total_volume: None,
                    price_change_percentage_24h: Some(1.5),
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeBalances {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BalanceProvider for FakeBalances {
        async fn fetch_net_worth(&self, address: &str) -> Result<f64, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match address {
                BROKEN_WALLET => Err(AppError::Provider("connection reset".to_string())),
                WALLET_A => Ok(1500.0),
                _ => Ok(250.5),
            }
        }

        async fn fetch_tokens(&self, address: &str) -> Result<Vec<TokenHolding>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let symbol = if address == WALLET_A { "ETH" } else { "eth" };
            Ok(vec![TokenHolding {
                symbol: symbol.to_string(),
                name: "Ether".to_string(),
                quantity: 0.5,
                usd_value: 1000.0,
            }])
        }
    }

    struct FakeGenerator {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, AppError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.answer.clone())
        }
    }

    struct FakeIdentity;

    #[async_trait]
    impl IdentityVerifier for FakeIdentity {
        async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, AppError> {
            if id_token == "good-google-token" {
                Ok(GoogleIdentity {
                    email: "Hodler@Example.com".to_string(),
                    name: Some("Hodler".to_string()),
                })
            } else {
                Err(AppError::Unauthorized("Invalid Google token".to_string()))
            }
        }
    }

    struct Harness {
        state: Arc<AppState>,
        balances: Arc<FakeBalances>,
        generator: Arc<FakeGenerator>,
    }

    fn harness_with(config: Config) -> Harness {
        let balances = Arc::new(FakeBalances::default());
        let generator = Arc::new(FakeGenerator {
            answer: "Berikut hasilnya:\n```json\n[{\"id\":\"bitcoin\",\"reason\":\"stabil\"}]\n```\nSemoga membantu."
                .to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let state = Arc::new(AppState::new(
            Arc::new(config),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeMarkets),
            balances.clone(),
            generator.clone(),
            Arc::new(FakeIdentity),
        ));
        Harness {
            state,
            balances,
            generator,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::for_tests())
    }

    fn body(res: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    async fn signup(h: &Harness, email: &str) -> String {
        let api = routes(h.state.clone());
        let res = warp::test::request()
            .method("POST")
            .path("/register")
            .json(&json!({ "username": "trader", "email": email, "password": "s3cret" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({ "email": email, "password": "s3cret" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        format!("Bearer {}", body(&res)["access_token"].as_str().unwrap())
    }

    async fn connect(h: &Harness, token: &str, address: &str) {
        let res = warp::test::request()
            .method("POST")
            .path("/wallets")
            .header("authorization", token)
            .json(&json!({ "name": "main", "address": address }))
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn register_rejects_duplicate_email() {
        let h = harness();
        signup(&h, "dup@example.com").await;

        let res = warp::test::request()
            .method("POST")
            .path("/register")
            .json(&json!({ "username": "other", "email": "DUP@example.com", "password": "x" }))
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&res), json!({ "message": "Email must be unique" }));
    }

    #[tokio::test]
    async fn login_failures() {
        let h = harness();
        signup(&h, "a@example.com").await;
        let api = routes(h.state.clone());

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({ "password": "s3cret" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&res)["message"], "Email is required");

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({ "email": "a@example.com", "password": "wrong" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&res)["message"], "Invalid email/password");
    }

    #[tokio::test]
    async fn wallet_routes_require_token() {
        let h = harness();
        let api = routes(h.state.clone());

        let res = warp::test::request().path("/wallets").reply(&api).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&res), json!({ "message": "Invalid token" }));

        let res = warp::test::request()
            .path("/portofolios?wallets=x")
            .header("authorization", "Bearer not-a-jwt")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wallet_crud_round() {
        let h = harness();
        let token = signup(&h, "crud@example.com").await;
        let api = routes(h.state.clone());

        let res = warp::test::request()
            .method("POST")
            .path("/wallets")
            .header("authorization", &token)
            .json(&json!({ "name": "hot", "address": WALLET_A }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let id = body(&res)["id"].as_str().unwrap().to_string();

        let res = warp::test::request()
            .method("POST")
            .path("/wallets")
            .header("authorization", &token)
            .json(&json!({ "name": "bad", "address": "0x123" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&res)["message"], "Invalid wallet address");

        let res = warp::test::request()
            .method("PUT")
            .path(&format!("/wallets/{}", id))
            .header("authorization", &token)
            .json(&json!({ "name": "cold", "address": WALLET_B }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res)["name"], "cold");

        let res = warp::test::request()
            .path("/wallets")
            .header("authorization", &token)
            .reply(&api)
            .await;
        let wallets = body(&res);
        assert_eq!(wallets.as_array().unwrap().len(), 1);
        assert_eq!(wallets[0]["address"], WALLET_B);

        let res = warp::test::request()
            .method("DELETE")
            .path(&format!("/wallets/{}", id))
            .header("authorization", &token)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res), json!({ "message": "Wallet cold deleted" }));

        let res = warp::test::request()
            .method("DELETE")
            .path(&format!("/wallets/{}", id))
            .header("authorization", &token)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&res)["message"], "Wallet not found");
    }

    #[tokio::test]
    async fn other_users_wallet_is_forbidden() {
        let h = harness();
        let owner = signup(&h, "owner@example.com").await;
        let intruder = signup(&h, "intruder@example.com").await;
        let api = routes(h.state.clone());

        let res = warp::test::request()
            .method("POST")
            .path("/wallets")
            .header("authorization", &owner)
            .json(&json!({ "name": "vault", "address": WALLET_A }))
            .reply(&api)
            .await;
        let id = body(&res)["id"].as_str().unwrap().to_string();

        let res = warp::test::request()
            .method("DELETE")
            .path(&format!("/wallets/{}", id))
            .header("authorization", &intruder)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = warp::test::request()
            .path("/wallets")
            .header("authorization", &intruder)
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!([]));
    }

    #[tokio::test]
    async fn portfolio_aggregates_and_merges() {
        let h = harness();
        let token = signup(&h, "p@example.com").await;
        connect(&h, &token, WALLET_A).await;
        connect(&h, &token, &WALLET_B.to_uppercase().replacen("0X", "0x", 1)).await;

        let res = warp::test::request()
            .path(&format!("/portofolios?wallets={},{}", WALLET_A, WALLET_B))
            .header("authorization", &token)
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let json = body(&res);
        assert_eq!(json["totalBalance"], 1750.5);
        assert_eq!(json["nativeAndToken"].as_array().unwrap().len(), 2);
        assert_eq!(
            json["holdings"],
            json!([{ "name": "Ether", "symbol": "ETH", "quantity": 1.0, "usdValue": 2000.0 }])
        );
        assert_eq!(h.balances.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn portfolio_without_wallets_is_not_found() {
        let h = harness();
        let token = signup(&h, "empty@example.com").await;
        let api = routes(h.state.clone());

        for path in ["/portofolios", "/portofolios?wallets="] {
            let res = warp::test::request()
                .path(path)
                .header("authorization", &token)
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::NOT_FOUND);
            assert_eq!(body(&res), json!({ "message": "No wallet connected" }));
        }
        assert_eq!(h.balances.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn portfolio_rejects_malformed_address() {
        let h = harness();
        let token = signup(&h, "bad@example.com").await;

        let res = warp::test::request()
            .path(&format!("/portofolios?wallets={},{}", WALLET_A, &WALLET_B[2..]))
            .header("authorization", &token)
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.balances.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn portfolio_refuses_wallets_of_other_users() {
        let h = harness();
        let owner = signup(&h, "whale@example.com").await;
        let snoop = signup(&h, "snoop@example.com").await;
        connect(&h, &owner, WALLET_A).await;
        connect(&h, &snoop, WALLET_B).await;

        let res = warp::test::request()
            .path(&format!("/portofolios?wallets={},{}", WALLET_B, WALLET_A))
            .header("authorization", &snoop)
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body(&res)["message"],
            format!("Wallet {} is not connected to this account", WALLET_A)
        );
        assert_eq!(h.balances.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_wallet_bodies_are_bad_requests() {
        let h = harness();
        let token = signup(&h, "typo@example.com").await;
        let api = routes(h.state.clone());

        let res = warp::test::request()
            .method("POST")
            .path("/wallets")
            .header("authorization", &token)
            .header("content-type", "application/json")
            .body("{not json")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("PUT")
            .path("/wallets/abc")
            .header("authorization", &token)
            .json(&json!({ "name": 5 }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("PATCH")
            .path("/wallets/abc")
            .header("authorization", &token)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn provider_failure_is_internal_error_without_partial_data() {
        let h = harness();
        let token = signup(&h, "fail@example.com").await;
        connect(&h, &token, WALLET_A).await;
        connect(&h, &token, BROKEN_WALLET).await;

        let res = warp::test::request()
            .path(&format!("/portofolios?wallets={},{}", WALLET_A, BROKEN_WALLET))
            .header("authorization", &token)
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&res), json!({ "message": "Internal Server Error" }));
    }

    #[tokio::test]
    async fn portfolio_top_preview() {
        let h = harness();
        let token = signup(&h, "top@example.com").await;
        connect(&h, &token, WALLET_A).await;

        let res = warp::test::request()
            .path(&format!("/portofolios?wallets={}&top=0", WALLET_A))
            .header("authorization", &token)
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(body(&res)["holdings"], json!([]));
    }

    #[tokio::test]
    async fn ai_markets_normalizes_model_answer() {
        let h = harness();
        let token = signup(&h, "ai@example.com").await;

        let res = warp::test::request()
            .method("POST")
            .path("/ai-markets")
            .header("authorization", &token)
            .json(&json!({ "query": "Koin apa yang paling stabil?" }))
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            body(&res),
            json!({
                "formatted": true,
                "data": [{ "id": "bitcoin", "reason": "stabil" }],
                "message": "Berikut hasilnya: Semoga membantu.",
                "success": true
            })
        );

        let prompts = h.generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Koin apa yang paling stabil?"));
        assert!(prompts[0].contains("\"id\":\"bitcoin\""));
    }

    #[tokio::test]
    async fn ai_markets_requires_query() {
        let h = harness();
        let token = signup(&h, "noq@example.com").await;

        let res = warp::test::request()
            .method("POST")
            .path("/ai-markets")
            .header("authorization", &token)
            .json(&json!({ "query": "  " }))
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(h.generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn markets_lists_coins() {
        let h = harness();
        let token = signup(&h, "m@example.com").await;

        let res = warp::test::request()
            .path("/markets")
            .header("authorization", &token)
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res).as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn google_sign_in_keeps_legacy_status_by_default() {
        let h = harness();
        let api = routes(h.state.clone());

        for _ in 0..2 {
            let res = warp::test::request()
                .method("POST")
                .path("/google-signin")
                .json(&json!({ "googleToken": "good-google-token" }))
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::OK);
            assert!(body(&res)["access_token"].is_string());
        }

        let user = h
            .state
            .store
            .find_user_by_email("hodler@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.username, "Hodler");
        assert!(user.password.is_none());
    }

    #[tokio::test]
    async fn google_sign_in_can_report_created() {
        let h = harness_with(Config {
            google_signin_created_status: true,
            ..Config::for_tests()
        });
        let api = routes(h.state.clone());

        let mut statuses = Vec::new();
        for _ in 0..2 {
            let res = warp::test::request()
                .method("POST")
                .path("/google-signin")
                .json(&json!({ "googleToken": "good-google-token" }))
                .reply(&api)
                .await;
            statuses.push(res.status());
        }
        assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::OK]);

        let res = warp::test::request()
            .method("POST")
            .path("/google-signin")
            .json(&json!({ "googleToken": "forged" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn google_account_cannot_password_login() {
        let h = harness();
        let api = routes(h.state.clone());
        warp::test::request()
            .method("POST")
            .path("/google-signin")
            .json(&json!({ "googleToken": "good-google-token" }))
            .reply(&api)
            .await;

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({ "email": "hodler@example.com", "password": "anything" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let h = harness();
        let res = warp::test::request()
            .path("/nope")
            .reply(&routes(h.state.clone()))
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
