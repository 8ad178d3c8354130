// src/error.rs
use log::error;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

pub const INTERNAL_SERVER_ERROR: &str = "Internal Server Error";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Provider(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to the client. Server-side failures never
    /// leak their detail.
    pub fn public_message(&self) -> String {
        if self.status().is_server_error() {
            INTERNAL_SERVER_ERROR.to_string()
        } else {
            self.to_string()
        }
    }
}

impl Reject for AppError {}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Provider(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(e: bcrypt::BcryptError) -> Self {
        AppError::Internal(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorMessage {
    message: String,
}

fn reply_with(status: StatusCode, message: String) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&ErrorMessage { message }), status)
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    if let Some(e) = err.find::<AppError>() {
        return Ok(reply_with(e.status(), e.public_message()));
    }

    // Checked before the not-found branch: sibling routes on the same path
    // contribute MethodNotAllowed to the combined rejection.
    if err.find::<warp::reject::MissingHeader>().is_some() {
        return Ok(reply_with(
            StatusCode::UNAUTHORIZED,
            "Invalid token".to_string(),
        ));
    }

    if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        return Ok(reply_with(StatusCode::BAD_REQUEST, e.to_string()));
    }

    if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        return Ok(reply_with(StatusCode::BAD_REQUEST, e.to_string()));
    }

    if err.is_not_found() || err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(reply_with(StatusCode::NOT_FOUND, "Not Found".to_string()));
    }

    error!("Unhandled rejection: {:?}", err);
    Ok(reply_with(
        StatusCode::INTERNAL_SERVER_ERROR,
        INTERNAL_SERVER_ERROR.to_string(),
    ))
}
