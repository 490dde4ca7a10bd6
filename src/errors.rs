//! Typed error hierarchy for the CRM.
//!
//! - `ClientError`: REST calls made by the API client
//! - `BoardError`: drag/drop moves on a pipeline board
//! - `TokenError`: credential token decoding and verification
//! - `ServerError`: reference backend handlers and store

use thiserror::Error;

/// Errors from the REST API client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// The user-facing message shown in banners and form errors.
    pub fn message(&self) -> String {
        match self {
            ClientError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Errors from board moves.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Deal {id} is not on this board")]
    UnknownDeal { id: i64 },

    #[error("Stage {stage_id} does not belong to pipeline {pipeline_id}")]
    ForeignStage { stage_id: i64, pipeline_id: i64 },

    #[error("Deal {id} is not being dragged")]
    NotDragging { id: i64 },

    #[error("Deal {id} already has a move waiting for the server")]
    MoveInFlight { id: i64 },

    #[error("Move of deal {id} was rejected: {source}")]
    Commit {
        id: i64,
        #[source]
        source: ClientError,
    },
}

/// Errors from credential tokens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token signature mismatch")]
    BadSignature,

    #[error("Token expired at {exp}")]
    Expired { exp: i64 },
}

/// Errors from the reference backend.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Notion error: {0}")]
    Notion(String),
}

impl ServerError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        ServerError::NotFound { entity, id }
    }
}
