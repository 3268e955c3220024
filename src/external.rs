//! Contracts for collaborators that live outside this subsystem.
//!
//! Token issuance, email delivery and the container orchestrator are separate
//! services; only their call surfaces are specified here. Stub
//! implementations back tests and local runs.

use std::collections::HashMap;
use tonic::async_trait;
use tracing::info;

use crate::{domain::UserId, error::SimdeskResult};

/// Result of validating a bearer token with the auth service.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResult {
    pub valid: bool,
    pub user_id: Option<UserId>,
    pub role: Option<String>,
}

impl AuthResult {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            user_id: None,
            role: None,
        }
    }
}

#[async_trait]
pub trait AuthClient: Send + Sync + 'static {
    async fn validate_token(&self, token: &str) -> SimdeskResult<AuthResult>;
}

/// Auth stub resolving tokens from a fixed table.
#[derive(Debug, Default)]
pub struct StaticAuthClient {
    tokens: HashMap<String, (UserId, String)>,
}

impl StaticAuthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<UserId>,
        role: impl Into<String>,
    ) -> Self {
        self.tokens
            .insert(token.into(), (user_id.into(), role.into()));
        self
    }
}

#[async_trait]
impl AuthClient for StaticAuthClient {
    async fn validate_token(&self, token: &str) -> SimdeskResult<AuthResult> {
        Ok(match self.tokens.get(token) {
            Some((user_id, role)) => AuthResult {
                valid: true,
                user_id: Some(user_id.clone()),
                role: Some(role.clone()),
            },
            None => AuthResult::invalid(),
        })
    }
}

#[async_trait]
pub trait EmailGateway: Send + Sync + 'static {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        template: &str,
        ctx: &serde_json::Value,
    ) -> bool;
}

/// Email stub that logs instead of delivering.
#[derive(Debug, Default)]
pub struct NoopEmailGateway;

#[async_trait]
impl EmailGateway for NoopEmailGateway {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        template: &str,
        _ctx: &serde_json::Value,
    ) -> bool {
        info!(recipient, subject, template, "email suppressed (noop gateway)");
        true
    }
}
