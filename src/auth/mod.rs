//! 认证门
//!
//! 只做凭证校验，不负责签发与刷新。校验结果给出身份、可订阅频道与过期时间。

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// 认证失败错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthErrorCode {
    /// 凭证格式错误或签名无效
    InvalidCredential,
    /// 凭证已过期（可刷新后重连）
    ExpiredCredential,
    /// 未携带凭证
    MissingCredential,
    /// 缺少必要权限范围
    InsufficientScope,
}

/// 认证失败
#[derive(Debug, Clone, Error)]
#[error("auth failed: {code:?}")]
pub struct AuthError {
    pub code: AuthErrorCode,
}

impl AuthError {
    pub fn new(code: AuthErrorCode) -> Self {
        Self { code }
    }

    /// 仅过期凭证允许客户端刷新后重试
    pub fn retryable(&self) -> bool {
        self.code == AuthErrorCode::ExpiredCredential
    }
}

/// 认证成功结果
#[derive(Debug, Clone)]
pub struct AuthSuccess {
    /// 认证身份
    pub identity: String,
    /// 允许订阅的频道
    pub permitted_channels: Vec<String>,
    /// 凭证过期时间
    pub expires_at: DateTime<Utc>,
}

impl AuthSuccess {
    pub fn permits(&self, channel: &str) -> bool {
        self.permitted_channels.iter().any(|c| c == channel)
    }
}

/// 认证门契约
#[async_trait]
pub trait AuthGate: Send + Sync {
    /// 校验凭证
    async fn verify(&self, credential: &str) -> Result<AuthSuccess, AuthError>;
}

/// Token Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// 身份（subject）
    pub sub: String,
    /// 允许订阅的频道
    #[serde(default)]
    pub channels: Vec<String>,
    /// 过期时间（Unix 时间戳）
    pub exp: i64,
}

/// JWT 认证门（HS256）
pub struct JwtAuthGate {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthGate {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl AuthGate for JwtAuthGate {
    async fn verify(&self, credential: &str) -> Result<AuthSuccess, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::new(AuthErrorCode::MissingCredential));
        }

        let token_data = decode::<TokenClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| {
                warn!(error = %e, "token validation failed");
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        AuthError::new(AuthErrorCode::ExpiredCredential)
                    }
                    _ => AuthError::new(AuthErrorCode::InvalidCredential),
                }
            })?;

        let claims = token_data.claims;
        if claims.channels.is_empty() {
            return Err(AuthError::new(AuthErrorCode::InsufficientScope));
        }

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| AuthError::new(AuthErrorCode::InvalidCredential))?;

        debug!(identity = %claims.sub, channels = claims.channels.len(), "token authenticated");

        Ok(AuthSuccess {
            identity: claims.sub,
            permitted_channels: claims.channels,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret";

    fn issue(sub: &str, channels: Vec<String>, exp: i64) -> String {
        let claims = TokenClaims {
            sub: sub.to_string(),
            channels,
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let gate = JwtAuthGate::new(SECRET);
        let token = issue(
            "user-1",
            vec!["error_docs".into()],
            Utc::now().timestamp() + 600,
        );
        let result = gate.verify(&token).await.unwrap();
        assert_eq!(result.identity, "user-1");
        assert!(result.permits("error_docs"));
        assert!(!result.permits("admin"));
    }

    #[tokio::test]
    async fn test_expired_token_is_retryable() {
        let gate = JwtAuthGate::new(SECRET);
        let token = issue(
            "user-1",
            vec!["error_docs".into()],
            Utc::now().timestamp() - 600,
        );
        let err = gate.verify(&token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ExpiredCredential);
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_malformed_token_is_terminal() {
        let gate = JwtAuthGate::new(SECRET);
        let err = gate.verify("not-a-jwt").await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidCredential);
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let gate = JwtAuthGate::new(SECRET);
        let err = gate.verify("  ").await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::MissingCredential);
    }

    #[tokio::test]
    async fn test_no_channels_is_insufficient_scope() {
        let gate = JwtAuthGate::new(SECRET);
        let token = issue("user-1", vec![], Utc::now().timestamp() + 600);
        let err = gate.verify(&token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InsufficientScope);
    }
}
