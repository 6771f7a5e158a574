//! Payment provider collaborator.
//!
//! 課金そのものは外部のホスト型決済ページに任せる。ここで扱うのは
//! セッションを開く呼び出しと、戻ってくる通知の署名検証だけ。

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::error::{TicketError, TicketResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSessionRequest {
    pub order_id: String,
    pub competition_id: String,
    pub user_id: String,
    pub amount: u64,
    pub currency: String,
    pub description: String,
    pub quantity: u32,
    pub return_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub session_id: String,
    pub redirect_url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn open_session(&self, request: &PaymentSessionRequest) -> TicketResult<PaymentSession>;
}

/// ホスト型決済 API（JSON over HTTPS）
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpPaymentProvider {
    pub fn new(api_url: &str, api_key: &str) -> TicketResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TicketError::PaymentProvider(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn open_session(&self, request: &PaymentSessionRequest) -> TicketResult<PaymentSession> {
        let response = self
            .client
            .post(format!("{}/sessions", self.api_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TicketError::PaymentProvider(e.to_string()))?;
        response
            .json::<PaymentSession>()
            .await
            .map_err(|e| TicketError::PaymentProvider(e.to_string()))
    }
}

/// 開発用: 外部を呼ばずにローカルの URL を返す
pub struct LocalPaymentProvider {
    base_url: String,
}

impl LocalPaymentProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentProvider for LocalPaymentProvider {
    async fn open_session(&self, request: &PaymentSessionRequest) -> TicketResult<PaymentSession> {
        let session_id = format!("local_{}", request.order_id);
        Ok(PaymentSession {
            redirect_url: format!("{}?session={}", self.base_url, session_id),
            session_id,
        })
    }
}

/// 決済結果の通知
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Succeeded,
    Failed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNotification {
    pub order_id: String,
    pub status: NotificationStatus,
}

/// 通知本文の HMAC-SHA256（base64）
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// 定数時間で比較する
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
