use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Request payload for `POST /api/credits/check`.
pub struct CreditCheckRequest {
    pub cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditCheckResponse {
    pub sufficient: bool,
    pub current_balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user: String,
    pub balance: i64,
}

/// How an artifact is being fetched. Only `Download` is billed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactMode {
    #[default]
    View,
    Download,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactQuery {
    #[serde(default)]
    pub mode: ArtifactMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}
