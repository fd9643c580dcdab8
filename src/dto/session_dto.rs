use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::services::signal_source::SignalKind;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StartSessionRequest {
    pub assessment_id: uuid::Uuid,
    pub user_id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub source: SignalKind,
    pub compliant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TerminateRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateResponse {
    pub submission_id: uuid::Uuid,
    /// `false` when the session had already been terminated.
    pub terminated_now: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitCodeRequest {
    #[validate(length(max = 65536))]
    pub code: String,
    #[validate(length(min = 1, max = 32))]
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitMcqRequest {
    #[validate(range(min = 0))]
    pub selected: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
}
