use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use uuid::Uuid;
use validator::Validate;

use crate::dto::session_dto::{
    SignalRequest, StartSessionRequest, StatusResponse, SubmitCodeRequest, SubmitMcqRequest,
    TerminateRequest, TerminateResponse,
};
use crate::services::integrity_monitor::TerminationReason;
use crate::AppState;

#[axum::debug_handler]
pub async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> crate::error::Result<Response> {
    payload.validate()?;
    let session = state
        .sessions
        .start(payload.assessment_id, payload.user_id)
        .await?;
    let snapshot = session.snapshot().await;
    Ok((StatusCode::CREATED, Json(snapshot)).into_response())
}

#[axum::debug_handler]
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let session = state.sessions.get(id).await?;
    Ok(Json(session.snapshot().await).into_response())
}

#[axum::debug_handler]
pub async fn post_signal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SignalRequest>,
) -> crate::error::Result<Response> {
    let session = state.sessions.get(id).await?;
    session.signal(payload.source, payload.compliant);
    Ok((StatusCode::ACCEPTED, Json(StatusResponse { ok: true })).into_response())
}

#[axum::debug_handler]
pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TerminateRequest>,
) -> crate::error::Result<Response> {
    payload.validate()?;
    let session = state.sessions.get(id).await?;
    let terminated_now = session
        .terminate_session(TerminationReason::Requested {
            reason: payload.reason,
        })
        .await?;
    Ok(Json(TerminateResponse {
        submission_id: id,
        terminated_now,
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn complete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> crate::error::Result<Response> {
    let session = state.sessions.get(id).await?;
    session.complete_session().await?;
    Ok(Json(session.snapshot().await).into_response())
}

#[axum::debug_handler]
pub async fn submit_code(
    State(state): State<AppState>,
    Path((id, question_id)): Path<(Uuid, i32)>,
    Json(payload): Json<SubmitCodeRequest>,
) -> crate::error::Result<Response> {
    payload.validate()?;
    let session = state.sessions.get(id).await?;
    tracing::info!(submission_id = %id, question_id, language = %payload.language, "grading code submission");
    let result = session
        .grade_code(question_id, &payload.code, &payload.language)
        .await?;
    Ok(Json(result).into_response())
}

#[axum::debug_handler]
pub async fn submit_mcq(
    State(state): State<AppState>,
    Path((id, question_id)): Path<(Uuid, i32)>,
    Json(payload): Json<SubmitMcqRequest>,
) -> crate::error::Result<Response> {
    payload.validate()?;
    let session = state.sessions.get(id).await?;
    let outcome = session.record_mcq(question_id, payload.selected).await?;
    Ok(Json(outcome).into_response())
}
