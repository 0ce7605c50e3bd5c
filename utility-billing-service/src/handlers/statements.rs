//! JSON endpoints for billing statements.

use crate::models::{
    CreateStatementRequest, DeleteOutcome, ExtendedStatement, HistoryFilter, ImportOutcome,
    ImportStatementsRequest, StatementPage, SummaryMetrics, UpdateStatementRequest,
};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page_size: Option<i64>,
    pub page_token: Option<Uuid>,
}

/// Record a billing period.
///
/// POST /v1/owners/:owner_id/statements
pub async fn create_statement(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Json(req): Json<CreateStatementRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;

    let created = state.ledger.create_statement(owner_id, &req).await?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// Record a batch of billing periods.
///
/// POST /v1/owners/:owner_id/statements/import
pub async fn import_statements(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Json(req): Json<ImportStatementsRequest>,
) -> Result<Json<Vec<ImportOutcome>>, AppError> {
    req.validate()?;

    let outcomes = state
        .ledger
        .import_statements(owner_id, &req.statements)
        .await?;

    Ok(Json(outcomes))
}

/// GET /v1/owners/:owner_id/statements
pub async fn list_statements(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Query(params): Query<ListParams>,
) -> Result<Json<StatementPage>, AppError> {
    let page = state
        .ledger
        .list_statements(owner_id, params.page_size, params.page_token)
        .await?;

    Ok(Json(page))
}

/// GET /v1/owners/:owner_id/statements/:statement_id
pub async fn get_statement(
    State(state): State<AppState>,
    Path((owner_id, statement_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ExtendedStatement>, AppError> {
    let statement = state.ledger.get_statement(owner_id, statement_id).await?;

    Ok(Json(statement))
}

/// Partially update a billing period.
///
/// PATCH /v1/owners/:owner_id/statements/:statement_id
pub async fn update_statement(
    State(state): State<AppState>,
    Path((owner_id, statement_id)): Path<(Uuid, Uuid)>,
    Json(mut req): Json<UpdateStatementRequest>,
) -> Result<Json<ExtendedStatement>, AppError> {
    req.statement_id = statement_id;
    req.validate()?;

    let updated = state.ledger.update_statement(owner_id, &req).await?;

    Ok(Json(updated))
}

/// DELETE /v1/owners/:owner_id/statements/:statement_id
pub async fn delete_statement(
    State(state): State<AppState>,
    Path((owner_id, statement_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DeleteOutcome>, AppError> {
    let outcome = state
        .ledger
        .delete_statement(owner_id, statement_id)
        .await?;

    Ok(Json(outcome))
}

/// Return metrics over the owner's history, optionally windowed by
/// `from` / `to` dates. Ratios are rounded to cents.
///
/// GET /v1/owners/:owner_id/summary
pub async fn summarize_history(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Query(filter): Query<HistoryFilter>,
) -> Result<Json<SummaryMetrics>, AppError> {
    if let (Some(from), Some(to)) = (filter.from, filter.to) {
        if from > to {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "'from' must not be after 'to'"
            )));
        }
    }

    let metrics = state.ledger.summarize_history(owner_id, &filter).await?;

    Ok(Json(metrics.rounded()))
}
