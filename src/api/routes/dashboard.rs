//! Dashboard datasource endpoints

use axum::{Json, extract::State};
use tracing::{debug, error};

use crate::actors::messages::VariableTier;
use crate::api::{
    ApiError, ApiResult, ApiState,
    types::{RecordQuery, TableResponse, Variable, VariableQuery},
};

async fn load_variables(state: &ApiState, query: VariableQuery) -> ApiResult<Vec<String>> {
    state
        .manager
        .query_variables(VariableTier::parse(&query.tier), &query.target, &query.filter)
        .await
        .map_err(|e| {
            error!("loading dashboard variables failed: {e}");
            ApiError::internal(e)
        })
}

/// POST /search
pub async fn search(State(state): State<ApiState>, body: String) -> ApiResult<Json<Vec<String>>> {
    let query = VariableQuery::from_search(&body);
    debug!(?query, "dashboard search");
    Ok(Json(load_variables(&state, query).await?))
}

/// POST /variable
pub async fn variable(
    State(state): State<ApiState>,
    body: String,
) -> ApiResult<Json<Vec<Variable>>> {
    let query = VariableQuery::from_variable(&body);
    debug!(?query, "dashboard variable");
    let names = load_variables(&state, query).await?;
    Ok(Json(names.into_iter().map(Variable::from).collect()))
}

/// POST /query
///
/// History of one sub filter as a single table
pub async fn query(
    State(state): State<ApiState>,
    body: String,
) -> ApiResult<Json<Vec<TableResponse>>> {
    let query = RecordQuery::from_body(&body);
    debug!(?query, "dashboard query");

    let records = state
        .manager
        .query_records(&query.target, &query.filter, &query.sub_filter)
        .await
        .map_err(|e| {
            error!("loading records failed: {e}");
            ApiError::internal(e)
        })?;

    Ok(Json(vec![TableResponse::records(&query, records)]))
}
