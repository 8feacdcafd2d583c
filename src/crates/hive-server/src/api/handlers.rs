//! Request handlers for the session API.

use crate::agent::AgentSpec;
use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::AppState;
use crate::session::ChatTarget;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Agent spec to load as a worker right away.
    #[serde(default)]
    pub agent_path: Option<String>,
    /// Provider model name override for this session.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub queen_prompt: Option<String>,
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .manager
        .create_session(body.session_id, body.queen_prompt, body.model)
        .await?;

    if let Some(agent_path) = body.agent_path {
        let spec = AgentSpec::load(std::path::Path::new(&agent_path))
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        session
            .load_worker(None, spec, None)
            .map_err(ApiError::from)?;
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session_id": session.session_id,
            "created_at": session.created_at.to_rfc3339(),
        })),
    ))
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.manager.list() }))
}

/// GET /api/sessions/:sid
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.manager.get(&session_id)?.detail()))
}

/// DELETE /api/sessions/:sid
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.stop_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LoadWorkerBody {
    #[serde(default)]
    pub agent_path: Option<String>,
    /// Inline agent spec, as an alternative to `agent_path`.
    #[serde(default)]
    pub agent: Option<Value>,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Provider model name override for this worker.
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /api/sessions/:sid/worker
pub async fn load_worker(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<LoadWorkerBody>,
) -> ApiResult<Json<Value>> {
    let session = state.manager.get(&session_id)?;
    let spec = match (body.agent_path, body.agent) {
        (Some(path), _) => AgentSpec::load(std::path::Path::new(&path))
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        (None, Some(inline)) => {
            AgentSpec::from_value(inline).map_err(|e| ApiError::BadRequest(e.to_string()))?
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "either agent_path or agent is required".to_string(),
            ))
        }
    };
    let agent_name = spec.name.clone();
    session.load_worker(body.worker_id, spec, body.model)?;
    Ok(Json(json!({ "loaded": agent_name })))
}

/// DELETE /api/sessions/:sid/worker
pub async fn unload_worker(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.get(&session_id)?.unload_worker();
    Ok(Json(json!({ "unloaded": true })))
}

#[derive(Debug, Deserialize)]
pub struct TriggerBody {
    pub entry_point_id: String,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    /// Extra shared-state entries seeded before the run.
    #[serde(default)]
    pub session_state: Map<String, Value>,
}

/// POST /api/sessions/:sid/trigger
pub async fn trigger(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<Json<Value>> {
    let session = state.manager.get(&session_id)?;
    for (key, value) in body.session_state {
        session.state.set(key, value);
    }
    let execution_id = session.trigger(&body.entry_point_id, body.input_data)?;
    Ok(Json(json!({ "execution_id": execution_id })))
}

#[derive(Debug, Deserialize)]
pub struct InjectBody {
    pub node_id: String,
    pub content: String,
    /// Accepted for compatibility; node ids are unique within a worker.
    #[serde(default)]
    pub graph_id: Option<String>,
}

/// POST /api/sessions/:sid/inject
pub async fn inject(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<InjectBody>,
) -> ApiResult<Json<Value>> {
    let delivered = state
        .manager
        .get(&session_id)?
        .inject(&body.node_id, &body.content)?;
    Ok(Json(json!({ "delivered": delivered })))
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
}

/// POST /api/sessions/:sid/chat
pub async fn chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Json<Value>> {
    let session = state.manager.get(&session_id)?;
    match session.chat(&body.message).await? {
        ChatTarget::Injected { node_id } => Ok(Json(json!({
            "status": "injected",
            "delivered": true,
            "node_id": node_id,
        }))),
        ChatTarget::Queen => Ok(Json(json!({
            "status": "queen",
            "delivered": true,
        }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    pub execution_id: String,
}

/// POST /api/sessions/:sid/stop - pause and checkpoint (resumable).
pub async fn stop(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<StopBody>,
) -> ApiResult<Json<Value>> {
    let checkpoint_id = state
        .manager
        .get(&session_id)?
        .stop(&body.execution_id)
        .await?;
    Ok(Json(json!({ "paused": true, "checkpoint_id": checkpoint_id })))
}

/// POST /api/sessions/:sid/cancel - terminal.
pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<StopBody>,
) -> ApiResult<Json<Value>> {
    state.manager.get(&session_id)?.cancel(&body.execution_id)?;
    Ok(Json(json!({ "cancelled": true })))
}

#[derive(Debug, Deserialize)]
pub struct ResumeBody {
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

/// POST /api/sessions/:sid/resume
pub async fn resume(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ResumeBody>,
) -> ApiResult<Json<Value>> {
    let restored = state
        .manager
        .get(&session_id)?
        .resume(body.checkpoint_id.as_deref())
        .await?;
    Ok(Json(json!({ "resumed": true, "execution_id": restored })))
}

#[derive(Debug, Deserialize)]
pub struct ReplayBody {
    pub checkpoint_id: String,
}

/// POST /api/sessions/:sid/replay
pub async fn replay(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ReplayBody>,
) -> ApiResult<Json<Value>> {
    let execution_id = state
        .manager
        .get(&session_id)?
        .replay(&body.checkpoint_id)
        .await?;
    Ok(Json(json!({ "execution_id": execution_id })))
}

/// GET /api/sessions/:sid/checkpoints
pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let checkpoints = state.manager.get(&session_id)?.list_checkpoints().await?;
    let listed: Vec<Value> = checkpoints
        .iter()
        .map(|cp| {
            json!({
                "checkpoint_id": cp.checkpoint_id,
                "execution_id": cp.execution_id,
                "created_at": cp.created_at.to_rfc3339(),
                "current_node": cp.current_node,
            })
        })
        .collect();
    Ok(Json(json!({ "checkpoints": listed })))
}

/// GET /api/sessions/:sid/graphs/:gid/nodes - topology plus per-node
/// progress, with back edges tagged.
pub async fn graph_nodes(
    State(state): State<AppState>,
    Path((session_id, graph_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let session = state.manager.get(&session_id)?;
    let worker = session
        .worker()
        .ok_or_else(|| ApiError::BadRequest(format!("session '{session_id}' has no worker")))?;
    let graph = worker
        .graph(&graph_id)
        .ok_or_else(|| ApiError::NotFound(format!("graph '{graph_id}' not found")))?;

    let visits = worker.visit_counts_for(&graph_id);
    let back_edges = graph.back_edges();

    let nodes: Vec<Value> = graph
        .nodes
        .iter()
        .map(|node| {
            json!({
                "id": node.id,
                "kind": node.kind,
                "client_facing": node.client_facing,
                "max_node_visits": node.max_node_visits,
                "visits": visits.get(&node.id).copied().unwrap_or(0),
            })
        })
        .collect();
    let edges: Vec<Value> = graph
        .edges
        .iter()
        .map(|edge| {
            json!({
                "source": edge.source,
                "target": edge.target,
                "condition": edge.condition.as_str(),
                "priority": edge.priority,
                "back_edge": back_edges.contains(&(edge.source.clone(), edge.target.clone())),
            })
        })
        .collect();

    Ok(Json(json!({
        "graph_id": graph.id,
        "entry_node": graph.entry_node,
        "nodes": nodes,
        "edges": edges,
    })))
}

/// GET /health
pub async fn health_probe(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.manager.session_count(),
    }))
}
