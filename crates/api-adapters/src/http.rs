//! # axum router
//!
//! Routes live under `/api/v3/conversations/{token}`. The caller is identified by the
//! `x-agora-uid` header; endpoints that only read accept anonymous callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use domains::{Conversation, ConversationToken, JoinContext, Pid, Tid, UserId, VoteFilter};
use services::{CastVote, SelectNext, SubmitComment, ANY_TICK};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::dto::{
    ActiveRequest, CommentRequest, CommentResponse, ConversationStatus, JoinRequest, MathQuery,
    ModerationRequest, ModerationResponse, NextCommentQuery, NextCommentResponse,
    ParticipantResponse, SubscriptionRequest, VoteRequest, VoteResponse, VotesQuery, VotesResponse,
};
use crate::error::{ApiError, CALLER_HEADER};
use crate::metrics::CONTENT_TYPE;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/conversations/{token}/participants", post(join))
        .route("/conversations/{token}/participants/subscription", put(subscribe))
        .route("/conversations/{token}/votes", post(cast_vote).get(list_votes))
        .route("/conversations/{token}/comments", post(submit_comment))
        .route("/conversations/{token}/comments/{tid}/moderation", put(moderate))
        .route("/conversations/{token}/next-comment", get(next_comment))
        .route("/conversations/{token}/math", get(math))
        .route("/conversations/{token}/active", put(set_active));

    Router::new()
        .nest("/api/v3", api)
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(SequentialRequestId::default()))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn join(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(body): Json<JoinRequest>,
) -> ApiResult<Json<ParticipantResponse>> {
    let uid = require_caller(&headers)?;
    let conversation = conversation(&state, token).await?;
    let participant = state
        .participants
        .ensure_participant(conversation.id, uid, join_context(&headers, body))
        .await?;
    Ok(Json(participant.into()))
}

async fn subscribe(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SubscriptionRequest>,
) -> ApiResult<Json<ParticipantResponse>> {
    let uid = require_caller(&headers)?;
    let conversation = conversation(&state, token).await?;
    let pid = state.participants.require_pid(conversation.id, uid).await?;
    state
        .participants
        .set_subscription(conversation.id, pid, body.subscribed)
        .await?;
    let participant = state
        .participants
        .participant(conversation.id, pid)
        .await?
        .ok_or_else(|| domains::DomainError::not_found("participant", format!("{}/{pid}", conversation.id)))?;
    Ok(Json(participant.into()))
}

/// Voting joins the conversation on the way if needed.
async fn cast_vote(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(body): Json<VoteRequest>,
) -> ApiResult<Json<VoteResponse>> {
    let uid = require_caller(&headers)?;
    let conversation = conversation(&state, token).await?;

    // 1. Identity: join first, the vote needs a pid
    let participant = state
        .participants
        .ensure_participant(conversation.id, uid, join_context(&headers, JoinRequest::default()))
        .await?;

    // 2. Persistence: append to the ledger
    let vote = state
        .votes
        .cast_vote(CastVote {
            conversation: conversation.id,
            uid,
            pid: participant.pid,
            tid: body.tid,
            value: body.vote,
            weight: body.weight,
            high_priority: body.high_priority,
        })
        .await?;
    Ok(Json(VoteResponse {
        pid: participant.pid,
        vote,
    }))
}

async fn list_votes(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Query(query): Query<VotesQuery>,
) -> ApiResult<Json<VotesResponse>> {
    let conversation = conversation(&state, token).await?;
    let pid = caller_pid(&state, &conversation, &headers).await?;
    let filter = VoteFilter {
        pid: query.pid.map(Pid),
        tid: query.tid.map(Tid),
    };
    let votes = if query.history {
        state.votes.vote_history(conversation.id, filter).await?
    } else {
        state.votes.latest_votes_for(conversation.id, filter).await?
    };
    Ok(Json(VotesResponse { pid, votes }))
}

async fn submit_comment(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CommentRequest>,
) -> ApiResult<Json<CommentResponse>> {
    let uid = require_caller(&headers)?;
    let conversation = conversation(&state, token).await?;
    let submitted = state
        .comments
        .submit_comment(SubmitComment {
            conversation: conversation.id,
            author: uid,
            pid: None,
            text: body.text,
            quote_text: body.quote_text,
            quote_source_url: body.quote_source_url,
            is_seed: body.is_seed,
            anon: body.anon,
            vote: body.vote,
            client: join_context(&headers, JoinRequest::default()),
        })
        .await?;
    Ok(Json(submitted.into()))
}

async fn moderate(
    State(state): State<AppState>,
    Path((token, tid)): Path<(String, i32)>,
    headers: HeaderMap,
    Json(body): Json<ModerationRequest>,
) -> ApiResult<Json<ModerationResponse>> {
    let uid = require_caller(&headers)?;
    let conversation = conversation(&state, token).await?;
    let comment = state
        .comments
        .moderate(conversation.id, uid, Tid(tid), body.status)
        .await?;
    Ok(Json(comment.into()))
}

async fn next_comment(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Query(query): Query<NextCommentQuery>,
) -> ApiResult<Json<NextCommentResponse>> {
    let exclude = query.excluded()?;
    let conversation = conversation(&state, token).await?;
    let pid = caller_pid(&state, &conversation, &headers).await?;
    let next = state
        .selection
        .select_next(SelectNext {
            conversation: conversation.id,
            pid,
            exclude,
            social_only: query.social_only,
            lang: query.lang,
        })
        .await?;
    Ok(Json(NextCommentResponse::new(pid, next)))
}

/// 304 when nothing newer than `math_tick` exists.
async fn math(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<MathQuery>,
) -> ApiResult<Response> {
    let conversation = conversation(&state, token).await?;
    let min_tick = query.math_tick.unwrap_or(ANY_TICK);
    match state.math.get(conversation.id, min_tick).await? {
        Some(snapshot) => Ok(Json(snapshot.payload.clone()).into_response()),
        None => Ok(StatusCode::NOT_MODIFIED.into_response()),
    }
}

async fn set_active(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActiveRequest>,
) -> ApiResult<Json<ConversationStatus>> {
    let uid = require_caller(&headers)?;
    let conversation = conversation(&state, token).await?;
    state
        .conversations
        .set_active(conversation.id, uid, body.active)
        .await?;
    Ok(Json(ConversationStatus {
        token: conversation.token.0,
        is_active: body.active,
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

async fn conversation(state: &AppState, token: String) -> ApiResult<Conversation> {
    Ok(state.conversations.by_token(&ConversationToken(token)).await?)
}

fn caller(headers: &HeaderMap) -> ApiResult<Option<UserId>> {
    let Some(raw) = headers.get(CALLER_HEADER) else {
        return Ok(None);
    };
    raw.to_str()
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map(|uid| Some(UserId(uid)))
        .ok_or(ApiError::MissingCaller)
}

fn require_caller(headers: &HeaderMap) -> ApiResult<UserId> {
    caller(headers)?.ok_or(ApiError::MissingCaller)
}

/// The caller's pid, if the caller is known and already joined.
async fn caller_pid(
    state: &AppState,
    conversation: &Conversation,
    headers: &HeaderMap,
) -> ApiResult<Option<Pid>> {
    match caller(headers)? {
        Some(uid) => Ok(state.participants.resolve_pid(conversation.id, uid).await?),
        None => Ok(None),
    }
}

fn join_context(headers: &HeaderMap, body: JoinRequest) -> JoinContext {
    let text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|first| first.trim().to_string())
        .filter(|first| !first.is_empty());
    JoinContext {
        referrer: body.referrer.or_else(|| text(header::REFERER)),
        parent_url: body.parent_url,
        ip,
        user_agent: text(header::USER_AGENT),
    }
}

/// Counts every routed request once it has a response.
async fn track(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    debug!(%method, %route, status, "request handled");
    state.metrics.observe(&method, &route, status, started.elapsed());
    response
}

#[derive(Clone, Default)]
struct SequentialRequestId(Arc<AtomicU64>);

impl MakeRequestId for SequentialRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = self.0.fetch_add(1, Ordering::Relaxed);
        Some(RequestId::new(HeaderValue::from(id)))
    }
}
