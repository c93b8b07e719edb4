/// Messaging REST API - HTTP server for staff clients
///
/// Identity comes from the upstream gateway as trusted headers:
///   X-User-Id: <u64>            required
///   X-User-Role: agent|manager  optional, defaults to agent
///
/// Endpoints:
///   POST   /api/conversations                       body: NewConversation
///   GET    /api/conversations                       ?cursor&limit&include_archived&type&pinned&q
///   GET    /api/conversations/:id
///   PATCH  /api/conversations/:id                   body: ConversationUpdate
///   GET    /api/conversations/:id/participants
///   POST   /api/conversations/:id/participants      body: {"user_ids":[..]}
///   DELETE /api/conversations/:id/participants/:user_id
///   POST   /api/conversations/:id/read              body: {"up_to_sequence":N}
///   GET    /api/conversations/:id/messages          ?since=N&limit=N
///   POST   /api/conversations/:id/messages          body: NewMessage
///   PUT    /api/messages/:id                        body: {"content":"..."}
///   DELETE /api/messages/:id
///   POST   /api/messages/:id/reactions              body: {"reaction_type":"like"}
///   GET    /api/sync/conversations                  ?cursor
///   GET    /api/sync/conversations/:id              ?cursor
///   GET    /api/stats
use crate::error::{MessagingError, Result};
use crate::messaging_types::{
    Caller, ConversationFilter, ConversationId, ConversationKind, ConversationUpdate, MessageId,
    NewConversation, NewMessage, Role, UserId,
};
use crate::retry::{with_retry, RetryConfig};
use crate::sync_engine::SyncEngine;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, PATCH, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, X-User-Id, X-User-Role")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok<T: Serialize>(value: &T) -> Resp {
    match serde_json::to_vec(value) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => error_resp(&MessagingError::Serialization(e)),
    }
}

fn json_err(status: StatusCode, kind: &str, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({
            "error": msg,
            "kind": kind,
            "retryable": false,
        }))
        .unwrap_or_default(),
    )
}

pub fn status_for(e: &MessagingError) -> StatusCode {
    match e {
        MessagingError::InvalidConversationShape(_)
        | MessagingError::InvalidMessage(_)
        | MessagingError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
        MessagingError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        MessagingError::ConversationNotFound(_)
        | MessagingError::MessageNotFound(_)
        | MessagingError::ReplyTargetNotFound(_) => StatusCode::NOT_FOUND,
        MessagingError::MessageDeleted(_) | MessagingError::ConversationLocked(_) => StatusCode::CONFLICT,
        MessagingError::Contention(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_resp(e: &MessagingError) -> Resp {
    let status = status_for(e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Messaging API internal error: {}", e);
    }
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
            "retryable": e.is_retryable(),
        }))
        .unwrap_or_default(),
    )
}

fn respond<T: Serialize>(result: Result<T>) -> Resp {
    match result {
        Ok(v) => json_ok(&v),
        Err(e) => error_resp(&e),
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_messaging_api(engine: SyncEngine, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().map_err(|e| {
        MessagingError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("Invalid messaging API address: {}", e),
        ))
    })?;

    let listener = TcpListener::bind(addr).await?;
    info!("Messaging API started on http://{}", addr);
    serve(listener, engine).await
}

/// Accept loop over an already-bound listener
pub async fn serve(listener: TcpListener, engine: SyncEngine) -> Result<()> {
    let state = Arc::new(ApiState {
        engine,
        retry: RetryConfig::default(),
    });
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        if !e.is_incomplete_message() {
                            error!("Messaging API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Messaging API accept error: {}", e),
        }
    }
}

struct ApiState {
    engine: SyncEngine,
    retry: RetryConfig,
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, state: Arc<ApiState>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    // CORS preflight
    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    let caller = match caller_from(req.headers()) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    debug!("{} {} from user {}", method, path, caller.user_id);

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let engine = &state.engine;

    match (method, segments.as_slice()) {
        (Method::POST, ["api", "conversations"]) => {
            let body: NewConversation = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            respond(engine.create_conversation(&caller, body))
        }
        (Method::GET, ["api", "conversations"]) => list_conversations(engine, &caller, &query),
        (Method::GET, ["api", "conversations", id]) => match parse_id(id).map(ConversationId) {
            Ok(id) => respond(engine.get_conversation(&caller, id)),
            Err(resp) => resp,
        },
        (Method::PATCH, ["api", "conversations", id]) => {
            let id = match parse_id(id).map(ConversationId) {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            let update: ConversationUpdate = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            respond(engine.update_conversation(&caller, id, update))
        }
        (Method::GET, ["api", "conversations", id, "participants"]) => match parse_id(id).map(ConversationId) {
            Ok(id) => respond(engine.list_participants(&caller, id)),
            Err(resp) => resp,
        },
        (Method::POST, ["api", "conversations", id, "participants"]) => {
            let id = match parse_id(id).map(ConversationId) {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            let body: AddParticipantsRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            respond(engine.add_participants(&caller, id, &body.user_ids))
        }
        (Method::DELETE, ["api", "conversations", id, "participants", user_id]) => {
            let (id, user_id) = match (parse_id(id), parse_id(user_id)) {
                (Ok(id), Ok(user_id)) => (ConversationId(id), UserId(user_id)),
                (Err(resp), _) | (_, Err(resp)) => return resp,
            };
            match engine.remove_participant(&caller, id, user_id) {
                Ok(Some(summary)) => json_ok(&summary),
                Ok(None) => json_ok(&serde_json::json!({ "removed": true })),
                Err(e) => error_resp(&e),
            }
        }
        (Method::POST, ["api", "conversations", id, "read"]) => {
            let id = match parse_id(id).map(ConversationId) {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            let body: ReadRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            respond(engine.mark_read(&caller, id, body.up_to_sequence))
        }
        (Method::GET, ["api", "conversations", id, "messages"]) => match parse_id(id).map(ConversationId) {
            Ok(id) => respond(engine.list_messages(
                &caller,
                id,
                parse_query(&query, "since"),
                parse_query(&query, "limit"),
            )),
            Err(resp) => resp,
        },
        (Method::POST, ["api", "conversations", id, "messages"]) => {
            let id = match parse_id(id).map(ConversationId) {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            let body: NewMessage = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            respond(
                with_retry(&state.retry, || {
                    let msg = body.clone();
                    async move { engine.send_message(&caller, id, msg) }
                })
                .await,
            )
        }
        (Method::PUT, ["api", "messages", id]) => {
            let id = match parse_id(id).map(MessageId) {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            let body: EditRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            respond(engine.edit_message(&caller, id, &body.content))
        }
        (Method::DELETE, ["api", "messages", id]) => match parse_id(id).map(MessageId) {
            Ok(id) => respond(engine.delete_message(&caller, id)),
            Err(resp) => resp,
        },
        (Method::POST, ["api", "messages", id, "reactions"]) => {
            let id = match parse_id(id).map(MessageId) {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            let body: ReactRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            let reaction = body.reaction_type.as_str();
            respond(
                with_retry(&state.retry, || async move { engine.react(&caller, id, reaction) }).await,
            )
        }
        (Method::GET, ["api", "sync", "conversations"]) => {
            let cursor = query_value(&query, "cursor");
            respond(engine.sync_conversations(&caller, cursor.as_deref()))
        }
        (Method::GET, ["api", "sync", "conversations", id]) => match parse_id(id).map(ConversationId) {
            Ok(id) => {
                let cursor = query_value(&query, "cursor");
                respond(engine.sync_messages(&caller, id, cursor.as_deref()))
            }
            Err(resp) => resp,
        },
        (Method::GET, ["api", "stats"]) => respond(engine.messaging_stats(&caller, chrono::Utc::now())),
        _ => json_err(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn list_conversations(engine: &SyncEngine, caller: &Caller, query: &str) -> Resp {
    let kind = match query_value(query, "type") {
        Some(raw) => match ConversationKind::parse(&raw) {
            Some(k) => Some(k),
            None => {
                return json_err(
                    StatusCode::BAD_REQUEST,
                    "invalid_query",
                    &format!("unknown conversation type '{}'", raw),
                )
            }
        },
        None => None,
    };
    let filter = ConversationFilter {
        include_archived: parse_query(query, "include_archived").unwrap_or(false),
        kind,
        pinned_only: parse_query(query, "pinned").unwrap_or(false),
        search: query_value(query, "q"),
    };
    let cursor = query_value(query, "cursor");
    respond(engine.list_conversations(caller, &filter, cursor.as_deref(), parse_query(query, "limit")))
}

#[derive(Deserialize)]
struct AddParticipantsRequest {
    user_ids: Vec<UserId>,
}

#[derive(Deserialize)]
struct ReadRequest {
    up_to_sequence: u64,
}

#[derive(Deserialize)]
struct EditRequest {
    content: String,
}

#[derive(Deserialize)]
struct ReactRequest {
    reaction_type: String,
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn caller_from(headers: &HeaderMap) -> std::result::Result<Caller, Resp> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|id| *id != 0)
        .ok_or_else(|| json_err(StatusCode::UNAUTHORIZED, "unauthenticated", "missing or invalid X-User-Id"))?;
    let role = match headers.get("x-user-role").and_then(|v| v.to_str().ok()) {
        Some(raw) => Role::parse(raw).ok_or_else(|| {
            json_err(
                StatusCode::BAD_REQUEST,
                "invalid_role",
                &format!("unknown role '{}'", raw),
            )
        })?,
        None => Role::Agent,
    };
    Ok(Caller {
        user_id: UserId(user_id),
        role,
    })
}

fn parse_id(raw: &str) -> std::result::Result<u64, Resp> {
    raw.parse::<u64>()
        .map_err(|_| json_err(StatusCode::BAD_REQUEST, "invalid_path", &format!("invalid id '{}'", raw)))
}

async fn read_json<T: DeserializeOwned>(req: Request<hyper::body::Incoming>) -> std::result::Result<T, Resp> {
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, "invalid_body", &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, "invalid_body", &format!("invalid JSON: {}", e)))
}

fn query_value(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return urlencoding::decode(&v.replace('+', " "))
                    .ok()
                    .map(|v| v.into_owned())
                    .filter(|v| !v.is_empty());
            }
        }
    }
    None
}

fn parse_query<T: std::str::FromStr>(query: &str, key: &str) -> Option<T> {
    query_value(query, key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_values_are_decoded() {
        let q = "cursor=abc_-&q=front%20desk&limit=20&pinned=true&empty=";
        assert_eq!(query_value(q, "cursor").as_deref(), Some("abc_-"));
        assert_eq!(query_value(q, "q").as_deref(), Some("front desk"));
        assert_eq!(parse_query::<usize>(q, "limit"), Some(20));
        assert_eq!(parse_query::<bool>(q, "pinned"), Some(true));
        assert_eq!(query_value(q, "empty"), None);
        assert_eq!(query_value(q, "missing"), None);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            status_for(&MessagingError::InvalidCursor("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&MessagingError::NotAuthorized("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(&MessagingError::MessageNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&MessagingError::MessageDeleted(1)), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&MessagingError::Contention("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&MessagingError::Storage("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_caller_headers() {
        let mut headers = HeaderMap::new();
        assert!(caller_from(&headers).is_err());

        headers.insert("x-user-id", "42".parse().unwrap());
        let caller = caller_from(&headers).unwrap();
        assert_eq!(caller, Caller::agent(42));

        headers.insert("x-user-role", "Manager".parse().unwrap());
        assert_eq!(caller_from(&headers).unwrap(), Caller::manager(42));

        headers.insert("x-user-role", "owner".parse().unwrap());
        assert!(caller_from(&headers).is_err());
    }
}
