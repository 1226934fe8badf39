//! The request-driven endpoint task runner.
//!
//! An endpoint's source is a template: literal text interleaved with script
//! blocks delimited by `<?` and `?>`. On each request the worker looks up the
//! task under the HTML-escaped request path, evaluates the blocks in order
//! into a response buffer, and sends the result. Unterminated blocks are
//! treated as plain text.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Map};

use crate::record::{Status, TaskRecord};
use crate::script::{Interrupt, ScriptHost};
use crate::util::escape_path;
use crate::worker::SharedState;

/// Everything a script can see about the request.
pub(crate) struct EndpointRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: String,
}

pub(crate) struct EndpointReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl EndpointReply {
    fn plain(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain; charset=utf-8".to_owned()),
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

enum Segment<'a> {
    Text(&'a str),
    Code(&'a str),
}

/// Split a template on `<?` / `?>`. Every fragment produced by the `<?`
/// split is treated uniformly: if it carries a `?>` it splits once into
/// (code, trailing text), otherwise it is literal text.
fn split_template(source: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    for part in source.split("<?") {
        match part.split_once("?>") {
            Some((code, text)) => {
                segments.push(Segment::Code(code));
                if !text.is_empty() {
                    segments.push(Segment::Text(text));
                }
            }
            None => {
                if !part.is_empty() {
                    segments.push(Segment::Text(part));
                }
            }
        }
    }
    segments
}

#[derive(Default)]
struct ResponseState {
    buffer: String,
    content_type: Option<String>,
    headers: Vec<(String, String)>,
    /// Set by `response.Error`; short-circuits the remaining blocks.
    error: Option<(String, u16)>,
}

/// Serve one endpoint request.
pub(crate) async fn execute(shared: &Arc<SharedState>, request: EndpointRequest) -> EndpointReply {
    let escaped = escape_path(&request.path);
    let key = shared.keys.endpoint(&escaped);
    let record = TaskRecord::new(shared.store.clone(), key.clone());

    let source = match record.source().await {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(key = %key, "failed to read endpoint source: {e:#}");
            return EndpointReply::plain(500, "store unavailable\n");
        }
    };
    if source.is_empty() {
        return EndpointReply::plain(404, "endpoint not found\n");
    }
    if record.status().await.unwrap_or(Status::Enabled) == Status::Disabled {
        return EndpointReply::plain(503, "endpoint disabled\n");
    }

    let mut host = match ScriptHost::new(shared, Interrupt::new()) {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(key = %key, "failed to create script host: {e:#}");
            return EndpointReply::plain(500, "internal error\n");
        }
    };
    let state = Arc::new(Mutex::new(ResponseState::default()));
    install_bindings(&mut host, request, escaped, state.clone());

    for segment in split_template(&source) {
        match segment {
            Segment::Text(text) => state.lock().buffer.push_str(text),
            Segment::Code(code) => {
                if let Err(e) = host.eval(code.to_owned()).await {
                    tracing::error!(key = %key, "endpoint script failed: {e:#}");
                    if let Err(e) = record.record_error(&e).await {
                        tracing::warn!(key = %key, "failed to record error: {e:#}");
                    }
                    return EndpointReply::plain(500, format!("{e:#}\n"));
                }
                if state.lock().error.is_some() {
                    break;
                }
            }
        }
    }

    let state = std::mem::take(&mut *state.lock());
    match state.error {
        Some((message, status)) => EndpointReply::plain(status, format!("{message}\n")),
        None => EndpointReply {
            status: 200,
            content_type: state.content_type,
            headers: state.headers,
            body: state.buffer,
        },
    }
}

#[derive(Clone)]
struct RequestApi {
    method: String,
    path: String,
    query: Map,
    headers: HeaderMap,
    body: String,
}

#[derive(Clone)]
struct ResponseApi {
    state: Arc<Mutex<ResponseState>>,
}

fn install_bindings(
    host: &mut ScriptHost,
    request: EndpointRequest,
    escaped_path: String,
    state: Arc<Mutex<ResponseState>>,
) {
    let engine: &mut Engine = host.engine_mut();

    engine.register_type_with_name::<RequestApi>("Request");
    engine.register_get("Method", |api: &mut RequestApi| api.method.clone());
    engine.register_get("Path", |api: &mut RequestApi| api.path.clone());
    engine.register_get("Query", |api: &mut RequestApi| api.query.clone());
    engine.register_get("Body", |api: &mut RequestApi| api.body.clone());
    engine.register_fn("GetHeader", |api: &mut RequestApi, name: String| {
        api.headers
            .get(&name)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_default()
    });

    engine.register_type_with_name::<ResponseApi>("Response");
    engine.register_fn("Write", |api: &mut ResponseApi, value: Dynamic| {
        api.state.lock().buffer.push_str(&value.to_string());
    });
    engine.register_fn("SetContentType", |api: &mut ResponseApi, value: String| {
        api.state.lock().content_type = Some(value);
    });
    engine.register_fn(
        "SetHeader",
        |api: &mut ResponseApi, name: String, value: String| {
            api.state.lock().headers.push((name, value));
        },
    );
    engine.register_fn(
        "Error",
        |api: &mut ResponseApi, message: String, status: i64| {
            let status = u16::try_from(status).unwrap_or(500);
            api.state.lock().error = Some((message, status));
        },
    );

    let mut query = Map::new();
    for (name, value) in request.query {
        query.insert(name.into(), Dynamic::from(value));
    }

    host.push_binding(
        "request",
        RequestApi {
            method: request.method,
            path: escaped_path,
            query,
            headers: request.headers,
            body: request.body,
        },
    );
    host.push_binding("response", ResponseApi { state });
}

/// The endpoint host: a single fallback route dispatching on the request
/// path.
pub(crate) fn router(shared: Arc<SharedState>) -> Router {
    Router::new().fallback(handle).with_state(shared)
}

async fn handle(State(shared): State<Arc<SharedState>>, request: Request) -> Response {
    if !shared.is_healthy() {
        return to_response(EndpointReply::plain(503, "Unhealthy\n"));
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, 4 * 1024 * 1024).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read request body: {e}");
            return to_response(EndpointReply::plain(400, "bad request body\n"));
        }
    };

    let query = parts
        .uri
        .query()
        .map(|raw| {
            url::form_urlencoded::parse(raw.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    let reply = execute(
        &shared,
        EndpointRequest {
            method: parts.method.to_string(),
            path: parts.uri.path().to_owned(),
            query,
            headers: parts.headers,
            body,
        },
    )
    .await;

    to_response(reply)
}

fn to_response(reply: EndpointReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;

    if let Some(content_type) = reply.content_type {
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
    }
    for (name, value) in reply.headers {
        match (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::warn!("skipping invalid response header {name:?}"),
        }
    }

    response
}
