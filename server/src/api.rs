//! The optional read-only HTTP surface.
//!
//! `GET /status`, `GET /peers`, `GET /peers/<id>`, `GET /metrics`, and
//! `GET /stream/status` (server-sent events, 5 s cadence). Every request
//! needs a bearer token; tokens live in the datastore as salted hashes and
//! are compared in constant time. Handlers only ever open read-only
//! database connections; there is no mutating route.

use std::{
    collections::VecDeque,
    convert::TryInto,
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use hyper::{http, server::conn::AddrStream, Body, Method, Request, Response, StatusCode};
use rusqlite::Connection;
use serde_json::json;

use crate::{
    db::{
        self, DatabaseApiToken, DatabaseExit, DatabaseExitHealth, DatabaseRemote, DatabaseRouter,
        DatabaseServer, TokenScope,
    },
    Error,
};

/// SSE emit cadence; the contract is "at least every 5 seconds".
const STREAM_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ApiContext {
    pub database_path: PathBuf,
}

impl ApiContext {
    fn read_conn(&self) -> Result<Connection, Error> {
        db::open_read_only(&self.database_path)
    }
}

pub async fn serve(context: ApiContext, listen: SocketAddr) -> Result<(), Error> {
    let make_svc = hyper::service::make_service_fn(move |socket: &AddrStream| {
        let remote_addr = socket.remote_addr();
        let context = context.clone();
        async move {
            Ok::<_, http::Error>(hyper::service::service_fn(move |req: Request<Body>| {
                log::debug!("{} - {} {}", &remote_addr, req.method(), req.uri());
                hyper_service(req, context.clone())
            }))
        }
    });

    log::info!("read-only API listening on {listen}");
    hyper::Server::try_bind(&listen)
        .map_err(|e| Error::Network(e.to_string()))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Network(e.to_string()))
}

async fn hyper_service(
    req: Request<Body>,
    context: ApiContext,
) -> Result<Response<Body>, http::Error> {
    let components: VecDeque<_> = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .map(String::from)
        .collect();

    routes(req, context, components).or_else(TryInto::try_into)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: e.to_string(),
        }
    }
}

impl TryFrom<ApiError> for Response<Body> {
    type Error = http::Error;

    fn try_from(e: ApiError) -> Result<Self, http::Error> {
        Response::builder()
            .status(e.status)
            .header("Content-Type", "application/json")
            .body(Body::from(
                json!({ "error": e.message }).to_string(),
            ))
    }
}

fn authorize(req: &Request<Body>, conn: &Connection) -> Result<TokenScope, ApiError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::from(Error::Auth("missing bearer token".to_string())))?;
    DatabaseApiToken::verify(conn, token)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::from(Error::Auth("unknown token".to_string())))
}

fn routes(
    req: Request<Body>,
    context: ApiContext,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ApiError> {
    if req.method() != Method::GET {
        return Err(ApiError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "this surface is read-only".to_string(),
        });
    }
    let conn = context.read_conn()?;
    // Every scope may read; the scope ladder matters only to mutating
    // surfaces layered on top of this one.
    let _scope = authorize(&req, &conn)?;

    match components.pop_front().as_deref() {
        Some("status") => json_response(status_body(&conn)?),
        Some("metrics") => text_response(metrics_body(&conn)?),
        Some("peers") => match components.pop_front() {
            None => json_response(peers_body(&conn)?),
            Some(id) => {
                let id: i64 = id.parse().map_err(|_| {
                    ApiError::from(Error::validation("id", "peer ids are integers"))
                })?;
                json_response(peer_body(&conn, id)?)
            },
        },
        Some("stream") if components.pop_front().as_deref() == Some("status") => {
            Ok(stream_status(context))
        },
        _ => Err(ApiError::from(Error::not_found("route", "unknown"))),
    }
}

fn json_response(value: serde_json::Value) -> Result<Response<Body>, ApiError> {
    Response::builder()
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })
}

fn text_response(text: String) -> Result<Response<Body>, ApiError> {
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(text))
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })
}

fn status_body(conn: &Connection) -> Result<serde_json::Value, Error> {
    let server = DatabaseServer::get_opt(conn)?;
    let routers = DatabaseRouter::list(conn)?;
    let remotes = DatabaseRemote::list(conn)?;
    let exits = DatabaseExit::list(conn)?;
    let health = DatabaseExitHealth::list(conn)?;
    Ok(json!({
        "hub": server.as_ref().map(|s| json!({
            "hostname": &*s.hostname,
            "endpoint": s.endpoint.to_string(),
        })),
        "routers": routers.len(),
        "remotes": remotes.len(),
        "exits": exits.iter().map(|e| {
            let state = health
                .iter()
                .find(|h| h.exit_id == e.id)
                .map(|h| h.state.as_str())
                .unwrap_or("healthy");
            json!({ "hostname": &*e.hostname, "state": state })
        }).collect::<Vec<_>>(),
    }))
}

fn peers_body(conn: &Connection) -> Result<serde_json::Value, Error> {
    let routers = DatabaseRouter::list(conn)?;
    let remotes = DatabaseRemote::list(conn)?;
    let exits = DatabaseExit::list(conn)?;
    Ok(json!({
        "routers": routers.iter().map(|r| json!({
            "id": r.id,
            "hostname": &*r.hostname,
            "public_key": r.public_key,
            "lans": r.lans.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
        "remotes": remotes.iter().map(|r| json!({
            "id": r.id,
            "hostname": &*r.hostname,
            "public_key": r.public_key,
            "access_level": r.access_level.as_str(),
        })).collect::<Vec<_>>(),
        "exits": exits.iter().map(|e| json!({
            "id": e.id,
            "hostname": &*e.hostname,
            "public_key": e.public_key,
        })).collect::<Vec<_>>(),
    }))
}

fn peer_body(conn: &Connection, id: i64) -> Result<serde_json::Value, Error> {
    let remote = DatabaseRemote::get(conn, id)?;
    Ok(json!({
        "id": remote.id,
        "hostname": &*remote.hostname,
        "public_key": remote.public_key,
        "permanent_guid": remote.permanent_guid,
        "access_level": remote.access_level.as_str(),
        "ipv4": remote.ipv4_addr.map(|a| a.to_string()),
        "ipv6": remote.ipv6_addr.map(|a| a.to_string()),
        "active_exit_id": remote.active_exit_id,
        "last_rotated_at": remote.last_rotated_at.map(|t| t.to_rfc3339()),
    }))
}

fn metrics_body(conn: &Connection) -> Result<String, Error> {
    let routers = DatabaseRouter::list(conn)?.len();
    let remotes = DatabaseRemote::list(conn)?.len();
    let exits = DatabaseExitHealth::list(conn)?;
    let mut out = String::new();
    out.push_str("# TYPE wgfleet_peers gauge\n");
    out.push_str(&format!("wgfleet_peers{{kind=\"router\"}} {routers}\n"));
    out.push_str(&format!("wgfleet_peers{{kind=\"remote\"}} {remotes}\n"));
    out.push_str("# TYPE wgfleet_exit_healthy gauge\n");
    for health in exits {
        let healthy = matches!(health.state, wgfleet_shared::HealthState::Healthy) as u8;
        out.push_str(&format!(
            "wgfleet_exit_healthy{{exit_id=\"{}\"}} {healthy}\n",
            health.exit_id
        ));
    }
    Ok(out)
}

/// Server-sent events: a fresh status body every tick until the client
/// hangs up.
fn stream_status(context: ApiContext) -> Response<Body> {
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STREAM_INTERVAL);
        loop {
            interval.tick().await;
            let payload = match context
                .read_conn()
                .and_then(|conn| status_body(&conn))
            {
                Ok(status) => format!("data: {status}\n\n"),
                Err(e) => format!("event: error\ndata: {{\"error\":\"{e}\"}}\n\n"),
            };
            if sender.send_data(payload.into()).await.is_err() {
                break;
            }
        }
    });
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
