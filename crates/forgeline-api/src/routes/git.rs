//! Git smart-HTTP transport (§6 "Git smart-HTTP contract"): shells out
//! to `git http-backend` the way a CGI gateway would, pointed at the
//! bare repo `GitHost` already owns the lifecycle of.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}.git/info/refs", get(info_refs))
        .route("/{id}.git/{service}", any(service_rpc))
        .route("/{id}.git/HEAD", get(head))
}

async fn info_refs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let service = query
        .get("service")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("missing service query parameter".to_string()))?;
    let service_name = service.strip_prefix("git-").unwrap_or(&service).to_string();

    if !state.git.exists(&id) {
        return Err(ApiError::NotFound(format!("repository {id} not found")));
    }

    let mut preamble = Vec::new();
    let header = format!("# service={service}\n");
    write_pkt_line(&mut preamble, &header);
    preamble.extend_from_slice(b"0000");

    let output = run_http_backend(
        &state,
        &id,
        &service_name,
        &[
            ("GIT_HTTP_EXPORT_ALL", "1"),
            ("REQUEST_METHOD", "GET"),
            ("GIT_PROTOCOL", "version=2"),
        ],
        &format!("/info/refs?service={service}"),
        None,
    )
    .await?;

    preamble.extend_from_slice(&strip_cgi_headers(&output));

    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            format!("application/x-{service_name}-advertisement"),
        )],
        preamble,
    )
        .into_response())
}

async fn service_rpc(
    State(state): State<AppState>,
    Path((id, service)): Path<(String, String)>,
    method: Method,
    body: Bytes,
) -> Result<Response, ApiError> {
    if method != Method::POST {
        return Err(ApiError::BadRequest("git smart-HTTP only accepts POST for service RPCs".to_string()));
    }
    if service != "git-upload-pack" && service != "git-receive-pack" {
        return Err(ApiError::NotFound(format!("unknown git service {service}")));
    }
    let service_name = service.strip_prefix("git-").unwrap_or(&service).to_string();

    if !state.git.exists(&id) {
        return Err(ApiError::NotFound(format!("repository {id} not found")));
    }

    let output = run_http_backend(
        &state,
        &id,
        &service_name,
        &[
            ("GIT_HTTP_EXPORT_ALL", "1"),
            ("REQUEST_METHOD", "POST"),
            ("CONTENT_TYPE", &format!("application/x-{service}-request")),
        ],
        &format!("/{service}"),
        Some(body),
    )
    .await?;

    let body = strip_cgi_headers(&output);
    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            format!("application/x-{service_name}-result"),
        )],
        body,
    )
        .into_response())
}

async fn head(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let default_branch = state
        .repository_repo
        .list()
        .await
        .ok()
        .and_then(|repos| repos.into_iter().find(|r| r.id.to_string() == id))
        .map(|r| r.default_branch)
        .unwrap_or_else(|| "main".to_string());

    Ok((
        StatusCode::OK,
        format!("ref: refs/heads/{default_branch}\n"),
    )
        .into_response())
}

/// Invokes `git http-backend` as a CGI subprocess against the repo's
/// bare directory, matching the teacher's own pattern of shelling out
/// to the `git` binary rather than reimplementing the wire protocol.
async fn run_http_backend(
    state: &AppState,
    id: &str,
    _service_name: &str,
    env: &[(&str, &str)],
    path_info: &str,
    body: Option<Bytes>,
) -> Result<Vec<u8>, ApiError> {
    let mut cmd = Command::new("git");
    cmd.arg("http-backend")
        .env("GIT_PROJECT_ROOT", state.config.git_repository_root.clone())
        .env("GIT_HTTP_EXPORT_ALL", "1")
        .env("PATH_INFO", format!("/{id}.git{path_info}"))
        .env("REMOTE_ADDR", "127.0.0.1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ApiError::Internal(format!("failed to spawn git http-backend: {e}")))?;

    if let Some(body) = body {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| ApiError::Internal(format!("failed to write request body: {e}")))?;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ApiError::Internal(format!("git http-backend failed: {e}")))?;

    if !output.status.success() {
        return Err(ApiError::Internal(format!(
            "git http-backend exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(output.stdout)
}

/// `git http-backend` emits CGI-style `Key: value\r\n` headers followed
/// by a blank line before the actual body; axum already sets the
/// content-type header itself, so strip everything up to that blank
/// line.
fn strip_cgi_headers(output: &[u8]) -> Vec<u8> {
    if let Some(pos) = find_subsequence(output, b"\r\n\r\n") {
        output[pos + 4..].to_vec()
    } else if let Some(pos) = find_subsequence(output, b"\n\n") {
        output[pos + 2..].to_vec()
    } else {
        output.to_vec()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn write_pkt_line(buf: &mut Vec<u8>, data: &str) {
    let len = data.len() + 4;
    buf.extend_from_slice(format!("{len:04x}").as_bytes());
    buf.extend_from_slice(data.as_bytes());
}
