//! API-token authentication middleware.

use axum::extract::{RawPathParams, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, warn};

use super::error_response;
use crate::app::AppState;
use crate::store;

/// Pull the api token out of the request: `Authorization: Bearer`/`Token`,
/// an `Api-Token` header, or an `api_token` query parameter.
fn extract_token(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get("authorization") {
        let value = value.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") && !scheme.eq_ignore_ascii_case("token") {
            return None;
        }
        return Some(token.trim().to_string());
    }

    if let Some(value) = req.headers().get("api-token") {
        return value.to_str().ok().map(|s| s.trim().to_string());
    }

    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "api_token").then(|| value.to_string())
        })
    })
}

/// Authenticate the `:name` inbox and stash it in request extensions.
///
/// Unknown inbox and bad token both answer a bare 401; the distinct causes
/// only reach the log.
pub async fn require_api_token(
    State(state): State<AppState>,
    params: RawPathParams,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(name) = params
        .iter()
        .find(|(key, _)| *key == "name")
        .map(|(_, value)| value.to_string())
    else {
        return error_response(StatusCode::BAD_REQUEST, "inbox name missing");
    };

    let Some(token) = extract_token(&req) else {
        return error_response(StatusCode::UNAUTHORIZED, "api token required");
    };

    let inbox = match store::inbox_by_name(&state.db, &name).await {
        Ok(Some(inbox)) => inbox,
        Ok(None) => {
            warn!("api auth failed: inbox {} not found", name);
            return error_response(StatusCode::UNAUTHORIZED, "authentication failed");
        }
        Err(e) => {
            error!("failed to look up inbox {}: {}", name, e);
            return super::internal_error();
        }
    };

    match state.hashers.verify_secret(&token, &inbox.api_key) {
        Ok(true) => {}
        Ok(false) => {
            warn!("api auth failed: invalid token for inbox {}", name);
            return error_response(StatusCode::UNAUTHORIZED, "authentication failed");
        }
        Err(e) => {
            error!("failed to verify api token for inbox {}: {}", name, e);
            return super::internal_error();
        }
    }

    req.extensions_mut().insert(inbox);
    next.run(req).await
}
