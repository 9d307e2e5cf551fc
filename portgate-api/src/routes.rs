//! Request routing and handlers for the management API

use crate::server::ApiState;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use portgate_core::{Rule, RulePatch};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Endpoints of the management API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    ListRules,
    AddRule,
    ToggleRule(&'a str),
    DeleteRule(&'a str),
    PatchRule(&'a str),
    Reload,
    Save,
    NotFound,
}

/// Map a method and path onto a route
pub fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["rules"]) => Route::ListRules,
        (&Method::POST, ["rules"]) => Route::AddRule,
        (&Method::POST, ["rules", id, "toggle"]) if !id.is_empty() => Route::ToggleRule(id),
        (&Method::DELETE, ["rules", id]) if !id.is_empty() => Route::DeleteRule(id),
        (&Method::PATCH, ["rules", id]) if !id.is_empty() => Route::PatchRule(id),
        (&Method::POST, ["reload"]) => Route::Reload,
        (&Method::POST, ["save"]) => Route::Save,
        _ => Route::NotFound,
    }
}

#[derive(Serialize)]
struct AddResponse {
    rule: Rule,
    warnings: Vec<String>,
}

#[derive(Serialize)]
struct ToggleResponse<'a> {
    id: &'a str,
    enabled: bool,
}

#[derive(Serialize)]
struct RemoveResponse<'a> {
    removed: &'a str,
}

#[derive(Serialize)]
struct PatchResponse {
    rule: Rule,
    /// Fields left untouched because the patch held their zero value
    ignored_fields: Vec<&'static str>,
}

#[derive(Serialize)]
struct ReloadResponse {
    loaded: usize,
    warnings: Vec<String>,
}

#[derive(Serialize)]
struct CountResponse {
    saved: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// hyper entry point: read the body, then dispatch
pub async fn handle(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            return Ok(error(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };

    Ok(dispatch(&parts.method, parts.uri.path(), &body, &state))
}

/// Run one request against the engine and store
pub fn dispatch(method: &Method, path: &str, body: &[u8], state: &ApiState) -> Response<Full<Bytes>> {
    debug!("{} {}", method, path);

    match route(method, path) {
        Route::ListRules => json(StatusCode::OK, &state.engine.snapshot()),

        Route::AddRule => match serde_json::from_slice::<Rule>(body) {
            Ok(rule) => {
                let warnings = state.engine.add(rule.clone());
                json(
                    StatusCode::OK,
                    &AddResponse {
                        rule,
                        warnings: warnings.iter().map(ToString::to_string).collect(),
                    },
                )
            }
            Err(e) => error(StatusCode::BAD_REQUEST, &format!("invalid rule: {}", e)),
        },

        Route::ToggleRule(id) => match state.engine.invert(id) {
            Some(enabled) => json(StatusCode::OK, &ToggleResponse { id, enabled }),
            None => not_found(),
        },

        Route::DeleteRule(id) => {
            if state.engine.remove(id) {
                json(StatusCode::OK, &RemoveResponse { removed: id })
            } else {
                not_found()
            }
        }

        Route::PatchRule(id) => {
            let patch = match serde_json::from_slice::<RulePatch>(body) {
                Ok(patch) => patch,
                Err(e) => return error(StatusCode::BAD_REQUEST, &format!("invalid patch: {}", e)),
            };

            if !state.engine.update(id, &patch) {
                return not_found();
            }

            match state.engine.get(id) {
                Some(rule) => json(
                    StatusCode::OK,
                    &PatchResponse {
                        rule,
                        ignored_fields: patch.ignored_fields(),
                    },
                ),
                // removed concurrently
                None => not_found(),
            }
        }

        Route::Reload => {
            let rules = state.store.load();
            let loaded = rules.len();
            let warnings = state.engine.reload(rules);
            info!("Rules reloaded from {:?}", state.store.path());
            json(
                StatusCode::OK,
                &ReloadResponse {
                    loaded,
                    warnings: warnings.iter().map(ToString::to_string).collect(),
                },
            )
        }

        Route::Save => {
            let rules = state.engine.snapshot();
            match state.store.save(&rules) {
                Ok(()) => json(StatusCode::OK, &CountResponse { saved: rules.len() }),
                Err(e) => {
                    warn!("Saving rules failed: {}", e);
                    error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
                }
            }
        }

        Route::NotFound => not_found(),
    }
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, body),
        Err(e) => {
            warn!("Failed to encode response: {}", e);
            respond(StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

fn error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json(
        status,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}

fn not_found() -> Response<Full<Bytes>> {
    error(StatusCode::NOT_FOUND, "not found")
}

fn respond(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use portgate_core::{Action, EventLog, PolicyEngine, RuleStore};
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> ApiState {
        ApiState {
            engine: Arc::new(PolicyEngine::new()),
            store: RuleStore::new(dir.path().join("rules.json")),
            events: Arc::new(EventLog::new(dir.path().join("events.jsonl"))),
        }
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_route_table() {
        assert_eq!(route(&Method::GET, "/rules"), Route::ListRules);
        assert_eq!(route(&Method::POST, "/rules"), Route::AddRule);
        assert_eq!(route(&Method::POST, "/rules/abc/toggle"), Route::ToggleRule("abc"));
        assert_eq!(route(&Method::DELETE, "/rules/abc"), Route::DeleteRule("abc"));
        assert_eq!(route(&Method::PATCH, "/rules/abc"), Route::PatchRule("abc"));
        assert_eq!(route(&Method::POST, "/reload"), Route::Reload);
        assert_eq!(route(&Method::POST, "/save"), Route::Save);

        assert_eq!(route(&Method::GET, "/"), Route::NotFound);
        assert_eq!(route(&Method::DELETE, "/rules/"), Route::NotFound);
        assert_eq!(route(&Method::PUT, "/rules"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/rules/abc/toggle"), Route::NotFound);
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let body = br#"{"RuleId":"r1","Port":22,"Protocol":"TCP","Action":"Deny","Priority":5}"#;
        let response = dispatch(&Method::POST, "/rules", body, &state);
        assert_eq!(response.status(), StatusCode::OK);
        let added = body_json(response).await;
        assert_eq!(added["rule"]["RuleId"], "r1");
        assert_eq!(added["warnings"].as_array().unwrap().len(), 0);

        let response = dispatch(&Method::GET, "/rules", b"", &state);
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["Action"], "Deny");
    }

    #[tokio::test]
    async fn test_add_duplicate_reports_warning() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        state.engine.add(Rule::new(Action::Deny).with_id("a").with_destination_port(22));

        let body = br#"{"RuleId":"b","Port":22,"Action":"Deny"}"#;
        let added = body_json(dispatch(&Method::POST, "/rules", body, &state)).await;
        let warnings = added["warnings"].as_array().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].as_str().unwrap().starts_with("DUPLICATE"));
        assert_eq!(state.engine.len(), 2);
    }

    #[test]
    fn test_bad_json_is_rejected() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let response = dispatch(&Method::POST, "/rules", b"not json", &state);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.engine.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_delete_patch() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        state.engine.add(Rule::new(Action::Deny).with_id("a").with_destination_port(22));

        let toggled = body_json(dispatch(&Method::POST, "/rules/a/toggle", b"", &state)).await;
        assert_eq!(toggled["enabled"], false);

        let missing = dispatch(&Method::POST, "/rules/zzz/toggle", b"", &state);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let patched = body_json(dispatch(
            &Method::PATCH,
            "/rules/a",
            br#"{"Action":"Deny","Priority":1,"SourceIP":"10.0.0.0/8"}"#,
            &state,
        )).await;
        assert_eq!(patched["rule"]["Priority"], 1);
        assert_eq!(patched["rule"]["Port"], 22);
        assert_eq!(patched["rule"]["IsEnabled"], true);
        let ignored = patched["ignored_fields"].as_array().unwrap();
        assert!(ignored.iter().any(|f| f == "Port"));

        let missing = dispatch(&Method::PATCH, "/rules/zzz", b"{}", &state);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let deleted = dispatch(&Method::DELETE, "/rules/a", b"", &state);
        assert_eq!(deleted.status(), StatusCode::OK);
        let again = dispatch(&Method::DELETE, "/rules/a", b"", &state);
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        state.engine.add(Rule::new(Action::Deny).with_id("kept"));

        let saved = body_json(dispatch(&Method::POST, "/save", b"", &state)).await;
        assert_eq!(saved["saved"], 1);

        state.engine.clear();
        state.engine.add(Rule::new(Action::Allow).with_id("transient"));

        let reloaded = body_json(dispatch(&Method::POST, "/reload", b"", &state)).await;
        assert_eq!(reloaded["loaded"], 1);
        let ids: Vec<_> = state.engine.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["kept"]);
    }
}
