use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use jsonschema::Validator;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use whispr_core::{AppserverError, GatewayError, ServerMetrics, UserData, WireValue};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<WireValue, AppserverError>> + Send>>;
type HandlerFn = Arc<dyn Fn(WireValue, Option<UserData>) -> HandlerFuture + Send + Sync>;

struct RegisteredAction {
    schema: Option<Validator>,
    auth_required: bool,
    handler: HandlerFn,
}

/// HTTP RPC server exposing one `POST /exec/{action}` route per registered
/// action plus `GET /metrics`. Construct it, `register` every action, then
/// `run`.
pub struct RpcServer {
    actions: HashMap<String, RegisteredAction>,
    auth_secret: SecretString,
    metrics: Arc<ServerMetrics>,
}

impl RpcServer {
    pub fn new(auth_secret: SecretString) -> Self {
        let start = now_unix_millis();
        Self {
            actions: HashMap::new(),
            auth_secret,
            metrics: Arc::new(ServerMetrics::new(start)),
        }
    }

    /// Registers an action under `POST /exec/{action}`. `schema`, if given,
    /// is a JSON Schema the decoded request body must satisfy before the
    /// handler runs; violations become a 422 `ValidationFailed`.
    ///
    /// Actions are unique: re-registering an already-registered key is a
    /// fatal configuration error, reported rather than silently overwriting
    /// the earlier registration.
    pub fn register<F, Fut>(
        &mut self,
        action: impl Into<String>,
        schema: Option<Value>,
        auth_required: bool,
        handler: F,
    ) -> Result<(), GatewayError>
    where
        F: Fn(WireValue, Option<UserData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WireValue, AppserverError>> + Send + 'static,
    {
        let action = action.into();
        if self.actions.contains_key(&action) {
            return Err(GatewayError::DuplicateAction(action));
        }

        let compiled = schema
            .map(|s| jsonschema::validator_for(&s))
            .transpose()
            .map_err(|e| GatewayError::InvalidSchema(format!("{action}: {e}")))?;

        self.actions.insert(
            action,
            RegisteredAction {
                schema: compiled,
                auth_required,
                handler: Arc::new(move |value, user| Box::pin(handler(value, user))),
            },
        );
        Ok(())
    }

    pub async fn run(self, bind_address: &str, port: u16) -> std::io::Result<()> {
        let shared = Arc::new(self);
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(shared.clone()))
                .route("/exec/{action}", web::post().to(exec_route))
                .route("/metrics", web::get().to(metrics_route))
        })
        .bind((bind_address, port))?
        .run()
        .await
    }
}

async fn exec_route(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    server: web::Data<Arc<RpcServer>>,
) -> HttpResponse {
    let started = Instant::now();
    let action_name = path.into_inner();
    let result = handle_exec(&req, &action_name, body.as_ref(), &server).await;
    let failed = result.is_err();
    server
        .metrics
        .record_request(started.elapsed().as_micros() as u64, failed);

    match result {
        Ok(value) => match whispr_core::encode(&value) {
            Ok(bytes) => HttpResponse::Ok().content_type(whispr_core::CONTENT_TYPE).body(bytes),
            Err(_) => error_response(&AppserverError::InternalServerError),
        },
        Err(error) => {
            if matches!(error, AppserverError::InternalServerError) {
                tracing::error!(action = %action_name, "action handler failed internally");
            }
            error_response(&error)
        }
    }
}

async fn handle_exec(
    req: &HttpRequest,
    action_name: &str,
    body: &[u8],
    server: &RpcServer,
) -> Result<WireValue, AppserverError> {
    let content_type = req
        .headers()
        .get(actix_web::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != whispr_core::CONTENT_TYPE {
        return Err(AppserverError::RequestInvalidTypeHeader);
    }

    let action = server
        .actions
        .get(action_name)
        .ok_or_else(|| AppserverError::NotFound(action_name.to_owned()))?;

    let request = whispr_core::decode(body).map_err(|e| AppserverError::RequestInvalidBody {
        reason: e.to_string(),
    })?;

    let user = resolve_user(req, server);
    if action.auth_required && user.is_none() {
        return Err(AppserverError::AuthenticationRequired);
    }

    if let Some(schema) = &action.schema {
        let as_json = whispr_core::wire::to_json(&request);
        let errors: Vec<String> = schema.iter_errors(&as_json).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Err(AppserverError::ValidationFailed {
                errors,
                received: as_json,
            });
        }
    }

    (action.handler)(request, user).await
}

/// Parses whatever bearer token the request carries into a user, independent
/// of whether the action being called requires one. A missing header, a
/// malformed `Bearer` value, and a token that simply doesn't match all
/// resolve the same way: no user. 403 is never raised here — it is reserved
/// for handler-level authorization decisions, not token validation.
fn resolve_user(req: &HttpRequest, server: &RpcServer) -> Option<UserData> {
    let header = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;

    let token = header.strip_prefix("Bearer ")?;

    if token != server.auth_secret.expose_secret() {
        return None;
    }

    Some(UserData {
        id: "server".to_owned(),
        display_name: "service account".to_owned(),
    })
}

async fn metrics_route(server: web::Data<Arc<RpcServer>>) -> HttpResponse {
    let snapshot = server.metrics.snapshot(now_unix_millis());
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(snapshot.to_prometheus_text())
}

fn error_response(error: &AppserverError) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(error.status_code())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(error)
}

fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test as actix_test;
    use pretty_assertions::assert_eq;

    fn test_server() -> RpcServer {
        let mut server = RpcServer::new(SecretString::new("s3cr3t".to_owned()));
        server
            .register("echo", None, false, |value, _user| async move { Ok(value) })
            .unwrap();
        server
    }

    #[actix_web::test]
    async fn exec_rejects_wrong_content_type() {
        let server = test_server();
        let req = actix_test::TestRequest::default().to_http_request();
        let body = whispr_core::encode(&WireValue::map_from(Vec::<(String, WireValue)>::new())).unwrap();
        let result = handle_exec(&req, "echo", &body, &server).await;
        assert!(matches!(result, Err(AppserverError::RequestInvalidTypeHeader)));
    }

    #[actix_web::test]
    async fn exec_routes_to_registered_handler() {
        let server = test_server();
        let req = actix_test::TestRequest::default()
            .insert_header((actix_web::http::header::CONTENT_TYPE, whispr_core::CONTENT_TYPE))
            .to_http_request();
        let request = WireValue::map_from([("ping", WireValue::Str("pong".into()))]);
        let body = whispr_core::encode(&request).unwrap();
        let result = handle_exec(&req, "echo", &body, &server).await.unwrap();
        assert_eq!(result, request);
    }

    #[actix_web::test]
    async fn unknown_action_returns_not_found() {
        let server = test_server();
        let req = actix_test::TestRequest::default()
            .insert_header((actix_web::http::header::CONTENT_TYPE, whispr_core::CONTENT_TYPE))
            .to_http_request();
        let result = handle_exec(&req, "missing", &[], &server).await;
        assert!(matches!(result, Err(AppserverError::NotFound(_))));
    }

    #[test]
    fn reregistering_an_action_is_rejected() {
        let mut server = test_server();
        let result = server.register("echo", None, false, |value, _user| async move { Ok(value) });
        assert!(matches!(result, Err(GatewayError::DuplicateAction(action)) if action == "echo"));
    }

    #[actix_web::test]
    async fn non_auth_required_action_still_sees_a_valid_bearer_user() {
        let mut server = test_server();
        server
            .register("whoami_echo", None, false, |_value, user| async move {
                Ok(WireValue::Str(user.map(|u| u.id).unwrap_or_default()))
            })
            .unwrap();
        let req = actix_test::TestRequest::default()
            .insert_header((actix_web::http::header::CONTENT_TYPE, whispr_core::CONTENT_TYPE))
            .insert_header((actix_web::http::header::AUTHORIZATION, "Bearer s3cr3t"))
            .to_http_request();
        let body = whispr_core::encode(&WireValue::map_from(Vec::<(String, WireValue)>::new())).unwrap();
        let result = handle_exec(&req, "whoami_echo", &body, &server).await.unwrap();
        assert_eq!(result, WireValue::Str("server".to_owned()));
    }

    #[actix_web::test]
    async fn auth_required_action_without_token_is_authentication_required_not_permission_denied() {
        let mut server = test_server();
        server
            .register("needs_auth", None, true, |value, _user| async move { Ok(value) })
            .unwrap();
        let req = actix_test::TestRequest::default()
            .insert_header((actix_web::http::header::CONTENT_TYPE, whispr_core::CONTENT_TYPE))
            .insert_header((actix_web::http::header::AUTHORIZATION, "Bearer wrong-token"))
            .to_http_request();
        let body = whispr_core::encode(&WireValue::map_from(Vec::<(String, WireValue)>::new())).unwrap();
        let result = handle_exec(&req, "needs_auth", &body, &server).await;
        assert!(matches!(result, Err(AppserverError::AuthenticationRequired)));
    }
}
