use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{AppserverError, RpcError};
use crate::searcher::UserData;
use crate::wire::{self, WireValue, CONTENT_TYPE};
use whispr_cell::{to_dispatcher_error, Cell, Dispatcher};

/// Resolves an `Authorization: Bearer <token>` cell into the current user,
/// re-run any time the token changes. Debounce is zero: auth changes are
/// rare and must resolve as soon as possible.
pub type UserDispatcher = Dispatcher<Option<String>, Option<UserData>>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: std::time::Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// HTTP-backed RPC caller. Authentication state lives in a [`Cell`] so
/// other parts of the application can react to login/logout without
/// polling; `user` re-derives from it through a [`Dispatcher`].
pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
    auth_token_cell: Arc<Cell<Option<SecretTokenView>>>,
    pub user: UserDispatcher,
}

/// Wraps the bearer token so it never prints in a `Debug` derive while
/// still comparing by value for the Cell's change detection.
#[derive(Clone)]
struct SecretTokenView(SecretString);

impl PartialEq for SecretTokenView {
    fn eq(&self, other: &Self) -> bool {
        self.0.expose_secret() == other.0.expose_secret()
    }
}

impl std::fmt::Debug for SecretTokenView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretTokenView(<redacted>)")
    }
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client configuration is valid");

        let auth_token_cell: Arc<Cell<Option<SecretTokenView>>> = Arc::new(Cell::new(None));
        let token_for_dispatch = auth_token_cell.clone();
        let plain_token_cell: Cell<Option<String>> = Cell::new(None);
        {
            let plain = plain_token_cell.clone();
            token_for_dispatch.subscribe(move |t| {
                plain.set(t.as_ref().map(|v| v.0.expose_secret().to_owned()));
            });
        }

        let http_for_whoami = http.clone();
        let base_url_for_whoami = config.base_url.clone();
        let user = Dispatcher::new(plain_token_cell, std::time::Duration::ZERO, move |token, _progress, cancel| {
            let http = http_for_whoami.clone();
            let base_url = base_url_for_whoami.clone();
            async move {
                let Some(token) = token else {
                    return Ok(None);
                };
                if cancel.is_cancelled() {
                    return Err(to_dispatcher_error(RpcError::Transport("cancelled".into())));
                }
                let request = WireValue::map_from(Vec::<(String, WireValue)>::new());
                let response: WhoAmIResponse =
                    exec_raw(&http, &base_url, "auth/whoami", Some(&token), &request)
                        .await
                        .map_err(to_dispatcher_error)?;
                Ok(response.user)
            }
        });

        Self {
            http,
            base_url: config.base_url,
            auth_token_cell,
            user,
        }
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        self.auth_token_cell.set(token.map(|t| SecretTokenView(SecretString::new(t))));
    }

    pub fn auth_token(&self) -> Option<String> {
        self.auth_token_cell
            .get()
            .map(|v| v.0.expose_secret().to_owned())
    }

    /// Executes a login action and stores the returned token on success.
    pub async fn login(&self, input: impl Serialize) -> Result<(), RpcError> {
        let response: LoginResponse = self.exec("auth/login", input).await?;
        self.set_auth_token(Some(response.token));
        Ok(())
    }

    /// Executes a validated action, attaching the current auth token. Thin
    /// wrapper over [`RpcClient::unsafe_exec`], which does the actual work;
    /// this is the name callers reach for.
    pub async fn exec<O: DeserializeOwned>(
        &self,
        action: &str,
        input: impl Serialize,
    ) -> Result<O, RpcError> {
        self.unsafe_exec(action, input).await
    }

    /// Attaches the current auth token and runs the full status dispatch,
    /// including race-safe token invalidation. Named `unsafe_exec` because
    /// it is the low-level primitive `exec` is built on, not because it
    /// skips anything `exec` does — every action goes through this path.
    ///
    /// On a 401/403 the token is cleared, but only if it still matches the
    /// snapshot taken before the call — a token set by a concurrent login
    /// must never be clobbered by a stale failure.
    pub async fn unsafe_exec<O: DeserializeOwned>(
        &self,
        action: &str,
        input: impl Serialize,
    ) -> Result<O, RpcError> {
        let snapshot = self.auth_token();
        let request = to_wire_value(input)?;
        let result = exec_raw(&self.http, &self.base_url, action, snapshot.as_deref(), &request).await;
        if let Err(RpcError::PermissionDenied) = &result {
            if self.auth_token() == snapshot {
                self.set_auth_token(None);
            }
        }
        result
    }
}

fn to_wire_value(input: impl Serialize) -> Result<WireValue, RpcError> {
    let json = serde_json::to_value(input).map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(wire::from_json(json))
}

async fn exec_raw<O: DeserializeOwned>(
    http: &reqwest::Client,
    base_url: &str,
    action: &str,
    token: Option<&str>,
    request: &WireValue,
) -> Result<O, RpcError> {
    let body = wire::encode(request).map_err(|e| RpcError::Codec(e.to_string()))?;
    let url = format!("{base_url}/exec/{action}");
    let mut builder = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
        .body(body);
    if let Some(token) = token {
        builder = builder.bearer_auth(token);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;

    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;

    if status >= 400 {
        let decoded: Option<AppserverError> = serde_json::from_slice(&bytes).ok();
        return Err(RpcError::from_status(status, decoded.as_ref()));
    }

    let value = wire::decode(&bytes).map_err(|e| RpcError::Codec(e.to_string()))?;
    serde_json::from_value(wire::to_json(&value)).map_err(|e| RpcError::Codec(e.to_string()))
}

#[derive(serde::Deserialize)]
struct WhoAmIResponse {
    user: Option<UserData>,
}

#[derive(serde::Deserialize)]
struct LoginResponse {
    token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn login_stores_returned_token() {
        let server = MockServer::start().await;
        let body = wire::encode(&WireValue::map_from([(
            "token",
            WireValue::Str("abc123".into()),
        )]))
        .unwrap();
        Mock::given(method("POST"))
            .and(path("/exec/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", CONTENT_TYPE)
                    .set_body_raw(body, CONTENT_TYPE),
            )
            .mount(&server)
            .await;

        let client = RpcClient::new(ClientConfig::new(server.uri()));
        client.login(serde_json::json!({"user": "a"})).await.unwrap();
        assert_eq!(client.auth_token(), Some("abc123".to_owned()));
    }

    #[tokio::test]
    async fn exec_clears_token_on_401_unless_superseded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exec/protected"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = RpcClient::new(ClientConfig::new(server.uri()));
        client.set_auth_token(Some("stale".to_owned()));

        let result: Result<serde_json::Value, RpcError> =
            client.exec("protected", serde_json::json!({})).await;
        assert!(matches!(result, Err(RpcError::PermissionDenied)));
        assert_eq!(client.auth_token(), None);
    }
}
