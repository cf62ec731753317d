use crate::config::Config;
use crate::error::{ApiError, ErrorCode, GatewayError, GatewayResult};
use crate::ids::IdGenerator;
use crate::session::{Session, SessionInfo, SessionPool, SessionType, TelnetParams};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state behind every HTTP route.
#[derive(Clone)]
pub struct Gateway {
    pool: Arc<SessionPool>,
    ids: Arc<dyn IdGenerator>,
    config: Arc<Config>,
}

impl Gateway {
    pub fn new(pool: Arc<SessionPool>, ids: Arc<dyn IdGenerator>, config: Config) -> Self {
        Self {
            pool,
            ids,
            config: Arc::new(config),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1.0/telnet/connect", post(connect_telnet))
            .route("/api/v1.0/:kind/connect", get(connect_local))
            .route("/api/v1.0/:kind/command", post(command))
            .route("/api/v1.0/:kind/disconnect", get(disconnect))
            .route("/api/v1.0/:kind/ping", get(ping))
            .route("/api/v1.0/:kind/list", get(list))
            .with_state(self.clone())
    }

    pub async fn serve(self, listen: &str) -> GatewayResult<()> {
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .inspect_err(|err| tracing::error!(listen, error = %err, "Failed to bind HTTP listener"))?;
        tracing::info!(listen, "HTTP gateway listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        tracing::info!("HTTP gateway stopped");
        Ok(())
    }

    /// Connects a freshly built session and registers it. A session that cannot be
    /// registered is closed so its backend does not outlive the request.
    async fn admit(&self, session: Session) -> GatewayResult<String> {
        let session = Arc::new(session);
        session.connect().await?;
        let session_id = session.id().to_string();
        if let Err(err) = self.pool.put(session.clone()).await {
            session.close();
            return Err(err);
        }
        Ok(session_id)
    }

    /// Looks a session up and checks it belongs to the route's kind.
    async fn lookup(&self, kind: SessionType, session_id: &str) -> GatewayResult<Arc<Session>> {
        let session = self.pool.get(session_id).await?;
        if session.session_type() != kind {
            return Err(ApiError::new(ErrorCode::NotFound, "Session not found")
                .with_details(format!("session {session_id} is not a {kind} session"))
                .into());
        }
        Ok(session)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub sessionid: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectTelnetRequest {
    pub host: String,
    pub port: u32,
    pub login: String,
    pub password: String,
    pub login_expected_string: String,
    pub password_expected_string: String,
    pub hostname_expected_string: String,
    pub continue_command_expected_string: String,
}

impl ConnectTelnetRequest {
    fn into_params(self) -> GatewayResult<TelnetParams> {
        let port = u16::try_from(self.port).map_err(|_| {
            ApiError::new(ErrorCode::InvalidArgument, "Telnet port is out of range")
                .with_details(format!("port={}", self.port))
        })?;
        Ok(TelnetParams {
            host: self.host,
            port,
            login: self.login,
            password: self.password,
            login_prompt: self.login_expected_string,
            password_prompt: self.password_expected_string,
            ready_prompt: self.hostname_expected_string,
            continuation_marker: self.continue_command_expected_string,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommandRequest {
    pub sessionid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commandid: Option<i64>,
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub output: String,
    pub sessionid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commandid: Option<i64>,
    pub command: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SessionQuery {
    pub sessionid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub sessionid: String,
    pub alive: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub sessions: Vec<SessionInfo>,
}

/// JSON error body with a status derived from the error code.
#[derive(Debug)]
pub struct HttpError(ApiError);

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        Self(err.into_api())
    }
}

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0.error_code);
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "Request failed");
        } else {
            tracing::info!(status = status.as_u16(), error = %self.0, "Request rejected");
        }
        (status, Json(self.0)).into_response()
    }
}

pub fn status_for(code: &ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::CommandTimeout | ErrorCode::ConnectTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::SessionClosed => StatusCode::GONE,
        ErrorCode::ConnectFailed | ErrorCode::HandshakeFailed | ErrorCode::RemoteClosed => {
            StatusCode::BAD_GATEWAY
        }
        ErrorCode::IdGeneration | ErrorCode::IoError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type HttpResult<T> = Result<T, HttpError>;

fn route_kind(kind: &str) -> HttpResult<SessionType> {
    kind.parse::<SessionType>().map_err(|_| {
        HttpError(
            ApiError::new(ErrorCode::NotFound, "Unknown session kind")
                .with_details(format!("kind={kind}")),
        )
    })
}

fn session_id_param(query: Result<Query<SessionQuery>, QueryRejection>) -> HttpResult<String> {
    let Query(query) = query.map_err(|err| {
        ApiError::new(ErrorCode::InvalidArgument, "Invalid query string").with_details(err.body_text())
    })?;
    if query.sessionid.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "Missing sessionid parameter").into());
    }
    Ok(query.sessionid)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> HttpResult<T> {
    payload.map(|Json(body)| body).map_err(|err| {
        HttpError(
            ApiError::new(ErrorCode::InvalidArgument, "Invalid JSON body").with_details(err.body_text()),
        )
    })
}

async fn connect_local(
    State(gateway): State<Gateway>,
    Path(kind): Path<String>,
) -> HttpResult<Json<ConnectResponse>> {
    let config = &gateway.config;
    let session = match route_kind(&kind)? {
        SessionType::Local => Session::local(gateway.ids.as_ref(), &config.session, &config.local)?,
        SessionType::Console => Session::console(gateway.ids.as_ref(), &config.session)?,
        SessionType::Telnet => {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "Telnet sessions are opened with POST and connection parameters",
            )
            .into());
        }
    };
    let sessionid = gateway.admit(session).await?;
    Ok(Json(ConnectResponse { sessionid }))
}

async fn connect_telnet(
    State(gateway): State<Gateway>,
    payload: Result<Json<ConnectTelnetRequest>, JsonRejection>,
) -> HttpResult<Json<ConnectResponse>> {
    let params = json_body(payload)?.into_params()?;
    let config = &gateway.config;
    let session = Session::telnet(gateway.ids.as_ref(), params, &config.session, &config.telnet)?;
    let sessionid = gateway.admit(session).await?;
    Ok(Json(ConnectResponse { sessionid }))
}

async fn command(
    State(gateway): State<Gateway>,
    Path(kind): Path<String>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> HttpResult<Json<CommandResponse>> {
    let kind = route_kind(&kind)?;
    let request = json_body(payload)?;
    if request.sessionid.is_empty() || request.command.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "sessionid and command are required").into());
    }

    let session = gateway.lookup(kind, &request.sessionid).await?;
    let output = session.command(&request.command).await?;
    Ok(Json(CommandResponse {
        output,
        sessionid: session.id().to_string(),
        commandid: request.commandid,
        command: request.command,
    }))
}

async fn disconnect(
    State(gateway): State<Gateway>,
    Path(kind): Path<String>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> HttpResult<StatusCode> {
    let kind = route_kind(&kind)?;
    let session_id = session_id_param(query)?;
    gateway.pool.remove_and_close_as(&session_id, kind).await?;
    Ok(StatusCode::OK)
}

async fn ping(
    State(gateway): State<Gateway>,
    Path(kind): Path<String>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> HttpResult<Json<PingResponse>> {
    let kind = route_kind(&kind)?;
    let sessionid = session_id_param(query)?;
    let session = gateway.lookup(kind, &sessionid).await?;
    let alive = session.ping().await;
    Ok(Json(PingResponse { sessionid, alive }))
}

async fn list(
    State(gateway): State<Gateway>,
    Path(kind): Path<String>,
) -> HttpResult<Json<ListResponse>> {
    let kind = route_kind(&kind)?;
    let sessions = gateway.pool.list(Some(kind)).await;
    Ok(Json(ListResponse { sessions }))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
