use crate::config::{TelnetConfig, TelnetLineEnding};
use crate::error::{ApiError, ErrorCode, GatewayError, GatewayResult};
use crate::session::SessionBackend;
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant, timeout, timeout_at};

/// Line sent to ask the remote pager for the next page.
pub const CONTINUE_COMMAND: &str = " ";

const IAC: u8 = 0xff;
const DONT: u8 = 0xfe;
const DO: u8 = 0xfd;
const WONT: u8 = 0xfc;
const WILL: u8 = 0xfb;
const SB: u8 = 0xfa;
const SE: u8 = 0xf0;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

const READ_CHUNK: usize = 4096;

/// Connection parameters and protocol markers for one telnet session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelnetParams {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub login_prompt: String,
    pub password_prompt: String,
    pub ready_prompt: String,
    /// Pager marker such as `--More--`; empty when the remote never pages.
    pub continuation_marker: String,
}

impl TelnetParams {
    pub fn validate(&self) -> GatewayResult<()> {
        let required = [
            ("host", &self.host),
            ("login", &self.login),
            ("password", &self.password),
            ("login_prompt", &self.login_prompt),
            ("password_prompt", &self.password_prompt),
            ("ready_prompt", &self.ready_prompt),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::InvalidArgument,
                    format!("{name} is required for telnet sessions"),
                )
                .into());
            }
        }
        if self.port == 0 {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "port is required for telnet sessions",
            )
            .into());
        }
        Ok(())
    }
}

pub struct TelnetBackend {
    params: TelnetParams,
    connect_timeout: Duration,
    io_timeout: Duration,
    line_ending: TelnetLineEnding,
    stream: Option<TelnetStream<TcpStream>>,
}

impl TelnetBackend {
    pub fn new(params: TelnetParams, config: &TelnetConfig, io_timeout: Duration) -> Self {
        Self {
            params,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            io_timeout,
            line_ending: config.line_ending,
            stream: None,
        }
    }

    async fn open(&self) -> GatewayResult<TcpStream> {
        let addr = format!("{}:{}", self.params.host, self.params.port);
        timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ApiError::new(ErrorCode::ConnectTimeout, "Telnet connect timeout")
                    .with_details(addr.clone())
            })?
            .map_err(|err| {
                ApiError::new(ErrorCode::ConnectFailed, "Telnet connect failed")
                    .with_details(format!("{addr}: {err}"))
                    .into()
            })
    }
}

#[async_trait]
impl SessionBackend for TelnetBackend {
    async fn connect(&mut self) -> GatewayResult<()> {
        let socket = self.open().await?;
        let mut stream = TelnetStream::new(socket, self.io_timeout, self.line_ending);
        let params = &self.params;

        let banner = stream
            .read_until(&params.login_prompt)
            .await
            .map_err(|err| handshake_error("login prompt", err))?;
        tracing::debug!(host = %params.host, banner = %String::from_utf8_lossy(&banner), "Telnet login prompt received");
        stream.send_line(&params.login).await?;

        stream
            .read_until(&params.password_prompt)
            .await
            .map_err(|err| handshake_error("password prompt", err))?;
        stream.send_line(&params.password).await?;

        let motd = stream
            .read_until(&params.ready_prompt)
            .await
            .map_err(|err| handshake_error("ready prompt", err))?;
        tracing::info!(
            host = %params.host,
            port = params.port,
            motd_bytes = motd.len(),
            "Telnet login completed"
        );

        self.stream = Some(stream);
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> GatewayResult<String> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.send_line(command).await?;
        let output = stream
            .read_response(&self.params.continuation_marker, &self.params.ready_prompt)
            .await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Sends a blank line and waits for the prompt to come back.
    async fn ping(&mut self) -> GatewayResult<()> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.send_line("").await?;
        stream
            .read_response(&self.params.continuation_marker, &self.params.ready_prompt)
            .await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.io.shutdown().await {
                tracing::debug!(host = %self.params.host, error = %err, "Telnet shutdown failed");
            }
        }
    }
}

fn not_connected() -> ApiError {
    ApiError::new(ErrorCode::SessionClosed, "Telnet session is not connected")
}

fn handshake_error(step: &str, err: GatewayError) -> GatewayError {
    if err.code() == ErrorCode::RemoteClosed {
        return err;
    }
    ApiError::new(
        ErrorCode::HandshakeFailed,
        format!("Telnet handshake failed waiting for {step}"),
    )
    .with_details(err.to_string())
    .into()
}

/// Telnet byte stream with option negotiation stripped out of the data.
struct TelnetStream<S> {
    io: S,
    parser: TelnetParser,
    negotiator: Negotiator,
    pending: BytesMut,
    io_timeout: Duration,
    line_ending: TelnetLineEnding,
}

impl<S> TelnetStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(io: S, io_timeout: Duration, line_ending: TelnetLineEnding) -> Self {
        Self {
            io,
            parser: TelnetParser::default(),
            negotiator: Negotiator::default(),
            pending: BytesMut::with_capacity(READ_CHUNK),
            io_timeout,
            line_ending,
        }
    }

    /// Reads until `marker`; the whole wait is bounded by one `io_timeout`.
    async fn read_until(&mut self, marker: &str) -> GatewayResult<Vec<u8>> {
        let deadline = Instant::now() + self.io_timeout;
        let (data, _) = self.read_until_any(&[marker.as_bytes()], deadline).await?;
        Ok(data)
    }

    /// Consumes data up to and including the earliest-ending delimiter, failing once
    /// `deadline` passes no matter how much unrelated data keeps arriving.
    ///
    /// Returns the consumed bytes and the index of the delimiter that matched.
    async fn read_until_any(
        &mut self,
        delimiters: &[&[u8]],
        deadline: Instant,
    ) -> GatewayResult<(Vec<u8>, usize)> {
        let scanned = timeout_at(deadline, self.scan_until(delimiters)).await;
        match scanned {
            Ok(result) => result,
            Err(_) => Err(ApiError::new(ErrorCode::IoError, "Telnet read timed out")
                .with_details(format!(
                    "no delimiter within {} ms, {} bytes buffered",
                    self.io_timeout.as_millis(),
                    self.pending.len()
                ))
                .into()),
        }
    }

    async fn scan_until(&mut self, delimiters: &[&[u8]]) -> GatewayResult<(Vec<u8>, usize)> {
        let overlap = delimiters
            .iter()
            .map(|delimiter| delimiter.len().saturating_sub(1))
            .max()
            .unwrap_or(0);
        let mut scanned: usize = 0;
        loop {
            let from = scanned.saturating_sub(overlap);
            if let Some((end, index)) = find_delimiter(&self.pending, delimiters, from) {
                let data = self.pending.split_to(end).to_vec();
                return Ok((data, index));
            }
            scanned = self.pending.len();
            self.fill().await?;
        }
    }

    /// Reads one command's output, paging through continuation prompts.
    ///
    /// One `io_timeout` deadline covers every page of the response.
    async fn read_response(&mut self, continuation: &str, ready_prompt: &str) -> GatewayResult<Vec<u8>> {
        let deadline = Instant::now() + self.io_timeout;
        let terminator = format!("\n{ready_prompt}");
        let mut delimiters: Vec<&[u8]> = Vec::with_capacity(2);
        if !continuation.is_empty() {
            delimiters.push(continuation.as_bytes());
        }
        delimiters.push(terminator.as_bytes());

        let mut output = Vec::new();
        loop {
            let (chunk, index) = self.read_until_any(&delimiters, deadline).await?;
            output.extend_from_slice(&chunk);
            if continuation.is_empty() || index != 0 {
                return Ok(output);
            }
            self.send_line(CONTINUE_COMMAND).await?;
        }
    }

    async fn send_line(&mut self, line: &str) -> GatewayResult<()> {
        let mut payload = escape_iac(line.as_bytes());
        payload.extend_from_slice(self.line_ending.as_bytes());
        self.write_raw(&payload).await
    }

    async fn write_raw(&mut self, payload: &[u8]) -> GatewayResult<()> {
        let io = &mut self.io;
        let write = async {
            io.write_all(payload).await?;
            io.flush().await
        };
        match timeout(self.io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ApiError::new(ErrorCode::IoError, "Telnet write failed")
                .with_details(err.to_string())
                .into()),
            Err(_) => Err(ApiError::new(ErrorCode::IoError, "Telnet write timed out").into()),
        }
    }

    async fn fill(&mut self) -> GatewayResult<()> {
        let mut buf = [0u8; READ_CHUNK];
        let n = match self.io.read(&mut buf).await {
            Ok(0) => {
                return Err(ApiError::new(ErrorCode::RemoteClosed, "Telnet peer closed the connection").into());
            }
            Ok(n) => n,
            Err(err) => {
                return Err(ApiError::new(ErrorCode::IoError, "Telnet read failed")
                    .with_details(err.to_string())
                    .into());
            }
        };

        let parsed = self.parser.process(&buf[..n]);
        self.pending.extend_from_slice(&parsed.data);
        for event in parsed.events {
            if let Some(reply) = self.negotiator.handle(event) {
                self.write_raw(&reply).await?;
            }
        }
        Ok(())
    }
}

/// End offset and index of the delimiter that completes earliest in `haystack`, looking
/// only at matches that start at or after `from`. Ties go to the lower index.
fn find_delimiter(haystack: &[u8], delimiters: &[&[u8]], from: usize) -> Option<(usize, usize)> {
    let window = haystack.get(from..)?;
    let mut best: Option<(usize, usize)> = None;
    for (index, delimiter) in delimiters.iter().enumerate() {
        if delimiter.is_empty() || delimiter.len() > window.len() {
            continue;
        }
        let found = window
            .windows(delimiter.len())
            .position(|candidate| candidate == *delimiter);
        if let Some(start) = found {
            let end = from + start + delimiter.len();
            if best.is_none_or(|(best_end, _)| end < best_end) {
                best = Some((end, index));
            }
        }
    }
    best
}

#[derive(Debug, PartialEq, Eq)]
enum TelnetEvent {
    Negotiation { command: u8, option: u8 },
    Subnegotiation { option: u8 },
}

#[derive(Default)]
struct Parsed {
    data: Vec<u8>,
    events: Vec<TelnetEvent>,
}

#[derive(Debug, Default, Clone, Copy)]
enum ParserState {
    #[default]
    Data,
    CarriageReturn,
    Iac,
    Command(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Incremental IAC parser; state survives across reads.
#[derive(Default)]
struct TelnetParser {
    state: ParserState,
    sb_option: Option<u8>,
}

impl TelnetParser {
    fn process(&mut self, input: &[u8]) -> Parsed {
        let mut parsed = Parsed::default();
        for &byte in input {
            let state = self.state;
            self.state = match state {
                ParserState::Data | ParserState::CarriageReturn => {
                    let after_cr = matches!(state, ParserState::CarriageReturn);
                    match byte {
                        IAC => ParserState::Iac,
                        // CR NUL is a bare carriage return on the wire.
                        0 if after_cr => ParserState::Data,
                        b'\r' => {
                            parsed.data.push(byte);
                            ParserState::CarriageReturn
                        }
                        _ => {
                            parsed.data.push(byte);
                            ParserState::Data
                        }
                    }
                }
                ParserState::Iac => match byte {
                    IAC => {
                        parsed.data.push(IAC);
                        ParserState::Data
                    }
                    DO | DONT | WILL | WONT => ParserState::Command(byte),
                    SB => {
                        self.sb_option = None;
                        ParserState::Subnegotiation
                    }
                    _ => ParserState::Data,
                },
                ParserState::Command(command) => {
                    parsed.events.push(TelnetEvent::Negotiation {
                        command,
                        option: byte,
                    });
                    ParserState::Data
                }
                ParserState::Subnegotiation => {
                    if byte == IAC {
                        ParserState::SubnegotiationIac
                    } else {
                        if self.sb_option.is_none() {
                            self.sb_option = Some(byte);
                        }
                        ParserState::Subnegotiation
                    }
                }
                ParserState::SubnegotiationIac => match byte {
                    SE => {
                        if let Some(option) = self.sb_option.take() {
                            parsed.events.push(TelnetEvent::Subnegotiation { option });
                        }
                        ParserState::Data
                    }
                    _ => ParserState::Subnegotiation,
                },
            };
        }
        parsed
    }
}

/// Client-side option policy: let the server echo and suppress go-ahead, refuse the rest.
#[derive(Default)]
struct Negotiator {
    local: HashMap<u8, bool>,
    remote: HashMap<u8, bool>,
}

impl Negotiator {
    fn handle(&mut self, event: TelnetEvent) -> Option<Vec<u8>> {
        let (command, option) = match event {
            TelnetEvent::Negotiation { command, option } => (command, option),
            TelnetEvent::Subnegotiation { option } => {
                tracing::debug!(option, "Ignoring telnet subnegotiation");
                return None;
            }
        };
        let (table, accept, yes, no) = match command {
            DO | DONT => (&mut self.local, option == OPT_SGA, WILL, WONT),
            WILL | WONT => (
                &mut self.remote,
                matches!(option, OPT_ECHO | OPT_SGA),
                DO,
                DONT,
            ),
            _ => return None,
        };
        let enabled = table.get(&option).copied();
        let wants_on = matches!(command, DO | WILL);

        if wants_on && accept {
            if enabled == Some(true) {
                return None;
            }
            table.insert(option, true);
            return Some(vec![IAC, yes, option]);
        }
        if enabled == Some(false) {
            return None;
        }
        table.insert(option, false);
        Some(vec![IAC, no, option])
    }
}

fn escape_iac(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, duplex};

    fn stream_pair() -> (TelnetStream<DuplexStream>, DuplexStream) {
        let (client, server) = duplex(8192);
        let stream = TelnetStream::new(client, Duration::from_secs(2), TelnetLineEnding::Lf);
        (stream, server)
    }

    fn params() -> TelnetParams {
        TelnetParams {
            host: "10.0.0.1".to_string(),
            port: 23,
            login: "admin".to_string(),
            password: "secret".to_string(),
            login_prompt: "login:".to_string(),
            password_prompt: "Password:".to_string(),
            ready_prompt: "router#".to_string(),
            continuation_marker: String::new(),
        }
    }

    #[test]
    fn params_require_markers_and_credentials() {
        assert!(params().validate().is_ok());

        let mut missing = params();
        missing.ready_prompt.clear();
        let err = missing.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let mut no_port = params();
        no_port.port = 0;
        assert!(no_port.validate().is_err());
    }

    #[test]
    fn parser_unescapes_iac_and_strips_negotiation() {
        let mut parser = TelnetParser::default();
        let parsed = parser.process(&[b'a', IAC, IAC, IAC, WILL, OPT_ECHO, b'b']);
        assert_eq!(parsed.data, vec![b'a', IAC, b'b']);
        assert_eq!(
            parsed.events,
            vec![TelnetEvent::Negotiation {
                command: WILL,
                option: OPT_ECHO
            }]
        );
    }

    #[test]
    fn parser_keeps_state_across_reads() {
        let mut parser = TelnetParser::default();
        let first = parser.process(&[b'x', IAC, SB, 24, 1]);
        assert_eq!(first.data, b"x");
        assert!(first.events.is_empty());
        let second = parser.process(&[IAC, SE, b'y']);
        assert_eq!(second.data, b"y");
        assert_eq!(second.events, vec![TelnetEvent::Subnegotiation { option: 24 }]);
    }

    #[test]
    fn parser_drops_nul_after_carriage_return() {
        let mut parser = TelnetParser::default();
        let parsed = parser.process(b"a\r\0b\r\nc");
        assert_eq!(parsed.data, b"a\rb\r\nc");
    }

    #[test]
    fn negotiator_accepts_echo_and_refuses_unknown_options() {
        let mut negotiator = Negotiator::default();
        let reply = negotiator.handle(TelnetEvent::Negotiation {
            command: WILL,
            option: OPT_ECHO,
        });
        assert_eq!(reply, Some(vec![IAC, DO, OPT_ECHO]));
        // Already enabled: no reply loop.
        let reply = negotiator.handle(TelnetEvent::Negotiation {
            command: WILL,
            option: OPT_ECHO,
        });
        assert_eq!(reply, None);

        let reply = negotiator.handle(TelnetEvent::Negotiation {
            command: DO,
            option: 31,
        });
        assert_eq!(reply, Some(vec![IAC, WONT, 31]));
        let reply = negotiator.handle(TelnetEvent::Negotiation {
            command: DO,
            option: OPT_SGA,
        });
        assert_eq!(reply, Some(vec![IAC, WILL, OPT_SGA]));
    }

    #[test]
    fn find_delimiter_prefers_earliest_end() {
        let delimiters: [&[u8]; 2] = [b"--More--", b"\nrouter#"];
        assert_eq!(find_delimiter(b"abc\nrouter# --More--", &delimiters, 0), Some((11, 1)));
        assert_eq!(find_delimiter(b"abc --More--\nrouter#", &delimiters, 0), Some((12, 0)));
        assert_eq!(find_delimiter(b"abc\nrouter", &delimiters, 0), None);
    }

    #[test]
    fn find_delimiter_skips_already_scanned_prefix() {
        let delimiters: [&[u8]; 1] = [b"--More--"];
        let haystack = b"--More-- page two --More--";
        assert_eq!(find_delimiter(haystack, &delimiters, 0), Some((8, 0)));
        assert_eq!(find_delimiter(haystack, &delimiters, 1), Some((26, 0)));
        assert_eq!(find_delimiter(haystack, &delimiters, 40), None);
    }

    #[test]
    fn escape_doubles_iac() {
        assert_eq!(escape_iac(&[b'a', IAC, b'b']), vec![b'a', IAC, IAC, b'b']);
    }

    #[tokio::test]
    async fn read_until_spans_multiple_reads_and_keeps_remainder() {
        let (mut stream, mut server) = stream_pair();
        server.write_all(b"Welcome\r\nlog").await.unwrap();
        let reader = tokio::spawn(async move {
            let first = stream.read_until("login:").await.unwrap();
            let second = stream.read_until("Password:").await.unwrap();
            (first, second)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"in: Password:").await.unwrap();

        let (first, second) = reader.await.unwrap();
        assert_eq!(first, b"Welcome\r\nlogin:");
        assert_eq!(second, b" Password:");
    }

    #[tokio::test]
    async fn read_response_pages_through_continuation_markers() {
        let (mut stream, server) = stream_pair();
        let (server_read, mut server_write) = tokio::io::split(server);

        let remote = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            server_write
                .write_all(b"show run\r\npage one\r\n--More--")
                .await
                .unwrap();
            let mut continuation_lines = Vec::new();
            continuation_lines.push(lines.next_line().await.unwrap().unwrap());
            server_write.write_all(b"page two\r\n--More--").await.unwrap();
            continuation_lines.push(lines.next_line().await.unwrap().unwrap());
            server_write.write_all(b"page three\r\nrouter#").await.unwrap();
            (command, continuation_lines)
        });

        stream.send_line("show run").await.unwrap();
        let output = stream.read_response("--More--", "router#").await.unwrap();
        let output = String::from_utf8(output).unwrap();

        assert_eq!(
            output,
            "show run\r\npage one\r\n--More--page two\r\n--More--page three\r\nrouter#"
        );
        let (command, continuation_lines) = remote.await.unwrap();
        assert_eq!(command, "show run");
        assert_eq!(continuation_lines, vec![" ".to_string(), " ".to_string()]);
    }

    #[tokio::test]
    async fn read_response_without_continuation_stops_at_prompt() {
        let (mut stream, mut server) = stream_pair();
        server
            .write_all(b"uptime\r\nup 3 days\r\nrouter#")
            .await
            .unwrap();
        let output = stream.read_response("", "router#").await.unwrap();
        assert_eq!(output, b"uptime\r\nup 3 days\r\nrouter#");
    }

    #[tokio::test]
    async fn prompt_must_start_a_line() {
        let (mut stream, mut server) = stream_pair();
        server
            .write_all(b"echo router#\r\nrouter#\r\nrouter#")
            .await
            .unwrap();
        let output = stream.read_response("", "router#").await.unwrap();
        assert_eq!(output, b"echo router#\r\nrouter#");
    }

    #[tokio::test]
    async fn negotiation_is_answered_while_reading() {
        let (mut stream, mut server) = stream_pair();
        server
            .write_all(&[IAC, DO, 24, b'l', b'o', b'g', b'i', b'n', b':'])
            .await
            .unwrap();
        let data = stream.read_until("login:").await.unwrap();
        assert_eq!(data, b"login:");

        let mut reply = [0u8; 3];
        server.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [IAC, WONT, 24]);
    }

    #[tokio::test]
    async fn peer_close_is_remote_closed() {
        let (mut stream, server) = stream_pair();
        drop(server);
        let err = stream.read_until("login:").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RemoteClosed);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (client, _server) = duplex(64);
        let mut stream = TelnetStream::new(client, Duration::from_millis(30), TelnetLineEnding::Lf);
        let err = stream.read_until("login:").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::IoError);
        let err = handshake_error("login prompt", err);
        assert_eq!(err.code(), ErrorCode::HandshakeFailed);
    }

    #[tokio::test]
    async fn trickling_peer_cannot_stretch_the_marker_wait() {
        let (client, mut server) = duplex(64);
        let mut stream = TelnetStream::new(client, Duration::from_millis(100), TelnetLineEnding::Lf);
        let trickle = tokio::spawn(async move {
            while server.write_all(b".").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let started = Instant::now();
        let result = timeout(Duration::from_secs(2), stream.read_until("login:"))
            .await
            .expect("marker wait must end on its own deadline");
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::IoError);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handshake_error("login prompt", err).code(), ErrorCode::HandshakeFailed);

        drop(stream);
        trickle.await.unwrap();
    }

    #[tokio::test]
    async fn send_line_uses_configured_line_ending() {
        let (client, mut server) = duplex(64);
        let mut stream = TelnetStream::new(client, Duration::from_secs(1), TelnetLineEnding::Crlf);
        stream.send_line("admin").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"admin\r\n");
    }
}
