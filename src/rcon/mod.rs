use crate::registry::ServerEndpoint;
use rand::Rng;
use std::{fmt, io, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;
// EXECCOMMAND and AUTH_RESPONSE share a value on the wire; responses are
// told apart by the request id they echo.
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_AUTH: i32 = 3;

pub const PACKET_ID_INVALID: i32 = -1;

/// Bytes counted by the length prefix besides the body: id, type, two nulls.
const PACKET_OVERHEAD: usize = 10;
const MAX_PACKET_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum RconError {
    Connection(io::Error),
    Timeout(&'static str),
    Auth(String),
    Protocol(String),
}

impl fmt::Display for RconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => write!(f, "connection error: {err}"),
            Self::Timeout(step) => write!(f, "timed out during {step}"),
            Self::Auth(msg) => write!(f, "auth error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for RconError {}

impl From<io::Error> for RconError {
    fn from(err: io::Error) -> Self {
        Self::Connection(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    /// Full frame including the little-endian length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = (body.len() + PACKET_OVERHEAD) as i32;
        let mut out = Vec::with_capacity(4 + body.len() + PACKET_OVERHEAD);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(&[0, 0]);
        out
    }

    /// Decodes the bytes that followed a length prefix of `length`.
    pub fn decode(length: i32, data: &[u8]) -> Result<Self, RconError> {
        if data.len() < PACKET_OVERHEAD {
            return Err(RconError::Protocol(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }
        if length < 0 || length as usize != data.len() {
            return Err(RconError::Protocol(format!(
                "announced length {length} but {} bytes available",
                data.len()
            )));
        }

        let id = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let kind = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let body = std::str::from_utf8(&data[8..data.len() - 2])
            .map_err(|err| RconError::Protocol(format!("body is not utf-8: {err}")))?;

        Ok(Self::new(id, kind, body))
    }
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    writer.flush().await
}

pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, RconError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_i32_le().await?;
    if length < PACKET_OVERHEAD as i32 || length as usize > MAX_PACKET_SIZE {
        return Err(RconError::Protocol(format!("invalid packet length: {length}")));
    }
    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf).await?;
    Packet::decode(length, &buf)
}

/// One authenticated connection to a game server.
///
/// Any failed step drops the stream, after which the session reports
/// not ready and `exec_command` returns an empty result.
pub struct RconSession<S = TcpStream> {
    stream: Option<S>,
    io_timeout: Duration,
    authorized: bool,
    next_id: i32,
}

impl RconSession<TcpStream> {
    pub async fn connect(endpoint: &ServerEndpoint, io_timeout: Duration) -> Result<Self, RconError> {
        let addr = (endpoint.address.as_str(), endpoint.port);
        let stream = match timeout(io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(RconError::Connection(err)),
            Err(_) => return Err(RconError::Timeout("connect")),
        };
        let mut session = Self::from_stream(stream, io_timeout);
        session.authenticate(&endpoint.password).await?;
        Ok(session)
    }
}

impl<S> RconSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S, io_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            io_timeout,
            authorized: false,
            next_id: rand::thread_rng().gen_range(1..i32::MAX - 1),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.stream.is_some() && self.authorized
    }

    pub async fn authenticate(&mut self, password: &str) -> Result<(), RconError> {
        let auth_id = self.take_id();
        self.send(&Packet::new(auth_id, SERVERDATA_AUTH, password)).await?;

        let mut response = self.recv().await?;
        if response.id == PACKET_ID_INVALID {
            self.close();
            return Err(RconError::Auth("server rejected credentials".to_string()));
        }
        // Some servers send an empty RESPONSE_VALUE before the real answer.
        if response.kind == SERVERDATA_RESPONSE_VALUE {
            response = self.recv().await?;
        }
        if response.id != auth_id || response.kind != SERVERDATA_AUTH_RESPONSE {
            self.close();
            return Err(RconError::Auth(format!(
                "unexpected auth response id={} type={}",
                response.id, response.kind
            )));
        }

        self.authorized = true;
        Ok(())
    }

    pub async fn exec_command(&mut self, command: &str) -> Result<String, RconError> {
        if !self.is_ready() {
            return Ok(String::new());
        }
        let command_id = self.take_id();
        self.send(&Packet::new(command_id, SERVERDATA_EXECCOMMAND, command))
            .await?;

        let response = self.recv().await?;
        if response.id != command_id || response.kind != SERVERDATA_RESPONSE_VALUE {
            return Err(RconError::Protocol(format!(
                "unexpected command response id={} type={}",
                response.id, response.kind
            )));
        }
        Ok(response.body)
    }

    fn take_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if id >= i32::MAX - 1 { 1 } else { id + 1 };
        id
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), RconError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RconError::Protocol("session closed".to_string()))?;
        let result = match timeout(self.io_timeout, write_packet(stream, packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RconError::Connection(err)),
            Err(_) => Err(RconError::Timeout("send")),
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn recv(&mut self) -> Result<Packet, RconError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RconError::Protocol("session closed".to_string()))?;
        let result = match timeout(self.io_timeout, read_packet(stream)).await {
            Ok(result) => result,
            Err(_) => Err(RconError::Timeout("receive")),
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    fn close(&mut self) {
        self.stream = None;
        self.authorized = false;
    }
}

/// Connects, authenticates and runs one command. Every failure degrades to
/// an empty response so one bad server never affects the others.
pub async fn query(endpoint: &ServerEndpoint, command: &str, io_timeout: Duration) -> String {
    match try_query(endpoint, command, io_timeout).await {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(endpoint = %endpoint.key(), error = %err, "rcon query failed");
            String::new()
        }
    }
}

pub async fn try_query(
    endpoint: &ServerEndpoint,
    command: &str,
    io_timeout: Duration,
) -> Result<String, RconError> {
    let mut session = RconSession::connect(endpoint, io_timeout).await?;
    session.exec_command(command).await
}
