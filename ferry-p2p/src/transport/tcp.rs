//! Minimal TCP transport.
//!
//! The handshake is a single exchange: each side writes one
//! newline-terminated JSON [`Hello`] and reads the other's. After that the
//! connection is only read from, counting bytes, until either side closes it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::ConnmanConfig;
use crate::error::{P2pError, P2pResult};
use crate::peer::{
    ConnectionDirection, DisconnectReason, PeerCommand, PeerHandle, PeerState, PeerVersion,
};
use crate::transport::{
    complete_handshake, fail_handshake, Connection, Handshake, Listener, Transport,
};

/// Longest hello line accepted, newline included.
pub const MAX_HELLO_SIZE: usize = 1024;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// First line sent by both sides of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub user_agent: String,
    pub start_height: u64,
}

/// Codec for newline-delimited JSON hello lines.
#[derive(Debug, Default)]
pub struct HelloCodec;

impl Decoder for HelloCodec {
    type Item = Hello;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Hello>> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            if src.len() >= MAX_HELLO_SIZE {
                return Err(P2pError::HandshakeFailed(format!(
                    "hello exceeds {MAX_HELLO_SIZE} bytes"
                )));
            }
            return Ok(None);
        };

        if newline + 1 > MAX_HELLO_SIZE {
            return Err(P2pError::HandshakeFailed(format!(
                "hello exceeds {MAX_HELLO_SIZE} bytes"
            )));
        }

        let line = src.split_to(newline + 1);
        let hello = serde_json::from_slice(&line[..newline])?;
        Ok(Some(hello))
    }
}

impl Encoder<&Hello> for HelloCodec {
    type Error = P2pError;

    fn encode(&mut self, item: &Hello, dst: &mut BytesMut) -> P2pResult<()> {
        let json = serde_json::to_vec(item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TcpSettings {
    hello: Hello,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TcpSettings {
    fn connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        direction: ConnectionDirection,
    ) -> Connection {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(addr, direction, command_tx);
        let handshake = TcpHandshake {
            handle: handle.clone(),
            stream,
            commands: command_rx,
            hello: self.hello.clone(),
            timeout: self.handshake_timeout,
        };
        Connection::new(handle, Box::new(handshake))
    }
}

/// [`Transport`] over tokio TCP sockets.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    settings: TcpSettings,
}

impl TcpTransport {
    /// Announce the configured user agent and `start_height` to every peer.
    pub fn new(config: &ConnmanConfig, start_height: u64) -> Self {
        Self {
            settings: TcpSettings {
                hello: Hello {
                    user_agent: config.user_agent.clone(),
                    start_height,
                },
                connect_timeout: config.connect_timeout,
                handshake_timeout: config.handshake_timeout,
            },
        }
    }

    pub fn hello(&self) -> &Hello {
        &self.settings.hello
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: SocketAddr) -> P2pResult<Connection> {
        tracing::debug!(addr = %addr, "Connecting to peer");

        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(P2pError::Dial {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(P2pError::ConnectionTimeout { addr }),
        };

        Ok(self.settings.connection(stream, addr, ConnectionDirection::Outbound))
    }

    async fn listen(&self, addr: SocketAddr) -> P2pResult<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| P2pError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        Ok(Box::new(TcpAcceptor {
            listener,
            local_addr,
            settings: self.settings.clone(),
        }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: TcpSettings,
}

#[async_trait]
impl Listener for TcpAcceptor {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self) -> P2pResult<Connection> {
        let (stream, addr) = self.listener.accept().await?;
        tracing::debug!(addr = %addr, "Accepted inbound connection");
        Ok(self.settings.connection(stream, addr, ConnectionDirection::Inbound))
    }
}

struct TcpHandshake {
    handle: Arc<PeerHandle>,
    stream: TcpStream,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    hello: Hello,
    timeout: Duration,
}

#[async_trait]
impl Handshake for TcpHandshake {
    async fn perform(self: Box<Self>) -> P2pResult<()> {
        let TcpHandshake {
            handle,
            mut stream,
            mut commands,
            hello,
            timeout: limit,
        } = *self;

        handle.set_state(PeerState::HandshakeInProgress);
        let mut buf = BytesMut::with_capacity(MAX_HELLO_SIZE);

        let remote = tokio::select! {
            result = timeout(limit, exchange_hello(&handle, &mut stream, &mut buf, &hello)) => {
                match result {
                    Ok(Ok(remote)) => remote,
                    Ok(Err(e)) => return Err(fail_handshake(&handle, e)),
                    Err(_) => return Err(fail_handshake(&handle, P2pError::HandshakeTimeout)),
                }
            }
            _ = commands.recv() => {
                return Err(P2pError::HandshakeFailed(format!(
                    "{} disconnected during handshake",
                    handle.addr()
                )));
            }
        };

        handle.set_version(PeerVersion::new(remote.user_agent, remote.start_height));
        complete_handshake(&handle)?;

        // Bytes that arrived right behind the hello are already counted.
        buf.clear();
        tokio::spawn(run_connection(handle, stream, commands));
        Ok(())
    }
}

async fn exchange_hello(
    handle: &Arc<PeerHandle>,
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    hello: &Hello,
) -> P2pResult<Hello> {
    let mut out = BytesMut::new();
    HelloCodec.encode(hello, &mut out)?;
    stream.write_all(&out).await?;
    handle.record_written(out.len() as u64);

    loop {
        if let Some(remote) = HelloCodec.decode(buf)? {
            return Ok(remote);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(P2pError::HandshakeFailed(
                "connection closed during handshake".to_string(),
            ));
        }
        handle.record_read(n as u64);
    }
}

/// Count inbound bytes until EOF, an I/O error, or a disconnect command.
async fn run_connection(
    handle: Arc<PeerHandle>,
    mut stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Disconnect) | None => break None,
            },
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => break Some("connection closed by peer".to_string()),
                Ok(n) => {
                    handle.record_read(n as u64);
                    buf.advance(n);
                    buf.reserve(READ_BUFFER_SIZE);
                }
                Err(e) => break Some(e.to_string()),
            },
        }
    };

    if let Err(e) = stream.shutdown().await {
        tracing::trace!(addr = %handle.addr(), error = %e, "Socket shutdown failed");
    }

    if let Some(reason) = reason {
        tracing::debug!(addr = %handle.addr(), reason = %reason, "Connection closed");
        handle.set_disconnect_reason(DisconnectReason::new(reason));
        handle.set_state(PeerState::Offline);
    }
}
