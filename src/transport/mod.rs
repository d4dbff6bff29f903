// SPDX-License-Identifier: Apache-2.0

//! Byte-stream adapters: every client transport (TCP, TCP-TLS, WS, WSS)
//! is reduced to a pair of frame source/sink halves carrying whole frames.
//!
//! Raw streams use the accumulating decoder to cut frames out of the byte
//! stream; a WebSocket binary message wraps exactly one frame (length
//! prefix included), so a single codec path serves both.

use crate::{
    config::ConnectorConfig,
    packet::frame::FrameAccumulator,
};
use anyhow::{
    anyhow,
    bail,
};
use futures_util::{
    stream::{
        SplitSink,
        SplitStream,
    },
    SinkExt,
    StreamExt,
};
use log::debug;
use std::convert::TryInto;
use tokio::{
    io::{
        AsyncRead,
        AsyncReadExt,
        AsyncWrite,
        AsyncWriteExt,
        ReadHalf,
        WriteHalf,
    },
    net::{
        TcpSocket,
        TcpStream,
    },
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    tungstenite::{
        handshake::server::{
            ErrorResponse,
            Request,
            Response,
        },
        Message,
    },
    WebSocketStream,
};

pub mod tls;

/// Any duplex byte stream usable under the framing codec.
pub(crate) trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A transport-erased stream.
pub(crate) type BoxedStream = Box<dyn RawStream>;

const READ_CHUNK: usize = 64 * 1024;

/// Reading half: yields one frame body (the bytes after the length
/// prefix) at a time.
pub(crate) enum FrameSource {
    Raw {
        io: ReadHalf<BoxedStream>,
        acc: FrameAccumulator,
        buf: Vec<u8>,
    },
    Ws {
        stream: SplitStream<WebSocketStream<BoxedStream>>,
        max_frame: usize,
    },
}

impl FrameSource {
    /// The next frame body, or `None` once the peer closed cleanly.
    pub async fn next(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        match self {
            FrameSource::Raw { io, acc, buf } => loop {
                if let Some(body) = acc.next()? {
                    return Ok(Some(body));
                }
                let n = io.read(buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                acc.extend(&buf[..n]);
            },
            FrameSource::Ws { stream, max_frame } => loop {
                let message = match stream.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(message)) => message,
                };
                match message {
                    Message::Binary(data) => {
                        if data.len() < 4 {
                            bail!("ws message of {} bytes cannot hold a frame", data.len());
                        }
                        let length = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
                        if length > *max_frame {
                            bail!("ws frame of {} bytes exceeds the {} byte limit", length, max_frame);
                        }
                        if length != data.len() - 4 {
                            bail!(
                                "ws message must wrap exactly one frame ({} declared, {} present)",
                                length,
                                data.len() - 4
                            );
                        }
                        return Ok(Some(data[4..].to_vec()));
                    }
                    Message::Close(_) => return Ok(None),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => {
                        debug!("ignoring non-binary ws message: {:?}", other);
                        continue;
                    }
                }
            },
        }
    }
}

/// Writing half: accepts complete frames, length prefix included.
pub(crate) enum FrameSink {
    Raw { io: WriteHalf<BoxedStream> },
    Ws {
        sink: SplitSink<WebSocketStream<BoxedStream>, Message>,
    },
}

impl FrameSink {
    pub async fn send(&mut self, frame: Vec<u8>) -> anyhow::Result<()> {
        match self {
            FrameSink::Raw { io } => {
                io.write_all(&frame).await?;
                Ok(())
            }
            FrameSink::Ws { sink } => {
                sink.send(Message::Binary(frame)).await?;
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) {
        match self {
            FrameSink::Raw { io } => {
                io.shutdown().await.ok();
            }
            FrameSink::Ws { sink } => {
                sink.send(Message::Close(None)).await.ok();
            }
        }
    }
}

pub(crate) fn split_raw(io: BoxedStream, max_frame: usize) -> (FrameSource, FrameSink) {
    let (read, write) = tokio::io::split(io);
    (
        FrameSource::Raw {
            io: read,
            acc: FrameAccumulator::new(max_frame),
            buf: vec![0u8; READ_CHUNK],
        },
        FrameSink::Raw { io: write },
    )
}

pub(crate) fn split_ws(ws: WebSocketStream<BoxedStream>, max_frame: usize) -> (FrameSource, FrameSink) {
    let (sink, stream) = ws.split();
    (FrameSource::Ws { stream, max_frame }, FrameSink::Ws { sink })
}

/// Finish an accepted client connection: optional TLS, optional WS
/// upgrade on the configured path, then split into frame halves.
pub(crate) async fn accept_client(
    stream: TcpStream,
    use_websocket: bool,
    ws_path: &str,
    tls: Option<&TlsAcceptor>,
    max_frame: usize,
) -> anyhow::Result<(FrameSource, FrameSink)> {
    stream.set_nodelay(true).ok();
    let boxed: BoxedStream = match tls {
        Some(acceptor) => Box::new(acceptor.accept(stream).await?),
        None => Box::new(stream),
    };
    if use_websocket {
        let expected = ws_path.to_string();
        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() == expected {
                Ok(response)
            } else {
                let mut refusal = ErrorResponse::new(Some("not found".to_string()));
                *refusal.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
                Err(refusal)
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(boxed, callback).await?;
        Ok(split_ws(ws, max_frame))
    } else {
        Ok(split_raw(boxed, max_frame))
    }
}

/// Open a client connection per the connector configuration.
pub(crate) async fn connect_client(addr: &str, cfg: &ConnectorConfig) -> anyhow::Result<(FrameSource, FrameSink)> {
    let socket_addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| anyhow!("cannot resolve {}", addr))?;
    let socket = if socket_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(size) = cfg.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = cfg.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    let stream = socket.connect(socket_addr).await?;
    stream.set_nodelay(true).ok();

    let (host, _) = addr.rsplit_once(':').ok_or_else(|| anyhow!("address {} lacks a port", addr))?;
    let boxed: BoxedStream = if cfg.use_ssl {
        let connector = tls::client_connector(cfg.skip_server_certificate_validation)?;
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(host.to_string())?;
        Box::new(connector.connect(server_name, stream).await?)
    } else {
        Box::new(stream)
    };

    let max_frame = cfg.max_packet_size as usize;
    if cfg.use_websocket {
        let scheme = if cfg.use_ssl { "wss" } else { "ws" };
        let mut endpoint = url::Url::parse(&format!("{}://{}", scheme, addr))?;
        endpoint.set_path(&cfg.web_socket_path);
        let (ws, _) = tokio_tungstenite::client_async(endpoint.as_str(), boxed).await?;
        Ok(split_ws(ws, max_frame))
    } else {
        Ok(split_raw(boxed, max_frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        frame,
        Packet,
    };

    #[tokio::test]
    async fn raw_round_trip_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (mut source, mut sink) = split_raw(Box::new(stream), 1024 * 1024);
            let packet = Packet::new("Echo", b"over the wire".to_vec()).with_seq(3);
            sink.send(frame::encode_request(&packet).unwrap()).await.unwrap();
            let body = source.next().await.unwrap().unwrap();
            frame::decode_response(&body).unwrap()
        });
        let (stream, _) = listener.accept().await.unwrap();
        let (mut source, mut sink) = split_raw(Box::new(stream), 1024 * 1024);
        let body = source.next().await.unwrap().unwrap();
        let request = frame::decode_request(&body).unwrap();
        assert_eq!(request.payload, b"over the wire");
        let reply = Packet::reply_to(&request, request.payload.clone());
        sink.send(frame::encode_response(&reply, usize::MAX).unwrap()).await.unwrap();
        let received = client.await.unwrap();
        assert_eq!(received.msg_seq, 3);
        assert_eq!(received.payload, b"over the wire");
    }

    #[tokio::test]
    async fn ws_round_trip_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let boxed: BoxedStream = Box::new(stream);
            let (ws, _) = tokio_tungstenite::client_async(format!("ws://{}/ws", addr).as_str(), boxed)
                .await
                .unwrap();
            let (mut source, mut sink) = split_ws(ws, 1024 * 1024);
            let packet = Packet::new("Echo", b"ws".to_vec()).with_seq(9);
            sink.send(frame::encode_request(&packet).unwrap()).await.unwrap();
            let body = source.next().await.unwrap().unwrap();
            frame::decode_response(&body).unwrap()
        });
        let (stream, _) = listener.accept().await.unwrap();
        let (mut source, mut sink) = accept_client(stream, true, "/ws", None, 1024 * 1024).await.unwrap();
        let body = source.next().await.unwrap().unwrap();
        let request = frame::decode_request(&body).unwrap();
        assert_eq!(request.msg_seq, 9);
        let reply = Packet::reply_to(&request, b"pong".to_vec());
        sink.send(frame::encode_response(&reply, usize::MAX).unwrap()).await.unwrap();
        let received = client.await.unwrap();
        assert_eq!(received.payload, b"pong");
    }
}
