use std::{io, time::Duration};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};

use super::delivery::ClientConnection;
use crate::error::SendError;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// One accepted WebSocket client.
pub struct WsConnection {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    stream: SplitStream<WebSocketStream<TcpStream>>,
    peer_closed: bool,
}

impl WsConnection {
    pub fn new(socket: WebSocketStream<TcpStream>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink,
            stream,
            peer_closed: false,
        }
    }
}

fn classify(err: WsError) -> SendError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SendError::Disconnected,
        WsError::Protocol(
            ProtocolError::SendAfterClosing | ProtocolError::ResetWithoutClosingHandshake,
        ) => SendError::Disconnected,
        WsError::Io(ref io_err)
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ) =>
        {
            SendError::Disconnected
        }
        other => SendError::Transient(other.to_string()),
    }
}

impl ClientConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SendError> {
        if self.peer_closed {
            return Err(SendError::Disconnected);
        }
        self.sink.send(Message::Text(text)).await.map_err(classify)
    }

    async fn closed(&mut self) {
        if self.peer_closed {
            return;
        }
        // Client messages carry no meaning here; only the end of the stream does.
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    log::debug!("client read failed: {err}");
                    break;
                }
            }
        }
        self.peer_closed = true;
    }

    async fn close(&mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!("close handshake failed: {err}"),
            Err(_) => log::debug!("close handshake timed out"),
        }
    }
}
