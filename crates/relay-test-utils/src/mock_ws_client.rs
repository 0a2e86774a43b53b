use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_protocol::WsMessage;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What the relay sent: a protocol message, or the close frame ending the
/// session (code + application-level reason).
#[derive(Debug)]
pub enum ServerEvent {
    Message(WsMessage),
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// A test double for producer and viewer clients.  Connects to a relay
/// endpoint with the `client_type`/`client_id` query parameters and exchanges
/// typed protocol messages.
pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connects as a producer (`client_type=desktop`) with a chosen id.
    pub async fn connect_producer(
        base_url: &str,
        producer_id: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let url = format!("{base_url}/ws?client_type=desktop&client_id={producer_id}");
        Self::connect(&url).await
    }

    /// Connects as a viewer (`client_type=web`); the relay assigns the id.
    pub async fn connect_viewer(base_url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let url = format!("{base_url}/ws?client_type=web");
        Self::connect(&url).await
    }

    pub async fn send_message(
        &mut self,
        msg: &WsMessage,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(msg)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Sends a raw text frame as-is; for protocol-error tests.
    pub async fn send_raw_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Text(text.to_owned().into()))
            .await?;
        Ok(())
    }

    /// Like [`recv_message`](Self::recv_message) but surfaces close frames
    /// instead of treating them as errors, so tests can assert close codes.
    pub async fn recv_event(&mut self) -> Result<ServerEvent, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg: WsMessage = serde_json::from_str(&text)?;
                    return Ok(ServerEvent::Message(msg));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return Ok(ServerEvent::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.as_str().to_owned()),
                    });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Ok(ServerEvent::Closed {
                        code: None,
                        reason: None,
                    })
                }
            }
        }
    }

    pub async fn recv_message(&mut self) -> Result<WsMessage, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg: WsMessage = serde_json::from_str(&text)?;
                    return Ok(msg);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receives with a deadline; errors if no message arrives in time.
    pub async fn recv_message_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<WsMessage, Box<dyn std::error::Error>> {
        match tokio::time::timeout(timeout, self.recv_message()).await {
            Ok(result) => result,
            Err(_) => Err(format!("no message within {timeout:?}").into()),
        }
    }

    /// Receives until `pred` matches, discarding everything else.  Frames and
    /// catalog notifications interleave freely, so most assertions want this.
    pub async fn recv_until<F>(
        &mut self,
        timeout: Duration,
        mut pred: F,
    ) -> Result<WsMessage, Box<dyn std::error::Error>>
    where
        F: FnMut(&WsMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or("deadline elapsed before a matching message arrived")?;
            let msg = self.recv_message_timeout(remaining).await?;
            if pred(&msg) {
                return Ok(msg);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
