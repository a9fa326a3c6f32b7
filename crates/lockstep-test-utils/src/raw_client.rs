use futures_util::{SinkExt, StreamExt};
use lockstep_protocol::{ClientRequest, RequestEnvelope, ServerFrame};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A protocol-level WebSocket client without any session machinery, for
/// driving servers directly in tests.
pub struct RawRoomClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    next_request_id: u64,
}

impl RawRoomClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            next_request_id: 0,
        })
    }

    /// Send `request` with the next correlation id; returns the id used.
    pub async fn send_request(
        &mut self,
        request: ClientRequest,
    ) -> Result<u64, Box<dyn std::error::Error>> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let json = serde_json::to_string(&RequestEnvelope {
            request_id,
            request,
        })?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(request_id)
    }

    pub async fn recv_frame(&mut self) -> Result<ServerFrame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: ServerFrame = serde_json::from_str(&text)?;
                    return Ok(frame);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
