use futures_util::future::{self, Ready};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use warp::ws::{Message as WsMessage, WebSocket};

use crate::error::{RelayError, Result};

/// A single websocket frame as seen by a user actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl From<WsMessage> for Frame {
    fn from(msg: WsMessage) -> Self {
        if msg.is_close() {
            Frame::Close
        } else if msg.is_ping() {
            Frame::Ping(msg.into_bytes())
        } else if msg.is_pong() {
            Frame::Pong(msg.into_bytes())
        } else if let Ok(text) = msg.to_str() {
            Frame::Text(text.to_owned())
        } else {
            Frame::Binary(msg.into_bytes())
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::text(text),
            Frame::Binary(bytes) => WsMessage::binary(bytes),
            Frame::Ping(bytes) => WsMessage::ping(bytes),
            Frame::Pong(bytes) => WsMessage::pong(bytes),
            Frame::Close => WsMessage::close(),
        }
    }
}

fn to_ws(frame: Frame) -> Ready<Result<WsMessage>> {
    future::ready(Ok(frame.into()))
}

/// Splits an upgraded websocket into the frame sink and stream a user actor drives.
pub fn split(
    ws: WebSocket,
) -> (
    impl Sink<Frame, Error = RelayError> + Unpin + Send + 'static,
    impl Stream<Item = Result<Frame>> + Unpin + Send + 'static,
) {
    let (tx, rx) = ws.split();
    let tx = tx.sink_map_err(RelayError::from).with(to_ws);
    let rx = rx.map(|msg| msg.map(Frame::from).map_err(RelayError::from));
    (tx, rx)
}
