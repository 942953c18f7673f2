//! Frame-level seam over the tunnel's websocket.
//!
//! The socket and exchange state machines never touch a websocket type
//! directly; they drive a [`FrameTransport`], a boxed sink/stream pair over
//! the tunnel's frame alphabet. Production wires an upgraded axum websocket
//! into it; tests wire in-memory channel pairs and drive the peer by hand.

use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use culvert_common::TunnelError;
use futures::channel::mpsc;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};

/// One frame on the tunnel transport.
///
/// Text frames carry JSON metadata, binary frames carry bodies. Control
/// frames are surfaced so the reader can skip them (the websocket layer
/// already answers pings).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    /// Rough payload size, for log lines.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TunnelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TunnelError>> + Send>>;

/// A full-duplex frame channel, already split into its two directions.
pub struct FrameTransport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl FrameTransport {
    /// Wrap an upgraded axum websocket.
    pub fn from_websocket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|err| TunnelError::Transport(err.to_string()))
            .with(|frame: Frame| future::ready(Ok::<Message, TunnelError>(frame_to_message(frame))));

        let stream = stream.map(|message| match message {
            Ok(message) => Ok(message_to_frame(message)),
            Err(err) => Err(TunnelError::Transport(err.to_string())),
        });

        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// In-memory loopback used to exercise the state machines without a
    /// network socket. Returns the transport plus the peer's two ends.
    pub fn loopback(buffer: usize) -> (Self, LoopbackPeer) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Frame>(buffer);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Result<Frame, TunnelError>>(buffer);

        let transport = Self {
            sink: Box::pin(outgoing_tx.sink_map_err(|err| TunnelError::Transport(err.to_string()))),
            stream: Box::pin(incoming_rx),
        };

        let peer = LoopbackPeer {
            incoming: outgoing_rx,
            outgoing: incoming_tx,
        };

        (transport, peer)
    }
}

/// The far end of a [`FrameTransport::loopback`].
pub struct LoopbackPeer {
    /// Frames the server side wrote.
    pub incoming: mpsc::Receiver<Frame>,
    /// Frames (or injected transport errors) for the server side to read.
    pub outgoing: mpsc::Sender<Result<Frame, TunnelError>>,
}

fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

fn message_to_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.to_string()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_carries_frames_both_ways() {
        let (mut transport, mut peer) = FrameTransport::loopback(8);

        transport.sink.send(Frame::Text("hello".into())).await.unwrap();
        assert_eq!(peer.incoming.next().await, Some(Frame::Text("hello".into())));

        peer.outgoing
            .send(Ok(Frame::Binary(Bytes::from_static(b"body"))))
            .await
            .unwrap();
        let frame = transport.stream.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Binary(Bytes::from_static(b"body")));
    }

    #[tokio::test]
    async fn loopback_surfaces_injected_errors() {
        let (mut transport, mut peer) = FrameTransport::loopback(1);

        peer.outgoing
            .send(Err(TunnelError::Transport("boom".into())))
            .await
            .unwrap();
        assert!(transport.stream.next().await.unwrap().is_err());
    }

    #[test]
    fn frame_len_reports_payload_size() {
        assert_eq!(Frame::Text("abc".into()).len(), 3);
        assert_eq!(Frame::Close.len(), 0);
        assert!(Frame::Close.is_empty());
    }
}
