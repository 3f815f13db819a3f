//! WebSocket transport
//!
//! This file implements the network side of the broker. Each accepted socket
//! becomes a session that:
//! - completes the WebSocket handshake
//! - requires a `connect` frame within the connect timeout and hands the
//!   credentials to the broker
//! - translates client frames into broker operations
//! - forwards the connection's queued deliveries from a separate send task
//!
//! A socket that closes or fails is reported to the broker as
//! `TransportFailure`; a client `disconnect` or close frame as `ClientClosed`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::broker::message::{Message, QoS};
use crate::client::ConnectionHandle;
use crate::transport::codec::{FrameCodec, JsonCodec};
use crate::transport::message::{CONNACK_SUCCESS, ClientMessage, ServerMessage};
use crate::utils::error::{DisconnectReason, PublishError, SubscribeError, TransportError};

type WsSender = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Clone)]
pub struct TransportOptions {
    /// How long a new socket may take to send its `connect` frame.
    pub connect_timeout: Duration,
    pub codec: Arc<dyn FrameCodec>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            codec: Arc::new(JsonCodec),
        }
    }
}

/// Bind a listening socket on `host:port` with the given accept backlog.
pub async fn bind(host: &str, port: u16, backlog: u32) -> io::Result<TcpListener> {
    let addr = lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address found for {host}"),
        )
    })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Accept connections from `listener` forever, one task per session.
pub async fn start_websocket_server(
    listener: TcpListener,
    broker: Arc<Broker>,
    options: TransportOptions,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on ws://{addr}");
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                continue;
            }
        };

        let broker = broker.clone();
        let options = options.clone();
        spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("{}", TransportError::Handshake(e));
                    return;
                }
            };
            run_session(ws_stream, peer, broker, options).await;
        });
    }
}

enum Inbound {
    Request(ClientMessage),
    Malformed(TransportError),
    Skip,
    /// The client sent a close frame.
    Closed,
    /// The stream ended without a close frame.
    Ended,
    Failed(TransportError),
}

fn classify(
    frame: Option<Result<WsMessage, tungstenite::Error>>,
    codec: &dyn FrameCodec,
) -> Inbound {
    let decoded = match frame {
        None => return Inbound::Ended,
        Some(Err(e)) => return Inbound::Failed(e.into()),
        Some(Ok(WsMessage::Close(_))) => return Inbound::Closed,
        Some(Ok(WsMessage::Text(text))) => codec.decode(text.as_bytes()),
        Some(Ok(WsMessage::Binary(data))) => codec.decode(&data),
        Some(Ok(_)) => return Inbound::Skip,
    };
    match decoded {
        Ok(request) => Inbound::Request(request),
        Err(e) => Inbound::Malformed(e),
    }
}

async fn next_inbound(receiver: &mut WsReceiver, codec: &dyn FrameCodec) -> Inbound {
    loop {
        match classify(receiver.next().await, codec) {
            Inbound::Skip => continue,
            other => return other,
        }
    }
}

async fn send_frame(
    sender: &mut WsSender,
    codec: &dyn FrameCodec,
    message: &ServerMessage,
) -> Result<(), TransportError> {
    let frame = codec.encode(message)?;
    sender.send(frame).await?;
    Ok(())
}

async fn refuse(sender: &mut WsSender, codec: &dyn FrameCodec, message: ServerMessage) {
    let _ = send_frame(sender, codec, &message).await;
    let _ = sender.close().await;
}

async fn run_session(
    ws_stream: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    broker: Arc<Broker>,
    options: TransportOptions,
) {
    let codec = options.codec.clone();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let first = tokio::time::timeout(
        options.connect_timeout,
        next_inbound(&mut ws_receiver, codec.as_ref()),
    )
    .await;

    let (client_id, username, password) = match first {
        Ok(Inbound::Request(ClientMessage::Connect {
            client_id,
            username,
            password,
        })) => (client_id, username, password),
        Ok(Inbound::Request(other)) => {
            warn!("{peer} sent {other:?} before connect");
            let error = ServerMessage::Error {
                message: "expected connect".to_string(),
            };
            refuse(&mut ws_sender, codec.as_ref(), error).await;
            return;
        }
        Ok(Inbound::Malformed(e)) => {
            warn!("Invalid connect frame from {peer}: {e}");
            let error = ServerMessage::Error {
                message: e.to_string(),
            };
            refuse(&mut ws_sender, codec.as_ref(), error).await;
            return;
        }
        Ok(_) => {
            debug!("{peer} went away before connect");
            return;
        }
        Err(_) => {
            debug!("{peer} did not connect within {:?}", options.connect_timeout);
            let _ = ws_sender.close().await;
            return;
        }
    };

    let handle = match broker.connect_from(&client_id, &username, &password, Some(peer)) {
        Ok(handle) => handle,
        Err(e) => {
            info!("Refused connect from {peer}: {e}");
            let connack = ServerMessage::Connack {
                code: e.reason_code().to_string(),
                client_id: None,
            };
            refuse(&mut ws_sender, codec.as_ref(), connack).await;
            return;
        }
    };

    let client_id = handle.client_id().to_string();
    let session_id = handle.session_id();
    let connack = ServerMessage::Connack {
        code: CONNACK_SUCCESS.to_string(),
        client_id: Some(client_id.clone()),
    };
    if let Err(e) = send_frame(&mut ws_sender, codec.as_ref(), &connack).await {
        debug!("Failed to send connack to {client_id}: {e}");
        broker.disconnect_session(&client_id, session_id, DisconnectReason::TransportFailure);
        return;
    }

    let done = CancellationToken::new();
    let (replies, reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = spawn(send_loop(
        ws_sender,
        handle,
        reply_rx,
        codec.clone(),
        done.clone(),
    ));

    let reason = loop {
        let inbound = tokio::select! {
            biased;
            _ = done.cancelled() => break DisconnectReason::TransportFailure,
            frame = ws_receiver.next() => classify(frame, codec.as_ref()),
        };

        match inbound {
            Inbound::Request(request) => {
                if let Flow::Stop(reason) =
                    handle_request(&broker, &client_id, request, &replies).await
                {
                    break reason;
                }
            }
            Inbound::Malformed(e) => {
                warn!("Invalid client message from {client_id}: {e}");
                let _ = replies.send(ServerMessage::Error {
                    message: e.to_string(),
                });
            }
            Inbound::Skip => {}
            Inbound::Closed => break DisconnectReason::ClientClosed,
            Inbound::Ended => break DisconnectReason::TransportFailure,
            Inbound::Failed(e) => {
                debug!("Receive from {client_id} failed: {e}");
                break DisconnectReason::TransportFailure;
            }
        }
    };

    broker.disconnect_session(&client_id, session_id, reason);
    drop(replies);
    let _ = writer.await;
    debug!("Session for {client_id} ended: {reason}");
}

/// Forwards replies and queued deliveries to the socket until either side
/// closes. Replies go first so acknowledgements are not stuck behind a
/// backlog of deliveries.
async fn send_loop(
    mut sender: WsSender,
    mut handle: ConnectionHandle,
    mut replies: mpsc::UnboundedReceiver<ServerMessage>,
    codec: Arc<dyn FrameCodec>,
    done: CancellationToken,
) {
    let _done = done.drop_guard();

    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            delivery = handle.recv() => match delivery {
                Some(delivery) => ServerMessage::from(delivery),
                None => {
                    let reason = handle
                        .disconnect_reason()
                        .filter(|r| *r != DisconnectReason::ClientClosed);
                    if let Some(reason) = reason {
                        let notice = ServerMessage::Disconnect { reason };
                        let _ = send_frame(&mut sender, codec.as_ref(), &notice).await;
                    }
                    break;
                }
            },
        };

        if let Err(e) = send_frame(&mut sender, codec.as_ref(), &message).await {
            debug!("Failed to send message to {}: {e}", handle.client_id());
            break;
        }
    }

    let _ = sender.close().await;
    debug!("Send loop closed for {}", handle.client_id());
}

enum Flow {
    Continue,
    Stop(DisconnectReason),
}

async fn handle_request(
    broker: &Broker,
    client_id: &str,
    request: ClientMessage,
    replies: &mpsc::UnboundedSender<ServerMessage>,
) -> Flow {
    let reply = |message: ServerMessage| {
        let _ = replies.send(message);
    };

    match request {
        ClientMessage::Connect { .. } => {
            warn!("{client_id} sent a second connect");
            reply(ServerMessage::Error {
                message: "already connected".to_string(),
            });
            return Flow::Stop(DisconnectReason::ProtocolViolation);
        }
        ClientMessage::Subscribe { filter, qos } => {
            match broker.subscribe(client_id, &filter, qos).await {
                Ok(granted) => {
                    debug!("{client_id} subscribed to {filter} at {granted}");
                    reply(ServerMessage::Suback {
                        filter,
                        granted_qos: Some(granted),
                    });
                }
                Err(SubscribeError::InvalidFilter(_)) => {
                    debug!("{client_id} sent invalid filter {filter}");
                    reply(ServerMessage::Suback {
                        filter,
                        granted_qos: None,
                    });
                }
                Err(SubscribeError::NotConnected(_)) => {
                    return Flow::Stop(DisconnectReason::ClientClosed);
                }
            }
        }
        ClientMessage::Unsubscribe { filter } => match broker.unsubscribe(client_id, &filter) {
            Ok(_) => {
                debug!("{client_id} unsubscribed from {filter}");
                reply(ServerMessage::Unsuback { filter });
            }
            Err(_) => return Flow::Stop(DisconnectReason::ClientClosed),
        },
        ClientMessage::Publish {
            topic,
            payload,
            encoding,
            qos,
            retain,
            packet_id,
        } => {
            let payload = match encoding.decode(payload) {
                Ok(payload) => payload,
                Err(err) => {
                    reply(ServerMessage::Error {
                        message: format!("invalid base64 payload: {err}"),
                    });
                    return Flow::Continue;
                }
            };
            let message = Message::new(topic, payload)
                .with_qos(qos)
                .with_retain(retain);
            match broker.publish_packet(client_id, message, packet_id).await {
                Ok(ack) => {
                    debug!(
                        "{client_id} published #{} to {} subscribers",
                        ack.sequence, ack.delivered
                    );
                    match (qos, packet_id) {
                        (QoS::AtLeastOnce, Some(packet_id)) => {
                            reply(ServerMessage::Puback { packet_id })
                        }
                        (QoS::ExactlyOnce, Some(packet_id)) => {
                            reply(ServerMessage::Pubrec { packet_id })
                        }
                        _ => {}
                    }
                }
                Err(PublishError::InvalidTopic(topic)) => {
                    reply(ServerMessage::Error {
                        message: format!("invalid topic '{topic}'"),
                    });
                }
                Err(PublishError::NotConnected(_)) => {
                    return Flow::Stop(DisconnectReason::ClientClosed);
                }
            }
        }
        ClientMessage::Puback { packet_id } => {
            if !broker.acknowledge(client_id, packet_id) {
                debug!("{client_id} acknowledged unknown packet {packet_id}");
            }
        }
        ClientMessage::Pubrel { packet_id } => {
            broker.release(client_id, packet_id);
            reply(ServerMessage::Pubcomp { packet_id });
        }
        ClientMessage::Ping => reply(ServerMessage::Pong),
        ClientMessage::Disconnect => return Flow::Stop(DisconnectReason::ClientClosed),
    }

    Flow::Continue
}
