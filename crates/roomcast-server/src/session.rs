//! One live connection: an inbound reader and an outbound writer.
//!
//! The writer owns the socket's sink and a bounded queue of pre-encoded
//! frames. It writes each frame under a deadline, pings on a timer, and
//! exits on the first failed or late write. The reader runs inline on the
//! connection task, so one session's envelopes are handled in arrival order.
//! Whichever side ends first ends the session, but an envelope the reader has
//! started handling is always finished.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};

use crate::api::ApiError;
use crate::chat::Actor;
use crate::config::ChatConfig;
use crate::envelope::{Envelope, Frame};
use crate::hub::{RoomHub, SessionHandle, SessionKey};

/// Receives each decoded, identity-stamped envelope from a session.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, envelope: Envelope) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Timing and buffering for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    /// Longest silence tolerated from the peer.
    pub pong_wait: Duration,
    /// Ping interval; shorter than `pong_wait` so a live peer always answers in time.
    pub ping_period: Duration,
}

impl From<&ChatConfig> for SessionSettings {
    fn from(chat: &ChatConfig) -> Self {
        let pong_wait = Duration::from_millis(chat.pong_wait_ms.max(1));
        Self {
            queue_capacity: chat.queue_capacity.max(1),
            write_timeout: Duration::from_millis(chat.write_timeout_ms.max(1)),
            pong_wait,
            ping_period: (pong_wait * 9 / 10).max(Duration::from_millis(1)),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

/// A connection that has passed authentication and the membership check.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    actor: Actor,
    hub: RoomHub,
    settings: SessionSettings,
}

impl Session {
    pub fn open(hub: RoomHub, room_id: i64, actor: Actor, settings: SessionSettings) -> Self {
        Self {
            key: SessionKey::new(room_id, actor.user_id),
            actor,
            hub,
            settings,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Runs the session on an upgraded websocket until either side ends.
    pub async fn run<H: InboundHandler>(self, socket: WebSocket, handler: H) {
        let (sink, stream) = socket.split();
        self.run_split(sink, stream, handler).await;
    }

    /// Runs the session over any message sink and stream.
    pub async fn run_split<W, R, E, H>(self, sink: W, stream: R, handler: H)
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
        H: InboundHandler,
    {
        let Session {
            key,
            actor,
            hub,
            settings,
        } = self;

        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let shutdown = Arc::new(Notify::new());
        let reply = tx.downgrade();
        hub.register(SessionHandle::new(
            key,
            actor.display_name.clone(),
            tx,
            shutdown.clone(),
        ))
        .await;
        tracing::info!(room_id = key.room_id, user_id = key.user_id, session_id = %key.session_id, "session opened");

        let mut writer = tokio::spawn(write_loop(sink, rx, shutdown, settings, key));
        let writer_done = read_loop(
            stream,
            InboundContext {
                key,
                actor,
                reply,
                pong_wait: settings.pong_wait,
            },
            handler,
            &mut writer,
        )
        .await;

        hub.unregister(key).await;
        if !writer_done {
            // The hub held the last sender, so the writer drains, closes and exits.
            if timeout(settings.write_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        tracing::info!(room_id = key.room_id, user_id = key.user_id, session_id = %key.session_id, "session closed");
    }
}

struct InboundContext {
    key: SessionKey,
    actor: Actor,
    reply: mpsc::WeakSender<Frame>,
    pong_wait: Duration,
}

impl InboundContext {
    fn reply_error(&self, message: String) {
        let Some(tx) = self.reply.upgrade() else {
            return;
        };
        match Envelope::error(self.key.room_id, message).encode() {
            Ok(frame) => {
                if let Err(e) = tx.try_send(frame) {
                    tracing::warn!(session_id = %self.key.session_id, "failed to queue error reply: {}", e);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode error reply"),
        }
    }
}

/// Reads until the peer goes away or the writer ends. Returns `true` if the
/// writer ended first.
///
/// Only the wait for the next frame races the writer. An envelope already
/// handed to the handler runs to completion even if the session is evicted
/// meanwhile.
async fn read_loop<R, E, H>(
    mut stream: R,
    ctx: InboundContext,
    handler: H,
    writer: &mut JoinHandle<()>,
) -> bool
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    H: InboundHandler,
{
    loop {
        let next = tokio::select! {
            _ = &mut *writer => return true,
            next = timeout(ctx.pong_wait, stream.next()) => next,
        };
        let message = match next {
            Err(_) => {
                tracing::info!(session_id = %ctx.key.session_id, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %ctx.key.session_id, "socket read failed: {}", e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => handle_text(&ctx, &handler, text.as_str()).await,
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::warn!(session_id = %ctx.key.session_id, "dropping binary frame");
            }
            // Any frame refreshes the deadline; nothing else to do.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    false
}

async fn handle_text<H: InboundHandler>(ctx: &InboundContext, handler: &H, text: &str) {
    let mut envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(session_id = %ctx.key.session_id, error = %e, "dropping malformed envelope");
            return;
        }
    };
    if !envelope.kind.is_client_kind() {
        tracing::warn!(session_id = %ctx.key.session_id, kind = ?envelope.kind, "dropping server-only envelope");
        return;
    }

    envelope.stamp(ctx.key.room_id, ctx.actor.user_id, &ctx.actor.display_name);
    let kind = envelope.kind;
    if let Err(e) = handler.handle(envelope).await {
        tracing::warn!(
            session_id = %ctx.key.session_id,
            room_id = ctx.key.room_id,
            kind = ?kind,
            error = %e,
            "inbound envelope rejected"
        );
        ctx.reply_error(e.public_message());
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Frame>,
    shutdown: Arc<Notify>,
    settings: SessionSettings,
    key: SessionKey,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outgoing = tokio::select! {
            biased;
            () = shutdown.notified() => {
                tracing::debug!(session_id = %key.session_id, "session shut down by hub");
                close(&mut sink, settings.write_timeout).await;
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => {
                    close(&mut sink, settings.write_timeout).await;
                    break;
                }
            },
            _ = heartbeat.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(settings.write_timeout, sink.send(outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(session_id = %key.session_id, "socket write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::warn!(session_id = %key.session_id, "write deadline exceeded");
                break;
            }
        }
    }
}

async fn close<W>(sink: &mut W, write_timeout: Duration)
where
    W: Sink<Message> + Unpin,
{
    let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
}
