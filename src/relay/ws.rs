//! Клиент внешнего relay поверх WebSocket. Кадры это JSON
//! `{"event": ..., "data": ...}`; входящие раздаются через [`HandlerTable`].

use crate::error::{CallError, Result};
use crate::peer::types::{ParticipantId, RoomId};
use crate::signaling::{
    EventKind, HandlerTable, InboundSignal, OutboundSignal, SignalHandler, SignalingRelay,
};
use crate::utils::lock;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

type JoinAck = oneshot::Sender<Result<ParticipantId>>;

pub struct WsRelay {
    outbound: mpsc::UnboundedSender<Message>,
    handlers: Arc<HandlerTable>,
    pending_join: Arc<Mutex<Option<JoinAck>>>,
    local_id: Mutex<Option<ParticipantId>>,
    join_timeout: Duration,
}

impl WsRelay {
    /// Подключение к relay; отказ сети даёт `RelayUnavailable`
    pub async fn connect(url: &str, join_timeout: Duration) -> Result<Arc<Self>> {
        info!("Connecting to relay: {url}");
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| CallError::RelayUnavailable(format!("{url}: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let handlers = Arc::new(HandlerTable::default());
        let pending_join: Arc<Mutex<Option<JoinAck>>> = Arc::new(Mutex::new(None));

        let writer_url = url.to_string();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    error!("WebSocket send to {writer_url} failed: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_url = url.to_string();
        let reader_handlers = handlers.clone();
        let reader_join = pending_join.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        handle_frame(&text, &reader_handlers, &reader_join);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error from {reader_url}: {e}");
                        break;
                    }
                }
            }
            warn!("WebSocket closed: {reader_url}");
            if let Some(ack) = lock(&reader_join).take() {
                let _ = ack.send(Err(CallError::RelayUnavailable(
                    "connection closed before join ack".into(),
                )));
            }
        });

        Ok(Arc::new(Self {
            outbound,
            handlers,
            pending_join,
            local_id: Mutex::new(None),
            join_timeout,
        }))
    }

    fn send_frame(&self, signal: &OutboundSignal) -> Result<()> {
        let json = serde_json::to_string(signal)?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| CallError::RelayUnavailable("writer task stopped".into()))
    }
}

/// Разбор одного текстового кадра
fn handle_frame(text: &str, handlers: &HandlerTable, pending_join: &Mutex<Option<JoinAck>>) {
    let signal: InboundSignal = match serde_json::from_str(text) {
        Ok(signal) => signal,
        Err(e) => {
            debug!("Ignoring unparsable relay frame: {e}");
            return;
        }
    };
    match &signal {
        InboundSignal::RoomJoined { id, room } => {
            if let Some(ack) = lock(pending_join).take() {
                let result = id.clone().ok_or_else(|| {
                    CallError::RelayUnavailable(format!("join ack for {room} carries no id"))
                });
                let _ = ack.send(result);
            }
        }
        InboundSignal::RoomFull { room } => {
            if let Some(ack) = lock(pending_join).take() {
                let _ = ack.send(Err(CallError::RoomFull(room.to_string())));
            }
        }
        _ => {}
    }
    handlers.dispatch(signal);
}

#[async_trait]
impl SignalingRelay for WsRelay {
    async fn join(&self, room: &RoomId, identity: &str) -> Result<ParticipantId> {
        let (tx, rx) = oneshot::channel();
        if lock(&self.pending_join).replace(tx).is_some() {
            debug!("Replacing an unfinished join");
        }
        self.send_frame(&OutboundSignal::RoomJoin {
            email: identity.to_string(),
            room: room.clone(),
        })?;

        let id = match tokio::time::timeout(self.join_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(CallError::RelayUnavailable("join ack channel dropped".into()))
            }
            Err(_) => {
                lock(&self.pending_join).take();
                return Err(CallError::RelayUnavailable(format!(
                    "no room:join ack within {:?}",
                    self.join_timeout
                )));
            }
        };
        *lock(&self.local_id) = Some(id.clone());
        Ok(id)
    }

    fn send(&self, signal: OutboundSignal) -> bool {
        match self.send_frame(&signal) {
            Ok(()) => true,
            Err(e) => {
                warn!("Relay send failed: {e}");
                false
            }
        }
    }

    fn on_event(&self, kind: EventKind, handler: SignalHandler) {
        self.handlers.register(kind, handler);
    }

    fn off_event(&self, kind: EventKind) -> bool {
        self.handlers.remove(kind)
    }

    fn local_id(&self) -> Option<ParticipantId> {
        lock(&self.local_id).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_join_ack_resolves_pending() {
        let handlers = HandlerTable::default();
        let pending = Mutex::new(None);
        let (tx, mut rx) = oneshot::channel();
        *pending.lock().unwrap() = Some(tx);

        handle_frame(
            r#"{"event":"room:join","data":{"room":"9","id":"sock-4"}}"#,
            &handlers,
            &pending,
        );
        let id = rx.try_recv().unwrap().unwrap();
        assert_eq!(id, ParticipantId::new("sock-4"));
        assert!(pending.lock().unwrap().is_none());
    }

    #[test]
    fn test_room_full_fails_join() {
        let handlers = HandlerTable::default();
        let pending = Mutex::new(None);
        let (tx, mut rx) = oneshot::channel();
        *pending.lock().unwrap() = Some(tx);
        handle_frame(
            r#"{"event":"room:full","data":{"room":"9"}}"#,
            &handlers,
            &pending,
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CallError::RoomFull(_))
        ));
    }

    #[test]
    fn test_frames_reach_handlers() {
        let handlers = HandlerTable::default();
        let pending = Mutex::new(None);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        handlers.register(
            EventKind::CallEnd,
            Arc::new(move |_: InboundSignal| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle_frame(r#"{"event":"call:end","data":{"from":"sock-2"}}"#, &handlers, &pending);
        handle_frame("not json", &handlers, &pending);
        handle_frame(r#"{"event":"unknown:event","data":{}}"#, &handlers, &pending);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_relay_unavailable() {
        let err = WsRelay::connect("ws://127.0.0.1:1/relay", Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CallError::RelayUnavailable(_)));
    }
}
