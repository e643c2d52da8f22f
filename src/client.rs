//! Цикл событий клиента. Сигналы relay, события соединения и команды UI
//! приходят в три очереди и обрабатываются строго по одному.

use crate::call::{CallManager, CallOptions, CallSnapshot, MuteState};
use crate::config::ClientConfig;
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventHub};
use crate::media::MediaSource;
use crate::messenger::{ChatHandler, ChatMessage};
use crate::peer::transport::{ConnectionFactory, SessionEvent};
use crate::peer::types::{ParticipantId, RoomId};
use crate::room::RoomCoordinator;
use crate::signaling::{EventKind, InboundSignal, SignalingRelay};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub enum Command {
    InitiateCall {
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleAudio {
        reply: oneshot::Sender<MuteState>,
    },
    ToggleVideo {
        reply: oneshot::Sender<MuteState>,
    },
    EndCall {
        reply: oneshot::Sender<bool>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<ChatMessage>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    /// Завершить звонок, выйти из комнаты и остановить цикл
    Quit {
        reply: oneshot::Sender<()>,
    },
}

/// Все события relay попадают в очередь клиента
fn subscribe_all(relay: &dyn SignalingRelay, tx: mpsc::UnboundedSender<InboundSignal>) {
    for kind in EventKind::ALL {
        let tx = tx.clone();
        relay.on_event(
            kind,
            Arc::new(move |signal: InboundSignal| {
                if tx.send(signal).is_err() {
                    debug!("Client loop stopped, dropping {}", kind.as_str());
                }
            }),
        );
    }
}

pub struct Client {
    relay: Arc<dyn SignalingRelay>,
    room: RoomCoordinator,
    calls: CallManager,
    hub: Arc<EventHub>,
    signal_rx: mpsc::UnboundedReceiver<InboundSignal>,
    peer_rx: mpsc::UnboundedReceiver<SessionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Client {
    pub fn new(
        config: &ClientConfig,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn ConnectionFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let hub = EventHub::new();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        subscribe_all(relay.as_ref(), signal_tx);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let options = CallOptions {
            data_channel_label: config.data_channel_label.clone(),
            ..Default::default()
        };
        let calls = CallManager::new(
            relay.clone(),
            factory,
            media,
            peer_tx,
            hub.clone(),
            options,
        );
        Self {
            room: RoomCoordinator::new(relay.clone()),
            relay,
            calls,
            hub,
            signal_rx,
            peer_rx,
            cmd_rx,
            cmd_tx,
        }
    }

    pub fn events(&self) -> Arc<EventHub> {
        self.hub.clone()
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn room(&self) -> &RoomCoordinator {
        &self.room
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    fn report(&self, what: &str, e: &CallError) {
        let message = format!("{what}: {e}");
        error!("{message}");
        self.hub.emit(&CallEvent::Error { message });
    }

    pub async fn join(&mut self, room: RoomId, email: &str) -> Result<ParticipantId> {
        let id = self.room.join(room.clone(), email).await?;
        self.hub.emit(&CallEvent::RoomJoined {
            room,
            id: id.clone(),
        });
        Ok(id)
    }

    /// Звонок единственному удалённому участнику комнаты
    pub async fn initiate_call(&mut self) -> Result<()> {
        let Some(remote) = self.room.remote().map(|p| p.id.clone()) else {
            return Err(CallError::InvalidState("nobody to call in the room".into()));
        };
        self.calls.initiate_call(remote).await
    }

    pub fn toggle_audio(&mut self) -> MuteState {
        self.calls.toggle_audio()
    }

    pub fn toggle_video(&mut self) -> MuteState {
        self.calls.toggle_video()
    }

    pub async fn end_call(&mut self) -> bool {
        self.calls.end_call().await
    }

    pub async fn send_chat(&mut self, text: &str) -> Result<ChatMessage> {
        self.calls.send_chat(text).await
    }

    pub fn on_chat(&mut self, handler: ChatHandler) {
        self.calls.on_receive(handler);
    }

    pub async fn leave(&mut self) {
        self.calls.end_call().await;
        self.room.leave();
    }

    pub async fn handle_signal(&mut self, signal: InboundSignal) {
        let kind = signal.kind();
        debug!("Handling {}", kind.as_str());
        let result = match signal {
            InboundSignal::RoomJoined { room, .. } => {
                debug!("Join of room {room} acknowledged");
                Ok(())
            }
            InboundSignal::RoomFull { room } => Err(CallError::RoomFull(room.to_string())),
            InboundSignal::UserJoined { email, id } => {
                self.room.on_user_joined(id, email).map(|p| {
                    self.hub.emit(&CallEvent::PeerJoined {
                        id: p.id,
                        email: p.display,
                    });
                })
            }
            InboundSignal::UserLeft { id } => {
                if self.room.on_user_left(&id).is_some() {
                    self.hub.emit(&CallEvent::PeerLeft { id: id.clone() });
                }
                self.calls.handle_peer_left(&id).await;
                Ok(())
            }
            InboundSignal::IncomingCall { from, offer } => match self.room.note_caller(&from) {
                Ok(()) => self.calls.handle_incoming_call(from, offer).await,
                Err(e) => Err(e),
            },
            InboundSignal::CallAccepted { from, ans } => {
                self.calls.acceptance_confirmed(from, ans).await
            }
            InboundSignal::NegoNeeded { from, offer } => {
                self.calls.handle_renegotiation_offer(from, offer).await
            }
            InboundSignal::NegoFinal { from, ans } => {
                self.calls.handle_renegotiation_answer(from, ans).await
            }
            InboundSignal::IceCandidate { from, candidate } => {
                if let Err(e) = self.calls.handle_remote_candidate(from, candidate).await {
                    let message = format!("Remote candidate rejected: {e}");
                    warn!("{message}");
                    self.hub.emit(&CallEvent::Warning { message });
                }
                Ok(())
            }
            InboundSignal::CallInitiated { from } => self.calls.handle_call_initiated(from),
            InboundSignal::CallEnd { from } => {
                self.calls.handle_remote_end(&from).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            self.report(kind.as_str(), &e);
        }
    }

    /// `false` когда цикл надо остановить
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::InitiateCall { reply } => {
                let result = self.initiate_call().await;
                if let Err(e) = &result {
                    self.report("initiate call", e);
                }
                let _ = reply.send(result);
            }
            Command::ToggleAudio { reply } => {
                let _ = reply.send(self.toggle_audio());
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_video());
            }
            Command::EndCall { reply } => {
                let ended = self.end_call().await;
                let _ = reply.send(ended);
            }
            Command::SendChat { text, reply } => {
                let _ = reply.send(self.send_chat(&text).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Quit { reply } => {
                self.leave().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Обрабатывает всё, что уже лежит в очередях. Для тестов и встраивания
    /// без отдельной задачи. Возвращает число обработанных элементов.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.peer_rx.try_recv() {
                self.calls.on_peer_event(event);
            } else if let Ok(signal) = self.signal_rx.try_recv() {
                self.handle_signal(signal).await;
            } else if let Ok(command) = self.cmd_rx.try_recv() {
                self.handle_command(command).await;
            } else {
                break;
            }
            handled += 1;
        }
        handled
    }

    pub async fn run(mut self) {
        info!("Client loop started");
        loop {
            tokio::select! {
                biased;
                Some(event) = self.peer_rx.recv() => self.calls.on_peer_event(event),
                Some(signal) = self.signal_rx.recv() => self.handle_signal(signal).await,
                command = self.cmd_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        info!("Client loop stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for kind in EventKind::ALL {
            self.relay.off_event(kind);
        }
    }
}

fn stopped() -> CallError {
    CallError::InvalidState("client loop is not running".into())
}

/// Команды в цикл клиента из других задач
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn initiate_call(&self) -> Result<()> {
        self.request(|reply| Command::InitiateCall { reply }).await?
    }

    pub async fn toggle_audio(&self) -> Result<MuteState> {
        self.request(|reply| Command::ToggleAudio { reply }).await
    }

    pub async fn toggle_video(&self) -> Result<MuteState> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    pub async fn end_call(&self) -> Result<bool> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn send_chat(&self, text: &str) -> Result<ChatMessage> {
        let text = text.to_string();
        self.request(|reply| Command::SendChat { text, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn quit(&self) -> Result<()> {
        self.request(|reply| Command::Quit { reply }).await
    }
}
