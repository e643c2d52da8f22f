//! Чат поверх одного reliable ordered data channel на сессию.

use crate::error::{CallError, Result};
use crate::peer::transport::{ChannelId, ConnectionTransport, DataChannel};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Local,
    Remote,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
    pub ordinal: u64,
}

pub type ChatHandler = Arc<dyn Fn(&ChatMessage) + Send + Sync>;

pub struct Messenger {
    label: String,
    /// Соединением владеет CallSession
    connection: Weak<dyn ConnectionTransport>,
    channel: Option<Arc<dyn DataChannel>>,
    open: bool,
    activated: bool,
    transcript: Vec<ChatMessage>,
    handler: Option<ChatHandler>,
}

impl Messenger {
    pub fn new(connection: &Arc<dyn ConnectionTransport>, label: &str) -> Self {
        Self {
            label: label.to_string(),
            connection: Arc::downgrade(connection),
            channel: None,
            open: false,
            activated: false,
            transcript: Vec::new(),
            handler: None,
        }
    }

    /// Инициатор открывает канал сам, не дожидаясь удалённого
    pub async fn open_channel(&mut self) -> Result<ChannelId> {
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| CallError::InvalidState("connection already released".into()))?;
        let channel = connection.create_data_channel(&self.label).await?;
        let id = channel.id();
        debug!("Created local data channel '{}' #{id}", self.label);
        self.open = channel.is_open();
        self.channel = Some(channel);
        Ok(id)
    }

    /// Канал от удалённой стороны заменяет локальный
    pub fn adopt_remote(&mut self, channel: Arc<dyn DataChannel>) {
        if let Some(old) = &self.channel {
            if old.id() == channel.id() {
                return;
            }
            info!(
                "Remote data channel #{} replaces local #{}",
                channel.id(),
                old.id()
            );
        } else {
            debug!("Adopted remote data channel #{}", channel.id());
        }
        self.open = channel.is_open();
        self.channel = Some(channel);
    }

    fn is_current(&self, id: ChannelId) -> bool {
        self.channel.as_ref().is_some_and(|c| c.id() == id)
    }

    pub fn on_channel_open(&mut self, id: ChannelId) {
        if self.is_current(id) {
            debug!("Data channel #{id} open");
            self.open = true;
        }
    }

    pub fn on_channel_closed(&mut self, id: ChannelId) {
        if self.is_current(id) {
            info!("Data channel #{id} closed");
            self.open = false;
        }
    }

    /// Входящий текст; сообщения от заменённых каналов отбрасываются
    pub fn on_channel_message(&mut self, id: ChannelId, text: String) -> Option<ChatMessage> {
        if !self.is_current(id) {
            debug!("Dropping message from stale channel #{id}");
            return None;
        }
        let message = self.append(Sender::Remote, text);
        if let Some(handler) = &self.handler {
            handler(&message);
        }
        Some(message)
    }

    /// Первый Stable сессии
    pub fn activate(&mut self) {
        if !self.activated {
            debug!("Messenger activated");
            self.activated = true;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.activated && self.open && self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub async fn send(&mut self, text: &str) -> Result<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CallError::EmptyMessage);
        }
        if !self.is_ready() {
            return Err(CallError::ChannelNotReady);
        }
        let Some(channel) = self.channel.clone() else {
            return Err(CallError::ChannelNotReady);
        };
        channel.send_text(text).await?;
        Ok(self.append(Sender::Local, text.to_string()))
    }

    fn append(&mut self, sender: Sender, text: String) -> ChatMessage {
        let message = ChatMessage {
            sender,
            text,
            ordinal: self.transcript.len() as u64,
        };
        self.transcript.push(message.clone());
        message
    }

    pub fn on_receive(&mut self, handler: ChatHandler) {
        self.handler = Some(handler);
    }

    pub fn clear_receive(&mut self) {
        self.handler = None;
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// Закрывает канал и очищает историю
    pub async fn close(&mut self) {
        self.open = false;
        self.activated = false;
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!("Failed to close data channel #{}: {e}", channel.id());
            }
        }
        self.transcript.clear();
    }
}
