//! Ошибки ядра звонка

/// Result с [`CallError`]
pub type Result<T> = std::result::Result<T, CallError>;

/// Ошибки, которые ядро возвращает вызывающему коду. Ничего не повторяется
/// автоматически: каждая ошибка доходит до вызывающего как есть.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Транспорт relay не поднялся или пропал
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Relay отказал во входе: в комнате уже двое
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// Захват запрещён или нет устройства
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Битое описание или кандидат, либо SDP-операция отклонена
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Операция не разрешена в текущем состоянии
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Чат до открытия data channel
    #[error("Data channel not ready")]
    ChannelNotReady,

    /// После обрезки пробелов текст пуст
    #[error("Empty chat message")]
    EmptyMessage,

    /// Рассогласование учёта участников комнаты
    #[error("Room error: {0}")]
    RoomError(String),

    /// Неверный параметр конфигурации
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Ошибка (де)сериализации
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CallError {
    pub(crate) fn invalid_state(op: &str, state: impl std::fmt::Debug) -> Self {
        CallError::InvalidState(format!("{op} not allowed in {state:?}"))
    }

    /// Ошибка пришла из обработки SDP/ICE
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, CallError::NegotiationError(_))
    }

    /// Ошибки, после которых попытка звонка сбрасывается в NoCall
    pub fn aborts_call_attempt(&self) -> bool {
        matches!(
            self,
            CallError::MediaUnavailable(_)
                | CallError::RelayUnavailable(_)
                | CallError::NegotiationError(_)
        )
    }
}
