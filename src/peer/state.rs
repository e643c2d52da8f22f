use serde::{Deserialize, Serialize};

/// Фаза обмена описаниями в рамках одной CallSession
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    /// Ещё ничего не отправлено
    Idle,
    /// Локальный offer отправлен, ждём answer
    OfferSent,
    /// Удалённый offer применён, answer в работе
    OfferReceived,
    Stable,
    /// После Stable изменился набор треков, нужен новый offer
    Renegotiating,
}

/// Роль для разрешения glare. Инициатор звонка невежлив и держится за
/// свой offer, принимающий вежлив и откатывает свой.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

/// Какой обмен идёт: первый (`user:call`/`call:accepted`) или
/// пересогласование (`peer:nego:*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Call,
    Renegotiation,
}

#[derive(Debug, Clone)]
pub struct NegotiationState {
    pub phase: SignalingPhase,
    pub role: Role,
    /// Номер последнего сгенерированного offer
    pub offer_generation: u64,
    /// Куда вернуться после отката своего offer
    pub phase_before_offer: SignalingPhase,
    /// Набор треков изменился, offer ещё не отправлен
    pub renegotiation_pending: bool,
    /// Stable был достигнут хотя бы раз
    pub established: bool,
    pub remote_description_set: bool,
}

impl NegotiationState {
    pub fn new(role: Role) -> Self {
        Self {
            phase: SignalingPhase::Idle,
            role,
            offer_generation: 0,
            phase_before_offer: SignalingPhase::Idle,
            renegotiation_pending: false,
            established: false,
            remote_description_set: false,
        }
    }

    /// Offer можно создавать только без незавершённого обмена
    pub fn can_create_offer(&self) -> bool {
        matches!(
            self.phase,
            SignalingPhase::Idle | SignalingPhase::Stable | SignalingPhase::Renegotiating
        )
    }

    pub fn is_stable(&self) -> bool {
        matches!(
            self.phase,
            SignalingPhase::Stable | SignalingPhase::Renegotiating
        )
    }
}
