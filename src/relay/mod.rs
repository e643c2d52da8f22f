pub mod local;
pub mod ws;

pub use local::{LocalRelay, LocalRelayClient, RoutedSignal};
pub use ws::WsRelay;
