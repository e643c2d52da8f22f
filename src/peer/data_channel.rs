use crate::error::{CallError, Result};
use crate::peer::transport::{next_channel_id, ChannelId, DataChannel, PeerEvent, PeerEventSink};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Data channel webrtc-rs; его колбэки превращаются в [`PeerEvent`]
pub struct RtcDataChannel {
    id: ChannelId,
    inner: Arc<RTCDataChannel>,
}

/// общий обработчик data-channel: и для своего, и для пришедшего от пира
pub fn attach_dc(dc: Arc<RTCDataChannel>, sink: PeerEventSink) -> Arc<RtcDataChannel> {
    let id = next_channel_id();
    debug!("attach_dc: '{}' as #{id}", dc.label());

    dc.on_open(Box::new({
        let sink = sink.clone();
        move || {
            info!("Data channel #{id} opened");
            sink.emit(PeerEvent::ChannelOpened(id));
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let sink = sink.clone();
        move |msg: DataChannelMessage| {
            if msg.is_string {
                let text = String::from_utf8_lossy(&msg.data).to_string();
                sink.emit(PeerEvent::ChannelMessage { channel: id, text });
            } else {
                debug!("Ignoring binary message, length: {}", msg.data.len());
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        info!("Data channel #{id} closed");
        sink.emit(PeerEvent::ChannelClosed(id));
        Box::pin(async {})
    }));

    Arc::new(RtcDataChannel { id, inner: dc })
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(CallError::ChannelNotReady);
        }
        match self.inner.send_text(text.to_string()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Send on data channel #{} failed: {e}", self.id);
                Err(CallError::ChannelNotReady)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| CallError::NegotiationError(format!("data channel close: {e}")))
    }
}
