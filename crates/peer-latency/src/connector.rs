//! Session construction
//!
//! Builds the peer connection for a new session through the configured
//! [`PeerConnectionFactory`] and registers the result. The initiator creates
//! the probe channel up front so it is part of the offer; the responder waits
//! for the remote one to show up as [`SessionEvent::ChannelAccepted`].
//!
//! [`SessionEvent::ChannelAccepted`]: crate::transport::SessionEvent::ChannelAccepted

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{LoopEvent, Session};
use crate::transport::{
    ConnectionRequest, PeerConnection, PeerConnectionFactory, SessionEvents, TransportError,
};
use crate::types::{Direction, SessionHandle};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Rejected(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Create the connection for `request` and register a new session
pub(crate) async fn open_session<F>(
    factory: &F,
    registry: &mut SessionRegistry,
    request: ConnectionRequest,
    events_tx: &mpsc::UnboundedSender<LoopEvent>,
) -> Result<SessionHandle, ConnectError>
where
    F: PeerConnectionFactory + ?Sized,
{
    registry.check_admission(&request.session_id, request.direction)?;

    let handle = registry.mint_handle();
    let events = SessionEvents::new(handle, events_tx.clone());
    let connection: Arc<dyn PeerConnection> =
        Arc::from(factory.create(request.clone(), events).await?);

    let channel = match request.direction {
        Direction::Outbound => match connection.create_probe_channel().await {
            Ok(channel) => Some(channel),
            Err(e) => {
                connection.close().await;
                return Err(e.into());
            }
        },
        Direction::Inbound => None,
    };

    let session = Session::new(
        handle,
        request.session_id,
        request.target_uid,
        request.direction,
        request.local_uid,
        connection,
        channel,
        events_tx.clone(),
    );

    match registry.insert(session) {
        Ok(handle) => {
            debug!("[Latency] Registered {} session {}", request.direction, handle);
            Ok(handle)
        }
        Err((e, session)) => {
            session.shutdown().await;
            Err(e.into())
        }
    }
}
