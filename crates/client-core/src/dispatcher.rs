//! Status dispatcher
//!
//! Routes each inbound [`SipRequest`] to the phone or call operation its
//! [`SipStatus`] calls for, then tells the application which [`CallState`]
//! the event maps to.

use std::sync::Arc;

use tracing::{debug, info};

use crate::call::CallState;
use crate::error::ClientResult;
use crate::phone::PhoneContext;
use crate::signaling::{SipRequest, SipStatus};

/// Call state announced to the application for a status
pub fn notified_state(status: SipStatus) -> Option<CallState> {
    match status {
        SipStatus::Invite => Some(CallState::RingingMe),
        SipStatus::Trying => Some(CallState::Dialing),
        SipStatus::Ringing => Some(CallState::Ringing),
        SipStatus::Ok => Some(CallState::Answered),
        SipStatus::Bye | SipStatus::End => Some(CallState::End),
        SipStatus::Decline => Some(CallState::Decline),
        SipStatus::BusyHere => Some(CallState::Busy),
        SipStatus::NotFound => Some(CallState::NotFound),
        SipStatus::TemporarilyUnavailable => Some(CallState::NotAvailable),
        SipStatus::Hold => Some(CallState::Hold),
        SipStatus::OnlineHold => Some(CallState::OnlineHold),
        SipStatus::TransferAccepted => Some(CallState::TransferAccepted),
        SipStatus::TransferDeclined => Some(CallState::TransferDecline),
        SipStatus::SelfRinging | SipStatus::Other(_) => None,
    }
}

pub(crate) async fn dispatch(ctx: &Arc<PhoneContext>, request: SipRequest) -> ClientResult<()> {
    let call_id = request.call_id.clone();
    let call = ctx.calls.get(&call_id);
    debug!(call_id = %call_id, status = %request.status, known = call.is_some(), "Signaling event");

    match request.status {
        SipStatus::Invite => match call {
            Some(call) => call.renegotiate(&request).await?,
            None => {
                let session_id = ctx.reserve_session_id()?;
                if let Err(e) = ctx.incoming_call(request, session_id).await {
                    ctx.session_ids.release(session_id);
                    return Err(e);
                }
                ctx.notify(CallState::RingingMe, &call_id).await;
            }
        },

        SipStatus::Ok => match call {
            Some(call) if call.state().is_pending() => {
                call.answered(&request).await?;
                ctx.notify(CallState::Answered, &call_id).await;
            }
            Some(call) => debug!(call_id = %call_id, state = %call.state(), "200 OK for established call"),
            None => debug!(call_id = %call_id, "200 OK for unknown call"),
        },

        SipStatus::Trying => {
            ctx.cache_provisional(&request);
            ctx.notify(CallState::Dialing, &call_id).await;
        }

        SipStatus::Ringing => {
            ctx.cache_provisional(&request);
            if let Some(call) = &call {
                call.ringing();
            }
            ctx.notify(CallState::Ringing, &call_id).await;
        }

        SipStatus::SelfRinging => ctx.cache_provisional(&request),

        SipStatus::Bye | SipStatus::End => {
            ctx.notify(CallState::End, &call_id).await;
            if let Some(call) = call {
                call.bye().await?;
            }
        }

        SipStatus::Decline | SipStatus::BusyHere => {
            if let Some(state) = notified_state(request.status) {
                ctx.notify(state, &call_id).await;
            }
            if let Some(call) = call {
                if call.remote_rejected().await {
                    info!(call_id = %call_id, status = %request.status, "Call rejected by remote party");
                }
            }
        }

        SipStatus::NotFound | SipStatus::TemporarilyUnavailable => {
            if let Some(state) = notified_state(request.status) {
                ctx.notify(state, &call_id).await;
            }
            if let Some(call) = call {
                let failure = if request.status == SipStatus::NotFound {
                    call.not_found(&request).await
                } else {
                    call.unavailable(&request).await
                };
                if let Some(failure) = failure {
                    ctx.report_failure(failure).await;
                }
            }
        }

        SipStatus::TransferAccepted => {
            ctx.notify(CallState::TransferAccepted, &call_id).await;
            if let Some(call) = call {
                call.bye().await?;
            }
        }

        SipStatus::Hold | SipStatus::OnlineHold | SipStatus::TransferDeclined => {
            if let Some(state) = notified_state(request.status) {
                ctx.notify(state, &call_id).await;
            }
        }

        SipStatus::Other(code) => debug!(call_id = %call_id, code, "Unhandled signaling status"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notified_states() {
        assert_eq!(notified_state(SipStatus::Invite), Some(CallState::RingingMe));
        assert_eq!(notified_state(SipStatus::Trying), Some(CallState::Dialing));
        assert_eq!(notified_state(SipStatus::End), Some(CallState::End));
        assert_eq!(notified_state(SipStatus::TransferDeclined), Some(CallState::TransferDecline));
        assert_eq!(notified_state(SipStatus::SelfRinging), None);
        assert_eq!(notified_state(SipStatus::Other(183)), None);
    }
}
