use std::fmt;

use crate::engine::SdpKind;
use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Stable => "stable",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Closed => "closed",
        }
    }

    /// State reached after applying a local description of `kind`.
    pub fn after_local(self, kind: SdpKind) -> Result<Self, LinkError> {
        check_local_description(self, kind)?;
        Ok(match kind {
            SdpKind::Offer => NegotiationState::HaveLocalOffer,
            SdpKind::ProvisionalAnswer => NegotiationState::HaveRemoteOffer,
            SdpKind::Answer | SdpKind::Rollback => NegotiationState::Stable,
        })
    }

    /// State reached after applying a remote description of `kind`.
    pub fn after_remote(self, kind: SdpKind) -> Result<Self, LinkError> {
        check_remote_description(self, kind)?;
        Ok(match kind {
            SdpKind::Offer => NegotiationState::HaveRemoteOffer,
            SdpKind::ProvisionalAnswer => NegotiationState::HaveLocalOffer,
            SdpKind::Answer | SdpKind::Rollback => NegotiationState::Stable,
        })
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Glare guard for inbound descriptions.
///
/// A remote offer is refused while our own offer is outstanding, and a remote
/// answer is only accepted while it is.
pub fn check_remote_description(state: NegotiationState, kind: SdpKind) -> Result<(), LinkError> {
    use NegotiationState::*;

    let allowed = match (kind, state) {
        (_, Closed) => false,
        (SdpKind::Offer, HaveLocalOffer) => false,
        (SdpKind::Offer, Stable | HaveRemoteOffer) => true,
        (SdpKind::Answer | SdpKind::ProvisionalAnswer, HaveLocalOffer) => true,
        (SdpKind::Answer | SdpKind::ProvisionalAnswer, Stable | HaveRemoteOffer) => false,
        (SdpKind::Rollback, HaveRemoteOffer) => true,
        (SdpKind::Rollback, Stable | HaveLocalOffer) => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(LinkError::Glare { kind, state })
    }
}

pub fn check_local_description(state: NegotiationState, kind: SdpKind) -> Result<(), LinkError> {
    use NegotiationState::*;

    let allowed = match (kind, state) {
        (_, Closed) => false,
        (SdpKind::Offer, Stable | HaveLocalOffer) => true,
        (SdpKind::Offer, HaveRemoteOffer) => false,
        (SdpKind::Answer | SdpKind::ProvisionalAnswer, HaveRemoteOffer) => true,
        (SdpKind::Answer | SdpKind::ProvisionalAnswer, Stable | HaveLocalOffer) => false,
        (SdpKind::Rollback, HaveLocalOffer) => true,
        (SdpKind::Rollback, Stable | HaveRemoteOffer) => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(LinkError::Negotiation(format!(
            "cannot apply local {kind} in signaling state {state}"
        )))
    }
}
