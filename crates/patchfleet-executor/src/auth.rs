use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use patchfleet_core::PatchError;
use tracing::{debug, info, warn};

use crate::traits::{AuthProtocol, Credential, FallbackApprover, RemoteChannel, Transport};

/// Negotiation steps short of an established channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Untested,
    TestPrimary,
    ConfigureCredssp,
    PromptFallback,
    Failed,
}

pub struct Negotiated {
    pub channel: Box<dyn RemoteChannel>,
    pub protocol: AuthProtocol,
    pub used_fallback: bool,
}

/// Establishes a channel per host: primary protocol, one CredSSP
/// configuration attempt when the primary is CredSSP, then an approved
/// fallback.
pub struct AuthNegotiator {
    transport: Arc<dyn Transport>,
    approver: Arc<dyn FallbackApprover>,
    primary: AuthProtocol,
    fallback: Option<AuthProtocol>,
    credssp_configured: Mutex<HashSet<String>>,
}

impl AuthNegotiator {
    pub fn new(
        transport: Arc<dyn Transport>,
        approver: Arc<dyn FallbackApprover>,
        primary: AuthProtocol,
        fallback: Option<AuthProtocol>,
    ) -> Self {
        Self {
            transport,
            approver,
            primary,
            fallback,
            credssp_configured: Mutex::new(HashSet::new()),
        }
    }

    pub fn primary(&self) -> AuthProtocol {
        self.primary
    }

    pub async fn negotiate(
        &self,
        host: &str,
        credential: &Credential,
    ) -> Result<Negotiated, PatchError> {
        let mut state = AuthState::Untested;
        let mut last_error: Option<PatchError> = None;

        loop {
            debug!(host, ?state, "auth negotiation step");
            state = match state {
                AuthState::Untested => AuthState::TestPrimary,
                AuthState::TestPrimary => {
                    match self.transport.connect(host, credential, self.primary).await {
                        Ok(channel) => {
                            return Ok(Negotiated {
                                channel,
                                protocol: self.primary,
                                used_fallback: false,
                            })
                        }
                        Err(err) => {
                            warn!(host, protocol = %self.primary, error = %err, "primary protocol failed");
                            last_error = Some(err);
                            if self.primary == AuthProtocol::Credssp && self.claim_credssp(host) {
                                AuthState::ConfigureCredssp
                            } else {
                                AuthState::PromptFallback
                            }
                        }
                    }
                }
                AuthState::ConfigureCredssp => {
                    match self.transport.configure_credssp(host, credential).await {
                        Ok(()) => {
                            info!(host, "configured CredSSP");
                            AuthState::TestPrimary
                        }
                        Err(err) => {
                            warn!(host, error = %err, "CredSSP configuration failed");
                            last_error = Some(err);
                            AuthState::PromptFallback
                        }
                    }
                }
                AuthState::PromptFallback => {
                    match self.fallback.filter(|fallback| *fallback != self.primary) {
                        None => AuthState::Failed,
                        Some(fallback) => {
                            let reason = last_error.clone().unwrap_or_else(|| {
                                PatchError::Auth(format!("{} was rejected", self.primary))
                            });
                            if self
                                .approver
                                .approve(host, self.primary, fallback, &reason)
                                .await
                            {
                                match self.transport.connect(host, credential, fallback).await {
                                    Ok(channel) => {
                                        info!(host, protocol = %fallback, "connected with fallback protocol");
                                        return Ok(Negotiated {
                                            channel,
                                            protocol: fallback,
                                            used_fallback: true,
                                        });
                                    }
                                    Err(err) => {
                                        last_error = Some(err);
                                        AuthState::Failed
                                    }
                                }
                            } else {
                                info!(host, protocol = %fallback, "fallback protocol not approved");
                                AuthState::Failed
                            }
                        }
                    }
                }
                AuthState::Failed => {
                    let detail = last_error
                        .map(|err| err.to_string())
                        .unwrap_or_else(|| "no protocol succeeded".to_string());
                    return Err(PatchError::Auth(format!("{host}: {detail}")));
                }
            };
        }
    }

    /// True the first time a host asks; later calls in the same run get false.
    fn claim_credssp(&self, host: &str) -> bool {
        self.credssp_configured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_ascii_lowercase())
    }
}
