//! Shared-secret second factor
//!
//! Every RPC carries the fleet secret in the `x-svman-secret` metadata entry.
//! Servers reject a missing or different value with `Unauthenticated`,
//! which callers can tell apart from transport failures.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use svman_common::SECRET_METADATA_KEY;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::warn;
use zeroize::Zeroizing;

/// Fleet-wide shared secret
#[derive(Clone)]
pub struct SharedSecret(Arc<Zeroizing<String>>);

impl SharedSecret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::new(Zeroizing::new(value.into())))
    }

    /// The raw secret
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Whether the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn matches(&self, candidate: &[u8]) -> bool {
        // Length leaks, contents don't
        self.0.as_bytes().ct_eq(candidate).into()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([redacted])")
    }
}

/// Client interceptor that attaches the secret to outgoing requests
#[derive(Clone)]
pub struct AttachSecret {
    value: Option<MetadataValue<Ascii>>,
}

impl AttachSecret {
    /// Build from a secret
    ///
    /// A secret that is not valid ASCII metadata is sent as nothing, so the
    /// peer answers `Unauthenticated` instead of the request failing locally.
    pub fn new(secret: &SharedSecret) -> Self {
        let value = MetadataValue::try_from(secret.expose()).ok();
        if value.is_none() {
            warn!("shared secret is not valid ASCII metadata; requests will be rejected");
        }
        Self { value }
    }
}

impl Interceptor for AttachSecret {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(value) = &self.value {
            request
                .metadata_mut()
                .insert(SECRET_METADATA_KEY, value.clone());
        }
        Ok(request)
    }
}

/// Server interceptor that rejects requests without the right secret
#[derive(Clone)]
pub struct RequireSecret {
    secret: SharedSecret,
}

impl RequireSecret {
    /// Build from the expected secret
    pub fn new(secret: SharedSecret) -> Self {
        Self { secret }
    }
}

impl Interceptor for RequireSecret {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        match request.metadata().get(SECRET_METADATA_KEY) {
            Some(value) if self.secret.matches(value.as_bytes()) => Ok(request),
            Some(_) => {
                warn!(remote = ?request.remote_addr(), "rejected request: invalid shared secret");
                Err(Status::unauthenticated("invalid shared secret"))
            }
            None => {
                warn!(remote = ?request.remote_addr(), "rejected request: missing shared secret");
                Err(Status::unauthenticated("missing shared secret"))
            }
        }
    }
}

/// Wrap a generated server so every call is checked for the secret
pub fn require_secret<S>(service: S, secret: &SharedSecret) -> InterceptedService<S, RequireSecret> {
    InterceptedService::new(service, RequireSecret::new(secret.clone()))
}
