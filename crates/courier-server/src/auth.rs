//! Credential resolution for the server binary.

use async_trait::async_trait;
use courier_core::{AuthError, AuthResolver};
use courier_protocol::Identity;

/// Resolver for development and single-box deployments: the bearer
/// credential is a pre-issued numeric identity token.
///
/// Production deployments wire their identity service behind the same
/// [`AuthResolver`] trait.
pub struct DevTokenResolver;

#[async_trait]
impl AuthResolver for DevTokenResolver {
    async fn resolve(&self, credential: &str) -> Result<Identity, AuthError> {
        let identity: Identity = credential
            .trim()
            .parse()
            .map_err(|_| AuthError::InvalidCredential)?;

        // Zero marks server-synthesized frames and is never a valid identity.
        if identity == 0 {
            return Err(AuthError::InvalidCredential);
        }

        Ok(identity)
    }
}
