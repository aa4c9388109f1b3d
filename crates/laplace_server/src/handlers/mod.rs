#![forbid(unsafe_code)]

pub mod auth;
pub mod relay;
pub mod rooms;

use laplace_domain::AuthContext;
use laplace_store::AuthError;

use crate::dispatch::RequestBody;
use crate::services::Services;

/// Signature check shared by the authenticated handlers. Internal
/// callers pass by construction; external callers are verified against
/// their token and the signed body bytes.
///
/// Returns the application-level rejection, or propagates store failures
/// as server errors.
pub(crate) async fn verify_request(
	svc: &Services,
	auth: &AuthContext,
	body: &RequestBody<'_>,
) -> anyhow::Result<Result<(), AuthError>> {
	match auth {
		AuthContext::Internal => Ok(Ok(())),
		AuthContext::External { user_id, sig } => {
			match svc.auth.verify_signature(user_id, sig, body.signed_bytes()).await {
				Ok(()) => Ok(Ok(())),
				Err(AuthError::Store(e)) => Err(e.into()),
				Err(e) => Ok(Err(e)),
			}
		}
	}
}
