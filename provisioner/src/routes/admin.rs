use crate::auth::extract::AuthSource;
use crate::impl_from_auth_err;
use crate::routes::proxy::{proxy_err, proxy_val, Proxied};
use crate::serve::AppState;
use axum::extract::State;
use cumulus_rs::api::admin::invalidate_clients::Response as ICResponse;

impl_from_auth_err!(ICResponse, Unauthorized => Unauthorized);

#[tracing::instrument(skip(state, auth))]
pub async fn invalidate_clients(
    State(state): State<AppState>,
    AuthSource(auth): AuthSource,
) -> Proxied<ICResponse> {
    state
        .provisioner()
        .invalidate_clients(&auth)
        .map_err(proxy_err)?;
    proxy_val(ICResponse::Ok)
}
