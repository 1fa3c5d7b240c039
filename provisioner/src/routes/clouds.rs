use crate::auth::extract::AuthSource;
use crate::auth::AuthorizationSource;
use crate::impl_from_auth_err;
use crate::perms;
use crate::provision::ProvisionError;
use crate::routes::proxy::{proxy_err, proxy_val, proxy_with, Proxied};
use crate::serve::AppState;
use axum::extract::{Path, State};
use axum::Json;
use cumulus_rs::api::clouds::list::Response as LCResponse;
use cumulus_rs::api::clouds::provision::{Request as PRequest, Response as PResponse};
use cumulus_rs::api::clouds::terminate::Response as TResponse;
use cumulus_rs::api::clouds::test_connection::{Request as TCRequest, Response as TCResponse};
use cumulus_rs::api::clouds::workers::Response as WResponse;
use cumulus_rs::label::LabelExpression;
use cumulus_rs::util::non_blank_str;

/// Anything a route cannot name precisely is reported as an upstream failure.
fn failure(e: ProvisionError) -> String {
    tracing::error!("request failed: {e}");
    e.to_string()
}

// -- list

impl_from_auth_err!(LCResponse, Unauthorized => Unauthorized);

#[tracing::instrument(skip(state, auth))]
pub async fn list(State(state): State<AppState>, AuthSource(auth): AuthSource) -> Proxied<LCResponse> {
    proxy_with(state.provisioner().list_clouds(&auth).await, |clouds| {
        LCResponse::Ok { clouds }
    })
}

// -- test_connection

impl_from_auth_err!(TCResponse, Unauthorized => Unauthorized);

#[tracing::instrument(skip(state, auth, request))]
pub async fn test_connection(
    State(state): State<AppState>,
    AuthSource(auth): AuthSource,
    Json(request): Json<TCRequest>,
) -> Proxied<TCResponse> {
    auth.authorize(perms::TestConnection).map_err(proxy_err)?;
    let validation = state
        .provisioner()
        .test_connection(
            request.zone.as_deref(),
            request.end_point_url.as_deref(),
            request.identity.as_deref(),
            request.credential.as_deref(),
        )
        .await;
    proxy_val(TCResponse::Ok { validation })
}

// -- provision

impl From<ProvisionError> for PResponse {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::Unauthorized(_) => PResponse::Unauthorized,
            ProvisionError::NoSuchCloud(_) => PResponse::NoSuchCloud,
            ProvisionError::NoSuchTemplate { .. } | ProvisionError::NoTemplateForLabel { .. } => {
                PResponse::NoSuchTemplate
            }
            e @ (ProvisionError::CloudCapReached { .. }
            | ProvisionError::TemplateCapReached { .. }) => PResponse::CapReached {
                message: e.to_string(),
            },
            e @ ProvisionError::Invalid { .. } => PResponse::Invalid {
                message: e.to_string(),
            },
            other => PResponse::Failed {
                message: failure(other),
            },
        }
    }
}

#[tracing::instrument(skip(state, auth))]
pub async fn provision(
    State(state): State<AppState>,
    AuthSource(auth): AuthSource,
    Path(cloud): Path<String>,
    Json(request): Json<PRequest>,
) -> Proxied<PResponse> {
    let provisioner = state.provisioner();
    let result = match request.template {
        Some(_) if request.label.is_some() => {
            return proxy_val(PResponse::Invalid {
                message: "give either a template or a label, not both".to_string(),
            })
        }
        Some(template) => provisioner.provision(&auth, &cloud, &template).await,
        None => {
            let label = non_blank_str(request.label.as_deref())
                .map(str::parse::<LabelExpression>)
                .transpose()
                .map_err(proxy_err)?;
            provisioner
                .provision_for_label(&auth, &cloud, label.as_ref())
                .await
        }
    };
    proxy_with(result, |worker| PResponse::Ok { worker })
}

// -- workers

impl From<ProvisionError> for WResponse {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::Unauthorized(_) => WResponse::Unauthorized,
            ProvisionError::NoSuchCloud(_) => WResponse::NoSuchCloud,
            other => WResponse::Failed {
                message: failure(other),
            },
        }
    }
}

#[tracing::instrument(skip(state, auth))]
pub async fn workers(
    State(state): State<AppState>,
    AuthSource(auth): AuthSource,
    Path(cloud): Path<String>,
) -> Proxied<WResponse> {
    proxy_with(
        state.provisioner().workers(&auth, &cloud).await,
        |workers| WResponse::Ok { workers },
    )
}

// -- terminate

impl From<ProvisionError> for TResponse {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::Unauthorized(_) => TResponse::Unauthorized,
            ProvisionError::NoSuchCloud(_) => TResponse::NoSuchCloud,
            ProvisionError::NoSuchWorker { .. } => TResponse::NoSuchWorker,
            other => TResponse::Failed {
                message: failure(other),
            },
        }
    }
}

#[tracing::instrument(skip(state, auth))]
pub async fn terminate(
    State(state): State<AppState>,
    AuthSource(auth): AuthSource,
    Path((cloud, server_id)): Path<(String, String)>,
) -> Proxied<TResponse> {
    proxy_with(
        state
            .provisioner()
            .terminate(&auth, &cloud, &server_id)
            .await,
        |()| TResponse::Ok,
    )
}
