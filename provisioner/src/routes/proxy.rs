use axum::extract;
use axum::response::{IntoResponse, Response};
pub use cumulus_rs::api::JsonProxiedStatus;
use std::fmt::{Debug, Formatter};

pub trait IntoProxiedResponse {
    fn into_proxied_response(self) -> Response;
}
impl<T: JsonProxiedStatus> IntoProxiedResponse for T {
    fn into_proxied_response(self) -> Response {
        let status_code = self.status_code();
        (status_code, extract::Json(self)).into_response()
    }
}

#[repr(transparent)]
pub struct ResponseProxy<R: IntoProxiedResponse>(R);
impl<T: IntoProxiedResponse> IntoResponse for ResponseProxy<T> {
    fn into_response(self) -> Response {
        self.0.into_proxied_response()
    }
}
impl<T: IntoProxiedResponse + Debug> Debug for ResponseProxy<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub fn proxy_err<E, T: IntoProxiedResponse + From<E>>(err: E) -> ResponseProxy<T> {
    ResponseProxy(T::from(err))
}

pub type Proxied<T> = Result<ResponseProxy<T>, ResponseProxy<T>>;
pub fn proxy_val<T: IntoProxiedResponse>(val: T) -> Proxied<T> {
    Ok(ResponseProxy(val))
}

/// Wrap a service result: `Ok` values through `ok`, errors through `T::from`.
pub fn proxy_with<V, E, T>(result: Result<V, E>, ok: impl FnOnce(V) -> T) -> Proxied<T>
where
    T: IntoProxiedResponse + From<E>,
{
    match result {
        Ok(v) => proxy_val(ok(v)),
        Err(e) => Err(proxy_err(e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cumulus_rs::api::clouds::terminate::Response as TerminateResponse;
    use http::StatusCode;

    struct Gone;
    impl From<Gone> for TerminateResponse {
        fn from(_: Gone) -> Self {
            TerminateResponse::NoSuchWorker
        }
    }

    fn status(proxied: Proxied<TerminateResponse>) -> StatusCode {
        match proxied {
            Ok(r) | Err(r) => r.into_response().status(),
        }
    }

    #[test]
    fn variants_carry_their_status() {
        assert_eq!(
            status(proxy_with(Ok::<(), Gone>(()), |()| TerminateResponse::Ok)),
            StatusCode::OK
        );
        let failed = proxy_with(Err::<(), _>(Gone), |()| TerminateResponse::Ok);
        assert!(failed.is_err());
        assert_eq!(status(failed), StatusCode::NOT_FOUND);
    }
}
