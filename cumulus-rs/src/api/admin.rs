pub mod invalidate_clients {
    use crate::api::JsonProxiedStatus;
    use http::StatusCode;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        Ok,
        Unauthorized,
    }
    impl JsonProxiedStatus for Response {
        fn status_code(&self) -> StatusCode {
            match self {
                Response::Ok => StatusCode::OK,
                Response::Unauthorized => StatusCode::FORBIDDEN,
            }
        }
    }
}
