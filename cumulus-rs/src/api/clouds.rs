pub mod list {
    use crate::api::{CloudSummary, JsonProxiedStatus};
    use http::StatusCode;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        Ok { clouds: Vec<CloudSummary> },
        /// Caller lacks `read`.
        Unauthorized,
    }
    impl JsonProxiedStatus for Response {
        fn status_code(&self) -> StatusCode {
            match self {
                Response::Ok { .. } => StatusCode::OK,
                Response::Unauthorized => StatusCode::FORBIDDEN,
            }
        }
    }
}

pub mod test_connection {
    use crate::api::{FormValidation, JsonProxiedStatus};
    use http::StatusCode;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Request {
        #[serde(default)]
        pub zone: Option<String>,
        #[serde(default)]
        pub end_point_url: Option<String>,
        #[serde(default)]
        pub identity: Option<String>,
        #[serde(default)]
        pub credential: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        /// The validation ran; its verdict may still be a warning or an error.
        Ok { validation: FormValidation },
        /// Caller lacks `configure`.
        Unauthorized,
    }
    impl JsonProxiedStatus for Response {
        fn status_code(&self) -> StatusCode {
            match self {
                Response::Ok { .. } => StatusCode::OK,
                Response::Unauthorized => StatusCode::FORBIDDEN,
            }
        }
    }
}

pub mod provision {
    use crate::api::{JsonProxiedStatus, WorkerDescriptor};
    use http::StatusCode;
    use serde::{Deserialize, Serialize};

    /// Names a template outright, or asks for any template serving `label`.
    /// With neither, only templates without labels qualify.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub template: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub label: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        Ok { worker: WorkerDescriptor },
        /// Caller lacks `provision` (or `configure`) on the cloud.
        Unauthorized,
        NoSuchCloud,
        /// The named template does not exist, or none serves the label.
        NoSuchTemplate,
        /// The cloud or template instance cap has been reached.
        CapReached { message: String },
        /// The request could not be carried out (bad options, missing
        /// credentials record, unparsable label).
        Invalid { message: String },
        /// OpenStack failed to create a usable server in time.
        Failed { message: String },
    }
    impl From<crate::label::LabelParseError> for Response {
        fn from(value: crate::label::LabelParseError) -> Self {
            Response::Invalid {
                message: value.to_string(),
            }
        }
    }
    impl JsonProxiedStatus for Response {
        fn status_code(&self) -> StatusCode {
            match self {
                Response::Ok { .. } => StatusCode::OK,
                Response::Unauthorized => StatusCode::FORBIDDEN,
                Response::NoSuchCloud | Response::NoSuchTemplate => StatusCode::NOT_FOUND,
                Response::CapReached { .. } => StatusCode::CONFLICT,
                Response::Invalid { .. } => StatusCode::BAD_REQUEST,
                Response::Failed { .. } => StatusCode::BAD_GATEWAY,
            }
        }
    }
}

pub mod workers {
    use crate::api::{JsonProxiedStatus, WorkerServer};
    use http::StatusCode;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        Ok { workers: Vec<WorkerServer> },
        Unauthorized,
        NoSuchCloud,
        Failed { message: String },
    }
    impl JsonProxiedStatus for Response {
        fn status_code(&self) -> StatusCode {
            match self {
                Response::Ok { .. } => StatusCode::OK,
                Response::Unauthorized => StatusCode::FORBIDDEN,
                Response::NoSuchCloud => StatusCode::NOT_FOUND,
                Response::Failed { .. } => StatusCode::BAD_GATEWAY,
            }
        }
    }
}

pub mod terminate {
    use crate::api::JsonProxiedStatus;
    use http::StatusCode;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Response {
        Ok,
        Unauthorized,
        NoSuchCloud,
        /// No server with that id belongs to the cloud.
        NoSuchWorker,
        Failed { message: String },
    }
    impl JsonProxiedStatus for Response {
        fn status_code(&self) -> StatusCode {
            match self {
                Response::Ok => StatusCode::OK,
                Response::Unauthorized => StatusCode::FORBIDDEN,
                Response::NoSuchCloud | Response::NoSuchWorker => StatusCode::NOT_FOUND,
                Response::Failed { .. } => StatusCode::BAD_GATEWAY,
            }
        }
    }
}
