use snafu::Snafu;

use crate::message::{MessageId, MessageStatus};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Conflict: {message}"))]
    Conflict { message: String },

    #[snafu(display("Lease on message {id} is no longer held"))]
    LeaseLost { id: MessageId },

    #[snafu(display("Scheduler is already running"))]
    AlreadyRunning,

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn message_not_found(id: MessageId) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// A manual action was attempted on a message whose status forbids it.
    pub fn invalid_transition(id: MessageId, action: &str, status: MessageStatus) -> Self {
        Self::Conflict {
            message: format!("cannot {action} message {id} in status {status}"),
        }
    }

    /// A manual action raced with an in-flight delivery attempt.
    pub fn in_flight(id: MessageId) -> Self {
        Self::Conflict {
            message: format!("message {id} is being delivered"),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Whether the error is contained to one message rather than the store as a whole.
    pub fn is_per_message(&self) -> bool {
        matches!(self, Self::LeaseLost { .. } | Self::Conflict { .. })
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::Conflict { .. } | Self::LeaseLost { .. } | Self::AlreadyRunning => {
                actix_web::http::StatusCode::CONFLICT
            }

            Self::InvalidParameter { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::MigrationError { .. }
            | Self::InternalServerError { .. }
            | Self::Sqlx { .. }
            | Self::Whatever { .. } => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
