/// Core error type.
///
/// `Display` is the internal diagnostic (logged); `user_message()` is the sanitized
/// text that may be sent back to the chat. Adapter crates map their library errors
/// into `Storage` / `Transport` / `Conflict` so the ingestion loop can decide whether
/// an update is handled or must be redelivered.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation failed: {internal}")]
    Validation { internal: String, user: String },

    #[error("identity {provider}:{provider_user_id} is not linked to any account")]
    Unregistered {
        provider: String,
        provider_user_id: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("link code expired: {0}")]
    Expired(String),

    #[error("identity {provider}:{provider_user_id} is already linked")]
    AlreadyLinked {
        provider: String,
        provider_user_id: String,
    },

    #[error("uniqueness conflict: {0}")]
    Conflict(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tag for an [`Error`], stable across the internal diagnostic text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    Unregistered,
    NotFound,
    Expired,
    AlreadyLinked,
    Conflict,
    UnknownCommand,
    Storage,
    Transport,
}

impl Error {
    /// Validation failure with distinct internal and user-facing text.
    pub fn validation(internal: impl Into<String>, user: impl Into<String>) -> Self {
        Error::Validation {
            internal: internal.into(),
            user: user.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Unregistered { .. } => ErrorKind::Unregistered,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Expired(_) => ErrorKind::Expired,
            Error::AlreadyLinked { .. } => ErrorKind::AlreadyLinked,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::UnknownCommand(_) => ErrorKind::UnknownCommand,
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Storage,
            Error::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Faults that leave the update unacknowledged so it is redelivered.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage | ErrorKind::Transport)
    }

    /// Sanitized text safe to show in chat. Never contains store or transport detail.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { user, .. } => user.clone(),
            Error::Unregistered { .. } => {
                "You need to link your account through the platform before using this bot."
                    .to_string()
            }
            Error::NotFound(_) => {
                "Invalid link code. Please generate a new one from Settings.".to_string()
            }
            Error::Expired(_) => {
                "This link code has expired. Please generate a new one from Settings.".to_string()
            }
            Error::AlreadyLinked { .. } => "Your account is already linked.".to_string(),
            Error::UnknownCommand(name) => {
                format!("Unknown command '!{name}'. Send !help for the list of commands.")
            }
            Error::Conflict(_)
            | Error::Config(_)
            | Error::Storage(_)
            | Error::Transport(_)
            | Error::Io(_)
            | Error::Json(_) => "Something went wrong on our side. Please try again later.".to_string(),
        }
    }
}

/// Tagged failure record: what went wrong, for whom.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub internal: String,
    pub message: String,
}

impl From<&Error> for Failure {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            internal: e.to_string(),
            message: e.user_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_hides_storage_detail() {
        let e = Error::Storage("UNIQUE constraint failed: transactions.hash at /var/db".into());
        assert!(!e.user_message().contains("/var/db"));
        assert!(e.to_string().contains("/var/db"));
        assert!(e.is_retryable());
    }

    #[test]
    fn validation_keeps_internal_and_user_text_apart() {
        let e = Error::validation("amount token 'abc' is not a number", "Start with an amount.");
        let f = Failure::from(&e);
        assert_eq!(f.kind, ErrorKind::Validation);
        assert_eq!(f.message, "Start with an amount.");
        assert!(f.internal.contains("abc"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn expired_and_not_found_have_distinct_messages() {
        let a = Error::NotFound("ABC".into()).user_message();
        let b = Error::Expired("ABC".into()).user_message();
        assert_ne!(a, b);
    }
}
