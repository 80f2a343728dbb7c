use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Transient failures are worth retrying for single-field mutations.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Store(_)
                | Error::Session(_)
                | Error::Tmux(_)
                | Error::Timeout(_)
                | Error::TaskJoin(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
