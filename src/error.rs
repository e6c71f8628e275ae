use thiserror::Error;

/// How an error propagates through the control loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network glitch or watch disconnect, retried with backoff.
    Transient,
    /// Optimistic concurrency failure, re-read and retry.
    Conflict,
    /// Another actor owns the resource.
    Contended,
    /// A safety predicate refused the transition.
    Unsafe,
    /// The reconcile cannot make progress without intervention.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("{0}")]
    Transient(String),

    #[error("conflicting update of {0}")]
    Conflict(String),

    #[error("{0}")]
    Contended(String),

    #[error("{0}")]
    AlreadyAttached(String),

    #[error("{0}")]
    Unsafe(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("{0}")]
    Fatal(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube(kube::Error::Api(resp)) if resp.code == 409 => ErrorKind::Conflict,
            Error::Kube(_) => ErrorKind::Transient,
            Error::Serialization(_) => ErrorKind::Fatal,
            Error::Command { .. } => ErrorKind::Transient,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Contended(_) | Error::AlreadyAttached(_) => ErrorKind::Contended,
            Error::Unsafe(_) => ErrorKind::Unsafe,
            Error::NotFound(_) => ErrorKind::Transient,
            Error::InvalidSpec(_) | Error::Fatal(_) => ErrorKind::Fatal,
            Error::Cancelled => ErrorKind::Transient,
        }
    }

    pub fn metric_label(&self) -> String {
        format!("{:?}", self.kind()).to_lowercase()
    }

    pub fn command(command: &str, args: &[String], message: impl Into<String>) -> Self {
        Error::Command {
            command: format!("{} {}", command, args.join(" ")),
            message: message.into(),
        }
    }

    /// True when the API server answered 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// True when the API server answered 409 on a create.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists")
    }
}

/// Maps a kube 404 to `None`, passing other outcomes through.
pub fn not_found_as_none<T>(result: Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        }))
    }

    #[rstest]
    #[case(api_error(409, "Conflict"), ErrorKind::Conflict)]
    #[case(api_error(500, "InternalError"), ErrorKind::Transient)]
    #[case(Error::AlreadyAttached("taken".into()), ErrorKind::Contended)]
    #[case(Error::Unsafe("no room".into()), ErrorKind::Unsafe)]
    #[case(Error::InvalidSpec("bad".into()), ErrorKind::Fatal)]
    fn kinds(#[case] error: Error, #[case] kind: ErrorKind) {
        assert_eq!(error.kind(), kind);
    }

    #[test]
    fn already_exists_is_distinct_from_conflict() {
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "Conflict").is_already_exists());
        assert!(api_error(404, "NotFound").is_not_found());
    }
}
