/// Unified error type for the strategy core.
#[derive(Debug)]
pub enum CoreError {
    /// Non-finite or out-of-range numeric input. The offending value is
    /// rejected without mutating any state.
    InvalidInput(String),
    /// A collaborator store failed. Transient during LIVE, fatal at startup.
    Store(String),
    /// A core invariant was violated (e.g. duplicate active signal for a
    /// key). Always fatal for the engine.
    Invariant(String),
    Config(String),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid_input: {msg}"),
            Self::Store(msg) => write!(f, "store_error: {msg}"),
            Self::Invariant(msg) => write!(f, "invariant_violation: {msg}"),
            Self::Config(msg) => write!(f, "config_error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_yaml::Error> for CoreError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(format!("invalid YAML: {e}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
