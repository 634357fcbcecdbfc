/// Errors that can occur within the scoring layer.
#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("invalid scorer configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown scoring policy: {0}")]
    UnknownPolicy(String),
}
