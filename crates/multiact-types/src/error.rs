use thiserror::Error;

/// Errors raised while constructing nodes.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(
        "invalid node name '{0}': use ASCII letters, digits and '_', not starting with a digit"
    )]
    InvalidName(String),

    #[error("{kind} node '{name}' cannot carry path data")]
    PathsNotAllowed { name: String, kind: String },
}
