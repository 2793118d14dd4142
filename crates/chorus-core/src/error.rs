use thiserror::Error;

use crate::agent::RuntimeError;
use crate::router::RouterError;
use crate::team::TeamError;
use crate::workspace::DefinitionError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Team(#[from] TeamError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
