use thiserror::Error;

pub type Result<T> = std::result::Result<T, InteropError>;

#[derive(Debug, Error)]
pub enum InteropError {
    #[error(transparent)]
    Cdata(#[from] arrow_cdata::Error),

    #[error("no host conversion for {0} arrays")]
    UnsupportedType(String),

    #[error("array lives on {0}; only host arrays can be materialized")]
    NotHostResident(String),

    #[error("invalid value for {key}: '{value}'")]
    Config { key: String, value: String },

    #[error("registry token {0} is not preserved")]
    UnknownToken(u64),

    #[error("registry has been shut down")]
    ShutDown,
}
