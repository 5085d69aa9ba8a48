use thiserror::Error;

/// Errors raised while validating or encoding parameter configurations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Missing value for parameter: {name}")]
    MissingValue { name: String },

    #[error("Value {value} is outside the domain of parameter {name}")]
    OutOfDomain { name: String, value: String },

    #[error("Configuration matches a forbidden combination: {clause}")]
    Forbidden { clause: String },

    #[error("Parameter {name} has a domain that cannot be encoded numerically")]
    Unencodable { name: String },

    #[error("Parameter space is empty")]
    Empty,
}

/// Result type alias for parameter-space operations
pub type SpaceResult<T> = Result<T, SpaceError>;
