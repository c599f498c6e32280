use thiserror::Error;

/// Validation failure at the boundary: nothing has been written when this is
/// returned, and the API surfaces it as a 400.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SchemaError(pub String);

impl SchemaError {
    pub fn new<S: Into<String>>(msg: S) -> Self {
        SchemaError(msg.into())
    }
}

/// Whether the error chain bottoms out in a SQLite uniqueness or foreign key
/// violation. The API surfaces those as a 409.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(f, _))
                if f.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}
