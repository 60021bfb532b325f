pub mod coord_error;

use std::io;

use thiserror::Error as ThisError;

use crate::error::coord_error::CoordError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serde_json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("coordination error: {0}")]
    CoordError(#[from] CoordError),
}

pub type Result<T> = core::result::Result<T, Error>;
