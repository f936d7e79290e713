use crate::{merge, patch};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum Error {
    #[error("merge error: {0}")]
    Merge(#[from] merge::Error),
    #[error("patch error: {0}")]
    Patch(#[from] patch::PatchError),
}
