//! Find-or-create resolvers, one per entity type. Every resolver returns a
//! tagged result; the orchestrator decides skip-vs-log from the tag instead
//! of nested catch fallthrough.

use thiserror::Error;
use uuid::Uuid;

use teim_core::{MatchedBy, SkipReason};
use teim_storage::StoreError;

mod companies;
mod courses;
mod users;

pub use companies::{resolve_center, resolve_company};
pub use courses::{resolve_course, resolve_group};
pub use users::{resolve_user, UserFields};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: Uuid,
    pub matched_by: MatchedBy,
}

impl Resolved {
    pub fn new(id: Uuid, matched_by: MatchedBy) -> Self {
        Self { id, matched_by }
    }
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("insufficient user data")]
    InsufficientUserData,
    #[error("user not found")]
    UserNotFound,
    #[error("company not found")]
    CompanyNotFound,
    #[error("center not found")]
    CenterNotFound,
    #[error("course not found")]
    CourseNotFound,
    #[error("group not found")]
    GroupNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolutionError {
    /// Recoverable-skip reason, or `None` for unexpected failures the
    /// orchestrator records as row errors.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            ResolutionError::InsufficientUserData => Some(SkipReason::InsufficientUserData),
            ResolutionError::UserNotFound => Some(SkipReason::UserNotFound),
            ResolutionError::CompanyNotFound => Some(SkipReason::CompanyNotFound),
            ResolutionError::CenterNotFound => Some(SkipReason::CenterNotFound),
            ResolutionError::CourseNotFound => Some(SkipReason::CourseNotFound),
            ResolutionError::GroupNotFound => Some(SkipReason::GroupNotFound),
            ResolutionError::Store(_) => None,
        }
    }
}
