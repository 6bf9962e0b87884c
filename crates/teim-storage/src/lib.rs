//! Entity store traits + memory/Postgres backends for TEIM.
//!
//! The reconciliation engine treats persistence as a black box: per-entity
//! stores exposing `find_all(filter)` / `find_by_id` / `create` / `update`.
//! Every store call is atomic; `set_main_exclusive` is the only write that
//! touches multiple rows and it runs inside a single transaction.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use teim_core::{
    Affiliation, Center, Company, Course, Enrollment, Group, NewAffiliation, NewCenter, NewCompany,
    NewCourse, NewEnrollment, NewGroup, NewUser, User,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

pub const CRATE_NAME: &str = "teim-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Database(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflicting write: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserFilter {
    pub dni: Option<String>,
    pub nss: Option<String>,
    pub external_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompanyFilter {
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CenterFilter {
    pub company_id: Option<Uuid>,
    pub import_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CourseFilter {
    pub external_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupFilter {
    pub external_id: Option<i64>,
    pub course_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AffiliationFilter {
    pub user_id: Option<Uuid>,
    pub center_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrollmentFilter {
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_all(&self, filter: UserFilter) -> Result<Vec<User>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn create(&self, new: NewUser) -> Result<User, StoreError>;
    async fn update(&self, user: &User) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CompanyStore: Send + Sync {
    async fn find_all(&self, filter: CompanyFilter) -> Result<Vec<Company>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Company>, StoreError>;
    async fn create(&self, new: NewCompany) -> Result<Company, StoreError>;
    async fn update(&self, company: &Company) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CenterStore: Send + Sync {
    async fn find_all(&self, filter: CenterFilter) -> Result<Vec<Center>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Center>, StoreError>;
    async fn create(&self, new: NewCenter) -> Result<Center, StoreError>;
    async fn update(&self, center: &Center) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn find_all(&self, filter: CourseFilter) -> Result<Vec<Course>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Course>, StoreError>;
    async fn create(&self, new: NewCourse) -> Result<Course, StoreError>;
    async fn update(&self, course: &Course) -> Result<(), StoreError>;
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn find_all(&self, filter: GroupFilter) -> Result<Vec<Group>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Group>, StoreError>;
    async fn create(&self, new: NewGroup) -> Result<Group, StoreError>;
    async fn update(&self, group: &Group) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AffiliationStore: Send + Sync {
    async fn find_all(&self, filter: AffiliationFilter) -> Result<Vec<Affiliation>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Affiliation>, StoreError>;
    async fn create(&self, new: NewAffiliation) -> Result<Affiliation, StoreError>;
    async fn update(&self, affiliation: &Affiliation) -> Result<(), StoreError>;

    /// Flag one affiliation as main and clear the flag on every other
    /// affiliation of the same user, atomically.
    async fn set_main_exclusive(
        &self,
        user_id: Uuid,
        affiliation_id: Uuid,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn find_all(&self, filter: EnrollmentFilter) -> Result<Vec<Enrollment>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError>;
    async fn create(&self, new: NewEnrollment) -> Result<Enrollment, StoreError>;
    async fn update(&self, enrollment: &Enrollment) -> Result<(), StoreError>;
}

/// Aggregate seam the engine runs against. Both backends implement every
/// store trait directly, so the accessors are plain self-casts.
pub trait Backend: Send + Sync {
    fn users(&self) -> &dyn UserStore;
    fn companies(&self) -> &dyn CompanyStore;
    fn centers(&self) -> &dyn CenterStore;
    fn courses(&self) -> &dyn CourseStore;
    fn groups(&self) -> &dyn GroupStore;
    fn affiliations(&self) -> &dyn AffiliationStore;
    fn enrollments(&self) -> &dyn EnrollmentStore;
}
