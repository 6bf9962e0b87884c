//! In-memory backend used by tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use teim_core::{
    Affiliation, Center, Company, Course, Enrollment, Group, NewAffiliation, NewCenter, NewCompany,
    NewCourse, NewEnrollment, NewGroup, NewUser, User,
};

use crate::{
    AffiliationFilter, AffiliationStore, Backend, CenterFilter, CenterStore, CompanyFilter,
    CompanyStore, CourseFilter, CourseStore, EnrollmentFilter, EnrollmentStore, GroupFilter,
    GroupStore, StoreError, UserFilter, UserStore,
};

#[derive(Debug, Default)]
struct State {
    users: HashMap<Uuid, User>,
    companies: HashMap<Uuid, Company>,
    centers: HashMap<Uuid, Center>,
    courses: HashMap<Uuid, Course>,
    groups: HashMap<Uuid, Group>,
    affiliations: HashMap<Uuid, Affiliation>,
    enrollments: HashMap<Uuid, Enrollment>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn users(&self) -> &dyn UserStore {
        self
    }
    fn companies(&self) -> &dyn CompanyStore {
        self
    }
    fn centers(&self) -> &dyn CenterStore {
        self
    }
    fn courses(&self) -> &dyn CourseStore {
        self
    }
    fn groups(&self) -> &dyn GroupStore {
        self
    }
    fn affiliations(&self) -> &dyn AffiliationStore {
        self
    }
    fn enrollments(&self) -> &dyn EnrollmentStore {
        self
    }
}

#[async_trait]
impl UserStore for MemoryBackend {
    async fn find_all(&self, filter: UserFilter) -> Result<Vec<User>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<User> = state
            .users
            .values()
            .filter(|u| filter.dni.as_deref().is_none_or(|d| u.dni.as_deref() == Some(d)))
            .filter(|u| filter.nss.as_deref().is_none_or(|n| u.nss.as_deref() == Some(n)))
            .filter(|u| filter.external_id.is_none_or(|e| u.external_id == Some(e)))
            .cloned()
            .collect();
        out.sort_by_key(|u| u.created_at);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            name: new.name,
            surname1: new.surname1,
            surname2: new.surname2,
            dni: new.dni,
            nss: new.nss,
            external_id: new.external_id,
            email: new.email,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().await.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update(&self, user: &User) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state.users.get_mut(&user.id).ok_or(StoreError::NotFound("user"))?;
        *slot = User {
            updated_at: Utc::now(),
            ..user.clone()
        };
        Ok(())
    }
}

#[async_trait]
impl CompanyStore for MemoryBackend {
    async fn find_all(&self, filter: CompanyFilter) -> Result<Vec<Company>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Company> = state
            .companies
            .values()
            .filter(|c| filter.tax_id.as_deref().is_none_or(|t| c.tax_id == t))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Company>, StoreError> {
        Ok(self.state.lock().await.companies.get(&id).cloned())
    }

    async fn create(&self, new: NewCompany) -> Result<Company, StoreError> {
        let now = Utc::now();
        let company = Company {
            id: Uuid::new_v4(),
            tax_id: new.tax_id,
            name: new.name,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .companies
            .insert(company.id, company.clone());
        Ok(company)
    }

    async fn update(&self, company: &Company) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .companies
            .get_mut(&company.id)
            .ok_or(StoreError::NotFound("company"))?;
        *slot = Company {
            updated_at: Utc::now(),
            ..company.clone()
        };
        Ok(())
    }
}

#[async_trait]
impl CenterStore for MemoryBackend {
    async fn find_all(&self, filter: CenterFilter) -> Result<Vec<Center>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Center> = state
            .centers
            .values()
            .filter(|c| filter.company_id.is_none_or(|id| c.company_id == id))
            .filter(|c| {
                filter
                    .import_key
                    .as_deref()
                    .is_none_or(|k| c.import_key.as_deref() == Some(k))
            })
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Center>, StoreError> {
        Ok(self.state.lock().await.centers.get(&id).cloned())
    }

    async fn create(&self, new: NewCenter) -> Result<Center, StoreError> {
        let now = Utc::now();
        let center = Center {
            id: Uuid::new_v4(),
            company_id: new.company_id,
            name: new.name,
            import_key: new.import_key,
            employer_number: new.employer_number,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .centers
            .insert(center.id, center.clone());
        Ok(center)
    }

    async fn update(&self, center: &Center) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .centers
            .get_mut(&center.id)
            .ok_or(StoreError::NotFound("center"))?;
        *slot = Center {
            updated_at: Utc::now(),
            ..center.clone()
        };
        Ok(())
    }
}

#[async_trait]
impl CourseStore for MemoryBackend {
    async fn find_all(&self, filter: CourseFilter) -> Result<Vec<Course>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Course> = state
            .courses
            .values()
            .filter(|c| filter.external_id.is_none_or(|e| c.external_id == Some(e)))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Course>, StoreError> {
        Ok(self.state.lock().await.courses.get(&id).cloned())
    }

    async fn create(&self, new: NewCourse) -> Result<Course, StoreError> {
        let now = Utc::now();
        let course = Course {
            id: Uuid::new_v4(),
            external_id: new.external_id,
            name: new.name,
            description: new.description,
            hours: new.hours,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .courses
            .insert(course.id, course.clone());
        Ok(course)
    }

    async fn update(&self, course: &Course) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .courses
            .get_mut(&course.id)
            .ok_or(StoreError::NotFound("course"))?;
        *slot = Course {
            updated_at: Utc::now(),
            ..course.clone()
        };
        Ok(())
    }
}

#[async_trait]
impl GroupStore for MemoryBackend {
    async fn find_all(&self, filter: GroupFilter) -> Result<Vec<Group>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Group> = state
            .groups
            .values()
            .filter(|g| filter.external_id.is_none_or(|e| g.external_id == Some(e)))
            .filter(|g| filter.course_id.is_none_or(|c| g.course_id == Some(c)))
            .cloned()
            .collect();
        out.sort_by_key(|g| g.created_at);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        Ok(self.state.lock().await.groups.get(&id).cloned())
    }

    async fn create(&self, new: NewGroup) -> Result<Group, StoreError> {
        let now = Utc::now();
        let group = Group {
            id: Uuid::new_v4(),
            external_id: new.external_id,
            name: new.name,
            course_id: new.course_id,
            start_date: new.start_date,
            end_date: new.end_date,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().await.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn update(&self, group: &Group) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .groups
            .get_mut(&group.id)
            .ok_or(StoreError::NotFound("group"))?;
        *slot = Group {
            updated_at: Utc::now(),
            ..group.clone()
        };
        Ok(())
    }
}

#[async_trait]
impl AffiliationStore for MemoryBackend {
    async fn find_all(&self, filter: AffiliationFilter) -> Result<Vec<Affiliation>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Affiliation> = state
            .affiliations
            .values()
            .filter(|a| filter.user_id.is_none_or(|u| a.user_id == u))
            .filter(|a| filter.center_id.is_none_or(|c| a.center_id == c))
            .cloned()
            .collect();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Affiliation>, StoreError> {
        Ok(self.state.lock().await.affiliations.get(&id).cloned())
    }

    async fn create(&self, new: NewAffiliation) -> Result<Affiliation, StoreError> {
        let now = Utc::now();
        let affiliation = Affiliation {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            center_id: new.center_id,
            start_date: new.start_date,
            end_date: new.end_date,
            is_main: new.is_main,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .affiliations
            .insert(affiliation.id, affiliation.clone());
        Ok(affiliation)
    }

    async fn update(&self, affiliation: &Affiliation) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .affiliations
            .get_mut(&affiliation.id)
            .ok_or(StoreError::NotFound("affiliation"))?;
        *slot = Affiliation {
            updated_at: Utc::now(),
            ..affiliation.clone()
        };
        Ok(())
    }

    async fn set_main_exclusive(
        &self,
        user_id: Uuid,
        affiliation_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.affiliations.contains_key(&affiliation_id) {
            return Err(StoreError::NotFound("affiliation"));
        }
        let now = Utc::now();
        for affiliation in state.affiliations.values_mut() {
            if affiliation.user_id != user_id {
                continue;
            }
            let main = affiliation.id == affiliation_id;
            if affiliation.is_main != main {
                affiliation.is_main = main;
                affiliation.updated_at = now;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EnrollmentStore for MemoryBackend {
    async fn find_all(&self, filter: EnrollmentFilter) -> Result<Vec<Enrollment>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| filter.user_id.is_none_or(|u| e.user_id == u))
            .filter(|e| filter.course_id.is_none_or(|c| e.course_id == c))
            .filter(|e| filter.group_id.is_none_or(|g| e.group_id == Some(g)))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.state.lock().await.enrollments.get(&id).cloned())
    }

    async fn create(&self, new: NewEnrollment) -> Result<Enrollment, StoreError> {
        let now = Utc::now();
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            course_id: new.course_id,
            group_id: new.group_id,
            progress_pct: new.progress_pct,
            time_spent_secs: new.time_spent_secs,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .enrollments
            .insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    async fn update(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .enrollments
            .get_mut(&enrollment.id)
            .ok_or(StoreError::NotFound("enrollment"))?;
        *slot = Enrollment {
            updated_at: Utc::now(),
            ..enrollment.clone()
        };
        Ok(())
    }
}
