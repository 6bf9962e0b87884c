//! Per-run identity caches. Warmed once from the store, then extended with
//! everything the run itself resolves or creates.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use uuid::Uuid;

use teim_core::normalize::fold_name;
use teim_core::{Center, Course, Group, User};
use teim_storage::{
    Backend, CenterFilter, CompanyFilter, CourseFilter, GroupFilter, StoreError, UserFilter,
};

/// Two-layer index: entities already in the store, plus entities seen during
/// this run. The run layer is consulted first, so two CSV rows referring to
/// the same not-yet-persisted entity resolve consistently.
#[derive(Debug, Default)]
pub struct IdentityIndex<K: Eq + Hash> {
    existing: HashMap<K, Uuid>,
    seen: HashMap<K, Uuid>,
}

impl<K: Eq + Hash> IdentityIndex<K> {
    pub fn get(&self, key: &K) -> Option<Uuid> {
        self.seen
            .get(key)
            .or_else(|| self.existing.get(key))
            .copied()
    }

    pub fn get_seen(&self, key: &K) -> Option<Uuid> {
        self.seen.get(key).copied()
    }

    pub fn get_existing(&self, key: &K) -> Option<Uuid> {
        self.existing.get(key).copied()
    }

    /// Record an entity resolved or created during this run.
    pub fn note(&mut self, key: K, id: Uuid) {
        self.seen.insert(key, id);
    }

    /// Load a store-backed entity at warm-up time.
    pub fn load(&mut self, key: K, id: Uuid) {
        self.existing.insert(key, id);
    }
}

/// Everything the center resolver needs to scan candidates without going back
/// to the store per row.
#[derive(Debug, Clone)]
pub struct CenterInfo {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub folded_name: String,
    pub employer_number: Option<String>,
    /// False for centers created during this run.
    pub preexisting: bool,
}

#[derive(Default)]
pub struct ImportContext {
    pub users_by_nss: IdentityIndex<String>,
    pub users_by_dni: IdentityIndex<String>,
    pub users_by_external: IdentityIndex<i64>,
    pub users_by_name: IdentityIndex<String>,
    /// Raw full names for the last-resort case-insensitive scan.
    pub user_names: HashMap<Uuid, String>,

    pub companies_by_tax: IdentityIndex<String>,

    pub centers_by_import_key: IdentityIndex<String>,
    pub centers_by_name: IdentityIndex<(Uuid, String)>,
    pub centers: HashMap<Uuid, CenterInfo>,

    pub courses_by_external: IdentityIndex<i64>,
    pub courses_by_name: IdentityIndex<String>,
    pub groups_by_external: IdentityIndex<i64>,
    pub groups_by_name: IdentityIndex<(Option<Uuid>, String)>,

    /// Import keys with a creation in flight. Sequential row processing makes
    /// this a plain set rather than a lock.
    pub pending_centers: HashSet<String>,
    /// Folded center names observed per (company, employer number) this run;
    /// a second distinct name makes that employer number ambiguous.
    pub employer_names_seen: HashMap<(Uuid, String), HashSet<String>>,
}

impl ImportContext {
    /// Build the caches from a full store scan. Called once per run.
    pub async fn warm(backend: &dyn Backend) -> Result<Self, StoreError> {
        let mut ctx = Self::default();

        for user in backend.users().find_all(UserFilter::default()).await? {
            ctx.load_user(&user);
        }
        for company in backend
            .companies()
            .find_all(CompanyFilter::default())
            .await?
        {
            ctx.companies_by_tax.load(company.tax_id.clone(), company.id);
        }
        for center in backend.centers().find_all(CenterFilter::default()).await? {
            ctx.load_center(&center);
        }
        for course in backend.courses().find_all(CourseFilter::default()).await? {
            ctx.load_course(&course);
        }
        for group in backend.groups().find_all(GroupFilter::default()).await? {
            ctx.load_group(&group);
        }
        // Affiliations are not indexed; the associate phase works per-user
        // through the store directly.

        Ok(ctx)
    }

    fn load_user(&mut self, user: &User) {
        if let Some(nss) = &user.nss {
            self.users_by_nss.load(nss.clone(), user.id);
        }
        if let Some(dni) = &user.dni {
            self.users_by_dni.load(dni.clone(), user.id);
        }
        if let Some(external_id) = user.external_id {
            self.users_by_external.load(external_id, user.id);
        }
        if let Some(folded) = fold_name(&user.full_name()) {
            self.users_by_name.load(folded, user.id);
        }
        self.user_names.insert(user.id, user.full_name());
    }

    fn load_center(&mut self, center: &Center) {
        let folded = fold_name(&center.name).unwrap_or_default();
        if let Some(key) = &center.import_key {
            self.centers_by_import_key.load(key.clone(), center.id);
        }
        if !folded.is_empty() {
            self.centers_by_name
                .load((center.company_id, folded.clone()), center.id);
        }
        self.centers.insert(
            center.id,
            CenterInfo {
                id: center.id,
                company_id: center.company_id,
                name: center.name.clone(),
                folded_name: folded,
                employer_number: center.employer_number.clone(),
                preexisting: true,
            },
        );
    }

    fn load_course(&mut self, course: &Course) {
        if let Some(external_id) = course.external_id {
            self.courses_by_external.load(external_id, course.id);
        }
        if let Some(folded) = fold_name(&course.name) {
            self.courses_by_name.load(folded, course.id);
        }
    }

    fn load_group(&mut self, group: &Group) {
        if let Some(external_id) = group.external_id {
            self.groups_by_external.load(external_id, group.id);
        }
        if let Some(folded) = fold_name(&group.name) {
            self.groups_by_name.load((group.course_id, folded), group.id);
        }
    }

    /// Register every identity key a user row carries, so later rows in the
    /// same run match whichever key they have.
    pub fn note_user(
        &mut self,
        id: Uuid,
        nss: Option<&str>,
        dni: Option<&str>,
        external_id: Option<i64>,
        full_name: &str,
    ) {
        if let Some(nss) = nss {
            self.users_by_nss.note(nss.to_string(), id);
        }
        if let Some(dni) = dni {
            self.users_by_dni.note(dni.to_string(), id);
        }
        if let Some(external_id) = external_id {
            self.users_by_external.note(external_id, id);
        }
        if let Some(folded) = fold_name(full_name) {
            self.users_by_name.note(folded, id);
        }
        self.user_names.entry(id).or_insert_with(|| full_name.to_string());
    }

    pub fn note_center(&mut self, info: CenterInfo, import_key: Option<&str>) {
        if let Some(key) = import_key {
            self.centers_by_import_key.note(key.to_string(), info.id);
        }
        if !info.folded_name.is_empty() {
            self.centers_by_name
                .note((info.company_id, info.folded_name.clone()), info.id);
        }
        self.centers.insert(info.id, info);
    }

    /// Remember a (company, employer number) -> name observation; used to
    /// reject employer-number matches once two names disagree.
    pub fn observe_employer_number(
        &mut self,
        company_id: Uuid,
        employer_number: &str,
        folded_name: &str,
    ) {
        self.employer_names_seen
            .entry((company_id, employer_number.to_string()))
            .or_default()
            .insert(folded_name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_layer_shadows_store_layer() {
        let mut index = IdentityIndex::default();
        let stored = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        index.load("B123".to_string(), stored);
        assert_eq!(index.get(&"B123".to_string()), Some(stored));
        index.note("B123".to_string(), fresh);
        assert_eq!(index.get(&"B123".to_string()), Some(fresh));
        assert_eq!(index.get_existing(&"B123".to_string()), Some(stored));
    }

    #[test]
    fn employer_observation_collects_distinct_names() {
        let mut ctx = ImportContext::default();
        let company = Uuid::new_v4();
        ctx.observe_employer_number(company, "28123", "centro norte");
        ctx.observe_employer_number(company, "28123", "centro norte");
        ctx.observe_employer_number(company, "28123", "centro sur");
        let names = &ctx.employer_names_seen[&(company, "28123".to_string())];
        assert_eq!(names.len(), 2);
    }
}
