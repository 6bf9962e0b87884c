//! End-to-end properties of the reconciliation engine against the in-memory
//! backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use teim_core::{
    Course, ImportPhase, MatchedBy, NewCenter, NewCompany, NewCourse, NewUser, RowStatus,
    SkipReason,
};
use teim_storage::{
    AffiliationFilter, AffiliationStore, Backend, CenterFilter, CenterStore, CompanyFilter,
    CompanyStore, CourseFilter, CourseStore, EnrollmentFilter, EnrollmentStore, GroupStore,
    MemoryBackend, StoreError, UserFilter, UserStore,
};
use teim_sync::{ImportConfig, ImportEngine};

fn engine(backend: &MemoryBackend) -> ImportEngine<'_> {
    ImportEngine::new(backend, ImportConfig::default())
}

#[tokio::test]
async fn rerunning_companies_and_associate_creates_no_duplicates() {
    let backend = MemoryBackend::new();

    let users_csv = b"dni;name;surname1\n12345678Z;Ana;Garcia\n";
    let link_csv = b"dni;cif;center_name;start_date\n12345678Z;B11111111;Centro Alcala;01/02/2023\n";

    let report = engine(&backend)
        .run(users_csv, ImportPhase::Users)
        .await
        .unwrap();
    assert_eq!(report.ok, 1);

    for _ in 0..2 {
        let report = engine(&backend)
            .run(link_csv, ImportPhase::Companies)
            .await
            .unwrap();
        assert_eq!(report.ok, 1);
        assert_eq!(report.errored, 0);
    }
    for _ in 0..2 {
        let report = engine(&backend)
            .run(link_csv, ImportPhase::Associate)
            .await
            .unwrap();
        assert_eq!(report.ok, 1);
        assert_eq!(report.errored, 0);
    }

    let companies = backend
        .companies()
        .find_all(CompanyFilter::default())
        .await
        .unwrap();
    assert_eq!(companies.len(), 1);

    let centers = backend
        .centers()
        .find_all(CenterFilter::default())
        .await
        .unwrap();
    assert_eq!(centers.len(), 1);
    // The import key persisted at creation is what re-matches on later runs.
    assert_eq!(
        centers[0].import_key.as_deref(),
        Some(format!("{}_centro alcala", companies[0].id).as_str())
    );

    let affiliations = backend
        .affiliations()
        .find_all(AffiliationFilter::default())
        .await
        .unwrap();
    assert_eq!(affiliations.len(), 1);
}

#[tokio::test]
async fn empty_tax_id_creates_neither_company_nor_center() {
    let backend = MemoryBackend::new();
    let csv = b"dni;cif;center_name\n12345678Z;;Centro X\n";

    let report = engine(&backend)
        .run(csv, ImportPhase::Companies)
        .await
        .unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].status, RowStatus::Skipped);
    assert_eq!(report.results[0].reason, Some(SkipReason::CompanyNotFound));

    assert!(backend
        .companies()
        .find_all(CompanyFilter::default())
        .await
        .unwrap()
        .is_empty());
    assert!(backend
        .centers()
        .find_all(CenterFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn conflicting_names_for_one_employer_number_stay_distinct() {
    let backend = MemoryBackend::new();
    let company = backend
        .companies()
        .create(NewCompany {
            tax_id: "B22222222".into(),
            name: Some("Empresa".into()),
        })
        .await
        .unwrap();
    let preexisting = CenterStore::create(
        &backend,
        NewCenter {
            company_id: company.id,
            name: "Centro Base".into(),
            import_key: None,
            employer_number: Some("28111".into()),
        },
    )
    .await
    .unwrap();

    let csv = b"cif;center_name;employer_number\n\
B22222222;Sede Norte;28111\n\
B22222222;Sede Sur;28111\n";
    let report = engine(&backend)
        .run(csv, ImportPhase::Companies)
        .await
        .unwrap();
    assert_eq!(report.ok, 2);

    let first = report.results[0].id_center.unwrap();
    let second = report.results[1].id_center.unwrap();
    // The two rows never collapse onto one record, and the second row cannot
    // ride the now-ambiguous employer number onto the pre-existing center.
    assert_ne!(first, second);
    assert_ne!(second, preexisting.id);
    assert_ne!(report.results[1].matched_by, Some(MatchedBy::EmployerNumber));
}

#[tokio::test]
async fn nss_match_wins_over_a_plausible_dni() {
    let backend = MemoryBackend::new();
    let existing = UserStore::create(
        &backend,
        NewUser {
            name: "Luis".into(),
            nss: Some("281234567890".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Valid-but-different DNI on the same row must not fork a second record.
    let csv = b"nss;dni;name\n28/1234567890;87654321X;Luis\n";
    let report = engine(&backend)
        .run(csv, ImportPhase::Users)
        .await
        .unwrap();

    assert_eq!(report.results[0].id_user, Some(existing.id));
    assert_eq!(report.results[0].matched_by, Some(MatchedBy::Nss));
    let users = backend.users().find_all(UserFilter::default()).await.unwrap();
    assert_eq!(users.len(), 1);
    // Matching widened the record with the row's DNI.
    assert_eq!(users[0].dni.as_deref(), Some("87654321X"));
}

#[tokio::test]
async fn every_affiliated_user_ends_with_exactly_one_main() {
    let backend = MemoryBackend::new();

    let users_csv = b"dni;name\n11111111H;Ana\n22222222J;Luis\n";
    engine(&backend)
        .run(users_csv, ImportPhase::Users)
        .await
        .unwrap();

    // Ana moves across two centers; Luis has undated affiliations only.
    let associate_csv = b"dni;cif;center_name;start_date\n\
11111111H;B11111111;Centro Uno;01/01/2022\n\
11111111H;B11111111;Centro Dos;01/06/2023\n\
22222222J;B11111111;Centro Uno;\n\
22222222J;B11111111;Centro Dos;\n";
    let report = engine(&backend)
        .run(associate_csv, ImportPhase::Associate)
        .await
        .unwrap();
    assert_eq!(report.ok, 4);
    // Luis had no dated rows, so only the repair sweep can give him a main.
    assert!(report.main_repairs >= 1);

    let affiliations = backend
        .affiliations()
        .find_all(AffiliationFilter::default())
        .await
        .unwrap();
    let users = backend.users().find_all(UserFilter::default()).await.unwrap();
    for user in users {
        let mains: Vec<_> = affiliations
            .iter()
            .filter(|a| a.user_id == user.id && a.is_main)
            .collect();
        assert_eq!(mains.len(), 1, "user {} main count", user.name);
    }

    // Ana's main is the most recent start date.
    let ana_main = affiliations
        .iter()
        .find(|a| a.is_main && a.start_date.is_some())
        .unwrap();
    assert_eq!(
        ana_main.start_date.unwrap().to_string(),
        "2023-06-01".to_string()
    );
}

#[tokio::test]
async fn oversized_durations_never_exceed_the_32_bit_bound() {
    let backend = MemoryBackend::new();
    engine(&backend)
        .run(b"dni;name\n11111111H;Ana\n", ImportPhase::Users)
        .await
        .unwrap();

    let csv = b"dni;moodle_id_course;course_name;time_spent\n11111111H;55;PRL;9999999999\n";
    let report = engine(&backend)
        .run(csv, ImportPhase::Courses)
        .await
        .unwrap();
    assert_eq!(report.ok, 1);

    let enrollments = backend
        .enrollments()
        .find_all(EnrollmentFilter::default())
        .await
        .unwrap();
    assert_eq!(enrollments.len(), 1);
    let stored = enrollments[0].time_spent_secs.unwrap();
    assert!(stored <= i32::MAX);
    // 9_999_999_999 exceeds i32, so it is read as milliseconds.
    assert_eq!(stored, 9_999_999);
}

#[tokio::test]
async fn external_course_id_wins_over_name_drift() {
    let backend = MemoryBackend::new();

    let first = b"moodle_id_course;course_name\n77;Old Name\n";
    let second = b"moodle_id_course;course_name\n77;New Name\n";

    let report_a = engine(&backend)
        .run(first, ImportPhase::Courses)
        .await
        .unwrap();
    let report_b = engine(&backend)
        .run(second, ImportPhase::Courses)
        .await
        .unwrap();

    // No user columns: the rows skip on user matching, after the course has
    // been resolved.
    assert_eq!(report_a.results[0].reason, Some(SkipReason::UserNotFound));
    assert_eq!(report_b.results[0].reason, Some(SkipReason::UserNotFound));

    let id_a = report_a.results[0].id_course.unwrap();
    let id_b = report_b.results[0].id_course.unwrap();
    assert_eq!(id_a, id_b);

    let courses = backend
        .courses()
        .find_all(CourseFilter {
            external_id: Some(77),
        })
        .await
        .unwrap();
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0].name, "New Name");
}

#[tokio::test]
async fn rows_without_any_identity_signal_are_skipped_not_created() {
    let backend = MemoryBackend::new();
    // Malformed DNI, too-short NSS, no name, no email.
    let csv = b"dni;nss;name\n123;12;\n";
    let report = engine(&backend)
        .run(csv, ImportPhase::Users)
        .await
        .unwrap();

    assert_eq!(report.results[0].status, RowStatus::Skipped);
    assert_eq!(
        report.results[0].reason,
        Some(SkipReason::InsufficientUserData)
    );
    assert!(backend
        .users()
        .find_all(UserFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn associate_never_creates_users() {
    let backend = MemoryBackend::new();
    let csv = b"dni;name;cif;center_name\n12345678Z;Ana;B33333333;Centro Gamma\n";
    let report = engine(&backend)
        .run(csv, ImportPhase::Associate)
        .await
        .unwrap();

    assert_eq!(report.results[0].status, RowStatus::Skipped);
    assert_eq!(report.results[0].reason, Some(SkipReason::UserNotFound));
    assert!(backend
        .users()
        .find_all(UserFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn two_rows_for_one_unsaved_center_share_the_created_record() {
    let backend = MemoryBackend::new();
    // Same center twice in one file; the second row must hit the run cache,
    // not create a duplicate.
    let csv = b"cif;center_name\nB44444444;Centro Delta\nB44444444;Centro Delta\n";
    let report = engine(&backend)
        .run(csv, ImportPhase::Companies)
        .await
        .unwrap();

    assert_eq!(report.ok, 2);
    assert_eq!(
        report.results[0].id_center.unwrap(),
        report.results[1].id_center.unwrap()
    );
    assert_eq!(report.results[0].matched_by, Some(MatchedBy::Created));
    assert_eq!(report.results[1].matched_by, Some(MatchedBy::RunCache));

    let centers = backend
        .centers()
        .find_all(CenterFilter::default())
        .await
        .unwrap();
    assert_eq!(centers.len(), 1);
}

/// Backend that fails the first N course creations, standing in for transient
/// store conflicts.
struct FlakyCourseBackend {
    inner: MemoryBackend,
    failures_left: AtomicUsize,
}

impl FlakyCourseBackend {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryBackend::new(),
            failures_left: AtomicUsize::new(failures),
        }
    }
}

impl Backend for FlakyCourseBackend {
    fn users(&self) -> &dyn UserStore {
        self.inner.users()
    }
    fn companies(&self) -> &dyn CompanyStore {
        self.inner.companies()
    }
    fn centers(&self) -> &dyn CenterStore {
        self.inner.centers()
    }
    fn courses(&self) -> &dyn CourseStore {
        self
    }
    fn groups(&self) -> &dyn GroupStore {
        self.inner.groups()
    }
    fn affiliations(&self) -> &dyn AffiliationStore {
        self.inner.affiliations()
    }
    fn enrollments(&self) -> &dyn EnrollmentStore {
        self.inner.enrollments()
    }
}

#[async_trait]
impl CourseStore for FlakyCourseBackend {
    async fn find_all(&self, filter: CourseFilter) -> Result<Vec<Course>, StoreError> {
        self.inner.courses().find_all(filter).await
    }
    async fn find_by_id(&self, id: uuid::Uuid) -> Result<Option<Course>, StoreError> {
        self.inner.courses().find_by_id(id).await
    }
    async fn create(&self, new: NewCourse) -> Result<Course, StoreError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict("simulated create conflict".into()));
        }
        self.inner.courses().create(new).await
    }
    async fn update(&self, course: &Course) -> Result<(), StoreError> {
        self.inner.courses().update(course).await
    }
}

#[tokio::test]
async fn course_creation_retries_once_after_a_conflict() {
    let backend = FlakyCourseBackend::new(1);
    let config = ImportConfig {
        create_retry_delay: Duration::from_millis(5),
        ..ImportConfig::default()
    };

    let csv = b"moodle_id_course;course_name\n88;Nuevo Curso\n";
    let report = ImportEngine::new(&backend, config)
        .run(csv, ImportPhase::Courses)
        .await
        .unwrap();

    // The row still skips on user matching, but the course itself landed on
    // the retry.
    assert_eq!(report.errored, 0);
    let courses = backend
        .courses()
        .find_all(CourseFilter {
            external_id: Some(88),
        })
        .await
        .unwrap();
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0].name, "Nuevo Curso");
}

#[tokio::test]
async fn nameless_rows_reuse_the_company_unknown_center() {
    let backend = MemoryBackend::new();
    let csv = b"cif;center_name\nB55555555;\nB55555555;\n";
    let report = engine(&backend)
        .run(csv, ImportPhase::Companies)
        .await
        .unwrap();

    assert_eq!(report.ok, 2);
    assert_eq!(
        report.results[0].id_center.unwrap(),
        report.results[1].id_center.unwrap()
    );
    let centers = backend
        .centers()
        .find_all(CenterFilter::default())
        .await
        .unwrap();
    assert_eq!(centers.len(), 1);
    assert_eq!(centers[0].name, "UNKNOWN");
}
