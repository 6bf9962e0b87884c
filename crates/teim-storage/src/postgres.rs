//! Postgres backend over sqlx runtime queries.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
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

const SCHEMA: &str = include_str!("schema.sql");

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        tracing::info!("connected to entity store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

impl Backend for PgBackend {
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

fn row_to_user(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        surname1: row.try_get("surname1")?,
        surname2: row.try_get("surname2")?,
        dni: row.try_get("dni")?,
        nss: row.try_get("nss")?,
        external_id: row.try_get("external_id")?,
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_company(row: &PgRow) -> Result<Company, sqlx::Error> {
    Ok(Company {
        id: row.try_get("id")?,
        tax_id: row.try_get("tax_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_center(row: &PgRow) -> Result<Center, sqlx::Error> {
    Ok(Center {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        name: row.try_get("name")?,
        import_key: row.try_get("import_key")?,
        employer_number: row.try_get("employer_number")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_course(row: &PgRow) -> Result<Course, sqlx::Error> {
    Ok(Course {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        hours: row.try_get("hours")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_group(row: &PgRow) -> Result<Group, sqlx::Error> {
    Ok(Group {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        course_id: row.try_get("course_id")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_affiliation(row: &PgRow) -> Result<Affiliation, sqlx::Error> {
    Ok(Affiliation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        center_id: row.try_get("center_id")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        is_main: row.try_get("is_main")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_enrollment(row: &PgRow) -> Result<Enrollment, sqlx::Error> {
    Ok(Enrollment {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        course_id: row.try_get("course_id")?,
        group_id: row.try_get("group_id")?,
        progress_pct: row.try_get("progress_pct")?,
        time_spent_secs: row.try_get("time_spent_secs")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl UserStore for PgBackend {
    async fn find_all(&self, filter: UserFilter) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, surname1, surname2, dni, nss, external_id, email,
                   created_at, updated_at
              FROM users
             WHERE ($1::text IS NULL OR dni = $1)
               AND ($2::text IS NULL OR nss = $2)
               AND ($3::bigint IS NULL OR external_id = $3)
             ORDER BY created_at
            "#,
        )
        .bind(filter.dni)
        .bind(filter.nss)
        .bind(filter.external_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| row_to_user(r).map_err(Into::into)).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, surname1, surname2, dni, nss, external_id, email,
                   created_at, updated_at
              FROM users
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_user).transpose().map_err(Into::into)
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO users (id, name, surname1, surname2, dni, nss, external_id, email,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(id)
        .bind(&new.name)
        .bind(&new.surname1)
        .bind(&new.surname2)
        .bind(&new.dni)
        .bind(&new.nss)
        .bind(new.external_id)
        .bind(&new.email)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(User {
            id,
            name: new.name,
            surname1: new.surname1,
            surname2: new.surname2,
            dni: new.dni,
            nss: new.nss,
            external_id: new.external_id,
            email: new.email,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, user: &User) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET name = $2, surname1 = $3, surname2 = $4, dni = $5, nss = $6,
                   external_id = $7, email = $8, updated_at = $9
             WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.surname1)
        .bind(&user.surname2)
        .bind(&user.dni)
        .bind(&user.nss)
        .bind(user.external_id)
        .bind(&user.email)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }
}

#[async_trait]
impl CompanyStore for PgBackend {
    async fn find_all(&self, filter: CompanyFilter) -> Result<Vec<Company>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tax_id, name, created_at, updated_at
              FROM companies
             WHERE ($1::text IS NULL OR tax_id = $1)
             ORDER BY created_at
            "#,
        )
        .bind(filter.tax_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| row_to_company(r).map_err(Into::into)).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Company>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, tax_id, name, created_at, updated_at FROM companies WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_company).transpose().map_err(Into::into)
    }

    async fn create(&self, new: NewCompany) -> Result<Company, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO companies (id, tax_id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(id)
        .bind(&new.tax_id)
        .bind(&new.name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Company {
            id,
            tax_id: new.tax_id,
            name: new.name,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, company: &Company) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE companies SET tax_id = $2, name = $3, updated_at = $4 WHERE id = $1"#,
        )
        .bind(company.id)
        .bind(&company.tax_id)
        .bind(&company.name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("company"));
        }
        Ok(())
    }
}

#[async_trait]
impl CenterStore for PgBackend {
    async fn find_all(&self, filter: CenterFilter) -> Result<Vec<Center>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, company_id, name, import_key, employer_number, created_at, updated_at
              FROM centers
             WHERE ($1::uuid IS NULL OR company_id = $1)
               AND ($2::text IS NULL OR import_key = $2)
             ORDER BY created_at
            "#,
        )
        .bind(filter.company_id)
        .bind(filter.import_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| row_to_center(r).map_err(Into::into)).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Center>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, company_id, name, import_key, employer_number, created_at, updated_at
              FROM centers
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_center).transpose().map_err(Into::into)
    }

    async fn create(&self, new: NewCenter) -> Result<Center, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO centers (id, company_id, name, import_key, employer_number,
                                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            "#,
        )
        .bind(id)
        .bind(new.company_id)
        .bind(&new.name)
        .bind(&new.import_key)
        .bind(&new.employer_number)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Center {
            id,
            company_id: new.company_id,
            name: new.name,
            import_key: new.import_key,
            employer_number: new.employer_number,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, center: &Center) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE centers
               SET company_id = $2, name = $3, import_key = $4, employer_number = $5,
                   updated_at = $6
             WHERE id = $1
            "#,
        )
        .bind(center.id)
        .bind(center.company_id)
        .bind(&center.name)
        .bind(&center.import_key)
        .bind(&center.employer_number)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("center"));
        }
        Ok(())
    }
}

#[async_trait]
impl CourseStore for PgBackend {
    async fn find_all(&self, filter: CourseFilter) -> Result<Vec<Course>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, name, description, hours, created_at, updated_at
              FROM courses
             WHERE ($1::bigint IS NULL OR external_id = $1)
             ORDER BY created_at
            "#,
        )
        .bind(filter.external_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| row_to_course(r).map_err(Into::into)).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Course>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id, name, description, hours, created_at, updated_at
              FROM courses
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_course).transpose().map_err(Into::into)
    }

    async fn create(&self, new: NewCourse) -> Result<Course, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO courses (id, external_id, name, description, hours, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            "#,
        )
        .bind(id)
        .bind(new.external_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.hours)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Course {
            id,
            external_id: new.external_id,
            name: new.name,
            description: new.description,
            hours: new.hours,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, course: &Course) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE courses
               SET external_id = $2, name = $3, description = $4, hours = $5, updated_at = $6
             WHERE id = $1
            "#,
        )
        .bind(course.id)
        .bind(course.external_id)
        .bind(&course.name)
        .bind(&course.description)
        .bind(course.hours)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("course"));
        }
        Ok(())
    }
}

#[async_trait]
impl GroupStore for PgBackend {
    async fn find_all(&self, filter: GroupFilter) -> Result<Vec<Group>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, name, course_id, start_date, end_date, created_at, updated_at
              FROM groups
             WHERE ($1::bigint IS NULL OR external_id = $1)
               AND ($2::uuid IS NULL OR course_id = $2)
             ORDER BY created_at
            "#,
        )
        .bind(filter.external_id)
        .bind(filter.course_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| row_to_group(r).map_err(Into::into)).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id, name, course_id, start_date, end_date, created_at, updated_at
              FROM groups
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_group).transpose().map_err(Into::into)
    }

    async fn create(&self, new: NewGroup) -> Result<Group, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO groups (id, external_id, name, course_id, start_date, end_date,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(id)
        .bind(new.external_id)
        .bind(&new.name)
        .bind(new.course_id)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Group {
            id,
            external_id: new.external_id,
            name: new.name,
            course_id: new.course_id,
            start_date: new.start_date,
            end_date: new.end_date,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, group: &Group) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE groups
               SET external_id = $2, name = $3, course_id = $4, start_date = $5,
                   end_date = $6, updated_at = $7
             WHERE id = $1
            "#,
        )
        .bind(group.id)
        .bind(group.external_id)
        .bind(&group.name)
        .bind(group.course_id)
        .bind(group.start_date)
        .bind(group.end_date)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("group"));
        }
        Ok(())
    }
}

#[async_trait]
impl AffiliationStore for PgBackend {
    async fn find_all(&self, filter: AffiliationFilter) -> Result<Vec<Affiliation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, center_id, start_date, end_date, is_main, created_at, updated_at
              FROM affiliations
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::uuid IS NULL OR center_id = $2)
             ORDER BY created_at
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.center_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| row_to_affiliation(r).map_err(Into::into))
            .collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Affiliation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, center_id, start_date, end_date, is_main, created_at, updated_at
              FROM affiliations
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(row_to_affiliation)
            .transpose()
            .map_err(Into::into)
    }

    async fn create(&self, new: NewAffiliation) -> Result<Affiliation, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO affiliations (id, user_id, center_id, start_date, end_date, is_main,
                                      created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(id)
        .bind(new.user_id)
        .bind(new.center_id)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(new.is_main)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Affiliation {
            id,
            user_id: new.user_id,
            center_id: new.center_id,
            start_date: new.start_date,
            end_date: new.end_date,
            is_main: new.is_main,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, affiliation: &Affiliation) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE affiliations
               SET start_date = $2, end_date = $3, is_main = $4, updated_at = $5
             WHERE id = $1
            "#,
        )
        .bind(affiliation.id)
        .bind(affiliation.start_date)
        .bind(affiliation.end_date)
        .bind(affiliation.is_main)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("affiliation"));
        }
        Ok(())
    }

    async fn set_main_exclusive(
        &self,
        user_id: Uuid,
        affiliation_id: Uuid,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE affiliations
               SET is_main = FALSE, updated_at = $2
             WHERE user_id = $1
               AND is_main = TRUE
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            r#"
            UPDATE affiliations
               SET is_main = TRUE, updated_at = $3
             WHERE id = $1
               AND user_id = $2
            "#,
        )
        .bind(affiliation_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("affiliation"));
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl EnrollmentStore for PgBackend {
    async fn find_all(&self, filter: EnrollmentFilter) -> Result<Vec<Enrollment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, course_id, group_id, progress_pct, time_spent_secs,
                   created_at, updated_at
              FROM enrollments
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::uuid IS NULL OR course_id = $2)
               AND ($3::uuid IS NULL OR group_id = $3)
             ORDER BY created_at
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.course_id)
        .bind(filter.group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| row_to_enrollment(r).map_err(Into::into))
            .collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, course_id, group_id, progress_pct, time_spent_secs,
                   created_at, updated_at
              FROM enrollments
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(row_to_enrollment)
            .transpose()
            .map_err(Into::into)
    }

    async fn create(&self, new: NewEnrollment) -> Result<Enrollment, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO enrollments (id, user_id, course_id, group_id, progress_pct,
                                     time_spent_secs, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(id)
        .bind(new.user_id)
        .bind(new.course_id)
        .bind(new.group_id)
        .bind(new.progress_pct)
        .bind(new.time_spent_secs)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Enrollment {
            id,
            user_id: new.user_id,
            course_id: new.course_id,
            group_id: new.group_id,
            progress_pct: new.progress_pct,
            time_spent_secs: new.time_spent_secs,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments
               SET group_id = $2, progress_pct = $3, time_spent_secs = $4, updated_at = $5
             WHERE id = $1
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.group_id)
        .bind(enrollment.progress_pct)
        .bind(enrollment.time_spent_secs)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("enrollment"));
        }
        Ok(())
    }
}
