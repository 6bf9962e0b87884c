//! Phase orchestrator: drives one phase over all rows, strictly sequentially,
//! recording a per-row outcome and never letting a single row abort the run.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use teim_adapters::decode_rows;
use teim_core::normalize::{
    parse_date_flexible, parse_duration_secs, parse_percentage, sanitize_description,
};
use teim_core::{
    ImportPhase, MatchedBy, NewAffiliation, NewEnrollment, Row, RowError, RowOutcome, RowStatus,
    SkipReason,
};
use teim_storage::{AffiliationFilter, Backend, EnrollmentFilter, StoreError};

use crate::context::ImportContext;
use crate::repair::ensure_main_affiliations;
use crate::resolvers::{
    resolve_center, resolve_company, resolve_course, resolve_group, resolve_user, ResolutionError,
    UserFields,
};
use crate::sink::BadRowSink;
use crate::ImportConfig;

/// Full outcome report for one phase run. The import is never all-or-nothing:
/// the caller receives this even when most rows failed.
#[derive(Debug, Clone, Serialize)]
pub struct ImportRunReport {
    pub run_id: Uuid,
    pub phase: ImportPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    /// True when a CSV parse error cut the input short.
    pub truncated_input: bool,
    pub total_rows: usize,
    pub ok: usize,
    pub skipped: usize,
    pub errored: usize,
    /// Main-affiliation corrections applied by the post-associate sweep.
    pub main_repairs: usize,
    pub results: Vec<RowOutcome>,
    pub errors: Vec<RowError>,
}

pub struct ImportEngine<'a> {
    backend: &'a dyn Backend,
    config: ImportConfig,
}

impl<'a> ImportEngine<'a> {
    pub fn new(backend: &'a dyn Backend, config: ImportConfig) -> Self {
        Self { backend, config }
    }

    /// Run one phase over an uploaded CSV buffer.
    pub async fn run(&self, bytes: &[u8], phase: ImportPhase) -> anyhow::Result<ImportRunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %phase, bytes = bytes.len(), "import run starting");

        let decoded = decode_rows(bytes);
        let mut ctx = ImportContext::warm(self.backend)
            .await
            .context("warming identity caches")?;
        let mut sink = BadRowSink::open(&self.config);

        let mut results = Vec::with_capacity(decoded.rows.len());
        let mut errors = Vec::new();

        for row in &decoded.rows {
            match self.process_row(&mut ctx, row, phase).await {
                Ok(outcome) => {
                    if outcome.status == RowStatus::Skipped {
                        if let Some(reason) = outcome.reason {
                            sink.record(row, phase, reason.as_str());
                        }
                    }
                    results.push(outcome);
                }
                Err(err) => match err.skip_reason() {
                    Some(reason) => {
                        sink.record(row, phase, reason.as_str());
                        results.push(RowOutcome::skipped(row.index, phase, reason));
                    }
                    None => {
                        warn!(row = row.index, %phase, error = %err, "row failed");
                        sink.record(row, phase, "error");
                        errors.push(RowError {
                            row: row.index,
                            phase,
                            message: err.to_string(),
                        });
                        results.push(RowOutcome::new(row.index, phase, RowStatus::Error));
                    }
                },
            }
        }

        let main_repairs = if phase == ImportPhase::Associate {
            ensure_main_affiliations(self.backend).await?
        } else {
            0
        };

        let ok = results.iter().filter(|r| r.status == RowStatus::Ok).count();
        let skipped = results
            .iter()
            .filter(|r| r.status == RowStatus::Skipped)
            .count();
        let errored = results
            .iter()
            .filter(|r| r.status == RowStatus::Error)
            .count();
        let finished_at = Utc::now();
        info!(%run_id, %phase, ok, skipped, errored, main_repairs, "import run finished");

        Ok(ImportRunReport {
            run_id,
            phase,
            started_at,
            finished_at,
            success: errors.is_empty(),
            truncated_input: decoded.truncated,
            total_rows: results.len(),
            ok,
            skipped,
            errored,
            main_repairs,
            results,
            errors,
        })
    }

    async fn process_row(
        &self,
        ctx: &mut ImportContext,
        row: &Row,
        phase: ImportPhase,
    ) -> Result<RowOutcome, ResolutionError> {
        match phase {
            ImportPhase::Users => self.process_user_row(ctx, row).await,
            ImportPhase::Companies => self.process_company_row(ctx, row).await,
            ImportPhase::Associate => self.process_associate_row(ctx, row).await,
            ImportPhase::Courses => self.process_course_row(ctx, row).await,
            ImportPhase::Groups => self.process_group_row(ctx, row).await,
        }
    }

    async fn process_user_row(
        &self,
        ctx: &mut ImportContext,
        row: &Row,
    ) -> Result<RowOutcome, ResolutionError> {
        let (resolved, fields) = resolve_user(self.backend, ctx, row, true).await?;
        if resolved.matched_by != MatchedBy::Created {
            self.widen_user(resolved.id, &fields).await?;
        }
        let mut outcome = RowOutcome::new(row.index, ImportPhase::Users, RowStatus::Ok);
        outcome.id_user = Some(resolved.id);
        outcome.matched_by = Some(resolved.matched_by);
        Ok(outcome)
    }

    async fn process_company_row(
        &self,
        ctx: &mut ImportContext,
        row: &Row,
    ) -> Result<RowOutcome, ResolutionError> {
        let company = resolve_company(self.backend, ctx, row)
            .await?
            .ok_or(ResolutionError::CompanyNotFound)?;
        if company.matched_by != MatchedBy::Created {
            self.widen_company(company.id, row).await?;
        }
        let center = resolve_center(self.backend, ctx, &self.config, row, Some(company.id)).await?;

        let mut outcome = RowOutcome::new(row.index, ImportPhase::Companies, RowStatus::Ok);
        outcome.id_company = Some(company.id);
        outcome.id_center = Some(center.id);
        outcome.matched_by = Some(center.matched_by);
        Ok(outcome)
    }

    async fn process_associate_row(
        &self,
        ctx: &mut ImportContext,
        row: &Row,
    ) -> Result<RowOutcome, ResolutionError> {
        let (user, _) = resolve_user(self.backend, ctx, row, false).await?;
        let company = resolve_company(self.backend, ctx, row).await?;
        let center =
            resolve_center(self.backend, ctx, &self.config, row, company.map(|c| c.id)).await?;

        let start_date = row.get("start_date").and_then(parse_date_flexible);
        let end_date = row.get("end_date").and_then(parse_date_flexible);
        self.upsert_affiliation(user.id, center.id, start_date, end_date)
            .await?;
        self.recompute_main_flag(user.id).await?;

        let mut outcome = RowOutcome::new(row.index, ImportPhase::Associate, RowStatus::Ok);
        outcome.id_user = Some(user.id);
        outcome.id_company = company.map(|c| c.id);
        outcome.id_center = Some(center.id);
        outcome.matched_by = Some(user.matched_by);
        Ok(outcome)
    }

    async fn process_course_row(
        &self,
        ctx: &mut ImportContext,
        row: &Row,
    ) -> Result<RowOutcome, ResolutionError> {
        let course = resolve_course(self.backend, ctx, &self.config, row)
            .await?
            .ok_or(ResolutionError::CourseNotFound)?;
        if course.matched_by != MatchedBy::Created {
            self.widen_course(course.id, row).await?;
        }

        let mut outcome = RowOutcome::new(row.index, ImportPhase::Courses, RowStatus::Ok);
        outcome.id_course = Some(course.id);

        // No user creation outside the users phase: unmatched rows skip, but
        // the course resolution above still counts.
        match resolve_user(self.backend, ctx, row, false).await {
            Ok((user, _)) => {
                self.upsert_enrollment(user.id, course.id, None, row).await?;
                outcome.id_user = Some(user.id);
                outcome.matched_by = Some(course.matched_by);
                Ok(outcome)
            }
            Err(ResolutionError::UserNotFound) => {
                outcome.status = RowStatus::Skipped;
                outcome.reason = Some(SkipReason::UserNotFound);
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    async fn process_group_row(
        &self,
        ctx: &mut ImportContext,
        row: &Row,
    ) -> Result<RowOutcome, ResolutionError> {
        let course = resolve_course(self.backend, ctx, &self.config, row).await?;
        let group = resolve_group(
            self.backend,
            ctx,
            &self.config,
            row,
            course.map(|c| c.id),
        )
        .await?
        .ok_or(ResolutionError::GroupNotFound)?;
        if group.matched_by != MatchedBy::Created {
            self.widen_group(group.id, course.map(|c| c.id), row).await?;
        }

        let mut outcome = RowOutcome::new(row.index, ImportPhase::Groups, RowStatus::Ok);
        outcome.id_course = course.map(|c| c.id);
        outcome.id_group = Some(group.id);

        match resolve_user(self.backend, ctx, row, false).await {
            Ok((user, _)) => {
                let course_id = match course.map(|c| c.id) {
                    Some(id) => Some(id),
                    None => self
                        .backend
                        .groups()
                        .find_by_id(group.id)
                        .await?
                        .and_then(|g| g.course_id),
                };
                if let Some(course_id) = course_id {
                    self.upsert_enrollment(user.id, course_id, Some(group.id), row)
                        .await?;
                } else {
                    warn!(group = %group.id, "group has no parent course, enrollment not recorded");
                }
                outcome.id_user = Some(user.id);
                outcome.matched_by = Some(group.matched_by);
                Ok(outcome)
            }
            Err(ResolutionError::UserNotFound) => {
                outcome.status = RowStatus::Skipped;
                outcome.reason = Some(SkipReason::UserNotFound);
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    /// Fill missing fields on a matched user from the row; never overwrite
    /// present values.
    async fn widen_user(&self, user_id: Uuid, fields: &UserFields) -> Result<(), StoreError> {
        let Some(mut user) = self.backend.users().find_by_id(user_id).await? else {
            return Ok(());
        };
        let mut changed = false;
        if user.name.is_empty() {
            if let Some(name) = &fields.name {
                user.name = name.clone();
                changed = true;
            }
        }
        if user.surname1.is_none() && fields.surname1.is_some() {
            user.surname1 = fields.surname1.clone();
            changed = true;
        }
        if user.surname2.is_none() && fields.surname2.is_some() {
            user.surname2 = fields.surname2.clone();
            changed = true;
        }
        if user.dni.is_none() && fields.dni.is_some() {
            user.dni = fields.dni.clone();
            changed = true;
        }
        if user.nss.is_none() && fields.nss.is_some() {
            user.nss = fields.nss.clone();
            changed = true;
        }
        if user.external_id.is_none() && fields.external_id.is_some() {
            user.external_id = fields.external_id;
            changed = true;
        }
        if user.email.is_none() && fields.email.is_some() {
            user.email = fields.email.clone();
            changed = true;
        }
        if changed {
            self.backend.users().update(&user).await?;
        }
        Ok(())
    }

    async fn widen_company(&self, company_id: Uuid, row: &Row) -> Result<(), StoreError> {
        let Some(mut company) = self.backend.companies().find_by_id(company_id).await? else {
            return Ok(());
        };
        if company.name.is_none() {
            if let Some(name) = row.get("company_name") {
                company.name = Some(name.to_string());
                self.backend.companies().update(&company).await?;
            }
        }
        Ok(())
    }

    /// External-id matches may carry a fresher name; the id stays the record
    /// identity, the name follows the source.
    async fn widen_course(&self, course_id: Uuid, row: &Row) -> Result<(), StoreError> {
        let Some(mut course) = self.backend.courses().find_by_id(course_id).await? else {
            return Ok(());
        };
        let mut changed = false;
        if let Some(name) = row.get("course_name") {
            if course.name != name {
                course.name = name.to_string();
                changed = true;
            }
        }
        if course.description.is_none() {
            if let Some(description) = row.get("course_description").and_then(sanitize_description)
            {
                course.description = Some(description);
                changed = true;
            }
        }
        if course.hours.is_none() {
            if let Some(hours) = row.get("course_hours").and_then(|h| h.parse().ok()) {
                course.hours = Some(hours);
                changed = true;
            }
        }
        if changed {
            self.backend.courses().update(&course).await?;
        }
        Ok(())
    }

    async fn widen_group(
        &self,
        group_id: Uuid,
        course: Option<Uuid>,
        row: &Row,
    ) -> Result<(), StoreError> {
        let Some(mut group) = self.backend.groups().find_by_id(group_id).await? else {
            return Ok(());
        };
        let mut changed = false;
        if group.course_id.is_none() && course.is_some() {
            group.course_id = course;
            changed = true;
        }
        if group.start_date.is_none() {
            if let Some(start) = row.get("start_date").and_then(parse_date_flexible) {
                group.start_date = Some(start);
                changed = true;
            }
        }
        if group.end_date.is_none() {
            if let Some(end) = row.get("end_date").and_then(parse_date_flexible) {
                group.end_date = Some(end);
                changed = true;
            }
        }
        if changed {
            self.backend.groups().update(&group).await?;
        }
        Ok(())
    }

    async fn upsert_affiliation(
        &self,
        user_id: Uuid,
        center_id: Uuid,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<(), StoreError> {
        let existing = self
            .backend
            .affiliations()
            .find_all(AffiliationFilter {
                user_id: Some(user_id),
                center_id: Some(center_id),
            })
            .await?;
        match existing.into_iter().next() {
            Some(mut affiliation) => {
                let mut changed = false;
                if start_date.is_some() && affiliation.start_date != start_date {
                    affiliation.start_date = start_date;
                    changed = true;
                }
                if end_date.is_some() && affiliation.end_date != end_date {
                    affiliation.end_date = end_date;
                    changed = true;
                }
                if changed {
                    self.backend.affiliations().update(&affiliation).await?;
                }
            }
            None => {
                self.backend
                    .affiliations()
                    .create(NewAffiliation {
                        user_id,
                        center_id,
                        start_date,
                        end_date,
                        is_main: false,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// The association with the single most-recent start date becomes main;
    /// ties and absent dates leave the flags untouched.
    async fn recompute_main_flag(&self, user_id: Uuid) -> Result<(), StoreError> {
        let affiliations = self
            .backend
            .affiliations()
            .find_all(AffiliationFilter {
                user_id: Some(user_id),
                center_id: None,
            })
            .await?;
        let latest = affiliations
            .iter()
            .filter_map(|a| a.start_date.map(|d| (d, a)))
            .max_by_key(|(d, _)| *d);
        let Some((latest_date, candidate)) = latest else {
            return Ok(());
        };
        let holders = affiliations
            .iter()
            .filter(|a| a.start_date == Some(latest_date))
            .count();
        if holders != 1 {
            return Ok(());
        }
        if !candidate.is_main {
            self.backend
                .affiliations()
                .set_main_exclusive(user_id, candidate.id)
                .await?;
        }
        Ok(())
    }

    async fn upsert_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        group_id: Option<Uuid>,
        row: &Row,
    ) -> Result<(), StoreError> {
        let progress_pct = row.get("progress_pct").and_then(parse_percentage);
        let time_spent_secs = row.get("time_spent").and_then(parse_duration_secs);

        let existing = self
            .backend
            .enrollments()
            .find_all(EnrollmentFilter {
                user_id: Some(user_id),
                course_id: Some(course_id),
                group_id: None,
            })
            .await?;
        match existing.into_iter().next() {
            Some(mut enrollment) => {
                let mut changed = false;
                if enrollment.group_id.is_none() && group_id.is_some() {
                    enrollment.group_id = group_id;
                    changed = true;
                }
                if progress_pct.is_some() && enrollment.progress_pct != progress_pct {
                    enrollment.progress_pct = progress_pct;
                    changed = true;
                }
                if time_spent_secs.is_some() && enrollment.time_spent_secs != time_spent_secs {
                    enrollment.time_spent_secs = time_spent_secs;
                    changed = true;
                }
                if changed {
                    self.backend.enrollments().update(&enrollment).await?;
                }
            }
            None => {
                self.backend
                    .enrollments()
                    .create(NewEnrollment {
                        user_id,
                        course_id,
                        group_id,
                        progress_pct,
                        time_spent_secs,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
