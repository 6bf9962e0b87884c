//! Course and group resolution. An external LMS id is authoritative: no name
//! matching happens when one is present, so two same-named-but-distinct
//! entities never collapse into one record.

use tracing::warn;
use uuid::Uuid;

use teim_core::normalize::{
    fold_name, parse_date_flexible, parse_external_id, sanitize_description,
};
use teim_core::{MatchedBy, NewCourse, NewGroup, Row};
use teim_storage::{Backend, CourseFilter, GroupFilter};

use crate::context::ImportContext;
use crate::resolvers::{Resolved, ResolutionError};
use crate::ImportConfig;

/// Resolve the row's course. `Ok(None)` when the row carries neither an
/// external id nor a course name.
pub async fn resolve_course(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    config: &ImportConfig,
    row: &Row,
) -> Result<Option<Resolved>, ResolutionError> {
    let external_id = row.get("moodle_id_course").and_then(parse_external_id);
    let name = row.get("course_name").map(str::to_string);

    if let Some(external_id) = external_id {
        // Id lookup only, never by name.
        if let Some(id) = ctx.courses_by_external.get(&external_id) {
            return Ok(Some(Resolved::new(id, MatchedBy::ExternalId)));
        }
        let found = backend
            .courses()
            .find_all(CourseFilter {
                external_id: Some(external_id),
            })
            .await?;
        if let Some(course) = found.first() {
            ctx.courses_by_external.note(external_id, course.id);
            return Ok(Some(Resolved::new(course.id, MatchedBy::ExternalId)));
        }

        let new = NewCourse {
            external_id: Some(external_id),
            name: name.clone().unwrap_or_else(|| format!("Curso {external_id}")),
            description: row.get("course_description").and_then(sanitize_description),
            hours: row.get("course_hours").and_then(|h| h.parse().ok()),
        };
        let course = match backend.courses().create(new.clone()).await {
            Ok(course) => course,
            Err(err) => {
                // One retry for transient creation conflicts, then a
                // best-effort re-fetch by id.
                warn!(external_id, error = %err, "course create failed, retrying once");
                tokio::time::sleep(config.create_retry_delay).await;
                match backend.courses().create(new).await {
                    Ok(course) => course,
                    Err(retry_err) => {
                        let refetched = backend
                            .courses()
                            .find_all(CourseFilter {
                                external_id: Some(external_id),
                            })
                            .await?;
                        match refetched.into_iter().next() {
                            Some(course) => course,
                            None => return Err(retry_err.into()),
                        }
                    }
                }
            }
        };
        ctx.courses_by_external.note(external_id, course.id);
        if let Some(folded) = fold_name(&course.name) {
            ctx.courses_by_name.note(folded, course.id);
        }
        return Ok(Some(Resolved::new(course.id, MatchedBy::Created)));
    }

    let Some(folded) = name.as_deref().and_then(fold_name) else {
        return Ok(None);
    };
    if let Some(id) = ctx.courses_by_name.get(&folded) {
        return Ok(Some(Resolved::new(id, MatchedBy::ExactName)));
    }

    let new = NewCourse {
        external_id: None,
        name: name.clone().unwrap_or_default(),
        description: row.get("course_description").and_then(sanitize_description),
        hours: row.get("course_hours").and_then(|h| h.parse().ok()),
    };
    let course = match backend.courses().create(new.clone()).await {
        Ok(course) => course,
        Err(err) => {
            warn!(course = %folded, error = %err, "course create failed, retrying once");
            tokio::time::sleep(config.create_retry_delay).await;
            match backend.courses().create(new).await {
                Ok(course) => course,
                Err(retry_err) => {
                    // Best-effort name re-fetch before giving the row up.
                    let all = backend.courses().find_all(CourseFilter::default()).await?;
                    match all
                        .into_iter()
                        .find(|c| fold_name(&c.name).as_deref() == Some(folded.as_str()))
                    {
                        Some(course) => course,
                        None => return Err(retry_err.into()),
                    }
                }
            }
        }
    };
    ctx.courses_by_name.note(folded, course.id);
    Ok(Some(Resolved::new(course.id, MatchedBy::Created)))
}

/// Resolve the row's group, scoped to its parent course when one is known.
/// `Ok(None)` when the row identifies no group.
pub async fn resolve_group(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    config: &ImportConfig,
    row: &Row,
    course: Option<Uuid>,
) -> Result<Option<Resolved>, ResolutionError> {
    let external_id = row.get("moodle_id_group").and_then(parse_external_id);
    let name = row.get("group_name").map(str::to_string);
    let start_date = row.get("start_date").and_then(parse_date_flexible);
    let end_date = row.get("end_date").and_then(parse_date_flexible);

    if let Some(external_id) = external_id {
        if let Some(id) = ctx.groups_by_external.get(&external_id) {
            return Ok(Some(Resolved::new(id, MatchedBy::ExternalId)));
        }
        let found = backend
            .groups()
            .find_all(GroupFilter {
                external_id: Some(external_id),
                course_id: None,
            })
            .await?;
        if let Some(group) = found.first() {
            ctx.groups_by_external.note(external_id, group.id);
            return Ok(Some(Resolved::new(group.id, MatchedBy::ExternalId)));
        }

        let new = NewGroup {
            external_id: Some(external_id),
            name: name.clone().unwrap_or_else(|| format!("Grupo {external_id}")),
            course_id: course,
            start_date,
            end_date,
        };
        let group = match backend.groups().create(new.clone()).await {
            Ok(group) => group,
            Err(err) => {
                warn!(external_id, error = %err, "group create failed, retrying once");
                tokio::time::sleep(config.create_retry_delay).await;
                match backend.groups().create(new).await {
                    Ok(group) => group,
                    Err(retry_err) => {
                        let refetched = backend
                            .groups()
                            .find_all(GroupFilter {
                                external_id: Some(external_id),
                                course_id: None,
                            })
                            .await?;
                        match refetched.into_iter().next() {
                            Some(group) => group,
                            None => return Err(retry_err.into()),
                        }
                    }
                }
            }
        };
        ctx.groups_by_external.note(external_id, group.id);
        if let Some(folded) = fold_name(&group.name) {
            ctx.groups_by_name.note((group.course_id, folded), group.id);
        }
        return Ok(Some(Resolved::new(group.id, MatchedBy::Created)));
    }

    let Some(folded) = name.as_deref().and_then(fold_name) else {
        return Ok(None);
    };
    if let Some(id) = ctx.groups_by_name.get(&(course, folded.clone())) {
        return Ok(Some(Resolved::new(id, MatchedBy::ExactName)));
    }

    let new = NewGroup {
        external_id: None,
        name: name.clone().unwrap_or_default(),
        course_id: course,
        start_date,
        end_date,
    };
    let group = match backend.groups().create(new.clone()).await {
        Ok(group) => group,
        Err(err) => {
            warn!(group = %folded, error = %err, "group create failed, retrying once");
            tokio::time::sleep(config.create_retry_delay).await;
            match backend.groups().create(new).await {
                Ok(group) => group,
                Err(retry_err) => {
                    let all = backend
                        .groups()
                        .find_all(GroupFilter {
                            external_id: None,
                            course_id: course,
                        })
                        .await?;
                    match all
                        .into_iter()
                        .find(|g| fold_name(&g.name).as_deref() == Some(folded.as_str()))
                    {
                        Some(group) => group,
                        None => return Err(retry_err.into()),
                    }
                }
            }
        }
    };
    ctx.groups_by_name.note((course, folded), group.id);
    Ok(Some(Resolved::new(group.id, MatchedBy::Created)))
}
