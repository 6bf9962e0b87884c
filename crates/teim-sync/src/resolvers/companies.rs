//! Company and center resolution. The center resolver carries the most
//! intricate matching ladder in the engine; order matters and is load-bearing.

use tracing::warn;
use uuid::Uuid;

use teim_core::normalize::{fold_name, normalize_identifier};
use teim_core::{MatchedBy, NewCenter, NewCompany, Row};
use teim_storage::{Backend, CompanyFilter};

use crate::context::{CenterInfo, ImportContext};
use crate::resolvers::{Resolved, ResolutionError};
use crate::ImportConfig;

/// Name reserved for a company's sentinel center, reused by rows that carry
/// no center name.
const UNKNOWN_CENTER_NAME: &str = "UNKNOWN";

/// Resolve the row's company by tax id. Returns `Ok(None)` when the row has
/// no usable tax id: a company is never created or matched without one.
pub async fn resolve_company(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    row: &Row,
) -> Result<Option<Resolved>, ResolutionError> {
    let Some(tax_id) = row.get("cif").and_then(normalize_identifier) else {
        return Ok(None);
    };

    if let Some(id) = ctx.companies_by_tax.get(&tax_id) {
        ctx.companies_by_tax.note(tax_id, id);
        return Ok(Some(Resolved::new(id, MatchedBy::TaxId)));
    }

    let found = backend
        .companies()
        .find_all(CompanyFilter {
            tax_id: Some(tax_id.clone()),
        })
        .await?;
    if let Some(company) = found.first() {
        ctx.companies_by_tax.note(tax_id, company.id);
        return Ok(Some(Resolved::new(company.id, MatchedBy::TaxId)));
    }

    backend
        .companies()
        .create(NewCompany {
            tax_id: tax_id.clone(),
            name: row.get("company_name").map(str::to_string),
        })
        .await?;

    // Re-read by tax id instead of trusting the creation echo, so a
    // concurrent duplicate create converges on one record.
    let refetched = backend
        .companies()
        .find_all(CompanyFilter {
            tax_id: Some(tax_id.clone()),
        })
        .await?;
    let company = refetched
        .first()
        .ok_or_else(|| ResolutionError::Store(teim_storage::StoreError::NotFound("company")))?;
    ctx.companies_by_tax.note(tax_id, company.id);
    Ok(Some(Resolved::new(company.id, MatchedBy::Created)))
}

/// Resolve the row's center. `company` is the already-resolved company, when
/// any; without one only the global same-name fallback can match.
pub async fn resolve_center(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    config: &ImportConfig,
    row: &Row,
    company: Option<Uuid>,
) -> Result<Resolved, ResolutionError> {
    let raw_name = row.get("center_name").map(str::to_string);
    let folded = raw_name.as_deref().and_then(fold_name);
    let employer_number = row.get("employer_number").and_then(normalize_identifier);

    let Some(company_id) = company else {
        return global_name_fallback(ctx, folded.as_deref());
    };

    let resolved = resolve_center_in_company(
        backend,
        ctx,
        config,
        company_id,
        raw_name.as_deref(),
        folded.as_deref(),
        employer_number.as_deref(),
    )
    .await?;

    if let (Some(emp), Some(folded)) = (employer_number.as_deref(), folded.as_deref()) {
        ctx.observe_employer_number(company_id, emp, folded);
    }
    Ok(resolved)
}

/// Last-resort match across every company, for rows that resolved no company
/// at all: exact folded name first, then containment in both directions.
fn global_name_fallback(
    ctx: &ImportContext,
    folded: Option<&str>,
) -> Result<Resolved, ResolutionError> {
    let Some(folded) = folded else {
        return Err(ResolutionError::CompanyNotFound);
    };
    if let Some(info) = ctx.centers.values().find(|c| c.folded_name == folded) {
        return Ok(Resolved::new(info.id, MatchedBy::GlobalName));
    }
    if let Some(info) = ctx.centers.values().find(|c| {
        !c.folded_name.is_empty()
            && (c.folded_name.contains(folded) || folded.contains(&c.folded_name))
    }) {
        return Ok(Resolved::new(info.id, MatchedBy::GlobalName));
    }
    Err(ResolutionError::CompanyNotFound)
}

async fn resolve_center_in_company(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    config: &ImportConfig,
    company_id: Uuid,
    raw_name: Option<&str>,
    folded: Option<&str>,
    employer_number: Option<&str>,
) -> Result<Resolved, ResolutionError> {
    let Some(folded) = folded else {
        // Nameless row: reuse (or create) the company's sentinel center.
        return unknown_center(backend, ctx, company_id).await;
    };
    let import_key = center_import_key(company_id, folded);

    // Persisted import key is authoritative.
    if let Some(id) = ctx.centers_by_import_key.get_existing(&import_key) {
        note_match(ctx, company_id, folded, &import_key, id);
        return Ok(Resolved::new(id, MatchedBy::ImportKey));
    }

    // Centers already resolved or created earlier in this run.
    if let Some(id) = ctx.centers_by_import_key.get_seen(&import_key).or_else(|| {
        ctx.centers_by_name
            .get_seen(&(company_id, folded.to_string()))
    }) {
        return Ok(Resolved::new(id, MatchedBy::RunCache));
    }

    if let Some(id) = ctx
        .centers_by_name
        .get_existing(&(company_id, folded.to_string()))
    {
        note_match(ctx, company_id, folded, &import_key, id);
        return Ok(Resolved::new(id, MatchedBy::ExactName));
    }

    if let Some(id) = containment_match(ctx, config, company_id, folded) {
        note_match(ctx, company_id, folded, &import_key, id);
        return Ok(Resolved::new(id, MatchedBy::Containment));
    }

    if let Some(emp) = employer_number {
        match employer_number_match(ctx, company_id, emp, folded) {
            EmployerMatch::Unique(id) => {
                note_match(ctx, company_id, folded, &import_key, id);
                return Ok(Resolved::new(id, MatchedBy::EmployerNumber));
            }
            EmployerMatch::Ambiguous => {
                warn!(
                    company = %company_id,
                    employer_number = emp,
                    center = folded,
                    "employer number ambiguous, refusing to match by it"
                );
            }
            EmployerMatch::None => {}
        }
    }

    create_center(
        backend,
        ctx,
        company_id,
        raw_name.unwrap_or(folded),
        folded,
        &import_key,
        employer_number,
    )
    .await
}

pub fn center_import_key(company_id: Uuid, folded_name: &str) -> String {
    format!("{company_id}_{folded_name}")
}

fn note_match(
    ctx: &mut ImportContext,
    company_id: Uuid,
    folded: &str,
    import_key: &str,
    id: Uuid,
) {
    ctx.centers_by_import_key.note(import_key.to_string(), id);
    ctx.centers_by_name
        .note((company_id, folded.to_string()), id);
}

/// Containment in both directions, gated so a short name cannot swallow an
/// unrelated longer one: the shorter side must reach the configured share of
/// the longer side's length.
fn containment_match(
    ctx: &ImportContext,
    config: &ImportConfig,
    company_id: Uuid,
    folded: &str,
) -> Option<Uuid> {
    let needle_len = folded.chars().count();
    ctx.centers
        .values()
        .filter(|c| c.company_id == company_id && !c.folded_name.is_empty())
        .find(|c| {
            let candidate_len = c.folded_name.chars().count();
            let contains =
                c.folded_name.contains(folded) || folded.contains(c.folded_name.as_str());
            if !contains {
                return false;
            }
            let (short, long) = if needle_len <= candidate_len {
                (needle_len, candidate_len)
            } else {
                (candidate_len, needle_len)
            };
            short as f64 >= config.containment_min_ratio * long as f64
        })
        .map(|c| c.id)
}

enum EmployerMatch {
    Unique(Uuid),
    Ambiguous,
    None,
}

/// Employer-number equality is a weak signal: accept it only when exactly one
/// already-persisted center of the company carries the number and no earlier
/// row of this run attached a different name to it. Centers created during
/// the run are covered by the name observations instead.
fn employer_number_match(
    ctx: &ImportContext,
    company_id: Uuid,
    employer_number: &str,
    folded: &str,
) -> EmployerMatch {
    let candidates: Vec<&CenterInfo> = ctx
        .centers
        .values()
        .filter(|c| {
            c.preexisting
                && c.company_id == company_id
                && c.employer_number.as_deref() == Some(employer_number)
        })
        .collect();
    if candidates.len() != 1 {
        return if candidates.is_empty() {
            EmployerMatch::None
        } else {
            EmployerMatch::Ambiguous
        };
    }
    if let Some(names) = ctx
        .employer_names_seen
        .get(&(company_id, employer_number.to_string()))
    {
        if names.iter().any(|seen| seen != folded) {
            return EmployerMatch::Ambiguous;
        }
    }
    EmployerMatch::Unique(candidates[0].id)
}

async fn unknown_center(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    company_id: Uuid,
) -> Result<Resolved, ResolutionError> {
    let folded = "unknown";
    let import_key = center_import_key(company_id, folded);
    if let Some(id) = ctx.centers_by_import_key.get(&import_key) {
        return Ok(Resolved::new(id, MatchedBy::UnknownCenter));
    }
    let resolved = create_center(
        backend,
        ctx,
        company_id,
        UNKNOWN_CENTER_NAME,
        folded,
        &import_key,
        None,
    )
    .await?;
    Ok(Resolved::new(resolved.id, MatchedBy::UnknownCenter))
}

async fn create_center(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    company_id: Uuid,
    name: &str,
    folded: &str,
    import_key: &str,
    employer_number: Option<&str>,
) -> Result<Resolved, ResolutionError> {
    // Reservation against duplicate creation inside the run. Sequential row
    // processing means a hit can only come from a re-entrant caller; resolve
    // it from the run cache rather than creating twice.
    if ctx.pending_centers.contains(import_key) {
        if let Some(id) = ctx.centers_by_import_key.get(&import_key.to_string()) {
            return Ok(Resolved::new(id, MatchedBy::RunCache));
        }
    }
    ctx.pending_centers.insert(import_key.to_string());

    let created = backend
        .centers()
        .create(NewCenter {
            company_id,
            name: name.to_string(),
            import_key: Some(import_key.to_string()),
            employer_number: employer_number.map(str::to_string),
        })
        .await;
    ctx.pending_centers.remove(import_key);

    let center = created?;
    ctx.note_center(
        CenterInfo {
            id: center.id,
            company_id,
            name: center.name.clone(),
            folded_name: folded.to_string(),
            employer_number: center.employer_number.clone(),
            preexisting: false,
        },
        Some(import_key),
    );
    Ok(Resolved::new(center.id, MatchedBy::Created))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_center(ctx: &mut ImportContext, company_id: Uuid, name: &str, emp: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        let folded = fold_name(name).unwrap();
        ctx.centers_by_name.load((company_id, folded.clone()), id);
        ctx.centers.insert(
            id,
            CenterInfo {
                id,
                company_id,
                name: name.to_string(),
                folded_name: folded,
                employer_number: emp.map(str::to_string),
                preexisting: true,
            },
        );
        id
    }

    #[test]
    fn containment_respects_the_length_ratio_gate() {
        let mut ctx = ImportContext::default();
        let company = Uuid::new_v4();
        let config = ImportConfig::default();
        seed_center(&mut ctx, company, "Centro de Formación Alcalá", None);

        // 6-letter fragment of a much longer name: below the gate.
        assert!(containment_match(&ctx, &config, company, "centro").is_none());
        // Nearly the full name: above the gate.
        assert!(containment_match(&ctx, &config, company, "centro de formacion alcal").is_some());
    }

    #[test]
    fn employer_number_needs_uniqueness_and_consistent_names() {
        let mut ctx = ImportContext::default();
        let company = Uuid::new_v4();
        let id = seed_center(&mut ctx, company, "Centro Norte", Some("28123"));

        assert!(matches!(
            employer_number_match(&ctx, company, "28123", "sede madrid"),
            EmployerMatch::Unique(found) if found == id
        ));

        // A different name already observed for that pair this run makes the
        // number ambiguous.
        ctx.observe_employer_number(company, "28123", "otra sede");
        assert!(matches!(
            employer_number_match(&ctx, company, "28123", "sede madrid"),
            EmployerMatch::Ambiguous
        ));
    }

    #[test]
    fn two_centers_sharing_a_number_never_match_by_it() {
        let mut ctx = ImportContext::default();
        let company = Uuid::new_v4();
        seed_center(&mut ctx, company, "Centro Norte", Some("28123"));
        seed_center(&mut ctx, company, "Centro Sur", Some("28123"));
        assert!(matches!(
            employer_number_match(&ctx, company, "28123", "sede madrid"),
            EmployerMatch::Ambiguous
        ));
    }

    #[test]
    fn global_fallback_matches_exact_before_containment() {
        let mut ctx = ImportContext::default();
        let company = Uuid::new_v4();
        let exact = seed_center(&mut ctx, company, "Centro Alfa", None);
        seed_center(&mut ctx, company, "Centro Alfa Ampliado", None);

        let resolved = global_name_fallback(&ctx, Some("centro alfa")).unwrap();
        assert_eq!(resolved.id, exact);
        assert_eq!(resolved.matched_by, MatchedBy::GlobalName);

        assert!(matches!(
            global_name_fallback(&ctx, None),
            Err(ResolutionError::CompanyNotFound)
        ));
    }
}
