//! Post-associate invariant repair: every user with affiliations ends up with
//! exactly one main affiliation.

use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;

use teim_storage::{AffiliationFilter, Backend, StoreError};

/// Sweep all affiliations; for every user lacking a main one, promote the
/// association with the latest start date (or the first encountered when no
/// dates exist). Each correction runs in its own transaction so one user's
/// failure cannot block the others. Returns the number of corrections applied.
pub async fn ensure_main_affiliations(backend: &dyn Backend) -> Result<usize, StoreError> {
    let all = backend
        .affiliations()
        .find_all(AffiliationFilter::default())
        .await?;

    let mut by_user: BTreeMap<Uuid, Vec<&teim_core::Affiliation>> = BTreeMap::new();
    for affiliation in &all {
        by_user.entry(affiliation.user_id).or_default().push(affiliation);
    }

    let mut repaired = 0usize;
    for (user_id, affiliations) in by_user {
        if affiliations.iter().any(|a| a.is_main) {
            continue;
        }
        let chosen = affiliations
            .iter()
            .filter(|a| a.start_date.is_some())
            .max_by_key(|a| a.start_date)
            .or_else(|| affiliations.first())
            .expect("user bucket never empty");

        match backend
            .affiliations()
            .set_main_exclusive(user_id, chosen.id)
            .await
        {
            Ok(()) => repaired += 1,
            Err(err) => {
                warn!(user = %user_id, error = %err, "main affiliation repair failed for user");
            }
        }
    }
    Ok(repaired)
}
