//! User resolution: NSS, then DNI, then external id, then folded full name,
//! then a last-resort case-insensitive exact scan.

use teim_core::identity::{has_letters, is_plausible_email, is_plausible_nss, is_valid_dni_nie};
use teim_core::normalize::{fold_name, normalize_identifier, parse_external_id};
use teim_core::{MatchedBy, NewUser, Row};
use teim_storage::Backend;

use crate::context::ImportContext;
use crate::resolvers::{Resolved, ResolutionError};

/// Canonical user identity fields extracted from one row.
#[derive(Debug, Clone, Default)]
pub struct UserFields {
    pub name: Option<String>,
    pub surname1: Option<String>,
    pub surname2: Option<String>,
    pub dni: Option<String>,
    pub nss: Option<String>,
    pub external_id: Option<i64>,
    pub email: Option<String>,
}

impl UserFields {
    pub fn from_row(row: &Row) -> Self {
        Self {
            name: row.get("name").map(str::to_string),
            surname1: row.get("surname1").map(str::to_string),
            surname2: row.get("surname2").map(str::to_string),
            dni: row.get("dni").and_then(normalize_identifier),
            nss: row.get("nss").and_then(normalize_identifier),
            external_id: row.get("moodle_id_user").and_then(parse_external_id),
            email: row
                .get("email")
                .filter(|e| is_plausible_email(e))
                .map(str::to_string),
        }
    }

    pub fn full_name(&self) -> String {
        [&self.name, &self.surname1, &self.surname2]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    /// True when the row carries any key that can identify a person. Rows
    /// without one are skipped, never created: the import must not
    /// manufacture empty identities.
    pub fn has_identity_signal(&self) -> bool {
        self.dni.as_deref().is_some_and(is_valid_dni_nie)
            || self.nss.as_deref().is_some_and(is_plausible_nss)
            || self.external_id.is_some()
            || self.email.is_some()
            || has_letters(&self.full_name())
    }
}

/// Find the user a row refers to, creating one only when `allow_create` (the
/// `users` phase). Any successful match is noted into the run caches at once
/// so later rows hit it by whichever key they carry.
pub async fn resolve_user(
    backend: &dyn Backend,
    ctx: &mut ImportContext,
    row: &Row,
    allow_create: bool,
) -> Result<(Resolved, UserFields), ResolutionError> {
    let fields = UserFields::from_row(row);

    if let Some(resolved) = lookup(ctx, &fields) {
        ctx.note_user(
            resolved.id,
            fields.nss.as_deref(),
            fields.dni.as_deref(),
            fields.external_id,
            &fields.full_name(),
        );
        return Ok((resolved, fields));
    }

    if !allow_create {
        return Err(ResolutionError::UserNotFound);
    }
    if !fields.has_identity_signal() {
        return Err(ResolutionError::InsufficientUserData);
    }

    let created = backend
        .users()
        .create(NewUser {
            name: fields.name.clone().unwrap_or_default(),
            surname1: fields.surname1.clone(),
            surname2: fields.surname2.clone(),
            dni: fields.dni.clone(),
            nss: fields.nss.clone(),
            external_id: fields.external_id,
            email: fields.email.clone(),
        })
        .await?;
    ctx.note_user(
        created.id,
        fields.nss.as_deref(),
        fields.dni.as_deref(),
        fields.external_id,
        &fields.full_name(),
    );
    Ok((Resolved::new(created.id, MatchedBy::Created), fields))
}

fn lookup(ctx: &ImportContext, fields: &UserFields) -> Option<Resolved> {
    if let Some(nss) = &fields.nss {
        if let Some(id) = ctx.users_by_nss.get(nss) {
            return Some(Resolved::new(id, MatchedBy::Nss));
        }
    }
    if let Some(dni) = &fields.dni {
        if let Some(id) = ctx.users_by_dni.get(dni) {
            return Some(Resolved::new(id, MatchedBy::Dni));
        }
    }
    if let Some(external_id) = fields.external_id {
        if let Some(id) = ctx.users_by_external.get(&external_id) {
            return Some(Resolved::new(id, MatchedBy::ExternalId));
        }
    }
    let full_name = fields.full_name();
    if let Some(folded) = fold_name(&full_name) {
        if let Some(id) = ctx.users_by_name.get(&folded) {
            return Some(Resolved::new(id, MatchedBy::FullName));
        }
        // Last resort: exact name comparison ignoring case only, catching
        // records whose stored spelling folds differently.
        let needle = full_name.to_lowercase();
        if let Some((id, _)) = ctx
            .user_names
            .iter()
            .find(|(_, stored)| stored.to_lowercase() == needle)
        {
            return Some(Resolved::new(*id, MatchedBy::NameScan));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with(pairs: &[(&str, &str)]) -> Row {
        let mut row = Row::new(0);
        for (k, v) in pairs {
            row.set(*k, *v);
        }
        row
    }

    #[test]
    fn identity_signal_requires_something_plausible() {
        let none = UserFields::from_row(&row_with(&[("dni", "123"), ("nss", "12")]));
        assert!(!none.has_identity_signal());

        let by_dni = UserFields::from_row(&row_with(&[("dni", "12345678Z")]));
        assert!(by_dni.has_identity_signal());

        let by_name = UserFields::from_row(&row_with(&[("name", "Ana"), ("surname1", "García")]));
        assert!(by_name.has_identity_signal());

        let by_email = UserFields::from_row(&row_with(&[("email", "ana@example.com")]));
        assert!(by_email.has_identity_signal());
    }

    #[test]
    fn bad_email_is_dropped_at_extraction() {
        let fields = UserFields::from_row(&row_with(&[("email", "not-an-email")]));
        assert!(fields.email.is_none());
    }

    #[test]
    fn nss_beats_dni_in_lookup_order() {
        let mut ctx = ImportContext::default();
        let by_nss = uuid::Uuid::new_v4();
        let by_dni = uuid::Uuid::new_v4();
        ctx.users_by_nss.load("281234567890".into(), by_nss);
        ctx.users_by_dni.load("12345678Z".into(), by_dni);

        let fields = UserFields::from_row(&row_with(&[
            ("nss", "28/1234567890"),
            ("dni", "12345678-Z"),
        ]));
        let resolved = lookup(&ctx, &fields).unwrap();
        assert_eq!(resolved.id, by_nss);
        assert_eq!(resolved.matched_by, MatchedBy::Nss);
    }

    #[test]
    fn name_scan_is_case_insensitive_exact() {
        let mut ctx = ImportContext::default();
        let id = uuid::Uuid::new_v4();
        ctx.user_names.insert(id, "Ana María López".into());

        let fields = UserFields::from_row(&row_with(&[
            ("name", "ana maría"),
            ("surname1", "lópez"),
        ]));
        // Folded map is empty, so only the scan can hit; spelling must match
        // bar case.
        let resolved = lookup(&ctx, &fields).unwrap();
        assert_eq!(resolved.matched_by, MatchedBy::NameScan);
        assert_eq!(resolved.id, id);
    }
}
