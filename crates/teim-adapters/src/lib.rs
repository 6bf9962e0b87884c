//! CSV ingestion: legacy-charset decoding, separator sniffing, and header
//! canonicalization in front of the reconciliation engine.
//!
//! Decoding is a pure function of the original byte buffer, so a caller can
//! re-decode the same upload any number of times. A parse error mid-file
//! truncates the stream and keeps the rows already parsed; it never fails the
//! import.

use serde::Serialize;
use tracing::warn;

use teim_core::Row;

pub const CRATE_NAME: &str = "teim-adapters";

/// Canonical field name -> accepted source header spellings. Applied once at
/// decode time; resolvers only ever see the canonical names.
const HEADER_ALIASES: &[(&str, &[&str])] = &[
    ("dni", &["dni", "nif", "nie", "documento", "dni_nie"]),
    ("nss", &["nss", "num_seg_social", "seg_social", "naf"]),
    ("name", &["name", "nombre", "first_name"]),
    ("surname1", &["surname1", "apellido1", "primer_apellido"]),
    ("surname2", &["surname2", "apellido2", "segundo_apellido"]),
    ("email", &["email", "correo", "mail", "e_mail"]),
    ("moodle_id_user", &["moodle_id_user", "id_user_moodle", "userid", "id_alumno"]),
    ("cif", &["cif", "tax_id", "cif_empresa", "nif_empresa"]),
    ("company_name", &["company_name", "empresa", "razon_social", "company"]),
    ("center_name", &["center_name", "centro", "center", "nombre_centro", "centro_trabajo"]),
    ("employer_number", &["employer_number", "ccc", "cuenta_cotizacion", "num_patronal"]),
    ("start_date", &["start_date", "fecha_alta", "f_alta", "fecha_inicio"]),
    ("end_date", &["end_date", "fecha_baja", "f_baja", "fecha_fin"]),
    ("course_name", &["course_name", "curso", "course", "nombre_curso"]),
    ("moodle_id_course", &["moodle_id_course", "id_curso_moodle", "courseid", "id_curso"]),
    ("course_hours", &["course_hours", "horas", "hours"]),
    ("course_description", &["course_description", "descripcion", "description"]),
    ("group_name", &["group_name", "grupo", "group", "nombre_grupo"]),
    ("moodle_id_group", &["moodle_id_group", "id_grupo_moodle", "groupid", "id_grupo"]),
    ("progress_pct", &["progress_pct", "porcentaje", "progreso", "progress"]),
    ("time_spent", &["time_spent", "tiempo", "dedicacion", "tiempo_total"]),
];

/// Decoded upload: rows in file order plus decode metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedCsv {
    pub rows: Vec<Row>,
    pub separator: u8,
    /// True when a parse error cut the file short; `rows` holds everything
    /// parsed before the error.
    pub truncated: bool,
}

/// Map a raw header to its canonical field name. Unknown headers pass through
/// lowercased so extra source columns stay readable in diagnostics.
pub fn canonical_header(raw: &str) -> String {
    let key = raw
        .trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .replace([' ', '-', '.'], "_");
    for (canonical, aliases) in HEADER_ALIASES {
        if aliases.contains(&key.as_str()) {
            return (*canonical).to_string();
        }
    }
    key
}

/// Separator choice inspects only the first line: `;` wins when the line
/// contains a semicolon and no comma.
pub fn detect_separator(first_line: &str) -> u8 {
    if first_line.contains(';') && !first_line.contains(',') {
        b';'
    } else {
        b','
    }
}

/// Decode an uploaded byte buffer into canonical rows.
///
/// The source exports are a fixed legacy single-byte charset (Windows-1252);
/// UTF-8 is never assumed.
pub fn decode_rows(bytes: &[u8]) -> DecodedCsv {
    let (text, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
    if had_errors {
        warn!("csv decode replaced malformed byte sequences");
    }

    let first_line = text.lines().next().unwrap_or_default();
    let separator = detect_separator(first_line);

    // Strict field counts: a ragged row is a parse error, and parse errors
    // truncate rather than abort.
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(canonical_header).collect(),
        Err(err) => {
            warn!(error = %err, "csv header row unreadable");
            return DecodedCsv {
                rows: Vec::new(),
                separator,
                truncated: true,
            };
        }
    };

    let mut rows = Vec::new();
    let mut truncated = false;
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                // Whatever parsed so far is returned; the import goes on.
                warn!(row = index, error = %err, "csv parse error, truncating stream");
                truncated = true;
                break;
            }
        };
        let mut row = Row::new(index);
        for (header, value) in headers.iter().zip(record.iter()) {
            if !value.is_empty() {
                row.set(header.clone(), value.to_string());
            }
        }
        rows.push(row);
    }

    DecodedCsv {
        rows,
        separator,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semicolon_wins_only_without_commas() {
        assert_eq!(detect_separator("dni;nombre;cif"), b';');
        assert_eq!(detect_separator("dni,nombre,cif"), b',');
        assert_eq!(detect_separator("dni;nombre,cif"), b',');
        assert_eq!(detect_separator(""), b',');
    }

    #[test]
    fn headers_collapse_to_canonical_names() {
        assert_eq!(canonical_header("DNI"), "dni");
        assert_eq!(canonical_header(" Nombre "), "name");
        assert_eq!(canonical_header("CIF"), "cif");
        assert_eq!(canonical_header("CCC"), "employer_number");
        assert_eq!(canonical_header("Fecha Alta"), "start_date");
        assert_eq!(canonical_header("columna_rara"), "columna_rara");
    }

    #[test]
    fn decodes_windows_1252_bytes() {
        // "nombre;centro\nJosé;España" with 0xE9/0xF1 single-byte accents.
        let mut bytes = b"nombre;centro\nJos".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b";Espa");
        bytes.push(0xF1);
        bytes.extend_from_slice(b"a");
        let decoded = decode_rows(&bytes);
        assert_eq!(decoded.separator, b';');
        assert_eq!(decoded.rows.len(), 1);
        assert_eq!(decoded.rows[0].get("name"), Some("José"));
        assert_eq!(decoded.rows[0].get("center_name"), Some("España"));
    }

    #[test]
    fn parse_error_truncates_but_keeps_prior_rows() {
        let csv = "dni,nombre\n11111111H,Ana\n22222222J,Luis,extra,fields\n33333333P,Eva\n";
        let decoded = decode_rows(csv.as_bytes());
        assert!(decoded.truncated);
        assert_eq!(decoded.rows.len(), 1);
        assert_eq!(decoded.rows[0].get("dni"), Some("11111111H"));
    }

    #[test]
    fn decoding_is_restartable_from_the_same_buffer() {
        let csv = b"dni;centro\n11111111H;Centro Uno\n22222222J;Centro Dos\n";
        let first = decode_rows(csv);
        let second = decode_rows(csv);
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.rows.len(), 2);
    }

    #[test]
    fn blank_fields_stay_absent() {
        let decoded = decode_rows(b"dni,cif,center_name\n12345678Z,,Centro X\n");
        assert_eq!(decoded.rows[0].get("cif"), None);
        assert_eq!(decoded.rows[0].get("center_name"), Some("Centro X"));
    }
}
