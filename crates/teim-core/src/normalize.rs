//! Pure field normalizers. Every function here is total: unparsable input
//! yields `None`, never an error.

use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Largest epoch value (seconds) accepted as a date: 2100-01-01T00:00:00Z.
/// Anything above is tried as milliseconds instead, so short numeric codes
/// never misparse as dates.
const EPOCH_SECS_MAX: i64 = 4_102_444_800;

/// Uppercase alphanumeric identifier derived from a raw DNI/NSS value.
/// Empty and all-zero identifiers count as absent.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '0') {
        None
    } else {
        Some(cleaned)
    }
}

/// Diacritic-stripped, lowercased, whitespace-collapsed name key.
pub fn fold_name(raw: &str) -> Option<String> {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(|c| c.to_lowercase())
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let folded = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    if folded.is_empty() {
        None
    } else {
        Some(folded)
    }
}

fn is_combining_mark(c: char) -> bool {
    // Combining Diacritical Marks plus the supplement/extended blocks NFD
    // produces for Latin input.
    matches!(u32::from(c), 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF)
}

/// Flexible date parsing: ISO/RFC3339, epoch seconds or milliseconds,
/// `dd/mm/yyyy`, `dd-mm-yyyy`, `yyyy-mm-dd`, `yyyy/mm/dd`. Anything else is
/// absent; the parser never guesses.
pub fn parse_date_flexible(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = raw.parse().ok()?;
        let secs = if n <= EPOCH_SECS_MAX {
            n
        } else if n / 1000 <= EPOCH_SECS_MAX {
            n / 1000
        } else {
            return None;
        };
        return DateTime::from_timestamp(secs, 0).map(|dt| dt.date_naive());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }

    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y",
        "%d-%m-%Y",
        "%Y-%m-%d",
        "%Y/%m/%d",
    ] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }

    None
}

static HMS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:(\d+)\s*h)?\s*(?:(\d+)\s*m)?\s*(?:(\d+)\s*s)?\s*$")
        .expect("invalid duration regex")
});

/// Duration in seconds from `HH:MM:SS`, `"06h 14m 24s"` style, or a raw
/// integer. Raw values over `i32::MAX` are reinterpreted as milliseconds and
/// divided by 1000 before the bound check; the result is clamped to the
/// positive `i32` range.
pub fn parse_duration_secs(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some((h, m, s)) = split_colon_triplet(raw) {
        let total = h * 3600 + m * 60 + s;
        return Some(clamp_secs(total));
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        let mut n: i64 = raw.parse().ok()?;
        if n > i64::from(i32::MAX) {
            n /= 1000;
        }
        return Some(clamp_secs(n));
    }

    let caps = HMS_RE.captures(raw)?;
    let h: i64 = caps.get(1).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
    let m: i64 = caps.get(2).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
    let s: i64 = caps.get(3).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
    if caps.get(1).is_none() && caps.get(2).is_none() && caps.get(3).is_none() {
        return None;
    }
    Some(clamp_secs(h * 3600 + m * 60 + s))
}

fn split_colon_triplet(raw: &str) -> Option<(i64, i64, i64)> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let h = parts[0].trim().parse().ok()?;
    let m = parts[1].trim().parse().ok()?;
    let s = parts[2].trim().parse().ok()?;
    Some((h, m, s))
}

fn clamp_secs(n: i64) -> i32 {
    n.clamp(0, i64::from(i32::MAX)) as i32
}

/// Percentage clamped into `[0, 100]` and rounded to 2 decimals. Accepts a
/// comma decimal separator.
pub fn parse_percentage(raw: &str) -> Option<f64> {
    let raw = raw.trim().trim_end_matches('%').trim().replace(',', ".");
    if raw.is_empty() {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some((value.clamp(0.0, 100.0) * 100.0).round() / 100.0)
}

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>|\[[^\]]*\]").expect("invalid tag regex"));

/// Strip HTML and `[pseudo]` tags from a free-text description, decode the
/// handful of entities the source exports actually emit, and collapse
/// whitespace.
pub fn sanitize_description(raw: &str) -> Option<String> {
    let stripped = TAG_RE.replace_all(raw, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// External LMS numeric id. Only plain positive integers qualify.
pub fn parse_external_id(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_strips_punctuation_and_uppercases() {
        assert_eq!(
            normalize_identifier(" 12.345.678-z "),
            Some("12345678Z".to_string())
        );
        assert_eq!(normalize_identifier(""), None);
        assert_eq!(normalize_identifier("0000-00"), None);
        assert_eq!(normalize_identifier("---"), None);
    }

    #[test]
    fn name_folding_drops_diacritics_and_case() {
        assert_eq!(
            fold_name("  José   GARCÍA  Núñez "),
            Some("jose garcia nunez".to_string())
        );
        assert_eq!(fold_name("¡¡!!"), None);
    }

    #[test]
    fn date_parses_all_documented_shapes() {
        let expected = NaiveDate::from_ymd_opt(2023, 5, 17).unwrap();
        for raw in [
            "17/05/2023",
            "17-05-2023",
            "2023-05-17",
            "2023/05/17",
            "2023-05-17T08:30:00",
            "2023-05-17T08:30:00+02:00",
            "1684303800",
            "1684303800000",
        ] {
            assert_eq!(parse_date_flexible(raw), Some(expected), "input {raw}");
        }
        assert_eq!(parse_date_flexible("yesterday"), None);
        assert_eq!(parse_date_flexible("32/01/2023"), None);
        assert_eq!(parse_date_flexible(""), None);
    }

    #[test]
    fn duration_handles_hms_and_prose_forms() {
        assert_eq!(parse_duration_secs("01:02:03"), Some(3723));
        assert_eq!(parse_duration_secs("06h 14m 24s"), Some(22464));
        assert_eq!(parse_duration_secs("45m"), Some(2700));
        assert_eq!(parse_duration_secs("90"), Some(90));
        assert_eq!(parse_duration_secs("nope"), None);
    }

    #[test]
    fn duration_reinterprets_oversized_values_as_millis() {
        // 9_999_999_999 > i32::MAX, so it is read as milliseconds.
        assert_eq!(parse_duration_secs("9999999999"), Some(9_999_999));
        let huge = format!("{}", i64::from(i32::MAX) * 2000);
        assert_eq!(parse_duration_secs(&huge), Some(i32::MAX));
    }

    #[test]
    fn percentage_clamps_and_rounds() {
        assert_eq!(parse_percentage("87,456"), Some(87.46));
        assert_eq!(parse_percentage("120"), Some(100.0));
        assert_eq!(parse_percentage("-3"), Some(0.0));
        assert_eq!(parse_percentage("66.6%"), Some(66.6));
        assert_eq!(parse_percentage("n/a"), None);
    }

    #[test]
    fn description_loses_tags_and_entities() {
        assert_eq!(
            sanitize_description("<p>Curso de <b>PRL</b></p> [b]b&aacute;sico[/b] &amp; m&#39;as"),
            Some("Curso de PRL b&aacute;sico & m'as".to_string())
        );
        assert_eq!(sanitize_description("<br/>"), None);
    }

    #[test]
    fn external_id_rejects_non_numeric() {
        assert_eq!(parse_external_id("77"), Some(77));
        assert_eq!(parse_external_id("77a"), None);
        assert_eq!(parse_external_id("0"), None);
        assert_eq!(parse_external_id(""), None);
    }
}
