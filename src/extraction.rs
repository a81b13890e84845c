// Natural-language parameter extraction for Brazilian-Portuguese financial
// questions: monetary thresholds, counts, day windows, month/year references
// and the canonical period boundaries, plus R$ rendering.

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;

/// Values at or below this are treated as counts or day references, not
/// money. 31 is the largest plausible day-of-month; do not change without
/// evidence (see DESIGN.md).
pub const MONETARY_CUTOFF: f64 = 31.0;

/// Portuguese month names in calendar order. The cedilla-free spelling
/// "marco" is also accepted for March.
const MONTH_NAMES: [&str; 12] = [
    "janeiro",
    "fevereiro",
    "março",
    "abril",
    "maio",
    "junho",
    "julho",
    "agosto",
    "setembro",
    "outubro",
    "novembro",
    "dezembro",
];

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Optional currency marker, `.` thousands groups, `,` decimals
        Regex::new(r"(?i)(?:r\$\s*)?(\d{1,3}(?:\.\d{3})+(?:,\d+)?|\d+(?:,\d+)?)")
            .expect("number pattern is valid")
    })
}

fn day_window_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*dias?").expect("day window pattern is valid"))
}

fn year_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(20\d{2})\b").expect("year pattern is valid"))
}

/// Every numeric token in `text`, normalized from Brazilian notation
/// (`1.234,56` -> 1234.56) in order of appearance.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    number_pattern()
        .captures_iter(text)
        .filter_map(|cap| {
            let raw = cap.get(1)?.as_str();
            let normalized = raw.replace('.', "").replace(',', ".");
            normalized.parse::<f64>().ok()
        })
        .collect()
}

/// Monetary threshold embedded in `text`. Picks the largest value above
/// [`MONETARY_CUTOFF`]; when every number looks like a count or a day
/// reference, falls back to the first one; with no numbers at all,
/// `default`.
pub fn extract_currency_threshold(text: &str, default: f64) -> f64 {
    let numbers = extract_numbers(text);

    let monetary = numbers
        .iter()
        .copied()
        .filter(|n| *n > MONETARY_CUTOFF)
        .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |m| m.max(n))));

    monetary.or_else(|| numbers.first().copied()).unwrap_or(default)
}

/// Count threshold for HAVING-style filters ("mais de 5 lançamentos").
/// Unlike the currency extractor, small integers are exactly what we
/// want here, so the first positive truncated number wins.
pub fn extract_having_threshold(text: &str, default: i64) -> i64 {
    extract_numbers(text)
        .into_iter()
        .map(|n| n.trunc() as i64)
        .find(|n| *n > 0)
        .unwrap_or(default)
}

/// Trailing day window ("nos últimos 15 dias" -> 15). The spelled-out
/// "trinta" is common enough in questions to deserve recognition.
pub fn extract_day_window(text: &str, default: i64) -> i64 {
    if let Some(cap) = day_window_pattern().captures(text) {
        if let Ok(days) = cap[1].parse::<i64>() {
            return days;
        }
    }
    if text.to_lowercase().contains("trinta") {
        return 30;
    }
    default
}

/// Month and year referenced in `text` ("notas de março de 2023" ->
/// (3, 2023)). The year defaults to `current_year` when the question
/// names only the month; no month name means `None`.
pub fn extract_month_year(text: &str, current_year: i32) -> Option<(u32, i32)> {
    let lowered = text.to_lowercase();

    let month = MONTH_NAMES.iter().position(|name| {
        lowered.contains(name) || (*name == "março" && lowered.contains("marco"))
    })? as u32
        + 1;

    let year = year_pattern()
        .captures(&lowered)
        .and_then(|cap| cap[1].parse::<i32>().ok())
        .unwrap_or(current_year);

    Some((month, year))
}

/// Localized month name for rendering, 1-based. Out-of-range input
/// (including 0) renders empty.
pub fn month_name(month: u32) -> &'static str {
    month
        .checked_sub(1)
        .and_then(|index| MONTH_NAMES.get(index as usize))
        .copied()
        .unwrap_or("")
}

pub fn start_of_current_month(today: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(today.year(), today.month(), 1).expect("first day of month is valid")
}

/// Quarters start at Jan/Apr/Jul/Oct 1st.
pub fn start_of_current_quarter(today: NaiveDate) -> NaiveDate {
    let quarter_month = ((today.month() - 1) / 3) * 3 + 1;
    NaiveDate::from_ymd_opt(today.year(), quarter_month, 1)
        .expect("first day of quarter is valid")
}

/// Brazilian Real rendering: `R$ 1.234,50`. Handlers depend on this exact
/// format.
pub fn format_currency(value: f64) -> String {
    let negative = value < 0.0;
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = cents / 100;
    let fraction = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    let sign = if negative { "-" } else { "" };
    format!("R$ {sign}{grouped},{fraction:02}")
}

/// Percentage with one decimal and Brazilian comma: `12,3%`.
pub fn format_percent(value: f64) -> String {
    format!("{value:.1}%").replace('.', ",")
}

// ============================================================================
// TESTS
// ============================================================================
