// Semantic insight handlers: independent financial analyses matched by
// keyword rules and combined into the semantic-mode context. Each returns
// a prose paragraph, or None when the data cannot support the analysis.

use anyhow::Result;
use chrono::{Duration, Local, NaiveDate};
use rusqlite::{params, Connection};

use crate::db::{self, MovementDoc, TIPO_RECEBER};
use crate::extraction::{format_currency, format_percent};
use crate::intents::keywords_match;

/// Maintenance share of payables at or above this is flagged as elevated.
const MAINTENANCE_ALERT_PCT: f64 = 30.0;

/// Period-over-period change beyond ±10% counts as a trend.
const TREND_BAND_PCT: f64 = 10.0;

/// Terms identifying maintenance/operation spending in classification or
/// description text (Unicode-lowercased before matching).
const MAINTENANCE_TERMS: &[&str] = &["manuten", "operac", "operaç", "maquin", "máquin"];

const INPUT_SUPPLY_TERMS: &[&str] = &["insumo"];

const LOGISTICS_TERMS: &[&str] = &[
    "logíst",
    "logist",
    "frete",
    "transporte",
    "armazenagem",
    "secagem",
];

pub type InsightHandler = fn(&Connection, NaiveDate) -> Result<Option<String>>;

pub struct InsightRule {
    pub name: &'static str,
    pub keywords_all: &'static [&'static str],
    pub keywords_any: &'static [&'static str],
    pub handler: InsightHandler,
}

pub const RULES: &[InsightRule] = &[
    InsightRule {
        name: "manutencao_de_maquinario",
        keywords_all: &["manuten"],
        keywords_any: &["maquin", "máquin"],
        handler: machinery_maintenance_ratio,
    },
    InsightRule {
        name: "tendencia_de_insumos",
        keywords_all: &["insumo"],
        keywords_any: &["evolu", "compar", "tenden", "tendên"],
        handler: input_supply_trend,
    },
    InsightRule {
        name: "clientes_por_receita",
        keywords_all: &["cliente", "receita"],
        keywords_any: &[],
        handler: top_clients_by_revenue,
    },
    InsightRule {
        name: "fornecedores_em_atraso",
        keywords_all: &["fornecedor"],
        keywords_any: &["atras"],
        handler: suppliers_in_arrears,
    },
    InsightRule {
        name: "custos_logisticos",
        keywords_all: &[],
        keywords_any: &["logist", "logíst"],
        handler: logistics_costs_half_year,
    },
];

/// Run every rule whose keywords match `question` and join the paragraphs
/// their handlers produce. `None` when nothing fires or no handler has
/// enough data.
pub fn collect(conn: &Connection, question: &str) -> Result<Option<String>> {
    collect_at(conn, question, Local::now().date_naive())
}

pub fn collect_at(
    conn: &Connection,
    question: &str,
    today: NaiveDate,
) -> Result<Option<String>> {
    let lowered = question.to_lowercase();
    let mut paragraphs = Vec::new();

    for rule in RULES {
        if !keywords_match(&lowered, rule.keywords_all, rule.keywords_any, &[]) {
            continue;
        }
        if let Some(paragraph) = (rule.handler)(conn, today)? {
            paragraphs.push(paragraph);
        }
    }

    if paragraphs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(paragraphs.join("\n\n")))
    }
}

fn doc_matches_terms(doc: &MovementDoc, terms: &[&str]) -> bool {
    let mut haystack = doc.descricao.clone().unwrap_or_default();
    for classificacao in &doc.classificacoes {
        haystack.push(' ');
        haystack.push_str(classificacao);
    }
    let lowered = haystack.to_lowercase();
    terms.iter().any(|term| lowered.contains(term))
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_iso(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

// ============================================================================
// HANDLERS
// ============================================================================

/// Insight 1: maintenance/operation share of payables over 180 days.
fn machinery_maintenance_ratio(conn: &Connection, today: NaiveDate) -> Result<Option<String>> {
    let cutoff = iso(today - Duration::days(180));
    let docs = db::load_payables_since(conn, &cutoff)?;

    let total: f64 = docs.iter().map(|d| d.valor_total).sum();
    if total <= 0.0 {
        return Ok(None);
    }

    let maintenance: f64 = docs
        .iter()
        .filter(|d| doc_matches_terms(d, MAINTENANCE_TERMS))
        .map(|d| d.valor_total)
        .sum();
    let pct = maintenance / total * 100.0;

    let verdict = if pct >= MAINTENANCE_ALERT_PCT {
        "Percentual elevado, acima de 30% do total."
    } else {
        "Percentual dentro da faixa esperada."
    };

    Ok(Some(format!(
        "Nos últimos 180 dias, os gastos com manutenção e operação de maquinário somaram {}, \
         o que representa {} do total de contas a pagar ({}). {verdict}",
        format_currency(maintenance),
        format_percent(pct),
        format_currency(total),
    )))
}

/// Insight 2: input-supply spend over 90 days against the same window one
/// year earlier.
fn input_supply_trend(conn: &Connection, today: NaiveDate) -> Result<Option<String>> {
    let prior_start = today - Duration::days(455);
    let prior_end = today - Duration::days(365);
    let current_start = today - Duration::days(90);

    let docs = db::load_payables_since(conn, &iso(prior_start))?;

    let mut current = 0.0;
    let mut prior = 0.0;
    for doc in docs.iter().filter(|d| doc_matches_terms(d, INPUT_SUPPLY_TERMS)) {
        let Some(date) = doc.data_emissao.as_deref().and_then(parse_iso) else {
            continue;
        };
        if date > current_start && date <= today {
            current += doc.valor_total;
        } else if date > prior_start && date <= prior_end {
            prior += doc.valor_total;
        }
    }

    // No base period, no percentage worth reporting
    if prior <= 0.0 {
        return Ok(None);
    }

    let change = (current - prior) / prior * 100.0;
    let verdict = if change > TREND_BAND_PCT {
        "Tendência de alta."
    } else if change < -TREND_BAND_PCT {
        "Tendência de queda."
    } else {
        "Cenário de estabilidade."
    };

    Ok(Some(format!(
        "O gasto com insumos agrícolas nos últimos 90 dias foi de {}, contra {} no mesmo \
         período do ano anterior, uma variação de {}. {verdict}",
        format_currency(current),
        format_currency(prior),
        format_percent(change),
    )))
}

/// Insight 3: top 5 billed-to parties by receivable revenue over 90 days.
fn top_clients_by_revenue(conn: &Connection, today: NaiveDate) -> Result<Option<String>> {
    let cutoff = iso(today - Duration::days(90));
    let mut stmt = conn.prepare(
        "SELECT fat.razaosocial, SUM(m.valor_total) AS total
           FROM movimento_contas m
           JOIN pessoas fat ON fat.id = m.faturado_id
          WHERE m.tipo = ?1 AND m.data_emissao >= ?2
          GROUP BY fat.id
          ORDER BY total DESC
          LIMIT 5",
    )?;
    let rows = stmt
        .query_map(params![TIPO_RECEBER, cutoff], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut paragraph = String::from("Principais clientes por receita nos últimos 90 dias:");
    for (nome, total) in rows {
        paragraph.push_str(&format!(
            "\n- {}: {}",
            nome.as_deref().unwrap_or("-"),
            format_currency(total)
        ));
    }
    Ok(Some(paragraph))
}

/// Insight 4: suppliers whose installments are overdue with open balance.
fn suppliers_in_arrears(conn: &Connection, today: NaiveDate) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT f.razaosocial, COUNT(*) AS n, SUM(pc.valor_saldo) AS saldo
           FROM parcelas_contas pc
           JOIN movimento_contas m ON m.id = pc.movimento_id
           JOIN pessoas f ON f.id = m.fornecedor_id
          WHERE pc.valor_saldo > 0 AND pc.data_vencimento < ?1
          GROUP BY f.id
          ORDER BY saldo DESC",
    )?;
    let rows = stmt
        .query_map(params![iso(today)], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut paragraph = String::from("Fornecedores com parcelas em atraso:");
    for (nome, count, saldo) in rows {
        paragraph.push_str(&format!(
            "\n- {}: {count} parcelas, saldo {}",
            nome.as_deref().unwrap_or("-"),
            format_currency(saldo)
        ));
    }
    Ok(Some(paragraph))
}

/// Insight 5: logistics-related payables over 180 days, grouped by the
/// movement's classification.
fn logistics_costs_half_year(conn: &Connection, today: NaiveDate) -> Result<Option<String>> {
    let cutoff = iso(today - Duration::days(180));
    let docs = db::load_payables_since(conn, &cutoff)?;

    let mut groups: Vec<(String, f64)> = Vec::new();
    let mut grand_total = 0.0;
    for doc in docs.iter().filter(|d| doc_matches_terms(d, LOGISTICS_TERMS)) {
        let group = doc
            .classificacoes
            .first()
            .cloned()
            .unwrap_or_else(|| "Não classificado".to_string());
        grand_total += doc.valor_total;
        match groups.iter_mut().find(|(name, _)| *name == group) {
            Some((_, total)) => *total += doc.valor_total,
            None => groups.push((group, doc.valor_total)),
        }
    }

    if groups.is_empty() {
        return Ok(None);
    }
    groups.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut paragraph = String::from("Custos logísticos nos últimos 180 dias:");
    for (group, total) in &groups {
        paragraph.push_str(&format!("\n- {group}: {}", format_currency(*total)));
    }
    paragraph.push_str(&format!("\nTotal: {}", format_currency(grand_total)));
    Ok(Some(paragraph))
}

// ============================================================================
// TESTS
// ============================================================================
