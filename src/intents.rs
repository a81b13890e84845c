// Intent matching: an ordered list of keyword rules dispatched first-match-
// wins. Each handler answers deterministically from the store, bypassing
// the LLM, and may decline (Ok(None)) so the matcher keeps falling through.

use anyhow::Result;
use chrono::{Datelike, Duration, Local, NaiveDate};
use rusqlite::{params, Connection};

use crate::db::{CLASSIFICACAO_DESPESA, TIPO_PAGAR, TIPO_RECEBER};
use crate::extraction::{
    extract_currency_threshold, extract_day_window, extract_having_threshold, extract_month_year,
    format_currency, month_name, start_of_current_month, start_of_current_quarter,
};

/// Defaults documented by the consultation contract.
const DEFAULT_DAY_WINDOW: i64 = 30;
const DEFAULT_PAYABLE_THRESHOLD: f64 = 10_000.0;
const DEFAULT_HAVING_COUNT: i64 = 5;
const DEFAULT_QUARTER_THRESHOLD: f64 = 50_000.0;

/// Row bound for the payables listing.
const MAX_PAYABLE_ROWS: usize = 50;

pub type IntentHandler = fn(&Connection, &str, NaiveDate) -> Result<Option<String>>;

/// One keyword rule. Every `keywords_all` term must appear in the lowered
/// question; `keywords_any` and `requires_terms` each need at least one
/// hit when non-empty (the latter exists for synonym pairs like
/// "mês"/"mes"). Declaration order in [`RULES`] is a contract.
pub struct IntentRule {
    pub name: &'static str,
    pub keywords_all: &'static [&'static str],
    pub keywords_any: &'static [&'static str],
    pub requires_terms: &'static [&'static str],
    pub handler: IntentHandler,
}

impl IntentRule {
    pub fn matches(&self, lowered_question: &str) -> bool {
        keywords_match(
            lowered_question,
            self.keywords_all,
            self.keywords_any,
            self.requires_terms,
        )
    }
}

/// Shared keyword predicate: every `all` term, at least one `any` term and
/// at least one `required` term (the optional lists match vacuously when
/// empty). Also used by the semantic insight rules.
pub fn keywords_match(
    lowered_question: &str,
    all: &[&str],
    any: &[&str],
    required: &[&str],
) -> bool {
    let all_hit = all.iter().all(|kw| lowered_question.contains(kw));
    let any_hit = any.is_empty() || any.iter().any(|kw| lowered_question.contains(kw));
    let required_hit =
        required.is_empty() || required.iter().any(|kw| lowered_question.contains(kw));
    all_hit && any_hit && required_hit
}

pub const RULES: &[IntentRule] = &[
    IntentRule {
        name: "contas_a_pagar_acima_de_valor",
        keywords_all: &["conta", "pagar"],
        keywords_any: &["acima", "maior", "superior"],
        requires_terms: &[],
        handler: payables_above_threshold,
    },
    IntentRule {
        name: "fornecedores_frequentes_no_mes",
        keywords_all: &["fornecedor"],
        keywords_any: &["lançamento", "lancamento", "entrada"],
        requires_terms: &["mês", "mes"],
        handler: frequent_suppliers_this_month,
    },
    IntentRule {
        name: "faturados_com_parcelas_abertas",
        keywords_all: &["faturado", "parcela"],
        keywords_any: &["aberta", "aberto", "pendente"],
        requires_terms: &[],
        handler: billed_with_open_installments,
    },
    IntentRule {
        name: "classificacoes_acima_no_trimestre",
        keywords_all: &["classifica"],
        keywords_any: &["trimestre", "trimestral"],
        requires_terms: &[],
        handler: classifications_above_threshold_quarter,
    },
    IntentRule {
        name: "notas_a_receber_no_mes",
        keywords_all: &["receber", "nota"],
        keywords_any: &[],
        requires_terms: &[],
        handler: receivables_in_named_month,
    },
];

/// Try every rule in declaration order against `question`; the first
/// matching rule whose handler produces an answer wins.
pub fn dispatch(conn: &Connection, question: &str) -> Result<Option<String>> {
    dispatch_at(conn, question, Local::now().date_naive())
}

pub fn dispatch_at(
    conn: &Connection,
    question: &str,
    today: NaiveDate,
) -> Result<Option<String>> {
    let lowered = question.to_lowercase();
    for rule in RULES {
        if !rule.matches(&lowered) {
            continue;
        }
        if let Some(answer) = (rule.handler)(conn, question, today)? {
            return Ok(Some(answer));
        }
    }
    Ok(None)
}

// ============================================================================
// STRUCTURED HANDLERS
// ============================================================================

/// Intent 1: payables at or above a monetary threshold within a trailing
/// day window.
fn payables_above_threshold(
    conn: &Connection,
    question: &str,
    today: NaiveDate,
) -> Result<Option<String>> {
    let days = extract_day_window(question, DEFAULT_DAY_WINDOW);
    let threshold = extract_currency_threshold(question, DEFAULT_PAYABLE_THRESHOLD);
    let cutoff = (today - Duration::days(days)).format("%Y-%m-%d").to_string();

    let mut stmt = conn.prepare(
        "SELECT m.numero_nota_fiscal, m.data_emissao, m.valor_total,
                f.razaosocial, fat.razaosocial, m.descricao
           FROM movimento_contas m
           LEFT JOIN pessoas f ON f.id = m.fornecedor_id
           LEFT JOIN pessoas fat ON fat.id = m.faturado_id
          WHERE m.tipo = ?1 AND m.valor_total >= ?2 AND m.data_emissao >= ?3
          ORDER BY m.data_emissao DESC
          LIMIT ?4",
    )?;
    let rows = stmt
        .query_map(
            params![TIPO_PAGAR, threshold, cutoff, MAX_PAYABLE_ROWS as i64],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(Some(format!(
            "Nenhuma conta a pagar acima de {} encontrada nos últimos {days} dias.",
            format_currency(threshold)
        )));
    }

    let mut answer = format!(
        "Contas a pagar acima de {} nos últimos {days} dias:",
        format_currency(threshold)
    );
    for (nf, data, valor, fornecedor, faturado, descricao) in rows {
        answer.push_str(&format!(
            "\n- Nota {}, emitida em {}, valor {}, fornecedor: {}, faturado: {}, descricao: {}",
            nf.as_deref().unwrap_or("-"),
            data.as_deref().unwrap_or("-"),
            format_currency(valor),
            fornecedor.as_deref().unwrap_or("-"),
            faturado.as_deref().unwrap_or("-"),
            descricao.as_deref().unwrap_or("-"),
        ));
    }
    Ok(Some(answer))
}

/// Intent 2: suppliers with more than N movements since the start of the
/// current month.
fn frequent_suppliers_this_month(
    conn: &Connection,
    question: &str,
    today: NaiveDate,
) -> Result<Option<String>> {
    let having = extract_having_threshold(question, DEFAULT_HAVING_COUNT);
    let since = start_of_current_month(today).format("%Y-%m-%d").to_string();

    let mut stmt = conn.prepare(
        "SELECT p.razaosocial, COUNT(*) AS n, SUM(m.valor_total) AS total
           FROM movimento_contas m
           JOIN pessoas p ON p.id = m.fornecedor_id
          WHERE m.data_emissao >= ?1
          GROUP BY p.id
         HAVING n > ?2
          ORDER BY n DESC",
    )?;
    let rows = stmt
        .query_map(params![since, having], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(Some(format!(
            "Nenhum fornecedor com mais de {having} lançamentos neste mês."
        )));
    }

    let mut answer = format!("Fornecedores com mais de {having} lançamentos neste mês:");
    for (nome, count, total) in rows {
        answer.push_str(&format!(
            "\n- {}: {count} lançamentos, total {}",
            nome.as_deref().unwrap_or("-"),
            format_currency(total)
        ));
    }
    Ok(Some(answer))
}

/// Intent 3: billed-to parties holding installments with positive
/// remaining balance.
fn billed_with_open_installments(
    conn: &Connection,
    _question: &str,
    _today: NaiveDate,
) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT p.razaosocial, COUNT(*) AS n, SUM(pc.valor_saldo) AS saldo
           FROM parcelas_contas pc
           JOIN movimento_contas m ON m.id = pc.movimento_id
           JOIN pessoas p ON p.id = m.faturado_id
          WHERE pc.valor_saldo > 0
          GROUP BY p.id
          ORDER BY saldo DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(Some("Nenhum faturado com parcelas em aberto.".to_string()));
    }

    let mut answer = String::from("Faturados com parcelas em aberto:");
    for (nome, count, saldo) in rows {
        answer.push_str(&format!(
            "\n- {}: {count} parcelas em aberto, saldo total {}",
            nome.as_deref().unwrap_or("-"),
            format_currency(saldo)
        ));
    }
    Ok(Some(answer))
}

/// Intent 4: expense classifications whose movement total reached the
/// threshold since the start of the current quarter.
fn classifications_above_threshold_quarter(
    conn: &Connection,
    question: &str,
    today: NaiveDate,
) -> Result<Option<String>> {
    let threshold = extract_currency_threshold(question, DEFAULT_QUARTER_THRESHOLD);
    let since = start_of_current_quarter(today).format("%Y-%m-%d").to_string();

    let mut stmt = conn.prepare(
        "SELECT c.descricao, SUM(m.valor_total) AS total
           FROM classificacao c
           JOIN movimento_classificacao mc ON mc.classificacao_id = c.id
           JOIN movimento_contas m ON m.id = mc.movimento_id
          WHERE c.tipo = ?1 AND m.data_emissao >= ?2
          GROUP BY c.id
         HAVING total >= ?3
          ORDER BY total DESC",
    )?;
    let rows = stmt
        .query_map(params![CLASSIFICACAO_DESPESA, since, threshold], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(Some(format!(
            "Nenhuma classificação de despesa ultrapassou {} neste trimestre.",
            format_currency(threshold)
        )));
    }

    let mut answer = format!(
        "Classificações de despesa acima de {} neste trimestre:",
        format_currency(threshold)
    );
    for (descricao, total) in rows {
        answer.push_str(&format!(
            "\n- {}: {}",
            descricao.as_deref().unwrap_or("-"),
            format_currency(total)
        ));
    }
    Ok(Some(answer))
}

/// Intent 5: receivable invoices in a named month. Declines (None) when
/// no month name is present so the matcher keeps falling through.
fn receivables_in_named_month(
    conn: &Connection,
    question: &str,
    today: NaiveDate,
) -> Result<Option<String>> {
    let Some((month, year)) = extract_month_year(question, today.year()) else {
        return Ok(None);
    };

    let from = format!("{year:04}-{month:02}-01");
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let until = format!("{next_year:04}-{next_month:02}-01");

    let mut stmt = conn.prepare(
        "SELECT m.numero_nota_fiscal, m.data_emissao, m.valor_total, fat.razaosocial
           FROM movimento_contas m
           LEFT JOIN pessoas fat ON fat.id = m.faturado_id
          WHERE m.tipo = ?1 AND m.data_emissao >= ?2 AND m.data_emissao < ?3
          ORDER BY m.data_emissao ASC",
    )?;
    let rows = stmt
        .query_map(params![TIPO_RECEBER, from, until], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(Some(format!(
            "Nenhuma nota a receber encontrada para {}/{year}.",
            month_name(month)
        )));
    }

    let mut answer = format!("Notas a receber de {} de {year}:", month_name(month));
    for (nf, data, valor, cliente) in rows {
        answer.push_str(&format!(
            "\n- Nota {}, data {}, valor {}, cliente: {}",
            nf.as_deref().unwrap_or("-"),
            data.as_deref().unwrap_or("-"),
            format_currency(valor),
            cliente.as_deref().unwrap_or("-"),
        ));
    }
    Ok(Some(answer))
}

// ============================================================================
// TESTS
// ============================================================================
