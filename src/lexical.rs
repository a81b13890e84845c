// Lexical retrieval: turns a free-text question into a fuzzy multi-field
// filter over movements and renders a bounded textual context for the LLM.

use anyhow::Result;
use rusqlite::Connection;

use crate::db::{self, MovementDoc};
use crate::extraction::format_currency;

/// Sentinel rendered when the store holds nothing at all.
pub const NO_RECORDS: &str = "Nenhum registro encontrado.";

/// Default row bound for retrieved context.
pub const DEFAULT_LIMIT: usize = 10;

/// Question words, articles and generic nouns that carry no filtering
/// signal in this domain.
const STOP_WORDS: &[&str] = &[
    "qual", "quais", "quanto", "quanta", "quantos", "quantas", "como", "quando", "onde", "quem",
    "que", "por", "para", "pela", "pelo", "com", "sem", "uma", "umas", "uns", "dos", "das", "nos",
    "nas", "aos", "mais", "menos", "muito", "sobre", "entre", "desde", "até", "ate", "ultimo",
    "ultimos", "último", "últimos", "nota", "notas", "valor", "valores", "total", "totais",
    "registro", "registros", "dia", "dias", "mes", "mês", "ano", "anos", "tem", "temos", "existe",
    "existem", "foram", "está", "estão", "esta", "estao", "são", "sao", "têm",
];

/// Words that signal a cost/expense analysis and trigger the financial
/// summary digest.
const COST_SIGNALS: &[&str] = &[
    "custo",
    "gasto",
    "despesa",
    "recorr",
    "combust",
    "manut",
    "significativo",
];

/// At most this many tokens feed the OR filter; beyond that the filter
/// stops discriminating and only slows the query down.
const MAX_FILTER_TOKENS: usize = 5;

/// Text columns each token is matched against, all lowercased on the
/// SQL side.
const FILTER_COLUMNS: &[&str] = &[
    "m.descricao",
    "m.numero_nota_fiscal",
    "f.razaosocial",
    "f.fantasia",
    "fat.razaosocial",
    "fat.fantasia",
];

/// Retrieve a textual context for `question`: the most relevant (or most
/// recent) movements, one line each, plus a financial summary when the
/// question carries cost-analysis wording.
pub fn retrieve(conn: &Connection, question: &str, limit: usize) -> Result<String> {
    let tokens = question_tokens(question);
    let docs = query_with_fallback(conn, &tokens, limit)?;

    let mut context = if docs.is_empty() {
        NO_RECORDS.to_string()
    } else {
        docs.iter()
            .map(render_movement)
            .collect::<Vec<_>>()
            .join("\n")
    };

    if wants_summary(question) {
        let summary = build_summary(conn)?;
        if !summary.is_empty() {
            context.push_str("\n\n");
            context.push_str(&summary);
        }
    }

    Ok(context)
}

/// One line per movement, mirrored by the vector indexer so both retrieval
/// paths hand the LLM the same shape of evidence.
pub fn render_movement(doc: &MovementDoc) -> String {
    let mut line = format!(
        "Movimento {}: nota {}, data {}, valor {}, descricao: {}",
        doc.id,
        doc.numero_nota_fiscal.as_deref().unwrap_or("-"),
        doc.data_emissao.as_deref().unwrap_or("-"),
        format_currency(doc.valor_total),
        doc.descricao.as_deref().unwrap_or("-"),
    );
    if let Some(fornecedor) = &doc.fornecedor {
        line.push_str(&format!(", fornecedor: {fornecedor}"));
    }
    if let Some(faturado) = &doc.faturado {
        line.push_str(&format!(", faturado: {faturado}"));
    }
    if !doc.classificacoes.is_empty() {
        line.push_str(&format!(", classificacoes: {}", doc.classificacoes.join(", ")));
    }
    line
}

/// Lowercase word tokens of length >= 3, deduplicated preserving first
/// occurrence, stop words removed.
pub fn question_tokens(question: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
    {
        if STOP_WORDS.contains(&token) {
            continue;
        }
        if !seen.iter().any(|s| s == token) {
            seen.push(token.to_string());
        }
    }
    seen.truncate(MAX_FILTER_TOKENS);
    seen
}

fn wants_summary(question: &str) -> bool {
    let lowered = question.to_lowercase();
    COST_SIGNALS.iter().any(|signal| lowered.contains(signal))
}

/// Filtered query first; when the filter matches nothing but filters were
/// present, re-run unfiltered so a question never yields "no data" while
/// data exists.
fn query_with_fallback(
    conn: &Connection,
    tokens: &[String],
    limit: usize,
) -> Result<Vec<MovementDoc>> {
    if tokens.is_empty() {
        return db::query_movement_docs(conn, None, &[], limit);
    }

    let (clause, patterns) = build_filter(tokens);
    let docs = db::query_movement_docs(conn, Some(&clause), &patterns, limit)?;
    if !docs.is_empty() {
        return Ok(docs);
    }

    db::query_movement_docs(conn, None, &[], limit)
}

/// One OR-group per token: substring match on every text column plus the
/// linked classification descriptions, all groups joined with OR.
fn build_filter(tokens: &[String]) -> (String, Vec<String>) {
    let mut groups = Vec::with_capacity(tokens.len());
    let mut patterns = Vec::new();

    for token in tokens {
        let pattern = format!("%{token}%");
        let mut parts: Vec<String> = FILTER_COLUMNS
            .iter()
            .map(|col| {
                patterns.push(pattern.clone());
                format!("lower(coalesce({col}, '')) LIKE ?")
            })
            .collect();

        patterns.push(pattern);
        parts.push(
            "EXISTS (SELECT 1 FROM movimento_classificacao mc \
             JOIN classificacao c ON c.id = mc.classificacao_id \
             WHERE mc.movimento_id = m.id \
             AND lower(coalesce(c.descricao, '')) LIKE ?)"
                .to_string(),
        );

        groups.push(format!("({})", parts.join(" OR ")));
    }

    (groups.join(" OR "), patterns)
}

// ============================================================================
// FINANCIAL SUMMARY DIGEST
// ============================================================================

/// Top classifications and suppliers by total amount plus recurring
/// descriptions, rendered under their own heading.
fn build_summary(conn: &Connection) -> Result<String> {
    let mut sections = Vec::new();

    let classificacoes = top_classifications(conn)?;
    if !classificacoes.is_empty() {
        let mut section = String::from("Principais classificações por valor:");
        for (descricao, total) in classificacoes {
            section.push_str(&format!("\n- {descricao}: {}", format_currency(total)));
        }
        sections.push(section);
    }

    let fornecedores = top_suppliers(conn)?;
    if !fornecedores.is_empty() {
        let mut section = String::from("Principais fornecedores por valor:");
        for (nome, total) in fornecedores {
            section.push_str(&format!("\n- {nome}: {}", format_currency(total)));
        }
        sections.push(section);
    }

    let recorrentes = recurring_movements(conn)?;
    if !recorrentes.is_empty() {
        let mut section = String::from("Lançamentos recorrentes:");
        for (descricao, count, total) in recorrentes {
            section.push_str(&format!(
                "\n- {descricao}: {count} ocorrências, total {}",
                format_currency(total)
            ));
        }
        sections.push(section);
    }

    if sections.is_empty() {
        return Ok(String::new());
    }

    Ok(format!("Resumo financeiro:\n\n{}", sections.join("\n\n")))
}

fn top_classifications(conn: &Connection) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT c.descricao, SUM(m.valor_total) AS total
           FROM classificacao c
           JOIN movimento_classificacao mc ON mc.classificacao_id = c.id
           JOIN movimento_contas m ON m.id = mc.movimento_id
          WHERE c.descricao IS NOT NULL
          GROUP BY c.id
          ORDER BY total DESC
          LIMIT 5",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn top_suppliers(conn: &Connection) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT p.razaosocial, SUM(m.valor_total) AS total
           FROM movimento_contas m
           JOIN pessoas p ON p.id = m.fornecedor_id
          WHERE p.razaosocial IS NOT NULL
          GROUP BY p.id
          ORDER BY total DESC
          LIMIT 5",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn recurring_movements(conn: &Connection) -> Result<Vec<(String, i64, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT m.descricao, COUNT(*) AS n, SUM(m.valor_total) AS total
           FROM movimento_contas m
          WHERE m.descricao IS NOT NULL
          GROUP BY m.descricao
         HAVING n > 1
          ORDER BY total DESC, n DESC
          LIMIT 5",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        ensure_classificacao, ensure_pessoa, insert_movimento, setup_database, NewMovimento,
        CLASSIFICACAO_DESPESA, PESSOA_FATURADO, PESSOA_FORNECEDOR, TIPO_PAGAR, TIPO_RECEBER,
    };

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn seed_movimento(
        conn: &Connection,
        tipo: &str,
        nf: &str,
        data: &str,
        descricao: &str,
        valor: f64,
        fornecedor: Option<&str>,
    ) -> i64 {
        let fornecedor_id =
            fornecedor.map(|nome| ensure_pessoa(conn, PESSOA_FORNECEDOR, nome).unwrap());
        let novo = NewMovimento {
            tipo: tipo.to_string(),
            numero_nota_fiscal: nf.to_string(),
            data_emissao: data.to_string(),
            descricao: descricao.to_string(),
            valor_total: valor,
            fornecedor_id,
            faturado_id: None,
        };
        insert_movimento(conn, &novo, &[]).unwrap().unwrap()
    }

    #[test]
    fn test_question_tokens_filters_and_dedups() {
        let tokens =
            question_tokens("Quais notas de diesel e diesel da fazenda têm valor alto?");
        assert_eq!(tokens, vec!["diesel", "fazenda", "alto"]);
    }

    #[test]
    fn test_question_tokens_caps_at_five() {
        let tokens = question_tokens("soja milho trigo cafe gado leite algodao");
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0], "soja");
    }

    #[test]
    fn test_retrieve_matches_by_supplier_name() {
        let conn = test_conn();
        seed_movimento(
            &conn,
            TIPO_PAGAR,
            "NF-1",
            "2026-08-01",
            "Aquisição de defensivos",
            1200.0,
            Some("Agroinsumos Sul"),
        );
        seed_movimento(
            &conn,
            TIPO_PAGAR,
            "NF-2",
            "2026-08-02",
            "Colheita mecanizada",
            3400.0,
            Some("Cooperativa Norte"),
        );

        let context = retrieve(&conn, "compras da agroinsumos", DEFAULT_LIMIT).unwrap();
        assert!(context.contains("NF-1"));
        assert!(!context.contains("NF-2"));
        assert!(context.contains("fornecedor: Agroinsumos Sul"));
    }

    #[test]
    fn test_retrieve_matches_by_classification() {
        let conn = test_conn();
        let id = seed_movimento(
            &conn,
            TIPO_PAGAR,
            "NF-3",
            "2026-08-03",
            "Pagamento mensal",
            900.0,
            None,
        );
        let frete = ensure_classificacao(&conn, CLASSIFICACAO_DESPESA, "frete rural").unwrap();
        conn.execute(
            "INSERT INTO movimento_classificacao (movimento_id, classificacao_id) VALUES (?1, ?2)",
            rusqlite::params![id, frete],
        )
        .unwrap();

        let context = retrieve(&conn, "despesas de frete", DEFAULT_LIMIT).unwrap();
        assert!(context.contains("NF-3"));
        assert!(context.contains("classificacoes: frete rural"));
    }

    #[test]
    fn test_retrieve_falls_back_to_recent_records() {
        let conn = test_conn();
        seed_movimento(
            &conn,
            TIPO_RECEBER,
            "NF-4",
            "2026-08-04",
            "Venda de grãos",
            5000.0,
            None,
        );

        // Tokens match nothing, but the store is non-empty: fall back to
        // the most recent rows instead of the sentinel.
        let context = retrieve(&conn, "helicóptero turbina aeroporto", DEFAULT_LIMIT).unwrap();
        assert!(context.contains("NF-4"));
        assert_ne!(context, NO_RECORDS);
    }

    #[test]
    fn test_retrieve_empty_store_renders_sentinel() {
        let conn = test_conn();
        let context = retrieve(&conn, "qualquer pergunta", DEFAULT_LIMIT).unwrap();
        assert_eq!(context, NO_RECORDS);
    }

    #[test]
    fn test_retrieve_limit_bounds_rows() {
        let conn = test_conn();
        for i in 0..8 {
            seed_movimento(
                &conn,
                TIPO_PAGAR,
                &format!("NF-{i}"),
                &format!("2026-08-{:02}", i + 1),
                "Compra de diesel",
                100.0 + i as f64,
                None,
            );
        }
        let context = retrieve(&conn, "diesel", 3).unwrap();
        assert_eq!(context.lines().count(), 3);
        // Most recent first
        assert!(context.lines().next().unwrap().contains("NF-7"));
    }

    #[test]
    fn test_cost_question_appends_summary() {
        let conn = test_conn();
        seed_movimento(
            &conn,
            TIPO_PAGAR,
            "NF-5",
            "2026-08-05",
            "Compra de diesel",
            800.0,
            Some("Posto Rural"),
        );
        seed_movimento(
            &conn,
            TIPO_PAGAR,
            "NF-6",
            "2026-08-06",
            "Compra de diesel",
            650.0,
            Some("Posto Rural"),
        );

        let context = retrieve(&conn, "quais os custos recorrentes?", DEFAULT_LIMIT).unwrap();
        assert!(context.contains("Resumo financeiro:"));
        assert!(context.contains("Principais fornecedores por valor:"));
        assert!(context.contains("- Posto Rural: R$ 1.450,00"));
        assert!(context.contains("Lançamentos recorrentes:"));
        assert!(context.contains("- Compra de diesel: 2 ocorrências, total R$ 1.450,00"));
    }

    #[test]
    fn test_plain_question_has_no_summary() {
        let conn = test_conn();
        seed_movimento(
            &conn,
            TIPO_PAGAR,
            "NF-7",
            "2026-08-07",
            "Compra de diesel",
            800.0,
            None,
        );
        let context = retrieve(&conn, "notas de diesel", DEFAULT_LIMIT).unwrap();
        assert!(!context.contains("Resumo financeiro:"));
    }
}
