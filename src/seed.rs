// CSV seed loader. Re-running the same file is safe: duplicate movements
// are detected by idempotency hash and skipped.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{Months, NaiveDate};
use rusqlite::Connection;
use serde::Deserialize;

use crate::db::{
    self, NewMovimento, CLASSIFICACAO_DESPESA, CLASSIFICACAO_RECEITA, PARCELA_ABERTA,
    PESSOA_FATURADO, PESSOA_FORNECEDOR, TIPO_PAGAR, TIPO_RECEBER,
};

/// One CSV row. `classificacoes` is `;`-separated, `parcelas` is the
/// installment count (defaults to a single installment).
#[derive(Debug, Deserialize)]
pub struct SeedRecord {
    pub tipo: String,
    pub numero_nota_fiscal: String,
    pub data_emissao: String,
    pub descricao: String,
    pub valor_total: f64,
    #[serde(default)]
    pub fornecedor: Option<String>,
    #[serde(default)]
    pub faturado: Option<String>,
    #[serde(default)]
    pub classificacoes: Option<String>,
    #[serde(default)]
    pub parcelas: Option<u32>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<SeedRecord>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Falha ao abrir o arquivo CSV")?;

    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: SeedRecord = result.context("Falha ao desserializar linha do CSV")?;
        records.push(record);
    }

    Ok(records)
}

/// Insert seed records with their people, classifications and installments.
pub fn insert_records(conn: &Connection, records: &[SeedRecord]) -> Result<SeedOutcome> {
    let mut outcome = SeedOutcome::default();

    for record in records {
        let tipo = record.tipo.trim().to_uppercase();
        if tipo != TIPO_PAGAR && tipo != TIPO_RECEBER {
            bail!(
                "tipo de movimento inválido na nota {}: {}",
                record.numero_nota_fiscal,
                record.tipo
            );
        }

        let fornecedor_id = match record.fornecedor.as_deref().map(str::trim) {
            Some(nome) if !nome.is_empty() => {
                Some(db::ensure_pessoa(conn, PESSOA_FORNECEDOR, nome)?)
            }
            _ => None,
        };
        let faturado_id = match record.faturado.as_deref().map(str::trim) {
            Some(nome) if !nome.is_empty() => Some(db::ensure_pessoa(conn, PESSOA_FATURADO, nome)?),
            _ => None,
        };

        // Expense classifications for payables, revenue for receivables
        let classificacao_tipo = if tipo == TIPO_PAGAR {
            CLASSIFICACAO_DESPESA
        } else {
            CLASSIFICACAO_RECEITA
        };
        let mut classificacao_ids = Vec::new();
        if let Some(lista) = record.classificacoes.as_deref() {
            for nome in lista.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                classificacao_ids.push(db::ensure_classificacao(conn, classificacao_tipo, nome)?);
            }
        }

        let novo = NewMovimento {
            tipo,
            numero_nota_fiscal: record.numero_nota_fiscal.trim().to_string(),
            data_emissao: record.data_emissao.trim().to_string(),
            descricao: record.descricao.trim().to_string(),
            valor_total: record.valor_total,
            fornecedor_id,
            faturado_id,
        };

        match db::insert_movimento(conn, &novo, &classificacao_ids)? {
            Some(movimento_id) => {
                insert_installments(conn, movimento_id, record)?;
                outcome.inserted += 1;
            }
            None => {
                log::debug!(
                    "movimento duplicado ignorado: nota {}",
                    record.numero_nota_fiscal
                );
                outcome.skipped += 1;
            }
        }
    }

    Ok(outcome)
}

/// Equal monthly installments starting at the emission date. The last one
/// absorbs the rounding remainder so the sum matches the movement total.
fn insert_installments(conn: &Connection, movimento_id: i64, record: &SeedRecord) -> Result<()> {
    let count = record.parcelas.unwrap_or(1).max(1);
    let emissao = NaiveDate::parse_from_str(record.data_emissao.trim(), "%Y-%m-%d")
        .with_context(|| {
            format!(
                "data de emissão inválida na nota {}: {}",
                record.numero_nota_fiscal, record.data_emissao
            )
        })?;

    let base = (record.valor_total / count as f64 * 100.0).floor() / 100.0;

    for i in 0..count {
        let valor = if i == count - 1 {
            ((record.valor_total - base * (count - 1) as f64) * 100.0).round() / 100.0
        } else {
            base
        };
        let vencimento = emissao
            .checked_add_months(Months::new(i))
            .with_context(|| format!("data de vencimento fora do intervalo: {emissao} +{i}m"))?;
        let identificacao = format!("{}/{}", i + 1, count);

        db::insert_parcela(
            conn,
            movimento_id,
            &identificacao,
            &vencimento.format("%Y-%m-%d").to_string(),
            valor,
            0.0,
            PARCELA_ABERTA,
        )?;
    }

    Ok(())
}

/// Load a CSV file and insert everything it contains.
pub fn seed_from_csv(conn: &Connection, csv_path: &Path) -> Result<SeedOutcome> {
    let records = load_csv(csv_path)?;
    insert_records(conn, &records)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use std::io::Write;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn record(nf: &str, valor: f64, parcelas: Option<u32>) -> SeedRecord {
        SeedRecord {
            tipo: "PAGAR".to_string(),
            numero_nota_fiscal: nf.to_string(),
            data_emissao: "2025-03-15".to_string(),
            descricao: format!("Compra {nf}"),
            valor_total: valor,
            fornecedor: Some("Agro Peças Ltda".to_string()),
            faturado: Some("Fazenda Santa Luzia".to_string()),
            classificacoes: Some("MANUTENÇÃO;OPERACIONAL".to_string()),
            parcelas,
        }
    }

    #[test]
    fn test_insert_links_people_and_classifications() {
        let conn = test_conn();
        let outcome = insert_records(&conn, &[record("NF-100", 900.0, None)]).unwrap();
        assert_eq!(outcome, SeedOutcome { inserted: 1, skipped: 0 });

        let docs = db::load_movement_docs(&conn).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].fornecedor.as_deref(), Some("Agro Peças Ltda"));
        assert_eq!(docs[0].faturado.as_deref(), Some("Fazenda Santa Luzia"));
        assert_eq!(docs[0].classificacoes.len(), 2);
    }

    #[test]
    fn test_reseed_skips_duplicates() {
        let conn = test_conn();
        let records = vec![record("NF-1", 100.0, None), record("NF-2", 200.0, None)];

        let first = insert_records(&conn, &records).unwrap();
        assert_eq!(first, SeedOutcome { inserted: 2, skipped: 0 });

        let second = insert_records(&conn, &records).unwrap();
        assert_eq!(second, SeedOutcome { inserted: 0, skipped: 2 });

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM movimento_contas", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_installments_split_evenly_with_remainder_on_last() {
        let conn = test_conn();
        insert_records(&conn, &[record("NF-3X", 1000.0, Some(3))]).unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT identificacao, data_vencimento, valor_parcela, status_parcela
                 FROM parcelas_contas ORDER BY id",
            )
            .unwrap();
        let rows: Vec<(String, String, f64, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, "1/3");
        assert_eq!(rows[0].1, "2025-03-15");
        assert_eq!(rows[1].1, "2025-04-15");
        assert_eq!(rows[2].1, "2025-05-15");
        assert!((rows[0].2 - 333.33).abs() < 1e-9);
        assert!((rows[1].2 - 333.33).abs() < 1e-9);
        assert!((rows[2].2 - 333.34).abs() < 1e-9);
        assert!(rows.iter().all(|r| r.3 == PARCELA_ABERTA));
    }

    #[test]
    fn test_receivable_classification_uses_revenue_type() {
        let conn = test_conn();
        let mut rec = record("NF-REC", 500.0, None);
        rec.tipo = "RECEBER".to_string();
        rec.classificacoes = Some("VENDA DE SOJA".to_string());
        insert_records(&conn, &[rec]).unwrap();

        let tipo: String = conn
            .query_row(
                "SELECT tipo FROM classificacao WHERE descricao = 'VENDA DE SOJA'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tipo, CLASSIFICACAO_RECEITA);
    }

    #[test]
    fn test_invalid_movement_type_is_rejected() {
        let conn = test_conn();
        let mut rec = record("NF-BAD", 10.0, None);
        rec.tipo = "TRANSFERIR".to_string();
        assert!(insert_records(&conn, &[rec]).is_err());
    }

    #[test]
    fn test_load_csv_parses_optional_columns() {
        let dir = std::env::temp_dir().join("contas_rag_seed_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("seed.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "tipo,numero_nota_fiscal,data_emissao,descricao,valor_total,fornecedor,faturado,classificacoes,parcelas"
        )
        .unwrap();
        writeln!(
            file,
            "PAGAR,NF-10,2025-01-02,Diesel para colheita,1500.00,Posto Rural,Fazenda Santa Luzia,COMBUSTÍVEL,2"
        )
        .unwrap();
        writeln!(file, "RECEBER,NF-11,2025-01-05,Venda de milho,8000.00,,,,").unwrap();

        let records = load_csv(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].parcelas, Some(2));
        assert_eq!(records[1].fornecedor.as_deref(), None);
        assert_eq!(records[1].parcelas, None);

        std::fs::remove_file(&path).ok();
    }
}
