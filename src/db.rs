use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

// ============================================================================
// CANONICAL VALUES
// ============================================================================

/// Movement direction: invoice we have to pay
pub const TIPO_PAGAR: &str = "PAGAR";
/// Movement direction: invoice we will collect
pub const TIPO_RECEBER: &str = "RECEBER";

/// Party roles
pub const PESSOA_FORNECEDOR: &str = "FORNECEDOR";
pub const PESSOA_FATURADO: &str = "FATURADO";

/// Classification kinds
pub const CLASSIFICACAO_DESPESA: &str = "DESPESA";
pub const CLASSIFICACAO_RECEITA: &str = "RECEITA";

/// Default lifecycle status for seeded entities
pub const STATUS_ATIVO: &str = "ATIVO";

/// Installment status values
pub const PARCELA_ABERTA: &str = "ABERTA";
pub const PARCELA_PARCIAL: &str = "PARCIAL";
pub const PARCELA_LIQUIDADA: &str = "LIQUIDADA";

// ============================================================================
// ENTITY TYPES
// ============================================================================

/// Denormalized read projection of a movement, joined to supplier,
/// billed-to party and classification descriptions. Feeds the lexical
/// renderer and the vector indexer; never written back.
#[derive(Debug, Clone, Serialize)]
pub struct MovementDoc {
    pub id: i64,
    pub tipo: Option<String>,
    pub numero_nota_fiscal: Option<String>,
    pub data_emissao: Option<String>,
    pub descricao: Option<String>,
    pub valor_total: f64,
    pub fornecedor: Option<String>,
    pub faturado: Option<String>,
    pub classificacoes: Vec<String>,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pessoas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tipo TEXT,
            razaosocial TEXT,
            fantasia TEXT,
            documento TEXT,
            status TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classificacao (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tipo TEXT,
            descricao TEXT,
            status TEXT
        )",
        [],
    )?;

    // Dates are ISO `YYYY-MM-DD` TEXT so lexicographic compare is
    // chronological. idempotency_hash makes seeding re-runnable.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS movimento_contas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tipo TEXT,
            numero_nota_fiscal TEXT,
            data_emissao TEXT,
            descricao TEXT,
            status TEXT,
            valor_total REAL NOT NULL DEFAULT 0,
            fornecedor_id INTEGER REFERENCES pessoas(id),
            faturado_id INTEGER REFERENCES pessoas(id),
            idempotency_hash TEXT UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS movimento_classificacao (
            movimento_id INTEGER NOT NULL
                REFERENCES movimento_contas(id) ON DELETE CASCADE,
            classificacao_id INTEGER NOT NULL
                REFERENCES classificacao(id),
            PRIMARY KEY (movimento_id, classificacao_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS parcelas_contas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identificacao TEXT,
            data_vencimento TEXT,
            valor_parcela REAL NOT NULL DEFAULT 0,
            valor_pago REAL NOT NULL DEFAULT 0,
            valor_saldo REAL NOT NULL DEFAULT 0,
            status_parcela TEXT,
            movimento_id INTEGER NOT NULL
                REFERENCES movimento_contas(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_movimento_data
         ON movimento_contas(data_emissao)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_movimento_tipo
         ON movimento_contas(tipo)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_parcelas_movimento
         ON parcelas_contas(movimento_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_parcelas_vencimento
         ON parcelas_contas(data_vencimento)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// WRITE HELPERS (seeding and tests; the consultation core never writes)
// ============================================================================

/// Get-or-create a pessoa by legal name and role.
pub fn ensure_pessoa(conn: &Connection, tipo: &str, razaosocial: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM pessoas WHERE razaosocial = ?1 AND tipo = ?2",
            params![razaosocial, tipo],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO pessoas (tipo, razaosocial, status) VALUES (?1, ?2, ?3)",
        params![tipo, razaosocial, STATUS_ATIVO],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Get-or-create a classification by description (case-insensitive,
/// matching the persistence layer's uniqueness rule).
pub fn ensure_classificacao(conn: &Connection, tipo: &str, descricao: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM classificacao WHERE lower(descricao) = lower(?1)",
            params![descricao],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO classificacao (tipo, descricao, status) VALUES (?1, ?2, ?3)",
        params![tipo, descricao, STATUS_ATIVO],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Fields for a new movement row. Id and hash are assigned on insert.
#[derive(Debug, Clone, Default)]
pub struct NewMovimento {
    pub tipo: String,
    pub numero_nota_fiscal: String,
    pub data_emissao: String,
    pub descricao: String,
    pub valor_total: f64,
    pub fornecedor_id: Option<i64>,
    pub faturado_id: Option<i64>,
}

impl NewMovimento {
    /// Hash for duplicate detection on re-seeding. Deduplication key,
    /// not identity: the row id remains the identity.
    pub fn idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{:.2}",
            self.tipo, self.numero_nota_fiscal, self.data_emissao, self.valor_total
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// Insert a movement with its classification links. Returns `None` when an
/// identical movement (same idempotency hash) already exists.
pub fn insert_movimento(
    conn: &Connection,
    novo: &NewMovimento,
    classificacao_ids: &[i64],
) -> Result<Option<i64>> {
    let hash = novo.idempotency_hash();

    let result = conn.execute(
        "INSERT INTO movimento_contas (
            tipo, numero_nota_fiscal, data_emissao, descricao, status,
            valor_total, fornecedor_id, faturado_id, idempotency_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            novo.tipo,
            novo.numero_nota_fiscal,
            novo.data_emissao,
            novo.descricao,
            STATUS_ATIVO,
            novo.valor_total,
            novo.fornecedor_id,
            novo.faturado_id,
            hash,
        ],
    );

    match result {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            for classificacao_id in classificacao_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO movimento_classificacao
                     (movimento_id, classificacao_id) VALUES (?1, ?2)",
                    params![id, classificacao_id],
                )?;
            }
            Ok(Some(id))
        }
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Insert one installment for a movement.
pub fn insert_parcela(
    conn: &Connection,
    movimento_id: i64,
    identificacao: &str,
    data_vencimento: &str,
    valor_parcela: f64,
    valor_pago: f64,
    status_parcela: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO parcelas_contas (
            identificacao, data_vencimento, valor_parcela, valor_pago,
            valor_saldo, status_parcela, movimento_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            identificacao,
            data_vencimento,
            valor_parcela,
            valor_pago,
            valor_parcela - valor_pago,
            status_parcela,
            movimento_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ============================================================================
// READ HELPERS
// ============================================================================

pub fn count_movimentos(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM movimento_contas", [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

const MOVEMENT_DOC_SELECT: &str = "SELECT m.id, m.tipo, m.numero_nota_fiscal, m.data_emissao,
        m.descricao, m.valor_total,
        f.razaosocial AS fornecedor,
        fat.razaosocial AS faturado,
        (SELECT group_concat(c.descricao, ', ')
           FROM movimento_classificacao mc
           JOIN classificacao c ON c.id = mc.classificacao_id
          WHERE mc.movimento_id = m.id) AS classificacoes
   FROM movimento_contas m
   LEFT JOIN pessoas f ON f.id = m.fornecedor_id
   LEFT JOIN pessoas fat ON fat.id = m.faturado_id";

fn movement_doc_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MovementDoc> {
    let classificacoes: Option<String> = row.get(8)?;
    Ok(MovementDoc {
        id: row.get(0)?,
        tipo: row.get(1)?,
        numero_nota_fiscal: row.get(2)?,
        data_emissao: row.get(3)?,
        descricao: row.get(4)?,
        valor_total: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        fornecedor: row.get(6)?,
        faturado: row.get(7)?,
        classificacoes: classificacoes
            .map(|joined| joined.split(", ").map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

/// All movements as denormalized docs (vector indexing scans everything).
pub fn load_movement_docs(conn: &Connection) -> Result<Vec<MovementDoc>> {
    let sql = format!("{MOVEMENT_DOC_SELECT} ORDER BY m.id");
    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map([], movement_doc_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(docs)
}

/// Most recent movements, optionally restricted by a per-token OR filter.
/// `filter_sql` must reference the aliases `m`, `f` and `fat` from the
/// base select; parameters are the LIKE patterns in clause order.
pub fn query_movement_docs(
    conn: &Connection,
    filter_sql: Option<&str>,
    filter_params: &[String],
    limit: usize,
) -> Result<Vec<MovementDoc>> {
    let sql = match filter_sql {
        Some(clause) => format!(
            "{MOVEMENT_DOC_SELECT} WHERE {clause}
             ORDER BY m.data_emissao DESC LIMIT {limit}"
        ),
        None => format!("{MOVEMENT_DOC_SELECT} ORDER BY m.data_emissao DESC LIMIT {limit}"),
    };

    let mut stmt = conn.prepare(&sql)?;
    let params = rusqlite::params_from_iter(filter_params.iter());
    let docs = stmt
        .query_map(params, movement_doc_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(docs)
}

/// PAYABLE movements with their classification text, issued on or after
/// `cutoff`. Used by the insight handlers, which match Portuguese terms
/// on the Rust side (SQLite lower() only folds ASCII).
pub fn load_payables_since(conn: &Connection, cutoff: &str) -> Result<Vec<MovementDoc>> {
    let sql = format!(
        "{MOVEMENT_DOC_SELECT}
         WHERE m.tipo = ?1 AND m.data_emissao >= ?2
         ORDER BY m.data_emissao DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map(params![TIPO_PAGAR, cutoff], movement_doc_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(docs)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = test_conn();
        setup_database(&conn).unwrap();
        assert_eq!(count_movimentos(&conn).unwrap(), 0);
    }

    #[test]
    fn test_ensure_pessoa_deduplicates() {
        let conn = test_conn();
        let a = ensure_pessoa(&conn, PESSOA_FORNECEDOR, "Cooperativa Boa Safra").unwrap();
        let b = ensure_pessoa(&conn, PESSOA_FORNECEDOR, "Cooperativa Boa Safra").unwrap();
        assert_eq!(a, b);

        // Same name under a different role is a different party
        let c = ensure_pessoa(&conn, PESSOA_FATURADO, "Cooperativa Boa Safra").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_ensure_classificacao_case_insensitive() {
        let conn = test_conn();
        let a = ensure_classificacao(&conn, CLASSIFICACAO_DESPESA, "Insumos Agricolas").unwrap();
        let b = ensure_classificacao(&conn, CLASSIFICACAO_DESPESA, "INSUMOS AGRICOLAS").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_insert_movimento_skips_duplicates() {
        let conn = test_conn();
        let novo = NewMovimento {
            tipo: TIPO_PAGAR.to_string(),
            numero_nota_fiscal: "NF-100".to_string(),
            data_emissao: "2026-08-01".to_string(),
            descricao: "Aquisição de defensivos".to_string(),
            valor_total: 1500.0,
            ..Default::default()
        };

        assert!(insert_movimento(&conn, &novo, &[]).unwrap().is_some());
        assert!(insert_movimento(&conn, &novo, &[]).unwrap().is_none());
        assert_eq!(count_movimentos(&conn).unwrap(), 1);
    }

    #[test]
    fn test_load_movement_docs_joins_names_and_classifications() {
        let conn = test_conn();
        let fornecedor = ensure_pessoa(&conn, PESSOA_FORNECEDOR, "Agroinsumos Sul").unwrap();
        let faturado = ensure_pessoa(&conn, PESSOA_FATURADO, "Fazenda Santa Rita").unwrap();
        let insumos =
            ensure_classificacao(&conn, CLASSIFICACAO_DESPESA, "Insumos Agricolas").unwrap();
        let frete = ensure_classificacao(&conn, CLASSIFICACAO_DESPESA, "Frete").unwrap();

        let novo = NewMovimento {
            tipo: TIPO_PAGAR.to_string(),
            numero_nota_fiscal: "NF-200".to_string(),
            data_emissao: "2026-08-10".to_string(),
            descricao: "Plantio de soja - sementes certificadas".to_string(),
            valor_total: 8200.0,
            fornecedor_id: Some(fornecedor),
            faturado_id: Some(faturado),
        };
        insert_movimento(&conn, &novo, &[insumos, frete]).unwrap();

        let docs = load_movement_docs(&conn).unwrap();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.fornecedor.as_deref(), Some("Agroinsumos Sul"));
        assert_eq!(doc.faturado.as_deref(), Some("Fazenda Santa Rita"));
        assert_eq!(doc.classificacoes.len(), 2);
    }

    #[test]
    fn test_insert_parcela_computes_balance() {
        let conn = test_conn();
        let novo = NewMovimento {
            tipo: TIPO_PAGAR.to_string(),
            numero_nota_fiscal: "NF-300".to_string(),
            data_emissao: "2026-07-01".to_string(),
            descricao: "Manutenção de pivô".to_string(),
            valor_total: 900.0,
            ..Default::default()
        };
        let movimento_id = insert_movimento(&conn, &novo, &[]).unwrap().unwrap();
        insert_parcela(
            &conn,
            movimento_id,
            "PARC-01/01",
            "2026-08-01",
            900.0,
            300.0,
            PARCELA_PARCIAL,
        )
        .unwrap();

        let saldo: f64 = conn
            .query_row(
                "SELECT valor_saldo FROM parcelas_contas WHERE movimento_id = ?1",
                params![movimento_id],
                |row| row.get(0),
            )
            .unwrap();
        assert!((saldo - 600.0).abs() < 1e-9);
    }
}
