// Consultation orchestrator: deterministic intent answers first, otherwise
// retrieval context plus a grounding prompt handed to the language model.
// Both entry points are total: failures degrade to fixed user-facing text.

use anyhow::Result;
use rusqlite::Connection;

use crate::insights;
use crate::intents;
use crate::lexical;
use crate::vector::{VectorRetriever, DEFAULT_TOP_K};

/// Fixed answer when the language model yields nothing.
pub const LLM_FAILURE: &str = "Falha ao gerar resposta via LLM.";

/// Opaque language-model callable. Implementations must not panic; any
/// internal failure is reported as `None`.
pub trait LlmClient {
    fn generate(&self, prompt: &str) -> Option<String>;
}

impl<F> LlmClient for F
where
    F: Fn(&str) -> Option<String>,
{
    fn generate(&self, prompt: &str) -> Option<String> {
        self(prompt)
    }
}

/// Stand-in when no model credential is configured.
pub struct DisabledLlm;

impl LlmClient for DisabledLlm {
    fn generate(&self, _prompt: &str) -> Option<String> {
        log::warn!("nenhum modelo de linguagem configurado");
        None
    }
}

pub struct ConsultaAgent {
    conn: Connection,
    llm: Box<dyn LlmClient>,
    vector: VectorRetriever,
}

impl ConsultaAgent {
    pub fn new(conn: Connection, llm: Box<dyn LlmClient>, vector: VectorRetriever) -> Self {
        ConsultaAgent { conn, llm, vector }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Simple mode: a matching intent answers directly from the store with
    /// no model call; everything else goes through lexical retrieval and
    /// the grounding prompt.
    pub fn answer_simple(&self, question: &str) -> String {
        match intents::dispatch(&self.conn, question) {
            Ok(Some(answer)) => return answer,
            Ok(None) => {}
            Err(err) => {
                log::error!("falha ao avaliar intenções: {err:#}");
            }
        }

        let context = lexical::retrieve(&self.conn, question, lexical::DEFAULT_LIMIT)
            .unwrap_or_else(|err| {
                log::error!("falha na recuperação lexical: {err:#}");
                lexical::NO_RECORDS.to_string()
            });

        self.ask_llm(&context, question)
    }

    /// Semantic mode: consolidated insights (when any fire) plus vector
    /// context, then the same grounding prompt.
    pub fn answer_semantic(&self, question: &str) -> String {
        let insights_block = insights::collect(&self.conn, question).unwrap_or_else(|err| {
            log::error!("falha ao calcular insights: {err:#}");
            None
        });

        let retrieved = self
            .vector
            .retrieve(&self.conn, question, DEFAULT_TOP_K)
            .unwrap_or_else(|err| {
                log::error!("falha na recuperação vetorial: {err:#}");
                lexical::NO_RECORDS.to_string()
            });

        let context = match insights_block {
            Some(block) => {
                format!("Insights consolidados:\n{block}\n\nContexto adicional:\n{retrieved}")
            }
            None => retrieved,
        };

        self.ask_llm(&context, question)
    }

    /// Administrative re-index of the vector collection. Unlike the query
    /// paths this raises when the vector service is missing, so operators
    /// are not misled about index freshness.
    pub fn reindex(&self) -> Result<usize> {
        self.vector.reindex(&self.conn)
    }

    fn ask_llm(&self, context: &str, question: &str) -> String {
        let prompt = build_prompt(context, question);
        self.llm
            .generate(&prompt)
            .unwrap_or_else(|| LLM_FAILURE.to_string())
    }
}

/// Grounding prompt: the model must answer only from the retrieved data
/// and say so when the data is insufficient.
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Você é um analista financeiro. Com base **apenas** nos seguintes dados do sistema:\n\n\
         {context}\n\n\
         Responda a seguinte pergunta do usuário: {question}\n\n\
         Se os dados não forem suficientes, informe que a resposta não pode ser encontrada."
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_movimento, setup_database, NewMovimento, TIPO_PAGAR, TIPO_RECEBER};
    use chrono::Local;
    use std::cell::Cell;
    use std::rc::Rc;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn seed_movimento(conn: &Connection, tipo: &str, nf: &str, valor: f64) {
        let hoje = Local::now().date_naive().format("%Y-%m-%d").to_string();
        let novo = NewMovimento {
            tipo: tipo.to_string(),
            numero_nota_fiscal: nf.to_string(),
            data_emissao: hoje,
            descricao: format!("Movimento {nf}"),
            valor_total: valor,
            ..Default::default()
        };
        insert_movimento(conn, &novo, &[]).unwrap().unwrap();
    }

    #[test]
    fn test_intent_question_skips_llm() {
        let conn = test_conn();
        seed_movimento(&conn, TIPO_PAGAR, "NF-PAG", 15_000.0);
        seed_movimento(&conn, TIPO_RECEBER, "NF-REC", 500.0);

        let called = Rc::new(Cell::new(false));
        let flag = called.clone();
        let llm = move |_prompt: &str| {
            flag.set(true);
            Some("não deveria ser usado".to_string())
        };

        let agent = ConsultaAgent::new(conn, Box::new(llm), VectorRetriever::disabled());
        let answer = agent.answer_simple("quais contas a pagar estão acima de R$ 10000?");

        assert!(answer.contains("NF-PAG"));
        assert!(!answer.contains("NF-REC"));
        assert!(!called.get(), "deterministic path must not call the LLM");
    }

    #[test]
    fn test_simple_mode_grounds_prompt_in_context() {
        let conn = test_conn();
        seed_movimento(&conn, TIPO_PAGAR, "NF-CTX", 800.0);

        let seen = Rc::new(std::cell::RefCell::new(String::new()));
        let sink = seen.clone();
        let llm = move |prompt: &str| {
            *sink.borrow_mut() = prompt.to_string();
            Some("resposta sintetizada".to_string())
        };

        let agent = ConsultaAgent::new(conn, Box::new(llm), VectorRetriever::disabled());
        let answer = agent.answer_simple("Qual o último movimento?");

        assert_eq!(answer, "resposta sintetizada");
        let prompt = seen.borrow();
        assert!(prompt.contains("NF-CTX"));
        assert!(prompt.contains("Qual o último movimento?"));
        assert!(prompt.contains("**apenas**"));
    }

    #[test]
    fn test_llm_failure_yields_fixed_sentence() {
        let conn = test_conn();
        seed_movimento(&conn, TIPO_PAGAR, "NF-1", 100.0);

        let agent = ConsultaAgent::new(conn, Box::new(DisabledLlm), VectorRetriever::disabled());
        assert_eq!(agent.answer_simple("pergunta sem intenção"), LLM_FAILURE);
    }

    #[test]
    fn test_semantic_mode_reports_unconfigured_vector_service() {
        let conn = test_conn();

        let seen = Rc::new(std::cell::RefCell::new(String::new()));
        let sink = seen.clone();
        let llm = move |prompt: &str| {
            *sink.borrow_mut() = prompt.to_string();
            Some(prompt.to_string())
        };

        let agent = ConsultaAgent::new(conn, Box::new(llm), VectorRetriever::disabled());
        let answer = agent.answer_semantic("Pergunta qualquer?");

        assert!(answer.contains(crate::vector::VECTOR_UNAVAILABLE));
        assert!(answer.contains("Pergunta qualquer?"));
    }

    #[test]
    fn test_semantic_mode_labels_insights() {
        let conn = test_conn();
        seed_movimento(&conn, TIPO_PAGAR, "NF-M1", 4_000.0);
        // Make the maintenance insight fire
        conn.execute(
            "UPDATE movimento_contas SET descricao = 'Manutenção de trator' WHERE numero_nota_fiscal = 'NF-M1'",
            [],
        )
        .unwrap();
        seed_movimento(&conn, TIPO_PAGAR, "NF-M2", 6_000.0);

        let llm = |prompt: &str| Some(prompt.to_string());
        let agent = ConsultaAgent::new(conn, Box::new(llm), VectorRetriever::disabled());
        let answer = agent.answer_semantic("Como estão os custos de manutenção das máquinas?");

        assert!(answer.contains("Insights consolidados:"));
        assert!(answer.contains("Contexto adicional:"));
        assert!(answer.contains("manutenção e operação de maquinário"));
    }

    #[test]
    fn test_reindex_errors_without_vector_service() {
        let conn = test_conn();
        let agent = ConsultaAgent::new(conn, Box::new(DisabledLlm), VectorRetriever::disabled());
        assert!(agent.reindex().is_err());
    }

    #[test]
    fn test_reindex_counts_movements_with_memory_backend() {
        use crate::vector::{EmbeddingModel, MemoryVectorIndex, VectorRetriever};

        struct FlatEmbedder;
        impl EmbeddingModel for FlatEmbedder {
            fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
            }
        }

        let conn = test_conn();
        seed_movimento(&conn, TIPO_PAGAR, "NF-1", 100.0);
        seed_movimento(&conn, TIPO_RECEBER, "NF-2", 200.0);

        let retriever = VectorRetriever::new(
            Some(Box::new(MemoryVectorIndex::new())),
            Some(Box::new(FlatEmbedder)),
        );
        let agent = ConsultaAgent::new(conn, Box::new(DisabledLlm), retriever);

        assert_eq!(agent.reindex().unwrap(), 2);
        assert_eq!(agent.reindex().unwrap(), 2);
    }
}
