use anyhow::{bail, Result};
use rusqlite::Connection;
use std::env;
use std::path::Path;

use contas_rag::{
    seed_from_csv, setup_database, ConsultaAgent, DisabledLlm, VectorRetriever,
};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => {
            let db_path = require_arg(&args, 2, "caminho do banco")?;
            let conn = Connection::open(Path::new(db_path))?;
            setup_database(&conn)?;
            println!("✓ Banco inicializado em {db_path}");
        }
        Some("seed") => {
            let db_path = require_arg(&args, 2, "caminho do banco")?;
            let csv_path = require_arg(&args, 3, "caminho do CSV")?;
            let conn = Connection::open(Path::new(db_path))?;
            setup_database(&conn)?;
            let outcome = seed_from_csv(&conn, Path::new(csv_path))?;
            let total = contas_rag::db::count_movimentos(&conn)?;
            println!(
                "✓ Carga concluída: {} inseridos, {} duplicados ignorados, {} no banco",
                outcome.inserted, outcome.skipped, total
            );
        }
        Some("ask") => {
            let agent = open_agent(&args)?;
            let question = join_question(&args)?;
            println!("{}", agent.answer_simple(&question));
        }
        Some("semantica") => {
            let agent = open_agent(&args)?;
            let question = join_question(&args)?;
            println!("{}", agent.answer_semantic(&question));
        }
        Some("export") => {
            let db_path = require_arg(&args, 2, "caminho do banco")?;
            let conn = Connection::open(Path::new(db_path))?;
            setup_database(&conn)?;
            for doc in contas_rag::load_movement_docs(&conn)? {
                println!("{}", serde_json::to_string(&doc)?);
            }
        }
        Some("reindex") => {
            let agent = open_agent(&args)?;
            let count = agent.reindex()?;
            println!("✓ {count} movimentos reindexados");
        }
        _ => {
            eprintln!("contas-rag {}", contas_rag::VERSION);
            eprintln!("Uso:");
            eprintln!("  contas-rag init <banco.db>");
            eprintln!("  contas-rag seed <banco.db> <dados.csv>");
            eprintln!("  contas-rag ask <banco.db> <pergunta...>");
            eprintln!("  contas-rag semantica <banco.db> <pergunta...>");
            eprintln!("  contas-rag reindex <banco.db>");
            eprintln!("  contas-rag export <banco.db>");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn require_arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(value) => Ok(value),
        None => bail!("argumento obrigatório ausente: {name}"),
    }
}

fn join_question(args: &[String]) -> Result<String> {
    if args.len() < 4 {
        bail!("argumento obrigatório ausente: pergunta");
    }
    Ok(args[3..].join(" "))
}

fn open_agent(args: &[String]) -> Result<ConsultaAgent> {
    let db_path = require_arg(args, 2, "caminho do banco")?;
    let conn = Connection::open(Path::new(db_path))?;
    setup_database(&conn)?;

    // No model credential or vector service wired in by default. Answers
    // stay deterministic (intents) or report the fixed fallback text.
    Ok(ConsultaAgent::new(
        conn,
        Box::new(DisabledLlm),
        VectorRetriever::disabled(),
    ))
}
