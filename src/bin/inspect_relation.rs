use anyhow::{Context, Result};
use clap::Parser;
use starload::store::{quote_ident, RelationName};
use starload::{DuckStore, RelationalStore};
use std::path::PathBuf;

/// Print the definition, row count and first rows of one relation.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// `schema.name` or `name` (main schema).
    relation: String,
    #[arg(long, env = "STARLOAD_DB", default_value = "starload.duckdb")]
    db: PathBuf,
    #[arg(short, long, default_value_t = 10)]
    limit: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").init();
    let args = Args::parse();

    let relation = match args.relation.split_once('.') {
        Some((schema, name)) => RelationName::new(Some(schema), name),
        None => RelationName::new(None, &args.relation),
    };
    let store = DuckStore::open(&args.db)
        .with_context(|| format!("opening {}", args.db.display()))?;

    let columns = store
        .describe(&relation)?
        .with_context(|| format!("relation {} not found", relation))?;
    println!("{} ({} rows)", relation, store.count(&relation)?);
    for col in &columns {
        println!("  {:<24} {}", col.name, col.ty.as_sql());
    }

    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let rows = store.query(&format!(
        "SELECT {} FROM {} LIMIT {}",
        names.join(", "),
        relation.qualified(),
        args.limit
    ))?;
    println!();
    println!(
        "{}",
        columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join("\t")
    );
    for row in rows {
        println!(
            "{}",
            row.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\t")
        );
    }
    Ok(())
}
