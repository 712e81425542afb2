use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use folio_core::bootstrap::{create_provider, open_index};
use folio_core::config::{Config, resolve_config_path};
use folio_core::{AnswerOutcome, Citation, QueryRequest, RagEngine, RetrievalMode};
use folio_index::SearchFilters;
use folio_index::document::{BoundingBox, DocumentId};
use folio_llm::any::AnyProvider;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Question answering over technical PDF documentation")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Chunk, embed and index one or more documents.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Ask a question and print a cited answer.
    Query {
        question: String,
        #[arg(short)]
        k: Option<usize>,
        #[arg(long)]
        mode: Option<RetrievalMode>,
        /// Restrict retrieval to these documents.
        #[arg(long = "document")]
        documents: Vec<i64>,
        /// Print retrieved context without calling the model.
        #[arg(long)]
        retrieve_only: bool,
    },
    /// Find chunks that look like a region of a page.
    Region {
        #[arg(long)]
        document: i64,
        #[arg(long)]
        page: u32,
        /// Region box as `x0,y0,x1,y1` in page points.
        #[arg(long, value_parser = parse_bbox)]
        bbox: BoundingBox,
        #[arg(short)]
        k: Option<usize>,
    },
    /// Remove a document and its vectors.
    Delete { document: i64 },
    /// Show one document, or all documents.
    Status { document: Option<i64> },
}

fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x0, y0, x1, y1] => Ok(BoundingBox::new(*x0, *y0, *x1, *y1)),
        _ => Err(format!("expected four comma-separated numbers, got {}", parts.len())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    config.validate()?;
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    let provider = Arc::new(create_provider(&config)?);
    let index = Arc::new(open_index(&config.index).await?);
    let engine = RagEngine::new(provider, index, &config).context("failed to build engine")?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e:#}");
            return;
        }
        tracing::info!("received shutdown signal");
        token.cancel();
    });

    run(&engine, cli.command, &cancel).await
}

async fn run(
    engine: &RagEngine<AnyProvider>,
    command: Command,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Ingest { paths } => {
            for path in paths {
                let report = engine
                    .ingest_file(&path, cancel)
                    .await
                    .with_context(|| format!("failed to ingest {}", path.display()))?;
                println!(
                    "{}: document {} v{} {} ({} chunks, {} region vectors)",
                    path.display(),
                    report.document_id,
                    report.version,
                    report.status,
                    report.chunks,
                    report.region_vectors
                );
            }
        }
        Command::Query {
            question,
            k,
            mode,
            documents,
            retrieve_only,
        } => {
            let request = QueryRequest::new(question, k.unwrap_or(engine.default_k()))
                .with_mode(mode.unwrap_or(engine.default_mode()))
                .with_filters(SearchFilters {
                    document_ids: documents.into_iter().map(DocumentId).collect(),
                    ..SearchFilters::default()
                });
            if retrieve_only {
                let retrieved = engine.search(request, cancel).await?;
                print!("{}", retrieved.context.render());
                return Ok(());
            }
            let response = engine.query(request, cancel).await?;
            match response.answer {
                AnswerOutcome::Generated { text } => println!("{text}"),
                AnswerOutcome::NoResults => {
                    println!("No relevant passages were found in the indexed documents.");
                }
                AnswerOutcome::Ungrounded { text } => {
                    println!("{text}\n\n(not backed by the indexed documents)");
                }
                AnswerOutcome::GenerationFailed { reason } => {
                    eprintln!("answer generation failed: {reason}");
                    print!("{}", response.raw_context.render());
                }
            }
            print_citations(&response.citations, &response.raw_context);
        }
        Command::Region {
            document,
            page,
            bbox,
            k,
        } => {
            let response = engine
                .query_by_region(
                    DocumentId(document),
                    page,
                    bbox,
                    k.unwrap_or(engine.default_k()),
                    cancel,
                )
                .await?;
            if !response.with_text {
                println!("(no text under the region, matched on geometry only)");
            }
            print!("{}", response.raw_context.render());
            print_citations(&response.citations, &response.raw_context);
        }
        Command::Delete { document } => {
            if engine.delete(DocumentId(document)).await? {
                println!("deleted document {document}");
            } else {
                println!("document {document} not found");
            }
        }
        Command::Status { document: Some(id) } => {
            let record = engine.status(DocumentId(id)).await?;
            print_record(&record);
        }
        Command::Status { document: None } => {
            for record in engine.documents().await? {
                print_record(&record);
            }
        }
    }
    Ok(())
}

/// List each cited source under the marker it carries in the rendered context.
fn print_citations(citations: &[Citation], context: &folio_core::Context) {
    if citations.is_empty() {
        return;
    }
    println!("\nSources:");
    for citation in citations {
        match context.marker_of(citation) {
            Some(marker) => println!("  [{marker}] {citation}"),
            None => println!("  [?] {citation}"),
        }
    }
}

fn print_record(record: &folio_index::DocumentRecord) {
    let live = record
        .live_version
        .map_or_else(|| "none".to_owned(), |v| format!("v{v}"));
    print!(
        "{} {} status={} version={} live={}",
        record.id, record.source, record.status, record.version, live
    );
    if let Some(error) = &record.error {
        print!(" error={error:?}");
    }
    println!();
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_parses_four_numbers() {
        let bbox = parse_bbox("72, 80.5,540,120").unwrap();
        assert_eq!(bbox, BoundingBox::new(72.0, 80.5, 540.0, 120.0));
    }

    #[test]
    fn bbox_rejects_wrong_arity() {
        assert!(parse_bbox("1,2,3").unwrap_err().contains("got 3"));
        assert!(parse_bbox("1,2,x,4").is_err());
    }

    #[test]
    fn cli_parses_query() {
        let cli = Cli::try_parse_from([
            "folio", "query", "What torque?", "-k", "3", "--mode", "enhanced", "--document", "4",
        ])
        .unwrap();
        let Command::Query {
            question,
            k,
            mode,
            documents,
            retrieve_only,
        } = cli.command
        else {
            panic!("expected query");
        };
        assert_eq!(question, "What torque?");
        assert_eq!(k, Some(3));
        assert_eq!(mode, Some(RetrievalMode::Enhanced));
        assert_eq!(documents, vec![4]);
        assert!(!retrieve_only);
    }

    #[test]
    fn cli_parses_region_with_global_config() {
        let cli = Cli::try_parse_from([
            "folio", "region", "--document", "2", "--page", "1", "--bbox", "0,0,10,10",
            "--config", "custom.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Region { page: 1, .. }));
    }
}
