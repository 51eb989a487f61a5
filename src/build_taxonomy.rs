use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use topic_atlas::pipeline;
use topic_atlas::{CancellationToken, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "build-taxonomy")]
#[command(about = "Topic clustering using weighted hierarchical agglomerative clustering")]
struct Args {
    /// Directory containing <N>-topics.json episode files
    #[arg(long)]
    episodes_dir: Option<PathBuf>,

    /// Output directory for the embedding database and the taxonomy
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Recompute the embedding database even if the cached one matches
    #[arg(long)]
    refresh_embeddings: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let start_time = Instant::now();

    println!("🔬 Topic-Clustering für Podcast-Episoden\n");

    let (mut cfg, settings_source) = match PipelineConfig::from_env_and_settings() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ {e}");
            eprintln!("   Kopiere settings.example.json zu settings.json und passe die Konfiguration an.\n");
            std::process::exit(1);
        }
    };
    if let Some(dir) = args.episodes_dir {
        cfg.episodes_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        cfg.output_dir = dir;
    }
    cfg.force_refresh_embeddings = args.refresh_embeddings;

    println!("📋 Einstellungen aus {settings_source}");
    println!("📊 Clustering-Einstellungen:");
    println!("   Episoden-Verzeichnis: {}", cfg.episodes_dir.display());
    println!("   Ausgabe-Verzeichnis:  {}", cfg.output_dir.display());
    println!("   Ziel-Cluster:         {}", cfg.target_clusters);
    println!("   Outlier-Schwellwert:  {}", cfg.outlier_threshold);
    println!("   Linkage-Methode:      {}", cfg.linkage);
    println!(
        "   Relevanz-Gewichtung:  {}",
        if cfg.use_relevance_weighting {
            "Ja"
        } else {
            "Nein"
        }
    );
    println!(
        "   LLM-Benennung:        {}",
        if cfg.use_llm_naming { "Ja" } else { "Nein" }
    );
    println!("   Embedding-Modell:     {}\n", cfg.embedding_model);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n⚠️  Abbruch angefordert, beende nach dem aktuellen Schritt...");
                cancel.cancel();
            }
        });
    }

    let taxonomy = match pipeline::run(&cfg, &cancel).await {
        Ok(taxonomy) => taxonomy,
        Err(e) => {
            eprintln!("\n❌ {e}");
            std::process::exit(1);
        }
    };

    println!("\n📋 Top 15 Cluster:");
    for (i, c) in taxonomy.clusters.iter().take(15).enumerate() {
        let outlier_tag = if c.is_outlier { " [Outlier]" } else { "" };
        println!(
            "   {}. {}{} ({} Episoden, {} Topics)",
            i + 1,
            c.name,
            outlier_tag,
            c.episode_count,
            c.topic_count
        );
        println!("      Beispiele: {}", c.sample_topics.join(", "));
    }

    let elapsed = start_time.elapsed();
    println!("\n✨ Statistik:");
    println!(
        "   {} Cluster erstellt",
        taxonomy.statistics.cluster_count
    );
    println!(
        "   {} Outlier ({})",
        taxonomy.statistics.outlier_count, taxonomy.statistics.outlier_percentage
    );
    println!("   Laufzeit: {:.2}s", elapsed.as_secs_f64());
}
