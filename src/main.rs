use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, bail};
use log::info;
use study_impute::{
    ImputationPipeline, ImputationStore, RunOutcome, StudyConfig, read_source_records,
};

#[global_allocator]
static ALLOC: snmalloc_rs::SnMalloc = snmalloc_rs::SnMalloc;

const USAGE: &str =
    "usage: study-impute <config.json> <input.parquet> [--json] [--resume] [--verify]";

struct Args {
    config: PathBuf,
    input: PathBuf,
    json: bool,
    resume: bool,
    verify: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let (mut json, mut resume, mut verify) = (false, false, false);
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            "--resume" => resume = true,
            "--verify" => verify = true,
            "-h" | "--help" => bail!(USAGE),
            flag if flag.starts_with("--") => bail!("unknown option '{flag}'\n{USAGE}"),
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    let [config, input] = <[PathBuf; 2]>::try_from(positional)
        .map_err(|_| anyhow::anyhow!("expected two paths\n{USAGE}"))?;
    Ok(Args {
        config,
        input,
        json,
        resume,
        verify,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Setup logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;
    let start = Instant::now();

    let mut config = StudyConfig::from_json_file(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    config.resume |= args.resume;

    let pipeline = ImputationPipeline::with_defaults(config)?;
    let sources = read_source_records(&args.input, pipeline.catalog())
        .with_context(|| format!("reading input {}", args.input.display()))?;
    let store = ImputationStore::new(&pipeline.config().storage_root)?;

    // Stages are CPU-bound and use their own rayon pool
    let run_store = store.clone();
    let report = tokio::task::spawn_blocking(move || pipeline.run(&run_store, &sources)).await??;

    if args.verify && report.outcome == RunOutcome::Completed {
        let session = store.open_session(&report.study_id)?;
        let worlds = session.get_imputation_list_async().await?;
        info!(
            "Composed {} completed datasets of {} records each",
            worlds.len(),
            worlds.first().map_or(0, |w| w.len())
        );
        session.close();
    }

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        println!("{report}");
    }
    info!("Total time: {:.2?}", start.elapsed());

    let code = u8::try_from(report.exit_code()).unwrap_or(1);
    Ok(ExitCode::from(code))
}
