use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use rusty_rtdc::{Criterion, Dataset, ExportOptions};

const USAGE: &str = "\
Usage:
  rusty-rtdc info <input>
  rusty-rtdc export <input> <output.{tsv,fcs,parquet}> [features...]
                    [--unfiltered] [--overwrite] [--range feature=lower:upper]...";

enum Command {
    Info(PathBuf),
    Export {
        input: PathBuf,
        output: PathBuf,
        features: Vec<String>,
        ranges: Vec<Criterion>,
        options: ExportOptions,
    },
}

fn parse_range(spec: &str) -> anyhow::Result<Criterion> {
    let (feature, bounds) = spec
        .split_once('=')
        .with_context(|| format!("expected feature=lower:upper, got '{spec}'"))?;
    let (lower, upper) = bounds
        .split_once(':')
        .with_context(|| format!("expected lower:upper, got '{bounds}'"))?;
    Ok(Criterion::range(
        feature,
        lower.trim().parse().with_context(|| format!("bad lower bound '{lower}'"))?,
        upper.trim().parse().with_context(|| format!("bad upper bound '{upper}'"))?,
    ))
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    match args.first().map(String::as_str) {
        Some("info") => match args.get(1) {
            Some(input) if args.len() == 2 => Ok(Command::Info(PathBuf::from(input))),
            _ => bail!("{USAGE}"),
        },
        Some("export") => {
            let mut positional = Vec::new();
            let mut ranges = Vec::new();
            let mut options = ExportOptions::default();
            let mut rest = args[1..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--unfiltered" => options.filtered = false,
                    "--overwrite" => options.overwrite = true,
                    "--range" => {
                        let spec = rest.next().context("--range needs a value")?;
                        ranges.push(parse_range(spec)?);
                    }
                    flag if flag.starts_with("--") => bail!("unknown option {flag}\n{USAGE}"),
                    value => positional.push(value.to_string()),
                }
            }
            if positional.len() < 2 {
                bail!("{USAGE}");
            }
            let features = positional.split_off(2);
            Ok(Command::Export {
                input: PathBuf::from(&positional[0]),
                output: PathBuf::from(&positional[1]),
                features,
                ranges,
                options,
            })
        }
        _ => bail!("{USAGE}"),
    }
}

fn info(input: &Path) -> anyhow::Result<()> {
    let ds = Dataset::open(input).with_context(|| format!("opening {}", input.display()))?;
    println!("{}", ds.title());
    println!("  events:   {}", ds.len());
    println!("  hash:     {}", ds.hash()?);
    println!("  innate:   {}", ds.features_innate().into_iter().collect::<Vec<_>>().join(", "));
    println!("  basins:   {}", ds.features_basin().into_iter().collect::<Vec<_>>().join(", "));
    for (key, value) in ds.config().to_flat() {
        println!("  {key} = {value}");
    }
    Ok(())
}

fn export(
    input: &Path,
    output: &Path,
    features: Vec<String>,
    ranges: Vec<Criterion>,
    options: &ExportOptions,
) -> anyhow::Result<()> {
    let mut ds = Dataset::open(input).with_context(|| format!("opening {}", input.display()))?;
    for criterion in ranges {
        ds.add_criterion(criterion)?;
    }
    ds.apply_filter()?;

    // No feature list: every scalar feature the dataset can resolve.
    let features = if features.is_empty() {
        ds.features()
            .into_iter()
            .filter(|f| matches!(ds.kind(f), Ok(rusty_rtdc::FeatureKind::Scalar)))
            .collect()
    } else {
        features
    };
    let names: Vec<&str> = features.iter().map(String::as_str).collect();

    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let exporter = ds.export();
    let written = match ext.as_str() {
        "tsv" => exporter.tsv(output, &names, options)?,
        "fcs" => exporter.fcs(output, &names, options)?,
        "parquet" => exporter.parquet(output, &names, options)?,
        other => bail!("cannot export to '.{other}' (use .tsv, .fcs or .parquet)"),
    };
    println!(
        "{} of {} events -> {}",
        if options.filtered { ds.filter().count() } else { ds.len() },
        ds.len(),
        written.display()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Command::Info(input) => info(&input),
        Command::Export {
            input,
            output,
            features,
            ranges,
            options,
        } => export(&input, &output, features, ranges, &options),
    }
}
