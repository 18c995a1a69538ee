use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orgtext::core::{Document, ParseConfig, TodoKeywordSet};
use orgtext::{export, parse_with_config, query_inherited_flag, tokenize};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "orgtext",
    about = "Format-preserving org-mode parser and exporter",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Keyword set used for files without `#+TODO:` (e.g. "TODO NEXT | DONE").
    #[arg(long, global = true)]
    todo_keywords: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print the document model.
    Parse(ParseArgs),

    /// Re-export Org files, putting planning items in canonical order.
    Format(FormatArgs),

    /// Verify that Org files survive a parse/export round trip unchanged.
    Check(CheckArgs),

    /// Print the inline spans of one line as JSON.
    Tokenize(TokenizeArgs),

    /// Resolve an inherited flag for one heading.
    Flag(FlagArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Org files or directories to verify.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct TokenizeArgs {
    /// A single line of text.
    line: String,
}

#[derive(Debug, Args)]
struct FlagArgs {
    /// Org file to query.
    input: PathBuf,
    /// Heading position in document order, starting at 0.
    #[arg(long)]
    heading: usize,
    /// Flag name: nologrepeat, logdone or logintodrawer.
    #[arg(long)]
    name: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = parse_config(cli.todo_keywords.as_deref())?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &config),
        Commands::Format(args) => handle_format(args, &config),
        Commands::Check(args) => handle_check(args, &config),
        Commands::Tokenize(args) => handle_tokenize(args),
        Commands::Flag(args) => handle_flag(args, &config),
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the level picked by `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "orgtext=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn parse_config(todo_keywords: Option<&str>) -> Result<ParseConfig> {
    let mut config = ParseConfig::default();
    if let Some(declaration) = todo_keywords {
        config.default_keywords = TodoKeywordSet::from_declaration(declaration)
            .with_context(|| format!("--todo-keywords {declaration:?} names no keywords"))?;
    }
    Ok(config)
}

fn read_document(path: &Path, config: &ParseConfig) -> Result<(String, Document)> {
    debug!(path = %path.display(), "parsing");
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let doc = parse_with_config(&text, config);
    for warning in &doc.warnings {
        info!(path = %path.display(), %warning, "parse warning");
    }
    Ok((text, doc))
}

fn handle_parse(args: ParseArgs, config: &ParseConfig) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let files = org_files(&inputs)?;

    let mut parsed = Vec::new();
    for path in files {
        let (_, doc) = read_document(&path, config)?;
        parsed.push((path, doc));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, doc) in &parsed {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc);
        }
    }
    Ok(())
}

fn handle_format(args: FormatArgs, config: &ParseConfig) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let files = org_files(&inputs)?;
    let many = files.len() > 1;

    for path in files {
        let (text, doc) = read_document(&path, config)?;
        let formatted = export(&doc);

        if in_place {
            if formatted != text {
                fs::write(&path, formatted.as_bytes())
                    .with_context(|| format!("writing {:?}", path))?;
                info!(path = %path.display(), "rewrote");
            }
        } else {
            if many {
                println!("== {} ==", path.display());
            }
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_check(args: CheckArgs, config: &ParseConfig) -> Result<()> {
    let files = org_files(&args.inputs)?;
    let mut failures = 0;

    for path in &files {
        let (text, doc) = read_document(path, config)?;
        match first_difference(&text, &export(&doc)) {
            None => println!("ok      {}", path.display()),
            Some(diff) => {
                failures += 1;
                println!("changed {}:{}", path.display(), diff.line);
                println!("  - {:?}", diff.expected);
                println!("  + {:?}", diff.actual);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} files do not round-trip", files.len());
    }
    Ok(())
}

fn handle_tokenize(args: TokenizeArgs) -> Result<()> {
    let spans = tokenize(&args.line);
    println!("{}", serde_json::to_string_pretty(&spans)?);
    Ok(())
}

fn handle_flag(args: FlagArgs, config: &ParseConfig) -> Result<()> {
    let FlagArgs {
        input,
        heading,
        name,
    } = args;
    let (_, doc) = read_document(&input, config)?;
    let value = query_inherited_flag(&doc, heading, &name)
        .with_context(|| format!("querying {name:?} in {:?}", input))?;
    println!("{value}");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct LineDiff {
    line: usize,
    expected: String,
    actual: String,
}

/// First line (1-based, terminators included) where the two texts disagree.
fn first_difference(expected: &str, actual: &str) -> Option<LineDiff> {
    let mut left = expected.split_inclusive('\n');
    let mut right = actual.split_inclusive('\n');
    let mut line = 1;
    loop {
        match (left.next(), right.next()) {
            (None, None) => return None,
            (a, b) if a == b => line += 1,
            (a, b) => {
                return Some(LineDiff {
                    line,
                    expected: a.unwrap_or_default().to_string(),
                    actual: b.unwrap_or_default().to_string(),
                });
            }
        }
    }
}

/// Expands files and directories into a sorted, de-duplicated list of `.org` files.
fn org_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for input in inputs {
        let canonical =
            fs::canonicalize(input).with_context(|| format!("resolving path {:?}", input))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            walk_dir(&canonical, &mut found)?;
        } else if is_org(&canonical) {
            found.insert(canonical);
        } else {
            anyhow::bail!("{:?} is not an .org file", canonical);
        }
    }
    if found.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }
    Ok(found.into_iter().collect())
}

fn walk_dir(root: &Path, found: &mut BTreeSet<PathBuf>) -> Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        debug!(dir = %dir.display(), "scanning");
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {:?}", dir))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && is_org(&path) {
                found.insert(path);
            }
        }
    }
    Ok(())
}

fn is_org(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}
