use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use sevenzip_bridge::com::{SharedSink, VtableLayout};
use sevenzip_bridge::detect::FormatDetector;
use sevenzip_bridge::native::{EngineConfig, Registry};
use sevenzip_bridge::session::EntryProblem;
use sevenzip_bridge::{
    ArchiveEngine, ExtractOptions, ExtractionSession, FormatSelection, SignatureCatalog,
};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "szb", about = "Inspect and extract archives through the 7-Zip engine")]
struct Cli {
    /// Path to 7z.so / 7z.dll (default: $SEVENZIP_LIB, then next to this binary)
    #[arg(long, global = true)]
    lib: Option<PathBuf>,
    /// Directory of codec plugins (default: <lib dir>/Codecs)
    #[arg(long, global = true)]
    codecs: Option<PathBuf>,
    /// Engine vtable layout: plain or with-destructors
    #[arg(long, global = true)]
    layout: Option<VtableLayout>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the formats, coders and hashers the engine provides
    Formats {
        /// Show the built-in format table instead of loading the engine
        #[arg(long)]
        builtin: bool,
    },
    /// Guess the format of a file from its signature and name
    Detect {
        input: PathBuf,
        /// Use the built-in signature table instead of loading the engine
        #[arg(long)]
        builtin: bool,
    },
    /// List archive contents
    List {
        input: PathBuf,
        /// Force a format by name (7z, zip, tar, ...)
        #[arg(short, long)]
        format: Option<String>,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Extract an archive
    Extract {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Replace existing files
        #[arg(long)]
        overwrite: bool,
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Decode every entry in memory and verify it
    Test {
        input: PathBuf,
        #[arg(short, long)]
        format: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {

        // ── Formats ──────────────────────────────────────────────────────────
        Commands::Formats { builtin } => {
            let engine = if *builtin { None } else { Some(load_engine(&cli)?) };
            let catalog = match &engine {
                Some(e) => e.catalog().clone(),
                None    => SignatureCatalog::builtin(),
            };
            println!("{:<12} {:<28} {:>6}  Signature", "Name", "Extensions", "Offset");
            for f in &catalog {
                let exts: Vec<&str> = f.extensions.iter().map(|e| e.ext.as_str()).collect();
                let sig = f.signatures.first().map(|s| hex::encode(s)).unwrap_or_else(|| "-".into());
                let more = if f.signatures.len() > 1 { format!(" (+{})", f.signatures.len() - 1) } else { String::new() };
                println!("{:<12} {:<28} {:>6}  {}{}", f.name, exts.join(" "), f.signature_offset, sig, more);
            }
            if let Some(engine) = &engine {
                let coders = engine.coders();
                println!("\nCoders ({}):", coders.len());
                for c in &coders {
                    let dir = match (c.decoder_assigned, c.encoder_assigned) {
                        (true, true) => "ED",
                        (true, false) => "D ",
                        (false, true) => " E",
                        _ => "  ",
                    };
                    println!("  {:016x} {} {}", c.id, dir, c.name);
                }
                let hashers = engine.hashers();
                println!("\nHashers ({}):", hashers.len());
                for h in &hashers {
                    println!("  {:016x} {:>3} B {}", h.id, h.digest_size, h.name);
                }
                for s in engine.skipped_modules() {
                    eprintln!("skipped {}: {}", s.path.display(), s.reason);
                }
            }
        }

        // ── Detect ───────────────────────────────────────────────────────────
        Commands::Detect { input, builtin } => {
            let engine = if *builtin { None } else { Some(load_engine(&cli)?) };
            let catalog = match &engine {
                Some(e) => e.catalog().clone(),
                None    => SignatureCatalog::builtin(),
            };
            let name = input.file_name().and_then(|n| n.to_str());
            let mut file = std::fs::File::open(input)?;
            let result = FormatDetector::new(&catalog).detect(&mut file, name)?;
            let names = |ix: &[usize]| -> Vec<String> {
                ix.iter().filter_map(|&i| catalog.get(i)).map(|d| d.name.clone()).collect()
            };
            println!("Probable  {}", names(&result.probable).join(", "));
            println!("Unlikely  {}", names(&result.unlikely).join(", "));
            match result.best().and_then(|i| catalog.get(i)) {
                Some(d) => println!("Selected  {} ({})", d.name, d.class_id),
                None    => println!("Selected  -"),
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, format, json } => {
            let engine = load_engine(&cli)?;
            let selection = parse_selection(&engine, format.as_deref())?;
            let mut session = ExtractionSession::open_path(engine, input, selection)?;
            let entries = session.entries()?.to_vec();
            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            println!("Archive: {} [{}]", input.display(), session.format_name().unwrap_or("?"));
            println!("{:<19} {:>12} {:>12} {:>8}  Name", "Modified", "Size", "Packed", "CRC");
            for e in &entries {
                let when = e.modified
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                let crc = e.crc.map(|c| format!("{c:08x}")).unwrap_or_default();
                let name = if e.is_folder { format!("{}/", e.path) } else { e.path.clone() };
                println!("{:<19} {:>12} {:>12} {:>8}  {}", when, e.size, e.packed_size, crc, name);
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, overwrite, format } => {
            let engine = load_engine(&cli)?;
            let selection = parse_selection(&engine, format.as_deref())?;
            let mut session = ExtractionSession::open_path(engine, input, selection)?;
            let report = session.extract_to_dir(output_dir, ExtractOptions { overwrite: *overwrite })?;
            for w in &report.warnings {
                eprintln!("  warning  {}: {:?}", w.path.as_deref().unwrap_or("?"), w.problem);
            }
            println!("Extracted {} file(s), {} B to {}",
                report.extracted.len(), report.bytes_written, output_dir.display());
            if !report.is_clean() {
                return Err(format!("{} entr(y/ies) failed", report.warnings.len()).into());
            }
        }

        // ── Test ─────────────────────────────────────────────────────────────
        Commands::Test { input, format } => {
            let engine = load_engine(&cli)?;
            let selection = parse_selection(&engine, format.as_deref())?;
            let mut session = ExtractionSession::open_path(engine, input, selection)?;
            let entries = session.entries()?.to_vec();

            let buffers: Vec<Option<Arc<Mutex<Cursor<Vec<u8>>>>>> = entries
                .iter()
                .map(|e| (!e.is_folder).then(|| Arc::new(Mutex::new(Cursor::new(Vec::new())))))
                .collect();
            let sinks: Vec<Option<SharedSink>> = buffers
                .iter()
                .map(|b| b.clone().map(|b| b as SharedSink))
                .collect();
            let report = session.extract_to_sinks(sinks)?;

            for (e, buf) in entries.iter().zip(&buffers) {
                let Some(buf) = buf else { continue };
                let data = buf.lock();
                let digest = blake3::hash(data.get_ref());
                let status = match report.warnings.iter().find(|w| w.index == Some(e.index)) {
                    Some(w) => match &w.problem {
                        EntryProblem::CrcMismatch { .. } => "CRC MISMATCH".to_string(),
                        p => format!("{p:?}"),
                    },
                    None if e.crc.is_some() => "OK (crc)".to_string(),
                    None => "OK".to_string(),
                };
                println!("{}  {:<14} {}", &digest.to_hex()[..16], status, e.path);
            }
            println!("{} ok, {} problem(s)", report.extracted.len(), report.warnings.len());
            if !report.is_clean() {
                return Err("archive test failed".into());
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn load_engine(cli: &Cli) -> Result<Arc<Registry>, Box<dyn std::error::Error>> {
    let mut config = match &cli.lib {
        Some(path) => EngineConfig::new(path),
        None => EngineConfig::locate()
            .ok_or("no 7-Zip engine found; pass --lib or set SEVENZIP_LIB")?,
    };
    if let Some(layout) = cli.layout {
        config = config.with_layout(layout);
    }
    if let Some(dir) = &cli.codecs {
        config = config.with_codecs_dir(dir);
    }
    Ok(Arc::new(Registry::load(&config)?))
}

fn parse_selection(engine: &Registry, name: Option<&str>) -> Result<FormatSelection, Box<dyn std::error::Error>> {
    let Some(name) = name else {
        return Ok(FormatSelection::Auto);
    };
    engine
        .catalog()
        .find_by_name(name)
        .map(|d| FormatSelection::ClassId(d.class_id))
        .ok_or_else(|| format!("engine has no format named '{name}'").into())
}
