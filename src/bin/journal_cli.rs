use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use journal::inspect::{inspect_journal, read_records, SegmentSummary, SegmentTail};
use journal::JournalRecord;

#[derive(Parser)]
#[command(name = "journal-cli", version, about = "Segmented journal tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize every segment file without opening the journal.
    Inspect {
        directory: PathBuf,
        #[arg(long = "name", default_value = "journal")]
        name: String,
        #[arg(long = "json")]
        json: bool,
    },
    /// Print the readable records without opening the journal.
    Dump {
        directory: PathBuf,
        #[arg(long = "name", default_value = "journal")]
        name: String,
        #[arg(long = "from")]
        from: Option<i64>,
        #[arg(long = "limit")]
        limit: Option<usize>,
        #[arg(long = "hexdump")]
        hexdump: bool,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Inspect {
            directory,
            name,
            json,
        } => cmd_inspect(&directory, &name, json, &mut out)?,
        Commands::Dump {
            directory,
            name,
            from,
            limit,
            hexdump,
        } => cmd_dump(&directory, &name, from, limit, hexdump, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn cmd_inspect(
    directory: &Path,
    name: &str,
    json: bool,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let summaries = inspect_journal(directory, name)?;
    if json {
        serde_json::to_writer_pretty(&mut *out, &summaries)?;
        writeln!(out)?;
        return Ok(());
    }
    writeln!(
        out,
        "journal={} name={} segments={}",
        directory.display(),
        name,
        summaries.len()
    )?;
    for summary in &summaries {
        write_summary(summary, out)?;
    }
    Ok(())
}

fn write_summary(summary: &SegmentSummary, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let Some(start_index) = summary.start_index else {
        writeln!(
            out,
            "segment id={} uninitialized file_len={}",
            summary.id, summary.file_len
        )?;
        return Ok(());
    };
    writeln!(
        out,
        "segment id={} version={} start_index={} max_size={} file_len={}",
        summary.id,
        summary.version,
        start_index,
        summary.max_segment_size.unwrap_or_default(),
        summary.file_len
    )?;
    writeln!(
        out,
        "  records={} first_index={} last_index={} last_asqn={} end_position={} hint={}",
        summary.records,
        display_opt(summary.first_index),
        display_opt(summary.last_index),
        display_opt(summary.last_asqn),
        summary.end_position,
        display_opt(summary.hinted_last_index)
    )?;
    if let SegmentTail::Torn { position, reason } = &summary.tail {
        writeln!(out, "  torn_tail position={position} reason={reason}")?;
    }
    Ok(())
}

fn display_opt(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}

fn cmd_dump(
    directory: &Path,
    name: &str,
    from: Option<i64>,
    limit: Option<usize>,
    hexdump: bool,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let mut seen = 0usize;
    let mut written: io::Result<()> = Ok(());
    read_records(directory, name, from, |record| {
        written = write_record(&record, hexdump, out);
        seen = seen.saturating_add(1);
        written.is_ok() && limit.map_or(true, |limit| seen < limit)
    })?;
    written?;
    writeln!(out, "records={seen}")?;
    Ok(())
}

fn write_record(record: &JournalRecord, hexdump: bool, out: &mut dyn Write) -> io::Result<()> {
    writeln!(
        out,
        "index={} asqn={} checksum={:08x} len={}",
        record.index,
        record.asqn,
        record.checksum,
        record.data.len()
    )?;
    if hexdump {
        print_hexdump(&record.data, out)?;
    }
    Ok(())
}

fn print_hexdump(payload: &[u8], out: &mut dyn Write) -> io::Result<()> {
    for (offset, chunk) in payload.chunks(16).enumerate() {
        write!(out, "{:04x}:", offset * 16)?;
        for byte in chunk {
            write!(out, " {:02x}", byte)?;
        }
        writeln!(out)?;
    }
    Ok(())
}
