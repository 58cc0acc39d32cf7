//! Purpose: `rdump` CLI entry point; reads record streams from adapter URIs and prints or rewrites them.
//! Role: Binary crate root; parses args, wires the adapter dispatcher, emits records on stdout.
//! Invariants: Errors are emitted as JSON on stderr; record output never shares a stream with them.
//! Invariants: Process exit code is derived from `core::error::to_exit_code`.
//! Invariants: A bad record stream reports its error and reading continues with the next source.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use flowrecord::adapter::{DirStore, Dispatcher, RecordSink};
use flowrecord::core::error::to_exit_code;
use flowrecord::{Error, ErrorKind, Record};

const BLOB_SCHEME: &str = "gcs";

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

#[derive(Parser)]
#[command(
    name = "rdump",
    version,
    about = "Dump, filter, and convert record streams",
    long_about = None,
    after_help = r#"EXAMPLES
  $ rdump capture.records
  $ rdump -s 'r.idx >= 3' --json capture.records
  $ rdump -c 'gcs://my-project:my-bucket?path=/logs/*/results/*.records'
  $ rdump -s 'r.foo == "bar"' -w filtered.records capture.records

URIS
  <path> or file://<path>   local record file (`-` reads stdin)
  gcs://<project>:<bucket>?path=<path>[&selector=<expr>]
                            objects matching a glob (requires --blob-root)
  splunk[+tcp|+http|+https]://<host>:<port>[?tag=&token=&sourcetype=records|json]
                            forward records to Splunk (-w only)"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        value_name = "URI",
        required_unless_present = "completions",
        help = "Record sources to read, in order"
    )]
    uris: Vec<String>,
    #[arg(
        short = 's',
        long,
        value_name = "EXPR",
        help = "Only emit records matching this selector, e.g. \"r.idx >= 3\""
    )]
    selector: Option<String>,
    #[arg(
        short = 'w',
        long = "write",
        value_name = "URI",
        conflicts_with_all = ["json", "count"],
        help = "Write matching records as a record stream instead of printing them"
    )]
    write: Option<String>,
    #[arg(short = 'j', long, conflicts_with = "count", help = "Print records as JSON lines")]
    json: bool,
    #[arg(short = 'c', long, help = "Print only the number of matching records")]
    count: bool,
    #[arg(
        long,
        env = "FLOWRECORD_BLOB_ROOT",
        value_hint = ValueHint::DirPath,
        help = "Serve gcs:// URIs from this directory (one subdirectory per bucket)"
    )]
    blob_root: Option<PathBuf>,
    #[arg(long, value_name = "SHELL", help = "Print shell completions and exit")]
    completions: Option<Shell>,
}

enum Output {
    Text,
    Json,
    Count(u64),
    Sink(Box<dyn RecordSink>),
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `rdump --help`."));
            }
        },
    };

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        clap_complete::aot::generate(shell, &mut cmd, "rdump", &mut io::stdout());
        return Ok(0);
    }

    init_tracing();
    let dispatcher = build_dispatcher(&cli);
    let mut output = match &cli.write {
        Some(uri) => Output::Sink(dispatcher.open_writer(uri)?),
        None if cli.count => Output::Count(0),
        None if cli.json => Output::Json,
        None => Output::Text,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut first_failure: Option<ErrorKind> = None;
    let mut stdout_closed = false;
    for uri in &cli.uris {
        let mut source = dispatcher.open_reader(uri, cli.selector.as_deref())?;
        for item in source.by_ref() {
            let record = match item {
                Ok(record) => record,
                Err(err) => {
                    emit_error(&err);
                    first_failure.get_or_insert(err.kind());
                    continue;
                }
            };
            match emit_record(&mut output, &mut out, &record) {
                Ok(()) => {}
                Err(err) if is_broken_pipe(&err) => {
                    debug!("stdout closed; stopping");
                    stdout_closed = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        source.close()?;
        if stdout_closed {
            return Ok(first_failure.map(to_exit_code).unwrap_or(0));
        }
    }

    match output {
        Output::Count(count) => writeln!(out, "{count}").map_err(stdout_error)?,
        Output::Sink(mut sink) => sink.close()?,
        Output::Text | Output::Json => {}
    }
    out.flush().map_err(stdout_error)?;
    info!(sources = cli.uris.len(), "done");
    Ok(first_failure.map(to_exit_code).unwrap_or(0))
}

fn build_dispatcher(cli: &Cli) -> Dispatcher {
    let mut dispatcher = Dispatcher::with_defaults();
    if let Some(root) = &cli.blob_root {
        debug!(root = %root.display(), "serving {BLOB_SCHEME}:// from directory");
        dispatcher.register_object_store(BLOB_SCHEME, DirStore::new(root));
    }
    dispatcher
}

fn emit_record(output: &mut Output, out: &mut impl Write, record: &Record) -> Result<(), Error> {
    match output {
        Output::Text => writeln!(out, "{record}").map_err(stdout_error),
        Output::Json => {
            let line = serde_json::to_string(&record.to_json()).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode record as json")
                    .with_source(err)
            })?;
            writeln!(out, "{line}").map_err(stdout_error)
        }
        Output::Count(count) => {
            *count += 1;
            Ok(())
        }
        Output::Sink(sink) => sink.write(record),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn stdout_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write to stdout")
        .with_source(err)
}

fn is_broken_pipe(err: &Error) -> bool {
    err.source()
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|io_err| io_err.kind() == io::ErrorKind::BrokenPipe)
}

fn emit_error(err: &Error) {
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Syntax => "invalid selector".to_string(),
        ErrorKind::TypeMismatch => "type mismatch".to_string(),
        ErrorKind::Corrupt => "corrupt record stream".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Conflict => "conflict".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(err.kind().label()));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(uri) = err.uri() {
        inner.insert("uri".to_string(), json!(uri));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, error_json};
    use clap::{CommandFactory, Parser};
    use flowrecord::{Error, ErrorKind};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn write_conflicts_with_print_modes() {
        assert!(Cli::try_parse_from(["rdump", "-w", "out", "-j", "in"]).is_err());
        assert!(Cli::try_parse_from(["rdump", "-c", "-j", "in"]).is_err());
        let cli = Cli::try_parse_from(["rdump", "-s", "r.idx >= 3", "a", "b"]).unwrap();
        assert_eq!(cli.uris, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cli.selector.as_deref(), Some("r.idx >= 3"));
    }

    #[test]
    fn error_json_carries_context() {
        let err = Error::new(ErrorKind::Corrupt)
            .with_message("frame length check failed")
            .with_uri("a.records")
            .with_offset(16);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Corrupt");
        assert_eq!(value["error"]["uri"], "a.records");
        assert_eq!(value["error"]["offset"], 16);
        assert!(value["error"].get("hint").is_none());
    }
}
