//! Tracing setup and the log tail behind `/logs`.
//!
//! Three streams are written under `logs/`, each as a daily rolling plain-text file and a
//! JSON-lines twin: the general bot log, provider request timings, and one line per
//! finished generation attempt. Timing and generation events stay out of the general log.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

pub const LOG_DIR: &str = "logs";
pub const TIMING_TARGET: &str = "bot.timing";
pub const GENERATION_TARGET: &str = "bot.generation";

/// Holds the background writers; logs are flushed when this is dropped.
pub struct LoggingGuards {
    _writers: Vec<WorkerGuard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Bot,
    Timing,
    Generations,
}

impl LogStream {
    pub const ALL: [LogStream; 3] = [LogStream::Bot, LogStream::Timing, LogStream::Generations];

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "bot" | "main" => Some(LogStream::Bot),
            "timing" | "timings" => Some(LogStream::Timing),
            "generation" | "generations" | "gen" => Some(LogStream::Generations),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LogStream::Bot => "bot",
            LogStream::Timing => "timing",
            LogStream::Generations => "generations",
        }
    }

    /// Base name of the plain-text file; the appender adds a date suffix.
    pub fn file_name(self) -> String {
        format!("{}.log", self.name())
    }

    fn json_file_name(self) -> String {
        format!("{}.jsonl", self.name())
    }

    fn filter(self, general_level: LevelFilter) -> Targets {
        match self {
            LogStream::Bot => Targets::new()
                .with_default(general_level)
                .with_target(TIMING_TARGET, LevelFilter::OFF)
                .with_target(GENERATION_TARGET, LevelFilter::OFF)
                .with_target("hyper", LevelFilter::WARN)
                .with_target("hyper_util", LevelFilter::WARN)
                .with_target("reqwest", LevelFilter::WARN)
                .with_target("sqlx", LevelFilter::WARN),
            LogStream::Timing => Targets::new()
                .with_default(LevelFilter::OFF)
                .with_target(TIMING_TARGET, LevelFilter::INFO),
            LogStream::Generations => Targets::new()
                .with_default(LevelFilter::OFF)
                .with_target(GENERATION_TARGET, LevelFilter::INFO),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogTail {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

fn parse_log_level(value: &str) -> LevelFilter {
    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Plain and JSON file layers for one stream.
fn file_layers<S>(
    logs_dir: &Path,
    stream: LogStream,
    filter: Targets,
    guards: &mut Vec<WorkerGuard>,
) -> Vec<Box<dyn Layer<S> + Send + Sync + 'static>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let (plain_writer, plain_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, stream.file_name()));
    let (json_writer, json_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(logs_dir, stream.json_file_name()),
    );
    guards.push(plain_guard);
    guards.push(json_guard);

    vec![
        tracing_subscriber::fmt::layer()
            .with_writer(plain_writer)
            .with_ansi(false)
            .with_filter(filter.clone())
            .boxed(),
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(json_writer)
            .with_filter(filter)
            .boxed(),
    ]
}

pub fn init_logging(log_level: &str) -> LoggingGuards {
    let logs_dir = Path::new(LOG_DIR);
    if let Err(err) = fs::create_dir_all(logs_dir) {
        eprintln!("Failed to create logs directory: {err}");
    }

    let general_level = parse_log_level(log_level);
    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    for stream in LogStream::ALL {
        layers.extend(file_layers(
            logs_dir,
            stream,
            stream.filter(general_level),
            &mut guards,
        ));
    }
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_writer(io::stdout)
            .with_filter(LogStream::Bot.filter(general_level))
            .boxed(),
    );

    tracing_subscriber::registry().with(layers).init();

    LoggingGuards { _writers: guards }
}

/// Last `max_lines` lines of the newest file of `stream`.
pub fn read_recent_log_lines(stream: LogStream, max_lines: usize) -> io::Result<Option<LogTail>> {
    read_recent_lines_in(Path::new(LOG_DIR), stream, max_lines)
}

fn read_recent_lines_in(
    logs_dir: &Path,
    stream: LogStream,
    max_lines: usize,
) -> io::Result<Option<LogTail>> {
    if max_lines == 0 || !logs_dir.exists() {
        return Ok(None);
    }
    let Some(path) = newest_file_with_prefix(logs_dir, &stream.file_name())? else {
        return Ok(None);
    };
    let lines = last_lines(&path, max_lines)?;
    Ok(Some(LogTail { path, lines }))
}

fn newest_file_with_prefix(dir: &Path, prefix: &str) -> io::Result<Option<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push((modified, entry.path()));
    }
    Ok(candidates
        .into_iter()
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path))
}

fn last_lines(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut window = VecDeque::with_capacity(max_lines);
    for line in reader.lines() {
        if window.len() == max_lines {
            window.pop_front();
        }
        window.push_back(line?);
    }
    Ok(window.into())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "image_studio_logs_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_lines(path: &Path, lines: std::ops::Range<usize>, label: &str) {
        let mut file = File::create(path).unwrap();
        for index in lines {
            writeln!(file, "{label} {index}").unwrap();
        }
    }

    #[test]
    fn tail_reads_only_the_requested_stream() {
        let dir = scratch_dir("streams");
        write_lines(&dir.join("bot.log.2026-10-17"), 0..10, "bot");
        write_lines(&dir.join("bot.jsonl.2026-10-17"), 0..10, "json");
        write_lines(&dir.join("timing.log.2026-10-17"), 0..5, "timing");

        let bot = read_recent_lines_in(&dir, LogStream::Bot, 3).unwrap().unwrap();
        assert_eq!(bot.lines, vec!["bot 7", "bot 8", "bot 9"]);

        let timing = read_recent_lines_in(&dir, LogStream::Timing, 50).unwrap().unwrap();
        assert_eq!(timing.lines.len(), 5);
        assert!(timing.path.ends_with("timing.log.2026-10-17"));

        assert!(read_recent_lines_in(&dir, LogStream::Generations, 3)
            .unwrap()
            .is_none());
        assert!(read_recent_lines_in(&dir, LogStream::Bot, 0).unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stream_names_parse_with_aliases() {
        assert_eq!(LogStream::parse("Timing"), Some(LogStream::Timing));
        assert_eq!(LogStream::parse("gen"), Some(LogStream::Generations));
        assert_eq!(LogStream::parse("bot"), Some(LogStream::Bot));
        assert_eq!(LogStream::parse("42"), None);
        for stream in LogStream::ALL {
            assert_eq!(LogStream::parse(stream.name()), Some(stream));
        }
    }

    #[test]
    fn generation_events_stay_out_of_the_general_log() {
        let bot = LogStream::Bot.filter(LevelFilter::TRACE);
        assert!(!bot.would_enable(GENERATION_TARGET, &tracing::Level::INFO));
        assert!(!bot.would_enable(TIMING_TARGET, &tracing::Level::INFO));
        assert!(bot.would_enable("image_studio_bot::flow", &tracing::Level::DEBUG));

        let generations = LogStream::Generations.filter(LevelFilter::INFO);
        assert!(generations.would_enable(GENERATION_TARGET, &tracing::Level::INFO));
        assert!(!generations.would_enable("image_studio_bot::flow", &tracing::Level::ERROR));
    }

    #[test]
    fn unknown_log_level_defaults_to_info() {
        assert_eq!(parse_log_level("WARNING"), LevelFilter::WARN);
        assert_eq!(parse_log_level("verbose"), LevelFilter::INFO);
    }
}
