#![forbid(unsafe_code)]

//! The shared driver option surface. Both binaries take the same flags;
//! only the default file names differ.

use log::LevelFilter;
use serde_json::Value;
use simple_logger::SimpleLogger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(Clone, Debug)]
pub struct DriverOpts {
    pub input_file: PathBuf,
    pub output: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub reset: bool,
    pub num_tasks: Option<i64>,
    /// Unique indices, descending.
    pub redo: Vec<i64>,
    pub force_finish: bool,
    pub failsoft: bool,
    pub model: String,
    pub no_fallback: bool,
    pub extra_hint: String,
    pub make_batch_input: bool,
    pub use_batch_output: Option<String>,
    pub debug: bool,
}

fn parse_redo_list(value: &str) -> Result<Vec<i64>, String> {
    let mut indexes = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let index: i64 = part
            .parse()
            .map_err(|_| format!("Invalid format for redo: {value}"))?;
        if !indexes.contains(&index) {
            indexes.push(index);
        }
    }
    indexes.sort_unstable();
    indexes.reverse();
    Ok(indexes)
}

/// Positional input file plus `--flag [VALUE]` pairs; unknown flags fail
/// with the usage text attached.
pub fn parse_driver_args(args: &[String], usage: &str) -> Result<DriverOpts, String> {
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{usage}");
        std::process::exit(0);
    }
    let mut input_file: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut state: Option<PathBuf> = None;
    let mut reset = false;
    let mut num_tasks: Option<i64> = None;
    let mut redo: Vec<i64> = Vec::new();
    let mut force_finish = false;
    let mut failsoft = false;
    let mut model = pb_engine::chat::default_model().to_string();
    let mut no_fallback = false;
    let mut extra_hint = String::new();
    let mut make_batch_input = false;
    let mut use_batch_output: Option<String> = None;
    let mut debug = false;

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--output" => {
                i += 1;
                let v = args.get(i).ok_or("--output requires PATH")?;
                output = Some(PathBuf::from(v));
            }
            "--state" => {
                i += 1;
                let v = args.get(i).ok_or("--state requires PATH")?;
                state = Some(PathBuf::from(v));
            }
            "--reset" => reset = true,
            "--num-tasks" => {
                i += 1;
                let v = args.get(i).ok_or("--num-tasks requires N")?;
                num_tasks = Some(
                    v.parse::<i64>()
                        .map_err(|_| "--num-tasks must be an integer")?,
                );
            }
            "--redo" => {
                i += 1;
                let v = args.get(i).ok_or("--redo requires LIST")?;
                redo = parse_redo_list(v)?;
            }
            "--force-finish" => force_finish = true,
            "--failsoft" => failsoft = true,
            "--model" => {
                i += 1;
                let v = args.get(i).ok_or("--model requires NAME")?;
                model = v.to_string();
            }
            "--no-fallback" => no_fallback = true,
            "--extra-hint" => {
                i += 1;
                let v = args.get(i).ok_or("--extra-hint requires TEXT")?;
                extra_hint = v.to_string();
            }
            "--make-batch-input" => make_batch_input = true,
            "--use-batch-output" => {
                i += 1;
                let v = args.get(i).ok_or("--use-batch-output requires PATH|auto")?;
                use_batch_output = Some(v.to_string());
            }
            "--debug" => debug = true,
            other => {
                if other.starts_with('-') {
                    return Err(format!("Unknown arg: {other}\n\n{usage}"));
                }
                if input_file.is_some() {
                    return Err(format!("Unexpected extra argument: {other}\n\n{usage}"));
                }
                input_file = Some(PathBuf::from(other));
            }
        }
        i += 1;
    }
    let input_file = input_file.ok_or_else(|| format!("Missing input file\n\n{usage}"))?;
    Ok(DriverOpts {
        input_file,
        output,
        state,
        reset,
        num_tasks,
        redo,
        force_finish,
        failsoft,
        model,
        no_fallback,
        extra_hint,
        make_batch_input,
        use_batch_output,
        debug,
    })
}

pub fn init_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = SimpleLogger::new().with_level(level).init();
}

/// SIGINT sets the flag; the driver loop breaks between tasks so every
/// persisted response stays intact.
pub fn install_sigint() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag));
    flag
}

pub fn sibling_path(input: &Path, file_name: &str) -> PathBuf {
    input.with_file_name(file_name)
}

pub fn input_stem(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_string())
}

pub fn read_json(path: &Path) -> Result<Value, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))
}

pub fn write_pretty_json(path: &Path, value: &Value) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| format!("cannot encode output: {e}"))?;
    std::fs::write(path, text + "\n").map_err(|e| format!("cannot write {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_full_flag_surface() {
        let opts = parse_driver_args(
            &args(&[
                "book.json",
                "--output",
                "out.json",
                "--state",
                "state.db",
                "--reset",
                "--num-tasks",
                "5",
                "--redo",
                "3, 1, 3",
                "--force-finish",
                "--failsoft",
                "--model",
                "gpt-4o",
                "--no-fallback",
                "--extra-hint",
                "hint text",
                "--use-batch-output",
                "auto",
                "--debug",
            ]),
            "usage",
        )
        .expect("opts");
        assert_eq!(opts.input_file, PathBuf::from("book.json"));
        assert_eq!(opts.output, Some(PathBuf::from("out.json")));
        assert!(opts.reset);
        assert_eq!(opts.num_tasks, Some(5));
        assert_eq!(opts.redo, vec![3, 1]);
        assert!(opts.force_finish);
        assert!(opts.failsoft);
        assert_eq!(opts.model, "gpt-4o");
        assert!(opts.no_fallback);
        assert_eq!(opts.extra_hint, "hint text");
        assert_eq!(opts.use_batch_output.as_deref(), Some("auto"));
        assert!(opts.debug);
    }

    #[test]
    fn defaults_are_quiet() {
        let opts = parse_driver_args(&args(&["book.json"]), "usage").expect("opts");
        assert!(!opts.reset);
        assert!(!opts.failsoft);
        assert_eq!(opts.model, pb_engine::chat::default_model());
        assert!(opts.redo.is_empty());
        assert!(opts.num_tasks.is_none());
    }

    #[test]
    fn rejects_malformed_redo_and_unknown_flags() {
        assert!(parse_driver_args(&args(&["book.json", "--redo", "1,x"]), "usage").is_err());
        assert!(parse_driver_args(&args(&["book.json", "--frobnicate"]), "usage").is_err());
        assert!(parse_driver_args(&args(&[]), "usage").is_err());
    }
}
