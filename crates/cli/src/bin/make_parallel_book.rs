#![forbid(unsafe_code)]

//! Translation driver: flatten a source book into tasks, run the retry
//! engine over the undone ones, and rebuild the parallel book once every
//! task has a persisted response.

use pb_cli::opts::{
    DriverOpts, init_logger, input_stem, install_sigint, parse_driver_args, read_json,
    sibling_path, write_pretty_json,
};
use pb_core::book::Role;
use pb_core::flatten::flatten_book;
use pb_core::rebuild::build_output;
use pb_core::tokens::count_tokens;
use pb_core::validate::validate_tasks;
use pb_core::width::preview;
use pb_engine::EngineConfig;
use pb_engine::batch::{
    custom_id_prefix, make_translation_batch_input, read_batch_output, write_jsonl,
};
use pb_engine::chat::{OpenAiClient, estimate_cost};
use pb_engine::context::{next_context, prev_context, scene_hint};
use pb_engine::retry::{
    TaskContext, execute_translation_task, simulate_code_task, simulate_macro_task,
};
use pb_storage::TaskStore;
use serde_json::Value;
use std::sync::atomic::Ordering;

const PROG_NAME: &str = "make-parallel-book";

fn usage() -> &'static str {
    "make-parallel-book — build an English/Japanese parallel book with an LLM\n\n\
USAGE:\n\
  make-parallel-book INPUT.json [--output PATH] [--state PATH]\n\
                     [--reset] [--num-tasks N] [--redo LIST] [--force-finish]\n\
                     [--failsoft] [--model NAME] [--no-fallback]\n\
                     [--extra-hint TEXT] [--make-batch-input]\n\
                     [--use-batch-output PATH|auto] [--debug]\n\n\
NOTES:\n\
  - every finished task is committed to the state DB; Ctrl-C and rerun\n\
    resume at the first undone task.\n\
  - --make-batch-input writes the JSONL request file for the batch API\n\
    and exits; --use-batch-output replaces first attempts with its rows.\n\
  - the OPENAI_API_KEY environment variable holds the credential.\n"
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match parse_driver_args(&args, usage()) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    init_logger(opts.debug);
    if let Err(e) = run(&opts) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(opts: &DriverOpts) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = &opts.input_file;
    let stem = input_stem(input_path);
    let output_path = opts.output.clone().unwrap_or_else(|| {
        if opts.make_batch_input {
            sibling_path(input_path, &format!("{stem}-batch-input.jsonl"))
        } else {
            sibling_path(input_path, &format!("{stem}-parallel.json"))
        }
    });
    let state_path = opts
        .state
        .clone()
        .unwrap_or_else(|| sibling_path(input_path, &format!("{stem}-state.db")));

    log::info!("Loading data from {}", input_path.display());
    let data = read_json(input_path)?;
    let (meta, input_tasks) = flatten_book(&data);

    if opts.make_batch_input {
        let prefix = custom_id_prefix(PROG_NAME, &stem);
        let lines = make_translation_batch_input(
            &input_tasks,
            meta.title.as_deref().unwrap_or(""),
            &opts.model,
            &opts.extra_hint,
            &prefix,
        );
        log::info!("Total tasks: {}", lines.len());
        let mut num_tokens = 0usize;
        let mut cost = 0.0;
        for line in &lines {
            if let Some(content) = line["body"]["messages"][0]["content"].as_str() {
                num_tokens += count_tokens(content);
                // the batch API bills input at half the online rate
                cost += estimate_cost(content, "", &opts.model)? / 2.0;
            }
        }
        log::info!("Total tokens: {num_tokens}");
        log::info!("Total input cost: ${cost:.4} (Y{:.2})", cost * 150.0);
        log::info!("Writing batch input data into {}", output_path.display());
        write_jsonl(&output_path, &lines)?;
        log::info!("Finished");
        return Ok(());
    }

    let batch_output = match &opts.use_batch_output {
        Some(value) => {
            let path = if value == "auto" {
                sibling_path(input_path, &format!("{stem}-batch-output.jsonl"))
            } else {
                std::path::PathBuf::from(value)
            };
            log::info!("Reading batch output data from {}", path.display());
            let replies = read_batch_output(&path)?;
            let mut input_tokens = 0i64;
            let mut output_tokens = 0i64;
            for reply in replies.values() {
                input_tokens += reply.usage["prompt_tokens"].as_i64().unwrap_or(0);
                output_tokens += reply.usage["completion_tokens"].as_i64().unwrap_or(0);
            }
            log::info!(
                "Batch info: tasks={}, input_tokens={input_tokens}, output_tokens={output_tokens}",
                replies.len()
            );
            Some(replies)
        }
        None => None,
    };

    let fresh = !state_path.exists();
    let mut store = TaskStore::open(&state_path)?;
    if opts.reset || fresh {
        store.initialize(&input_tasks)?;
    }
    let total_tasks = store.count()?;
    log::info!("Total tasks: {total_tasks}");
    let mut book_title = String::new();
    for index in 0..100 {
        let Some(record) = store.load(index)? else {
            break;
        };
        if record.role == Role::BookTitle {
            book_title = record.source_text;
            log::info!("Title: {book_title}");
            break;
        }
    }
    log::info!("GPT model: {}", opts.model);
    for redo_index in &opts.redo {
        let index = *redo_index;
        if index >= 0 && (index as usize) < input_tasks.len() {
            let task = &input_tasks[index as usize];
            store.reset_task(index, task.role, &task.source_text)?;
        } else {
            log::error!("Invalid task ID for redo: {index}");
        }
    }

    let interrupted = install_sigint();
    let api = OpenAiClient::new(std::env::var("OPENAI_API_KEY").unwrap_or_default());
    let cfg = EngineConfig {
        model: opts.model.clone(),
        failsoft: opts.failsoft,
        no_fallback: opts.no_fallback,
        extra_hint: opts.extra_hint.clone(),
    };
    let mut total_cost = 0.0;
    let mut done_tasks: i64 = 0;
    let max_done_tasks = opts.num_tasks.unwrap_or(total_tasks);
    while done_tasks < max_done_tasks && !interrupted.load(Ordering::Relaxed) {
        let index = store.find_undone()?;
        if index < 0 {
            break;
        }
        let Some(record) = store.load(index)? else {
            break;
        };
        log::info!(
            "Task {index}: {} - {}",
            record.role,
            preview(&record.source_text, 64)
        );
        let ctx = TaskContext {
            hint: scene_hint(&store, index),
            prev: prev_context(&store, index),
            next: next_context(&store, index),
        };
        let response = match record.role {
            Role::Macro => simulate_macro_task(&record.source_text),
            Role::Code => simulate_code_task(&record.source_text),
            role => execute_translation_task(
                &api,
                &cfg,
                &book_title,
                role,
                &record.source_text,
                &ctx,
                batch_output.as_ref().and_then(|replies| replies.get(&index)),
            )?,
        };
        store.set_response(index, &response)?;
        total_cost += response.cost;
        done_tasks += 1;
    }
    if interrupted.load(Ordering::Relaxed) {
        log::warn!("Stop by Ctrl-C");
    }
    log::info!(
        "Done: tasks={done_tasks}, total_cost=${total_cost:.4} (Y{:.2})",
        total_cost * 150.0
    );

    let index = store.find_undone()?;
    if index < 0 || opts.force_finish {
        let tasks = store.load_all()?;
        log::info!("Validating output");
        if !validate_tasks(&tasks) {
            return Err("Validation failed".into());
        }
        log::info!("Writing data into {}", output_path.display());
        let output: Value = build_output(&meta, &input_tasks, &tasks);
        write_pretty_json(&output_path, &output)?;
        log::info!("Finished");
    } else {
        log::info!("To be continued");
    }
    Ok(())
}
