#![forbid(unsafe_code)]

//! Analysis driver: batch the parallel book's pairs into token-bounded
//! requests, run the analysis ladder over the undone ones, then annotate
//! every pair with its sentence trees.

use pb_cli::opts::{
    DriverOpts, init_logger, input_stem, install_sigint, parse_driver_args, read_json,
    sibling_path, write_pretty_json,
};
use pb_core::analysis::{annotate_book, collect_pairs, postprocess_tasks};
use pb_core::tokens::count_tokens;
use pb_core::validate::validate_analysis_tasks;
use pb_core::width::preview;
use pb_engine::EngineConfig;
use pb_engine::analyze::{execute_analysis_task, make_analysis_batches};
use pb_engine::batch::{
    custom_id_prefix, make_analysis_batch_input, read_batch_output, write_jsonl,
};
use pb_engine::chat::{OpenAiClient, estimate_cost};
use pb_storage::AnalysisStore;
use std::sync::atomic::Ordering;

const PROG_NAME: &str = "analyze-parallel-corpus";

fn usage() -> &'static str {
    "analyze-parallel-corpus — add syntactic analyses to a parallel book\n\n\
USAGE:\n\
  analyze-parallel-corpus INPUT-parallel.json [--output PATH] [--state PATH]\n\
                          [--reset] [--num-tasks N] [--redo LIST]\n\
                          [--force-finish] [--failsoft] [--model NAME]\n\
                          [--no-fallback] [--extra-hint TEXT]\n\
                          [--make-batch-input] [--use-batch-output PATH|auto]\n\
                          [--debug]\n\n\
NOTES:\n\
  - the input must be a parallel book (format: \"parallel\").\n\
  - every finished request is committed to the state DB; Ctrl-C and\n\
    rerun resume at the first undone request.\n\
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
    let stem = input_stem(input_path)
        .replace("-parallel", "")
        .replace("-analyzed", "");
    let output_path = opts.output.clone().unwrap_or_else(|| {
        if opts.make_batch_input {
            sibling_path(input_path, &format!("{stem}-batch-input-analyze.jsonl"))
        } else {
            sibling_path(input_path, &format!("{stem}-analyzed.json"))
        }
    });
    let state_path = opts
        .state
        .clone()
        .unwrap_or_else(|| sibling_path(input_path, &format!("{stem}-state-analyze.db")));

    log::info!("Loading data from {}", input_path.display());
    let mut data = read_json(input_path)?;
    let pairs = collect_pairs(&mut data)?;
    let requests = make_analysis_batches(&pairs);

    if opts.make_batch_input {
        let prefix = custom_id_prefix(PROG_NAME, &stem);
        let lines = make_analysis_batch_input(&requests, &opts.model, &opts.extra_hint, &prefix);
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
                sibling_path(input_path, &format!("{stem}-batch-output-analyze.jsonl"))
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
    let mut store = AnalysisStore::open(&state_path)?;
    if opts.reset || fresh {
        store.initialize(&requests)?;
    }
    let total_tasks = store.count()?;
    log::info!("Total tasks: {total_tasks}");
    log::info!("GPT model: {}", opts.model);
    for redo_index in &opts.redo {
        let index = *redo_index;
        if index >= 0 && (index as usize) < requests.len() {
            store.reset_task(index, &requests[index as usize])?;
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
        let joint = record
            .request
            .iter()
            .map(|pair| pair.source.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("Task {index}: {}", preview(&joint, 80));
        let response = execute_analysis_task(
            &api,
            &cfg,
            &record.request,
            batch_output.as_ref().and_then(|replies| replies.get(&index)),
        )?;
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
        let mut tasks = store.load_all()?;
        log::info!("Postprocessing the output");
        postprocess_tasks(&mut tasks);
        log::info!("Validating the output");
        if !validate_analysis_tasks(&tasks) {
            return Err("Validation failed".into());
        }
        log::info!("Writing data into {}", output_path.display());
        annotate_book(&mut data, &tasks);
        write_pretty_json(&output_path, &data)?;
        log::info!("Finished");
    } else {
        log::info!("To be continued");
    }
    Ok(())
}
