#![forbid(unsafe_code)]

//! Splice completed tasks back into a parallel book. The walk mirrors the
//! flattener: same ordering, same grouping, so a fully-completed task set
//! reproduces the input skeleton exactly.

use crate::book::{BookMeta, InputTask, ResponseContent, Role, TaskRecord, TaskResponse};
use crate::width::cut_by_width;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn pair_value(id: String, source: &str, target: &str, response: &TaskResponse) -> Value {
    let mut pair = Map::new();
    pair.insert("id".to_string(), json!(id));
    pair.insert("source".to_string(), json!(source));
    pair.insert("target".to_string(), json!(target));
    if response.error {
        pair.insert("error".to_string(), json!(true));
    }
    if response.intact {
        pair.insert("intact".to_string(), json!(true));
    }
    Value::Object(pair)
}

/// One output pair per response pair, ids `{index:05}-{seq:03}`.
fn text_records(index: i64, response: &TaskResponse) -> Vec<Value> {
    response
        .content
        .pairs()
        .iter()
        .enumerate()
        .map(|(seq, pair)| {
            pair_value(
                format!("{index:05}-{seq:03}"),
                &pair.source,
                &pair.target,
                response,
            )
        })
        .collect()
}

/// All response pairs collapsed into a single space-joined pair.
fn collapsed_record(index: i64, response: &TaskResponse) -> Value {
    let pairs = response.content.pairs();
    let source = pairs
        .iter()
        .map(|p| p.source.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let target = pairs
        .iter()
        .map(|p| p.target.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    pair_value(format!("{index:05}-000"), &source, &target, response)
}

fn macro_record(index: i64, response: &TaskResponse) -> Value {
    let mut record = Map::new();
    record.insert("id".to_string(), json!(format!("{index:05}-000")));
    if let ResponseContent::Record(content) = &response.content {
        record.insert("name".to_string(), json!(content.name));
        if let Some(value) = &content.value {
            record.insert("value".to_string(), json!(value));
        }
    }
    Value::Object(record)
}

fn code_record(index: i64, response: &TaskResponse) -> Value {
    let mut record = Map::new();
    record.insert("id".to_string(), json!(format!("{index:05}-000")));
    let value = match &response.content {
        ResponseContent::Record(content) => {
            content.value.clone().map(Value::String).unwrap_or(Value::Null)
        }
        ResponseContent::Pairs(_) => Value::Null,
    };
    record.insert("code".to_string(), value);
    Value::Object(record)
}

fn row_cells(text: &str) -> Vec<String> {
    let mut text = text.trim();
    text = text.strip_prefix('|').unwrap_or(text).trim();
    text = text.strip_suffix('|').unwrap_or(text);
    text.split('|').map(str::to_string).collect()
}

/// Split a collapsed row pair into padded `{id, source, target}` cells.
fn table_cells(index: i64, item: &Value) -> Vec<Value> {
    let mut src_cells = row_cells(item.get("source").and_then(Value::as_str).unwrap_or(""));
    let mut trg_cells = row_cells(item.get("target").and_then(Value::as_str).unwrap_or(""));
    let max_len = src_cells.len().max(trg_cells.len());
    src_cells.resize(max_len, String::new());
    trg_cells.resize(max_len, String::new());
    src_cells
        .iter()
        .zip(&trg_cells)
        .enumerate()
        .map(|(i, (source, target))| {
            json!({
                "id": format!("{index:05}-{i:03}"),
                "source": source,
                "target": target,
            })
        })
        .collect()
}

/// Rebuild the parallel book from completed tasks. Stops at the first
/// task without a response; the driver decides whether that partial
/// output is acceptable.
pub fn build_output(meta: &BookMeta, input_tasks: &[InputTask], tasks: &[TaskRecord]) -> Value {
    let mut book = Map::new();
    if let Some(id) = &meta.id {
        book.insert("id".to_string(), json!(id));
    }
    book.insert("format".to_string(), json!("parallel"));
    book.insert("source_language".to_string(), json!("en"));
    book.insert("target_language".to_string(), json!("ja"));

    let mut live: Vec<&TaskRecord> = Vec::new();
    let mut index_line_map: HashMap<i64, String> = HashMap::new();
    let mut index_concat_set: HashSet<i64> = HashSet::new();
    for task in tasks {
        if task.response.is_none() {
            log::warn!("Stop by an unprocessed task: {}", task.index);
            break;
        }
        let index = task.index;
        if index >= 0 && (index as usize) < input_tasks.len() {
            let input = &input_tasks[index as usize];
            if task.role != input.role {
                log::warn!("mismatch input role: {index}: {}", task.role);
            }
            if task.source_text != input.source_text {
                let short = cut_by_width(&task.source_text, 64);
                log::warn!("mismatch input text: {index}: {short}");
            }
            if let Some(raw_line) = &input.attrs.raw_line {
                index_line_map.insert(index, raw_line.clone());
            }
            if input.attrs.concat {
                index_concat_set.insert(index);
            }
        } else {
            log::warn!("no matching input: {index}");
        }
        live.push(task);
    }

    let mut total_cost = 0.0;
    let mut chapters: Vec<Value> = Vec::new();
    let mut done = vec![false; live.len()];
    for seq in 0..live.len() {
        if done[seq] {
            continue;
        }
        done[seq] = true;
        let task = live[seq];
        let Some(response) = &task.response else {
            continue;
        };
        total_cost += response.cost;
        match task.role {
            Role::BookTitle => {
                if !book.contains_key("title") {
                    book.insert("title".to_string(), collapsed_record(task.index, response));
                }
            }
            Role::BookAuthor => {
                if !book.contains_key("author") {
                    book.insert("author".to_string(), collapsed_record(task.index, response));
                }
            }
            Role::ChapterTitle => {
                chapters.push(json!({
                    "title": collapsed_record(task.index, response),
                    "body": [],
                }));
            }
            role => {
                if chapters.is_empty() {
                    chapters.push(json!({"body": []}));
                }
                let Some(chapter) = chapters.last_mut() else {
                    continue;
                };
                let Some(body) = chapter.get_mut("body").and_then(Value::as_array_mut) else {
                    continue;
                };
                let raw_line = index_line_map.get(&task.index).cloned();
                let mut record = Map::new();
                match role {
                    Role::Paragraph | Role::Blockquote => {
                        record.insert(
                            role.as_str().to_string(),
                            Value::Array(text_records(task.index, response)),
                        );
                    }
                    Role::Header => {
                        record.insert(
                            role.as_str().to_string(),
                            collapsed_record(task.index, response),
                        );
                    }
                    Role::List | Role::Table => {
                        let mut items: Vec<Value> = Vec::new();
                        let mut next_seq = seq;
                        while next_seq < live.len() {
                            let next_task = live[next_seq];
                            if next_seq > seq
                                && (next_task.role != role
                                    || !index_concat_set.contains(&next_task.index))
                            {
                                break;
                            }
                            if let Some(next_response) = &next_task.response {
                                if next_seq > seq {
                                    total_cost += next_response.cost;
                                }
                                items.push(collapsed_record(next_task.index, next_response));
                            }
                            done[next_seq] = true;
                            next_seq += 1;
                        }
                        if role == Role::Table {
                            let rows: Vec<Value> = items
                                .iter()
                                .enumerate()
                                .map(|(i, item)| {
                                    Value::Array(table_cells(task.index + i as i64, item))
                                })
                                .filter(|row| !row.as_array().map(Vec::is_empty).unwrap_or(true))
                                .collect();
                            items = rows;
                        }
                        record.insert(role.as_str().to_string(), Value::Array(items));
                    }
                    Role::Macro => {
                        record.insert(role.as_str().to_string(), macro_record(task.index, response));
                    }
                    Role::Code => {
                        record.insert(role.as_str().to_string(), code_record(task.index, response));
                    }
                    _ => {
                        log::warn!("Unknown role: {}: {}", task.index, role);
                    }
                }
                if !record.is_empty() {
                    if let Some(line) = raw_line {
                        record.insert("raw_line".to_string(), json!(line));
                    }
                    body.push(Value::Object(record));
                }
            }
        }
    }
    if !chapters.is_empty() {
        for (chapter_index, chapter) in chapters.iter_mut().enumerate() {
            if let Some(Some(raw_line)) = meta.chapter_raw_lines.get(chapter_index)
                && let Some(obj) = chapter.as_object_mut()
            {
                obj.insert("raw_line".to_string(), json!(raw_line));
            }
        }
        book.insert("chapters".to_string(), Value::Array(chapters));
    }
    book.insert(
        "cost".to_string(),
        json!((total_cost * 1000.0).round() / 1000.0),
    );
    book.insert("timestamp".to_string(), json!(now_timestamp()));
    Value::Object(book)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{MacroRecord, TranslationPair};
    use crate::flatten::flatten_book;

    fn respond(role: Role, index: i64, source: &str, target: &str) -> TaskRecord {
        TaskRecord {
            index,
            role,
            source_text: source.to_string(),
            response: Some(TaskResponse {
                content: ResponseContent::Pairs(vec![TranslationPair::new(source, target)]),
                hint: Some("scene".to_string()),
                cost: 0.001,
                error: false,
                intact: false,
            }),
        }
    }

    #[test]
    fn rebuilds_table_rows_with_cells() {
        let data = json!({
            "chapters": [{
                "body": [
                    {"table": ["| Name | Score |", "| Alice | 10 |"]},
                ],
            }],
        });
        let (meta, input_tasks) = flatten_book(&data);
        let tasks = vec![
            respond(Role::Table, 0, "| Name | Score |", "| 名前 | 得点 |"),
            respond(Role::Table, 1, "| Alice | 10 |", "| アリス | 10 |"),
        ];
        let book = build_output(&meta, &input_tasks, &tasks);
        let table = &book["chapters"][0]["body"][0]["table"];
        assert_eq!(table.as_array().expect("rows").len(), 2);
        assert_eq!(table[0][0]["source"], "Name ");
        assert_eq!(table[0][0]["target"], "名前 ");
        assert_eq!(table[1][1]["source"], " 10 ");
        assert_eq!(table[1][0]["id"], "00001-000");
    }

    #[test]
    fn pads_uneven_table_cells() {
        let item = json!({"source": "| a | b | c |", "target": "| あ |"});
        let cells = table_cells(3, &item);
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[1]["target"], "");
        assert_eq!(cells[2]["id"], "00003-002");
    }

    #[test]
    fn splits_list_groups_on_missing_concat() {
        let data = json!({
            "chapters": [{
                "body": [
                    {"list": ["first entry", "second entry"]},
                    {"list": ["third entry"]},
                ],
            }],
        });
        let (meta, input_tasks) = flatten_book(&data);
        let tasks = vec![
            respond(Role::List, 0, "first entry", "一つ目"),
            respond(Role::List, 1, "second entry", "二つ目"),
            respond(Role::List, 2, "third entry", "三つ目"),
        ];
        let book = build_output(&meta, &input_tasks, &tasks);
        let body = book["chapters"][0]["body"].as_array().expect("body");
        assert_eq!(body.len(), 2);
        assert_eq!(body[0]["list"].as_array().expect("items").len(), 2);
        assert_eq!(body[1]["list"].as_array().expect("items").len(), 1);
    }

    #[test]
    fn collapses_titles_and_headers_to_single_pairs() {
        let data = json!({
            "title": "A Tale",
            "chapters": [{
                "title": "Chapter One",
                "body": [{"header": "Notes"}],
            }],
        });
        let (meta, input_tasks) = flatten_book(&data);
        let mut title = respond(Role::BookTitle, 0, "A Tale", "ある物語");
        title.response.as_mut().expect("response").content = ResponseContent::Pairs(vec![
            TranslationPair::new("A", "ある"),
            TranslationPair::new("Tale", "物語"),
        ]);
        let tasks = vec![
            title,
            respond(Role::ChapterTitle, 1, "Chapter One", "第一章"),
            respond(Role::Header, 2, "Notes", "注記"),
        ];
        let book = build_output(&meta, &input_tasks, &tasks);
        assert_eq!(book["title"]["source"], "A Tale");
        assert_eq!(book["title"]["target"], "ある 物語");
        assert_eq!(book["title"]["id"], "00000-000");
        assert_eq!(book["chapters"][0]["title"]["source"], "Chapter One");
        assert_eq!(book["chapters"][0]["body"][0]["header"]["source"], "Notes");
    }

    #[test]
    fn emits_macro_and_code_records() {
        let data = json!({
            "chapters": [{
                "body": [
                    {"macro": "image cover.png"},
                    {"code": "fn main() {}"},
                ],
            }],
        });
        let (meta, input_tasks) = flatten_book(&data);
        let tasks = vec![
            TaskRecord {
                index: 0,
                role: Role::Macro,
                source_text: "image cover.png".to_string(),
                response: Some(TaskResponse::record(MacroRecord {
                    name: "image".to_string(),
                    value: Some("cover.png".to_string()),
                })),
            },
            TaskRecord {
                index: 1,
                role: Role::Code,
                source_text: "fn main() {}".to_string(),
                response: Some(TaskResponse::record(MacroRecord {
                    name: "code".to_string(),
                    value: Some("fn main() {}".to_string()),
                })),
            },
        ];
        let book = build_output(&meta, &input_tasks, &tasks);
        let body = book["chapters"][0]["body"].as_array().expect("body");
        assert_eq!(body[0]["macro"]["name"], "image");
        assert_eq!(body[0]["macro"]["value"], "cover.png");
        assert_eq!(body[1]["code"]["code"], "fn main() {}");
    }

    #[test]
    fn stops_at_first_unprocessed_task() {
        let data = json!({
            "chapters": [{
                "body": [
                    {"paragraph": "First."},
                    {"paragraph": "Second."},
                    {"paragraph": "Third."},
                ],
            }],
        });
        let (meta, input_tasks) = flatten_book(&data);
        let tasks = vec![
            respond(Role::Paragraph, 0, "First.", "一。"),
            TaskRecord {
                index: 1,
                role: Role::Paragraph,
                source_text: "Second.".to_string(),
                response: None,
            },
            respond(Role::Paragraph, 2, "Third.", "三。"),
        ];
        let book = build_output(&meta, &input_tasks, &tasks);
        let body = book["chapters"][0]["body"].as_array().expect("body");
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn propagates_error_and_intact_markers() {
        let data = json!({
            "chapters": [{"body": [{"paragraph": "・・・"}]}],
        });
        let (meta, input_tasks) = flatten_book(&data);
        let tasks = vec![TaskRecord {
            index: 0,
            role: Role::Paragraph,
            source_text: "・・・".to_string(),
            response: Some(TaskResponse {
                content: ResponseContent::Pairs(vec![TranslationPair::new("・・・", "・・・")]),
                hint: None,
                cost: 0.0,
                error: false,
                intact: true,
            }),
        }];
        let book = build_output(&meta, &input_tasks, &tasks);
        let pair = &book["chapters"][0]["body"][0]["paragraph"][0];
        assert_eq!(pair["intact"], true);
        assert!(pair.get("error").is_none());
        assert_eq!(book["cost"], 0.0);
    }

    #[test]
    fn round_trips_structure_and_raw_lines() {
        let data = json!({
            "id": "tale-001",
            "title": "A Tale",
            "chapters": [
                {
                    "title": "Chapter One",
                    "raw_line": "# Chapter One",
                    "body": [
                        {"paragraph": "He loved linguistics. It gave him wisdom.", "raw_line": "p1"},
                        {"list": ["first entry", "second entry"]},
                    ],
                },
                {"title": "Chapter Two", "body": [{"paragraph": "The end came."}]},
            ],
        });
        let (meta, input_tasks) = flatten_book(&data);
        let tasks: Vec<TaskRecord> = input_tasks
            .iter()
            .enumerate()
            .map(|(i, t)| respond(t.role, i as i64, &t.source_text, "訳"))
            .collect();
        let book = build_output(&meta, &input_tasks, &tasks);
        assert_eq!(book["id"], "tale-001");
        assert_eq!(book["format"], "parallel");
        assert_eq!(book["source_language"], "en");
        assert_eq!(book["target_language"], "ja");
        let chapters = book["chapters"].as_array().expect("chapters");
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0]["raw_line"], "# Chapter One");
        let body = chapters[0]["body"].as_array().expect("body");
        assert_eq!(body.len(), 2);
        assert_eq!(body[0]["raw_line"], "p1");
        assert_eq!(body[0]["paragraph"][0]["id"], "00002-000");
        assert_eq!(chapters[1]["body"][0]["paragraph"][0]["source"], "The end came.");
        assert!(book["cost"].as_f64().expect("cost") > 0.0);
    }
}
