//! Record-stream scene segmentation.
//!
//! Each non-blank line of the payload is one JSON record discriminated by
//! `panel_type`. Records are grouped into scenes; a new scene opens when a
//! camera shot's text matches the boundary regex, or when a subtitle's
//! `seconds_in` runs more than the gap threshold past the previous subtitle
//! of the current scene. Per-scene counters restart with every scene.

use serde_json::{Map, Value};
use tracing::debug;

use super::rules::CompiledRecordRules;
use super::OrdinalCounters;
use crate::models::{JsonMap, Unit};
use crate::path::normalize_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChildKind {
    Shot,
    Action,
    Subtitle,
}

/// Cursor carried from one record to the next.
#[derive(Debug, Default)]
pub struct SegmenterState {
    /// 1-based index of the open scene; 0 before the first scene.
    pub scene_index: i64,
    counters: OrdinalCounters<ChildKind>,
    pub last_subtitle_seconds: Option<f64>,
}

impl SegmenterState {
    fn open_scene(&mut self) {
        self.scene_index += 1;
        self.counters.reset();
        self.last_subtitle_seconds = None;
    }
}

/// Result of segmenting one record stream.
#[derive(Debug)]
pub struct Segmentation {
    pub units: Vec<Unit>,
    pub scene_count: usize,
    pub skipped_lines: usize,
}

/// Split a record stream into scene units and their children.
pub fn segment_records(
    payload: &str,
    rules: &CompiledRecordRules,
    domain: &str,
    doc_key: &str,
) -> Segmentation {
    let mut state = SegmenterState::default();
    let mut units = Vec::new();
    let mut skipped_lines = 0;
    let mut scene_path = String::new();

    for (line_no, line) in payload.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) | Err(_) => {
                debug!(line = line_no + 1, "Skipping malformed record");
                skipped_lines += 1;
                continue;
            }
        };

        let panel_type = record.get("panel_type").and_then(Value::as_str);
        let mut boundary = false;
        let mut subtitle_seconds = None;

        match panel_type {
            Some("camera_shot") => {
                let text = record.get("text").and_then(Value::as_str).unwrap_or("").trim();
                if rules.boundary.as_ref().is_some_and(|re| re.is_match(text)) {
                    boundary = true;
                }
            }
            Some("subtitle") => {
                subtitle_seconds = record.get("seconds_in").and_then(coerce_seconds);
                if let (Some(prev), Some(secs)) = (state.last_subtitle_seconds, subtitle_seconds) {
                    if secs - prev > rules.scene_gap_seconds {
                        boundary = true;
                    }
                }
            }
            _ => {}
        }

        if state.scene_index == 0 {
            scene_path = push_scene(&mut state, &mut units, rules, domain, doc_key, "bootstrap");
        }
        if boundary {
            scene_path = push_scene(&mut state, &mut units, rules, domain, doc_key, "boundary");
        }
        if subtitle_seconds.is_some() {
            state.last_subtitle_seconds = subtitle_seconds;
        }

        let child = match panel_type {
            Some("camera_shot") => {
                let n = state.counters.next(ChildKind::Shot);
                let label = field_text(&record, "shot_id").unwrap_or_else(|| format!("shot_{:03}", n));
                Some(("shot", label, n, pick(&record, &["page", "shot_id", "text"])))
            }
            Some("scene_unit") => {
                let n = state.counters.next(ChildKind::Action);
                Some((
                    "action",
                    format!("act_{:04}", n),
                    n,
                    pick(&record, &["page", "matched", "camera_shot", "seconds_in"]),
                ))
            }
            Some("subtitle") => {
                let n = state.counters.next(ChildKind::Subtitle);
                Some((
                    "subtitle",
                    format!("sub_{:04}", n),
                    n,
                    pick(&record, &["time", "seconds_in", "camera_shot", "subtitle_anchor"]),
                ))
            }
            // Explicit scene rows, meta rows, and unknown types carry no unit.
            _ => None,
        };

        if let Some((kind, label, ordinal, meta)) = child {
            units.push(Unit {
                domain: domain.to_string(),
                doc_key: doc_key.to_string(),
                kind: kind.to_string(),
                path: normalize_path(&format!("{}.{}", scene_path, label)),
                label: Some(label),
                ordinal,
                text: record.get("text").and_then(Value::as_str).map(str::to_string),
                meta,
                parent_path: Some(scene_path.clone()),
            });
        }
    }

    Segmentation {
        units,
        scene_count: state.scene_index as usize,
        skipped_lines,
    }
}

/// Start a new scene, push its unit, and return its path.
fn push_scene(
    state: &mut SegmenterState,
    units: &mut Vec<Unit>,
    rules: &CompiledRecordRules,
    domain: &str,
    doc_key: &str,
    seed: &str,
) -> String {
    state.open_scene();
    let path = format!("{}.S{:03}", rules.path_prefix, state.scene_index);
    let mut meta = JsonMap::new();
    meta.insert(seed.to_string(), Value::Bool(true));
    units.push(Unit {
        domain: domain.to_string(),
        doc_key: doc_key.to_string(),
        kind: "scene".to_string(),
        label: Some(format!("S{:03}", state.scene_index)),
        path: path.clone(),
        ordinal: state.scene_index,
        text: None,
        meta,
        parent_path: None,
    });
    path
}

/// `seconds_in` may arrive as a number or a numeric string.
fn coerce_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_text(record: &Map<String, Value>, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pick(record: &Map<String, Value>, keys: &[&str]) -> JsonMap {
    keys.iter()
        .map(|k| (k.to_string(), record.get(*k).cloned().unwrap_or(Value::Null)))
        .collect()
}
