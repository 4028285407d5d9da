//! Turns loosely structured model output into canonical, validated values.
//!
//! Every schema is a table of fields, each with an ordered list of accepted
//! key aliases. One generic resolver walks the table: the first alias present
//! wins, shape mismatches are coerced (single record to list, list of strings
//! to text, delimited text to list) and missing optional fields get their
//! default. Required fields that resolve to nothing fail with the field name.

use crate::core::error::NormalizationError;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    WorldBible,
    CharacterProfile,
    PlotOutline,
    ScenePlan,
}

impl Shape {
    fn root(self) -> &'static Root {
        match self {
            Shape::WorldBible => &WORLD_BIBLE_ROOT,
            Shape::CharacterProfile => &CHARACTER_PROFILE_ROOT,
            Shape::PlotOutline => &PLOT_OUTLINE_ROOT,
            Shape::ScenePlan => &SCENE_PLAN_ROOT,
        }
    }
}

enum FieldKind {
    Text,
    TextList,
    Records(&'static Schema),
}

struct Field {
    name: &'static str,
    aliases: &'static [&'static str],
    kind: FieldKind,
    /// Required text must be non-blank, required lists non-empty.
    required: bool,
}

impl Field {
    const fn text(name: &'static str, aliases: &'static [&'static str], required: bool) -> Self {
        Field {
            name,
            aliases,
            kind: FieldKind::Text,
            required,
        }
    }

    const fn list(name: &'static str, aliases: &'static [&'static str], required: bool) -> Self {
        Field {
            name,
            aliases,
            kind: FieldKind::TextList,
            required,
        }
    }

    const fn records(
        name: &'static str,
        aliases: &'static [&'static str],
        schema: &'static Schema,
        required: bool,
    ) -> Self {
        Field {
            name,
            aliases,
            kind: FieldKind::Records(schema),
            required,
        }
    }
}

struct Schema {
    fields: &'static [Field],
    /// Field that receives a bare string found where a record was expected.
    text_field: Option<&'static str>,
    /// Field set to the record's 1-based position inside its list.
    sequence_field: Option<&'static str>,
}

struct Root {
    /// Canonical name used when the root itself is missing or malformed.
    name: &'static str,
    schema: &'static Schema,
    list: bool,
    /// Keys a model wraps the payload in, e.g. `{"chapters": [...]}`.
    wrappers: &'static [&'static str],
}

static LOCATION: Schema = Schema {
    fields: &[
        Field::text("name", &["name", "location_name", "title", "place"], true),
        Field::text(
            "description",
            &["description", "desc", "details", "summary", "atmosphere"],
            false,
        ),
    ],
    text_field: Some("name"),
    sequence_field: None,
};

static WORLD_BIBLE: Schema = Schema {
    fields: &[
        Field::text(
            "tone",
            &["tone", "overall_tone", "world_tone", "atmosphere", "mood"],
            false,
        ),
        Field::list(
            "rules",
            &["rules", "core_rules", "world_rules", "laws", "rules_of_the_world"],
            true,
        ),
        Field::records(
            "locations",
            &["locations", "key_locations", "places", "settings"],
            &LOCATION,
            true,
        ),
        Field::text(
            "history",
            &["history", "history_snippet", "background", "lore"],
            false,
        ),
    ],
    text_field: None,
    sequence_field: None,
};

static CHARACTER_PROFILE: Schema = Schema {
    fields: &[
        Field::text("name", &["name", "full_name", "character_name"], true),
        Field::list(
            "traits",
            &[
                "traits",
                "personality_traits",
                "key_traits",
                "personality",
                "characteristics",
            ],
            true,
        ),
        Field::text(
            "backstory",
            &["backstory", "back_story", "background", "history", "origin"],
            false,
        ),
        Field::text(
            "status",
            &["status", "current_status", "arc_state", "current_state", "state"],
            false,
        ),
        Field::text(
            "description",
            &["description", "appearance", "physical_description"],
            false,
        ),
        Field::text(
            "motivation",
            &["motivation", "core_motivation", "goal", "desire"],
            false,
        ),
        Field::list("fears", &["fears", "weaknesses", "flaws"], false),
    ],
    text_field: None,
    sequence_field: None,
};

static CHAPTER: Schema = Schema {
    fields: &[
        Field::text("title", &["title", "chapter_title", "name", "heading"], false),
        Field::text(
            "summary",
            &[
                "summary",
                "description",
                "chapter_summary",
                "synopsis",
                "plot_points",
                "events",
            ],
            true,
        ),
    ],
    text_field: Some("summary"),
    sequence_field: Some("number"),
};

static SCENE: Schema = Schema {
    fields: &[
        Field::text(
            "goal",
            &[
                "goal",
                "scene_goal",
                "scene_summary",
                "summary",
                "description",
                "objective",
                "plot_points",
                "title",
                "scene_title",
                "setting",
                "scene_setting",
            ],
            true,
        ),
        Field::text("title", &["title", "scene_title", "name"], false),
        Field::list(
            "characters",
            &[
                "characters",
                "characters_present",
                "present_characters",
                "cast",
                "character",
            ],
            false,
        ),
        Field::text(
            "setting",
            &["setting", "location", "scene_setting", "place"],
            false,
        ),
    ],
    text_field: Some("goal"),
    sequence_field: Some("index"),
};

static WORLD_BIBLE_ROOT: Root = Root {
    name: "world_bible",
    schema: &WORLD_BIBLE,
    list: false,
    wrappers: &["world_bible", "world", "world_details", "bible"],
};

static CHARACTER_PROFILE_ROOT: Root = Root {
    name: "character_profile",
    schema: &CHARACTER_PROFILE,
    list: false,
    wrappers: &["character_profile", "character", "profile", "protagonist"],
};

static PLOT_OUTLINE_ROOT: Root = Root {
    name: "chapters",
    schema: &CHAPTER,
    list: true,
    wrappers: &["chapters", "plot_outline", "outline", "chapter_outline"],
};

static SCENE_PLAN_ROOT: Root = Root {
    name: "scenes",
    schema: &SCENE,
    list: true,
    wrappers: &["scenes", "scene_plan", "scene_outline", "chapter_scenes"],
};

/// Normalizes `raw` into the canonical JSON value for `shape`.
///
/// List-rooted shapes return an array whose records carry their 1-based
/// position in the sequence field (`number` for chapters, `index` for scenes).
pub fn normalize(raw: &str, shape: Shape) -> Result<Value, NormalizationError> {
    let root = shape.root();
    let parsed = parse_structured(raw, !root.list)?;
    let payload = unwrap_root(parsed, root);

    if root.list {
        let items = match payload {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        if items.is_empty() {
            return Err(NormalizationError::missing(root.name, raw));
        }
        resolve_records(&items, root.name, root.schema, raw).map(Value::Array)
    } else {
        let object = match payload {
            Value::Object(map) => Some(map),
            Value::Array(items) if items.len() == 1 => match items.into_iter().next() {
                Some(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
        .ok_or_else(|| NormalizationError::invalid(root.name, "an object", raw))?;
        resolve_record(&object, root.schema, None).map(Value::Object)
    }
}

/// Normalizes and deserializes into the matching entity type.
pub fn normalize_into<T: DeserializeOwned>(raw: &str, shape: Shape) -> Result<T, NormalizationError> {
    let value = normalize(raw, shape)?;
    serde_json::from_value(value).map_err(|e| {
        NormalizationError::invalid(shape.root().name, "the canonical shape", &e.to_string())
    })
}

// --- Parsing ---

fn parse_structured(raw: &str, allow_labels: bool) -> Result<Value, NormalizationError> {
    let text = strip_code_blocks(raw);
    if text.is_empty() {
        return Err(NormalizationError::unparseable(raw));
    }

    if let Some(value) = parse_json(&text) {
        return Ok(value);
    }
    if let Some(slice) = largest_bracketed(&text) {
        debug!("Retrying parse on bracketed substring ({} bytes)", slice.len());
        if let Some(value) = parse_json(slice) {
            return Ok(value);
        }
    }
    if allow_labels {
        if let Some(value) = parse_labeled(&text) {
            debug!("Parsed model output as labeled text");
            return Ok(value);
        }
    }
    Err(NormalizationError::unparseable(raw))
}

/// Only objects and arrays count as structured data.
fn parse_json(text: &str) -> Option<Value> {
    let structured = |v: Value| if v.is_object() || v.is_array() { Some(v) } else { None };
    match serde_json::from_str::<Value>(text) {
        Ok(v) => structured(v),
        Err(_) => serde_json::from_str::<Value>(&strip_trailing_commas(text))
            .ok()
            .and_then(structured),
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    match s.find("```") {
        Some(start) => {
            let after = &s[start + 3..];
            let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
            let body = &after[body_start..];
            let end = body.find("```").unwrap_or(body.len());
            body[..end].trim().to_string()
        }
        None => s.to_string(),
    }
}

/// The longer of the outermost `{...}` and `[...]` spans.
fn largest_bracketed(text: &str) -> Option<&str> {
    let span = |open: char, close: char| -> Option<(usize, usize)> {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        (end > start).then_some((start, end))
    };
    let best = match (span('{', '}'), span('[', ']')) {
        (Some(o), Some(a)) => {
            if a.1 - a.0 > o.1 - o.0 {
                a
            } else {
                o
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    Some(&text[best.0..=best.1])
}

fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Reads `Label: value` lines into an object. Unlabeled lines continue the
/// previous value on a new line, so bulleted items stay separate.
fn parse_labeled(text: &str) -> Option<Value> {
    let mut map = Map::new();
    let mut last: Option<String> = None;

    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', '#', '•', ' ']);
        if line.is_empty() {
            continue;
        }
        let labeled = line.split_once(':').and_then(|(label, value)| {
            let key = canonical_key(label);
            let plausible = !key.is_empty() && label.split_whitespace().count() <= 4;
            plausible.then(|| (key, clean_label_value(value)))
        });
        match labeled {
            Some((key, value)) => {
                if !map.contains_key(&key) {
                    map.insert(key.clone(), Value::String(value));
                }
                last = Some(key);
            }
            None => {
                if let Some(Value::String(prev)) = last.as_ref().and_then(|k| map.get_mut(k)) {
                    if !prev.is_empty() {
                        prev.push('\n');
                    }
                    prev.push_str(&clean_label_value(line));
                }
            }
        }
    }

    (!map.is_empty()).then_some(Value::Object(map))
}

fn clean_label_value(value: &str) -> String {
    value
        .trim()
        .trim_start_matches(['*', ' '])
        .trim_matches(|c: char| c == '"' || c == ',')
        .trim()
        .to_string()
}

// --- Resolution ---

/// Folds case, camelCase, spaces, hyphens and markdown into snake_case.
fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut prev_lower = false;
    for ch in key.trim().chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else if ch.is_alphanumeric() {
            out.push(ch);
            prev_lower = true;
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

fn index_keys(object: &Map<String, Value>) -> HashMap<String, &Value> {
    let mut keys = HashMap::new();
    for (key, value) in object {
        if value.is_null() {
            continue;
        }
        keys.entry(canonical_key(key)).or_insert(value);
    }
    keys
}

fn unwrap_root(value: Value, root: &Root) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let wrapped = {
        let keys = index_keys(&map);
        root.wrappers
            .iter()
            .find_map(|w| keys.get(*w).copied())
            .filter(|inner| if root.list { true } else { inner.is_object() })
            .cloned()
    };
    match wrapped {
        Some(inner) => inner,
        None => Value::Object(map),
    }
}

fn resolve_record(
    object: &Map<String, Value>,
    schema: &Schema,
    position: Option<usize>,
) -> Result<Map<String, Value>, NormalizationError> {
    let keys = index_keys(object);
    let fragment = || Value::Object(object.clone()).to_string();
    let mut out = Map::new();

    for field in schema.fields {
        let found = field.aliases.iter().find_map(|alias| keys.get(*alias).copied());
        let value = match found {
            Some(value) => coerce(value, field, &fragment)?,
            None => default_for(field),
        };
        if field.required && is_blank(&value) {
            return Err(NormalizationError::missing(field.name, &fragment()));
        }
        out.insert(field.name.to_string(), value);
    }

    if let (Some(seq), Some(pos)) = (schema.sequence_field, position) {
        out.insert(seq.to_string(), Value::from(pos as u64 + 1));
    }
    Ok(out)
}

fn resolve_records(
    items: &[Value],
    field: &str,
    schema: &Schema,
    raw: &str,
) -> Result<Vec<Value>, NormalizationError> {
    items
        .iter()
        .enumerate()
        .map(|(pos, item)| match item {
            Value::Object(map) => resolve_record(map, schema, Some(pos)).map(Value::Object),
            Value::String(s) if schema.text_field.is_some() => {
                let mut map = Map::new();
                if let Some(text_field) = schema.text_field {
                    map.insert(text_field.to_string(), Value::String(s.clone()));
                }
                resolve_record(&map, schema, Some(pos)).map(Value::Object)
            }
            other => Err(NormalizationError::invalid(
                field,
                "a list of records",
                &format!("{} in {}", other, clip_raw(raw)),
            )),
        })
        .collect()
}

fn clip_raw(raw: &str) -> &str {
    match raw.char_indices().nth(120) {
        Some((i, _)) => &raw[..i],
        None => raw,
    }
}

fn coerce(
    value: &Value,
    field: &Field,
    fragment: &dyn Fn() -> String,
) -> Result<Value, NormalizationError> {
    match &field.kind {
        FieldKind::Text => as_text(value)
            .map(Value::String)
            .ok_or_else(|| NormalizationError::invalid(field.name, "text", &fragment())),
        FieldKind::TextList => as_text_list(value)
            .map(|items| Value::Array(items.into_iter().map(Value::String).collect()))
            .ok_or_else(|| NormalizationError::invalid(field.name, "a list of text", &fragment())),
        FieldKind::Records(schema) => {
            let items = match value {
                Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            resolve_records(&items, field.name, schema, &fragment()).map(Value::Array)
        }
    }
}

fn default_for(field: &Field) -> Value {
    match field.kind {
        FieldKind::Text => Value::String(String::new()),
        FieldKind::TextList | FieldKind::Records(_) => Value::Array(Vec::new()),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => {
            let parts: Option<Vec<String>> = items.iter().map(scalar_text).collect();
            Some(
                parts?
                    .into_iter()
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
        Value::String(s) => Some(fold_lines(s)),
        other => scalar_text(other),
    }
}

fn fold_lines(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn as_text_list(value: &Value) -> Option<Vec<String>> {
    let items = match value {
        Value::Array(items) => items.iter().map(list_item_text).collect::<Option<Vec<_>>>()?,
        Value::String(s) => split_list(s),
        Value::Object(_) => vec![list_item_text(value)?],
        other => vec![scalar_text(other)?],
    };
    Some(items.into_iter().filter(|s| !s.is_empty()).collect())
}

/// A record inside a text list becomes its string values joined by ": ".
fn list_item_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            let parts: Vec<String> = map.values().filter_map(scalar_text).filter(|s| !s.is_empty()).collect();
            (!parts.is_empty()).then(|| parts.join(": "))
        }
        other => scalar_text(other),
    }
}

fn split_list(s: &str) -> Vec<String> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("none") || s.eq_ignore_ascii_case("n/a") {
        return Vec::new();
    }
    let lines: Vec<&str> = s.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let parts: Vec<&str> = if lines.len() > 1 {
        lines
    } else if s.contains(';') {
        s.split(';').collect()
    } else if s.contains(',') {
        s.split(',').collect()
    } else {
        vec![s]
    };
    parts
        .into_iter()
        .map(|p| {
            p.trim()
                .trim_start_matches(['-', '*', '•'])
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
                .trim()
                .to_string()
        })
        .filter(|p| !p.is_empty())
        .collect()
}
