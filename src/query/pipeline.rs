//! Pipeline representation and the document value model

use super::QueryError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as Json;
use std::cmp::Ordering;

// ============================================================================
// Values
// ============================================================================

/// A document value as seen by the aggregation engine
#[derive(Debug, Clone, PartialEq)]
pub enum Bson {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    DateTime(NaiveDateTime),
    ObjectId(String),
    Array(Vec<Bson>),
    Document(Document),
}

/// Ordered key/value document; insertion order is preserved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set `key`, keeping its position if it already exists
    pub fn insert(&mut self, key: impl Into<String>, value: Bson) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bson)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The single `(key, value)` pair of a one-key document
    pub fn single(&self) -> Option<(&str, &Bson)> {
        match self.entries.as_slice() {
            [(k, v)] => Some((k.as_str(), v)),
            _ => None,
        }
    }

    /// Resolve a dotted path. Arrays along the way fan out into an array of
    /// the matches, the way the query language treats embedded arrays.
    pub fn get_path(&self, path: &str) -> Option<Bson> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let rest: Vec<&str> = parts.collect();
        resolve_path(self.get(first)?, &rest)
    }

    /// Set a dotted path, creating intermediate documents
    pub fn set_path(&mut self, path: &str, value: Bson) {
        match path.split_once('.') {
            None => self.insert(path, value),
            Some((head, tail)) => {
                let mut child = match self.get(head) {
                    Some(Bson::Document(d)) => d.clone(),
                    _ => Document::new(),
                };
                child.set_path(tail, value);
                self.insert(head, Bson::Document(child));
            }
        }
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Bson)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

fn resolve_path(value: &Bson, rest: &[&str]) -> Option<Bson> {
    let Some((head, tail)) = rest.split_first() else {
        return Some(value.clone());
    };
    match value {
        Bson::Document(doc) => resolve_path(doc.get(head)?, tail),
        Bson::Array(items) => {
            if let Ok(idx) = head.parse::<usize>() {
                return resolve_path(items.get(idx)?, tail);
            }
            let found: Vec<Bson> = items
                .iter()
                .filter_map(|item| resolve_path(item, rest))
                .collect();
            Some(Bson::Array(found))
        }
        _ => None,
    }
}

impl Bson {
    pub fn type_name(&self) -> &'static str {
        match self {
            Bson::Null => "null",
            Bson::Bool(_) => "bool",
            Bson::Int(_) => "int",
            Bson::Double(_) => "double",
            Bson::String(_) => "string",
            Bson::DateTime(_) => "date",
            Bson::ObjectId(_) => "objectId",
            Bson::Array(_) => "array",
            Bson::Document(_) => "object",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Bson::Int(i) => Some(*i as f64),
            Bson::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Bson::Int(_) | Bson::Double(_))
    }

    /// Truthiness used by `$cond`, `$and`, `$or` in expressions
    pub fn is_truthy(&self) -> bool {
        match self {
            Bson::Null => false,
            Bson::Bool(b) => *b,
            Bson::Int(i) => *i != 0,
            Bson::Double(d) => *d != 0.0,
            _ => true,
        }
    }

    /// Midnight of a calendar day
    pub fn date(year: i32, month: u32, day: u32) -> Option<Bson> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Bson::DateTime)
    }

    /// Convert a JSON value, accepting extended JSON `$date`, `$oid` and
    /// `$numberLong`/`$numberDouble` wrappers
    pub fn from_json(value: Json) -> Bson {
        match value {
            Json::Null => Bson::Null,
            Json::Bool(b) => Bson::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Bson::Int(i),
                None => Bson::Double(n.as_f64().unwrap_or(0.0)),
            },
            Json::String(s) => Bson::String(s),
            Json::Array(items) => Bson::Array(items.into_iter().map(Bson::from_json).collect()),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some(special) = map.iter().next().and_then(|(k, v)| extended(k, v)) {
                        return special;
                    }
                }
                Bson::Document(
                    map.into_iter()
                        .map(|(k, v)| (k, Bson::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Render as plain JSON. Dates become ISO-8601 strings, object ids their
    /// hex string.
    pub fn to_json(&self) -> Json {
        match self {
            Bson::Null => Json::Null,
            Bson::Bool(b) => Json::Bool(*b),
            Bson::Int(i) => Json::from(*i),
            Bson::Double(d) => serde_json::Number::from_f64(*d).map_or(Json::Null, Json::Number),
            Bson::String(s) => Json::String(s.clone()),
            Bson::DateTime(dt) => Json::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
            Bson::ObjectId(oid) => Json::String(oid.clone()),
            Bson::Array(items) => Json::Array(items.iter().map(Bson::to_json).collect()),
            Bson::Document(doc) => Json::Object(
                doc.iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn extended(key: &str, value: &Json) -> Option<Bson> {
    match (key, value) {
        ("$oid", Json::String(s)) => Some(Bson::ObjectId(s.clone())),
        ("$date", Json::String(s)) => parse_datetime(s).map(Bson::DateTime),
        ("$date", Json::Number(n)) => n.as_i64().and_then(from_millis),
        ("$date", Json::Object(inner)) => inner
            .get("$numberLong")
            .and_then(Json::as_str)
            .and_then(|ms| ms.parse().ok())
            .and_then(from_millis),
        ("$numberLong" | "$numberInt", Json::String(s)) => s.parse().ok().map(Bson::Int),
        ("$numberDouble" | "$numberDecimal", Json::String(s)) => s.parse().ok().map(Bson::Double),
        _ => None,
    }
}

fn from_millis(ms: i64) -> Option<Bson> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| Bson::DateTime(dt.naive_utc()))
}

/// Parse the date formats found in exported order data
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

// ============================================================================
// Ordering
// ============================================================================

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null => 1,
        Bson::Int(_) | Bson::Double(_) => 2,
        Bson::String(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::ObjectId(_) => 7,
        Bson::Bool(_) => 8,
        Bson::DateTime(_) => 9,
    }
}

/// Total order across types: null, numbers, strings, documents, arrays,
/// object ids, booleans, dates. Numbers compare by value across int/double.
pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::Int(x), Bson::Int(y)) => x.cmp(y),
        (x, y) if x.is_number() => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Bson::String(x), Bson::String(y)) | (Bson::ObjectId(x), Bson::ObjectId(y)) => x.cmp(y),
        (Bson::Bool(x), Bson::Bool(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Array(x), Bson::Array(y)) => compare_seq(x.iter(), y.iter()),
        (Bson::Document(x), Bson::Document(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let ord = kx.cmp(ky).then_with(|| compare(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_seq<'a>(
    mut x: impl Iterator<Item = &'a Bson>,
    mut y: impl Iterator<Item = &'a Bson>,
) -> Ordering {
    loop {
        match (x.next(), y.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => {
                let ord = compare(a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Whether query comparison operators apply between the two values
pub fn comparable(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Ordering::Equal
}

// ============================================================================
// Pipeline
// ============================================================================

const ALLOWED_STAGES: &[&str] = &[
    "$match", "$group", "$project", "$addFields", "$set", "$unwind", "$sort", "$limit", "$skip",
    "$count",
];

const FORBIDDEN_STAGES: &[&str] = &[
    "$out",
    "$merge",
    "$lookup",
    "$graphLookup",
    "$unionWith",
    "$collStats",
    "$currentOp",
    "$indexStats",
    "$listSessions",
    "$planCacheStats",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindSpec {
    /// Field path without the leading `$`
    pub path: String,
    pub preserve_null_and_empty: bool,
}

/// One validated aggregation stage
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Document),
    Group(Document),
    Project(Document),
    AddFields(Document),
    Unwind(UnwindSpec),
    Sort(Vec<(String, SortOrder)>),
    Limit(usize),
    Skip(usize),
    Count(String),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Group(_) => "$group",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unwind(_) => "$unwind",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Count(_) => "$count",
        }
    }
}

/// A parsed, read-only aggregation pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Validate a parsed value into a pipeline of allowed stages
    pub fn from_bson(value: Bson) -> Result<Self, QueryError> {
        let Bson::Array(items) = value else {
            return Err(QueryError::shape(format!(
                "pipeline must be an array of stages, found {}",
                value.type_name()
            )));
        };
        if items.is_empty() {
            return Err(QueryError::shape("pipeline has no stages"));
        }

        let stages = items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| stage_from_bson(idx, item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { stages })
    }
}

fn stage_from_bson(idx: usize, item: Bson) -> Result<Stage, QueryError> {
    let Bson::Document(doc) = item else {
        return Err(QueryError::shape(format!("stage {idx} is not a document")));
    };
    let Some((name, body)) = doc.single() else {
        return Err(QueryError::shape(format!(
            "stage {idx} must have exactly one key, found {}",
            doc.len()
        )));
    };

    if FORBIDDEN_STAGES.contains(&name) {
        return Err(QueryError::Forbidden(name.to_string()));
    }
    if !ALLOWED_STAGES.contains(&name) {
        return Err(QueryError::Unsupported(name.to_string()));
    }

    let body = body.clone();
    let expect_doc = |body: Bson| match body {
        Bson::Document(d) => Ok(d),
        other => Err(QueryError::shape(format!(
            "{name} expects a document, found {}",
            other.type_name()
        ))),
    };

    match name {
        "$match" => Ok(Stage::Match(expect_doc(body)?)),
        "$group" => {
            let spec = expect_doc(body)?;
            if !spec.contains_key("_id") {
                return Err(QueryError::shape("$group requires an _id"));
            }
            Ok(Stage::Group(spec))
        }
        "$project" => Ok(Stage::Project(expect_doc(body)?)),
        "$addFields" | "$set" => Ok(Stage::AddFields(expect_doc(body)?)),
        "$unwind" => unwind_from_bson(body).map(Stage::Unwind),
        "$sort" => {
            let spec = expect_doc(body)?;
            if spec.is_empty() {
                return Err(QueryError::shape("$sort needs at least one key"));
            }
            spec.iter()
                .map(|(k, v)| match v.as_f64() {
                    Some(d) if d > 0.0 => Ok((k.to_string(), SortOrder::Ascending)),
                    Some(d) if d < 0.0 => Ok((k.to_string(), SortOrder::Descending)),
                    _ => Err(QueryError::shape(format!("$sort direction for {k} must be 1 or -1"))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Stage::Sort)
        }
        "$limit" => count_arg(name, &body).map(Stage::Limit),
        "$skip" => count_arg(name, &body).map(Stage::Skip),
        "$count" => match body {
            Bson::String(field)
                if !field.is_empty() && !field.starts_with('$') && !field.contains('.') =>
            {
                Ok(Stage::Count(field))
            }
            _ => Err(QueryError::shape("$count expects a plain field name")),
        },
        _ => Err(QueryError::Unsupported(name.to_string())),
    }
}

fn unwind_from_bson(body: Bson) -> Result<UnwindSpec, QueryError> {
    let (path, preserve) = match body {
        Bson::String(path) => (path, false),
        Bson::Document(doc) => {
            let path = doc
                .get("path")
                .and_then(Bson::as_str)
                .ok_or_else(|| QueryError::shape("$unwind requires a path"))?
                .to_string();
            let preserve = doc
                .get("preserveNullAndEmptyArrays")
                .is_some_and(Bson::is_truthy);
            (path, preserve)
        }
        other => {
            return Err(QueryError::shape(format!(
                "$unwind expects a field path, found {}",
                other.type_name()
            )))
        }
    };
    let Some(field) = path.strip_prefix('$') else {
        return Err(QueryError::shape("$unwind path must start with $"));
    };
    Ok(UnwindSpec {
        path: field.to_string(),
        preserve_null_and_empty: preserve,
    })
}

fn count_arg(stage: &str, body: &Bson) -> Result<usize, QueryError> {
    let n = match body {
        Bson::Int(i) => Some(*i),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
        _ => None,
    };
    n.and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| QueryError::shape(format!("{stage} expects a non-negative integer")))
}
