//! In-memory aggregation engine over the orders collection

use super::pipeline::{
    compare, comparable, parse_datetime, values_equal, Bson, Document, Pipeline, SortOrder, Stage,
    UnwindSpec,
};
use super::{QueryError, QueryExecutor};
use async_trait::async_trait;
use chrono::{Datelike, Duration, Timelike};
use regex::RegexBuilder;
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::path::Path;

/// Executes pipelines against documents held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    documents: Vec<Document>,
}

impl InMemoryEngine {
    /// Build from JSON records (extended JSON accepted); non-objects are skipped
    pub fn from_json_records(records: Vec<Json>) -> Self {
        let documents = records
            .into_iter()
            .filter_map(|r| match Bson::from_json(r) {
                Bson::Document(d) => Some(d),
                _ => None,
            })
            .collect();
        Self { documents }
    }

    /// Load a JSON array or JSON-lines file of order documents
    pub fn load(path: &Path) -> Result<Self, QueryError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| QueryError::exec(format!("failed to read {}: {e}", path.display())))?;

        let records: Vec<Json> = if text.trim_start().starts_with('[') {
            serde_json::from_str(&text)
                .map_err(|e| QueryError::exec(format!("invalid dataset {}: {e}", path.display())))?
        } else {
            text.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| {
                    serde_json::from_str(line).map_err(|e| {
                        QueryError::exec(format!(
                            "invalid dataset {} line {}: {e}",
                            path.display(),
                            n + 1
                        ))
                    })
                })
                .collect::<Result<_, _>>()?
        };

        Ok(Self::from_json_records(records))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Run every stage in order over a copy of the collection
    pub fn execute(&self, pipeline: &Pipeline) -> Result<Vec<Document>, QueryError> {
        let mut docs = self.documents.clone();
        for stage in &pipeline.stages {
            docs = apply_stage(stage, docs)?;
        }
        Ok(docs)
    }
}

#[async_trait]
impl QueryExecutor for InMemoryEngine {
    async fn run(&self, pipeline: &Pipeline) -> Result<Vec<Json>, QueryError> {
        let docs = self.execute(pipeline)?;
        Ok(docs
            .into_iter()
            .map(|d| Bson::Document(d).to_json())
            .collect())
    }
}

// ============================================================================
// Stages
// ============================================================================

fn apply_stage(stage: &Stage, docs: Vec<Document>) -> Result<Vec<Document>, QueryError> {
    match stage {
        Stage::Match(filter) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches_filter(&doc, filter)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }
        Stage::Group(spec) => group(spec, &docs),
        Stage::Project(spec) => docs.iter().map(|d| project(spec, d)).collect(),
        Stage::AddFields(spec) => docs
            .into_iter()
            .map(|mut doc| {
                let computed = spec
                    .iter()
                    .map(|(k, expr)| Ok((k.to_string(), eval(&doc, expr)?)))
                    .collect::<Result<Vec<_>, QueryError>>()?;
                for (k, v) in computed {
                    doc.set_path(&k, v);
                }
                Ok(doc)
            })
            .collect(),
        Stage::Unwind(spec) => Ok(unwind(spec, docs)),
        Stage::Sort(keys) => {
            let mut docs = docs;
            docs.sort_by(|a, b| {
                for (key, order) in keys {
                    let av = a.get_path(key).unwrap_or(Bson::Null);
                    let bv = b.get_path(key).unwrap_or(Bson::Null);
                    let ord = match order {
                        SortOrder::Ascending => compare(&av, &bv),
                        SortOrder::Descending => compare(&bv, &av),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
            Ok(docs)
        }
        Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
        Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        Stage::Count(field) => {
            if docs.is_empty() {
                return Ok(vec![]);
            }
            let mut out = Document::new();
            out.insert(field.clone(), Bson::Int(len_i64(docs.len())));
            Ok(vec![out])
        }
    }
}

fn len_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn unwind(spec: &UnwindSpec, docs: Vec<Document>) -> Vec<Document> {
    let mut out = Vec::new();
    for doc in docs {
        match doc.get_path(&spec.path) {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    copy.set_path(&spec.path, item);
                    out.push(copy);
                }
            }
            Some(Bson::Array(_) | Bson::Null) | None => {
                if spec.preserve_null_and_empty {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    out
}

// ============================================================================
// $match
// ============================================================================

fn matches_filter(doc: &Document, filter: &Document) -> Result<bool, QueryError> {
    for (key, cond) in filter.iter() {
        let ok = match key {
            "$and" => all_of(doc, cond, key)?.iter().all(|b| *b),
            "$or" => all_of(doc, cond, key)?.iter().any(|b| *b),
            "$nor" => !all_of(doc, cond, key)?.iter().any(|b| *b),
            "$expr" => eval(doc, cond)?.is_truthy(),
            op if op.starts_with('$') => return Err(QueryError::Unsupported(op.to_string())),
            field => field_matches(doc.get_path(field).as_ref(), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_of(doc: &Document, cond: &Bson, op: &str) -> Result<Vec<bool>, QueryError> {
    let Bson::Array(clauses) = cond else {
        return Err(QueryError::shape(format!("{op} expects an array")));
    };
    clauses
        .iter()
        .map(|c| match c {
            Bson::Document(f) => matches_filter(doc, f),
            _ => Err(QueryError::shape(format!("{op} clauses must be documents"))),
        })
        .collect()
}

fn is_operator_doc(cond: &Bson) -> Option<&Document> {
    match cond {
        Bson::Document(d) if d.iter().next().is_some_and(|(k, _)| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

fn field_matches(value: Option<&Bson>, cond: &Bson) -> Result<bool, QueryError> {
    let Some(ops) = is_operator_doc(cond) else {
        return Ok(eq_match(value, cond));
    };

    for (op, arg) in ops.iter() {
        let ok = match op {
            "$eq" => eq_match(value, arg),
            "$ne" => !eq_match(value, arg),
            "$gt" => cmp_match(value, arg, |o| o == Ordering::Greater),
            "$gte" => cmp_match(value, arg, |o| o != Ordering::Less),
            "$lt" => cmp_match(value, arg, |o| o == Ordering::Less),
            "$lte" => cmp_match(value, arg, |o| o != Ordering::Greater),
            "$in" => in_list(value, arg, op)?,
            "$nin" => !in_list(value, arg, op)?,
            "$exists" => value.is_some() == arg.is_truthy(),
            "$not" => !field_matches(value, arg)?,
            "$size" => match value {
                Some(Bson::Array(items)) => values_equal(&Bson::Int(len_i64(items.len())), arg),
                _ => false,
            },
            "$regex" => {
                let options = ops.get("$options").and_then(Bson::as_str).unwrap_or("");
                regex_match(value, arg, options)?
            }
            "$options" => true,
            other => return Err(QueryError::Unsupported(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eq_match(value: Option<&Bson>, target: &Bson) -> bool {
    match value {
        None => matches!(target, Bson::Null),
        Some(Bson::Array(items)) => {
            values_equal(&Bson::Array(items.clone()), target)
                || items.iter().any(|item| values_equal(item, target))
        }
        Some(v) => values_equal(v, target),
    }
}

fn cmp_match(value: Option<&Bson>, target: &Bson, pred: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Bson| comparable(v, target) && pred(compare(v, target));
    match value {
        None => false,
        Some(Bson::Array(items)) => items.iter().any(check),
        Some(v) => check(v),
    }
}

fn in_list(value: Option<&Bson>, arg: &Bson, op: &str) -> Result<bool, QueryError> {
    let Bson::Array(candidates) = arg else {
        return Err(QueryError::shape(format!("{op} expects an array")));
    };
    Ok(candidates.iter().any(|c| eq_match(value, c)))
}

fn regex_match(value: Option<&Bson>, pattern: &Bson, options: &str) -> Result<bool, QueryError> {
    let Some(pattern) = pattern.as_str() else {
        return Err(QueryError::shape("$regex expects a string pattern"));
    };
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .build()
        .map_err(|e| QueryError::shape(format!("invalid $regex: {e}")))?;
    Ok(match value {
        Some(Bson::String(s)) => re.is_match(s),
        Some(Bson::Array(items)) => items
            .iter()
            .any(|i| i.as_str().is_some_and(|s| re.is_match(s))),
        _ => false,
    })
}

// ============================================================================
// $group
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum AccKind {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

impl AccKind {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "$sum" => Self::Sum,
            "$avg" => Self::Avg,
            "$min" => Self::Min,
            "$max" => Self::Max,
            "$first" => Self::First,
            "$last" => Self::Last,
            "$push" => Self::Push,
            "$addToSet" => Self::AddToSet,
            "$count" => Self::Count,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
struct Accumulator {
    kind: AccKind,
    values: Vec<Bson>,
}

impl Accumulator {
    fn finish(self) -> Bson {
        let Accumulator { kind, values } = self;
        match kind {
            AccKind::Sum => sum(values.iter()),
            AccKind::Avg => avg(values.iter()),
            AccKind::Min => extreme(values, Ordering::Less),
            AccKind::Max => extreme(values, Ordering::Greater),
            AccKind::First => values.into_iter().next().unwrap_or(Bson::Null),
            AccKind::Last => values.into_iter().last().unwrap_or(Bson::Null),
            AccKind::Push => Bson::Array(values),
            AccKind::AddToSet => {
                let mut set: Vec<Bson> = Vec::new();
                for v in values {
                    if !set.iter().any(|s| values_equal(s, &v)) {
                        set.push(v);
                    }
                }
                Bson::Array(set)
            }
            AccKind::Count => Bson::Int(len_i64(values.len())),
        }
    }
}

fn group(spec: &Document, docs: &[Document]) -> Result<Vec<Document>, QueryError> {
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| QueryError::shape("$group requires an _id"))?;

    let mut fields = Vec::new();
    for (name, acc) in spec.iter().filter(|(k, _)| *k != "_id") {
        let Some((op, expr)) = acc.as_document().and_then(Document::single) else {
            return Err(QueryError::shape(format!(
                "$group field {name} must be a single accumulator"
            )));
        };
        let kind = AccKind::parse(op).ok_or_else(|| QueryError::Unsupported(op.to_string()))?;
        fields.push((name.to_string(), kind, expr));
    }

    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for doc in docs {
        let key = eval(doc, id_expr)?;
        let idx = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(idx) => idx,
            None => {
                let accs = fields
                    .iter()
                    .map(|(_, kind, _)| Accumulator {
                        kind: *kind,
                        values: vec![],
                    })
                    .collect();
                groups.push((key, accs));
                groups.len() - 1
            }
        };

        for (acc, (_, kind, expr)) in groups[idx].1.iter_mut().zip(&fields) {
            let value = match kind {
                AccKind::Count => Bson::Int(1),
                _ => eval(doc, expr)?,
            };
            acc.values.push(value);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((name, _, _), acc) in fields.iter().zip(accs) {
                out.insert(name.clone(), acc.finish());
            }
            out
        })
        .collect())
}

fn sum<'a>(values: impl Iterator<Item = &'a Bson>) -> Bson {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for v in values {
        match v {
            Bson::Int(i) => int_total = int_total.and_then(|t| t.checked_add(*i)),
            Bson::Double(_) => int_total = None,
            _ => continue,
        }
        float_total += numeric(v);
    }
    int_total.map_or(Bson::Double(float_total), Bson::Int)
}

fn avg<'a>(values: impl Iterator<Item = &'a Bson>) -> Bson {
    let nums: Vec<f64> = values.filter_map(Bson::as_f64).collect();
    if nums.is_empty() {
        return Bson::Null;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = nums.len() as f64;
    Bson::Double(nums.iter().sum::<f64>() / n)
}

fn extreme(values: Vec<Bson>, wanted: Ordering) -> Bson {
    values
        .into_iter()
        .filter(|v| !matches!(v, Bson::Null))
        .reduce(|best, v| if compare(&v, &best) == wanted { v } else { best })
        .unwrap_or(Bson::Null)
}

// ============================================================================
// $project
// ============================================================================

/// `Some(include)` for 0/1/true/false projection flags
fn projection_flag(value: &Bson) -> Option<bool> {
    match value {
        Bson::Bool(b) => Some(*b),
        Bson::Int(_) | Bson::Double(_) => Some(value.is_truthy()),
        _ => None,
    }
}

fn project(spec: &Document, doc: &Document) -> Result<Document, QueryError> {
    let exclude_id = spec.get("_id").and_then(projection_flag) == Some(false);
    let field_specs: Vec<(&str, &Bson)> = spec.iter().filter(|(k, _)| *k != "_id").collect();

    let exclusion = if field_specs.is_empty() {
        exclude_id
    } else {
        field_specs
            .iter()
            .all(|(_, v)| projection_flag(v) == Some(false))
    };

    if exclusion {
        let mut out = doc.clone();
        for (k, _) in &field_specs {
            out.remove(k);
        }
        if exclude_id {
            out.remove("_id");
        }
        return Ok(out);
    }

    let mut out = Document::new();
    match spec.get("_id") {
        Some(id_spec) if projection_flag(id_spec).is_none() => {
            out.insert("_id", eval(doc, id_spec)?);
        }
        _ if !exclude_id => {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        _ => {}
    }

    for (key, value) in field_specs {
        match projection_flag(value) {
            Some(true) => {
                if let Some(v) = doc.get_path(key) {
                    out.set_path(key, v);
                }
            }
            Some(false) => {
                return Err(QueryError::shape(format!(
                    "cannot exclude {key} in an inclusion projection"
                )))
            }
            None => out.set_path(key, eval(doc, value)?),
        }
    }
    Ok(out)
}

// ============================================================================
// Expressions
// ============================================================================

fn eval(doc: &Document, expr: &Bson) -> Result<Bson, QueryError> {
    match expr {
        Bson::String(s) if s.starts_with("$$") => Err(QueryError::Unsupported(s.clone())),
        Bson::String(s) => match s.strip_prefix('$') {
            Some(path) => Ok(doc.get_path(path).unwrap_or(Bson::Null)),
            None => Ok(expr.clone()),
        },
        Bson::Array(items) => items
            .iter()
            .map(|i| eval(doc, i))
            .collect::<Result<_, _>>()
            .map(Bson::Array),
        Bson::Document(d) => match d.single() {
            Some((op, arg)) if op.starts_with('$') => eval_operator(doc, op, arg),
            _ => d
                .iter()
                .map(|(k, v)| Ok((k.to_string(), eval(doc, v)?)))
                .collect::<Result<Document, QueryError>>()
                .map(Bson::Document),
        },
        _ => Ok(expr.clone()),
    }
}

/// Evaluate operator arguments; a lone argument becomes a one-element list
fn eval_args(doc: &Document, arg: &Bson) -> Result<Vec<Bson>, QueryError> {
    match arg {
        Bson::Array(items) => items.iter().map(|i| eval(doc, i)).collect(),
        other => Ok(vec![eval(doc, other)?]),
    }
}

fn arity<const N: usize>(op: &str, args: Vec<Bson>) -> Result<[Bson; N], QueryError> {
    let found = args.len();
    args.try_into()
        .map_err(|_| QueryError::shape(format!("{op} takes {N} arguments, got {found}")))
}

fn eval_operator(doc: &Document, op: &str, arg: &Bson) -> Result<Bson, QueryError> {
    match op {
        "$literal" => Ok(arg.clone()),

        "$sum" | "$avg" | "$min" | "$max" => {
            let args = eval_args(doc, arg)?;
            let values = match args.as_slice() {
                [Bson::Array(items)] => items.clone(),
                _ => args,
            };
            Ok(match op {
                "$sum" => sum(values.iter()),
                "$avg" => avg(values.iter()),
                "$min" => extreme(values, Ordering::Less),
                _ => extreme(values, Ordering::Greater),
            })
        }

        "$add" => {
            let args = eval_args(doc, arg)?;
            if args.iter().any(|a| matches!(a, Bson::Null)) {
                return Ok(Bson::Null);
            }
            let date = args.iter().find_map(|a| match a {
                Bson::DateTime(dt) => Some(*dt),
                _ => None,
            });
            let numbers: Vec<&Bson> = args
                .iter()
                .filter(|a| !matches!(a, Bson::DateTime(_)))
                .collect();
            if let Some(bad) = numbers.iter().find(|a| !a.is_number()) {
                return Err(mismatch("$add only supports numeric or date types", bad));
            }
            let total = sum(numbers.into_iter());
            match date {
                Some(dt) => dt
                    .checked_add_signed(millis(&total)?)
                    .map(Bson::DateTime)
                    .ok_or_else(|| QueryError::exec("$add result is out of the date range")),
                None => Ok(total),
            }
        }

        "$subtract" => {
            let [a, b] = arity::<2>(op, eval_args(doc, arg)?)?;
            match (&a, &b) {
                (Bson::Null, _) | (_, Bson::Null) => Ok(Bson::Null),
                (Bson::DateTime(x), Bson::DateTime(y)) => {
                    Ok(Bson::Int((*x - *y).num_milliseconds()))
                }
                (Bson::DateTime(x), n) if n.is_number() => x
                    .checked_sub_signed(millis(n)?)
                    .map(Bson::DateTime)
                    .ok_or_else(|| QueryError::exec("$subtract result is out of the date range")),
                (Bson::Int(x), Bson::Int(y)) => Ok(x.checked_sub(*y).map_or_else(
                    || Bson::Double(numeric(&a) - numeric(&b)),
                    Bson::Int,
                )),
                (x, y) if x.is_number() && y.is_number() => {
                    Ok(Bson::Double(numeric(x) - numeric(y)))
                }
                _ => Err(type_error(op, &a, &b)),
            }
        }

        "$multiply" => {
            let args = eval_args(doc, arg)?;
            if args.iter().any(|a| matches!(a, Bson::Null)) {
                return Ok(Bson::Null);
            }
            let mut int_product: Option<i64> = Some(1);
            let mut product = 1.0;
            for a in &args {
                match a {
                    Bson::Int(i) => int_product = int_product.and_then(|p| p.checked_mul(*i)),
                    Bson::Double(_) => int_product = None,
                    other => return Err(mismatch("$multiply only supports numeric types", other)),
                }
                product *= numeric(a);
            }
            Ok(int_product.map_or(Bson::Double(product), Bson::Int))
        }

        "$divide" => {
            let [a, b] = arity::<2>(op, eval_args(doc, arg)?)?;
            match (&a, &b) {
                (Bson::Null, _) | (_, Bson::Null) => Ok(Bson::Null),
                (x, y) if x.is_number() && y.is_number() => {
                    let divisor = numeric(y);
                    if divisor == 0.0 {
                        return Err(QueryError::exec("can't $divide by zero"));
                    }
                    Ok(Bson::Double(numeric(x) / divisor))
                }
                _ => Err(type_error(op, &a, &b)),
            }
        }

        "$mod" => {
            let [a, b] = arity::<2>(op, eval_args(doc, arg)?)?;
            match (&a, &b) {
                (Bson::Int(_), Bson::Int(0)) => Err(QueryError::exec("can't $mod by zero")),
                (Bson::Int(x), Bson::Int(y)) => x
                    .checked_rem(*y)
                    .map(Bson::Int)
                    .ok_or_else(|| QueryError::exec("$mod result overflows a 64-bit integer")),
                (x, y) if x.is_number() && y.is_number() => {
                    Ok(Bson::Double(numeric(x) % numeric(y)))
                }
                _ => Err(type_error(op, &a, &b)),
            }
        }

        "$ceil" | "$floor" | "$abs" => {
            let [a] = arity::<1>(op, eval_args(doc, arg)?)?;
            match a {
                Bson::Null => Ok(Bson::Null),
                Bson::Int(i) if op == "$abs" => i
                    .checked_abs()
                    .map(Bson::Int)
                    .ok_or_else(|| QueryError::exec("$abs result overflows a 64-bit integer")),
                Bson::Int(i) => Ok(Bson::Int(i)),
                Bson::Double(d) => Ok(Bson::Double(match op {
                    "$ceil" => d.ceil(),
                    "$floor" => d.floor(),
                    _ => d.abs(),
                })),
                other => Err(mismatch(&format!("{op} only supports numeric types"), &other)),
            }
        }

        "$round" => {
            let mut args = eval_args(doc, arg)?;
            if args.len() == 1 {
                args.push(Bson::Int(0));
            }
            let [value, places] = arity::<2>(op, args)?;
            let places = match places {
                Bson::Int(p) => i32::try_from(p)
                    .map_err(|_| QueryError::exec("$round place out of range"))?,
                _ => return Err(QueryError::exec("$round place must be an integer")),
            };
            match value {
                Bson::Null => Ok(Bson::Null),
                Bson::Int(i) if places >= 0 => Ok(Bson::Int(i)),
                v if v.is_number() => {
                    let factor = 10f64.powi(places);
                    Ok(Bson::Double((numeric(&v) * factor).round() / factor))
                }
                other => Err(mismatch("$round only supports numeric types", &other)),
            }
        }

        "$year" | "$month" | "$dayOfMonth" | "$hour" => {
            let [a] = arity::<1>(op, eval_args(doc, arg)?)?;
            match a {
                Bson::Null => Ok(Bson::Null),
                Bson::DateTime(dt) => Ok(Bson::Int(match op {
                    "$year" => i64::from(dt.year()),
                    "$month" => i64::from(dt.month()),
                    "$dayOfMonth" => i64::from(dt.day()),
                    _ => i64::from(dt.hour()),
                })),
                other => Err(QueryError::exec(format!(
                    "can't convert from BSON type {} to Date",
                    other.type_name()
                ))),
            }
        }

        "$concat" => {
            let args = eval_args(doc, arg)?;
            let mut out = String::new();
            for a in args {
                match a {
                    Bson::Null => return Ok(Bson::Null),
                    Bson::String(s) => out.push_str(&s),
                    other => return Err(mismatch("$concat only supports strings", &other)),
                }
            }
            Ok(Bson::String(out))
        }

        "$toLower" | "$toUpper" => {
            let [a] = arity::<1>(op, eval_args(doc, arg)?)?;
            Ok(match a {
                Bson::Null => Bson::String(String::new()),
                Bson::String(s) if op == "$toLower" => Bson::String(s.to_lowercase()),
                Bson::String(s) => Bson::String(s.to_uppercase()),
                other => return Err(mismatch(&format!("{op} requires a string"), &other)),
            })
        }

        "$substr" | "$substrCP" | "$substrBytes" => {
            let [s, start, len] = arity::<3>(op, eval_args(doc, arg)?)?;
            let text = match s {
                Bson::Null => return Ok(Bson::String(String::new())),
                Bson::String(s) => s,
                other => to_string(&other)
                    .ok_or_else(|| mismatch(&format!("{op} requires a string"), &other))?,
            };
            let start = usize::try_from(as_int(&start, op)?).unwrap_or(0);
            let taken: String = match usize::try_from(as_int(&len, op)?) {
                Ok(n) => text.chars().skip(start).take(n).collect(),
                Err(_) => text.chars().skip(start).collect(),
            };
            Ok(Bson::String(taken))
        }

        "$size" => {
            let [a] = arity::<1>(op, eval_args(doc, arg)?)?;
            match a {
                Bson::Array(items) => Ok(Bson::Int(len_i64(items.len()))),
                other => Err(mismatch("The argument to $size must be an array", &other)),
            }
        }

        "$cond" => {
            let (cond, then, otherwise) = match arg {
                Bson::Array(items) => match items.as_slice() {
                    [c, t, e] => (c, t, e),
                    _ => return Err(QueryError::shape("$cond takes 3 arguments")),
                },
                Bson::Document(d) => match (d.get("if"), d.get("then"), d.get("else")) {
                    (Some(c), Some(t), Some(e)) => (c, t, e),
                    _ => return Err(QueryError::shape("$cond requires if, then and else")),
                },
                _ => return Err(QueryError::shape("$cond expects an array or document")),
            };
            if eval(doc, cond)?.is_truthy() {
                eval(doc, then)
            } else {
                eval(doc, otherwise)
            }
        }

        "$ifNull" => {
            let args = eval_args(doc, arg)?;
            let fallback = args.last().cloned().unwrap_or(Bson::Null);
            Ok(args
                .into_iter()
                .find(|a| !matches!(a, Bson::Null))
                .unwrap_or(fallback))
        }

        "$and" => Ok(Bson::Bool(eval_args(doc, arg)?.iter().all(Bson::is_truthy))),
        "$or" => Ok(Bson::Bool(eval_args(doc, arg)?.iter().any(Bson::is_truthy))),
        "$not" => {
            let [a] = arity::<1>(op, eval_args(doc, arg)?)?;
            Ok(Bson::Bool(!a.is_truthy()))
        }

        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let [a, b] = arity::<2>(op, eval_args(doc, arg)?)?;
            let ord = compare(&a, &b);
            Ok(match op {
                "$eq" => Bson::Bool(ord == Ordering::Equal),
                "$ne" => Bson::Bool(ord != Ordering::Equal),
                "$gt" => Bson::Bool(ord == Ordering::Greater),
                "$gte" => Bson::Bool(ord != Ordering::Less),
                "$lt" => Bson::Bool(ord == Ordering::Less),
                "$lte" => Bson::Bool(ord != Ordering::Greater),
                _ => Bson::Int(match ord {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
            })
        }

        "$toDouble" | "$toInt" | "$toLong" | "$toString" | "$toDate" | "$toBool" => {
            let [a] = arity::<1>(op, eval_args(doc, arg)?)?;
            let target = match op {
                "$toDouble" => "double",
                "$toInt" => "int",
                "$toLong" => "long",
                "$toString" => "string",
                "$toDate" => "date",
                _ => "bool",
            };
            convert(&a, target)
        }

        "$convert" => {
            let Bson::Document(spec) = arg else {
                return Err(QueryError::shape("$convert expects a document"));
            };
            let input = match spec.get("input") {
                Some(expr) => eval(doc, expr)?,
                None => Bson::Null,
            };
            let target = match spec.get("to") {
                Some(Bson::String(t)) => t.clone(),
                _ => return Err(QueryError::shape("$convert requires a string 'to'")),
            };
            if matches!(input, Bson::Null) {
                return match spec.get("onNull") {
                    Some(v) => eval(doc, v),
                    None => Ok(Bson::Null),
                };
            }
            match convert(&input, &target) {
                Ok(v) => Ok(v),
                Err(e) => match spec.get("onError") {
                    Some(v) => eval(doc, v),
                    None => Err(e),
                },
            }
        }

        other => Err(QueryError::Unsupported(other.to_string())),
    }
}

fn numeric(v: &Bson) -> f64 {
    v.as_f64().unwrap_or(0.0)
}

/// Milliseconds as a duration, failing past the representable range
#[allow(clippy::cast_possible_truncation)]
fn millis(v: &Bson) -> Result<Duration, QueryError> {
    let ms = match v {
        Bson::Int(i) => *i,
        other => numeric(other).round() as i64,
    };
    Duration::try_milliseconds(ms)
        .ok_or_else(|| QueryError::exec(format!("{ms} milliseconds is out of the date range")))
}

fn as_int(v: &Bson, op: &str) -> Result<i64, QueryError> {
    match v {
        Bson::Int(i) => Ok(*i),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(d) => Ok(d.trunc() as i64),
        other => Err(mismatch(&format!("{op} requires numeric positions"), other)),
    }
}

/// `"{what}, not {type}"` for an operand of the wrong type
fn mismatch(what: &str, v: &Bson) -> QueryError {
    QueryError::exec(format!("{what}, not {}", v.type_name()))
}

fn type_error(op: &str, a: &Bson, b: &Bson) -> QueryError {
    QueryError::exec(format!(
        "{op} does not support types {} and {}",
        a.type_name(),
        b.type_name()
    ))
}

fn to_string(v: &Bson) -> Option<String> {
    match v {
        Bson::String(s) => Some(s.clone()),
        Bson::Int(i) => Some(i.to_string()),
        Bson::Double(d) => Some(d.to_string()),
        Bson::Bool(b) => Some(b.to_string()),
        Bson::ObjectId(oid) => Some(oid.clone()),
        Bson::DateTime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        _ => None,
    }
}

fn convert(value: &Bson, target: &str) -> Result<Bson, QueryError> {
    let fail = || {
        QueryError::exec(format!(
            "unsupported conversion from {} to {target}",
            value.type_name()
        ))
    };
    match target {
        "double" | "decimal" => match value {
            Bson::Null => Ok(Bson::Null),
            Bson::Bool(b) => Ok(Bson::Double(if *b { 1.0 } else { 0.0 })),
            v if v.is_number() => Ok(Bson::Double(numeric(v))),
            Bson::String(s) => s.trim().parse::<f64>().map(Bson::Double).map_err(|_| {
                QueryError::exec(format!("failed to parse number '{s}' in $convert"))
            }),
            _ => Err(fail()),
        },
        "int" | "long" => match value {
            Bson::Null => Ok(Bson::Null),
            Bson::Bool(b) => Ok(Bson::Int(i64::from(*b))),
            Bson::Int(i) => Ok(Bson::Int(*i)),
            #[allow(clippy::cast_possible_truncation)]
            Bson::Double(d) if d.is_finite() => Ok(Bson::Int(d.trunc() as i64)),
            Bson::String(s) => s.trim().parse::<i64>().map(Bson::Int).map_err(|_| {
                QueryError::exec(format!("failed to parse number '{s}' in $convert"))
            }),
            _ => Err(fail()),
        },
        "string" => match value {
            Bson::Null => Ok(Bson::Null),
            v => to_string(v).map(Bson::String).ok_or_else(fail),
        },
        "bool" => Ok(Bson::Bool(value.is_truthy())),
        "date" => match value {
            Bson::Null => Ok(Bson::Null),
            Bson::DateTime(_) => Ok(value.clone()),
            Bson::String(s) => parse_datetime(s)
                .map(Bson::DateTime)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
        other => Err(QueryError::Unsupported(format!("$convert to {other}"))),
    }
}
