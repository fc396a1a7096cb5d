//! Run-length-encoded action columns carried in the descriptor extension object.
//!
//! Each column (`acname`, `acns`, `acsec`, `acenv`, `acflag`, `acver`,
//! `accompat`) is a list whose entries are either a bare value (one row) or
//! `[count, value]`. `acname` fixes the row count; every other column must
//! expand to exactly that many rows.

use serde_json::{Map, Value};

use super::action::{parse_flags, ActionDescriptor, ActionName};
use super::descriptor::DescriptorError;

/// Largest row count accepted.
pub const MAX_ROWS: usize = 100_000;

/// Column keys.
pub const COLUMNS: [&str; 7] = ["acname", "acns", "acsec", "acenv", "acflag", "acver", "accompat"];

fn bad(msg: impl Into<String>) -> DescriptorError {
    DescriptorError::Actions(msg.into())
}

fn entry_count(column: &str, entry: &Value) -> Result<(usize, Value), DescriptorError> {
    match entry {
        Value::Array(pair) => {
            if pair.len() != 2 {
                return Err(bad(format!("{column} array entry must be 2-element")));
            }
            let count = pair[0]
                .as_u64()
                .ok_or_else(|| bad(format!("invalid repeat count {} in {column}", pair[0])))?;
            let count = usize::try_from(count).map_err(|_| bad("repeat count overflow"))?;
            Ok((count, pair[1].clone()))
        }
        other => Ok((1, other.clone())),
    }
}

fn row_count(ext: &Map<String, Value>) -> Result<usize, DescriptorError> {
    let column = ext.get("acname").ok_or_else(|| bad("acname is required"))?;
    let entries = column.as_array().ok_or_else(|| bad("acname must be array"))?;
    let mut total: usize = 0;
    for entry in entries {
        let (count, _) = entry_count("acname", entry)?;
        total = total
            .checked_add(count)
            .filter(|t| *t <= MAX_ROWS)
            .ok_or_else(|| bad("action list too long"))?;
    }
    Ok(total)
}

fn expand(
    ext: &Map<String, Value>,
    column: &str,
    rows: usize,
    default: Option<Value>,
) -> Result<Vec<Value>, DescriptorError> {
    let entries = match (ext.get(column), default) {
        (Some(Value::Array(entries)), _) => entries.clone(),
        (Some(_), _) => return Err(bad(format!("{column} must be array"))),
        (None, Some(default)) => vec![Value::Array(vec![Value::from(rows), default])],
        (None, None) => return Err(bad(format!("{column} must be provided"))),
    };
    let mut out = Vec::with_capacity(rows);
    for entry in &entries {
        let (count, value) = entry_count(column, entry)?;
        if out.len() + count > rows {
            return Err(bad(format!("repeat count overflow in {column}")));
        }
        out.extend(std::iter::repeat(value).take(count));
    }
    if out.len() != rows {
        return Err(bad(format!(
            "{column} covers {} of {rows} actions",
            out.len()
        )));
    }
    Ok(out)
}

fn strings(column: &str, values: Vec<Value>) -> Result<Vec<String>, DescriptorError> {
    values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            _ => Err(bad(format!("{column} elements must be strings"))),
        })
        .collect()
}

fn positive_ints(column: &str, values: Vec<Value>) -> Result<Vec<u32>, DescriptorError> {
    values
        .into_iter()
        .map(|v| {
            v.as_u64()
                .filter(|n| *n > 0)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| bad(format!("{column} elements must be positive integers")))
        })
        .collect()
}

/// True if the extension object carries RLE columns.
pub fn present(ext: &Map<String, Value>) -> bool {
    ext.contains_key("acname")
}

/// Decode RLE columns. Rows whose compatibility level is not 1 are skipped.
pub fn decode(ext: &Map<String, Value>) -> Result<Vec<ActionDescriptor>, DescriptorError> {
    let rows = row_count(ext)?;
    let names = strings("acname", expand(ext, "acname", rows, None)?)?;
    let namespaces = strings("acns", expand(ext, "acns", rows, None)?)?;
    let compat = positive_ints("accompat", expand(ext, "accompat", rows, Some(1.into()))?)?;
    let versions = positive_ints("acver", expand(ext, "acver", rows, Some(1.into()))?)?;
    let flags = strings("acflag", expand(ext, "acflag", rows, Some("".into()))?)?;
    let envelopes = strings("acenv", expand(ext, "acenv", rows, None)?)?;
    let sectors = strings("acsec", expand(ext, "acsec", rows, None)?)?;

    let mut out = Vec::with_capacity(rows);
    for i in 0..rows {
        if compat[i] != 1 {
            continue;
        }
        let (action_flags, timeout_secs) = parse_flags(&flags[i]);
        out.push(ActionDescriptor {
            name: ActionName::new(&sectors[i], &namespaces[i], &names[i], versions[i]),
            flags: action_flags,
            timeout_secs,
            envelopes: envelopes[i].split(',').map(str::to_string).collect(),
        });
    }
    Ok(out)
}

fn compress(values: impl IntoIterator<Item = Value>) -> Value {
    let mut runs: Vec<(usize, Value)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    Value::Array(
        runs.into_iter()
            .map(|(count, value)| {
                if count == 1 {
                    value
                } else {
                    Value::Array(vec![Value::from(count), value])
                }
            })
            .collect(),
    )
}

/// Write `actions` as RLE columns into `ext`. Columns equal to their default
/// everywhere are omitted.
pub fn encode(actions: &[ActionDescriptor], ext: &mut Map<String, Value>) {
    ext.insert(
        "acname".into(),
        compress(actions.iter().map(|a| Value::from(a.name.name.clone()))),
    );
    ext.insert(
        "acns".into(),
        compress(actions.iter().map(|a| Value::from(a.name.namespace.clone()))),
    );
    ext.insert(
        "acsec".into(),
        compress(actions.iter().map(|a| Value::from(a.name.sector.clone()))),
    );
    ext.insert(
        "acenv".into(),
        compress(actions.iter().map(|a| Value::from(a.envelopes.join(",")))),
    );
    if actions.iter().any(|a| !a.flag_string().is_empty()) {
        ext.insert(
            "acflag".into(),
            compress(actions.iter().map(|a| Value::from(a.flag_string()))),
        );
    }
    if actions.iter().any(|a| a.name.version != 1) {
        ext.insert(
            "acver".into(),
            compress(actions.iter().map(|a| Value::from(a.name.version))),
        );
    }
}
