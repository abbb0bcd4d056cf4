//! Checkpoint metadata parsing.
//!
//! Catalog configs are nested key-value text blobs. The object driver reads
//! the `checkpoint=(...)` array of sub-objects, taking maxima over the
//! durable timestamps of every checkpoint an object still carries.
//!
//! A structurally undecodable config (unbalanced parentheses, unterminated
//! quote) is object corruption and surfaces as such, so the catalog scan can
//! apply its corruption-tolerance rules; a well-formed config with a bad
//! scalar is an invalid-configuration error instead.

use tusk_error::{Result, TuskError};
use tusk_types::{Timestamp, TxnId};

/// Checkpoint summary extracted from one object's catalog config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub newest_start_durable_ts: Timestamp,
    pub newest_stop_durable_ts: Timestamp,
    pub newest_stop_ts: Timestamp,
    pub newest_txn: TxnId,
    pub prepare: bool,
    /// Length of the checkpoint address; zero means an empty tree.
    pub addr_len: usize,
    /// The object's btree id, when present at the top level of the config.
    pub id: Option<u32>,
    /// Whether any checkpoint recorded a durable timestamp key at all.
    pub durable_ts_found: bool,
}

impl CheckpointMeta {
    /// Max of the start and stop durable timestamps over all checkpoints.
    #[must_use]
    pub fn max_durable_ts(&self) -> Timestamp {
        self.newest_start_durable_ts.max(self.newest_stop_durable_ts)
    }

    /// Parse an object's catalog config.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` when the config is structurally undecodable and
    /// `InvalidConfig` when a present value fails to parse.
    pub fn parse(uri: &str, config: &str) -> Result<Self> {
        check_structure(uri, config)?;

        let mut meta = Self::default();

        if let Some(id) = get(config, "id") {
            meta.id = Some(
                id.parse::<u32>()
                    .map_err(|_| TuskError::invalid_config(format!("bad id value: {id}")))?,
            );
        }

        let Some(checkpoints) = get(config, "checkpoint") else {
            return Ok(meta);
        };

        for (_name, body) in pairs(strip_parens(checkpoints)) {
            let ckpt = strip_parens(body);
            if let Some(v) = get(ckpt, "newest_start_durable_ts") {
                meta.newest_start_durable_ts = meta.newest_start_durable_ts.max(parse_ts(v)?);
                meta.durable_ts_found = true;
            }
            if let Some(v) = get(ckpt, "newest_stop_durable_ts") {
                meta.newest_stop_durable_ts = meta.newest_stop_durable_ts.max(parse_ts(v)?);
                meta.durable_ts_found = true;
            }
            if let Some(v) = get(ckpt, "newest_stop_ts") {
                meta.newest_stop_ts = meta.newest_stop_ts.max(parse_ts(v)?);
            }
            if let Some(v) = get(ckpt, "prepare") {
                if parse_u64(v)? != 0 {
                    meta.prepare = true;
                }
            }
            if let Some(v) = get(ckpt, "newest_txn") {
                if !v.is_empty() {
                    meta.newest_txn = TxnId::new(parse_u64(v)?);
                }
            }
            if let Some(v) = get(ckpt, "addr") {
                meta.addr_len = unquote(v).len();
            }
        }

        Ok(meta)
    }
}

/// Reject configs the pair splitter cannot decode reliably.
fn check_structure(uri: &str, config: &str) -> Result<()> {
    let mut depth = 0_i64;
    let mut in_quote = false;
    for &b in config.as_bytes() {
        match b {
            b'"' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => {
                depth -= 1;
                if depth < 0 {
                    return Err(TuskError::corruption(
                        uri,
                        "unbalanced parentheses in checkpoint metadata",
                    ));
                }
            }
            _ => {}
        }
    }
    if in_quote {
        return Err(TuskError::corruption(
            uri,
            "unterminated quoted string in checkpoint metadata",
        ));
    }
    if depth != 0 {
        return Err(TuskError::corruption(
            uri,
            "unbalanced parentheses in checkpoint metadata",
        ));
    }
    Ok(())
}

fn parse_ts(v: &str) -> Result<Timestamp> {
    Ok(Timestamp::new(parse_u64(v)?))
}

fn parse_u64(v: &str) -> Result<u64> {
    v.parse::<u64>()
        .map_err(|_| TuskError::invalid_config(format!("bad numeric value: {v}")))
}

fn unquote(v: &str) -> &str {
    v.strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(v)
}

fn strip_parens(v: &str) -> &str {
    v.strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(v)
}

/// Look up a top-level key in a config fragment.
fn get<'a>(config: &'a str, key: &str) -> Option<&'a str> {
    pairs(config).find(|(k, _)| *k == key).map(|(_, v)| v)
}

/// Split a config fragment into `key=value` pairs at the top nesting level.
///
/// Commas inside parentheses or double quotes do not split; a key without
/// `=` yields an empty value.
fn pairs(config: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut items = Vec::new();
    let bytes = config.as_bytes();
    let mut depth = 0_u32;
    let mut in_quote = false;
    let mut start = 0_usize;

    for (at, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth = depth.saturating_sub(1),
            b',' if !in_quote && depth == 0 => {
                if at > start {
                    items.push(&config[start..at]);
                }
                start = at + 1;
            }
            _ => {}
        }
    }
    if config.len() > start {
        items.push(&config[start..]);
    }

    items.into_iter().map(|item| {
        let item = item.trim();
        match split_pair(item) {
            Some((k, v)) => (k, v),
            None => (item, ""),
        }
    })
}

/// Split one item at the first `=` outside quotes and parentheses.
fn split_pair(item: &str) -> Option<(&str, &str)> {
    let bytes = item.as_bytes();
    let mut depth = 0_u32;
    let mut in_quote = false;
    for (at, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth = depth.saturating_sub(1),
            b'=' if !in_quote && depth == 0 => {
                return Some((&item[..at], &item[at + 1..]));
            }
            _ => {}
        }
    }
    None
}
