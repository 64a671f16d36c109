//! Cell outputs and normalization of execution replies.
//!
//! Execution replies arrive as loosely shaped JSON. Normalization runs in
//! two steps:
//!
//! 1. [`parse_execute_reply`] walks the reply and produces a list of
//!    [`ResponseFragment`]s. Anything it does not understand becomes an
//!    explicit [`ResponseFragment::Unknown`] instead of disappearing.
//! 2. [`normalize`] folds the known fragments into [`Output`] records and
//!    works out the cell's execution count.
//!
//! Outputs serialize in nbformat v4 form so that saved notebooks remain
//! readable by Jupyter.

use std::fmt;

use log::warn;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// MIME type -> payload.
pub type MediaBundle = Map<String, Value>;

/// Failure kind for remote-call failures and error fragments without a name.
pub const EXECUTION_ERROR: &str = "ExecutionError";

/// Failure kind recorded when the session goes away mid-execution.
pub const SESSION_DIED: &str = "SessionDied";

const DEFAULT_ERROR_MESSAGE: &str = "An error occurred during execution";
const COMPLETED_MESSAGE: &str = "Cell executed successfully";

/// Reply keys that describe the message rather than its results.
const ENVELOPE_KEYS: &[&str] = &[
    "buffers",
    "channel",
    "execution_state",
    "header",
    "metadata",
    "msg_id",
    "msg_type",
    "parent_header",
    "status",
];

/// Keys of the `content` object consumed by [`parse_content`].
const CONTENT_KEYS: &[&str] = &[
    "data",
    "ename",
    "error",
    "evalue",
    "execution_count",
    "metadata",
    "name",
    "payload",
    "status",
    "text",
    "traceback",
    "user_expressions",
];

/// Stream an output was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamChannel {
    #[default]
    Stdout,
    Stderr,
}

impl fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamChannel::Stdout => write!(f, "stdout"),
            StreamChannel::Stderr => write!(f, "stderr"),
        }
    }
}

/// One normalized result record of a code cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type")]
pub enum Output {
    /// A rendered value, tied to the session's execution counter.
    #[serde(rename = "execute_result")]
    Result {
        data: MediaBundle,
        #[serde(default)]
        metadata: MediaBundle,
        execution_count: Option<u32>,
    },
    #[serde(rename = "stream")]
    Stream {
        #[serde(rename = "name")]
        channel: StreamChannel,
        #[serde(deserialize_with = "deserialize_multiline")]
        text: String,
    },
    #[serde(rename = "display_data")]
    Display {
        data: MediaBundle,
        #[serde(default)]
        metadata: MediaBundle,
    },
    #[serde(rename = "error")]
    Failure {
        #[serde(rename = "ename")]
        kind: String,
        #[serde(rename = "evalue")]
        message: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    pub fn stream(channel: StreamChannel, text: impl Into<String>) -> Self {
        Output::Stream {
            channel,
            text: text.into(),
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Output::Failure {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Plain-text result, used when a reply carries nothing to show.
    pub fn completed(execution_count: u32) -> Self {
        let mut data = MediaBundle::new();
        data.insert(
            "text/plain".to_string(),
            Value::String(COMPLETED_MESSAGE.to_string()),
        );
        Output::Result {
            data,
            metadata: MediaBundle::new(),
            execution_count: Some(execution_count),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Output::Failure { .. })
    }

    /// Failure kind, if this is a failure.
    pub fn failure_kind(&self) -> Option<&str> {
        match self {
            Output::Failure { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Short human-readable label, e.g. for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Output::Result { .. } => "execute_result",
            Output::Stream { .. } => "stream",
            Output::Display { .. } => "display_data",
            Output::Failure { .. } => "error",
        }
    }
}

/// Accepts either a string or an array of strings (nbformat multiline).
fn deserialize_multiline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct MultilineVisitor;

    impl<'de> Visitor<'de> for MultilineVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<String, A::Error> {
            let mut text = String::new();
            while let Some(part) = seq.next_element::<String>()? {
                text.push_str(&part);
            }
            Ok(text)
        }
    }

    deserializer.deserialize_any(MultilineVisitor)
}

/// One piece of an execution reply, before it becomes an [`Output`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFragment {
    Error {
        ename: Option<String>,
        evalue: Option<String>,
        traceback: Vec<String>,
    },
    Display {
        data: MediaBundle,
        metadata: MediaBundle,
    },
    Text {
        channel: StreamChannel,
        text: String,
    },
    Result {
        data: MediaBundle,
        metadata: MediaBundle,
        execution_count: u32,
    },
    /// A field or item the parser does not recognize.
    Unknown { key: String, value: Value },
}

fn unknown(key: &str, value: &Value) -> ResponseFragment {
    ResponseFragment::Unknown {
        key: key.to_string(),
        value: value.clone(),
    }
}

/// Split a raw execution reply into fragments.
///
/// Two shapes are understood: `{"content": {...}}`, where fragments come out
/// in the order page payloads, text, data, error; and `{"outputs": [...]}`,
/// where each item is an nbformat output or a `{msg_type, content}` message.
pub fn parse_execute_reply(reply: &Value) -> Vec<ResponseFragment> {
    let Some(obj) = reply.as_object() else {
        if reply.is_null() {
            return Vec::new();
        }
        return vec![unknown("reply", reply)];
    };

    let mut fragments = Vec::new();
    for (key, value) in obj {
        match key.as_str() {
            "content" => match value.as_object() {
                Some(content) => parse_content(content, &mut fragments),
                None if value.is_null() => {}
                None => fragments.push(unknown(key, value)),
            },
            "outputs" => match value.as_array() {
                Some(items) => fragments.extend(items.iter().map(classify_item)),
                None => fragments.push(unknown(key, value)),
            },
            k if ENVELOPE_KEYS.contains(&k) => {}
            _ => fragments.push(unknown(key, value)),
        }
    }
    fragments
}

fn parse_content(content: &Map<String, Value>, fragments: &mut Vec<ResponseFragment>) {
    if let Some(payload) = content.get("payload") {
        match payload.as_array() {
            Some(items) => fragments.extend(items.iter().map(classify_payload)),
            None => fragments.push(unknown("payload", payload)),
        }
    }

    // Content-level text is plain kernel output and always goes to stdout.
    if let Some(text) = content.get("text") {
        match multiline_text(text) {
            Some(text) => fragments.push(ResponseFragment::Text {
                channel: StreamChannel::Stdout,
                text,
            }),
            None => fragments.push(unknown("text", text)),
        }
    }

    if let Some(data) = content.get("data") {
        match data.as_object() {
            Some(data) => {
                let metadata = object_field(content, "metadata");
                fragments.push(match execution_count_of(content) {
                    Some(execution_count) => ResponseFragment::Result {
                        data: data.clone(),
                        metadata,
                        execution_count,
                    },
                    None => ResponseFragment::Display {
                        data: data.clone(),
                        metadata,
                    },
                });
            }
            None => fragments.push(unknown("data", data)),
        }
    }

    match content.get("error") {
        Some(Value::Object(error)) => fragments.push(error_fragment(error)),
        Some(Value::String(message)) => fragments.push(ResponseFragment::Error {
            ename: None,
            evalue: Some(message.clone()),
            traceback: Vec::new(),
        }),
        Some(Value::Null) | None => {
            if content.contains_key("ename") {
                fragments.push(error_fragment(content));
            }
        }
        Some(other) => fragments.push(unknown("error", other)),
    }

    for (key, value) in content {
        if !CONTENT_KEYS.contains(&key.as_str()) {
            fragments.push(unknown(key, value));
        }
    }
}

fn classify_payload(item: &Value) -> ResponseFragment {
    let source = item.get("source").and_then(Value::as_str);
    match (source, item.get("data").and_then(Value::as_object)) {
        (Some("page"), Some(data)) => ResponseFragment::Display {
            data: data.clone(),
            metadata: item
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        },
        _ => unknown("payload", item),
    }
}

fn classify_item(item: &Value) -> ResponseFragment {
    let Some(obj) = item.as_object() else {
        return unknown("outputs", item);
    };

    // Jupyter message form: {"msg_type": "stream", "content": {...}}
    if let (Some(msg_type), Some(content)) = (
        obj.get("msg_type").and_then(Value::as_str),
        obj.get("content").and_then(Value::as_object),
    ) {
        return classify_output(content, Some(msg_type), item);
    }

    let output_type = obj.get("output_type").and_then(Value::as_str);
    classify_output(obj, output_type, item)
}

/// Priority: error, display, text, result. First match wins.
fn classify_output(
    fields: &Map<String, Value>,
    output_type: Option<&str>,
    raw: &Value,
) -> ResponseFragment {
    let data = fields.get("data").and_then(Value::as_object);
    let execution_count = execution_count_of(fields);

    if output_type == Some("error") || fields.contains_key("ename") {
        return error_fragment(fields);
    }
    if let Some(Value::Object(error)) = fields.get("error") {
        return error_fragment(error);
    }

    if let Some(data) = data {
        let display = matches!(output_type, Some("display_data" | "update_display_data"))
            || execution_count.is_none();
        if display {
            return ResponseFragment::Display {
                data: data.clone(),
                metadata: object_field(fields, "metadata"),
            };
        }
    }

    if let Some(text) = fields.get("text").and_then(multiline_text) {
        return ResponseFragment::Text {
            channel: channel_of(fields),
            text,
        };
    }

    if let (Some(data), Some(execution_count)) = (data, execution_count) {
        return ResponseFragment::Result {
            data: data.clone(),
            metadata: object_field(fields, "metadata"),
            execution_count,
        };
    }

    unknown(output_type.unwrap_or("outputs"), raw)
}

fn error_fragment(fields: &Map<String, Value>) -> ResponseFragment {
    let non_empty = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    ResponseFragment::Error {
        ename: non_empty("ename"),
        evalue: non_empty("evalue"),
        traceback: fields
            .get("traceback")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn multiline_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => parts
            .iter()
            .map(|p| p.as_str())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat()),
        _ => None,
    }
}

fn channel_of(fields: &Map<String, Value>) -> StreamChannel {
    match fields.get("name").and_then(Value::as_str) {
        Some("stderr") => StreamChannel::Stderr,
        _ => StreamChannel::Stdout,
    }
}

fn execution_count_of(fields: &Map<String, Value>) -> Option<u32> {
    fields
        .get("execution_count")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

fn object_field(fields: &Map<String, Value>, key: &str) -> MediaBundle {
    fields
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Outputs and execution count derived from one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReply {
    pub outputs: Vec<Output>,
    pub execution_count: u32,
    pub unknown_fragments: usize,
}

/// Fold fragments into outputs.
///
/// The execution count is the greatest count carried by a result. Without
/// one, it falls back to `previous_count + 1`. That fallback is local
/// bookkeeping and can drift from the session's real counter when several
/// cells run against the same session.
///
/// A reply with no usable fragments still produces one result output, so
/// an empty reply never reads as "did not run".
pub fn normalize(fragments: Vec<ResponseFragment>, previous_count: Option<u32>) -> NormalizedReply {
    let fallback = previous_count.unwrap_or(0).saturating_add(1);
    let mut outputs = Vec::with_capacity(fragments.len());
    let mut unknown_fragments = 0;

    for fragment in fragments {
        match fragment {
            ResponseFragment::Error {
                ename,
                evalue,
                traceback,
            } => outputs.push(Output::Failure {
                kind: ename.unwrap_or_else(|| EXECUTION_ERROR.to_string()),
                message: evalue.unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
                traceback,
            }),
            ResponseFragment::Display { data, metadata } => {
                outputs.push(Output::Display { data, metadata })
            }
            ResponseFragment::Text { channel, text } => outputs.push(Output::Stream { channel, text }),
            ResponseFragment::Result {
                data,
                metadata,
                execution_count,
            } => outputs.push(Output::Result {
                data,
                metadata,
                execution_count: Some(execution_count),
            }),
            ResponseFragment::Unknown { key, value } => {
                warn!("[output] Unrecognized reply fragment '{}': {}", key, value);
                unknown_fragments += 1;
            }
        }
    }

    if outputs.is_empty() {
        outputs.push(Output::completed(fallback));
    }

    let execution_count = outputs
        .iter()
        .filter_map(|o| match o {
            Output::Result {
                execution_count, ..
            } => *execution_count,
            _ => None,
        })
        .max()
        .unwrap_or(fallback);

    NormalizedReply {
        outputs,
        execution_count,
        unknown_fragments,
    }
}

/// [`parse_execute_reply`] followed by [`normalize`].
pub fn normalize_reply(reply: &Value, previous_count: Option<u32>) -> NormalizedReply {
    normalize(parse_execute_reply(reply), previous_count)
}
