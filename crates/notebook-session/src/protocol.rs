//! Wire types for the Jupyter server REST API.
//!
//! Kernel and content models are deserialized leniently: the server is a
//! collaborator we do not control, so every field that can be missing has a
//! default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kernel descriptor as returned by `GET /kernels` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    /// Kernelspec name, e.g. `python3`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<u32>,
    /// Not part of the stock Jupyter model; some proxies add it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl KernelModel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            execution_state: None,
            last_activity: None,
            connections: None,
            language: None,
        }
    }

    /// Language of the kernel, derived from the kernelspec name when the
    /// server does not say.
    pub fn language(&self) -> String {
        self.language
            .clone()
            .unwrap_or_else(|| language_for_kernel_name(&self.name))
    }
}

/// Map a kernelspec name to the language it runs.
pub fn language_for_kernel_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("python") {
        "python".to_string()
    } else if lower == "ir" {
        "r".to_string()
    } else if lower.starts_with("julia") {
        "julia".to_string()
    } else if lower == "deno" {
        "typescript".to_string()
    } else {
        lower
    }
}

/// Map a language hint to the kernelspec to start for it.
pub fn kernel_name_for_language(language: &str) -> String {
    match language.to_ascii_lowercase().as_str() {
        "python" | "py" => "python3".to_string(),
        "r" => "ir".to_string(),
        "typescript" | "javascript" => "deno".to_string(),
        other => other.to_string(),
    }
}

/// Body of `POST /kernels`.
#[derive(Debug, Clone, Serialize)]
pub struct StartKernelRequest {
    pub name: String,
    pub path: String,
}

/// Body of `POST /kernels/{id}/execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: serde_json::Map<String, serde_json::Value>,
    pub allow_stdin: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: serde_json::Map::new(),
            allow_stdin: false,
        }
    }
}

/// Response of `GET /status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub kernels: u32,
}

/// Content type reported by the contents API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Notebook,
    File,
    Directory,
}

/// A contents API entry, without its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_writable() -> bool {
    true
}

impl ContentEntry {
    /// Whether the listing should offer this entry as a notebook.
    pub fn is_notebook(&self) -> bool {
        self.content_type == ContentType::Notebook || self.path.ends_with(".ipynb")
    }
}

/// A contents API entry with its body, as returned by `GET /contents/{path}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentModel {
    #[serde(flatten)]
    pub entry: ContentEntry,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Body of `PUT /contents/{path}` for notebooks.
#[derive(Debug, Clone, Serialize)]
pub struct SaveNotebookRequest<'a> {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub format: &'static str,
    pub content: &'a serde_json::Value,
}

impl<'a> SaveNotebookRequest<'a> {
    pub fn new(content: &'a serde_json::Value) -> Self {
        Self {
            content_type: ContentType::Notebook,
            format: "json",
            content,
        }
    }
}

/// An empty nbformat 4.5 document, as written for freshly created notebooks.
pub fn empty_notebook_json() -> serde_json::Value {
    serde_json::json!({
        "cells": [],
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 5
    })
}
