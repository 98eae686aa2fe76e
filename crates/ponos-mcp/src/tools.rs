//! Typed repository operations over the generic tool call
//!
//! Results arrive as `{content: [{text: "<json>"}]}`. The outer shape is
//! decoded by [`decode_tool_result`]; the per-operation helpers here unwrap
//! the embedded JSON document and pick out the field each operation needs.

use base64::Engine;
use ponos_core::{FileUpdate, PonosError, Result};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::client::ToolClient;
use crate::types::ToolCallResult;

pub const GET_FILE_CONTENTS: &str = "get_file_contents";
pub const CREATE_BRANCH: &str = "create_branch";
pub const PUSH_FILES: &str = "push_files";
pub const CREATE_PULL_REQUEST: &str = "create_pull_request";
pub const CREATE_OR_UPDATE_FILE: &str = "create_or_update_file";

impl ToolClient {
    /// Read one file, optionally at a branch, tag or commit.
    pub async fn get_file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<String> {
        let mut args = repo_args(owner, repo)?;
        args.insert("path".into(), json!(require("path", path)?));
        if let Some(git_ref) = git_ref.filter(|r| !r.trim().is_empty()) {
            args.insert("ref".into(), json!(git_ref));
        }

        let result = self.call_tool_decoded(GET_FILE_CONTENTS, Value::Object(args)).await?;
        file_text(&result)
    }

    /// Create `branch`; an existing branch of that name counts as success.
    pub async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_branch: Option<&str>,
    ) -> Result<()> {
        let mut args = repo_args(owner, repo)?;
        args.insert("branch".into(), json!(require("branch", branch)?));
        if let Some(from) = from_branch.filter(|b| !b.trim().is_empty()) {
            args.insert("from_branch".into(), json!(from));
        }

        match self.call_tool_decoded(CREATE_BRANCH, Value::Object(args)).await {
            Ok(_) => {
                info!("Created branch {} in {}/{}", branch, owner, repo);
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                info!("Branch {} already exists in {}/{}, continuing", branch, owner, repo);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Commit several files to `branch` in one commit; returns the commit SHA.
    pub async fn push_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        message: &str,
        files: &[FileUpdate],
    ) -> Result<String> {
        let mut args = repo_args(owner, repo)?;
        args.insert("branch".into(), json!(require("branch", branch)?));
        args.insert("message".into(), json!(require("message", message)?));
        if files.is_empty() {
            return Err(PonosError::InvalidArgument {
                field: "files",
                reason: "at least one file is required".into(),
            });
        }
        for file in files {
            require("files.path", &file.path)?;
        }
        args.insert("files".into(), serde_json::to_value(files)?);

        let result = self.call_tool_decoded(PUSH_FILES, Value::Object(args)).await?;
        let doc = embedded_json(PUSH_FILES, &result)?;
        let sha = string_at(&doc, &["object", "sha"])
            .or_else(|| string_at(&doc, &["sha"]))
            .ok_or(PonosError::UnexpectedShape {
                operation: PUSH_FILES,
                field: "object.sha",
            })?;

        debug!("Pushed {} file(s) to {}/{}@{}: {}", files.len(), owner, repo, branch, sha);
        Ok(sha)
    }

    /// Open a pull request; returns its web URL.
    pub async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let mut args = repo_args(owner, repo)?;
        args.insert("head".into(), json!(require("head", head)?));
        args.insert("base".into(), json!(require("base", base)?));
        args.insert("title".into(), json!(require("title", title)?));
        args.insert("body".into(), json!(body));

        let result = self
            .call_tool_decoded(CREATE_PULL_REQUEST, Value::Object(args))
            .await?;
        let doc = embedded_json(CREATE_PULL_REQUEST, &result)?;
        string_at(&doc, &["html_url"])
            .or_else(|| string_at(&doc, &["url"]))
            .ok_or(PonosError::UnexpectedShape {
                operation: CREATE_PULL_REQUEST,
                field: "html_url",
            })
    }

    /// Write a single file; `sha` is the blob being replaced when updating.
    /// Returns the commit SHA.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_or_update_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
        sha: Option<&str>,
    ) -> Result<String> {
        let mut args = repo_args(owner, repo)?;
        args.insert("path".into(), json!(require("path", path)?));
        args.insert("content".into(), json!(content));
        args.insert("message".into(), json!(require("message", message)?));
        args.insert("branch".into(), json!(require("branch", branch)?));
        if let Some(sha) = sha.filter(|s| !s.is_empty()) {
            args.insert("sha".into(), json!(sha));
        }

        let result = self
            .call_tool_decoded(CREATE_OR_UPDATE_FILE, Value::Object(args))
            .await?;
        let doc = embedded_json(CREATE_OR_UPDATE_FILE, &result)?;
        string_at(&doc, &["commit", "sha"]).ok_or(PonosError::UnexpectedShape {
            operation: CREATE_OR_UPDATE_FILE,
            field: "commit.sha",
        })
    }
}

fn require<'a>(field: &'static str, value: &'a str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(PonosError::InvalidArgument {
            field,
            reason: "must not be empty".into(),
        });
    }
    Ok(value)
}

fn repo_args(owner: &str, repo: &str) -> Result<Map<String, Value>> {
    let mut args = Map::new();
    args.insert("owner".into(), json!(require("owner", owner)?));
    args.insert("repo".into(), json!(require("repo", repo)?));
    Ok(args)
}

/// Second decode stage: parse the JSON document carried as text.
pub fn embedded_json(operation: &'static str, result: &ToolCallResult) -> Result<Value> {
    let text = result.first_text().ok_or(PonosError::UnexpectedShape {
        operation,
        field: "content[0].text",
    })?;
    serde_json::from_str(text).map_err(|e| {
        PonosError::Protocol(format!("{}: content text is not JSON: {}", operation, e))
    })
}

/// File body from a `get_file_contents` result.
///
/// Servers either embed the file as a text resource or return the contents
/// API document, whose `content` may be base64 encoded.
pub fn file_text(result: &ToolCallResult) -> Result<String> {
    let embedded = result
        .content
        .iter()
        .filter_map(|item| item.resource.as_ref())
        .find_map(|resource| resource.text.clone());
    if let Some(text) = embedded {
        return Ok(text);
    }

    let shape_error = PonosError::UnexpectedShape {
        operation: GET_FILE_CONTENTS,
        field: "content",
    };
    let doc = match result.first_text().map(serde_json::from_str::<Value>) {
        Some(Ok(doc)) => doc,
        _ => return Err(shape_error),
    };
    let content = match string_at(&doc, &["content"]) {
        Some(content) => content,
        None => return Err(shape_error),
    };

    match doc.get("encoding").and_then(Value::as_str) {
        Some("base64") => decode_base64(&content),
        _ => Ok(content),
    }
}

fn decode_base64(content: &str) -> Result<String> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| PonosError::Protocol(format!("file content is not valid base64: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| PonosError::Protocol(format!("file content is not UTF-8: {}", e)))
}

fn string_at(doc: &Value, path: &[&str]) -> Option<String> {
    let mut current = doc;
    for key in path {
        current = current.get(key)?;
    }
    current
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Whether a failed branch creation means the branch is already there.
///
/// Structured signals (HTTP 422 or an `already_exists` code in the error
/// data) are checked first. Message matching is a best-effort fallback for
/// servers that only report text.
pub fn is_already_exists(error: &PonosError) -> bool {
    let message = match error {
        PonosError::Rpc { message, data, .. } => {
            if data.as_ref().map(has_already_exists_data).unwrap_or(false) {
                return true;
            }
            message
        }
        PonosError::ToolFailed { message, .. } => message,
        _ => return false,
    };

    let message = message.to_lowercase();
    message.contains("reference already exists")
        || message.contains("already exists")
        || message.contains("422")
}

fn has_already_exists_data(data: &Value) -> bool {
    let status = data.get("status").and_then(|s| {
        s.as_u64()
            .or_else(|| s.as_str().and_then(|s| s.parse().ok()))
    });
    if status == Some(422) {
        return true;
    }

    let is_code = |v: &Value| v.get("code").and_then(Value::as_str) == Some("already_exists");
    is_code(data)
        || data
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| errors.iter().any(is_code))
            .unwrap_or(false)
}
