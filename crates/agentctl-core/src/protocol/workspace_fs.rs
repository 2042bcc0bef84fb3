//! Filesystem requests agents are allowed to make.
//!
//! ACP agents may ask the client to read and write text files. Paths must
//! be absolute and resolve (after following symlinks) to somewhere inside
//! the execution's workspace root; anything else is rejected with invalid
//! params. Writes create missing parent directories with mode 0755 and
//! files with mode 0644.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use super::jsonrpc::RpcErrorObject;

/// Resolve and validate a request path against the workspace root.
///
/// The deepest existing ancestor is canonicalised so symlinks cannot step
/// outside the root even for not-yet-existing files.
fn confine(workspace_root: &Path, raw: &str) -> Result<PathBuf, RpcErrorObject> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(RpcErrorObject::invalid_params(format!(
            "path must be absolute: {raw}"
        )));
    }

    let root = workspace_root.canonicalize().map_err(|e| {
        RpcErrorObject::internal(format!(
            "workspace root {} is not accessible: {e}",
            workspace_root.display()
        ))
    })?;

    // Walk up to the deepest existing ancestor, canonicalise it, then
    // re-append the non-existing tail.
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_owned());
                existing = parent.to_path_buf();
            }
            _ => {
                return Err(RpcErrorObject::invalid_params(format!(
                    "path has no existing ancestor: {raw}"
                )));
            }
        }
    }

    let mut resolved = existing.canonicalize().map_err(|e| {
        RpcErrorObject::invalid_params(format!("cannot resolve path {raw}: {e}"))
    })?;
    for segment in tail.iter().rev() {
        resolved.push(segment);
    }

    if !resolved.starts_with(&root) {
        return Err(RpcErrorObject::invalid_params(format!(
            "path {raw} escapes the workspace root"
        )));
    }

    Ok(resolved)
}

/// Serve `fs/read_text_file`.
///
/// Params: `path` (absolute), optional `line` (1-based start) and `limit`
/// (max lines). Returns `{"content": ...}`.
pub fn read_text_file(workspace_root: &Path, params: &Value) -> Result<Value, RpcErrorObject> {
    let raw = params
        .get("path")
        .and_then(|p| p.as_str())
        .ok_or_else(|| RpcErrorObject::invalid_params("missing path"))?;

    let path = confine(workspace_root, raw)?;

    let content = std::fs::read_to_string(&path)
        .map_err(|e| RpcErrorObject::invalid_params(format!("cannot read {raw}: {e}")))?;

    let line = params.get("line").and_then(|l| l.as_u64());
    let limit = params.get("limit").and_then(|l| l.as_u64());

    let content = match (line, limit) {
        (None, None) => content,
        (line, limit) => {
            let start = line.unwrap_or(1).saturating_sub(1) as usize;
            let sliced: Vec<&str> = content
                .lines()
                .skip(start)
                .take(limit.unwrap_or(u64::MAX) as usize)
                .collect();
            sliced.join("\n")
        }
    };

    Ok(json!({"content": content}))
}

/// Serve `fs/write_text_file`.
///
/// Params: `path` (absolute), `content`. Returns `null` on success.
pub fn write_text_file(workspace_root: &Path, params: &Value) -> Result<Value, RpcErrorObject> {
    let raw = params
        .get("path")
        .and_then(|p| p.as_str())
        .ok_or_else(|| RpcErrorObject::invalid_params("missing path"))?;
    let content = params
        .get("content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| RpcErrorObject::invalid_params("missing content"))?;

    let path = confine(workspace_root, raw)?;

    if let Some(parent) = path.parent() {
        create_dirs(parent)
            .map_err(|e| RpcErrorObject::internal(format!("cannot create {raw} parents: {e}")))?;
    }

    std::fs::write(&path, content)
        .map_err(|e| RpcErrorObject::internal(format!("cannot write {raw}: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644));
    }

    Ok(Value::Null)
}

#[cfg(unix)]
fn create_dirs(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_dirs(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
