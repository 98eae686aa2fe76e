//! Image tag rewriting for YAML manifests
//!
//! Images are located on the parsed tree, then the matching lines of the
//! original text are edited so comments and layout survive. When the edited
//! text does not parse back to the rewritten tree the documents are
//! re-serialized instead.

use once_cell::sync::Lazy;
use ponos_core::{ImageUpgrade, PonosError, Result};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use tracing::debug;

/// Keys naming the repository inside an `image` mapping.
const REPOSITORY_KEYS: [&str; 2] = ["repository", "repo"];

// image: repo:tag   /   - image: "repo:tag"  # comment
static SCALAR_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(\s*(?:-\s+)?image:\s+)(["']?)([^\s"'#]+)(["']?)(\s*(?:#.*)?)$"#)
        .expect("Invalid regex pattern")
});

// image:   (a block mapping follows)
static IMAGE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)(-\s+)?image:\s*(?:#.*)?$").expect("Invalid regex pattern")
});

static BLOCK_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(\s*)(repository|repo|tag)(:\s*)(["']?)([^\s"'#]*)(["']?)(\s*(?:#.*)?)$"#)
        .expect("Invalid regex pattern")
});

/// A manifest with at least one image rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRewrite {
    pub content: String,
    pub upgrades: Vec<ImageUpgrade>,
}

/// Split an image reference into repository and tag.
///
/// A registry port is not a tag: `registry:5000/app` has none. Digests are
/// dropped.
pub fn split_image(image: &str) -> (&str, Option<&str>) {
    let reference = image.split('@').next().unwrap_or(image);
    match reference.rfind(':') {
        Some(i) if !reference[i..].contains('/') => (&reference[..i], Some(&reference[i + 1..])),
        _ => (reference, None),
    }
}

/// Point every `image` in `yaml` whose repository is a key of `tags` at the
/// mapped tag.
///
/// `image: repo:tag` scalars and `image: {repository|repo, tag}` mappings are
/// rewritten, at any depth and in every document of the file. Returns `None`
/// when nothing changed.
pub fn rewrite_image_tags(
    file: &str,
    yaml: &str,
    tags: &HashMap<String, String>,
) -> Result<Option<ManifestRewrite>> {
    let mut documents = parse_documents(file, yaml)?;

    let mut upgrades = Vec::new();
    for document in &mut documents {
        visit(document, file, tags, &mut upgrades);
    }
    if upgrades.is_empty() {
        return Ok(None);
    }

    let edited = edit_in_place(yaml, tags);
    let content = match parse_documents(file, &edited) {
        Ok(reparsed) if reparsed == documents => edited,
        _ => {
            debug!("{}: in-place edit diverged, re-serializing", file);
            let mut rendered = Vec::with_capacity(documents.len());
            for document in &documents {
                rendered.push(serde_yaml::to_string(document).map_err(|e| manifest_error(file, e))?);
            }
            rendered.join("---\n")
        }
    };

    Ok(Some(ManifestRewrite { content, upgrades }))
}

fn parse_documents(file: &str, yaml: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        documents.push(Value::deserialize(document).map_err(|e| manifest_error(file, e))?);
    }
    Ok(documents)
}

/// Rewrite image lines of the original text, leaving every other line as is.
fn edit_in_place(yaml: &str, tags: &HashMap<String, String>) -> String {
    let mut lines: Vec<String> = yaml.split_inclusive('\n').map(str::to_string).collect();

    for line in &mut lines {
        if let Some(edited) = retag_scalar_line(line, tags) {
            *line = edited;
        }
    }

    let mut edits = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let (body, _) = split_ending(line);
        let Some(key) = IMAGE_BLOCK.captures(body) else {
            continue;
        };
        let key_indent = key[1].len() + key.get(2).map_or(0, |dash| dash.as_str().len());

        let mut child_indent = None;
        let mut repo = None;
        let mut tag_line = None;
        for (j, child) in lines.iter().enumerate().skip(i + 1) {
            let (child_body, _) = split_ending(child);
            let trimmed = child_body.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = child_body.len() - trimmed.len();
            if indent <= key_indent {
                break;
            }
            if *child_indent.get_or_insert(indent) != indent {
                continue;
            }
            if let Some(field) = BLOCK_FIELD.captures(child_body) {
                match &field[2] {
                    "tag" => tag_line = Some(j),
                    _ => repo = Some(field[5].to_string()),
                }
            }
        }

        if let (Some(repo), Some(j)) = (repo, tag_line) {
            if let Some(new_tag) = tags.get(&repo) {
                if let Some(edited) = retag_field_line(&lines[j], new_tag) {
                    edits.push((j, edited));
                }
            }
        }
    }
    for (j, edited) in edits {
        lines[j] = edited;
    }

    lines.concat()
}

fn retag_scalar_line(line: &str, tags: &HashMap<String, String>) -> Option<String> {
    let (body, ending) = split_ending(line);
    let c = SCALAR_IMAGE.captures(body)?;
    let image = &c[3];
    let (repo, tag) = split_image(image);
    let new_tag = tags.get(repo)?;
    if tag == Some(new_tag.as_str()) && !image.contains('@') {
        return None;
    }
    Some(format!(
        "{}{}{}:{}{}{}{}",
        &c[1], &c[2], repo, new_tag, &c[4], &c[5], ending
    ))
}

fn retag_field_line(line: &str, new_tag: &str) -> Option<String> {
    let (body, ending) = split_ending(line);
    let c = BLOCK_FIELD.captures(body)?;
    Some(format!(
        "{}{}{}{}{}{}{}{}",
        &c[1], &c[2], &c[3], &c[4], new_tag, &c[6], &c[7], ending
    ))
}

fn split_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn visit(
    value: &mut Value,
    file: &str,
    tags: &HashMap<String, String>,
    upgrades: &mut Vec<ImageUpgrade>,
) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                if key.as_str() == Some("image") {
                    match child {
                        Value::String(image) => {
                            if let Some(upgrade) = retag(file, image, tags) {
                                *image = upgrade.new_image.clone();
                                upgrades.push(upgrade);
                            }
                            continue;
                        }
                        Value::Mapping(fields) => retag_fields(file, fields, tags, upgrades),
                        _ => {}
                    }
                }
                visit(child, file, tags, upgrades);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                visit(item, file, tags, upgrades);
            }
        }
        Value::Tagged(tagged) => visit(&mut tagged.value, file, tags, upgrades),
        _ => {}
    }
}

fn retag(file: &str, image: &str, tags: &HashMap<String, String>) -> Option<ImageUpgrade> {
    let (repo, tag) = split_image(image);
    let new_tag = tags.get(repo)?;
    if tag == Some(new_tag.as_str()) && !image.contains('@') {
        return None;
    }
    Some(ImageUpgrade {
        file: file.to_string(),
        old_image: image.to_string(),
        new_image: format!("{}:{}", repo, new_tag),
    })
}

// `image: {repository: parity/polkadot, tag: v1.0.0}`, or `repo:` in place of `repository:`
fn retag_fields(
    file: &str,
    fields: &mut Mapping,
    tags: &HashMap<String, String>,
    upgrades: &mut Vec<ImageUpgrade>,
) {
    let Some(repo) = REPOSITORY_KEYS
        .iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_string)
    else {
        return;
    };
    let Some(new_tag) = tags.get(&repo) else {
        return;
    };
    let old_tag = fields.get("tag").and_then(scalar_text);
    if old_tag.as_deref() == Some(new_tag.as_str()) {
        return;
    }

    fields.insert(Value::from("tag"), Value::from(new_tag.as_str()));
    upgrades.push(ImageUpgrade {
        file: file.to_string(),
        old_image: match old_tag {
            Some(tag) => format!("{}:{}", repo, tag),
            None => repo.clone(),
        },
        new_image: format!("{}:{}", repo, new_tag),
    });
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn manifest_error(file: &str, e: serde_yaml::Error) -> PonosError {
    PonosError::Manifest {
        file: file.to_string(),
        reason: e.to_string(),
    }
}
