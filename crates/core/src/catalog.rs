//! Template catalog loading.
//!
//! Content templates are authored as one YAML file per template:
//!
//! ```yaml
//! template_id: 6f1c2d3e4a5b46c7a8b9c0d1e2f3a4b5
//! name: General SOAP
//! specialty: general
//! is_system: true
//! skeleton:
//!   subjective: {}
//!   objective: {}
//!   assessment: {}
//!   plan: {}
//! ```
//!
//! A directory is scanned before anything is read. Symlinks, special files, excessive nesting
//! and oversized trees are rejected so that a misconfigured path cannot pull in arbitrary files.

use crate::constants::TEMPLATE_FILE_EXTENSIONS;
use crate::document::Document;
use crate::error::{CatalogError, CatalogResult};
use crate::ids::TemplateId;
use crate::lifecycle::Specialty;
use crate::memory::MemoryTemplateStore;
use crate::record::ContentTemplate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const MAX_FILES: usize = 500;
const MAX_TOTAL_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const MAX_DEPTH: usize = 4;

/// On-disk shape of a template definition.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    template_id: String,
    name: String,
    specialty: Specialty,
    #[serde(default)]
    is_system: bool,
    #[serde(default = "empty_skeleton")]
    skeleton: Document,
}

fn empty_skeleton() -> Document {
    Document::empty_object()
}

/// Checks that `dir` is a reasonable template directory and returns its template files in
/// path order.
///
/// # Errors
///
/// Returns [`CatalogError::InvalidDirectory`] if the directory is missing, too large, too deep,
/// or contains symlinks or special files, and [`CatalogError::FileRead`] on I/O failure.
pub fn scan_template_dir(dir: &Path) -> CatalogResult<Vec<PathBuf>> {
    fn scan(
        path: &Path,
        depth: usize,
        bytes: &mut u64,
        found: &mut Vec<PathBuf>,
        files: &mut usize,
    ) -> CatalogResult<()> {
        if depth > MAX_DEPTH {
            return Err(CatalogError::InvalidDirectory(
                "template directory exceeds maximum nesting depth".into(),
            ));
        }

        for entry in std::fs::read_dir(path).map_err(CatalogError::FileRead)? {
            let entry = entry.map_err(CatalogError::FileRead)?;
            let entry_path = entry.path();
            let metadata =
                std::fs::symlink_metadata(&entry_path).map_err(CatalogError::FileRead)?;
            let file_type = metadata.file_type();

            if file_type.is_symlink() {
                return Err(CatalogError::InvalidDirectory(
                    "template directory must not contain symlinks".into(),
                ));
            }

            if file_type.is_file() {
                *files = files.saturating_add(1);
                *bytes = bytes.saturating_add(metadata.len());
                if *files > MAX_FILES || *bytes > MAX_TOTAL_BYTES {
                    return Err(CatalogError::InvalidDirectory(
                        "template directory exceeds maximum file count or total size".into(),
                    ));
                }
                if is_template_file(&entry_path) {
                    found.push(entry_path);
                }
            } else if file_type.is_dir() {
                scan(&entry_path, depth + 1, bytes, found, files)?;
            } else {
                return Err(CatalogError::InvalidDirectory(
                    "template directory contains unsupported file types".into(),
                ));
            }
        }

        Ok(())
    }

    if !dir.is_dir() {
        return Err(CatalogError::InvalidDirectory(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut found = Vec::new();
    let mut files = 0usize;
    let mut bytes = 0u64;
    scan(dir, 0, &mut bytes, &mut found, &mut files)?;
    found.sort();
    Ok(found)
}

fn is_template_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| TEMPLATE_FILE_EXTENSIONS.contains(&ext))
}

/// Strictly parses one template definition from YAML text.
///
/// `file` only labels errors. A new template always starts with a zero usage count.
///
/// # Errors
///
/// Returns [`CatalogError::Schema`] naming the failing field path when the YAML does not match
/// the template shape or the template id is not a canonical UUID.
pub fn parse_template(file: &str, yaml_text: &str) -> CatalogResult<ContentTemplate> {
    let deserializer = serde_yaml::Deserializer::from_str(yaml_text);

    let parsed: TemplateFile = match serde_path_to_error::deserialize(deserializer) {
        Ok(parsed) => parsed,
        Err(err) => {
            let path = err.path().to_string();
            let source = err.into_inner();
            let path = if path.is_empty() || path == "." {
                "<root>".to_string()
            } else {
                path
            };
            return Err(CatalogError::Schema {
                file: file.to_string(),
                path,
                reason: source.to_string(),
            });
        }
    };

    let template_id = TemplateId::parse(&parsed.template_id).map_err(|e| CatalogError::Schema {
        file: file.to_string(),
        path: "template_id".into(),
        reason: e.to_string(),
    })?;

    let name = parsed.name.trim();
    if name.is_empty() {
        return Err(CatalogError::Schema {
            file: file.to_string(),
            path: "name".into(),
            reason: "must not be empty".into(),
        });
    }

    Ok(ContentTemplate {
        template_id,
        name: name.to_string(),
        specialty: parsed.specialty,
        skeleton: parsed.skeleton,
        is_system: parsed.is_system,
        usage_count: 0,
    })
}

/// Loads every template definition under `dir`.
///
/// # Errors
///
/// Fails on the first unreadable or invalid file, or when two files share a template id.
pub fn load_template_dir(dir: &Path) -> CatalogResult<Vec<ContentTemplate>> {
    let mut templates: Vec<ContentTemplate> = Vec::new();

    for path in scan_template_dir(dir)? {
        let text = std::fs::read_to_string(&path).map_err(CatalogError::FileRead)?;
        let label = path
            .strip_prefix(dir)
            .unwrap_or(path.as_path())
            .display()
            .to_string();
        let template = parse_template(&label, &text)?;

        if templates
            .iter()
            .any(|t| t.template_id == template.template_id)
        {
            return Err(CatalogError::DuplicateId(template.template_id.to_string()));
        }
        templates.push(template);
    }

    tracing::debug!(dir = %dir.display(), count = templates.len(), "loaded template definitions");
    Ok(templates)
}

/// Loads every template under `dir` into `store`.
///
/// Nothing is inserted unless the whole directory parses. An id already present in `store`
/// stops the import at that template. Returns the number of templates added.
pub fn import_template_dir(dir: &Path, store: &MemoryTemplateStore) -> CatalogResult<usize> {
    let templates = load_template_dir(dir)?;
    let count = templates.len();
    for template in templates {
        store.insert(template)?;
    }
    tracing::info!(count, "imported content templates");
    Ok(count)
}
