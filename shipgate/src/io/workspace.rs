//! Project workspace access.
//!
//! [`ReviewWorkspace`] is the only view a validating reviewer gets: it can
//! read, list and search, and has no way to write or execute. Writers use
//! [`write_ship_files`] directly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::path::normalize_ship_path;
use crate::core::trust_bundle::ShipFile;

/// Directories never listed, searched or shipped.
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "target", "dist", ".next", ".shipgate"];
const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "rst", "txt"];
const MAX_SEARCH_HITS: usize = 50;

/// One line of documentation that matched a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Read-only inspection interface handed to reviewers.
pub trait ReviewWorkspace {
    fn read_file(&self, path: &str) -> Result<String>;
    /// Normalized relative paths, sorted.
    fn list_files(&self) -> Result<Vec<String>>;
    /// Case-insensitive substring search over documentation files.
    fn search_docs(&self, query: &str) -> Result<Vec<DocMatch>>;
}

/// Review workspace backed by a project directory.
#[derive(Debug, Clone)]
pub struct FsReviewWorkspace {
    root: PathBuf,
}

impl FsReviewWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ReviewWorkspace for FsReviewWorkspace {
    fn read_file(&self, path: &str) -> Result<String> {
        let relative = safe_relative_path(path)?;
        let full = self.root.join(relative);
        fs::read_to_string(&full).with_context(|| format!("read {}", full.display()))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(walk_project(&self.root)?.into_keys().collect())
    }

    fn search_docs(&self, query: &str) -> Result<Vec<DocMatch>> {
        let files = walk_project(&self.root)?;
        let docs = files.into_iter().filter(|(path, _)| is_doc(path));
        let mut hits = Vec::new();
        for (path, full) in docs {
            let Ok(contents) = fs::read_to_string(&full) else {
                warn!(path = %full.display(), "skipping unreadable doc");
                continue;
            };
            hits.extend(search_text(&path, &contents, query));
            if hits.len() >= MAX_SEARCH_HITS {
                break;
            }
        }
        hits.truncate(MAX_SEARCH_HITS);
        Ok(hits)
    }
}

/// Review workspace over an in-memory set of proposed files.
#[derive(Debug, Clone, Default)]
pub struct MemoryReviewWorkspace {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryReviewWorkspace {
    /// Later files replace earlier ones with the same normalized path.
    pub fn new(files: &[ShipFile]) -> Self {
        let files = files
            .iter()
            .map(|file| (normalize_ship_path(&file.path), file.content.clone()))
            .collect();
        Self { files }
    }
}

impl ReviewWorkspace for MemoryReviewWorkspace {
    fn read_file(&self, path: &str) -> Result<String> {
        let bytes = self
            .files
            .get(&normalize_ship_path(path))
            .ok_or_else(|| anyhow!("no such file: {path}"))?;
        String::from_utf8(bytes.clone()).with_context(|| format!("{path} is not a text file"))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }

    fn search_docs(&self, query: &str) -> Result<Vec<DocMatch>> {
        let mut hits = self
            .files
            .iter()
            .filter(|(path, _)| is_doc(path))
            .filter_map(|(path, bytes)| Some((path, std::str::from_utf8(bytes).ok()?)))
            .flat_map(|(path, contents)| search_text(path, contents, query))
            .collect::<Vec<_>>();
        hits.truncate(MAX_SEARCH_HITS);
        Ok(hits)
    }
}

/// Read every shippable file under `root` as raw bytes.
pub fn collect_ship_files(root: &Path) -> Result<Vec<ShipFile>> {
    let mut files = Vec::new();
    for (path, full) in walk_project(root)? {
        let content = fs::read(&full).with_context(|| format!("read {}", full.display()))?;
        files.push(ShipFile { path, content });
    }
    debug!(root = %root.display(), count = files.len(), "collected ship files");
    Ok(files)
}

/// Write `files` below `root`, creating directories as needed. Paths that
/// would escape `root` are refused before anything is written.
pub fn write_ship_files(root: &Path, files: &[ShipFile]) -> Result<()> {
    let targets = files
        .iter()
        .map(|file| Ok((root.join(safe_relative_path(&file.path)?), file)))
        .collect::<Result<Vec<_>>>()?;
    for (full, file) in targets {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&full, &file.content).with_context(|| format!("write {}", full.display()))?;
    }
    debug!(root = %root.display(), count = files.len(), "wrote ship files");
    Ok(())
}

/// Normalized relative path → absolute path, sorted.
fn walk_project(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    if !root.is_dir() {
        bail!("project directory not found: {}", root.display());
    }
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(entry.file_type().is_dir()
                && EXCLUDED_DIRS
                    .iter()
                    .any(|excluded| entry.file_name().to_string_lossy() == *excluded))
    });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping path due to I/O error");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let normalized = normalize_ship_path(&relative.to_string_lossy());
        files.insert(normalized, entry.path().to_path_buf());
    }
    Ok(files)
}

fn safe_relative_path(path: &str) -> Result<PathBuf> {
    let normalized = normalize_ship_path(path);
    if normalized.is_empty() {
        bail!("empty path");
    }
    let relative = PathBuf::from(&normalized);
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        bail!("path escapes the project: {path}");
    }
    Ok(relative)
}

fn is_doc(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| DOC_EXTENSIONS.contains(&ext.as_str()))
}

fn search_text(path: &str, contents: &str, query: &str) -> Vec<DocMatch> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| line.to_lowercase().contains(&needle))
        .map(|(index, line)| DocMatch {
            path: path.to_string(),
            line: index + 1,
            text: line.trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trust_bundle::{build_file_manifest, content_hash};

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src/app")).expect("mkdir");
        fs::create_dir_all(root.join("docs")).expect("mkdir");
        fs::create_dir_all(root.join("node_modules/pkg")).expect("mkdir");
        fs::create_dir_all(root.join(".shipgate")).expect("mkdir");
        fs::write(root.join("src/app/page.tsx"), "export default function Page() {}").expect("write");
        fs::write(root.join("docs/ARCHITECTURE.md"), "# Arch\nAuth lives in src/auth.\n").expect("write");
        fs::write(root.join("README.md"), "Run `npm dev`.\n").expect("write");
        fs::write(root.join("node_modules/pkg/index.js"), "auth").expect("write");
        fs::write(root.join(".shipgate/trust-bundle.json"), "{}").expect("write");
        temp
    }

    #[test]
    fn list_files_skips_excluded_dirs() {
        let temp = project();
        let workspace = FsReviewWorkspace::new(temp.path());
        assert_eq!(
            workspace.list_files().expect("list"),
            vec![
                "README.md".to_string(),
                "docs/ARCHITECTURE.md".to_string(),
                "src/app/page.tsx".to_string()
            ]
        );
    }

    #[test]
    fn search_docs_is_case_insensitive_and_docs_only() {
        let temp = project();
        let workspace = FsReviewWorkspace::new(temp.path());
        let hits = workspace.search_docs("AUTH").expect("search");
        assert_eq!(
            hits,
            vec![DocMatch {
                path: "docs/ARCHITECTURE.md".to_string(),
                line: 2,
                text: "Auth lives in src/auth.".to_string(),
            }]
        );
        assert!(workspace.search_docs("  ").expect("search").is_empty());
    }

    #[test]
    fn read_file_refuses_to_escape_root() {
        let temp = project();
        let workspace = FsReviewWorkspace::new(temp.path().join("src"));
        assert!(workspace.read_file("app/page.tsx").is_ok());
        assert!(workspace.read_file("../README.md").is_err());
        assert!(workspace.read_file("app/../../README.md").is_err());
    }

    #[test]
    fn collect_then_write_reproduces_files() {
        let source = project();
        let files = collect_ship_files(source.path()).expect("collect");
        assert_eq!(files.len(), 3);

        let dest = tempfile::tempdir().expect("tempdir");
        write_ship_files(dest.path(), &files).expect("write");
        let copied = collect_ship_files(dest.path()).expect("collect copy");
        assert_eq!(copied, files);
    }

    #[test]
    fn write_refuses_escaping_paths_before_writing_anything() {
        let dest = tempfile::tempdir().expect("tempdir");
        let files = vec![
            ShipFile::new("ok.txt", "fine"),
            ShipFile::new("../evil.txt", "nope"),
        ];
        assert!(write_ship_files(dest.path(), &files).is_err());
        assert!(!dest.path().join("ok.txt").exists());
    }

    #[test]
    fn memory_workspace_reads_normalized_paths() {
        let workspace = MemoryReviewWorkspace::new(&[
            ShipFile::new("src\\lib.ts", "old"),
            ShipFile::new("/src/lib.ts", "new"),
            ShipFile::new("NOTES.md", "Payments are handled by stripe"),
        ]);
        assert_eq!(workspace.read_file("src/lib.ts").expect("read"), "new");
        assert_eq!(workspace.list_files().expect("list").len(), 2);
        assert_eq!(workspace.search_docs("Stripe").expect("search").len(), 1);
        assert!(workspace.read_file("missing.ts").is_err());
    }

    #[test]
    fn binary_files_are_collected_and_manifested() {
        const LOGO: [u8; 7] = [0x89, 0x50, 0x4e, 0x47, 0xff, 0xfe, 0x00];
        let source = project();
        fs::create_dir_all(source.path().join("public")).expect("mkdir");
        fs::write(source.path().join("public/logo.png"), LOGO).expect("write logo");

        let files = collect_ship_files(source.path()).expect("collect");
        let logo = files
            .iter()
            .find(|file| file.path == "public/logo.png")
            .expect("binary file collected");
        assert_eq!(logo.content, LOGO);

        let manifest = build_file_manifest(&files);
        let entry = manifest
            .iter()
            .find(|entry| entry.path == "public/logo.png")
            .expect("binary file in manifest");
        assert_eq!(entry.content_hash, content_hash(&LOGO));

        let dest = tempfile::tempdir().expect("tempdir");
        write_ship_files(dest.path(), &files).expect("write");
        assert_eq!(fs::read(dest.path().join("public/logo.png")).expect("read"), LOGO);

        let workspace = MemoryReviewWorkspace::new(&files);
        assert!(workspace.read_file("public/logo.png").is_err());
        assert!(workspace.read_file("README.md").is_ok());
    }
}
