use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use gauntlet_core::types::{detect_language, SourceFile};

/// Directories never worth sending to a reviewer.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
];

/// Read every recognised code file under `paths`, recursing into directories.
/// Files are returned sorted by path.
pub fn collect_files(paths: &[PathBuf]) -> anyhow::Result<Vec<SourceFile>> {
    let mut found = Vec::new();
    for path in paths {
        if !path.exists() {
            anyhow::bail!("path not found: {}", path.display());
        }
        walk(path, &mut found)?;
    }
    found.sort();
    found.dedup();

    let mut files = Vec::with_capacity(found.len());
    for path in found {
        match std::fs::read_to_string(&path) {
            Ok(content) => files.push(SourceFile::new(path.display().to_string(), content)),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable file"),
        }
    }
    debug!(count = files.len(), "Collected source files");
    Ok(files)
}

fn walk(path: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if path.is_file() {
        if is_code_file(path) {
            out.push(path.to_path_buf());
        }
        return Ok(());
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let child = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = entry.file_type()?;
        if file_type.is_symlink() && child.is_dir() {
            debug!(path = %child.display(), "Skipping symlinked directory");
            continue;
        }
        if file_type.is_dir() {
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk(&child, out)?;
        } else if is_code_file(&child) {
            out.push(child);
        }
    }
    Ok(())
}

fn is_code_file(path: &Path) -> bool {
    path.to_str()
        .is_some_and(|p| detect_language(p) != "Unknown")
}

/// Built-in sample files for `gauntlet demo`.
pub fn sample_files() -> Vec<SourceFile> {
    vec![
        SourceFile::new(
            "calculator.py",
            r#"def divide(a, b):
    return a / b

def calculate_average(numbers):
    total = 0
    for num in numbers:
        total = total + num
    return total / len(numbers)

class Calculator:
    def __init__(self):
        self.history = []

    def add(self, x, y):
        result = x + y
        self.history.append(f"{x} + {y} = {result}")
        return result
"#,
        ),
        SourceFile::new(
            "src/config.rs",
            r#"pub fn port() -> u16 {
    std::env::var("PORT").unwrap().parse().unwrap()
}
"#,
        ),
    ]
}
