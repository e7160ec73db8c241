//! Language-specific, line-anchored regex symbol extraction (§4.4).
//!
//! Grounded in `original_source/refactor_bot/indexer/symbols.py` for the
//! pattern table, the exported-ness heuristic, and the registry shape — with
//! `symbols_by_kind` used in place of the original's `symbols_by_type` to
//! match spec §4.4's field name, and fresh patterns authored for c/cpp, cs,
//! rb, php and lua, which the original's pattern table never covered.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::IndexError;
use crate::util::{count_lines, file_hash};

/// One of the eleven symbol kinds named in spec §3's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolType {
    Function,
    Class,
    Method,
    Interface,
    Type,
    Constant,
    Variable,
    Enum,
    Module,
    Import,
    Export,
}

impl SymbolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Interface => "interface",
            Self::Type => "type",
            Self::Constant => "constant",
            Self::Variable => "variable",
            Self::Enum => "enum",
            Self::Module => "module",
            Self::Import => "import",
            Self::Export => "export",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    #[serde(rename = "type")]
    pub symbol_type: SymbolType,
    #[serde(rename = "file")]
    pub file_path: String,
    #[serde(rename = "line")]
    pub line_number: usize,
    pub signature: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    pub exported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub relative_path: String,
    pub hash: String,
    pub size_bytes: u64,
    pub line_count: usize,
    pub language: Option<String>,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
}

/// `SYMBOL_REGISTRY` contents per spec §4.4: version, totals, a per-kind
/// count breakdown, and the flat symbol list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SymbolRegistry {
    pub version: String,
    pub file_count: usize,
    pub symbol_count: usize,
    pub symbols_by_kind: HashMap<String, usize>,
    pub symbols: Vec<Symbol>,
}

fn extension_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    Some(match ext.as_str() {
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "rs" => "rust",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "lua" => "lua",
        "gd" => "gdscript",
        _ => return None,
    })
}

type PatternTable = Vec<(SymbolType, Regex)>;

fn pattern_tables() -> &'static HashMap<&'static str, PatternTable> {
    static TABLES: OnceLock<HashMap<&'static str, PatternTable>> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut tables = HashMap::new();
        let compile = |specs: &[(SymbolType, &str)]| -> PatternTable {
            specs
                .iter()
                .map(|(kind, pattern)| (*kind, Regex::new(pattern).expect("static pattern compiles")))
                .collect()
        };

        use SymbolType::*;

        tables.insert(
            "python",
            compile(&[
                (Function, r"^def\s+(\w+)\s*\("),
                (Class, r"^class\s+(\w+)\s*[\(:]"),
                (Method, r"^\s+def\s+(\w+)\s*\("),
                (Constant, r"^([A-Z][A-Z_0-9]+)\s*="),
            ]),
        );
        tables.insert(
            "javascript",
            compile(&[
                (Function, r"^(?:export\s+)?(?:async\s+)?function\s+(\w+)\s*\("),
                (Function, r"^(?:export\s+)?const\s+(\w+)\s*=\s*(?:async\s+)?\("),
                (Function, r"^(?:export\s+)?const\s+(\w+)\s*=\s*(?:async\s+)?function"),
                (Class, r"^(?:export\s+)?class\s+(\w+)"),
                (Constant, r"^(?:export\s+)?const\s+([A-Z][A-Z_0-9]+)\s*="),
            ]),
        );
        tables.insert(
            "typescript",
            compile(&[
                (Function, r"^(?:export\s+)?(?:async\s+)?function\s+(\w+)"),
                (Function, r"^(?:export\s+)?const\s+(\w+)\s*=\s*(?:async\s+)?\("),
                (Class, r"^(?:export\s+)?class\s+(\w+)"),
                (Interface, r"^(?:export\s+)?interface\s+(\w+)"),
                (Type, r"^(?:export\s+)?type\s+(\w+)\s*="),
                (Enum, r"^(?:export\s+)?enum\s+(\w+)"),
            ]),
        );
        tables.insert(
            "rust",
            compile(&[
                (Function, r"^(?:pub\s+)?(?:async\s+)?fn\s+(\w+)"),
                (Class, r"^(?:pub\s+)?struct\s+(\w+)"),
                (Interface, r"^(?:pub\s+)?trait\s+(\w+)"),
                (Enum, r"^(?:pub\s+)?enum\s+(\w+)"),
                (Type, r"^(?:pub\s+)?type\s+(\w+)\s*="),
                (Constant, r"^(?:pub\s+)?const\s+(\w+):"),
            ]),
        );
        tables.insert(
            "go",
            compile(&[
                (Function, r"^func\s+(\w+)\s*\("),
                (Method, r"^func\s+\([^)]+\)\s+(\w+)\s*\("),
                (Class, r"^type\s+(\w+)\s+struct"),
                (Interface, r"^type\s+(\w+)\s+interface"),
                (Constant, r"^const\s+(\w+)\s*="),
                (Variable, r"^var\s+(\w+)\s+"),
            ]),
        );
        tables.insert(
            "java",
            compile(&[
                (Class, r"^(?:public\s+)?(?:abstract\s+)?class\s+(\w+)"),
                (Interface, r"^(?:public\s+)?interface\s+(\w+)"),
                (Enum, r"^(?:public\s+)?enum\s+(\w+)"),
                (Method, r"^\s+(?:public|private|protected)?\s*(?:static\s+)?(?:\S+\s+)+(\w+)\s*\("),
            ]),
        );
        tables.insert(
            "c",
            compile(&[
                (Function, r"^[A-Za-z_][\w \*]*\s+(\w+)\s*\([^;]*\)\s*\{?\s*$"),
                (Class, r"^(?:typedef\s+)?struct\s+(\w+)"),
                (Enum, r"^(?:typedef\s+)?enum\s+(\w+)"),
                (Constant, r"^#define\s+(\w+)"),
            ]),
        );
        tables.insert(
            "cpp",
            compile(&[
                (Function, r"^[A-Za-z_][\w \*&:<>]*\s+(\w+)\s*\([^;]*\)\s*\{?\s*$"),
                (Class, r"^(?:class|struct)\s+(\w+)"),
                (Enum, r"^(?:enum\s+class|enum)\s+(\w+)"),
                (Constant, r"^#define\s+(\w+)"),
            ]),
        );
        tables.insert(
            "csharp",
            compile(&[
                (Class, r"^(?:public\s+|private\s+|internal\s+)?(?:abstract\s+|sealed\s+)?class\s+(\w+)"),
                (Interface, r"^(?:public\s+)?interface\s+(\w+)"),
                (Enum, r"^(?:public\s+)?enum\s+(\w+)"),
                (
                    Method,
                    r"^\s+(?:public|private|protected|internal)\s+(?:static\s+)?(?:async\s+)?[\w<>\[\],\s]+\s+(\w+)\s*\(",
                ),
                (Constant, r"^\s*(?:public\s+)?const\s+\w+\s+(\w+)\s*="),
            ]),
        );
        tables.insert(
            "ruby",
            compile(&[
                (Class, r"^class\s+(\w+)"),
                (Module, r"^module\s+(\w+)"),
                (Function, r"^def\s+(\w+)"),
                (Method, r"^\s+def\s+(?:self\.)?(\w+)"),
                (Constant, r"^\s*([A-Z][A-Z_0-9]*)\s*="),
            ]),
        );
        tables.insert(
            "php",
            compile(&[
                (Function, r"^(?:public\s+|private\s+|protected\s+|static\s+)*function\s+(\w+)\s*\("),
                (Class, r"^(?:abstract\s+|final\s+)?class\s+(\w+)"),
                (Interface, r"^interface\s+(\w+)"),
                (Constant, r"^\s*const\s+(\w+)\s*="),
            ]),
        );
        tables.insert(
            "lua",
            compile(&[
                (Function, r"^(?:local\s+)?function\s+(\w+)\s*\("),
                (Method, r"^function\s+\w+[:.](\w+)\s*\("),
                (Variable, r"^local\s+(\w+)\s*="),
                (Constant, r"^([A-Z][A-Z_0-9]+)\s*="),
            ]),
        );
        tables.insert(
            "gdscript",
            compile(&[
                (Class, r"^class_name\s+(\w+)"),
                (Class, r"^class\s+(\w+)"),
                (Function, r"^func\s+(\w+)\s*\("),
                (Method, r"^\t+func\s+(\w+)\s*\("),
                (Variable, r"^(?:@export\s+)?var\s+(\w+)"),
                (Variable, r"^(?:@onready\s+)?var\s+(\w+)"),
                (Constant, r"^const\s+(\w+)\s*="),
                (Enum, r"^enum\s+(\w+)\s*\{"),
                (Function, r"^signal\s+(\w+)"),
            ]),
        );

        tables
    })
}

/// Walks a repository, extracting per-file symbol tables and a content hash.
pub struct SymbolExtractor {
    repo_path: PathBuf,
    matcher: globset::GlobSet,
    files: HashMap<String, FileInfo>,
    symbols: Vec<Symbol>,
}

impl SymbolExtractor {
    pub fn new(repo_path: impl Into<PathBuf>, excludes: &[String]) -> Result<Self, IndexError> {
        let matcher = crate::config::build_globset(excludes)?;
        Ok(Self {
            repo_path: repo_path.into(),
            matcher,
            files: HashMap::new(),
            symbols: Vec::new(),
        })
    }

    fn extract_from_file(&self, path: &Path, language: &str, rel_path: &str) -> Vec<Symbol> {
        let Some(patterns) = pattern_tables().get(language) else {
            return Vec::new();
        };
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };

        let mut symbols = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            for (kind, regex) in patterns {
                let Some(captures) = regex.captures(line) else {
                    continue;
                };
                let Some(name) = captures.get(1) else {
                    continue;
                };
                let name = name.as_str().to_string();
                let exported = line.to_lowercase().contains("export")
                    || (language == "python" && !name.starts_with('_'));
                symbols.push(Symbol {
                    name,
                    symbol_type: *kind,
                    file_path: rel_path.to_string(),
                    line_number: line_num + 1,
                    signature: Some(line.trim().to_string()),
                    parent: None,
                    exported,
                });
            }
        }
        symbols
    }

    /// Walk the repository and populate the file/symbol tables. Unreadable
    /// files are skipped silently; no single file aborts the index (§4.4).
    pub fn index_files(&mut self) -> Result<(), IndexError> {
        for entry in walkdir::WalkDir::new(&self.repo_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(&self.repo_path) else {
                continue;
            };
            let rel_path = rel.to_string_lossy().replace('\\', "/");
            if self.matcher.is_match(&rel_path) {
                continue;
            }

            let Some(language) = extension_language(path) else {
                continue;
            };

            let Ok(hash) = file_hash(path) else {
                continue;
            };
            let Ok(metadata) = path.metadata() else {
                continue;
            };
            let content = std::fs::read_to_string(path).unwrap_or_default();

            let mut info = FileInfo {
                path: path.display().to_string(),
                relative_path: rel_path.clone(),
                hash,
                size_bytes: metadata.len(),
                line_count: count_lines(&content),
                language: Some(language.to_string()),
                symbols: Vec::new(),
            };
            info.symbols = self.extract_from_file(path, language, &rel_path);
            self.symbols.extend(info.symbols.clone());
            self.files.insert(rel_path, info);
        }
        Ok(())
    }

    pub fn files(&self) -> &HashMap<String, FileInfo> {
        &self.files
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn registry(&self) -> SymbolRegistry {
        let mut symbols_by_kind: HashMap<String, usize> = HashMap::new();
        for symbol in &self.symbols {
            *symbols_by_kind.entry(symbol.symbol_type.as_str().to_string()).or_insert(0) += 1;
        }
        SymbolRegistry {
            version: "1.0".to_string(),
            file_count: self.files.len(),
            symbol_count: self.symbols.len(),
            symbols_by_kind,
            symbols: self.symbols.clone(),
        }
    }

    pub fn save_registry(&self, output_dir: &Path) -> Result<PathBuf, IndexError> {
        std::fs::create_dir_all(output_dir).map_err(|source| IndexError::Write {
            path: output_dir.display().to_string(),
            source,
        })?;
        let output_path = output_dir.join("SYMBOL_REGISTRY.json");
        let json = serde_json::to_string_pretty(&self.registry())?;
        std::fs::write(&output_path, json).map_err(|source| IndexError::Write {
            path: output_path.display().to_string(),
            source,
        })?;
        Ok(output_path)
    }

    /// Case-insensitive substring lookup over every extracted symbol.
    pub fn find_symbol(&self, name: &str) -> Vec<&Symbol> {
        let needle = name.to_lowercase();
        self.symbols.iter().filter(|s| s.name.to_lowercase().contains(&needle)).collect()
    }

    pub fn file_symbols(&self, file_path: &str) -> Vec<&Symbol> {
        self.symbols.iter().filter(|s| s.file_path == file_path).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn extracts_python_functions_and_classes() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("mod.py"),
            "def public_fn():\n    pass\n\n\nclass Widget:\n    def _private(self):\n        pass\n",
        )
        .unwrap();

        let mut extractor = SymbolExtractor::new(dir.path(), &[]).unwrap();
        extractor.index_files().unwrap();

        let names: Vec<&str> = extractor.symbols().iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"public_fn"));
        assert!(names.contains(&"Widget"));
        assert!(names.contains(&"_private"));

        let public = extractor.symbols().iter().find(|s| s.name == "public_fn").unwrap();
        assert!(public.exported);
        let private = extractor.symbols().iter().find(|s| s.name == "_private").unwrap();
        assert!(!private.exported);
    }

    #[test]
    fn extracts_rust_items() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("lib.rs"),
            "pub fn run() {}\npub struct Config {}\ntrait Plugin {}\n",
        )
        .unwrap();

        let mut extractor = SymbolExtractor::new(dir.path(), &[]).unwrap();
        extractor.index_files().unwrap();

        let kinds: Vec<SymbolType> = extractor.symbols().iter().map(|s| s.symbol_type).collect();
        assert!(kinds.contains(&SymbolType::Function));
        assert!(kinds.contains(&SymbolType::Class));
        assert!(kinds.contains(&SymbolType::Interface));
    }

    #[test]
    fn registry_counts_symbols_by_kind() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "pub fn a() {}\npub fn b() {}\n").unwrap();

        let mut extractor = SymbolExtractor::new(dir.path(), &[]).unwrap();
        extractor.index_files().unwrap();
        let registry = extractor.registry();

        assert_eq!(registry.symbol_count, 2);
        assert_eq!(registry.symbols_by_kind.get("function"), Some(&2));
    }

    #[test]
    fn excluded_paths_are_skipped() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/left-pad")).unwrap();
        std::fs::write(dir.path().join("node_modules/left-pad/index.js"), "function f() {}\n").unwrap();
        std::fs::write(dir.path().join("main.js"), "function g() {}\n").unwrap();

        let mut extractor =
            SymbolExtractor::new(dir.path(), &["**/node_modules/**".to_string()]).unwrap();
        extractor.index_files().unwrap();

        assert_eq!(extractor.symbols().len(), 1);
        assert_eq!(extractor.symbols()[0].name, "g");
    }

    #[test]
    fn find_symbol_is_case_insensitive_substring() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def FetchUser():\n    pass\n").unwrap();

        let mut extractor = SymbolExtractor::new(dir.path(), &[]).unwrap();
        extractor.index_files().unwrap();

        assert_eq!(extractor.find_symbol("fetchuser").len(), 1);
        assert_eq!(extractor.find_symbol("nonexistent").len(), 0);
    }
}
