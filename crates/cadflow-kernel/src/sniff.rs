//! Source sniffing: module format detection and library-marker matching
//!
//! Worker selection never executes source. It looks at the file extension
//! and cheap textual markers (import/require patterns naming the target
//! modeling library) to decide which worker variant should process a file.

/// Module flavor of a source file that declares no explicit format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    /// `import` / `export` syntax
    EsModule,
    /// `require(...)` / `module.exports` syntax
    CommonJs,
}

/// Detect the module format of a source body.
///
/// ES-module tokens win over CommonJS tokens when both appear (transpiled
/// output often carries stray `require` strings). Source with neither is
/// treated as an ES module.
pub fn detect_module_format(source: &str) -> ModuleFormat {
    for line in source.lines() {
        let line = line.trim_start();
        if line.starts_with("import ")
            || line.starts_with("import{")
            || line.starts_with("export ")
            || line.starts_with("export{")
        {
            return ModuleFormat::EsModule;
        }
    }
    if source.contains("require(") || source.contains("module.exports") {
        return ModuleFormat::CommonJs;
    }
    ModuleFormat::EsModule
}

/// Whether the source textually references any of the given library names
/// through an import or require.
pub fn references_library(source: &str, library_names: &[&str]) -> bool {
    let lowered = source.to_lowercase();
    library_names.iter().any(|name| {
        let name = name.to_lowercase();
        lowered.contains(&format!("from \"{name}\""))
            || lowered.contains(&format!("from '{name}'"))
            || lowered.contains(&format!("require(\"{name}\")"))
            || lowered.contains(&format!("require('{name}')"))
            || lowered.contains(&format!("import(\"{name}\")"))
            || lowered.contains(&format!("import('{name}')"))
    })
}

/// Extract the lowercase file extension, if any.
pub fn file_extension(filename: &str) -> Option<String> {
    let name = filename.rsplit('/').next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_wins_over_require() {
        let src = "import { draw } from \"replicad\";\nconst x = require('leftover');";
        assert_eq!(detect_module_format(src), ModuleFormat::EsModule);
    }

    #[test]
    fn test_require_marks_commonjs() {
        let src = "const cad = require(\"@jscad/modeling\");\nmodule.exports = { main };";
        assert_eq!(detect_module_format(src), ModuleFormat::CommonJs);
    }

    #[test]
    fn test_bare_source_defaults_to_es_module() {
        assert_eq!(
            detect_module_format("const main = () => box(1);"),
            ModuleFormat::EsModule
        );
    }

    #[test]
    fn test_references_library_matches_quoting_styles() {
        assert!(references_library(
            "import { drawCircle } from 'replicad';",
            &["replicad"]
        ));
        assert!(references_library(
            "const m = require(\"@jscad/modeling\");",
            &["@jscad/modeling"]
        ));
        assert!(!references_library(
            "// replicad mentioned only in a comment",
            &["replicad"]
        ));
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("model.js").as_deref(), Some("js"));
        assert_eq!(file_extension("parts/clamp.SCAD").as_deref(), Some("scad"));
        assert_eq!(file_extension("Makefile"), None);
        assert_eq!(file_extension(".hidden"), None);
    }
}
