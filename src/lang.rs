/// Language detection from file extensions, shared by the chunker (to pick
/// structural boundary rules) and by search results.
pub fn detect_language(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "rs" => "rust",
        "py" | "pyi" | "pyw" => "python",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" | "cc" | "cxx" | "hxx" => "cpp",
        "cs" => "csharp",
        "rb" | "rake" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "scala" | "sc" => "scala",
        "html" | "htm" => "html",
        "css" | "scss" | "sass" | "less" => "css",
        "json" | "jsonc" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "xml" => "xml",
        "md" | "mdx" | "rst" => "markdown",
        "sql" => "sql",
        "graphql" | "gql" => "graphql",
        "sh" | "bash" | "zsh" | "fish" => "shell",
        "ps1" | "bat" | "cmd" => "batch",
        "vue" => "vue",
        "svelte" => "svelte",
        "lua" => "lua",
        "zig" => "zig",
        "dart" => "dart",
        "ex" | "exs" => "elixir",
        "erl" | "hrl" => "erlang",
        "r" => "r",
        "jl" => "julia",
        "clj" | "cljs" | "cljc" => "clojure",
        "tf" | "hcl" => "hcl",
        "proto" => "protobuf",
        "txt" => "plaintext",
        _ => "plaintext",
    }
}

/// Extension of a relative path, lowercased, without the dot.
pub fn extension_of(relative_path: &str) -> String {
    std::path::Path::new(relative_path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_languages() {
        assert_eq!(detect_language("rs"), "rust");
        assert_eq!(detect_language("TSX"), "typescript");
        assert_eq!(detect_language("unknown-ext"), "plaintext");
    }

    #[test]
    fn extension_of_handles_dotless_names() {
        assert_eq!(extension_of("src/main.rs"), "rs");
        assert_eq!(extension_of("Makefile"), "");
    }
}
