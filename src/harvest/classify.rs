//! Blob classification
//!
//! Category comes from the path when one survives; otherwise (and for
//! unrecognised extensions) from a probe of the leading bytes.

use crate::model::{Category, Classification, ContentKind};
use crate::util::path::{extension_of, file_name};

/// Bytes inspected by the binary probe
pub const PROBE_LEN: usize = 8000;

pub fn classify(path: Option<&str>, size: u64, content: Option<&[u8]>, max_scan_bytes: u64) -> Classification {
    let category = path.map(category_for_path).unwrap_or(Category::Unknown);
    let content_kind = if category == Category::Unknown {
        content.map(probe).unwrap_or(ContentKind::Unprobed)
    } else {
        ContentKind::Unprobed
    };
    Classification {
        category,
        content: content_kind,
        oversized: size > max_scan_bytes,
    }
}

pub fn category_for_path(path: &str) -> Category {
    let name = file_name(path);
    if name == ".env" || name.starts_with(".env.") || name.ends_with(".env") {
        return Category::EnvFile;
    }
    if path.contains("__pycache__/") {
        return Category::BytecodeCache;
    }
    if matches!(
        name,
        "Dockerfile" | "Makefile" | "Jenkinsfile" | "Rakefile" | "Gemfile" | "Procfile"
    ) {
        return Category::Source;
    }
    if matches!(name, ".npmrc" | ".pypirc" | ".netrc" | ".dockercfg" | "credentials" | "id_rsa" | "id_ed25519") {
        return Category::Config;
    }

    let Some(ext) = extension_of(path) else {
        return Category::Unknown;
    };
    match ext.as_ref() {
        "pyc" | "pyo" => Category::BytecodeCache,
        "exe" | "dll" | "so" | "dylib" | "o" | "a" | "obj" | "lib" | "class" | "jar" | "war"
        | "ear" | "wasm" | "bin" | "apk" | "ipa" | "deb" | "rpm" | "msi" => Category::CompiledArtifact,
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "ico" | "webp" | "tiff" | "mp3" | "mp4" | "wav"
        | "avi" | "mov" | "ttf" | "otf" | "woff" | "woff2" | "eot" | "zip" | "gz" | "tgz" | "bz2"
        | "xz" | "7z" | "rar" | "tar" | "pdf" | "psd" => Category::Media,
        "json" | "yaml" | "yml" | "toml" | "ini" | "cfg" | "conf" | "config" | "properties"
        | "xml" | "plist" | "tf" | "tfvars" | "tfstate" | "pem" | "key" | "crt" | "p12" | "pfx"
        | "jks" | "keystore" | "npmrc" | "gitconfig" | "kubeconfig" | "hcl" => Category::Config,
        "md" | "txt" | "rst" | "adoc" | "csv" | "log" | "html" | "htm" => Category::Document,
        "rs" | "py" | "js" | "mjs" | "cjs" | "ts" | "tsx" | "jsx" | "go" | "java" | "kt" | "kts"
        | "scala" | "rb" | "php" | "c" | "h" | "cc" | "cpp" | "hpp" | "cs" | "swift" | "m"
        | "sh" | "bash" | "zsh" | "ps1" | "bat" | "cmd" | "sql" | "pl" | "lua" | "r" | "dart"
        | "ex" | "exs" | "erl" | "groovy" | "gradle" | "vue" | "svelte" | "ipynb" => Category::Source,
        _ => Category::Unknown,
    }
}

/// NUL bytes, or more than 30% control characters in the probe window,
/// mark content as binary.
pub fn probe(content: &[u8]) -> ContentKind {
    let window = &content[..content.len().min(PROBE_LEN)];
    if window.is_empty() {
        return ContentKind::Text;
    }
    if window.contains(&0) {
        return ContentKind::Binary;
    }
    let control = window
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
        .count();
    if control * 10 > window.len() * 3 {
        ContentKind::Binary
    } else {
        ContentKind::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_categories() {
        assert_eq!(category_for_path("deploy/.env"), Category::EnvFile);
        assert_eq!(category_for_path(".env.production"), Category::EnvFile);
        assert_eq!(category_for_path("app/settings.py"), Category::Source);
        assert_eq!(category_for_path("config/db.YML"), Category::Config);
        assert_eq!(category_for_path("build/app.exe"), Category::CompiledArtifact);
        assert_eq!(category_for_path("pkg/__pycache__/mod.cpython-311.pyc"), Category::BytecodeCache);
        assert_eq!(category_for_path("logo.png"), Category::Media);
        assert_eq!(category_for_path("Dockerfile"), Category::Source);
        assert_eq!(category_for_path("LICENSE"), Category::Unknown);
    }

    #[test]
    fn test_probe() {
        assert_eq!(probe(b"SECRET_KEY=abc123\n"), ContentKind::Text);
        assert_eq!(probe(b"\x7fELF\x02\x01\x01\x00\x00"), ContentKind::Binary);
        assert_eq!(probe(&[0x01, 0x02, 0x03, b'a']), ContentKind::Binary);
        assert_eq!(probe(b""), ContentKind::Text);
    }

    #[test]
    fn test_pathless_blob_is_probed() {
        let c = classify(None, 10, Some(b"password=hunter2"), 1024);
        assert_eq!(c.category, Category::Unknown);
        assert_eq!(c.content, ContentKind::Text);
        assert!(!c.oversized);
    }

    #[test]
    fn test_known_path_skips_probe_and_flags_size() {
        let c = classify(Some("a.rs"), 4096, Some(b"\0\0"), 1024);
        assert_eq!(c.category, Category::Source);
        assert_eq!(c.content, ContentKind::Unprobed);
        assert!(c.oversized);
    }
}
