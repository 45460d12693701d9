const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tif", "tiff", "pdf", "zip", "gz", "tgz",
    "tar", "bz2", "xz", "7z", "rar", "wasm", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4",
    "wav", "ogg", "webm", "avi", "mov", "so", "dll", "dylib", "exe", "bin", "class", "jar", "pyc",
    "whl", "sqlite", "db", "npy", "npz", "pkl",
];

pub fn has_binary_extension(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => BINARY_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

/// Decides whether `content` at `path` must travel base64-encoded.
pub fn is_binary(path: &str, content: &[u8]) -> bool {
    has_binary_extension(path) || content.contains(&0) || std::str::from_utf8(content).is_err()
}
