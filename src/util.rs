use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

#[macro_export]
macro_rules! args {
    ($($element:expr),*) => {{
        #[allow(unused_mut)]
        let mut vs = Vec::new();
        $(vs.push($element.to_string());)*
        vs
    }};
    ($($element:expr,)*) => {{
        $crate::args![$($element),*]
    }};
}

/// Hex-encoded sha256 of `bytes`, as printed by `sha256sum`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub async fn file_digest(path: &Path) -> Result<String, Report> {
    let bytes = tokio::fs::read(path)
        .await
        .wrap_err_with(|| format!("read {}", path.display()))?;
    Ok(digest(&bytes))
}

/// Appends `line` to `path`, creating the file (and its parent directories)
/// if needed.
pub fn append_line(path: &Path, line: &str) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line)
}
