/// CLI utilities for consistent output formatting
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// Prefix for human-readable output; colored when stdout is a TTY
pub fn incstate_prefix() -> &'static str {
    if std::io::stdout().is_terminal() {
        "\x1b[96m[incstate]\x1b[0m"
    } else {
        "[incstate]"
    }
}

/// Resolve command-line paths against the working directory
pub fn absolutize(base: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                base.join(path)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolutize() {
        let base = Path::new("/work");
        let paths = vec![PathBuf::from("src"), PathBuf::from("/etc/hosts")];
        assert_eq!(
            absolutize(base, &paths),
            vec![PathBuf::from("/work/src"), PathBuf::from("/etc/hosts")]
        );
    }
}
