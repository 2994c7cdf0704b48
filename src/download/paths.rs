use std::path::{Path, PathBuf};

use crate::store::{Category, CORE_IDENTIFIER};

/// Canonical local path of the archive for one `(category, identifier, version)`.
///
/// `<root>/<category-dir>/<stem>-<version>.zip`, where the stem is
/// `wordpress` for core, the first path segment of a plugin identifier
/// (`akismet/akismet.php` becomes `akismet`), and the slug for themes.
/// Both the coordinator's presence check and the workers' write go through
/// this function, so they always agree on the file name.
pub fn artifact_path(root: &Path, category: Category, identifier: &str, version: &str) -> PathBuf {
    let stem = match category {
        Category::Core => CORE_IDENTIFIER,
        Category::Plugin => identifier.split('/').next().unwrap_or(identifier),
        Category::Theme => identifier,
    };
    let filename = format!("{}-{}.zip", clean_filename(stem), clean_filename(version));
    root.join(category.dir_name()).join(filename)
}

/// Temporary path a download is streamed into before being renamed over
/// `path`.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Clean a filename by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
        assert_eq!(clean_filename("6.2.1"), "6.2.1");
        assert_eq!(clean_filename("beta\n1"), "beta1");
    }

    #[test]
    fn test_core_path() {
        let root = Path::new("/srv/public");
        assert_eq!(
            artifact_path(root, Category::Core, CORE_IDENTIFIER, "6.2.1"),
            PathBuf::from("/srv/public/core/wordpress-6.2.1.zip")
        );
        // Whatever identifier a core item carries, the file name is fixed.
        assert_eq!(
            artifact_path(root, Category::Core, "something-else", "6.2.1"),
            PathBuf::from("/srv/public/core/wordpress-6.2.1.zip")
        );
    }

    #[test]
    fn test_plugin_path_uses_first_segment() {
        let root = Path::new("public");
        assert_eq!(
            artifact_path(root, Category::Plugin, "akismet/akismet.php", "5.1"),
            PathBuf::from("public/plugins/akismet-5.1.zip")
        );
        assert_eq!(
            artifact_path(root, Category::Plugin, "hello-dolly", "1.7.2"),
            PathBuf::from("public/plugins/hello-dolly-1.7.2.zip")
        );
    }

    #[test]
    fn test_theme_path() {
        assert_eq!(
            artifact_path(Path::new("public"), Category::Theme, "twentytwentythree", "1.1"),
            PathBuf::from("public/themes/twentytwentythree-1.1.zip")
        );
    }

    #[test]
    fn test_version_cannot_escape_category_dir() {
        let path = artifact_path(Path::new("public"), Category::Theme, "evil", "../../etc/passwd");
        assert_eq!(path.parent(), Some(Path::new("public/themes")));
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("public/core/wordpress-6.2.zip")),
            PathBuf::from("public/core/wordpress-6.2.zip.part")
        );
    }
}
