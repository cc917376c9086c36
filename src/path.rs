//! Mapping between local file paths and remote object names

/// Flatten a hierarchical local path into a single name component.
///
/// Every directory separator (`\` or `/`), as well as a drive separator
/// (`C:\`), becomes a `-`. Empty components are dropped, so leading, trailing
/// and repeated separators do not produce stray dashes. The result never
/// contains `/`, which the purger relies on to recognise its own objects.
///
/// ```
/// use cloudenv::path::path_to_name;
///
/// assert_eq!(path_to_name(r"C:\data\db\000012.sst"), "C-data-db-000012.sst");
/// assert_eq!(path_to_name("archive/000007.log"), "archive-000007.log");
/// ```
pub fn path_to_name(path: &str) -> String {
    let (drive, rest) = match path.find(":\\") {
        Some(idx) => (Some(&path[..idx]), &path[idx + 2..]),
        None => (None, path),
    };

    let mut parts: Vec<&str> = Vec::new();
    if let Some(drive) = drive {
        parts.push(drive);
    }
    parts.extend(rest.split(|c: char| c == '\\' || c == '/').filter(|part| !part.is_empty()));
    parts.join("-")
}

/// Join an object path prefix and a name with exactly one `/` between them.
pub fn join_object_path(object_path: &str, name: &str) -> String {
    let object_path = object_path.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if object_path.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", object_path, name)
    }
}

/// Listing prefix for an object path: empty, or the path with one trailing `/`.
pub fn list_prefix(object_path: &str) -> String {
    let trimmed = object_path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_to_name_windows_drive() {
        assert_eq!(path_to_name(r"C:\a\b\file"), "C-a-b-file");
    }

    #[test]
    fn test_path_to_name_drops_empty_components() {
        assert_eq!(path_to_name(r"\a\\b\"), "a-b");
        assert_eq!(path_to_name("/var//lib/db/"), "var-lib-db");
    }

    #[test]
    fn test_path_to_name_is_flat() {
        for path in ["a/b", r"a\", r"C:\x/y", "//", "db/archive/000003.log"] {
            let name = path_to_name(path);
            assert!(!name.contains('/') && !name.contains('\\'), "{} -> {}", path, name);
        }
        assert_eq!(path_to_name(r"a\"), "a");
    }

    #[test]
    fn test_path_to_name_plain_name() {
        assert_eq!(path_to_name("MANIFEST-000001"), "MANIFEST-000001");
        assert_eq!(path_to_name(""), "");
    }

    #[test]
    fn test_join_object_path() {
        assert_eq!(join_object_path("", "a"), "a");
        assert_eq!(join_object_path("db/", "/a"), "db/a");
        assert_eq!(join_object_path("db", "a"), "db/a");
    }

    #[test]
    fn test_list_prefix() {
        assert_eq!(list_prefix(""), "");
        assert_eq!(list_prefix("/"), "");
        assert_eq!(list_prefix("db"), "db/");
        assert_eq!(list_prefix("db/"), "db/");
    }
}
