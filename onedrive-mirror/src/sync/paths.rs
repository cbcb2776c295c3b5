use std::path::{Path, PathBuf};

use super::remote::RemoteItem;

/// Maps a remote item onto its location under `user_root`.
///
/// The parent location comes from the provider's path hint
/// (`/drive/root:/Docs/Sub`). A missing or malformed hint places the item
/// directly under `user_root`. Never fails.
pub fn local_path_for(user_root: &Path, item: &RemoteItem) -> PathBuf {
    let mut out = user_root.to_path_buf();
    if let Some(hint) = item.remote_path_hint.as_deref() {
        for part in hint_components(hint) {
            out.push(part);
        }
    }
    out.push(local_name(&item.name, &item.id));
    out
}

/// Places an item directly inside an already known parent directory.
pub fn child_path(parent_dir: &Path, item: &RemoteItem) -> PathBuf {
    parent_dir.join(local_name(&item.name, &item.id))
}

/// `<mirror_root>/<display name or user id>/onedrive`
pub fn user_root(mirror_root: &Path, user_id: &str, display_name: Option<&str>) -> PathBuf {
    let dir = display_name
        .map(str::trim)
        .filter(|name| is_safe_component(name))
        .unwrap_or(user_id);
    mirror_root.join(local_name(dir, "user")).join("onedrive")
}

/// Whether the hint carries a recognizable root marker.
pub fn has_root_marker(hint: &str) -> bool {
    strip_root_marker(hint).is_some()
}

/// Relative parent components of a provider hint, root marker stripped.
pub fn hint_components(hint: &str) -> Vec<&str> {
    let Some(relative) = strip_root_marker(hint) else {
        return Vec::new();
    };
    relative
        .split('/')
        .filter(|part| is_safe_component(part))
        .collect()
}

fn strip_root_marker(hint: &str) -> Option<&str> {
    if let Some(rest) = hint.strip_prefix("/drive/root:") {
        return Some(rest);
    }
    // Shared drives: "/drives/{drive-id}/root:/..."
    let rest = hint.strip_prefix("/drives/")?;
    let (_, after_id) = rest.split_once('/')?;
    after_id.strip_prefix("root:")
}

fn local_name<'a>(name: &'a str, id: &'a str) -> &'a str {
    if is_safe_component(name) { name } else { id }
}

fn is_safe_component(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, hint: Option<&str>) -> RemoteItem {
        RemoteItem {
            id: "id-1".into(),
            name: name.into(),
            is_folder: false,
            size: Some(1),
            parent_id: Some("parent".into()),
            remote_path_hint: hint.map(str::to_string),
            content_tag: Some("t1".into()),
            created_at: None,
            modified_at: None,
            download_url: None,
            sha256: None,
            is_root: false,
            is_deleted: false,
        }
    }

    #[test]
    fn maps_nested_hint_under_user_root() {
        let root = PathBuf::from("/mirror/alice/onedrive");
        let mapped = local_path_for(&root, &item("a.txt", Some("/drive/root:/docs/sub")));
        assert_eq!(mapped, PathBuf::from("/mirror/alice/onedrive/docs/sub/a.txt"));
    }

    #[test]
    fn top_level_items_land_in_root() {
        let root = PathBuf::from("/m");
        assert_eq!(
            local_path_for(&root, &item("a.txt", Some("/drive/root:"))),
            PathBuf::from("/m/a.txt")
        );
        assert_eq!(
            local_path_for(&root, &item("a.txt", Some("/drive/root:/"))),
            PathBuf::from("/m/a.txt")
        );
    }

    #[test]
    fn strips_shared_drive_marker() {
        let root = PathBuf::from("/m");
        let mapped = local_path_for(&root, &item("a.txt", Some("/drives/b!xyz/root:/docs")));
        assert_eq!(mapped, PathBuf::from("/m/docs/a.txt"));
    }

    #[test]
    fn missing_or_malformed_hint_falls_back_to_root() {
        let root = PathBuf::from("/m");
        assert_eq!(local_path_for(&root, &item("a.txt", None)), PathBuf::from("/m/a.txt"));
        assert_eq!(
            local_path_for(&root, &item("a.txt", Some("docs/elsewhere"))),
            PathBuf::from("/m/a.txt")
        );
    }

    #[test]
    fn never_escapes_user_root() {
        let root = PathBuf::from("/m");
        let mapped = local_path_for(&root, &item("..", Some("/drive/root:/../../etc/./x")));
        assert_eq!(mapped, PathBuf::from("/m/etc/x/id-1"));
    }

    #[test]
    fn child_path_joins_under_parent() {
        let mapped = child_path(Path::new("/m/docs"), &item("a.txt", None));
        assert_eq!(mapped, PathBuf::from("/m/docs/a.txt"));
    }

    #[test]
    fn user_root_prefers_display_name() {
        let root = Path::new("/mirror");
        assert_eq!(
            user_root(root, "uid-1", Some("Alice Doe")),
            PathBuf::from("/mirror/Alice Doe/onedrive")
        );
        assert_eq!(
            user_root(root, "uid-1", Some("../x")),
            PathBuf::from("/mirror/uid-1/onedrive")
        );
        assert_eq!(user_root(root, "uid-1", None), PathBuf::from("/mirror/uid-1/onedrive"));
    }

    #[test]
    fn recognizes_root_markers() {
        assert!(has_root_marker("/drive/root:"));
        assert!(has_root_marker("/drives/abc/root:/docs"));
        assert!(!has_root_marker("/drive/items/abc"));
    }

    #[test]
    fn normalizes_duplicate_separators() {
        assert_eq!(hint_components("/drive/root://docs//sub/"), vec!["docs", "sub"]);
    }
}
