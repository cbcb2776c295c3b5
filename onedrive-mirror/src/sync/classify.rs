use std::path::{Path, PathBuf};

use super::index::IndexRecord;
use super::remote::RemoteItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    /// The item now lives at a new path. The artifact at `from` is removed
    /// only after the new path has been populated.
    Move { from: PathBuf },
    NoOp,
}

impl Action {
    pub fn needs_materialization(&self) -> bool {
        !matches!(self, Action::NoOp)
    }
}

/// Decides what a pass has to do locally for one remote item.
///
/// `present_on_disk` reports whether the artifact at `target` currently
/// exists with the right kind (directory or regular file).
pub fn classify(
    item: &RemoteItem,
    prior: Option<&IndexRecord>,
    target: &Path,
    present_on_disk: bool,
) -> Action {
    let Some(prior) = prior else {
        return Action::Create;
    };
    if prior.local_path != target {
        return Action::Move {
            from: prior.local_path.clone(),
        };
    }
    if !present_on_disk || prior.is_folder != item.is_folder {
        return Action::Update;
    }
    // A folder tag moves with its children; only the directory matters.
    if !item.is_folder && (prior.content_tag.is_none() || prior.content_tag != item.content_tag) {
        return Action::Update;
    }
    Action::NoOp
}
