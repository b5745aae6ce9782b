//! Directory tree helpers.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Total size in bytes of all regular files below `root`.
pub(crate) async fn tree_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }

    Ok(total)
}

/// Copy the tree at `src` into the existing directory `dst`.
pub(crate) async fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                fs::create_dir(&target).await?;
                pending.push((entry.path(), target));
            } else if cfg!(unix) && file_type.is_symlink() {
                let link = fs::read_link(entry.path()).await?;
                #[cfg(unix)]
                fs::symlink(link, &target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
    }

    Ok(())
}
