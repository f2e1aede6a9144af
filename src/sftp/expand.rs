//! Directory expansion
//!
//! A directory transfer becomes an ordered plan of directory-create steps
//! and file copies. The walk is depth-first with children sorted by name, so
//! every directory is created before anything inside it.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::error::TransferError;
use super::fs::FileSystem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    CreateDir { path: String },
    File { source: String, dest: String, size: u64 },
}

pub async fn expand_directory(
    source_fs: &dyn FileSystem,
    dest_fs: &dyn FileSystem,
    source_root: &str,
    dest_root: &str,
) -> Result<Vec<PlanStep>, TransferError> {
    let mut plan = Vec::new();
    walk(source_fs, dest_fs, source_root.to_string(), dest_root.to_string(), &mut plan).await?;
    Ok(plan)
}

fn walk<'a>(
    source_fs: &'a dyn FileSystem,
    dest_fs: &'a dyn FileSystem,
    source: String,
    dest: String,
    plan: &'a mut Vec<PlanStep>,
) -> BoxFuture<'a, Result<(), TransferError>> {
    async move {
        plan.push(PlanStep::CreateDir { path: dest.clone() });

        let mut entries = source_fs.read_dir(&source).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        for entry in entries {
            let child_source = source_fs.join(&source, &entry.name);
            let child_dest = dest_fs.join(&dest, &entry.name);
            if entry.is_dir {
                walk(source_fs, dest_fs, child_source, child_dest, plan).await?;
            } else {
                plan.push(PlanStep::File {
                    source: child_source,
                    dest: child_dest,
                    size: entry.size,
                });
            }
        }
        Ok(())
    }
    .boxed()
}
