pub mod document;
pub mod merge;

pub use document::Document;
pub use merge::{merge, MergeResult, Outcome};

use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Pairs file error")]
    Pairs(#[from] bred_core::Error),
    #[error("Document error")]
    Document(#[from] document::Error),
}

/// Broad categories of failure, for reporting to the user.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    MalformedPairsRow,
    MalformedDocument,
    MissingRewriteMap,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pairs(bred_core::Error::NotFound(_)) => ErrorKind::NotFound,
            Self::Pairs(bred_core::Error::AccessDenied(_, _)) => ErrorKind::AccessDenied,
            Self::Pairs(bred_core::Error::MalformedRow { .. }) => ErrorKind::MalformedPairsRow,
            Self::Pairs(_) => ErrorKind::Other,
            Self::Document(document::Error::Io(_, error)) => match error.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
                _ => ErrorKind::Other,
            },
            Self::Document(document::Error::MissingRewriteMap(_)) => ErrorKind::MissingRewriteMap,
            Self::Document(error) if error.is_malformed() => ErrorKind::MalformedDocument,
            Self::Document(_) => ErrorKind::Other,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeOptions {
    /// The `name` of the rewrite map to update (by default the first one).
    pub map: Option<String>,
    /// Copy the original document to `<document>.bak` before saving.
    pub backup: bool,
    /// Report what would be added without writing anything.
    pub dry_run: bool,
}

/// Merge the pairs in a CSV file into the rewrite map of a document, saving
/// the document in place.
///
/// The pairs file is read completely before the document is loaded, and the
/// document is only written if every step before it succeeded.
pub fn merge_files<P: AsRef<Path>, D: AsRef<Path>>(
    pairs_path: P,
    document_path: D,
    options: &MergeOptions,
) -> Result<MergeResult, Error> {
    let document_path = document_path.as_ref();
    let pairs = bred_core::pair::load_pairs(pairs_path)?;
    let mut document = Document::load(document_path, options.map.as_deref())?;

    log::info!("Adding {} redirects to {:?}", pairs.len(), document_path);

    let result = merge(&mut document, &pairs);

    if result.added > 0 && !options.dry_run {
        if options.backup {
            let backup_path = backup_path(document_path);
            std::fs::copy(document_path, &backup_path)
                .map_err(|error| document::Error::Io(backup_path.clone(), error))?;
            log::info!("Saved backup to {:?}", backup_path);
        }

        document.save(document_path)?;
    }

    Ok(result)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut file_name = path.file_name().unwrap_or_default().to_os_string();
    file_name.push(".bak");
    path.with_file_name(file_name)
}
