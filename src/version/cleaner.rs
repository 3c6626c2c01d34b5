use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use flume::{Receiver, Sender};
use thiserror::Error;

use crate::{
    fs::{ColumnFs, FsError},
    observability::{log_debug, log_warn},
    option::EngineOption,
};

pub(crate) enum CleanTag {
    /// Version `txn` exists; `dirs` become garbage once it is released.
    Add { txn: u64, dirs: Vec<PathBuf> },
    /// Version `txn` has no remaining handles.
    Clean { txn: u64 },
}

/// Deletes superseded partition generations once no live version can see
/// them. Versions are released in any order; directories are only removed
/// when every version up to and including the one that retired them is gone.
pub(crate) struct Cleaner {
    tag_recv: Receiver<CleanTag>,
    dirs_map: BTreeMap<u64, (Vec<PathBuf>, bool)>,
    fs: Arc<dyn ColumnFs>,
}

impl Cleaner {
    pub(crate) fn new(option: &EngineOption, fs: Arc<dyn ColumnFs>) -> (Self, Sender<CleanTag>) {
        let (tag_send, tag_recv) = flume::bounded(option.clean_channel_buffer.max(1));

        (
            Cleaner {
                tag_recv,
                dirs_map: Default::default(),
                fs,
            },
            tag_send,
        )
    }

    /// Blocking loop run on a worker thread until every sender is dropped.
    /// Deletion failures are logged and the loop carries on; the first one is
    /// returned when the loop ends.
    pub(crate) fn listen(&mut self) -> Result<(), CleanerError> {
        let mut first_error = None;
        while let Ok(tag) = self.tag_recv.recv() {
            match tag {
                CleanTag::Add { txn, dirs } => {
                    // Only live versions send `Add`, so an entry left behind by
                    // an unpublished attempt at the same txn is live again.
                    let (retired, dropped) = self.dirs_map.entry(txn).or_default();
                    retired.extend(dirs);
                    *dropped = false;
                }
                CleanTag::Clean { txn } => {
                    if let Some((_, dropped)) = self.dirs_map.get_mut(&txn) {
                        *dropped = true;
                    }
                    while let Some((first_txn, (dirs, dropped))) = self.dirs_map.pop_first() {
                        if !dropped {
                            let _ = self.dirs_map.insert(first_txn, (dirs, false));
                            break;
                        }
                        for dir in dirs {
                            match self.fs.remove_dir_all(&dir) {
                                Ok(()) | Err(FsError::NotFound(_)) => {
                                    log_debug!(
                                        component = "cleaner",
                                        event = "generation_removed",
                                        txn = first_txn,
                                        dir = %dir.display(),
                                    );
                                }
                                Err(err) => {
                                    log_warn!(
                                        component = "cleaner",
                                        event = "remove_failed",
                                        dir = %dir.display(),
                                        error = %err,
                                    );
                                    first_error.get_or_insert(err);
                                }
                            }
                        }
                    }
                }
            }
        }

        first_error.map_or(Ok(()), |err| Err(err.into()))
    }
}

/// Failures reported by the directory cleaner when the engine closes.
#[derive(Debug, Error)]
pub enum CleanerError {
    /// A superseded generation could not be removed.
    #[error("cleaner fs error: {0}")]
    Fs(#[from] FsError),
    /// The cleaner thread went away without reporting.
    #[error("cleaner stopped without reporting")]
    Lost,
}
