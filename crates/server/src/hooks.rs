//! Observer hooks for upload lifecycle events.

use std::path::Path;
use std::sync::Arc;

use crate::session::UploadSession;

/// Observer callback.
///
/// Receives `(path, declared_size, offset, metadata)` for the upload the
/// event belongs to. Hooks run synchronously on the connection task and must
/// not block; push heavy work onto a channel or a spawned task.
pub type Hook = Arc<dyn Fn(&Path, i64, i64, &[u8]) + Send + Sync>;

/// Lifecycle hooks wired into the transfer server.
#[derive(Clone, Default)]
pub struct TransferHooks {
    /// Fired once when CreateUpload succeeds.
    pub created: Option<Hook>,
    /// Fired once per admitted block, after the write landed.
    pub progress: Option<Hook>,
    /// Fired once at clean stream end, before the registry finishes the
    /// session (the whole-file digest check has not run yet).
    pub finished: Option<Hook>,
}

impl TransferHooks {
    pub(crate) fn fire_created(&self, session: &UploadSession, offset: i64) {
        fire(&self.created, session, offset);
    }

    pub(crate) fn fire_progress(&self, session: &UploadSession, offset: i64) {
        fire(&self.progress, session, offset);
    }

    pub(crate) fn fire_finished(&self, session: &UploadSession, offset: i64) {
        fire(&self.finished, session, offset);
    }
}

fn fire(hook: &Option<Hook>, session: &UploadSession, offset: i64) {
    if let Some(hook) = hook {
        hook(session.path(), session.size(), offset, session.metadata());
    }
}

impl std::fmt::Debug for TransferHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHooks")
            .field("created", &self.created.is_some())
            .field("progress", &self.progress.is_some())
            .field("finished", &self.finished.is_some())
            .finish()
    }
}
