use helmop_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{key}: write still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { key: String, attempts: u32 },
}
