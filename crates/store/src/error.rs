use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Transaction conflicted {0} times, giving up")]
    Conflict(usize),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}

impl StoreError {
    /// Conflicts and transport failures may succeed when retried.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_)
                | StoreError::Etcd(etcd_client::Error::TransportError(_))
                | StoreError::Etcd(etcd_client::Error::IoError(_))
        )
    }
}
