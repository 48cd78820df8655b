use crate::{
    data::DataError, kernels::KernelError, protocol::ProtocolError, storage::StorageError,
    transform::TransformError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error in the `data` module")]
    Data(#[from] DataError),
    #[error("Error in the `storage` module")]
    Storage(#[from] StorageError),
    #[error("Error in the `protocol` module")]
    Protocol(#[from] ProtocolError),
    #[error("Error in the `transform` module")]
    Transform(#[from] TransformError),
    #[error("Error in the `kernels` module")]
    Kernel(#[from] KernelError),
}
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Attr;
    use std::error::Error as _;

    #[test]
    fn error_chain() {
        let error = Error::from(DataError::Missing(Attr::DefocusX));
        assert_eq!(error.to_string(), "Error in the `data` module");
        assert_eq!(
            error.source().map(|e| e.to_string()),
            Some("'defocus_x' is not defined inside the container".to_string())
        );
    }
}
