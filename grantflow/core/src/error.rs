use crate::{
    catalog::CatalogError, extract::ExtractError, load::LoadError, orchestrate::OrchestrateError,
    tracker::TrackerError, transform::TransformError,
};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Extract(Box<ExtractError>),

    #[error(transparent)]
    Transform(Box<TransformError>),

    #[error(transparent)]
    Load(Box<LoadError>),

    #[error(transparent)]
    Catalog(Box<CatalogError>),

    #[error(transparent)]
    Tracker(Box<TrackerError>),

    #[error(transparent)]
    Orchestrate(Box<OrchestrateError>),

    #[error(transparent)]
    Storage(Box<grantflow_storage::Error>),
}

impl From<ExtractError> for Error {
    fn from(error: ExtractError) -> Self {
        Error::Extract(Box::new(error))
    }
}

impl From<TransformError> for Error {
    fn from(error: TransformError) -> Self {
        Error::Transform(Box::new(error))
    }
}

impl From<LoadError> for Error {
    fn from(error: LoadError) -> Self {
        Error::Load(Box::new(error))
    }
}

impl From<CatalogError> for Error {
    fn from(error: CatalogError) -> Self {
        Error::Catalog(Box::new(error))
    }
}

impl From<TrackerError> for Error {
    fn from(error: TrackerError) -> Self {
        Error::Tracker(Box::new(error))
    }
}

impl From<OrchestrateError> for Error {
    fn from(error: OrchestrateError) -> Self {
        Error::Orchestrate(Box::new(error))
    }
}

impl From<grantflow_storage::Error> for Error {
    fn from(error: grantflow_storage::Error) -> Self {
        Error::Storage(Box::new(error))
    }
}
