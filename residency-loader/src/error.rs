use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ResourceError {
    StringError(String),
    // The resource name has no suffix to pick a kind with
    MissingExtension(String),
    // No registered kind matches the resource name's suffix
    UnrecognizedResourceKind(String),
    // Raised by a resource kind while loading (malformed data, backend failure, etc.)
    LoadFailure { resource: String, reason: String },
    IoError(Arc<std::io::Error>),
    JsonError(Arc<serde_json::Error>),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

impl ResourceError {
    pub fn load_failure(
        resource: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ResourceError::LoadFailure {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// True for the errors a resource kind raises while loading, as opposed to naming errors from
    /// the registry
    pub fn is_load_error(&self) -> bool {
        match self {
            ResourceError::LoadFailure { .. } | ResourceError::IoError(_) => true,
            _ => false,
        }
    }
}

impl std::error::Error for ResourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            ResourceError::StringError(_) => None,
            ResourceError::MissingExtension(_) => None,
            ResourceError::UnrecognizedResourceKind(_) => None,
            ResourceError::LoadFailure { .. } => None,
            ResourceError::IoError(ref e) => Some(&**e),
            ResourceError::JsonError(ref e) => Some(&**e),
        }
    }
}

impl core::fmt::Display for ResourceError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            ResourceError::StringError(ref e) => e.fmt(fmt),
            ResourceError::MissingExtension(ref name) => {
                write!(fmt, "Resource name has no extension: \"{}\"", name)
            }
            ResourceError::UnrecognizedResourceKind(ref name) => {
                write!(fmt, "Unrecognized resource kind: \"{}\"", name)
            }
            ResourceError::LoadFailure {
                ref resource,
                ref reason,
            } => write!(fmt, "Failed to load \"{}\": {}", resource, reason),
            ResourceError::IoError(ref e) => e.fmt(fmt),
            ResourceError::JsonError(ref e) => e.fmt(fmt),
        }
    }
}

impl From<&str> for ResourceError {
    fn from(str: &str) -> Self {
        ResourceError::StringError(str.to_string())
    }
}

impl From<String> for ResourceError {
    fn from(string: String) -> Self {
        ResourceError::StringError(string)
    }
}

impl From<std::io::Error> for ResourceError {
    fn from(error: std::io::Error) -> Self {
        ResourceError::IoError(Arc::new(error))
    }
}

impl From<serde_json::Error> for ResourceError {
    fn from(error: serde_json::Error) -> Self {
        ResourceError::JsonError(Arc::new(error))
    }
}
