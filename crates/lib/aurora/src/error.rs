use aurora_backend::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Invalid argument: {info}")]
    InvalidArgument { info: String },

    #[error("Property {name:?} expects {expected}, got {found}")]
    PropertyType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Unknown property {name:?}")]
    UnknownProperty { name: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Shader compilation failed for {name:?}: {message}")]
    ShaderCompilation { name: String, message: String },

    #[error("Image {path:?} could not be loaded: {info}")]
    Image { path: String, info: String },

    #[error("The renderer is no longer valid after an earlier failure")]
    RendererInvalid,

    #[error("Unsupported: {info}")]
    Unsupported { info: String },
}

impl RenderError {
    pub(crate) fn invalid_argument(info: impl Into<String>) -> Self {
        Self::InvalidArgument { info: info.into() }
    }
}
