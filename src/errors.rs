use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Shape error: {message}")]
    Shape { message: String },

    #[error("Mask error at timestep {timestep}: {message}")]
    Mask { timestep: usize, message: String },

    #[error("Aggregation overflow: {count} embedding gradient contributions exceed capacity {capacity}")]
    AggregationOverflow { capacity: usize, count: usize },

    #[error("Gradient computation error: {message}")]
    GradientError { message: String },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Config loading error: {source}")]
    ConfigLoad {
        #[from]
        source: std::io::Error,
    },
}

impl ModelError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ModelError::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        ModelError::Shape {
            message: message.into(),
        }
    }
}

impl From<ndarray::ShapeError> for ModelError {
    fn from(err: ndarray::ShapeError) -> Self {
        ModelError::Shape {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
