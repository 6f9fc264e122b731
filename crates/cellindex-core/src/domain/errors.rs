use std::error::Error;
use std::fmt::{Display, Formatter};

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexErrorCategory {
    Success,
    InputError,
    SearchExhausted,
    ConvergenceError,
    ExternalServiceError,
    IncompatibleDataError,
    IoSystemError,
    InternalError,
}

impl IndexErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InputError => 2,
            Self::IoSystemError => 3,
            Self::SearchExhausted | Self::ConvergenceError => 4,
            Self::ExternalServiceError => 5,
            Self::IncompatibleDataError => 6,
            Self::InternalError => 7,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::InputError => "InputError",
            Self::SearchExhausted => "SearchExhausted",
            Self::ConvergenceError => "ConvergenceError",
            Self::ExternalServiceError => "ExternalServiceError",
            Self::IncompatibleDataError => "IncompatibleDataError",
            Self::IoSystemError => "IoSystemError",
            Self::InternalError => "InternalError",
        }
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Error surfaced at the boundary of an indexing operation.
///
/// `placeholder` is a stable dotted code (`INPUT.NO_PEAKS`) that callers
/// can match on without parsing the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexError {
    category: IndexErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl IndexError {
    pub fn new(
        category: IndexErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn input(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(IndexErrorCategory::InputError, placeholder, message)
    }

    pub fn search_exhausted(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(IndexErrorCategory::SearchExhausted, placeholder, message)
    }

    pub fn convergence(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(IndexErrorCategory::ConvergenceError, placeholder, message)
    }

    pub fn external_service(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(
            IndexErrorCategory::ExternalServiceError,
            placeholder,
            message,
        )
    }

    pub fn incompatible_data(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(
            IndexErrorCategory::IncompatibleDataError,
            placeholder,
            message,
        )
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(IndexErrorCategory::IoSystemError, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(IndexErrorCategory::InternalError, placeholder, message)
    }

    pub const fn category(&self) -> IndexErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() {
            "ERROR"
        } else {
            "INFO"
        };
        format!("{}: [{}] {}", severity, self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for IndexError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for IndexError {}
