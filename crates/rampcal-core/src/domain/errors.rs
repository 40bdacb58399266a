use std::error::Error;
use std::fmt::{Display, Formatter};

pub type CalibResult<T> = Result<T, CalibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibErrorCategory {
    Success,
    InvalidConfiguration,
    IoSystem,
    NumericDegeneracy,
    PoolFailure,
    Internal,
}

impl CalibErrorCategory {
    pub const fn exit_mapping(self) -> ExitMapping {
        match self {
            Self::Success => ExitMapping {
                exit_code: 0,
                category_name: "Success",
                class_label: "OK",
            },
            Self::InvalidConfiguration => ExitMapping {
                exit_code: 2,
                category_name: "InvalidConfiguration",
                class_label: "CONFIG_FATAL",
            },
            Self::IoSystem => ExitMapping {
                exit_code: 3,
                category_name: "IoSystem",
                class_label: "IO_FATAL",
            },
            Self::NumericDegeneracy => ExitMapping {
                exit_code: 4,
                category_name: "NumericDegeneracy",
                class_label: "NUMERIC_FATAL",
            },
            Self::PoolFailure => ExitMapping {
                exit_code: 5,
                category_name: "PoolFailure",
                class_label: "POOL_FATAL",
            },
            Self::Internal => ExitMapping {
                exit_code: 6,
                category_name: "Internal",
                class_label: "SYS_FATAL",
            },
        }
    }

    pub const fn exit_code(self) -> i32 {
        self.exit_mapping().exit_code
    }

    pub const fn category_name(self) -> &'static str {
        self.exit_mapping().category_name
    }

    pub const fn class_label(self) -> &'static str {
        self.exit_mapping().class_label
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitMapping {
    pub exit_code: i32,
    pub category_name: &'static str,
    pub class_label: &'static str,
}

/// Domain error shared by every calibration stage.
///
/// `placeholder` is a stable dotted code (`CONFIG.INTEGRATION_INDEX`) that
/// callers can match on without parsing the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibError {
    category: CalibErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl CalibError {
    pub fn new(
        category: CalibErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn invalid_configuration(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(
            CalibErrorCategory::InvalidConfiguration,
            placeholder,
            message,
        )
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(CalibErrorCategory::IoSystem, placeholder, message)
    }

    pub fn numeric_degeneracy(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(CalibErrorCategory::NumericDegeneracy, placeholder, message)
    }

    pub fn pool_failure(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(CalibErrorCategory::PoolFailure, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(CalibErrorCategory::Internal, placeholder, message)
    }

    pub const fn category(&self) -> CalibErrorCategory {
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

impl Display for CalibError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.category_name(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for CalibError {}
