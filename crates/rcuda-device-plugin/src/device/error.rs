use core::error::Error;

/// Errors that can occur while resolving the advertised device set.
#[derive(Debug, derive_more::Display)]
pub enum RegistryError {
    #[display("Failed to read device descriptor: {message}")]
    DescriptorUnreadable { message: String },
    #[display("Malformed device descriptor: {message}")]
    DescriptorMalformed { message: String },
    #[display("Device directory request failed: {message}")]
    DirectoryUnavailable { message: String },
    #[display("No devices registered under directory prefix {prefix}")]
    DirectoryMissing { prefix: String },
    #[display("Unexpected device directory response: {message}")]
    DirectoryMalformed { message: String },
}

impl RegistryError {
    /// Configuration errors mean the device set cannot be determined at all;
    /// everything else may go away on the next attempt.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RegistryError::DescriptorUnreadable { .. }
                | RegistryError::DescriptorMalformed { .. }
                | RegistryError::DirectoryMissing { .. }
        )
    }
}

impl Error for RegistryError {}
