//! Error types for otactl

use ota_pipeline::OtaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Device not provisioned: {0}")]
    DeviceNotProvisioned(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Process exit code for a failed command
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(e) = error.downcast_ref::<CliError>() {
        return match e {
            CliError::DeviceNotProvisioned(_) => 2,
            CliError::InvalidInput(_) => 4,
        };
    }

    match error.downcast_ref::<OtaError>() {
        Some(OtaError::NotFound(_)) => 2,
        Some(OtaError::VerifyFailed(_)) => 3,
        Some(OtaError::InvalidArgument(_)) | Some(OtaError::Serialization(_)) => 4,
        Some(OtaError::Busy(_)) => 5,
        Some(
            OtaError::ConnectionFailed(_)
            | OtaError::DownloadFailed(_)
            | OtaError::SizeMismatch { .. },
        ) => 6,
        Some(OtaError::Cancelled) => 130,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&OtaError::Busy("download".into()).into()), 5);
        assert_eq!(exit_code(&OtaError::VerifyFailed("magic".into()).into()), 3);
        assert_eq!(
            exit_code(
                &OtaError::SizeMismatch {
                    expected: 10,
                    received: 5
                }
                .into()
            ),
            6
        );
        assert_eq!(
            exit_code(&CliError::DeviceNotProvisioned("dev".into()).into()),
            2
        );
        assert_eq!(exit_code(&CliError::InvalidInput("slot".into()).into()), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
