//! Image construction through an external build tool.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::{ProviderError, Result};
use crate::exec::run_program;
use crate::traits::ImageBuilder;
use crate::units::MIN_VOLUME_SIZE;

/// Default build tool looked up on `PATH`.
pub const DEFAULT_BUILD_TOOL: &str = "mkimage";

/// [`ImageBuilder`] that shells out to an image build tool.
///
/// The tool is invoked as `<tool> build --output <image> [--base-size <size>] <program> [args...]`,
/// `<tool> package --output <image> <package>` and
/// `<tool> volume --output <raw> --size <bytes> <data-dir>`.
#[derive(Debug, Clone)]
pub struct ExternalImageBuilder {
    tool: String,
}

impl ExternalImageBuilder {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    fn output_path(config: &Config) -> Result<PathBuf> {
        if config.cloud_config.image_name.is_empty() {
            return Err(ProviderError::InvalidConfig(
                "an image name is required to build an image".to_string(),
            ));
        }
        Ok(config.image_path())
    }

    async fn prepare(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::io(parent, e))?;
        }
        Ok(())
    }
}

impl Default for ExternalImageBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_BUILD_TOOL)
    }
}

#[async_trait]
impl ImageBuilder for ExternalImageBuilder {
    #[instrument(skip(self, config), fields(image = %config.cloud_config.image_name))]
    async fn build_image(&self, config: &Config) -> Result<PathBuf> {
        if config.program.is_empty() {
            return Err(ProviderError::InvalidConfig(
                "no program configured for the image".to_string(),
            ));
        }
        let output = Self::output_path(config)?;
        Self::prepare(&output).await?;

        let output_arg = output.display().to_string();
        let mut args = vec!["build", "--output", output_arg.as_str()];
        if !config.base_volume_size.is_empty() {
            args.extend(["--base-size", config.base_volume_size.as_str()]);
        }
        args.push(config.program.as_str());
        args.extend(config.args.iter().map(String::as_str));

        run_program(&self.tool, &args).await?;
        info!(path = %output.display(), "Image built");
        Ok(output)
    }

    #[instrument(skip(self, package, config), fields(package = %package.display()))]
    async fn build_image_from_package(&self, package: &Path, config: &Config) -> Result<PathBuf> {
        let output = Self::output_path(config)?;
        Self::prepare(&output).await?;

        let output_arg = output.display().to_string();
        let package_arg = package.display().to_string();
        run_program(
            &self.tool,
            &["package", "--output", &output_arg, &package_arg],
        )
        .await?;
        info!(path = %output.display(), "Image built from package");
        Ok(output)
    }

    async fn create_volume_image(&self, data: &Path, size: Option<u64>, out: &Path) -> Result<()> {
        Self::prepare(out).await?;

        let size = size.unwrap_or(MIN_VOLUME_SIZE).max(MIN_VOLUME_SIZE).to_string();
        let out_arg = out.display().to_string();
        let data_arg = data.display().to_string();
        run_program(
            &self.tool,
            &["volume", "--output", &out_arg, "--size", &size, &data_arg],
        )
        .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_requires_program() {
        let mut config = Config::with_home("/nonexistent");
        config.cloud_config.image_name = "app.img".to_string();

        let err = ExternalImageBuilder::default()
            .build_image(&config)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_build_requires_image_name() {
        let mut config = Config::with_home("/nonexistent");
        config.program = "/bin/app".to_string();

        let err = ExternalImageBuilder::default()
            .build_image(&config)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }
}
